//! `vmux watch` and `vmux sessions`: commands that run the sync engine.

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use vmux_sync::config::RelayConfig;
use vmux_sync::models::{AgentState, SessionHealth, SessionView, Speaker};
use vmux_sync::{EngineEvent, VmuxConfig};

use super::start_engine;

pub async fn watch_command(config: &VmuxConfig, session: Option<String>) -> Result<()> {
    let (handle, task) = start_engine(config).await?;
    let mut events = handle.subscribe();

    // starting the watcher is the user gesture that enables cues
    handle.unlock_audio().await?;

    let mut attach_to = session;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Ok(event) => {
                    let listed = match (&event, attach_to.as_deref()) {
                        (EngineEvent::SessionsUpdated { sessions }, Some(id)) => sessions
                            .iter()
                            .any(|v| v.session.session_id == id)
                            .then(|| id.to_string()),
                        _ => None,
                    };
                    if let Some(id) = listed {
                        if handle.connect_session(&id).await? {
                            attach_to = None;
                        }
                    }
                    render(&event);
                }
                Err(RecvError::Lagged(n)) => warn!("Display fell behind, skipped {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown().await?;
    let _ = task.await;
    Ok(())
}

pub async fn sessions_command(config: &VmuxConfig, json: bool) -> Result<()> {
    let relay = RelayConfig::from_file(&config.file_config()?.relay);
    let (handle, task) = start_engine(config).await?;
    let mut events = handle.subscribe();

    let wait = async {
        loop {
            match events.recv().await {
                Ok(EngineEvent::SessionsUpdated { sessions }) => return Some(sessions),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    };
    let sessions = tokio::time::timeout(relay.request_timeout, wait).await;

    handle.shutdown().await?;
    let _ = task.await;

    let sessions = sessions
        .ok()
        .flatten()
        .with_context(|| format!("no session list from {} in time", relay.base_url))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No sessions.");
    }
    for view in &sessions {
        println!("{}", session_line(view));
    }
    Ok(())
}

fn session_line(view: &SessionView) -> String {
    let s = &view.session;
    let marker = if view.is_connected { "*" } else { " " };
    let online = if s.online { "online " } else { "offline" };
    let health = match s.health {
        SessionHealth::Ok => "",
        SessionHealth::Zombie => " [zombie]",
        SessionHealth::Dead => " [dead]",
    };
    let clients = if s.connected_clients.is_empty() {
        String::new()
    } else {
        format!(" ({} attached)", s.connected_clients.len())
    };
    format!(
        "{} {:<24} {} hue={:<3} {}{}{}",
        marker, view.display_name, online, view.hue, s.session_id, health, clients
    )
}

fn render(event: &EngineEvent) {
    match event {
        EngineEvent::ConnectionChanged { state } => eprintln!("[vmux: {:?}]", state),
        EngineEvent::SessionsUpdated { sessions } => {
            eprintln!("── sessions ──");
            for view in sessions {
                eprintln!("{}", session_line(view));
            }
        }
        EngineEvent::ConnectedSessionChanged { session_id } => match session_id {
            Some(id) => eprintln!("[vmux: attached to {}]", id),
            None => eprintln!("[vmux: detached]"),
        },
        EngineEvent::SessionNotFound { session_id } => {
            eprintln!("[vmux: session {} not found]", session_id.as_deref().unwrap_or("?"))
        }
        EngineEvent::Status { status } => {
            let label = match status.state {
                AgentState::Idle => "idle",
                AgentState::Thinking => "thinking",
                AgentState::Speaking => "speaking",
                AgentState::Error => "error",
            };
            match &status.activity {
                Some(activity) => eprintln!("[agent: {} - {}]", label, activity),
                None => eprintln!("[agent: {}]", label),
            }
        }
        EngineEvent::Transcript { entry } => {
            let who = match entry.speaker {
                Speaker::User => "you",
                Speaker::Agent => "agent",
                Speaker::System => "system",
                Speaker::Activity => "…",
                Speaker::Code => entry.filename.as_deref().unwrap_or("code"),
            };
            println!(
                "{} {:>8}: {}",
                entry.timestamp.format("%H:%M:%S"),
                who,
                entry.text
            );
        }
        EngineEvent::TranscriptHydrated { session_id, count } => {
            eprintln!("[vmux: restored {} lines for {}]", count, session_id)
        }
        EngineEvent::TranscriptCleared { session_id } => {
            eprintln!("[vmux: cleared transcript for {}]", session_id)
        }
        EngineEvent::AutoListenDisabled { .. } => eprintln!("[vmux: auto-listen off]"),
        EngineEvent::VoiceToken { token } => match token {
            Some(t) => eprintln!("[vmux: voice room {} ready]", t.room),
            None => eprintln!("[vmux: voice room released]"),
        },
    }
}
