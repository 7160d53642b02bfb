//! Commands that only touch the local cache.

use anyhow::{Context, Result};
use chrono::Utc;

use vmux_sync::config::PersistenceConfig;
use vmux_sync::models::Speaker;
use vmux_sync::{PersistenceStore, VmuxConfig};

pub async fn transcript_command(config: &VmuxConfig, session_id: &str, json: bool) -> Result<()> {
    let store = PersistenceStore::open(config).await?;
    let entries = store.load_transcript(session_id).await?;
    store.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        eprintln!("No cached transcript for {}", session_id);
    }
    for entry in &entries {
        let who = match entry.speaker {
            Speaker::User => "you",
            Speaker::Agent => "agent",
            Speaker::System => "system",
            Speaker::Activity => "activity",
            Speaker::Code => "code",
        };
        println!(
            "{} {:>8}: {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            who,
            entry.text
        );
    }
    Ok(())
}

pub async fn clear_command(config: &VmuxConfig, session_id: &str) -> Result<()> {
    let store = PersistenceStore::open(config).await?;
    let removed = store.clear_transcript(session_id).await?;
    store.close().await;
    eprintln!("Removed {} cached lines for {}", removed, session_id);
    Ok(())
}

pub async fn rename_command(config: &VmuxConfig, session_id: &str, name: Option<String>) -> Result<()> {
    let name = name.filter(|n| !n.trim().is_empty());
    let store = PersistenceStore::open(config).await?;
    store
        .set_display_name(session_id, name.as_deref(), Utc::now().timestamp_millis())
        .await?;
    store.close().await;
    match name {
        Some(n) => eprintln!("{} will show as \"{}\"", session_id, n),
        None => eprintln!("{} will show its relay name", session_id),
    }
    Ok(())
}

pub async fn color_command(config: &VmuxConfig, session_id: &str, hue: Option<u16>) -> Result<()> {
    let store = PersistenceStore::open(config).await?;
    let result = store
        .set_hue_override(session_id, hue, Utc::now().timestamp_millis())
        .await;
    store.close().await;
    result.with_context(|| format!("Failed to set color for {}", session_id))?;
    match hue {
        Some(h) => eprintln!("{} hue set to {}", session_id, h),
        None => eprintln!("{} uses its derived color", session_id),
    }
    Ok(())
}

pub async fn prune_command(config: &VmuxConfig) -> Result<()> {
    let persistence = PersistenceConfig::from_file(&config.file_config()?.persistence);
    let store = PersistenceStore::open(config).await?;
    let cutoff = (Utc::now() - persistence.retention).timestamp_millis();
    let pruned = store.prune_sessions(cutoff).await?;
    store.close().await;
    eprintln!(
        "Pruned {} sessions not seen in {} days",
        pruned,
        persistence.retention.num_days()
    );
    Ok(())
}
