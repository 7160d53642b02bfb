//! The sync engine actor.
//!
//! One task owns every store and is the only place they are mutated. Socket
//! events, token fetch results, history loads, UI commands, and the reconnect
//! timer are multiplexed with `tokio::select!`; after each one the engine
//! diffs a [`effects::Snapshot`] and runs the planned follow-ups.

mod dispatch;
pub mod effects;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::RelayApi;
use crate::audio::{CueSink, TrackAnalyzers};
use crate::config::{NotificationConfig, PersistenceConfig, RelayConfig};
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::db::PersistenceStore;
use crate::error::StoreError;
use crate::models::{
    AgentStatus, ConnectionState, PersistedSession, SessionView, TranscriptEntry, VoiceToken,
};
use crate::notify::NotificationEngine;
use crate::persistence::{PersistOp, PersistenceWriter};
use crate::registry::SessionRegistry;
use crate::status::AgentStatusTracker;
use crate::token::{TokenAction, TokenCoordinator, TokenOutcome};
use crate::transcript::TranscriptStore;
use crate::voice::VoiceRoom;

use effects::{Effect, Snapshot};

const EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 64;

/// Commands accepted by the engine actor.
#[derive(Debug)]
pub enum EngineCommand {
    ConnectSession {
        session_id: String,
        respond_to: oneshot::Sender<bool>,
    },
    DisconnectSession {
        respond_to: oneshot::Sender<bool>,
    },
    Interrupt {
        respond_to: oneshot::Sender<bool>,
    },
    RenameSession {
        session_id: String,
        name: Option<String>,
        respond_to: oneshot::Sender<()>,
    },
    SetSessionHue {
        session_id: String,
        hue: Option<u16>,
        respond_to: oneshot::Sender<Result<(), StoreError>>,
    },
    ClearTranscript {
        session_id: String,
        respond_to: oneshot::Sender<()>,
    },
    GetTranscript {
        session_id: String,
        respond_to: oneshot::Sender<Vec<TranscriptEntry>>,
    },
    /// Must come from a user-initiated action.
    UnlockAudio {
        respond_to: oneshot::Sender<bool>,
    },
    VoiceTrackAttached {
        participant: String,
        track_id: String,
    },
    VoiceTrackDetached {
        participant: String,
    },
    GetState {
        respond_to: oneshot::Sender<EngineState>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Broadcast to every subscriber as state changes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ConnectionChanged { state: ConnectionState },
    SessionsUpdated { sessions: Vec<SessionView> },
    ConnectedSessionChanged { session_id: Option<String> },
    SessionNotFound { session_id: Option<String> },
    Status { status: AgentStatus },
    Transcript { entry: TranscriptEntry },
    TranscriptHydrated { session_id: String, count: usize },
    TranscriptCleared { session_id: String },
    AutoListenDisabled { seq: u64 },
    VoiceToken { token: Option<VoiceToken> },
}

/// Point-in-time view for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct EngineState {
    pub connection: ConnectionState,
    pub connected_session: Option<String>,
    pub sessions: Vec<SessionView>,
    pub status: AgentStatus,
    pub transcript: Vec<TranscriptEntry>,
    pub voice_token: Option<VoiceToken>,
    pub auto_listen_seq: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub relay: RelayConfig,
    pub persistence: PersistenceConfig,
    pub notifications: NotificationConfig,
}

/// Results of background work, delivered back to the actor.
enum Internal {
    TokenFetched {
        room: String,
        token: Option<VoiceToken>,
    },
    HistoryLoaded {
        session_id: String,
        entries: Vec<TranscriptEntry>,
    },
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
    cancel: CancellationToken,
}

impl EngineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| anyhow::anyhow!("Sync engine is gone"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Sync engine didn't respond"))
    }

    /// Ask the relay to attach to a session. Returns false if the control
    /// channel is down and the request was dropped.
    pub async fn connect_session(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.request(|respond_to| EngineCommand::ConnectSession {
            session_id,
            respond_to,
        })
        .await
    }

    pub async fn disconnect_session(&self) -> Result<bool> {
        self.request(|respond_to| EngineCommand::DisconnectSession { respond_to })
            .await
    }

    pub async fn interrupt(&self) -> Result<bool> {
        self.request(|respond_to| EngineCommand::Interrupt { respond_to })
            .await
    }

    pub async fn rename_session(&self, session_id: &str, name: Option<String>) -> Result<()> {
        let session_id = session_id.to_string();
        self.request(|respond_to| EngineCommand::RenameSession {
            session_id,
            name,
            respond_to,
        })
        .await
    }

    pub async fn set_session_hue(&self, session_id: &str, hue: Option<u16>) -> Result<()> {
        let session_id = session_id.to_string();
        self.request(|respond_to| EngineCommand::SetSessionHue {
            session_id,
            hue,
            respond_to,
        })
        .await??;
        Ok(())
    }

    pub async fn clear_transcript(&self, session_id: &str) -> Result<()> {
        let session_id = session_id.to_string();
        self.request(|respond_to| EngineCommand::ClearTranscript {
            session_id,
            respond_to,
        })
        .await
    }

    pub async fn transcript(&self, session_id: &str) -> Result<Vec<TranscriptEntry>> {
        let session_id = session_id.to_string();
        self.request(|respond_to| EngineCommand::GetTranscript {
            session_id,
            respond_to,
        })
        .await
    }

    pub async fn unlock_audio(&self) -> Result<bool> {
        self.request(|respond_to| EngineCommand::UnlockAudio { respond_to })
            .await
    }

    pub async fn voice_track_attached(&self, participant: &str, track_id: &str) -> Result<()> {
        self.sender
            .send(EngineCommand::VoiceTrackAttached {
                participant: participant.to_string(),
                track_id: track_id.to_string(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("Sync engine is gone"))
    }

    pub async fn voice_track_detached(&self, participant: &str) -> Result<()> {
        self.sender
            .send(EngineCommand::VoiceTrackDetached {
                participant: participant.to_string(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("Sync engine is gone"))
    }

    pub async fn state(&self) -> Result<EngineState> {
        self.request(|respond_to| EngineCommand::GetState { respond_to })
            .await
    }

    /// Stop the engine, flushing pending persistence writes.
    pub async fn shutdown(&self) -> Result<()> {
        let result = self
            .request(|respond_to| EngineCommand::Shutdown { respond_to })
            .await;
        // fall back to cancellation if the actor is wedged or gone
        self.cancel.cancel();
        result
    }
}

pub struct SyncEngine {
    relay: RelayConfig,
    api: RelayApi,
    connection: ConnectionManager,
    registry: SessionRegistry,
    status: AgentStatusTracker,
    transcripts: TranscriptStore,
    tokens: TokenCoordinator,
    notifications: NotificationEngine,
    analyzers: TrackAnalyzers,
    voice: Box<dyn VoiceRoom>,
    store: Option<PersistenceStore>,
    /// Rows above this were written by this run and are already in memory.
    history_watermark: i64,
    writer: PersistenceWriter,
    overrides: HashMap<String, PersistedSession>,
    events: broadcast::Sender<EngineEvent>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl SyncEngine {
    /// Open persistence (when enabled), spawn the actor, and start
    /// connecting to the relay.
    pub async fn start(
        config: EngineConfig,
        api: RelayApi,
        store: Option<PersistenceStore>,
        voice: Box<dyn VoiceRoom>,
        sink: Arc<dyn CueSink>,
    ) -> Result<(EngineHandle, JoinHandle<()>)> {
        let store = store.filter(|_| config.persistence.enabled);

        let mut overrides = HashMap::new();
        let mut history_watermark = 0;
        let (writer, _writer_task) = match &store {
            Some(store) => {
                match store.transcript_watermark().await {
                    Ok(mark) => history_watermark = mark,
                    Err(e) => warn!("Failed to read local history position: {:#}", e),
                }
                let cutoff = (Utc::now() - config.persistence.retention).timestamp_millis();
                match store.prune_sessions(cutoff).await {
                    Ok(0) => {}
                    Ok(n) => info!("Pruned {} sessions past the retention window", n),
                    Err(e) => warn!("Failed to prune local cache: {:#}", e),
                }
                match store.load_sessions().await {
                    Ok(sessions) => {
                        overrides = sessions
                            .into_iter()
                            .map(|s| (s.session_id.clone(), s))
                            .collect();
                    }
                    Err(e) => warn!("Failed to load session overrides: {:#}", e),
                }
                let (writer, task) = PersistenceWriter::spawn(store.clone(), &config.persistence);
                (writer, Some(task))
            }
            None => (PersistenceWriter::disabled(), None),
        };

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();

        let engine = SyncEngine {
            connection: ConnectionManager::new(
                config.relay.control_url.clone(),
                config.relay.reconnect_delay,
                conn_tx,
            ),
            relay: config.relay,
            api,
            registry: SessionRegistry::new(),
            status: AgentStatusTracker::new(),
            transcripts: TranscriptStore::new(writer.clone()),
            tokens: TokenCoordinator::new(),
            notifications: NotificationEngine::new(&config.notifications, sink),
            analyzers: TrackAnalyzers::new(),
            voice,
            store,
            history_watermark,
            writer,
            overrides,
            events: events.clone(),
            internal: internal_tx,
        };

        let task = tokio::spawn(engine.run(cmd_rx, conn_rx, internal_rx, cancel.clone()));

        Ok((
            EngineHandle {
                sender: cmd_tx,
                events,
                cancel,
            },
            task,
        ))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut conn_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        cancel: CancellationToken,
    ) {
        let mut shutdown_reply = None;
        let bearer = self.api.bearer().await;
        self.connection.connect(bearer);
        self.emit(EngineEvent::ConnectionChanged {
            state: self.connection.state(),
        });

        loop {
            let before = self.snapshot();
            let reconnect_at = self.connection.reconnect_deadline();

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = conn_events.recv() => self.handle_connection_event(event),
                Some(msg) = internal.recv() => self.handle_internal(msg),
                cmd = commands.recv() => match cmd {
                    Some(EngineCommand::Shutdown { respond_to }) => {
                        shutdown_reply = Some(respond_to);
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = sleep_until_opt(reconnect_at) => {
                    if self.connection.take_reconnect() {
                        let bearer = self.api.bearer().await;
                        self.connection.connect(bearer);
                    }
                }
            }

            self.settle(&before);
        }

        self.teardown().await;
        if let Some(tx) = shutdown_reply {
            let _ = tx.send(());
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            connection: self.connection.state(),
            connected_session: self.registry.connected_id().map(String::from),
            sessions_revision: self.registry.revision(),
            sessions_populated: self.registry.is_populated(),
            online: self.registry.online_ids().map(String::from).collect(),
            held_room: self.tokens.held_room().map(String::from),
            agent_state: self.status.state(),
        }
    }

    fn settle(&mut self, before: &Snapshot) {
        let after = self.snapshot();
        for effect in effects::plan(before, &after) {
            self.apply(effect);
        }
    }

    fn emit(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn views(&self) -> Vec<SessionView> {
        self.registry.views(&self.overrides)
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { generation } => {
                self.connection.on_opened(generation);
            }
            ConnectionEvent::Frame { generation, text } => {
                if self.connection.accepts(generation) {
                    self.dispatch_frame(&text);
                } else {
                    debug!("Dropping frame from superseded connection #{}", generation);
                }
            }
            ConnectionEvent::Closed { generation, reason } => {
                if self.connection.on_closed(generation, &reason) {
                    self.registry.clear_connected();
                }
            }
        }
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::TokenFetched { room, token } => {
                let target = self.registry.target_room(&self.relay.default_room);
                match self.tokens.complete(&room, token, target.as_deref()) {
                    TokenOutcome::Committed(token) => {
                        self.voice.connect(&token);
                        self.emit(EngineEvent::VoiceToken { token: Some(token) });
                    }
                    TokenOutcome::Stale | TokenOutcome::Redundant => {}
                    TokenOutcome::Failed => {
                        debug!("No voice token for {}, voice controls stay hidden", room);
                    }
                }
            }
            Internal::HistoryLoaded {
                session_id,
                entries,
            } => {
                let count = self.transcripts.hydrate(&session_id, entries);
                if count > 0 {
                    debug!("Restored {} entries for {}", count, session_id);
                    self.emit(EngineEvent::TranscriptHydrated { session_id, count });
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::ConnectSession {
                session_id,
                respond_to,
            } => {
                let msg = self.registry.connect_session(&session_id);
                let _ = respond_to.send(self.connection.send(&msg));
            }
            EngineCommand::DisconnectSession { respond_to } => {
                let msg = self.registry.disconnect_session();
                let _ = respond_to.send(self.connection.send(&msg));
            }
            EngineCommand::Interrupt { respond_to } => {
                let msg = crate::protocol::ClientMessage::Interrupt;
                let _ = respond_to.send(self.connection.send(&msg));
            }
            EngineCommand::RenameSession {
                session_id,
                name,
                respond_to,
            } => {
                let name = name.filter(|n| !n.trim().is_empty());
                let now = Utc::now().timestamp_millis();
                self.local_override(&session_id, now).display_name = name.clone();
                self.writer.enqueue(PersistOp::SetDisplayName {
                    session_id,
                    display_name: name,
                    at: now,
                });
                self.emit(EngineEvent::SessionsUpdated {
                    sessions: self.views(),
                });
                let _ = respond_to.send(());
            }
            EngineCommand::SetSessionHue {
                session_id,
                hue,
                respond_to,
            } => {
                if let Some(h) = hue.filter(|h| *h >= 360) {
                    let _ = respond_to.send(Err(StoreError::InvalidHue(h)));
                    return;
                }
                let now = Utc::now().timestamp_millis();
                self.local_override(&session_id, now).hue_override = hue;
                self.writer.enqueue(PersistOp::SetHue {
                    session_id,
                    hue,
                    at: now,
                });
                self.emit(EngineEvent::SessionsUpdated {
                    sessions: self.views(),
                });
                let _ = respond_to.send(Ok(()));
            }
            EngineCommand::ClearTranscript {
                session_id,
                respond_to,
            } => {
                self.transcripts.clear(&session_id);
                self.emit(EngineEvent::TranscriptCleared { session_id });
                let _ = respond_to.send(());
            }
            EngineCommand::GetTranscript {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.transcripts.entries(&session_id).to_vec());
            }
            EngineCommand::UnlockAudio { respond_to } => {
                let _ = respond_to.send(self.notifications.unlock());
            }
            EngineCommand::VoiceTrackAttached {
                participant,
                track_id,
            } => self.analyzers.attach(&participant, &track_id),
            EngineCommand::VoiceTrackDetached { participant } => {
                self.analyzers.detach(&participant);
            }
            EngineCommand::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }
            // handled in the run loop
            EngineCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    fn local_override(&mut self, session_id: &str, now: i64) -> &mut PersistedSession {
        self.overrides
            .entry(session_id.to_string())
            .or_insert_with(|| PersistedSession::new(session_id, now))
    }

    fn state(&self) -> EngineState {
        let connected_session = self.registry.connected_id().map(String::from);
        EngineState {
            connection: self.connection.state(),
            transcript: connected_session
                .as_deref()
                .map(|id| self.transcripts.entries(id).to_vec())
                .unwrap_or_default(),
            connected_session,
            sessions: self.views(),
            status: self.status.current().clone(),
            voice_token: self.tokens.held().cloned(),
            auto_listen_seq: self.status.last_auto_listen_seq(),
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::ConnectionChanged(state) => {
                self.emit(EngineEvent::ConnectionChanged { state });
            }
            Effect::ConnectedSessionChanged(session_id) => {
                self.status.reset();
                self.emit(EngineEvent::Status {
                    status: self.status.current().clone(),
                });
                self.emit(EngineEvent::ConnectedSessionChanged { session_id });
                self.emit(EngineEvent::SessionsUpdated {
                    sessions: self.views(),
                });
            }
            Effect::Hydrate(session_id) => self.load_history(session_id),
            Effect::ReconcileToken => self.reconcile_token(),
            Effect::OnlineChanged(diff) => {
                info!("Sessions joined {:?}, left {:?}", diff.joined, diff.left);
                self.notifications.on_diff(&diff);
            }
            Effect::StatusChanged { prev, next } => {
                self.notifications.on_status(prev, next);
            }
        }
    }

    fn load_history(&mut self, session_id: String) {
        if !self.transcripts.needs_hydration(&session_id) {
            return;
        }
        let Some(store) = self.store.clone() else {
            self.transcripts.hydrate(&session_id, Vec::new());
            return;
        };
        let internal = self.internal.clone();
        let last_id = self.history_watermark;
        tokio::spawn(async move {
            let entries = match store.load_transcript_through(&session_id, last_id).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("Failed to load history for {}: {:#}", session_id, e);
                    Vec::new()
                }
            };
            let _ = internal.send(Internal::HistoryLoaded {
                session_id,
                entries,
            });
        });
    }

    fn reconcile_token(&mut self) {
        let target = self.registry.target_room(&self.relay.default_room);
        for action in self.tokens.reconcile(target.as_deref()) {
            match action {
                TokenAction::Discard(token) => {
                    debug!("Discarding voice token for {}", token.room);
                    self.voice.disconnect();
                    self.analyzers.clear();
                    self.emit(EngineEvent::VoiceToken { token: None });
                }
                TokenAction::Fetch(room) => {
                    let api = self.api.clone();
                    let internal = self.internal.clone();
                    tokio::spawn(async move {
                        let token = match api.fetch_token(&room).await {
                            Ok(token) => Some(token),
                            Err(e) => {
                                warn!("Token fetch for {} failed: {}", room, e);
                                None
                            }
                        };
                        let _ = internal.send(Internal::TokenFetched { room, token });
                    });
                }
            }
        }
    }

    async fn teardown(&mut self) {
        info!("Sync engine shutting down");
        self.connection.shutdown();
        if self.tokens.reset().is_some() {
            self.voice.disconnect();
        }
        self.analyzers.clear();
        self.writer.flush().await;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioContext, Cue, Tone};
    use crate::auth::CredentialStore;
    use crate::config::{PersistenceFileConfig, RelayFileConfig};
    use crate::db::test_helpers::test_store;
    use crate::models::{AgentState, Session, Speaker};
    use crate::protocol::ServerMessage;
    use crate::voice::LoggingVoiceRoom;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<Vec<Cue>>,
    }

    impl CueSink for RecordingSink {
        fn play(&self, cue: Cue, _tones: &[Tone]) {
            self.played.lock().unwrap().push(cue);
        }
    }

    struct Harness {
        engine: SyncEngine,
        cues: Arc<RecordingSink>,
        events: broadcast::Receiver<EngineEvent>,
        internal: mpsc::UnboundedReceiver<Internal>,
        _conn: mpsc::UnboundedReceiver<ConnectionEvent>,
        _tmp: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::build(None, PersistenceWriter::disabled(), 0)
        }

        /// Engine backed by a real store and writer, as `start` wires them.
        async fn with_store(store: PersistenceStore) -> Self {
            let mark = store.transcript_watermark().await.unwrap();
            let config = PersistenceConfig::from_file(&PersistenceFileConfig::default());
            let (writer, _task) = PersistenceWriter::spawn(store.clone(), &config);
            Self::build(Some(store), writer, mark)
        }

        fn build(
            store: Option<PersistenceStore>,
            writer: PersistenceWriter,
            history_watermark: i64,
        ) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            // nothing listens here, so token fetches fail fast
            let relay = RelayConfig::from_file(&RelayFileConfig {
                url: "http://127.0.0.1:1".into(),
                ..Default::default()
            });
            let api = RelayApi::new(
                &relay,
                CredentialStore::new(tmp.path().join("credentials.json")),
            )
            .unwrap();
            let (conn_tx, conn_rx) = mpsc::unbounded_channel();
            let (internal_tx, internal_rx) = mpsc::unbounded_channel();
            let (events, events_rx) = broadcast::channel(EVENT_CAPACITY);
            let context: &'static AudioContext = Box::leak(Box::new(AudioContext::new()));
            context.ensure_unlocked();
            let cues = Arc::new(RecordingSink::default());
            let notifications = NotificationConfig {
                enabled: true,
                bell: false,
            };

            let engine = SyncEngine {
                connection: ConnectionManager::new(
                    relay.control_url.clone(),
                    relay.reconnect_delay,
                    conn_tx,
                ),
                relay,
                api,
                registry: SessionRegistry::new(),
                status: AgentStatusTracker::new(),
                transcripts: TranscriptStore::new(writer.clone()),
                tokens: TokenCoordinator::new(),
                notifications: NotificationEngine::with_context(
                    &notifications,
                    cues.clone(),
                    context,
                ),
                analyzers: TrackAnalyzers::new(),
                voice: Box::new(LoggingVoiceRoom::new()),
                store,
                history_watermark,
                writer,
                overrides: HashMap::new(),
                events,
                internal: internal_tx,
            };

            Self {
                engine,
                cues,
                events: events_rx,
                internal: internal_rx,
                _conn: conn_rx,
                _tmp: tmp,
            }
        }

        fn frame(&mut self, msg: ServerMessage) {
            let before = self.engine.snapshot();
            self.engine.handle_server_message(msg);
            self.engine.settle(&before);
        }

        fn deliver(&mut self, msg: Internal) {
            let before = self.engine.snapshot();
            self.engine.handle_internal(msg);
            self.engine.settle(&before);
        }

        fn command(&mut self, cmd: EngineCommand) {
            let before = self.engine.snapshot();
            self.engine.handle_command(cmd);
            self.engine.settle(&before);
        }

        fn drain_events(&mut self) -> Vec<EngineEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    fn sessions() -> ServerMessage {
        ServerMessage::Sessions {
            sessions: vec![
                Session::new("a", "alpha").with_room("r1"),
                Session::new("b", "beta").with_room("r2"),
                Session::new("c", "gamma"),
            ],
        }
    }

    fn connected(id: &str) -> ServerMessage {
        ServerMessage::SessionConnected {
            session_id: id.into(),
        }
    }

    fn status_for(session_id: &str, state: AgentState, activity: Option<&str>) -> ServerMessage {
        ServerMessage::AgentStatus {
            state,
            activity: activity.map(String::from),
            timestamp: None,
            session_id: Some(session_id.into()),
        }
    }

    fn line_for(session_id: &str, text: &str) -> ServerMessage {
        ServerMessage::Transcript {
            speaker: Speaker::Agent,
            text: text.into(),
            session_id: Some(session_id.into()),
            timestamp: None,
            filename: None,
            language: None,
        }
    }

    fn token(room: &str) -> VoiceToken {
        VoiceToken {
            token: format!("jwt-{}", room),
            url: "wss://voice".into(),
            room: room.into(),
        }
    }

    #[tokio::test]
    async fn connected_session_follows_relay_confirmations() {
        let mut h = Harness::new();
        h.frame(sessions());
        assert!(h.engine.registry.connected_id().is_none());

        h.frame(connected("a"));
        assert_eq!(h.engine.registry.connected_id(), Some("a"));
        assert_eq!(h.engine.tokens.pending_room(), Some("r1"));

        // replacement with a reordered list keeps the confirmed session
        h.frame(ServerMessage::Sessions {
            sessions: vec![Session::new("b", "beta"), Session::new("a", "alpha").with_room("r1")],
        });
        assert_eq!(h.engine.registry.connected_id(), Some("a"));
        assert_eq!(h.engine.tokens.pending_room(), Some("r1"));

        h.frame(ServerMessage::SessionNotFound { session_id: None });
        assert!(h.engine.registry.connected_id().is_none());
        let events = h.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::ConnectedSessionChanged { session_id: None }
        )));
    }

    #[tokio::test]
    async fn failed_fetch_resolves_to_no_token() {
        let mut h = Harness::new();
        h.frame(sessions());
        h.frame(connected("c"));
        assert_eq!(h.engine.tokens.pending_room(), Some("multiplexer"));

        let msg = h.internal.recv().await.unwrap();
        h.deliver(msg);
        assert!(h.engine.tokens.held().is_none());
        assert!(h.engine.tokens.pending_room().is_none());
    }

    #[tokio::test]
    async fn stale_token_never_replaces_newer_room() {
        let mut h = Harness::new();
        h.frame(sessions());
        h.frame(connected("a"));
        h.frame(connected("b"));
        assert_eq!(h.engine.tokens.pending_room(), Some("r2"));

        h.deliver(Internal::TokenFetched {
            room: "r1".into(),
            token: Some(token("r1")),
        });
        assert!(h.engine.tokens.held_room().is_none());

        h.deliver(Internal::TokenFetched {
            room: "r2".into(),
            token: Some(token("r2")),
        });
        assert_eq!(h.engine.tokens.held_room(), Some("r2"));
        assert!(h.drain_events().iter().any(|e| matches!(
            e,
            EngineEvent::VoiceToken { token: Some(t) } if t.room == "r2"
        )));
    }

    #[tokio::test]
    async fn disconnect_discards_token_and_tracks() {
        let mut h = Harness::new();
        h.frame(sessions());
        h.frame(connected("a"));
        h.deliver(Internal::TokenFetched {
            room: "r1".into(),
            token: Some(token("r1")),
        });
        h.command(EngineCommand::VoiceTrackAttached {
            participant: "agent".into(),
            track_id: "t1".into(),
        });
        assert_eq!(h.engine.analyzers.len(), 1);

        let (tx, _rx) = oneshot::channel();
        h.command(EngineCommand::DisconnectSession { respond_to: tx });
        assert!(h.engine.registry.connected_id().is_none());
        assert!(h.engine.tokens.held().is_none());
        assert!(h.engine.analyzers.is_empty());
    }

    #[tokio::test]
    async fn channel_close_clears_connected_session() {
        let mut h = Harness::new();
        h.engine.connection.connect(None);
        h.frame(sessions());
        h.frame(connected("a"));

        let before = h.engine.snapshot();
        h.engine.handle_connection_event(ConnectionEvent::Closed {
            generation: 1,
            reason: "test".into(),
        });
        h.engine.settle(&before);

        assert_eq!(h.engine.connection.state(), ConnectionState::Disconnected);
        assert!(h.engine.connection.reconnect_deadline().is_some());
        assert!(h.engine.registry.connected_id().is_none());
    }

    #[tokio::test]
    async fn transcript_without_session_goes_to_connected() {
        let mut h = Harness::new();
        let line = |session_id: Option<&str>| ServerMessage::Transcript {
            speaker: Speaker::Agent,
            text: "hello".into(),
            session_id: session_id.map(String::from),
            timestamp: Some(1_700_000_000.0),
            filename: None,
            language: None,
        };

        // nobody connected: dropped
        h.frame(line(None));
        assert!(h.engine.transcripts.entries("a").is_empty());

        h.frame(sessions());
        h.frame(connected("a"));
        h.frame(line(None));
        h.frame(line(Some("b")));
        assert_eq!(h.engine.transcripts.entries("a").len(), 1);
        assert_eq!(h.engine.transcripts.entries("b").len(), 1);
        assert_eq!(
            h.engine.transcripts.entries("a")[0].timestamp.timestamp(),
            1_700_000_000
        );
    }

    #[tokio::test]
    async fn status_for_other_session_is_ignored() {
        let mut h = Harness::new();
        h.frame(sessions());
        h.frame(connected("a"));
        h.frame(status_for("b", AgentState::Speaking, None));
        assert_eq!(h.engine.status.state(), AgentState::Idle);
        h.frame(status_for("a", AgentState::Thinking, None));
        assert_eq!(h.engine.status.state(), AgentState::Thinking);
    }

    #[tokio::test]
    async fn auto_listen_signal_fires_once_per_seq() {
        let mut h = Harness::new();
        for seq in [2, 3, 3, 3] {
            h.frame(ServerMessage::DisableAutoListen { seq });
        }
        let fired: Vec<u64> = h
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::AutoListenDisabled { seq } => Some(seq),
                _ => None,
            })
            .collect();
        assert_eq!(fired, vec![2, 3]);
    }

    #[tokio::test]
    async fn overrides_are_merged_not_written_back() {
        let mut h = Harness::new();
        h.frame(sessions());

        let (tx, _rx) = oneshot::channel();
        h.command(EngineCommand::RenameSession {
            session_id: "a".into(),
            name: Some("Mine".into()),
            respond_to: tx,
        });
        let (tx, rx) = oneshot::channel();
        h.command(EngineCommand::SetSessionHue {
            session_id: "a".into(),
            hue: Some(400),
            respond_to: tx,
        });
        assert!(matches!(rx.await.unwrap(), Err(StoreError::InvalidHue(400))));

        let state = h.engine.state();
        let view = state
            .sessions
            .iter()
            .find(|v| v.session.session_id == "a")
            .unwrap();
        assert_eq!(view.display_name, "Mine");
        assert!(h.engine.registry.get("a").unwrap().display_name.is_none());
    }

    #[tokio::test]
    async fn send_while_disconnected_reports_dropped() {
        let mut h = Harness::new();
        let (tx, rx) = oneshot::channel();
        h.command(EngineCommand::ConnectSession {
            session_id: "a".into(),
            respond_to: tx,
        });
        assert!(!rx.await.unwrap());
    }

    #[tokio::test]
    async fn history_load_does_not_repeat_this_runs_entries() {
        let store = test_store().await;
        store
            .append_entries(&[TranscriptEntry::new("b", Speaker::Agent, "earlier for b")])
            .await
            .unwrap();
        let mut h = Harness::with_store(store).await;

        h.frame(sessions());
        h.frame(connected("a"));
        h.frame(line_for("b", "for b"));
        // the live line is on disk before b's history is read
        h.engine.writer.flush().await;
        h.frame(connected("b"));

        loop {
            let msg = h.internal.recv().await.unwrap();
            let done = matches!(&msg, Internal::HistoryLoaded { session_id, .. } if session_id == "b");
            h.deliver(msg);
            if done {
                break;
            }
        }

        let texts: Vec<&str> = h
            .engine
            .transcripts
            .entries("b")
            .iter()
            .map(|e| e.text.as_str())
            .collect();
        assert_eq!(texts, vec!["earlier for b", "for b"]);
    }

    #[tokio::test]
    async fn switching_sessions_resets_status_without_a_cue() {
        let mut h = Harness::new();
        h.frame(sessions());
        h.frame(connected("a"));
        h.frame(status_for("a", AgentState::Speaking, Some("talking in a")));

        h.frame(connected("b"));
        let state = h.engine.state();
        assert_eq!(state.connected_session.as_deref(), Some("b"));
        assert_eq!(state.status.state, AgentState::Idle);
        assert!(state.status.activity.is_none());

        // b's first status is not a speaking -> idle transition
        h.frame(status_for("b", AgentState::Idle, None));
        h.frame(status_for("b", AgentState::Thinking, None));
        assert_eq!(*h.cues.played.lock().unwrap(), vec![Cue::Descending]);

        h.frame(ServerMessage::SessionNotFound { session_id: None });
        assert_eq!(h.engine.state().status.state, AgentState::Idle);
    }

    #[tokio::test]
    async fn online_changes_play_join_and_leave_cues() {
        let mut h = Harness::new();
        h.frame(sessions());
        assert!(h.cues.played.lock().unwrap().is_empty());

        h.frame(ServerMessage::Sessions {
            sessions: vec![Session::new("a", "alpha"), Session::new("d", "delta")],
        });
        assert_eq!(
            *h.cues.played.lock().unwrap(),
            vec![Cue::SessionJoined, Cue::SessionLeft]
        );
    }
}
