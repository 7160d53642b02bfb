use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::PersistenceConfig;
use crate::db::PersistenceStore;
use crate::models::TranscriptEntry;

/// A write destined for the local cache. Applied in the order enqueued.
#[derive(Debug, Clone)]
pub enum PersistOp {
    AppendEntry(TranscriptEntry),
    ClearTranscript {
        session_id: String,
    },
    TouchSession {
        session_id: String,
        last_seen: i64,
    },
    SetDisplayName {
        session_id: String,
        display_name: Option<String>,
        at: i64,
    },
    SetHue {
        session_id: String,
        hue: Option<u16>,
        at: i64,
    },
}

enum WriterMsg {
    Op(PersistOp),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background writer. Enqueueing never blocks and never fails
/// from the caller's point of view; write errors are logged by the task.
#[derive(Clone)]
pub struct PersistenceWriter {
    tx: mpsc::UnboundedSender<WriterMsg>,
}

impl PersistenceWriter {
    pub fn spawn(store: PersistenceStore, config: &PersistenceConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        info!(
            "Starting persistence writer (flush every {:?}, batch {})",
            config.flush_interval, config.batch_size
        );
        let handle = tokio::spawn(run_writer(
            store,
            rx,
            config.flush_interval,
            config.batch_size,
        ));
        (Self { tx }, handle)
    }

    /// A writer whose ops go nowhere, used when persistence is disabled.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn enqueue(&self, op: PersistOp) {
        if self.tx.send(WriterMsg::Op(op)).is_err() {
            debug!("Persistence writer is gone, dropping op");
        }
    }

    /// Wait until everything enqueued so far has been written (or failed).
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_writer(
    store: PersistenceStore,
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
    flush_interval: Duration,
    batch_size: usize,
) {
    let mut buffer: Vec<PersistOp> = Vec::new();
    let mut interval = tokio::time::interval(flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(WriterMsg::Op(op)) => {
                    buffer.push(op);
                    if buffer.len() >= batch_size {
                        flush_buffer(&store, &mut buffer).await;
                    }
                }
                Some(WriterMsg::Flush(done)) => {
                    flush_buffer(&store, &mut buffer).await;
                    let _ = done.send(());
                }
                None => {
                    flush_buffer(&store, &mut buffer).await;
                    break;
                }
            },
            _ = interval.tick() => flush_buffer(&store, &mut buffer).await,
        }
    }

    debug!("Persistence writer stopped");
}

async fn flush_buffer(store: &PersistenceStore, buffer: &mut Vec<PersistOp>) {
    if buffer.is_empty() {
        return;
    }
    let ops: Vec<PersistOp> = buffer.drain(..).collect();
    let count = ops.len();

    // Runs of appends go out as one transaction; everything else in order.
    let mut entries = Vec::new();
    for op in ops {
        match op {
            PersistOp::AppendEntry(entry) => entries.push(entry),
            other => {
                write_entries(store, &mut entries).await;
                apply(store, other).await;
            }
        }
    }
    write_entries(store, &mut entries).await;

    debug!("Flushed {} persistence ops", count);
}

async fn write_entries(store: &PersistenceStore, entries: &mut Vec<TranscriptEntry>) {
    if entries.is_empty() {
        return;
    }
    if let Err(e) = store.append_entries(entries).await {
        error!("Failed to persist {} transcript entries: {:#}", entries.len(), e);
    }
    entries.clear();
}

async fn apply(store: &PersistenceStore, op: PersistOp) {
    let result = match &op {
        PersistOp::AppendEntry(entry) => store.append_entries(std::slice::from_ref(entry)).await,
        PersistOp::ClearTranscript { session_id } => {
            store.clear_transcript(session_id).await.map(|_| ())
        }
        PersistOp::TouchSession {
            session_id,
            last_seen,
        } => store.touch_session(session_id, *last_seen).await,
        PersistOp::SetDisplayName {
            session_id,
            display_name,
            at,
        } => {
            store
                .set_display_name(session_id, display_name.as_deref(), *at)
                .await
        }
        PersistOp::SetHue { session_id, hue, at } => {
            store.set_hue_override(session_id, *hue, *at).await
        }
    };
    if let Err(e) = result {
        error!("Failed to persist {:?}: {:#}", op, e);
    }
}
