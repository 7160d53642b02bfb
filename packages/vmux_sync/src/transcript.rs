use std::collections::{HashMap, HashSet};

use crate::models::TranscriptEntry;
use crate::persistence::{PersistOp, PersistenceWriter};

/// Per-session append-only message log. In-memory state is authoritative;
/// every append and clear is mirrored to the persistence writer.
pub struct TranscriptStore {
    logs: HashMap<String, Vec<TranscriptEntry>>,
    hydrated: HashSet<String>,
    writer: PersistenceWriter,
}

impl TranscriptStore {
    pub fn new(writer: PersistenceWriter) -> Self {
        Self {
            logs: HashMap::new(),
            hydrated: HashSet::new(),
            writer,
        }
    }

    pub fn append(&mut self, entry: TranscriptEntry) {
        self.writer.enqueue(PersistOp::AppendEntry(entry.clone()));
        self.logs
            .entry(entry.session_id.clone())
            .or_default()
            .push(entry);
    }

    pub fn clear(&mut self, session_id: &str) {
        self.logs.remove(session_id);
        // keep the hydrated mark so the old history is not loaded back
        self.hydrated.insert(session_id.to_string());
        self.writer.enqueue(PersistOp::ClearTranscript {
            session_id: session_id.to_string(),
        });
    }

    pub fn entries(&self, session_id: &str) -> &[TranscriptEntry] {
        self.logs
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn needs_hydration(&self, session_id: &str) -> bool {
        !self.hydrated.contains(session_id)
    }

    /// Place previously persisted history ahead of anything that arrived in
    /// this run. Only the first call per session has an effect.
    pub fn hydrate(&mut self, session_id: &str, persisted: Vec<TranscriptEntry>) -> usize {
        if !self.hydrated.insert(session_id.to_string()) {
            return 0;
        }
        let count = persisted.len();
        if count == 0 {
            return 0;
        }
        let log = self.logs.entry(session_id.to_string()).or_default();
        let live = std::mem::replace(log, persisted);
        log.extend(live);
        count
    }
}
