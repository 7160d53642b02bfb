//! Audio output boundary: the process-wide output context, the cue catalog,
//! and per-track analysis contexts.

use std::collections::HashMap;
use std::io::Write;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info};

// =============================================================================
// Output context
// =============================================================================

static CONTEXT: OnceLock<AudioContext> = OnceLock::new();

/// The single audio output context. Created lazily on first use and never
/// recreated; playback is refused until a user action unlocks it.
#[derive(Debug)]
pub struct AudioContext {
    unlocked: AtomicBool,
    created_at: Instant,
}

impl AudioContext {
    pub(crate) fn new() -> Self {
        Self {
            unlocked: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    pub fn global() -> &'static AudioContext {
        CONTEXT.get_or_init(|| {
            debug!("Creating audio output context");
            AudioContext::new()
        })
    }

    /// Idempotent. Returns true only for the call that performed the unlock.
    pub fn ensure_unlocked(&self) -> bool {
        let first = self
            .unlocked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            info!(
                "Audio output unlocked ({:?} after creation)",
                self.created_at.elapsed()
            );
        }
        first
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::Acquire)
    }
}

// =============================================================================
// Cues
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    pub frequency_hz: f32,
    pub duration: Duration,
    /// Start time relative to the first tone of the cue.
    pub offset: Duration,
}

const fn tone(frequency_hz: f32, offset_ms: u64) -> Tone {
    Tone {
        frequency_hz,
        duration: Duration::from_millis(120),
        offset: Duration::from_millis(offset_ms),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cue {
    /// Agent finished speaking.
    Ascending,
    /// Agent started thinking.
    Descending,
    SessionJoined,
    SessionLeft,
}

impl Cue {
    pub fn tones(self) -> [Tone; 2] {
        match self {
            Cue::Ascending => [tone(523.25, 0), tone(659.25, 130)],
            Cue::Descending => [tone(659.25, 0), tone(523.25, 130)],
            Cue::SessionJoined => [tone(880.0, 0), tone(1174.66, 100)],
            Cue::SessionLeft => [tone(440.0, 0), tone(329.63, 100)],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Cue::Ascending => "ascending",
            Cue::Descending => "descending",
            Cue::SessionJoined => "session joined",
            Cue::SessionLeft => "session left",
        }
    }
}

/// Renders cues to whatever output device the front end has.
pub trait CueSink: Send + Sync {
    fn play(&self, cue: Cue, tones: &[Tone]);
}

/// Rings the terminal bell once per tone.
pub struct BellSink;

impl CueSink for BellSink {
    fn play(&self, cue: Cue, tones: &[Tone]) {
        debug!("Cue: {}", cue.label());
        let mut stdout = std::io::stdout();
        let bells = "\x07".repeat(tones.len());
        let _ = stdout.write_all(bells.as_bytes());
        let _ = stdout.flush();
    }
}

pub struct SilentSink;

impl CueSink for SilentSink {
    fn play(&self, cue: Cue, _tones: &[Tone]) {
        debug!("Cue (silent): {}", cue.label());
    }
}

// =============================================================================
// Track analysis
// =============================================================================

/// Level analysis attached to one remote audio track.
#[derive(Debug)]
pub struct TrackAnalyzer {
    pub participant: String,
    pub track_id: String,
    attached_at: Instant,
}

impl TrackAnalyzer {
    fn disconnect(self) {
        debug!(
            "Disconnected analyser for {}/{} after {:?}",
            self.participant,
            self.track_id,
            self.attached_at.elapsed()
        );
    }
}

/// Live analysis contexts keyed by participant. A participant has at most
/// one; replacing or detaching a track always disconnects the old one.
#[derive(Debug, Default)]
pub struct TrackAnalyzers {
    active: HashMap<String, TrackAnalyzer>,
    torn_down: u64,
}

impl TrackAnalyzers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, participant: &str, track_id: &str) {
        let analyzer = TrackAnalyzer {
            participant: participant.to_string(),
            track_id: track_id.to_string(),
            attached_at: Instant::now(),
        };
        if let Some(old) = self.active.insert(participant.to_string(), analyzer) {
            self.teardown(old);
        }
        debug!("Analyser attached for {}/{}", participant, track_id);
    }

    pub fn detach(&mut self, participant: &str) -> bool {
        match self.active.remove(participant) {
            Some(old) => {
                self.teardown(old);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        let all: Vec<TrackAnalyzer> = self.active.drain().map(|(_, a)| a).collect();
        for analyzer in all {
            self.teardown(analyzer);
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn torn_down(&self) -> u64 {
        self.torn_down
    }

    fn teardown(&mut self, analyzer: TrackAnalyzer) {
        analyzer.disconnect();
        self.torn_down += 1;
    }
}

impl Drop for TrackAnalyzers {
    fn drop(&mut self) {
        self.clear();
    }
}
