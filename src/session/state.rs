//! Session state, UI notifications and counters

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle of one controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Live,
    Error,
}

impl SessionState {
    /// `connect()` is a no-op in these states
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Live)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Live => "live",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Pushed to subscribers of a [`SessionController`](super::SessionController)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
        /// Reason when `state` is `Error`
        error: Option<String>,
    },
    TranscriptAppended {
        fragment: String,
    },
    TurnComplete,
    Interrupted,
}

/// Snapshot of the pipeline counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames_captured: u64,
    pub frames_sent: u64,
    /// Ring overflow plus transport backpressure
    pub frames_dropped: u64,
    pub chunks_received: u64,
    pub chunks_malformed: u64,
    pub buffers_scheduled: u64,
    pub buffers_completed: u64,
    pub interruptions: u64,
}

impl SessionStats {
    /// Fraction of captured frames that never reached the transport
    pub fn drop_rate(&self) -> f64 {
        if self.frames_captured == 0 {
            0.0
        } else {
            self.frames_dropped as f64 / self.frames_captured as f64
        }
    }
}

/// Live counters shared between the controller and its session loop
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub frames_captured: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub chunks_received: AtomicU64,
    pub chunks_malformed: AtomicU64,
    pub buffers_scheduled: AtomicU64,
    pub buffers_completed: AtomicU64,
    pub interruptions: AtomicU64,
}

impl StatsCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_malformed: self.chunks_malformed.load(Ordering::Relaxed),
            buffers_scheduled: self.buffers_scheduled.load(Ordering::Relaxed),
            buffers_completed: self.buffers_completed.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }

    /// Zero everything at the start of a session
    pub fn reset(&self) {
        for counter in [
            &self.frames_captured,
            &self.frames_sent,
            &self.frames_dropped,
            &self.chunks_received,
            &self.chunks_malformed,
            &self.buffers_scheduled,
            &self.buffers_completed,
            &self.interruptions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(SessionState::Connecting.is_active());
        assert!(SessionState::Live.is_active());
        assert!(!SessionState::Disconnected.is_active());
        assert!(!SessionState::Error.is_active());
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::StateChanged {
            state: SessionState::Error,
            error: Some("mic denied".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "state_changed");
        assert_eq!(json["state"], "error");
        assert_eq!(json["error"], "mic denied");
    }

    #[test]
    fn test_counters_snapshot_and_reset() {
        let counters = StatsCounters::default();
        StatsCounters::incr(&counters.frames_captured);
        StatsCounters::incr(&counters.frames_captured);
        StatsCounters::add(&counters.frames_dropped, 1);

        let stats = counters.snapshot();
        assert_eq!(stats.frames_captured, 2);
        assert_eq!(stats.frames_dropped, 1);
        assert!((stats.drop_rate() - 0.5).abs() < 1e-9);

        counters.reset();
        assert_eq!(counters.snapshot(), SessionStats::default());
    }
}
