//! # Mark Latency Tracking
//!
//! Every Kth outbound audio frame is followed by a `mark` event. The telephony side echoes
//! the mark back once the audio before it has been played, so the time between sending a
//! mark and receiving its echo is the round trip through the telephony leg.
//!
//! ## Guarantees:
//! - A mark name is recorded at most once while it is pending
//! - An acknowledgment resolves at most one pending entry and removes it
//! - Acknowledgments for unknown names are counted as anomalies, never errors
//! - Entries still pending when the call ends are discarded with [`LatencyTracker::clear`]
//!
//! The sender task inserts and the call driver removes, so the map sits behind a mutex
//! that is only held for the insert or lookup itself.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Which outbound frames carry a mark.
///
/// With an interval of K the 1st, (K+1)th, (2K+1)th ... frames are marked, using the
/// 1-based frame counter as the mark name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkSchedule {
    interval: u64,
}

impl MarkSchedule {
    /// An interval of 0 is treated as 1 (mark every frame).
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// The mark name for frame `sequence`, if that frame is marked.
    pub fn mark_for(&self, sequence: u64) -> Option<String> {
        if sequence > 0 && (sequence - 1) % self.interval == 0 {
            Some(sequence.to_string())
        } else {
            None
        }
    }
}

/// Result of matching an echoed mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The mark was pending; carries the round-trip time
    Matched(Duration),
    /// No pending mark had this name
    Unexpected,
}

/// Aggregate round-trip statistics for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub samples: u64,
    pub unexpected: u64,
    pub last_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub mean_ms: Option<f64>,
}

#[derive(Debug, Default)]
struct TrackerState {
    pending: HashMap<String, Instant>,
    samples: u64,
    unexpected: u64,
    total: Duration,
    last: Option<Duration>,
    min: Option<Duration>,
    max: Option<Duration>,
}

/// Correlates sent marks with their acknowledgments.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    state: Mutex<TrackerState>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that mark `name` is being sent now.
    ///
    /// Returns `false` (and keeps the original timestamp) if `name` is already pending.
    pub fn record_send(&self, name: &str) -> bool {
        self.record_send_at(name, Instant::now())
    }

    pub fn record_send_at(&self, name: &str, sent_at: Instant) -> bool {
        let mut state = self.lock();
        if state.pending.contains_key(name) {
            return false;
        }
        state.pending.insert(name.to_string(), sent_at);
        true
    }

    /// Match an echoed mark against the pending entries.
    pub fn acknowledge(&self, name: &str) -> MarkOutcome {
        self.acknowledge_at(name, Instant::now())
    }

    pub fn acknowledge_at(&self, name: &str, received_at: Instant) -> MarkOutcome {
        let mut state = self.lock();
        let Some(sent_at) = state.pending.remove(name) else {
            state.unexpected += 1;
            return MarkOutcome::Unexpected;
        };

        let rtt = received_at.saturating_duration_since(sent_at);
        state.samples += 1;
        state.total += rtt;
        state.last = Some(rtt);
        state.min = Some(state.min.map_or(rtt, |m| m.min(rtt)));
        state.max = Some(state.max.map_or(rtt, |m| m.max(rtt)));
        MarkOutcome::Matched(rtt)
    }

    /// Discard every pending mark, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let discarded = state.pending.len();
        state.pending.clear();
        discarded
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn stats(&self) -> LatencyStats {
        let state = self.lock();
        let as_ms = |d: Duration| d.as_secs_f64() * 1000.0;
        LatencyStats {
            samples: state.samples,
            unexpected: state.unexpected,
            last_ms: state.last.map(as_ms),
            min_ms: state.min.map(as_ms),
            max_ms: state.max.map(as_ms),
            mean_ms: (state.samples > 0).then(|| as_ms(state.total) / state.samples as f64),
        }
    }
}
