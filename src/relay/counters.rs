//! Process-wide relay counters, shared by every call and read by `/api/v1/metrics`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free counters updated from the per-call tasks.
#[derive(Debug, Default)]
pub struct RelayCounters {
    calls_total: AtomicU64,
    inbound_frames: AtomicU64,
    inbound_dropped: AtomicU64,
    outbound_frames: AtomicU64,
    outbound_dropped: AtomicU64,
    marks_sent: AtomicU64,
    marks_acknowledged: AtomicU64,
    marks_unexpected: AtomicU64,
    rtt_total_us: AtomicU64,
    malformed_frames: AtomicU64,
}

/// Point-in-time copy of [`RelayCounters`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelayCountersSnapshot {
    pub calls_total: u64,
    pub inbound_frames: u64,
    pub inbound_dropped: u64,
    pub outbound_frames: u64,
    pub outbound_dropped: u64,
    pub marks_sent: u64,
    pub marks_acknowledged: u64,
    pub marks_unexpected: u64,
    pub malformed_frames: u64,
    pub mean_mark_rtt_ms: Option<f64>,
}

impl RelayCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_started(&self) {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inbound_frame(&self) {
        self.inbound_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inbound_dropped(&self) {
        self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outbound_frame(&self) {
        self.outbound_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Session frames the sink discarded during a call, added at teardown.
    pub fn add_outbound_dropped(&self, dropped: u64) {
        self.outbound_dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn mark_sent(&self) {
        self.marks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_acknowledged(&self, rtt: Duration) {
        self.marks_acknowledged.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(rtt.as_micros()).unwrap_or(u64::MAX);
        self.rtt_total_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn mark_unexpected(&self) {
        self.marks_unexpected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayCountersSnapshot {
        let acknowledged = self.marks_acknowledged.load(Ordering::Relaxed);
        let rtt_total_us = self.rtt_total_us.load(Ordering::Relaxed);

        RelayCountersSnapshot {
            calls_total: self.calls_total.load(Ordering::Relaxed),
            inbound_frames: self.inbound_frames.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            outbound_frames: self.outbound_frames.load(Ordering::Relaxed),
            outbound_dropped: self.outbound_dropped.load(Ordering::Relaxed),
            marks_sent: self.marks_sent.load(Ordering::Relaxed),
            marks_acknowledged: acknowledged,
            marks_unexpected: self.marks_unexpected.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            mean_mark_rtt_ms: (acknowledged > 0)
                .then(|| rtt_total_us as f64 / acknowledged as f64 / 1000.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_rtt() {
        let counters = RelayCounters::new();
        assert_eq!(counters.snapshot().mean_mark_rtt_ms, None);

        counters.mark_acknowledged(Duration::from_millis(100));
        counters.mark_acknowledged(Duration::from_millis(300));
        counters.mark_unexpected();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.marks_acknowledged, 2);
        assert_eq!(snapshot.marks_unexpected, 1);
        assert_eq!(snapshot.mean_mark_rtt_ms, Some(200.0));
    }
}
