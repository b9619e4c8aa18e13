//! # Bounded Audio Channel
//!
//! A fixed-capacity, single-producer/single-consumer queue of [`AudioFrame`]s with an
//! explicit overflow policy. This is the only place audio is buffered between the
//! telephony leg and the voice session, so it is what bounds both memory and latency.
//!
//! ## Overflow Policy (drop newest):
//! - `push` never waits. When the queue already holds `capacity` frames the new frame
//!   is discarded and counted as a drop.
//! - Frames that made it into the queue are never evicted, so the consumer always sees
//!   accepted frames in the order they were pushed.
//! - Sustained overload shows up as audible gaps instead of an ever-growing delay.
//!
//! ## Consumer Side:
//! - `pop` waits (without timeout) until a frame arrives or the producer is gone.
//! - `try_pop` returns immediately; callers that must keep a steady cadence substitute
//!   silence when it reports [`TryPopError::Empty`].
//!
//! ## Rust Concepts:
//! - **tokio::sync::mpsc**: a bounded async channel; `try_send` gives us the
//!   non-blocking push and tells us when the queue is full
//! - **Arc + atomics**: both halves share counters without a lock

use crate::audio::frame::AudioFrame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// How often a run of drops is reported (first drop, then every Nth).
const DROP_LOG_EVERY: u64 = 50;

/// Counters shared by both halves of a channel.
#[derive(Debug, Default)]
pub struct ChannelStats {
    accepted: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelStats {
    /// Frames that were queued successfully.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Frames discarded because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Outcome of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The frame was queued
    Queued,
    /// The queue was full; the frame was discarded
    Dropped,
    /// The consumer is gone; the frame was discarded
    Closed,
}

/// Why a non-blocking pop returned nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryPopError {
    /// Nothing queued right now
    Empty,
    /// Nothing queued and the producer has gone away
    Closed,
}

/// Constructor for a connected producer/consumer pair.
pub struct BoundedAudioChannel;

impl BoundedAudioChannel {
    /// Create a channel holding at most `capacity` frames (a capacity of 0 is raised to 1).
    ///
    /// `label` names the channel in drop warnings ("inbound", "outbound", ...).
    pub fn new(capacity: usize, label: &'static str) -> (AudioFrameSender, AudioFrameReceiver) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let stats = Arc::new(ChannelStats::default());

        (
            AudioFrameSender {
                tx,
                stats: stats.clone(),
                label,
                capacity,
            },
            AudioFrameReceiver { rx, stats },
        )
    }

    /// Number of frames of `frame_duration_ms` that cover `queue_duration_ms` of audio.
    ///
    /// ## Example:
    /// 100ms of queue with 20ms telephony frames gives a capacity of 5 frames.
    pub fn capacity_for(queue_duration_ms: u32, frame_duration_ms: u32) -> usize {
        if frame_duration_ms == 0 {
            return 1;
        }
        (queue_duration_ms.div_ceil(frame_duration_ms) as usize).max(1)
    }
}

/// Producer half. Pushing never blocks.
#[derive(Debug)]
pub struct AudioFrameSender {
    tx: mpsc::Sender<AudioFrame>,
    stats: Arc<ChannelStats>,
    label: &'static str,
    capacity: usize,
}

impl AudioFrameSender {
    /// Queue a frame, or discard it if the queue is at capacity.
    pub fn push(&self, frame: AudioFrame) -> PushOutcome {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % DROP_LOG_EVERY == 1 {
                    warn!(
                        channel = self.label,
                        capacity = self.capacity,
                        dropped_total = dropped,
                        "Audio queue full, dropping newest frame"
                    );
                }
                PushOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Closed
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> Arc<ChannelStats> {
        self.stats.clone()
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct AudioFrameReceiver {
    rx: mpsc::Receiver<AudioFrame>,
    stats: Arc<ChannelStats>,
}

impl AudioFrameReceiver {
    /// Wait for the next frame.
    ///
    /// Returns `None` once the producer has been dropped and the queue is drained.
    pub async fn pop(&mut self) -> Option<AudioFrame> {
        self.rx.recv().await
    }

    /// Take the next frame if one is queued, without waiting.
    pub fn try_pop(&mut self) -> Result<AudioFrame, TryPopError> {
        self.rx.try_recv().map_err(|err| match err {
            mpsc::error::TryRecvError::Empty => TryPopError::Empty,
            mpsc::error::TryRecvError::Disconnected => TryPopError::Closed,
        })
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> Arc<ChannelStats> {
        self.stats.clone()
    }

    /// Convert into the underlying receiver (used to build frame streams).
    pub fn into_inner(self) -> mpsc::Receiver<AudioFrame> {
        self.rx
    }
}
