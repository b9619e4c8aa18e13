//! # Audio Endpoints
//!
//! The capability contract between the relay and the voice session:
//!
//! - An [`AudioSource`] produces a continuous stream of linear PCM frames at the rate the
//!   session asked for in `start`. The session pulls from it.
//! - An [`AudioSink`] accepts frames the session produces, at the rate it declared in
//!   `start`. The relay drains it towards the telephony leg.
//!
//! [`PhoneAudioSource`] and [`PhoneAudioSink`] are the telephony-side implementations.
//! Each owns a [`BoundedAudioChannel`], so neither side of the call can make the other
//! buffer without limit.
//!
//! ## Lifecycle:
//! 1. **Created** with the call (queues exist, nothing negotiated yet)
//! 2. **Started** by the session with its sample rate and channel count (set once)
//! 3. **Closed** on every exit path of the call; closing is idempotent

use crate::audio::buffer::{AudioFrameReceiver, AudioFrameSender, BoundedAudioChannel, ChannelStats, PushOutcome};
use crate::audio::frame::{AudioEncoding, AudioFrame, FrameError};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// A lazily produced, non-restartable stream of frames.
pub type FrameStream = BoxStream<'static, AudioFrame>;

/// Errors reported by audio endpoints.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("endpoint has not been started")]
    NotStarted,

    #[error("endpoint is closed")]
    Closed,

    #[error("empty audio payload")]
    EmptyPayload,

    #[error("unsupported channel count {0} (telephony audio is mono)")]
    UnsupportedChannels(u16),

    #[error("invalid audio frame: {0}")]
    Frame(#[from] FrameError),
}

/// Something the voice session can pull audio from.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Declare the format the session wants to receive. Idempotent.
    async fn start(&self, sample_rate: u32, channels: u16) -> Result<(), EndpointError>;

    /// Hand out the frame stream. Only the first call returns `Some`.
    fn stream(&self) -> Option<FrameStream>;

    /// While disabled, frames are replaced with silence of the same length.
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// End the stream once the queued frames are consumed.
    async fn close(&self);
}

/// Something the voice session can push audio into.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Declare the format of the frames the session will write.
    async fn start(&self, sample_rate: u32, channels: u16) -> Result<(), EndpointError>;

    /// Accept a frame without blocking indefinitely.
    async fn write(&self, frame: AudioFrame) -> Result<(), EndpointError>;

    /// Release the endpoint. Safe to call more than once.
    async fn close(&self);
}

/// Negotiated format of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_channels(channels: u16) -> Result<(), EndpointError> {
    if channels != 1 {
        return Err(EndpointError::UnsupportedChannels(channels));
    }
    Ok(())
}

#[derive(Debug)]
struct SourceFormat {
    format: EndpointFormat,
    started: bool,
}

/// Audio source fed by the telephony leg.
///
/// ## Data Flow:
/// `media` payload (base64-decoded mu-law) → [`PhoneAudioSource::write_companded`]
/// → decode to linear16 → resample to the session rate → bounded queue → session.
///
/// Frames written before the session calls `start` are converted at the default session
/// rate given to [`PhoneAudioSource::new`] and wait in the queue.
pub struct PhoneAudioSource {
    telephony_rate: AtomicU32,
    format: Mutex<SourceFormat>,
    sender: Mutex<Option<AudioFrameSender>>,
    receiver: Mutex<Option<AudioFrameReceiver>>,
    enabled: Arc<AtomicBool>,
    stats: Arc<ChannelStats>,
}

impl PhoneAudioSource {
    /// Create a source for `telephony_rate` mu-law input.
    ///
    /// ## Parameters:
    /// - **telephony_rate**: rate of the companded payloads (usually 8000)
    /// - **default_session_rate**: conversion target until the session calls `start`
    /// - **capacity**: queue size in frames
    pub fn new(telephony_rate: u32, default_session_rate: u32, capacity: usize) -> Self {
        let (sender, receiver) = BoundedAudioChannel::new(capacity, "inbound");
        let stats = sender.stats();

        Self {
            telephony_rate: AtomicU32::new(telephony_rate),
            format: Mutex::new(SourceFormat {
                format: EndpointFormat {
                    sample_rate: default_session_rate,
                    channels: 1,
                },
                started: false,
            }),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            enabled: Arc::new(AtomicBool::new(true)),
            stats,
        }
    }

    /// Decode a telephony payload and queue it for the session.
    ///
    /// ## Returns:
    /// - **Ok(PushOutcome)**: whether the frame was queued or dropped on overflow
    /// - **Err(EmptyPayload)**: nothing to decode, nothing queued
    /// - **Err(Closed)**: the call is over
    pub fn write_companded(&self, payload: &[u8]) -> Result<PushOutcome, EndpointError> {
        if payload.is_empty() {
            return Err(EndpointError::EmptyPayload);
        }

        let target_rate = self.format().sample_rate;
        let frame = AudioFrame::new(payload.to_vec(), self.telephony_rate(), 1, AudioEncoding::Mulaw8)?
            .to_linear16(target_rate)?;

        match lock(&self.sender).as_ref() {
            Some(sender) => Ok(sender.push(frame)),
            None => Err(EndpointError::Closed),
        }
    }

    pub fn format(&self) -> EndpointFormat {
        lock(&self.format).format
    }

    pub fn telephony_rate(&self) -> u32 {
        self.telephony_rate.load(Ordering::Relaxed)
    }

    /// Switch the rate of incoming payloads, e.g. after the stream announced its format.
    pub fn set_telephony_rate(&self, rate: u32) {
        if rate > 0 {
            self.telephony_rate.store(rate, Ordering::Relaxed);
        }
    }

    pub fn is_started(&self) -> bool {
        lock(&self.format).started
    }

    pub fn stats(&self) -> Arc<ChannelStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl AudioSource for PhoneAudioSource {
    async fn start(&self, sample_rate: u32, channels: u16) -> Result<(), EndpointError> {
        check_channels(channels)?;

        let mut state = lock(&self.format);
        if state.started {
            if state.format.sample_rate != sample_rate {
                warn!(
                    negotiated = state.format.sample_rate,
                    requested = sample_rate,
                    "Source already started, keeping negotiated sample rate"
                );
            }
            return Ok(());
        }

        state.format = EndpointFormat { sample_rate, channels };
        state.started = true;
        debug!(sample_rate, channels, "Phone audio source started");
        Ok(())
    }

    fn stream(&self) -> Option<FrameStream> {
        let receiver = lock(&self.receiver).take()?;
        let enabled = self.enabled.clone();

        Some(
            ReceiverStream::new(receiver.into_inner())
                .map(move |frame| {
                    if enabled.load(Ordering::Relaxed) {
                        frame
                    } else {
                        frame.silence_like()
                    }
                })
                .boxed(),
        )
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        if lock(&self.sender).take().is_some() {
            debug!(
                accepted = self.stats.accepted(),
                dropped = self.stats.dropped(),
                "Phone audio source closed"
            );
        }
    }
}

#[derive(Debug, Default)]
struct SinkState {
    format: Option<EndpointFormat>,
    closed: bool,
}

/// Audio sink that collects session audio for the telephony leg.
///
/// The relay takes the consumer half with [`PhoneAudioSink::take_receiver`] and turns
/// each frame into an outbound `media` event.
pub struct PhoneAudioSink {
    state: Mutex<SinkState>,
    sender: Mutex<Option<AudioFrameSender>>,
    receiver: Mutex<Option<AudioFrameReceiver>>,
    stats: Arc<ChannelStats>,
}

impl PhoneAudioSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = BoundedAudioChannel::new(capacity, "outbound");
        let stats = sender.stats();

        Self {
            state: Mutex::new(SinkState::default()),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            stats,
        }
    }

    /// Hand out the consumer half. Only the first call returns `Some`.
    pub fn take_receiver(&self) -> Option<AudioFrameReceiver> {
        lock(&self.receiver).take()
    }

    /// The format declared by the session, once started.
    pub fn format(&self) -> Option<EndpointFormat> {
        lock(&self.state).format
    }

    pub fn is_started(&self) -> bool {
        let state = lock(&self.state);
        state.format.is_some() && !state.closed
    }

    pub fn stats(&self) -> Arc<ChannelStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl AudioSink for PhoneAudioSink {
    async fn start(&self, sample_rate: u32, channels: u16) -> Result<(), EndpointError> {
        check_channels(channels)?;

        let mut state = lock(&self.state);
        if state.closed {
            return Err(EndpointError::Closed);
        }
        match state.format {
            Some(existing) if existing.sample_rate != sample_rate => {
                warn!(
                    negotiated = existing.sample_rate,
                    requested = sample_rate,
                    "Sink already started, keeping negotiated sample rate"
                );
            }
            Some(_) => {}
            None => {
                state.format = Some(EndpointFormat { sample_rate, channels });
                debug!(sample_rate, channels, "Phone audio sink started");
            }
        }
        Ok(())
    }

    async fn write(&self, frame: AudioFrame) -> Result<(), EndpointError> {
        let format = {
            let state = lock(&self.state);
            if state.closed {
                return Err(EndpointError::Closed);
            }
            state.format.ok_or(EndpointError::NotStarted)?
        };

        // Frames in another shape are brought to the declared format
        let frame = if frame.encoding() == AudioEncoding::Linear16
            && frame.sample_rate() == format.sample_rate
        {
            frame
        } else {
            frame.to_linear16(format.sample_rate)?
        };

        match lock(&self.sender).as_ref() {
            Some(sender) => match sender.push(frame) {
                PushOutcome::Queued | PushOutcome::Dropped => Ok(()),
                PushOutcome::Closed => Err(EndpointError::Closed),
            },
            None => Err(EndpointError::Closed),
        }
    }

    async fn close(&self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);

        lock(&self.sender).take();
        debug!(
            accepted = self.stats.accepted(),
            dropped = self.stats.dropped(),
            "Phone audio sink closed"
        );
    }
}
