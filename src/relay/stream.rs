//! # Stream Session (Protocol State Machine)
//!
//! One [`StreamSession`] per telephony call leg. It interprets inbound protocol events,
//! drives the conversation session's lifecycle and owns everything the call allocated:
//! both audio endpoints, the latency tracker and the outbound sender task.
//!
//! ## States:
//! ```text
//! idle ──connected──▶ connected ──start──▶ started ──stop / socket close──▶ stopped
//!   └──────────────────start──────────────────┘
//! ```
//!
//! ## Transitions:
//! - **connected** (idle): warm the session up
//! - **start** (idle or connected): capture the stream id, start the session, spawn the
//!   outbound sender. A second `start` is ignored; the first one wins. A sample rate
//!   announced in `start.mediaFormat` replaces the configured telephony rate. If the
//!   session fails to start, the error is reported and, under the `terminate` policy,
//!   the call ends right away.
//! - **media** (any but stopped): decode and queue for the session. Audio arriving before
//!   `start` waits in the source queue.
//! - **mark** (any but stopped): resolve against pending marks
//! - **stop** (any but stopped): tear down and close the socket
//! - **socket close** (any): tear down
//!
//! ## Teardown:
//! The outbound sender is shut down and awaited before the session is stopped, so nothing
//! writes to a closed socket. The session is stopped exactly once no matter how many of
//! `stop`, socket close or termination arrive.

use crate::audio::buffer::PushOutcome;
use crate::audio::endpoint::{AudioSink, AudioSource, EndpointError, PhoneAudioSink, PhoneAudioSource};
use crate::conversation::{ConversationSession, SessionEvent};
use crate::relay::counters::RelayCounters;
use crate::relay::latency::{LatencyTracker, MarkOutcome, MarkSchedule};
use crate::relay::observer::{ErrorPolicy, RelayEvent, RelayObserver};
use crate::relay::protocol::{InboundEvent, MediaFormat};
use crate::relay::sender::{OutboundSender, SenderHandle, SenderSettings};
use crate::relay::transport::TelephonyTransport;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a call leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connected,
    Started,
    Stopped,
}

/// What the caller of the state machine should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading the socket
    Continue,
    /// The call is over; stop reading
    Close,
}

/// Per-call relay parameters.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Rate of the telephony mu-law audio
    pub telephony_rate: u32,
    /// Every how many outbound frames a mark is sent
    pub mark_interval: u64,
    /// Outbound tick period, `None` to send frames as they come
    pub pacing: Option<Duration>,
    /// What a failed session start means for the call
    pub error_policy: ErrorPolicy,
}

/// Shared collaborators a call reports to.
#[derive(Clone)]
pub struct RelayContext {
    pub transport: Arc<dyn TelephonyTransport>,
    pub observer: Arc<dyn RelayObserver>,
    pub counters: Arc<RelayCounters>,
}

/// State machine and resource owner for one call leg.
pub struct StreamSession {
    call_id: String,
    state: CallState,
    stream_sid: Option<String>,
    source: Arc<PhoneAudioSource>,
    sink: Arc<PhoneAudioSink>,
    session: Arc<dyn ConversationSession>,
    context: RelayContext,
    settings: RelaySettings,
    latency: Arc<LatencyTracker>,
    sender: Option<SenderHandle>,
    session_stopped: bool,
}

impl StreamSession {
    pub fn new(
        call_id: impl Into<String>,
        source: Arc<PhoneAudioSource>,
        sink: Arc<PhoneAudioSink>,
        session: Arc<dyn ConversationSession>,
        context: RelayContext,
        settings: RelaySettings,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            state: CallState::Idle,
            stream_sid: None,
            source,
            sink,
            session,
            context,
            settings,
            latency: Arc::new(LatencyTracker::new()),
            sender: None,
            session_stopped: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }

    pub fn latency(&self) -> &Arc<LatencyTracker> {
        &self.latency
    }

    pub fn source(&self) -> &Arc<PhoneAudioSource> {
        &self.source
    }

    pub fn sink(&self) -> &Arc<PhoneAudioSink> {
        &self.sink
    }

    /// Handle one text frame from the socket.
    ///
    /// Malformed frames are logged and dropped; the call continues.
    pub async fn handle_text(&mut self, text: &str) -> Flow {
        match InboundEvent::parse(text) {
            Ok(event) => self.handle_event(event).await,
            Err(err) => {
                self.context.counters.malformed_frame();
                warn!(call_id = %self.call_id, "Dropping malformed frame: {}", err);
                Flow::Continue
            }
        }
    }

    /// Apply one inbound event to the state machine.
    pub async fn handle_event(&mut self, event: InboundEvent) -> Flow {
        if self.state == CallState::Stopped {
            debug!(call_id = %self.call_id, event = event.name(), "Ignoring event after stop");
            return Flow::Close;
        }

        match event {
            InboundEvent::Connected { protocol, version } => {
                self.on_connected(protocol, version).await;
                Flow::Continue
            }
            InboundEvent::Start { .. } => match event.start_stream_sid() {
                Some(stream_sid) => {
                    let stream_sid = stream_sid.to_string();
                    let metadata = event.start_metadata();
                    let call_sid = metadata.and_then(|m| m.call_sid.clone());
                    let media_format = metadata.and_then(|m| m.media_format.clone());
                    self.on_start(stream_sid, call_sid, media_format).await
                }
                None => {
                    warn!(call_id = %self.call_id, "Start event without stream id");
                    Flow::Continue
                }
            },
            InboundEvent::Media { media } => {
                match media.decode() {
                    Ok(payload) => self.on_media(&payload),
                    Err(err) => {
                        self.context.counters.malformed_frame();
                        warn!(call_id = %self.call_id, "Dropping media frame: {}", err);
                    }
                }
                Flow::Continue
            }
            InboundEvent::Mark { mark } => {
                self.on_mark(mark.name);
                Flow::Continue
            }
            InboundEvent::Stop { .. } => {
                info!(call_id = %self.call_id, stream_sid = ?self.stream_sid, "Stop received");
                self.teardown().await;
                self.context.transport.close();
                Flow::Close
            }
            InboundEvent::Unknown => {
                debug!(call_id = %self.call_id, "Ignoring unsupported event");
                Flow::Continue
            }
        }
    }

    /// The socket went away. Tears the call down if it is still up.
    pub async fn close(&mut self) {
        self.teardown().await;
    }

    /// End the call from the relay side and close the socket.
    pub async fn terminate(&mut self, reason: &str) {
        warn!(call_id = %self.call_id, "Terminating call: {}", reason);
        self.teardown().await;
        self.context.transport.close();
    }

    async fn on_connected(&mut self, protocol: Option<String>, version: Option<String>) {
        if self.state != CallState::Idle {
            debug!(call_id = %self.call_id, state = ?self.state, "Ignoring repeated connected event");
            return;
        }

        debug!(call_id = %self.call_id, ?protocol, ?version, "Telephony stream connected");
        self.state = CallState::Connected;

        if let Err(err) = self.session.warmup().await {
            error!(call_id = %self.call_id, "Session warm-up failed: {}", err);
        }
    }

    async fn on_start(
        &mut self,
        stream_sid: String,
        call_sid: Option<String>,
        media_format: Option<MediaFormat>,
    ) -> Flow {
        if self.state == CallState::Started {
            warn!(
                call_id = %self.call_id,
                current = ?self.stream_sid,
                ignored = %stream_sid,
                "Duplicate start event ignored"
            );
            return Flow::Continue;
        }

        info!(call_id = %self.call_id, stream_sid = %stream_sid, call_sid = ?call_sid, "Stream started");
        if let Some(format) = media_format {
            self.apply_media_format(&format);
        }
        self.state = CallState::Started;
        self.stream_sid = Some(stream_sid.clone());
        self.context.counters.call_started();
        self.context.observer.observe(&RelayEvent::CallStarted {
            stream_sid: stream_sid.clone(),
        });

        if let Err(err) = self.session.start().await {
            let message = err.to_string();
            error!(call_id = %self.call_id, "Session start failed: {}", message);
            self.context
                .observer
                .observe(&RelayEvent::Session(SessionEvent::Error {
                    message: message.clone(),
                }));

            if self.settings.error_policy == ErrorPolicy::Terminate {
                self.terminate(&message).await;
                return Flow::Close;
            }
        }

        match self.sink.take_receiver() {
            Some(frames) => {
                let sender = OutboundSender::new(
                    stream_sid,
                    frames,
                    self.context.transport.clone(),
                    self.latency.clone(),
                    self.context.counters.clone(),
                    SenderSettings {
                        telephony_rate: self.source.telephony_rate(),
                        schedule: MarkSchedule::new(self.settings.mark_interval),
                        pacing: self.settings.pacing,
                    },
                );
                self.sender = Some(sender.spawn());
            }
            None => warn!(call_id = %self.call_id, "Sink queue already taken, no outbound audio"),
        }
        Flow::Continue
    }

    /// Adopt the sample rate the stream announced. Only mono mu-law is understood; any
    /// other format keeps the configured rate.
    fn apply_media_format(&self, format: &MediaFormat) {
        if !format.is_mulaw() || format.channels.is_some_and(|channels| channels != 1) {
            warn!(
                call_id = %self.call_id,
                encoding = ?format.encoding,
                channels = ?format.channels,
                "Unsupported media format announced, keeping configured format"
            );
            return;
        }

        match format.sample_rate {
            Some(rate) if rate > 0 && rate != self.settings.telephony_rate => {
                info!(
                    call_id = %self.call_id,
                    configured = self.settings.telephony_rate,
                    announced = rate,
                    "Using the telephony sample rate announced by the stream"
                );
                self.source.set_telephony_rate(rate);
            }
            _ => {}
        }
    }

    fn on_media(&self, payload: &[u8]) {
        match self.source.write_companded(payload) {
            Ok(PushOutcome::Queued) => self.context.counters.inbound_frame(),
            Ok(PushOutcome::Dropped) | Ok(PushOutcome::Closed) => self.context.counters.inbound_dropped(),
            Err(EndpointError::EmptyPayload) => debug!(call_id = %self.call_id, "Empty media payload"),
            Err(err) => warn!(call_id = %self.call_id, "Could not queue caller audio: {}", err),
        }
    }

    fn on_mark(&self, name: String) {
        match self.latency.acknowledge(&name) {
            MarkOutcome::Matched(rtt) => {
                self.context.counters.mark_acknowledged(rtt);
                self.context
                    .observer
                    .observe(&RelayEvent::MarkLatency { mark: name, rtt });
            }
            MarkOutcome::Unexpected => {
                self.context.counters.mark_unexpected();
                self.context
                    .observer
                    .observe(&RelayEvent::UnexpectedMark { mark: name });
            }
        }
    }

    /// The single teardown path. Idempotent.
    async fn teardown(&mut self) {
        if self.session_stopped {
            return;
        }
        self.state = CallState::Stopped;

        if let Some(sender) = self.sender.take() {
            let sent = sender.shutdown().await;
            debug!(call_id = %self.call_id, sent, "Outbound sender joined");
        }

        self.session_stopped = true;
        if let Err(err) = self.session.stop().await {
            error!(call_id = %self.call_id, "Session stop failed: {}", err);
        }

        self.source.close().await;
        self.sink.close().await;
        self.context
            .counters
            .add_outbound_dropped(self.sink.stats().dropped());

        let discarded = self.latency.clear();
        let stats = self.latency.stats();
        info!(
            call_id = %self.call_id,
            stream_sid = ?self.stream_sid,
            marks_answered = stats.samples,
            marks_discarded = discarded,
            mean_rtt_ms = ?stats.mean_ms,
            "Call torn down"
        );
        self.context.observer.observe(&RelayEvent::CallEnded {
            stream_sid: self.stream_sid.clone(),
        });
    }
}
