//! # Call Driver
//!
//! Assembles everything one call needs and runs its [`StreamSession`] on a dedicated task.
//!
//! ## Tasks per call:
//! - **driver** (this module): reads inbound text frames in arrival order and feeds the
//!   state machine; owns the teardown
//! - **outbound sender**: spawned by the state machine on `start`
//! - **event bridge**: forwards session events to the observer
//! - whatever the conversation session runs internally
//!
//! The socket side only ever talks to the driver through [`CallHandle::forward`]. When
//! the handle is dropped (the socket is gone) the driver's inbound channel closes and the
//! call is torn down.

use crate::audio::buffer::BoundedAudioChannel;
use crate::audio::endpoint::{AudioSink, AudioSource, PhoneAudioSink, PhoneAudioSource};
use crate::config::AppConfig;
use crate::conversation::{SessionFactory, SessionParams};
use crate::relay::bridge::SessionEventBridge;
use crate::relay::protocol::is_media_frame;
use crate::relay::stream::{Flow, RelayContext, RelaySettings, StreamSession};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// How long the driver waits for the event bridge to drain after teardown.
const BRIDGE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Queue slots reserved for control frames on top of the media allowance.
const CONTROL_HEADROOM: usize = 32;

/// Everything a call needs from the configuration, captured when the call is accepted.
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub session: SessionParams,
    pub relay: RelaySettings,
    /// Frames each audio queue holds
    pub queue_capacity: usize,
    /// Media frames waiting for the driver before new ones are dropped
    pub inbound_capacity: usize,
}

impl From<&AppConfig> for CallConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            session: SessionParams::from(&config.session),
            relay: RelaySettings {
                telephony_rate: config.telephony.sample_rate,
                mark_interval: config.telephony.mark_interval,
                pacing: config.telephony.pacing(),
                error_policy: config.observer.on_session_error,
            },
            queue_capacity: BoundedAudioChannel::capacity_for(
                config.telephony.queue_duration_ms,
                config.telephony.frame_duration_ms,
            ),
            inbound_capacity: config.telephony.inbound_queue_capacity,
        }
    }
}

/// A text frame on its way to the driver.
struct InboundFrame {
    text: String,
    media: bool,
}

/// The socket side's handle on a running call.
///
/// ## Backpressure:
/// Media frames are limited to `inbound_capacity` waiting frames; once the driver falls
/// that far behind, new media is dropped. Control frames (`start`, `mark`, `stop`, ...)
/// have [`CONTROL_HEADROOM`] extra slots so they still get through.
pub struct CallHandle {
    inbound: mpsc::Sender<InboundFrame>,
    pending_media: Arc<AtomicUsize>,
    media_capacity: usize,
    task: JoinHandle<()>,
}

impl CallHandle {
    /// Queue a text frame for the state machine without waiting.
    ///
    /// Returns `false` if the frame was dropped (driver busy or already finished).
    pub fn forward(&self, text: String) -> bool {
        let media = is_media_frame(&text);
        if media {
            if self.pending_media.load(Ordering::Acquire) >= self.media_capacity {
                warn!("Call driver is behind, dropping inbound media frame");
                return false;
            }
            self.pending_media.fetch_add(1, Ordering::AcqRel);
        }

        let result = self.inbound.try_send(InboundFrame { text, media });
        if result.is_err() && media {
            self.pending_media.fetch_sub(1, Ordering::AcqRel);
        }

        match result {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(media, "Call driver is behind, dropping inbound frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the inbound side and wait for the driver to finish its teardown.
    pub async fn join(self) {
        drop(self.inbound);
        if let Err(err) = self.task.await {
            warn!("Call driver task failed: {}", err);
        }
    }
}

/// Build the call's endpoints, session and state machine, and start the driver task.
pub fn spawn_call(
    call_id: String,
    config: CallConfig,
    factory: &dyn SessionFactory,
    context: RelayContext,
) -> CallHandle {
    let source = Arc::new(PhoneAudioSource::new(
        config.relay.telephony_rate,
        config.session.sample_rate,
        config.queue_capacity,
    ));
    let sink = Arc::new(PhoneAudioSink::new(config.queue_capacity));

    let session = factory.create(
        config.session.clone(),
        source.clone() as Arc<dyn AudioSource>,
        sink.clone() as Arc<dyn AudioSink>,
    );

    let (terminate_tx, terminate_rx) = oneshot::channel();
    let bridge = session.take_events().map(|events| {
        SessionEventBridge::new(context.observer.clone(), config.relay.error_policy, terminate_tx).spawn(events)
    });

    let call = StreamSession::new(call_id.clone(), source, sink, session, context, config.relay);
    let media_capacity = config.inbound_capacity.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(media_capacity + CONTROL_HEADROOM);
    let pending_media = Arc::new(AtomicUsize::new(0));

    let span = tracing::info_span!("call", call_id = %call_id);
    let task = tokio::spawn(
        drive(call, inbound_rx, pending_media.clone(), terminate_rx, bridge).instrument(span),
    );

    CallHandle {
        inbound: inbound_tx,
        pending_media,
        media_capacity,
        task,
    }
}

async fn drive(
    mut call: StreamSession,
    mut inbound: mpsc::Receiver<InboundFrame>,
    pending_media: Arc<AtomicUsize>,
    mut terminate: oneshot::Receiver<String>,
    bridge: Option<JoinHandle<usize>>,
) {
    debug!("Call driver started");
    let mut terminate_armed = true;

    loop {
        tokio::select! {
            text = inbound.recv() => match text {
                Some(frame) => {
                    if frame.media {
                        pending_media.fetch_sub(1, Ordering::AcqRel);
                    }
                    if call.handle_text(&frame.text).await == Flow::Close {
                        break;
                    }
                }
                None => {
                    debug!("Telephony socket closed");
                    break;
                }
            },
            reason = &mut terminate, if terminate_armed => match reason {
                Ok(reason) => {
                    call.terminate(&reason).await;
                    break;
                }
                // Bridge finished without asking for termination
                Err(_) => terminate_armed = false,
            },
        }
    }

    call.close().await;
    let stream_sid = call.stream_sid().map(str::to_string);
    drop(call);

    if let Some(bridge) = bridge {
        match tokio::time::timeout(BRIDGE_DRAIN_TIMEOUT, bridge).await {
            Ok(Ok(forwarded)) => debug!(forwarded, "Session events drained"),
            Ok(Err(err)) => warn!("Session event bridge failed: {}", err),
            Err(_) => warn!("Session event bridge did not finish in time"),
        }
    }

    info!(stream_sid = ?stream_sid, "Call finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::testing::{ScriptedFactory, ScriptedSession};
    use crate::conversation::{LoopbackSessionFactory, SessionEvent};
    use crate::relay::counters::RelayCounters;
    use crate::relay::observer::ErrorPolicy;
    use crate::relay::observer::testing::RecordingObserver;
    use crate::relay::observer::RelayEvent;
    use crate::relay::protocol::OutboundEvent;
    use crate::relay::transport::testing::RecordingTransport;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    struct Fixture {
        transport: Arc<RecordingTransport>,
        observer: Arc<RecordingObserver>,
        counters: Arc<RelayCounters>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                transport: Arc::new(RecordingTransport::default()),
                observer: Arc::new(RecordingObserver::default()),
                counters: Arc::new(RelayCounters::new()),
            }
        }

        fn context(&self) -> RelayContext {
            RelayContext {
                transport: self.transport.clone(),
                observer: self.observer.clone(),
                counters: self.counters.clone(),
            }
        }
    }

    fn config(policy: ErrorPolicy) -> CallConfig {
        let mut app = AppConfig::default();
        app.observer.on_session_error = policy;
        CallConfig::from(&app)
    }

    fn media(bytes: &[u8]) -> String {
        format!(r#"{{"event":"media","media":{{"payload":"{}"}}}}"#, BASE64.encode(bytes))
    }

    #[test]
    fn test_call_config_from_app_config() {
        let config = CallConfig::from(&AppConfig::default());
        assert_eq!(config.queue_capacity, 5);
        assert_eq!(config.relay.telephony_rate, 8000);
        assert_eq!(config.relay.mark_interval, 100);
        assert_eq!(config.session.sample_rate, 16000);
        assert_eq!(config.relay.error_policy, ErrorPolicy::Continue);
    }

    #[tokio::test]
    async fn test_socket_close_tears_down_once() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new();
        let factory = ScriptedFactory(session.clone());

        let handle = spawn_call("call-1".to_string(), config(ErrorPolicy::Continue), &factory, fixture.context());
        assert!(handle.forward(r#"{"event":"connected"}"#.to_string()));
        assert!(handle.forward(r#"{"event":"start","streamSid":"SID1"}"#.to_string()));
        handle.join().await;

        assert_eq!(session.calls(), vec!["warmup", "start", "stop"]);
        assert_eq!(fixture.transport.close_calls(), 0);
        assert_eq!(
            fixture.observer.count(|e| matches!(e, RelayEvent::CallEnded { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_stop_event_ends_driver_and_closes_socket() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new();
        let factory = ScriptedFactory(session.clone());

        let handle = spawn_call("call-1".to_string(), config(ErrorPolicy::Continue), &factory, fixture.context());
        handle.forward(r#"{"event":"start","streamSid":"SID1"}"#.to_string());
        handle.forward(r#"{"event":"stop"}"#.to_string());

        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(session.count("stop"), 1);
        assert_eq!(fixture.transport.close_calls(), 1);
        handle.join().await;
        assert_eq!(session.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_session_error_terminates_under_terminate_policy() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new();
        let factory = ScriptedFactory(session.clone());

        let handle = spawn_call("call-1".to_string(), config(ErrorPolicy::Terminate), &factory, fixture.context());
        handle.forward(r#"{"event":"start","streamSid":"SID1"}"#.to_string());
        while session.count("start") == 0 {
            tokio::task::yield_now().await;
        }

        session.emit(SessionEvent::Error {
            message: "backend gone".to_string(),
        });
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }

        assert_eq!(session.count("stop"), 1);
        assert_eq!(fixture.transport.close_calls(), 1);
        assert_eq!(
            fixture
                .observer
                .count(|e| matches!(e, RelayEvent::Session(SessionEvent::Error { .. }))),
            1
        );
        handle.join().await;
    }

    #[tokio::test]
    async fn test_failed_start_ends_call_under_terminate_policy() {
        let fixture = Fixture::new();
        let session = ScriptedSession::failing_start();
        let factory = ScriptedFactory(session.clone());

        let handle = spawn_call("call-1".to_string(), config(ErrorPolicy::Terminate), &factory, fixture.context());
        handle.forward(r#"{"event":"start","streamSid":"SID1"}"#.to_string());

        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(session.count("stop"), 1);
        assert_eq!(fixture.transport.close_calls(), 1);
        assert_eq!(
            fixture
                .observer
                .count(|e| matches!(e, RelayEvent::Session(SessionEvent::Error { .. }))),
            1
        );
        handle.join().await;
        assert_eq!(session.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_media_but_keeps_control_frames() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new();
        let factory = ScriptedFactory(session.clone());
        let mut config = config(ErrorPolicy::Continue);
        config.inbound_capacity = 2;

        // The driver does not run until this task yields, so the queue only fills up
        let handle = spawn_call("call-1".to_string(), config, &factory, fixture.context());
        assert!(handle.forward(r#"{"event":"start","streamSid":"SID1"}"#.to_string()));
        assert!(handle.forward(media(&[0xFF; 160])));
        assert!(handle.forward(media(&[0xFF; 160])));
        assert!(!handle.forward(media(&[0xFF; 160])));
        assert!(handle.forward(r#"{"event":"mark","mark":{"name":"7"}}"#.to_string()));
        assert!(handle.forward(r#"{"event":"stop"}"#.to_string()));

        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(fixture.counters.snapshot().inbound_frames, 2);
        assert_eq!(fixture.counters.snapshot().marks_unexpected, 1);
        assert_eq!(session.count("stop"), 1);
        assert_eq!(fixture.transport.close_calls(), 1);
        handle.join().await;
    }

    #[tokio::test]
    async fn test_session_error_is_only_reported_under_continue_policy() {
        let fixture = Fixture::new();
        let session = ScriptedSession::new();
        let factory = ScriptedFactory(session.clone());

        let handle = spawn_call("call-1".to_string(), config(ErrorPolicy::Continue), &factory, fixture.context());
        handle.forward(r#"{"event":"start","streamSid":"SID1"}"#.to_string());
        while session.count("start") == 0 {
            tokio::task::yield_now().await;
        }

        session.emit(SessionEvent::Error {
            message: "transient".to_string(),
        });
        while fixture.observer.count(|e| matches!(e, RelayEvent::Session(_))) == 0 {
            tokio::task::yield_now().await;
        }

        assert!(!handle.is_finished());
        assert_eq!(session.count("stop"), 0);
        handle.join().await;
        assert_eq!(session.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_loopback_call_echoes_caller_audio() {
        let fixture = Fixture::new();

        let handle = spawn_call(
            "call-1".to_string(),
            config(ErrorPolicy::Continue),
            &LoopbackSessionFactory,
            fixture.context(),
        );
        handle.forward(r#"{"event":"connected"}"#.to_string());
        handle.forward(r#"{"event":"start","streamSid":"SID1"}"#.to_string());
        handle.forward(media(&[0xFF; 160]));

        while fixture.transport.media_count() == 0 {
            tokio::task::yield_now().await;
        }
        handle.join().await;

        // 8kHz mu-law in, 16kHz session, 8kHz mu-law out: same frame size as the caller's
        match &fixture.transport.sent()[0] {
            OutboundEvent::Media { stream_sid, media } => {
                assert_eq!(stream_sid, "SID1");
                assert_eq!(BASE64.decode(&media.payload).unwrap(), vec![0xFF; 160]);
            }
            other => panic!("expected media, got {:?}", other),
        }
        assert_eq!(fixture.transport.mark_names(), vec!["1"]);
        assert!(fixture.observer.count(|e| matches!(e, RelayEvent::Session(_))) > 0);
    }
}
