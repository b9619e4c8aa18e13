//! # Loopback Session
//!
//! An echo agent: whatever the caller says is played straight back to them.
//! It implements the full [`ConversationSession`] contract without a voice backend, so the
//! relay can be exercised end to end (and is the default backend of the server binary).

use super::{ConversationSession, SessionError, SessionEvent, SessionFactory, SessionParams, SessionState};
use crate::audio::endpoint::{AudioSink, AudioSource, EndpointError};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the session's event channel.
const EVENT_CHANNEL_SIZE: usize = 64;

/// Echo session that pumps source frames into the sink.
pub struct LoopbackSession {
    params: SessionParams,
    source: Arc<dyn AudioSource>,
    sink: Arc<dyn AudioSink>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    warmed_up: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl LoopbackSession {
    pub fn new(params: SessionParams, source: Arc<dyn AudioSource>, sink: Arc<dyn AudioSink>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        Self {
            params,
            source,
            sink,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            pump: Mutex::new(None),
            warmed_up: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events_tx.try_send(event) {
            debug!(?event, "Session event channel full, dropping event");
        }
    }

    fn emit_state(&self, state: SessionState) {
        self.emit(SessionEvent::State { state });
    }
}

#[async_trait]
impl ConversationSession for LoopbackSession {
    async fn warmup(&self) -> Result<(), SessionError> {
        if self.warmed_up.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.emit_state(SessionState::Connecting);
        info!(
            agent_id = %self.params.agent_id,
            tts_voice = %self.params.tts_voice,
            signaling_url = %self.params.signaling_url,
            "Loopback session warmed up"
        );
        self.emit_state(SessionState::Idle);
        Ok(())
    }

    async fn start(&self) -> Result<(), SessionError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SessionError::Backend("session already stopped".to_string()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.warmup().await?;

        self.source.start(self.params.sample_rate, self.params.channels).await?;
        self.sink.start(self.params.sample_rate, self.params.channels).await?;

        let mut frames = self
            .source
            .stream()
            .ok_or_else(|| SessionError::Backend("source stream already taken".to_string()))?;
        let sink = self.sink.clone();

        let pump = tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match sink.write(frame).await {
                    Ok(()) => {}
                    Err(EndpointError::Closed) => break,
                    Err(err) => warn!("Loopback could not write to sink: {}", err),
                }
            }
            debug!("Loopback pump finished");
        });
        *self.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);

        self.emit_state(SessionState::Listening);
        Ok(())
    }

    async fn stop(&self) -> Result<(), SessionError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }
        self.sink.close().await;

        self.emit_state(SessionState::Disconnected);
        info!(agent_id = %self.params.agent_id, "Loopback session stopped");
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Factory producing a [`LoopbackSession`] for every call.
#[derive(Debug, Default, Clone)]
pub struct LoopbackSessionFactory;

impl SessionFactory for LoopbackSessionFactory {
    fn create(
        &self,
        params: SessionParams,
        source: Arc<dyn AudioSource>,
        sink: Arc<dyn AudioSink>,
    ) -> Arc<dyn ConversationSession> {
        Arc::new(LoopbackSession::new(params, source, sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::endpoint::{PhoneAudioSink, PhoneAudioSource};

    fn params() -> SessionParams {
        SessionParams {
            agent_id: "agent".to_string(),
            tts_voice: "voice".to_string(),
            signaling_url: "wss://localhost/signal".to_string(),
            sample_rate: 16000,
            channels: 1,
        }
    }

    #[tokio::test]
    async fn test_loopback_echoes_source_into_sink() {
        let source = Arc::new(PhoneAudioSource::new(8000, 16000, 5));
        let sink = Arc::new(PhoneAudioSink::new(5));
        let mut receiver = sink.take_receiver().unwrap();

        let session = LoopbackSessionFactory.create(params(), source.clone(), sink.clone());
        session.start().await.unwrap();

        source.write_companded(&[0xFF; 160]).unwrap();
        let echoed = receiver.pop().await.unwrap();
        assert_eq!(echoed.sample_rate(), 16000);
        assert_eq!(echoed.sample_count(), 320);

        session.stop().await.unwrap();
        assert!(receiver.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_loopback_lifecycle_events() {
        let source = Arc::new(PhoneAudioSource::new(8000, 16000, 5));
        let sink = Arc::new(PhoneAudioSink::new(5));
        let session = LoopbackSession::new(params(), source, sink);
        let mut events = session.take_events().unwrap();
        assert!(session.take_events().is_none());

        session.warmup().await.unwrap();
        session.start().await.unwrap();
        session.start().await.unwrap();
        session.stop().await.unwrap();
        session.stop().await.unwrap();

        let mut states = Vec::new();
        while let Ok(SessionEvent::State { state }) = events.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            vec![
                SessionState::Connecting,
                SessionState::Idle,
                SessionState::Listening,
                SessionState::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn test_loopback_cannot_restart_after_stop() {
        let source = Arc::new(PhoneAudioSource::new(8000, 16000, 5));
        let sink = Arc::new(PhoneAudioSink::new(5));
        let session = LoopbackSession::new(params(), source, sink);

        session.stop().await.unwrap();
        assert!(session.start().await.is_err());
    }
}
