//! Scripted fake session for relay tests.

use super::{ConversationSession, SessionError, SessionEvent, SessionFactory, SessionParams};
use crate::audio::endpoint::{AudioSink, AudioSource};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Records every lifecycle call and lets the test push events.
pub struct ScriptedSession {
    calls: Mutex<Vec<&'static str>>,
    events_tx: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    fail_start: bool,
}

impl ScriptedSession {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    pub fn failing_start() -> Arc<Self> {
        Self::build(true)
    }

    fn build(fail_start: bool) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(16);
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            fail_start,
        })
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = self.events_tx.lock().unwrap().as_ref() {
            tx.try_send(event).unwrap();
        }
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ConversationSession for ScriptedSession {
    async fn warmup(&self) -> Result<(), SessionError> {
        self.record("warmup");
        Ok(())
    }

    async fn start(&self) -> Result<(), SessionError> {
        self.record("start");
        if self.fail_start {
            return Err(SessionError::Connection("scripted failure".to_string()));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), SessionError> {
        self.record("stop");
        // Closing the event channel ends the bridge
        self.events_tx.lock().unwrap().take();
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.lock().unwrap().take()
    }
}

/// Factory that always hands out the same scripted session.
pub struct ScriptedFactory(pub Arc<ScriptedSession>);

impl SessionFactory for ScriptedFactory {
    fn create(
        &self,
        _params: SessionParams,
        _source: Arc<dyn AudioSource>,
        _sink: Arc<dyn AudioSink>,
    ) -> Arc<dyn ConversationSession> {
        self.0.clone()
    }
}
