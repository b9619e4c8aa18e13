//! # Session Event Bridge
//!
//! Drains a conversation session's event receiver and hands every event to the call's
//! observer. The bridge is passive: the only influence it has on the call is the optional
//! termination request it makes under [`ErrorPolicy::Terminate`].

use crate::conversation::SessionEvent;
use crate::relay::observer::{ErrorPolicy, RelayEvent, RelayObserver};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// Forwards session events to an observer until the session's event channel closes.
pub struct SessionEventBridge {
    observer: Arc<dyn RelayObserver>,
    policy: ErrorPolicy,
    terminate: Option<oneshot::Sender<String>>,
}

impl SessionEventBridge {
    /// ## Parameters:
    /// - **observer**: where events go
    /// - **policy**: what a session error means for the call
    /// - **terminate**: fired at most once, with the error message, under
    ///   [`ErrorPolicy::Terminate`]
    pub fn new(
        observer: Arc<dyn RelayObserver>,
        policy: ErrorPolicy,
        terminate: oneshot::Sender<String>,
    ) -> Self {
        Self {
            observer,
            policy,
            terminate: Some(terminate),
        }
    }

    pub fn spawn(self, events: mpsc::Receiver<SessionEvent>) -> JoinHandle<usize> {
        tokio::spawn(self.run(events))
    }

    /// Run to completion, returning how many events were forwarded.
    pub async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) -> usize {
        let mut forwarded = 0;

        while let Some(event) = events.recv().await {
            let error = match &event {
                SessionEvent::Error { message } => Some(message.clone()),
                _ => None,
            };

            self.observer.observe(&RelayEvent::Session(event));
            forwarded += 1;

            if let (Some(message), ErrorPolicy::Terminate) = (error, self.policy) {
                if let Some(terminate) = self.terminate.take() {
                    // The call may already be ending, in which case nobody listens
                    let _ = terminate.send(message);
                }
            }
        }

        debug!(forwarded, "Session event bridge finished");
        forwarded
    }
}
