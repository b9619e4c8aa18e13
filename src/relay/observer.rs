//! # Relay Observers
//!
//! Everything the relay wants an operator to know about a call goes through a
//! [`RelayObserver`]: session notifications forwarded by the event bridge, mark latency
//! samples, mark anomalies, and call start/end. Observers only watch; they never change
//! what the relay does.
//!
//! ## Bundled Observers:
//! - **TracingObserver**: structured `tracing` events (the default)
//! - **TranscriptConsole**: live `User:` / `Agent:` transcript lines on a terminal
//! - **ObserverSet**: fans one event out to several observers

use crate::conversation::{SessionEvent, SessionState};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Something worth reporting about a call.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// A notification from the conversation session
    Session(SessionEvent),
    /// An echoed mark matched a pending one
    MarkLatency { mark: String, rtt: Duration },
    /// An echoed mark matched nothing
    UnexpectedMark { mark: String },
    /// The telephony side announced the stream
    CallStarted { stream_sid: String },
    /// The call was torn down
    CallEnded { stream_sid: Option<String> },
}

/// Receives [`RelayEvent`]s. Implementations must not block.
pub trait RelayObserver: Send + Sync {
    fn observe(&self, event: &RelayEvent);
}

/// What the relay does when the session reports an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Report the error and keep the call up
    #[default]
    Continue,
    /// Report the error and end the call
    Terminate,
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    call_id: String,
}

impl TracingObserver {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
        }
    }
}

impl RelayObserver for TracingObserver {
    fn observe(&self, event: &RelayEvent) {
        let call_id = self.call_id.as_str();
        match event {
            RelayEvent::Session(SessionEvent::State { state }) => {
                debug!(call_id, state = state.as_str(), "Session state changed");
            }
            RelayEvent::Session(SessionEvent::Input { text, is_final }) => {
                debug!(call_id, is_final, text = %text, "Caller transcript");
            }
            RelayEvent::Session(SessionEvent::Output { text, is_final }) => {
                debug!(call_id, is_final, text = %text, "Agent transcript");
            }
            RelayEvent::Session(SessionEvent::Latency { metric, value_ms }) => {
                info!(call_id, metric = %metric, value_ms, "Session latency");
            }
            RelayEvent::Session(SessionEvent::Error { message }) => {
                error!(call_id, "Session error: {}", message);
            }
            RelayEvent::MarkLatency { mark, rtt } => {
                info!(
                    call_id,
                    mark = %mark,
                    rtt_ms = rtt.as_secs_f64() * 1000.0,
                    "Mark round trip"
                );
            }
            RelayEvent::UnexpectedMark { mark } => {
                warn!(call_id, mark = %mark, "Acknowledgment for unknown mark");
            }
            RelayEvent::CallStarted { stream_sid } => {
                info!(call_id, stream_sid = %stream_sid, "Call started");
            }
            RelayEvent::CallEnded { stream_sid } => {
                info!(call_id, stream_sid = ?stream_sid, "Call ended");
            }
        }
    }
}

/// Prints a live transcript.
///
/// Partial transcripts end with a carriage return so the next update overwrites them;
/// final ones end with a newline.
pub struct TranscriptConsole<W: Write + Send> {
    out: Mutex<W>,
}

impl TranscriptConsole<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> TranscriptConsole<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    fn print(&self, line: &str, end: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        // Console output is best effort
        let _ = write!(out, "{}{}", line, end);
        let _ = out.flush();
    }

    /// Take the writer back (used by tests to inspect the output).
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> RelayObserver for TranscriptConsole<W> {
    fn observe(&self, event: &RelayEvent) {
        let RelayEvent::Session(event) = event else {
            return;
        };
        let end = |is_final: bool| if is_final { "\n" } else { "\r" };

        match event {
            SessionEvent::State {
                state: SessionState::Listening,
            } => self.print("User:  ", "\r"),
            SessionEvent::State {
                state: SessionState::Thinking,
            } => self.print("Agent: ", "\r"),
            SessionEvent::Input { text, is_final } => self.print(&format!("User:  {}", text), end(*is_final)),
            SessionEvent::Output { text, is_final } => self.print(&format!("Agent: {}", text), end(*is_final)),
            SessionEvent::Error { message } => self.print(&format!("Error: {}", message), "\n"),
            _ => {}
        }
    }
}

/// Forwards each event to every member, in order.
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn RelayObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn RelayObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl RelayObserver for ObserverSet {
    fn observe(&self, event: &RelayEvent) {
        for observer in &self.observers {
            observer.observe(event);
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! Observer that records what it saw.

    use super::*;

    #[derive(Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<RelayEvent>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<RelayEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn count(&self, predicate: impl Fn(&RelayEvent) -> bool) -> usize {
            self.events().iter().filter(|e| predicate(e)).count()
        }
    }

    impl RelayObserver for RecordingObserver {
        fn observe(&self, event: &RelayEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingObserver;
    use super::*;

    fn session(event: SessionEvent) -> RelayEvent {
        RelayEvent::Session(event)
    }

    #[test]
    fn test_transcript_console_partial_and_final_lines() {
        let console = TranscriptConsole::new(Vec::new());

        console.observe(&session(SessionEvent::State {
            state: SessionState::Listening,
        }));
        console.observe(&session(SessionEvent::Input {
            text: "hel".to_string(),
            is_final: false,
        }));
        console.observe(&session(SessionEvent::Input {
            text: "hello".to_string(),
            is_final: true,
        }));
        console.observe(&session(SessionEvent::Output {
            text: "hi there".to_string(),
            is_final: true,
        }));
        console.observe(&RelayEvent::UnexpectedMark {
            mark: "7".to_string(),
        });

        let output = String::from_utf8(console.into_inner()).unwrap();
        assert_eq!(output, "User:  \rUser:  hel\rUser:  hello\nAgent: hi there\n");
    }

    #[test]
    fn test_transcript_console_prints_errors() {
        let console = TranscriptConsole::new(Vec::new());
        console.observe(&session(SessionEvent::Error {
            message: "backend down".to_string(),
        }));
        assert_eq!(String::from_utf8(console.into_inner()).unwrap(), "Error: backend down\n");
    }

    #[test]
    fn test_observer_set_fans_out() {
        let first = Arc::new(RecordingObserver::default());
        let second = Arc::new(RecordingObserver::default());
        let set = ObserverSet::new().with(first.clone()).with(second.clone());
        assert_eq!(set.len(), 2);

        let event = RelayEvent::CallStarted {
            stream_sid: "SID1".to_string(),
        };
        set.observe(&event);

        assert_eq!(first.events(), vec![event.clone()]);
        assert_eq!(second.events(), vec![event]);
    }

    #[test]
    fn test_error_policy_deserializes_lowercase() {
        let policy: ErrorPolicy = serde_json::from_str("\"terminate\"").unwrap();
        assert_eq!(policy, ErrorPolicy::Terminate);
        assert_eq!(ErrorPolicy::default(), ErrorPolicy::Continue);
    }
}
