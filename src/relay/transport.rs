//! # Telephony Transport
//!
//! The relay never writes to a socket directly. It hands outbound events to a
//! [`TelephonyTransport`], which the WebSocket actor implements by forwarding them as
//! actor messages. Tests implement it with a recorder.

use crate::relay::protocol::OutboundEvent;
use thiserror::Error;

/// Errors from delivering an outbound event.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("telephony socket is closed")]
    Closed,

    #[error("failed to encode outbound event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outbound half of a telephony connection.
///
/// ## Contract:
/// - `send` must not block; it either queues the event for the socket or reports
///   [`TransportError::Closed`] once the socket is gone
/// - `close` asks the socket to close; calling it more than once is harmless
pub trait TelephonyTransport: Send + Sync {
    fn send(&self, event: OutboundEvent) -> Result<(), TransportError>;

    fn close(&self);
}

#[cfg(test)]
pub mod testing {
    //! Recording transport shared by the relay tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingTransport {
        sent: Mutex<Vec<OutboundEvent>>,
        closed: AtomicBool,
        close_calls: AtomicUsize,
    }

    impl RecordingTransport {
        pub fn sent(&self) -> Vec<OutboundEvent> {
            self.sent.lock().unwrap().clone()
        }

        pub fn media_count(&self) -> usize {
            self.sent()
                .iter()
                .filter(|e| matches!(e, OutboundEvent::Media { .. }))
                .count()
        }

        pub fn mark_names(&self) -> Vec<String> {
            self.sent()
                .into_iter()
                .filter_map(|e| match e {
                    OutboundEvent::Mark { mark, .. } => Some(mark.name),
                    _ => None,
                })
                .collect()
        }

        pub fn close_calls(&self) -> usize {
            self.close_calls.load(Ordering::SeqCst)
        }

        /// Simulate the socket going away without a close request.
        pub fn disconnect(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl TelephonyTransport for RecordingTransport {
        fn send(&self, event: OutboundEvent) -> Result<(), TransportError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.sent.lock().unwrap().push(event);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.close_calls.fetch_add(1, Ordering::SeqCst);
        }
    }
}
