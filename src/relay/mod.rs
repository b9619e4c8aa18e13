//! # Telephony Relay Module
//!
//! Bridges a telephony media stream (JSON events over a WebSocket) to a voice conversation
//! session.
//!
//! ## Data Flow:
//! ```text
//! socket ─text─▶ call driver ─▶ StreamSession ─media─▶ PhoneAudioSource ─▶ session
//! socket ◀─json─ OutboundSender ◀──────────────────── PhoneAudioSink ◀── session
//! ```
//!
//! ## Key Components:
//! - **protocol**: inbound/outbound event types and their JSON shape
//! - **stream**: the per-call state machine and teardown
//! - **sender**: outbound media task with periodic latency marks
//! - **latency**: mark bookkeeping and round-trip statistics
//! - **bridge** / **observer**: where session and relay events are reported
//! - **call**: wires a call together and runs it on its own task
//! - **transport**: the seam to the socket

pub mod bridge;
pub mod call;
pub mod counters;
pub mod latency;
pub mod observer;
pub mod protocol;
pub mod sender;
pub mod stream;
pub mod transport;

pub use call::{spawn_call, CallConfig, CallHandle};
pub use counters::{RelayCounters, RelayCountersSnapshot};
pub use observer::{ErrorPolicy, ObserverSet, RelayObserver, TracingObserver, TranscriptConsole};
pub use stream::RelayContext;
pub use transport::{TelephonyTransport, TransportError};
