//! # Audio Pipeline Module
//!
//! Everything that touches audio samples on their way between the telephony leg and the
//! voice session lives here.
//!
//! ## Key Components:
//! - **Frame**: immutable block of samples tagged with rate, channels and encoding
//! - **Codec**: mu-law companding and sample-rate conversion
//! - **Buffer**: bounded, drop-newest frame channel between producer and consumer
//! - **Endpoint**: source/sink contract plus the telephony-side implementations
//!
//! ## Audio Formats:
//! - **Telephony leg**: 8-bit mu-law, 8kHz, mono
//! - **Session leg**: 16-bit little-endian linear PCM at the session's declared rate

pub mod buffer; // Bounded SPSC frame channel
pub mod codec; // Companding and resampling
pub mod endpoint; // AudioSource / AudioSink and phone implementations
pub mod frame; // AudioFrame type
