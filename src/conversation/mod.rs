//! # Conversation Session Interface
//!
//! The voice conversation session (speech recognition, dialogue, speech synthesis) is an
//! external collaborator. The relay only needs three lifecycle calls and a stream of
//! notifications from it, which is what this module defines.
//!
//! ## Key Types:
//! - **ConversationSession**: async `warmup` / `start` / `stop` plus a one-shot event receiver
//! - **SessionEvent**: tagged notifications (state, transcripts, latency, errors)
//! - **SessionParams**: explicit construction parameters for a session
//! - **SessionFactory**: builds a session for one call around that call's audio endpoints
//!
//! ## Event Delivery:
//! Instead of registering callbacks per event name, a session exposes a channel of
//! [`SessionEvent`] values. The relay takes the receiver once, when the call is set up,
//! and dispatches on the variant with a `match`.

pub mod loopback;
#[cfg(test)]
pub mod testing;

use crate::audio::endpoint::{AudioSink, AudioSource, EndpointError};
use crate::config::SessionConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use loopback::LoopbackSessionFactory;

/// Conversation state reported by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Thinking => "thinking",
            SessionState::Speaking => "speaking",
        }
    }
}

/// A notification emitted by the conversation session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The conversation moved to a new state
    State { state: SessionState },
    /// Transcript of what the caller said (partial until `is_final`)
    Input { text: String, is_final: bool },
    /// Transcript of what the agent is saying (partial until `is_final`)
    Output { text: String, is_final: bool },
    /// A latency measurement taken inside the session
    Latency { metric: String, value_ms: f64 },
    /// The session hit an error; the host decides what to do about it
    Error { message: String },
}

/// Errors returned by session lifecycle calls.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to reach voice backend: {0}")]
    Connection(String),

    #[error("session audio endpoint failed: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("voice backend error: {0}")]
    Backend(String),
}

/// Parameters a session is built with.
///
/// Replaces the command-line defaults of a demo script with an explicit value that is
/// passed to the factory for every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Agent to talk to
    pub agent_id: String,
    /// Voice used for synthesized speech
    pub tts_voice: String,
    /// Signaling endpoint of the voice backend
    pub signaling_url: String,
    /// Sample rate the session consumes and produces
    pub sample_rate: u32,
    /// Channel count the session consumes and produces
    pub channels: u16,
}

impl From<&SessionConfig> for SessionParams {
    fn from(config: &SessionConfig) -> Self {
        Self {
            agent_id: config.agent_id.clone(),
            tts_voice: config.tts_voice.clone(),
            signaling_url: config.signaling_url.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }
}

/// The lifecycle contract of a voice conversation session.
///
/// ## Contract:
/// - `warmup` establishes the upstream connection without activating audio
/// - `start` activates audio: the session starts the source and sink and begins
///   pulling from one and writing to the other
/// - `stop` ends the session; calling it again must be harmless
/// - `take_events` returns the event receiver the first time and `None` afterwards
#[async_trait]
pub trait ConversationSession: Send + Sync {
    async fn warmup(&self) -> Result<(), SessionError>;

    async fn start(&self) -> Result<(), SessionError>;

    async fn stop(&self) -> Result<(), SessionError>;

    fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>>;
}

/// Creates one conversation session per call.
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        params: SessionParams,
        source: Arc<dyn AudioSource>,
        sink: Arc<dyn AudioSink>,
    ) -> Arc<dyn ConversationSession>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_event_serialization() {
        let event = SessionEvent::Input {
            text: "hello".to_string(),
            is_final: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "input");
        assert_eq!(json["text"], "hello");
        assert_eq!(json["is_final"], true);

        let state = SessionEvent::State {
            state: SessionState::Listening,
        };
        assert_eq!(serde_json::to_value(&state).unwrap()["state"], "listening");
    }

    #[test]
    fn test_params_from_config() {
        let config = SessionConfig {
            agent_id: "agent-1".to_string(),
            tts_voice: "voice-1".to_string(),
            signaling_url: "wss://voice.example.com/signal".to_string(),
            sample_rate: 24000,
            channels: 1,
        };
        let params = SessionParams::from(&config);
        assert_eq!(params.agent_id, "agent-1");
        assert_eq!(params.sample_rate, 24000);
    }
}
