//! # Configuration Management
//!
//! This module loads the relay's configuration from multiple sources:
//! - Default values (built into the code)
//! - An optional `config.toml` next to the binary
//! - Environment variables (with the `APP_` prefix)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platform conventions)
//! 2. Environment variables, nested with a double underscore:
//!    `APP_SERVER__PORT`, `APP_SESSION__AGENT_ID`, `APP_TELEPHONY__MARK_INTERVAL`, ...
//! 3. Configuration file (`config.toml`)
//! 4. Default values (defined in the `Default` impl)
//!
//! ## Rust Concepts:
//! - **Serde derive**: every section (de)serializes, so the whole tree can round-trip
//!   through the `config` crate and through JSON for the `/api/v1/config` endpoint
//! - **Result<T>**: loading and validation report problems instead of panicking

use crate::relay::observer::ErrorPolicy;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
///
/// ## Sections:
/// - **server**: where to listen and how long a silent socket may live
/// - **session**: parameters handed to every conversation session
/// - **telephony**: the telephony leg's audio format and relay tuning
/// - **performance**: capacity limits
/// - **observer**: how session events are reported and acted upon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub telephony: TelephonyConfig,
    pub performance: PerformanceConfig,
    pub observer: ObserverConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: only accept local connections (development, or behind a tunnel)
/// - `host = "0.0.0.0"`: accept connections from the telephony provider directly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// A WebSocket that sends nothing (not even a pong) for this long is closed
    pub client_timeout_secs: u64,
}

/// Conversation session parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Agent the caller talks to
    pub agent_id: String,
    /// Voice used for synthesized speech
    pub tts_voice: String,
    /// Signaling endpoint of the voice backend
    pub signaling_url: String,
    /// Sample rate the session consumes and produces (Hz)
    pub sample_rate: u32,
    /// Channel count the session consumes and produces
    pub channels: u16,
}

/// Telephony leg and relay tuning.
///
/// ## Queue Sizing:
/// Both audio queues hold `queue_duration_ms / frame_duration_ms` frames (5 with the
/// defaults), which caps the audio that can pile up on either side at ~100ms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelephonyConfig {
    /// Rate of the mu-law audio on the wire (Hz)
    pub sample_rate: u32,
    /// Duration of one telephony media frame
    pub frame_duration_ms: u32,
    /// Audio each queue may hold before dropping new frames
    pub queue_duration_ms: u32,
    /// A mark is sent after every this many outbound frames
    pub mark_interval: u64,
    /// 0 sends session audio as it arrives; otherwise one frame per tick of this period
    pub outbound_pacing_ms: u64,
    /// Media frames waiting for the call driver before new ones are dropped
    pub inbound_queue_capacity: usize,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Calls beyond this are refused with 503
    pub max_concurrent_calls: usize,
}

/// Session event reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// What a session error means for the call
    pub on_session_error: ErrorPolicy,
    /// Print live `User:` / `Agent:` transcripts to stdout
    pub console_transcripts: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5000,
                client_timeout_secs: 60,
            },
            session: SessionConfig {
                agent_id: "default-agent".to_string(),
                tts_voice: "default".to_string(),
                signaling_url: "wss://localhost/signal".to_string(),
                sample_rate: 16000, // Wideband speech
                channels: 1,
            },
            telephony: TelephonyConfig {
                sample_rate: 8000, // Narrowband mu-law
                frame_duration_ms: 20,
                queue_duration_ms: 100,
                mark_interval: 100,
                outbound_pacing_ms: 0,
                inbound_queue_capacity: 256,
            },
            performance: PerformanceConfig {
                max_concurrent_calls: 10,
            },
            observer: ObserverConfig {
                on_session_error: ErrorPolicy::Continue,
                console_transcripts: false,
            },
        }
    }
}

impl TelephonyConfig {
    /// Outbound tick period, or `None` for on-demand sending.
    pub fn pacing(&self) -> Option<Duration> {
        (self.outbound_pacing_ms > 0).then(|| Duration::from_millis(self.outbound_pacing_ms))
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=8080`: override the listening port
    /// - `APP_SESSION__TTS_VOICE=alloy`: override the synthesis voice
    /// - `APP_OBSERVER__ON_SESSION_ERROR=terminate`: end calls on session errors
    /// - `HOST=0.0.0.0` / `PORT=8080`: deployment platform conventions
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Every rate, count and interval the relay divides by or sizes a queue with must be
    /// non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }
        if self.server.client_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Client timeout must be greater than 0"));
        }
        if self.session.sample_rate == 0 {
            return Err(anyhow::anyhow!("Session sample rate must be greater than 0"));
        }
        if self.session.channels != 1 {
            return Err(anyhow::anyhow!(
                "Session channel count must be 1 (telephony audio is mono), got {}",
                self.session.channels
            ));
        }
        if self.telephony.sample_rate == 0 {
            return Err(anyhow::anyhow!("Telephony sample rate must be greater than 0"));
        }
        if self.telephony.frame_duration_ms == 0 {
            return Err(anyhow::anyhow!("Telephony frame duration must be greater than 0"));
        }
        if self.telephony.mark_interval == 0 {
            return Err(anyhow::anyhow!("Mark interval must be greater than 0"));
        }
        if self.telephony.inbound_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Inbound queue capacity must be greater than 0"));
        }
        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON document (used by `PUT /api/v1/config`).
    ///
    /// ## How it works:
    /// The current configuration is turned into a JSON tree, the partial document is merged
    /// over it key by key, and the result is deserialized and validated. Nothing changes
    /// unless the merged configuration is valid.
    ///
    /// ## Example:
    /// `{"telephony": {"mark_interval": 50}}` changes only the mark interval.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        if !partial.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, partial);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Recursively overlay `patch` onto `base`. Objects merge; everything else replaces.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}
