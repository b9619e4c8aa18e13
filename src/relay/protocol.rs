//! # Telephony Media-Stream Protocol
//!
//! JSON messages exchanged with the telephony side over the `/media` WebSocket.
//! One JSON object per text frame, discriminated by its `event` field.
//!
//! ## Inbound (telephony → relay):
//! ```json
//! {"event":"connected"}
//! {"event":"start","streamSid":"MZ..."}
//! {"event":"media","media":{"payload":"<base64 mu-law>"}}
//! {"event":"mark","mark":{"name":"101"}}
//! {"event":"stop"}
//! ```
//!
//! ## Outbound (relay → telephony):
//! ```json
//! {"event":"media","streamSid":"MZ...","media":{"payload":"<base64 mu-law>"}}
//! {"event":"mark","streamSid":"MZ...","mark":{"name":"101"}}
//! ```
//!
//! Extra fields the telephony provider adds (sequence numbers, tracks, call metadata)
//! are accepted and ignored unless listed below.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Problems with an inbound frame. All of them are logged and the frame is dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("media payload is not valid base64: {0}")]
    Payload(#[from] base64::DecodeError),
}

/// Audio format announced in a `start` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

impl MediaFormat {
    /// Whether the announced encoding is mu-law. A missing encoding counts as mu-law.
    pub fn is_mulaw(&self) -> bool {
        match self.encoding.as_deref() {
            None => true,
            Some(encoding) => {
                let encoding = encoding.to_ascii_lowercase();
                encoding.contains("mulaw") || encoding.contains("ulaw") || encoding.contains("pcmu")
            }
        }
    }
}

/// Metadata object some providers nest inside `start`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    pub stream_sid: Option<String>,
    pub call_sid: Option<String>,
    pub media_format: Option<MediaFormat>,
}

/// `media` body of an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded mu-law bytes
    pub payload: String,
}

impl MediaPayload {
    /// Base64-decode the payload into raw mu-law bytes.
    pub fn decode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(BASE64.decode(self.payload.as_bytes())?)
    }
}

/// `mark` body, shared by both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

/// An event received from the telephony side.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundEvent {
    /// The telephony side opened the stream
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },
    /// The call leg started; carries the stream identifier
    Start {
        #[serde(default, rename = "streamSid")]
        stream_sid: Option<String>,
        #[serde(default)]
        start: Option<StartMetadata>,
    },
    /// A chunk of caller audio
    Media { media: MediaPayload },
    /// Acknowledgment of a mark we sent earlier
    Mark { mark: MarkPayload },
    /// The call leg ended
    Stop {
        #[serde(default, rename = "streamSid")]
        stream_sid: Option<String>,
    },
    /// Any event this relay does not act on (dtmf, clear, ...)
    #[serde(other)]
    Unknown,
}

impl InboundEvent {
    /// Parse one text frame.
    ///
    /// ## Validation:
    /// Beyond JSON shape, a `start` event must carry a stream identifier either at the top
    /// level or inside its `start` object.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let event: InboundEvent = serde_json::from_str(text)?;
        if let InboundEvent::Start { .. } = &event {
            if event.start_stream_sid().is_none() {
                return Err(ProtocolError::MissingField("streamSid"));
            }
        }
        Ok(event)
    }

    /// The stream identifier of a `start` event.
    pub fn start_stream_sid(&self) -> Option<&str> {
        match self {
            InboundEvent::Start { stream_sid, start } => stream_sid
                .as_deref()
                .or_else(|| start.as_ref().and_then(|s| s.stream_sid.as_deref()))
                .filter(|sid| !sid.is_empty()),
            _ => None,
        }
    }

    /// Metadata object of a `start` event, if the provider sent one.
    pub fn start_metadata(&self) -> Option<&StartMetadata> {
        match self {
            InboundEvent::Start { start, .. } => start.as_ref(),
            _ => None,
        }
    }

    /// Event name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Connected { .. } => "connected",
            InboundEvent::Start { .. } => "start",
            InboundEvent::Media { .. } => "media",
            InboundEvent::Mark { .. } => "mark",
            InboundEvent::Stop { .. } => "stop",
            InboundEvent::Unknown => "unknown",
        }
    }
}

/// Just the discriminator of a frame, for routing before the full parse.
#[derive(Deserialize)]
struct EventName {
    event: Option<String>,
}

/// Whether a text frame is a `media` event. Anything else, including frames that do not
/// parse, counts as a control frame.
pub fn is_media_frame(text: &str) -> bool {
    serde_json::from_str::<EventName>(text)
        .map(|frame| frame.event.as_deref() == Some("media"))
        .unwrap_or(false)
}

/// `media` body of an outbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

/// An event sent to the telephony side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundEvent {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
}

impl OutboundEvent {
    /// A `media` event carrying `mulaw` bytes, base64-encoded.
    pub fn media(stream_sid: &str, mulaw: &[u8]) -> Self {
        OutboundEvent::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia {
                payload: BASE64.encode(mulaw),
            },
        }
    }

    pub fn mark(stream_sid: &str, name: &str) -> Self {
        OutboundEvent::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkPayload {
                name: name.to_string(),
            },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connected_and_stop() {
        assert!(matches!(
            InboundEvent::parse(r#"{"event":"connected"}"#).unwrap(),
            InboundEvent::Connected { .. }
        ));
        assert!(matches!(
            InboundEvent::parse(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#).unwrap(),
            InboundEvent::Connected { protocol: Some(_), .. }
        ));
        assert!(matches!(
            InboundEvent::parse(r#"{"event":"stop","streamSid":"SID1","stop":{"callSid":"CA1"}}"#).unwrap(),
            InboundEvent::Stop { .. }
        ));
    }

    #[test]
    fn test_parse_start_stream_sid_locations() {
        let top = InboundEvent::parse(r#"{"event":"start","streamSid":"SID1"}"#).unwrap();
        assert_eq!(top.start_stream_sid(), Some("SID1"));

        let nested = InboundEvent::parse(
            r#"{"event":"start","start":{"streamSid":"SID2","callSid":"CA1","mediaFormat":{"encoding":"audio/x-mulaw","sampleRate":8000,"channels":1}}}"#,
        )
        .unwrap();
        assert_eq!(nested.start_stream_sid(), Some("SID2"));
        if let InboundEvent::Start { start: Some(meta), .. } = nested {
            assert_eq!(meta.media_format.unwrap().sample_rate, Some(8000));
        } else {
            panic!("expected start event");
        }
    }

    #[test]
    fn test_media_format_encoding() {
        let start = InboundEvent::parse(
            r#"{"event":"start","streamSid":"SID1","start":{"callSid":"CA1","mediaFormat":{"encoding":"audio/x-mulaw","sampleRate":16000}}}"#,
        )
        .unwrap();
        let meta = start.start_metadata().unwrap();
        assert_eq!(meta.call_sid.as_deref(), Some("CA1"));
        assert!(meta.media_format.as_ref().unwrap().is_mulaw());

        let alaw = MediaFormat {
            encoding: Some("audio/x-alaw".to_string()),
            sample_rate: Some(8000),
            channels: Some(1),
        };
        assert!(!alaw.is_mulaw());
        assert!(InboundEvent::parse(r#"{"event":"stop"}"#).unwrap().start_metadata().is_none());
    }

    #[test]
    fn test_media_frame_detection() {
        assert!(is_media_frame(r#"{"event":"media","media":{"payload":"AA=="}}"#));
        assert!(is_media_frame(r#"{"sequenceNumber":"3","event":"media","media":{"payload":""}}"#));
        assert!(!is_media_frame(r#"{"event":"stop"}"#));
        assert!(!is_media_frame(r#"{"event":"mark","mark":{"name":"media"}}"#));
        assert!(!is_media_frame("not json"));
    }

    #[test]
    fn test_start_without_stream_sid_is_malformed() {
        assert!(matches!(
            InboundEvent::parse(r#"{"event":"start"}"#),
            Err(ProtocolError::MissingField("streamSid"))
        ));
        assert!(matches!(
            InboundEvent::parse(r#"{"event":"start","streamSid":""}"#),
            Err(ProtocolError::MissingField("streamSid"))
        ));
    }

    #[test]
    fn test_parse_media_and_decode() {
        let event = InboundEvent::parse(r#"{"event":"media","media":{"payload":"//8=","track":"inbound"}}"#).unwrap();
        match event {
            InboundEvent::Media { media } => assert_eq!(media.decode().unwrap(), vec![0xFF, 0xFF]),
            other => panic!("unexpected event {:?}", other),
        }

        let bad = MediaPayload {
            payload: "not base64!".to_string(),
        };
        assert!(matches!(bad.decode(), Err(ProtocolError::Payload(_))));
    }

    #[test]
    fn test_parse_mark() {
        let event = InboundEvent::parse(r#"{"event":"mark","streamSid":"SID1","mark":{"name":"101"}}"#).unwrap();
        assert_eq!(
            event,
            InboundEvent::Mark {
                mark: MarkPayload {
                    name: "101".to_string()
                }
            }
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(InboundEvent::parse("not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(InboundEvent::parse(r#"{"media":{}}"#), Err(ProtocolError::Json(_))));
        assert!(matches!(InboundEvent::parse(r#"{"event":"media"}"#), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_unknown_event_is_tolerated() {
        assert_eq!(
            InboundEvent::parse(r#"{"event":"dtmf","dtmf":{"digit":"1"}}"#).unwrap(),
            InboundEvent::Unknown
        );
    }

    #[test]
    fn test_outbound_serialization() {
        let media = OutboundEvent::media("SID1", &[0xFF, 0xFF]).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&media).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "SID1");
        assert_eq!(value["media"]["payload"], "//8=");

        let mark = OutboundEvent::mark("SID1", "101").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&mark).unwrap();
        assert_eq!(value["event"], "mark");
        assert_eq!(value["mark"]["name"], "101");
    }
}
