//! Wire protocol for the duplex connection.
//!
//! Client → server: `{"image_base64": "...", "audio_base64": "..."}` (legacy
//! clients send `image` / `audio`; when both spellings are present the
//! `*_base64` key wins).
//!
//! Server → client, per request: zero or more
//! `{"status":"processing","message":"..."}` followed by exactly one
//! `{"status":"success","video_base64":"..."}` or
//! `{"status":"error","error":"...","code":"..."}`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Errors raised while turning an inbound text message into payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The message was not a JSON object of the expected shape.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// A required field was absent or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    /// A field was present but not valid base64.
    #[error("field {field} is not valid base64: {reason}")]
    InvalidBase64 {
        /// Offending field name.
        field: &'static str,
        /// Decoder message.
        reason: String,
    },
}

/// A request exactly as it arrives on the wire.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InboundRequest {
    /// Base64 still image (JPEG/PNG/...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    /// Base64 audio clip (WAV/PCM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
    /// Legacy spelling of `image_base64`, used only when that is absent.
    #[serde(default, skip_serializing)]
    pub image: Option<String>,
    /// Legacy spelling of `audio_base64`, used only when that is absent.
    #[serde(default, skip_serializing)]
    pub audio: Option<String>,
}

/// Decoded request payloads, ready for staging.
#[derive(Clone, PartialEq, Eq)]
pub struct RequestPayloads {
    /// Raw image bytes.
    pub image: Vec<u8>,
    /// Raw audio bytes.
    pub audio: Vec<u8>,
}

impl std::fmt::Debug for RequestPayloads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPayloads")
            .field("image_bytes", &self.image.len())
            .field("audio_bytes", &self.audio.len())
            .finish()
    }
}

impl InboundRequest {
    /// Parse a raw text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    /// Check both fields are present and decode them.
    ///
    /// Presence is checked for both fields before any decoding happens, so a
    /// request missing `audio_base64` is rejected without touching the image.
    pub fn into_payloads(self) -> Result<RequestPayloads, ProtocolError> {
        let image = non_empty(self.image_base64)
            .or_else(|| non_empty(self.image))
            .ok_or(ProtocolError::MissingField("image_base64"))?;
        let audio = non_empty(self.audio_base64)
            .or_else(|| non_empty(self.audio))
            .ok_or(ProtocolError::MissingField("audio_base64"))?;

        Ok(RequestPayloads {
            image: decode_field("image_base64", &image)?,
            audio: decode_field("audio_base64", &audio)?,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Decode a base64 field, tolerating a `data:<mime>;base64,` prefix and
/// embedded whitespace.
fn decode_field(field: &'static str, value: &str) -> Result<Vec<u8>, ProtocolError> {
    let body = match value.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(rest, |(_, data)| data),
        None => value,
    };
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ProtocolError::InvalidBase64 {
            field,
            reason: e.to_string(),
        })?;
    if bytes.is_empty() {
        return Err(ProtocolError::MissingField(field));
    }
    Ok(bytes)
}

/// A frame sent from server to client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Frame {
    /// Interim status while a request is in flight.
    Processing {
        /// Human-readable progress text.
        message: String,
    },
    /// Terminal: the generated video.
    Success {
        /// Base64 encoded result file.
        video_base64: String,
    },
    /// Terminal: the request failed.
    Error {
        /// Human-readable message. Older revisions used `message`.
        #[serde(alias = "message")]
        error: String,
        /// Machine-readable error kind.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl Frame {
    /// Build a `processing` frame.
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing {
            message: message.into(),
        }
    }

    /// Build a `success` frame from raw result bytes.
    pub fn success(video: &[u8]) -> Self {
        Self::Success {
            video_base64: STANDARD.encode(video),
        }
    }

    /// Build an `error` frame.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
            code: Some(code.to_owned()),
        }
    }

    /// Whether this frame ends a request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing { .. })
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize frame");
            String::new()
        })
    }
}
