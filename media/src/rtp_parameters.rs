//! RTP parameter and capability types.
//!
//! The orchestrator forwards `rtpParameters` between clients and the worker mostly verbatim, so
//! codec `parameters`, header extensions, encodings and RTCP blobs stay dynamic JSON. Only the
//! fields the signaling plane actually inspects (kind, MIME type, clock rate, channels, payload
//! types) are typed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Media kind of a producer or consumer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// A codec a router (or a remote endpoint) is able to handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    /// e.g. "audio/opus" or "video/VP8".
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub rtcp_feedback: Vec<Value>,
}

/// RTP capabilities of a router or of a remote endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

/// A codec inside sending or receiving RTP parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub rtcp_feedback: Vec<Value>,
}

/// RTP parameters of a producer or consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    #[serde(default)]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

impl RtpCodecCapability {
    /// Whether this capability and the given codec describe the same codec.
    pub(crate) fn matches(&self, codec: &RtpCodecParameters) -> bool {
        self.mime_type.eq_ignore_ascii_case(&codec.mime_type)
            && self.clock_rate == codec.clock_rate
            && (self.kind != MediaKind::Audio
                || self.channels.unwrap_or(1) == codec.channels.unwrap_or(1))
    }

    pub(crate) fn matches_capability(&self, other: &RtpCodecCapability) -> bool {
        self.mime_type.eq_ignore_ascii_case(&other.mime_type)
            && self.clock_rate == other.clock_rate
            && (self.kind != MediaKind::Audio
                || self.channels.unwrap_or(1) == other.channels.unwrap_or(1))
    }
}
