//! Capability negotiation helpers.
//!
//! Matching is reduced to codec identity (MIME type, clock rate, channels): the orchestrator
//! never rewrites encodings or header extensions, it only has to decide whether a remote
//! endpoint can receive a given producer and which codecs to offer it.

use serde_json::{json, Value};
use thiserror::Error;

use crate::rtp_parameters::{
    MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters,
};

const DYNAMIC_PAYLOAD_TYPES: std::ops::RangeInclusive<u8> = 100..=127;

#[derive(Debug, Eq, PartialEq, Error)]
pub enum RtpCapabilitiesError {
    #[error("media codec with invalid MIME type: {mime_type}")]
    InvalidMimeType { mime_type: String },
    #[error("duplicated preferred payload type {payload_type}")]
    DuplicatedPreferredPayloadType { payload_type: u8 },
    #[error("cannot allocate more dynamic payload types")]
    CannotAllocate,
}

/// Generate the RTP capabilities of a router from the configured media codecs.
pub(crate) fn generate_router_rtp_capabilities(
    media_codecs: Vec<RtpCodecCapability>,
) -> Result<RtpCapabilities, RtpCapabilitiesError> {
    let mut used_payload_types = media_codecs
        .iter()
        .filter_map(|codec| codec.preferred_payload_type)
        .collect::<Vec<u8>>();

    {
        let mut sorted = used_payload_types.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != used_payload_types.len() {
            let payload_type = used_payload_types
                .iter()
                .find(|pt| used_payload_types.iter().filter(|other| other == pt).count() > 1)
                .copied()
                .unwrap_or_default();
            return Err(RtpCapabilitiesError::DuplicatedPreferredPayloadType { payload_type });
        }
    }

    let initial_used_payload_types = used_payload_types.clone();
    let mut dynamic_payload_types =
        DYNAMIC_PAYLOAD_TYPES.filter(move |pt| !initial_used_payload_types.contains(pt));

    let mut codecs = Vec::with_capacity(media_codecs.len());
    for mut codec in media_codecs {
        let expected_prefix = match codec.kind {
            MediaKind::Audio => "audio/",
            MediaKind::Video => "video/",
        };
        if !codec
            .mime_type
            .to_ascii_lowercase()
            .starts_with(expected_prefix)
        {
            return Err(RtpCapabilitiesError::InvalidMimeType {
                mime_type: codec.mime_type,
            });
        }

        if codec.kind == MediaKind::Audio && codec.channels.is_none() {
            codec.channels = Some(1);
        }

        if codec.preferred_payload_type.is_none() {
            let payload_type = dynamic_payload_types
                .next()
                .ok_or(RtpCapabilitiesError::CannotAllocate)?;
            codec.preferred_payload_type = Some(payload_type);
            used_payload_types.push(payload_type);
        }

        codecs.push(codec);
    }

    Ok(RtpCapabilities {
        codecs,
        header_extensions: supported_header_extensions(),
    })
}

/// RTP parameters suitable for consuming the given producer, expressed with the router's
/// preferred payload types. The worker receives them verbatim at `transport.consume` time.
pub(crate) fn get_consumable_rtp_parameters(
    kind: MediaKind,
    rtp_parameters: &RtpParameters,
    router_rtp_capabilities: &RtpCapabilities,
) -> RtpParameters {
    let mut consumable = RtpParameters {
        mid: None,
        codecs: Vec::new(),
        header_extensions: rtp_parameters.header_extensions.clone(),
        encodings: rtp_parameters.encodings.clone(),
        rtcp: rtp_parameters.rtcp.clone(),
    };

    for codec in &rtp_parameters.codecs {
        let matched = router_rtp_capabilities
            .codecs
            .iter()
            .find(|capability| capability.kind == kind && capability.matches(codec));

        if let Some(capability) = matched {
            let mut consumable_codec = codec.clone();
            consumable_codec.payload_type = capability
                .preferred_payload_type
                .unwrap_or(codec.payload_type);
            consumable.codecs.push(consumable_codec);
        }
    }

    consumable
}

/// Whether an endpoint with the given capabilities can consume a producer with the given
/// consumable RTP parameters.
pub(crate) fn can_consume(
    consumable_rtp_parameters: &RtpParameters,
    rtp_capabilities: &RtpCapabilities,
) -> bool {
    consumable_rtp_parameters.codecs.iter().any(|codec| {
        rtp_capabilities
            .codecs
            .iter()
            .any(|capability| capability.matches(codec))
    })
}

/// RTP parameters for a consumer of the given producer: the consumable codecs the endpoint
/// supports, untouched encodings.
pub(crate) fn get_consumer_rtp_parameters(
    consumable_rtp_parameters: &RtpParameters,
    rtp_capabilities: &RtpCapabilities,
) -> RtpParameters {
    let mut consumer_parameters = consumable_rtp_parameters.clone();

    consumer_parameters.codecs.retain(|codec| {
        rtp_capabilities
            .codecs
            .iter()
            .any(|capability| capability.matches(codec))
    });

    consumer_parameters
}

fn supported_header_extensions() -> Vec<Value> {
    vec![
        json!({
            "kind": "audio",
            "uri": "urn:ietf:params:rtp-hdrext:sdes:mid",
            "preferredId": 1,
        }),
        json!({
            "kind": "video",
            "uri": "urn:ietf:params:rtp-hdrext:sdes:mid",
            "preferredId": 1,
        }),
        json!({
            "kind": "audio",
            "uri": "urn:ietf:params:rtp-hdrext:ssrc-audio-level",
            "preferredId": 10,
        }),
        json!({
            "kind": "video",
            "uri": "urn:3gpp:video-orientation",
            "preferredId": 11,
        }),
        json!({
            "kind": "video",
            "uri": "urn:ietf:params:rtp-hdrext:toffset",
            "preferredId": 12,
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp_parameters::RtpCodecParameters;

    fn audio_codec() -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Value::Null,
            rtcp_feedback: vec![],
        }
    }

    fn video_codec() -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: Value::Null,
            rtcp_feedback: vec![],
        }
    }

    fn video_rtp_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: Value::Null,
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
            encodings: vec![json!({ "ssrc": 1111 })],
            rtcp: None,
        }
    }

    #[test]
    fn generate_router_rtp_capabilities_assigns_payload_types() {
        let capabilities =
            generate_router_rtp_capabilities(vec![audio_codec(), video_codec()]).unwrap();

        let payload_types = capabilities
            .codecs
            .iter()
            .map(|codec| codec.preferred_payload_type.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(payload_types, vec![100, 101]);
        assert!(!capabilities.header_extensions.is_empty());
    }

    #[test]
    fn generate_router_rtp_capabilities_rejects_bad_mime_type() {
        let mut codec = audio_codec();
        codec.mime_type = "video/opus".to_string();

        assert!(matches!(
            generate_router_rtp_capabilities(vec![codec]),
            Err(RtpCapabilitiesError::InvalidMimeType { .. }),
        ));
    }

    #[test]
    fn generate_router_rtp_capabilities_rejects_duplicated_payload_type() {
        let mut first = audio_codec();
        first.preferred_payload_type = Some(111);
        let mut second = video_codec();
        second.preferred_payload_type = Some(111);

        assert_eq!(
            generate_router_rtp_capabilities(vec![first, second]),
            Err(RtpCapabilitiesError::DuplicatedPreferredPayloadType { payload_type: 111 }),
        );
    }

    #[test]
    fn consumable_parameters_use_router_payload_types() {
        let router_capabilities =
            generate_router_rtp_capabilities(vec![audio_codec(), video_codec()]).unwrap();

        let consumable = get_consumable_rtp_parameters(
            MediaKind::Video,
            &video_rtp_parameters(),
            &router_capabilities,
        );

        assert_eq!(consumable.codecs.len(), 1);
        assert_eq!(consumable.codecs[0].payload_type, 101);
        assert_eq!(consumable.encodings.len(), 1);
    }

    #[test]
    fn can_consume_matches_codec_identity() {
        let router_capabilities =
            generate_router_rtp_capabilities(vec![audio_codec(), video_codec()]).unwrap();
        let consumable = get_consumable_rtp_parameters(
            MediaKind::Video,
            &video_rtp_parameters(),
            &router_capabilities,
        );

        let good_endpoint = RtpCapabilities {
            codecs: vec![video_codec()],
            header_extensions: vec![],
        };
        assert!(can_consume(&consumable, &good_endpoint));

        let audio_only_endpoint = RtpCapabilities {
            codecs: vec![audio_codec()],
            header_extensions: vec![],
        };
        assert!(!can_consume(&consumable, &audio_only_endpoint));
    }

    #[test]
    fn consumer_parameters_filter_unsupported_codecs() {
        let router_capabilities =
            generate_router_rtp_capabilities(vec![audio_codec(), video_codec()]).unwrap();
        let consumable = get_consumable_rtp_parameters(
            MediaKind::Video,
            &video_rtp_parameters(),
            &router_capabilities,
        );

        let endpoint = RtpCapabilities {
            codecs: vec![video_codec()],
            header_extensions: vec![],
        };
        let consumer_parameters = get_consumer_rtp_parameters(&consumable, &endpoint);
        assert_eq!(consumer_parameters.codecs.len(), 1);

        let audio_only = RtpCapabilities {
            codecs: vec![audio_codec()],
            header_extensions: vec![],
        };
        let empty = get_consumer_rtp_parameters(&consumable, &audio_only);
        assert!(empty.codecs.is_empty());
    }
}
