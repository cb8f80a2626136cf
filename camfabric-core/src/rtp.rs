//! RTP capability and parameter descriptors
//!
//! These are the negotiation records exchanged over signaling and handed to
//! the SFU worker: what the routing context can receive, what a producer
//! actually sends, and what a consumer must decode. The synthesis functions
//! at the bottom compute the router capability set from the configured codec
//! list and derive consumer parameters from a producer, preserving payload
//! types and clock rates so plain-RTP egress stays bit-exact.

use crate::config::CodecSpec;
use crate::types::{ConsumerId, MediaKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// First dynamic payload type handed to router capability codecs
const DYNAMIC_PAYLOAD_TYPE_BASE: u8 = 100;

/// Errors from parameter validation and synthesis
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtpError {
    /// Producer parameters carry no codec the router supports
    #[error("no codec in the offered parameters is supported by the router")]
    UnsupportedProducerCodec,

    /// Consumer capability set cannot decode the producer
    #[error("capability set cannot decode producer codec {0}")]
    IncompatibleCapabilities(String),

    /// Parameters are structurally unusable
    #[error("invalid rtp parameters: {0}")]
    InvalidParameters(String),
}

/// RTCP feedback mechanism advertised for a codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpFeedback {
    /// Feedback type, e.g. `nack` or `goog-remb`
    #[serde(rename = "type")]
    pub kind: String,
    /// Feedback sub-parameter, e.g. `pli`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

impl RtcpFeedback {
    fn new(kind: &str, parameter: Option<&str>) -> Self {
        Self {
            kind: kind.to_string(),
            parameter: parameter.map(str::to_string),
        }
    }
}

/// One codec the routing context can receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    /// Track kind the codec applies to
    pub kind: MediaKind,
    /// Full mime type, e.g. `video/VP8`
    pub mime_type: String,
    /// Payload type the router prefers for this codec
    pub preferred_payload_type: u8,
    /// RTP clock rate
    pub clock_rate: u32,
    /// Channel count, audio only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// Codec-specific format parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Supported RTCP feedback mechanisms
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// A header extension the routing context understands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    /// Track kind the extension applies to
    pub kind: MediaKind,
    /// Extension URI
    pub uri: String,
    /// Identifier the router prefers
    pub preferred_id: u8,
}

/// The routing context's receive capability descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    /// Receivable codecs
    pub codecs: Vec<RtpCodecCapability>,
    /// Understood header extensions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

impl RtpCapabilities {
    /// Find the capability entry matching a mime type and clock rate
    pub fn find_codec(&self, mime_type: &str, clock_rate: u32) -> Option<&RtpCodecCapability> {
        self.codecs
            .iter()
            .find(|c| c.mime_type.eq_ignore_ascii_case(mime_type) && c.clock_rate == clock_rate)
    }
}

/// One codec within negotiated send/receive parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    /// Full mime type
    pub mime_type: String,
    /// Payload type on the wire
    pub payload_type: u8,
    /// RTP clock rate
    pub clock_rate: u32,
    /// Channel count, audio only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// Codec-specific format parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Negotiated RTCP feedback
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    /// Track kind derived from the mime type prefix
    pub fn kind(&self) -> Option<MediaKind> {
        let prefix = self.mime_type.split('/').next()?;
        match prefix.to_ascii_lowercase().as_str() {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// A negotiated header extension mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtensionParameters {
    /// Extension URI
    pub uri: String,
    /// Identifier on the wire
    pub id: u8,
}

/// One encoding (RTP stream) within parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    /// Synchronization source of the stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    /// RID, when the client uses rid-based simulcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    /// Down-scale factor the encoder applies to the capture geometry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_resolution_down_by: Option<f64>,
    /// Encoder bitrate ceiling in bits per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
}

/// RTCP session parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    /// Canonical name of the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    /// Whether reduced-size RTCP is in use
    #[serde(default)]
    pub reduced_size: bool,
}

/// Negotiated RTP parameters of a producer or consumer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    /// Media section identifier, when the client supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    /// Codecs in preference order
    pub codecs: Vec<RtpCodecParameters>,
    /// Header extension mappings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    /// Encodings (one per RTP stream)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encodings: Vec<RtpEncodingParameters>,
    /// RTCP session parameters
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    /// The leading codec, which drives kind and forwarding decisions
    pub fn primary_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.first()
    }

    /// The first declared encoding, if any
    pub fn primary_encoding(&self) -> Option<&RtpEncodingParameters> {
        self.encodings.first()
    }
}

/// Compute the routing context's capability descriptor from the injected
/// codec set
///
/// Dynamic payload types are assigned sequentially from 100 in codec order,
/// so the descriptor is stable for a given configuration. Video codecs
/// advertise the feedback set the worker honors (nack, pli, remb); audio
/// codecs advertise transport-cc only.
pub fn router_capabilities(codecs: &[CodecSpec]) -> RtpCapabilities {
    let mut payload_type = DYNAMIC_PAYLOAD_TYPE_BASE;
    let mut out = Vec::with_capacity(codecs.len());
    for codec in codecs {
        let rtcp_feedback = match codec.kind {
            MediaKind::Audio => vec![RtcpFeedback::new("transport-cc", None)],
            MediaKind::Video => vec![
                RtcpFeedback::new("nack", None),
                RtcpFeedback::new("nack", Some("pli")),
                RtcpFeedback::new("ccm", Some("fir")),
                RtcpFeedback::new("goog-remb", None),
                RtcpFeedback::new("transport-cc", None),
            ],
        };
        out.push(RtpCodecCapability {
            kind: codec.kind,
            mime_type: codec.mime_type.clone(),
            preferred_payload_type: payload_type,
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            parameters: codec.parameters.clone(),
            rtcp_feedback,
        });
        payload_type = payload_type.saturating_add(1);
    }

    RtpCapabilities {
        codecs: out,
        header_extensions: vec![
            RtpHeaderExtension {
                kind: MediaKind::Audio,
                uri: "urn:ietf:params:rtp-hdrext:sdes:mid".to_string(),
                preferred_id: 1,
            },
            RtpHeaderExtension {
                kind: MediaKind::Video,
                uri: "urn:ietf:params:rtp-hdrext:sdes:mid".to_string(),
                preferred_id: 1,
            },
            RtpHeaderExtension {
                kind: MediaKind::Video,
                uri: "urn:3gpp:video-orientation".to_string(),
                preferred_id: 4,
            },
            RtpHeaderExtension {
                kind: MediaKind::Video,
                uri: "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time".to_string(),
                preferred_id: 5,
            },
        ],
    }
}

/// Check that producer parameters carry at least one codec the router can
/// receive
pub fn validate_producer_parameters(
    parameters: &RtpParameters,
    capabilities: &RtpCapabilities,
) -> Result<(), RtpError> {
    if parameters.codecs.is_empty() {
        return Err(RtpError::InvalidParameters("no codecs declared".to_string()));
    }
    let supported = parameters
        .codecs
        .iter()
        .any(|c| capabilities.find_codec(&c.mime_type, c.clock_rate).is_some());
    if supported {
        Ok(())
    } else {
        Err(RtpError::UnsupportedProducerCodec)
    }
}

/// Check that a consumer capability set can decode every codec the producer
/// sends
pub fn can_consume(
    producer: &RtpParameters,
    capabilities: &RtpCapabilities,
) -> Result<(), RtpError> {
    for codec in &producer.codecs {
        if capabilities
            .find_codec(&codec.mime_type, codec.clock_rate)
            .is_none()
        {
            return Err(RtpError::IncompatibleCapabilities(codec.mime_type.clone()));
        }
    }
    if producer.codecs.is_empty() {
        return Err(RtpError::InvalidParameters("no codecs declared".to_string()));
    }
    Ok(())
}

/// Synthesize the parameters a consumer must decode
///
/// Payload types and clock rates are taken from the producer verbatim; only
/// the encoding is replaced with a single stream under the consumer's SSRC.
/// Plain-RTP egress relies on this: the values in the reply match the bytes
/// on the wire.
pub fn consumer_parameters(
    producer: &RtpParameters,
    capabilities: &RtpCapabilities,
    consumer: ConsumerId,
) -> Result<RtpParameters, RtpError> {
    can_consume(producer, capabilities)?;
    Ok(RtpParameters {
        mid: None,
        codecs: producer.codecs.clone(),
        header_extensions: producer.header_extensions.clone(),
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(consumer_ssrc(consumer)),
            ..RtpEncodingParameters::default()
        }],
        rtcp: RtcpParameters {
            cname: Some(format!("camfabric-{consumer}")),
            reduced_size: true,
        },
    })
}

/// SSRC of a consumer, derived from its id
///
/// Deterministic so a repeated egress request for the same binding reports
/// the same SSRC the sink is already decoding.
pub fn consumer_ssrc(consumer: ConsumerId) -> u32 {
    let bytes = consumer.0.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) | 1
}
