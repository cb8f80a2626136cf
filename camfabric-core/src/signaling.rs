//! Signaling wire protocol
//!
//! The fabric speaks a message-oriented JSON protocol over a duplex channel:
//! requests carry a numeric correlation id and a kebab-case `type` tag,
//! replies echo the id with either an `ok` payload or a case-stable `error`
//! label, and lifecycle broadcasts are pushed on the same channel under an
//! `event` tag. The TLS/WebSocket server binding these records to sockets
//! lives outside this crate.

use crate::rtp::{RtpCapabilities, RtpParameters};
use crate::transport::{DtlsParameters, IceCandidate, IceParameters};
use crate::types::{
    ConsumerId, DeviceId, MediaKind, ProducerId, StreamId, StreamInfo, TransportId,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

/// Error labels surfaced across the signaling boundary
///
/// The serialized form of each variant is its exact name; clients and the
/// bridge match on these strings, so they are part of the wire contract.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Request arrived before the routing context was ready
    #[error("router is not initialized")]
    NotInitialized,

    /// `register-device` without a device id
    #[error("device id is missing")]
    MissingDeviceId,

    /// Request out of the legal per-session order
    #[error("request violates the session protocol order")]
    ProtocolOrder,

    /// Transport id not owned by the session
    #[error("unknown transport")]
    UnknownTransport,

    /// Producer not found or already closed
    #[error("unknown producer")]
    UnknownProducer,

    /// Stream not found
    #[error("unknown stream")]
    UnknownStream,

    /// Consumer capability set cannot decode the producer
    #[error("unsupported capabilities")]
    UnsupportedCapabilities,

    /// The SFU worker rejected the RTP parameters
    #[error("produce failed")]
    ProduceFailed,

    /// The egress port pool is drained
    #[error("egress ports exhausted")]
    EgressPortsExhausted,

    /// Producer closed while the request was in flight
    #[error("producer closed")]
    ProducerClosed,
}

/// A client request with its correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id echoed in the reply
    pub id: u64,
    /// The request body
    #[serde(flatten)]
    pub request: SignalingRequest,
}

/// Requests understood by a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingRequest {
    /// Bind this session to a device identity
    #[serde(rename_all = "camelCase")]
    RegisterDevice {
        /// Stable device identifier chosen by the client
        #[serde(default)]
        device_id: Option<String>,
        /// Optional human-readable name
        #[serde(default)]
        device_name: Option<String>,
    },
    /// Fetch the router's RTP capability descriptor
    GetRtpCapabilities,
    /// Open the send-side client transport
    CreateTransport,
    /// Provide DTLS parameters for the send transport
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        /// Transport being connected
        transport_id: TransportId,
        /// Client DTLS role and fingerprints
        dtls_parameters: DtlsParameters,
    },
    /// Bind a producer to the connected send transport
    #[serde(rename_all = "camelCase")]
    Produce {
        /// Transport carrying the track
        transport_id: TransportId,
        /// Track kind
        kind: MediaKind,
        /// Negotiated send parameters
        rtp_parameters: RtpParameters,
    },
    /// Open a receive-side client transport for monitoring
    CreateRecvTransport,
    /// Provide DTLS parameters for a receive transport
    #[serde(rename_all = "camelCase")]
    ConnectRecvTransport {
        /// Transport being connected
        transport_id: TransportId,
        /// Client DTLS role and fingerprints
        dtls_parameters: DtlsParameters,
    },
    /// Start forwarding a producer onto a receive transport
    #[serde(rename_all = "camelCase")]
    ConsumeStream {
        /// Receive transport to bind the consumer on
        transport_id: TransportId,
        /// Producer to forward
        producer_id: ProducerId,
        /// The consumer's capability set
        rtp_capabilities: RtpCapabilities,
    },
    /// Unpause a consumer created by `consume-stream`
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        /// Consumer to resume
        consumer_id: ConsumerId,
    },
    /// Mark this session's device as no longer streaming (advisory only;
    /// the producer keeps running until its transport closes)
    StopStream,
    /// Operator request to tear down a stream's producer
    #[serde(rename_all = "camelCase")]
    DisconnectStream {
        /// Stream to tear down
        stream_id: StreamId,
    },
    /// Operator rename of a stream
    #[serde(rename_all = "camelCase")]
    UpdateStreamName {
        /// Stream to rename
        stream_id: StreamId,
        /// New display name
        name: String,
    },
    /// List currently publishable streams
    GetActiveStreams,
    /// Sink request for a dedicated plain-RTP egress of one producer
    #[serde(rename_all = "camelCase")]
    NdiBridgeConsumeStream {
        /// Stream the sink is pulling
        stream_id: StreamId,
        /// Producer backing the stream
        producer_id: ProducerId,
        /// The sink's capability set (normally the router capabilities
        /// verbatim)
        rtp_capabilities: RtpCapabilities,
    },
}

/// A reply with its correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Correlation id of the request being answered
    pub id: u64,
    /// Outcome
    #[serde(flatten)]
    pub result: RequestResult,
}

/// Outcome of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestResult {
    /// The request succeeded
    Ok {
        /// Success payload
        ok: SignalingReply,
    },
    /// The request failed; session state is unchanged
    Err {
        /// Case-stable error label
        error: ErrorKind,
    },
}

impl From<Result<SignalingReply, ErrorKind>> for RequestResult {
    fn from(result: Result<SignalingReply, ErrorKind>) -> Self {
        match result {
            Ok(ok) => Self::Ok { ok },
            Err(error) => Self::Err { error },
        }
    }
}

/// Parameters a client needs to drive ICE/DTLS on a fresh transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreatedReply {
    /// Transport id for later `connect-transport` / `produce` calls
    pub id: TransportId,
    /// Local ICE parameters
    pub ice_parameters: IceParameters,
    /// Local ICE candidates
    pub ice_candidates: Vec<IceCandidate>,
    /// Local DTLS parameters
    pub dtls_parameters: DtlsParameters,
}

/// Reply to `consume-stream`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerReply {
    /// Consumer id
    pub id: ConsumerId,
    /// Producer being forwarded
    pub producer_id: ProducerId,
    /// Track kind
    pub kind: MediaKind,
    /// Parameters the consumer must decode
    pub rtp_parameters: RtpParameters,
}

/// Reply to `produce`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducedReply {
    /// Producer id
    pub id: ProducerId,
    /// Track kind
    pub kind: MediaKind,
}

/// The plain-RTP tuple a sink reads from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressTransportInfo {
    /// Egress transport id
    pub id: TransportId,
    /// Address the RTP is emitted from
    pub ip: IpAddr,
    /// RTP port
    pub port: u16,
    /// RTCP port (distinct; RTCP is not muxed at this boundary)
    pub rtcp_port: u16,
    /// Always `"udp"`
    pub protocol: String,
}

/// Stream details the sink uses to label its output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    /// Nominal width in pixels
    pub width: u32,
    /// Nominal height in pixels
    pub height: u32,
    /// Nominal frame rate
    pub fps: u32,
    /// Display name of the owning device
    pub device_name: String,
}

/// Reply to `ndi-bridge-consume-stream`
///
/// The tuple is stable for the lifetime of the binding; repeating the
/// request returns this same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressConsumeReply {
    /// Consumer id on the egress transport
    pub consumer_id: ConsumerId,
    /// Where to read the RTP/RTCP
    pub transport: EgressTransportInfo,
    /// Parameters matching the emitted RTP byte-for-byte
    pub rtp_parameters: RtpParameters,
    /// Stream labeling details
    pub stream_metadata: StreamMetadata,
}

/// Success payloads
///
/// Serialized untagged: the payload shape alone identifies the reply, and
/// each request type has exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalingReply {
    /// `create-transport` / `create-recv-transport`
    TransportCreated(TransportCreatedReply),
    /// `consume-stream`
    Consumer(ConsumerReply),
    /// `produce`
    Produced(ProducedReply),
    /// `ndi-bridge-consume-stream`
    Egress(EgressConsumeReply),
    /// `get-rtp-capabilities`
    Capabilities(RtpCapabilities),
    /// `get-active-streams`
    Streams {
        /// Currently publishable streams
        streams: Vec<StreamInfo>,
    },
    /// Plain acknowledgement
    Ack {},
}

/// Lifecycle broadcasts pushed to every observer of the signaling fabric
///
/// For a single device these are delivered in the order the registry
/// committed the transitions. A repeated `stream-started` for a known stream
/// id signals a producer replacement on the same transport; observers treat
/// it as a refresh of the existing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum FabricEvent {
    /// A device registered on a session
    #[serde(rename_all = "camelCase")]
    DeviceConnected {
        /// The device
        device_id: DeviceId,
        /// Name supplied at registration, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
    },
    /// A device's session closed; the removal grace window begins
    #[serde(rename_all = "camelCase")]
    DeviceDisconnected {
        /// The device
        device_id: DeviceId,
    },
    /// The grace window elapsed without re-registration
    #[serde(rename_all = "camelCase")]
    DeviceRemoved {
        /// The device
        device_id: DeviceId,
    },
    /// The device's streaming flag flipped
    #[serde(rename_all = "camelCase")]
    DeviceStreamingChanged {
        /// The device
        device_id: DeviceId,
        /// New flag value
        is_streaming: bool,
        /// Current stream while streaming
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_id: Option<StreamId>,
    },
    /// A video producer was bound and its stream record committed
    #[serde(rename_all = "camelCase")]
    StreamStarted {
        /// The stream record
        stream: StreamInfo,
    },
    /// A video producer closed and its stream record was removed
    #[serde(rename_all = "camelCase")]
    StreamEnded {
        /// The stream
        stream_id: StreamId,
    },
    /// An operator renamed a stream
    #[serde(rename_all = "camelCase")]
    StreamNameUpdated {
        /// The stream
        stream_id: StreamId,
        /// New display name
        name: String,
        /// The updated record
        stream: StreamInfo,
    },
}

impl FabricEvent {
    /// The device a broadcast concerns, when it concerns exactly one
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::DeviceConnected { device_id, .. }
            | Self::DeviceDisconnected { device_id }
            | Self::DeviceRemoved { device_id }
            | Self::DeviceStreamingChanged { device_id, .. } => Some(device_id),
            Self::StreamStarted { stream } => Some(&stream.device_id),
            Self::StreamNameUpdated { stream, .. } => Some(&stream.device_id),
            Self::StreamEnded { .. } => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn error_labels_are_case_stable() {
        let cases = [
            (ErrorKind::NotInitialized, "NotInitialized"),
            (ErrorKind::MissingDeviceId, "MissingDeviceId"),
            (ErrorKind::ProtocolOrder, "ProtocolOrder"),
            (ErrorKind::UnknownTransport, "UnknownTransport"),
            (ErrorKind::UnknownProducer, "UnknownProducer"),
            (ErrorKind::UnknownStream, "UnknownStream"),
            (ErrorKind::UnsupportedCapabilities, "UnsupportedCapabilities"),
            (ErrorKind::ProduceFailed, "ProduceFailed"),
            (ErrorKind::EgressPortsExhausted, "EgressPortsExhausted"),
            (ErrorKind::ProducerClosed, "ProducerClosed"),
        ];
        for (kind, label) in cases {
            assert_eq!(
                serde_json::to_string(&kind).unwrap(),
                format!("\"{label}\"")
            );
        }
    }

    #[test]
    fn requests_parse_from_kebab_case_tags() {
        let request: RequestEnvelope = serde_json::from_str(
            r#"{"id":3,"type":"register-device","deviceId":"dev-A","deviceName":"Pixel 8"}"#,
        )
        .unwrap();
        assert_eq!(request.id, 3);
        assert_eq!(
            request.request,
            SignalingRequest::RegisterDevice {
                device_id: Some("dev-A".to_string()),
                device_name: Some("Pixel 8".to_string()),
            }
        );

        let request: RequestEnvelope =
            serde_json::from_str(r#"{"id":4,"type":"get-active-streams"}"#).unwrap();
        assert_eq!(request.request, SignalingRequest::GetActiveStreams);
    }

    #[test]
    fn bridge_request_tag_matches_the_sink_protocol() {
        let json = serde_json::to_value(RequestEnvelope {
            id: 9,
            request: SignalingRequest::NdiBridgeConsumeStream {
                stream_id: StreamId::from("stream-t-1"),
                producer_id: ProducerId::new(),
                rtp_capabilities: RtpCapabilities::default(),
            },
        })
        .unwrap();
        assert_eq!(json["type"], "ndi-bridge-consume-stream");
        assert_eq!(json["streamId"], "stream-t-1");
    }

    #[test]
    fn error_reply_shape() {
        let reply = ReplyEnvelope {
            id: 11,
            result: RequestResult::from(Err(ErrorKind::ProtocolOrder)),
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["id"], 11);
        assert_eq!(json["error"], "ProtocolOrder");
        assert!(json.get("ok").is_none());
    }

    #[test]
    fn ack_reply_round_trips() {
        let reply = ReplyEnvelope {
            id: 12,
            result: RequestResult::from(Ok(SignalingReply::Ack {})),
        };
        let json = serde_json::to_string(&reply).unwrap();
        let parsed: ReplyEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, reply);
    }

    #[test]
    fn event_tags_are_kebab_case() {
        let event = FabricEvent::DeviceStreamingChanged {
            device_id: DeviceId::from("dev-A"),
            is_streaming: true,
            stream_id: Some(StreamId::from("stream-t-1")),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "device-streaming-changed");
        assert_eq!(json["deviceId"], "dev-A");
        assert_eq!(json["isStreaming"], true);
    }
}
