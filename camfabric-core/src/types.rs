//! Core identifiers and data-model records for the ingest fabric

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable external identifier of a mobile device
///
/// Chosen by the mobile client and opaque to the fabric. A device identity
/// outlives any single signaling session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a device id from any string-like value
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id carries no characters
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random id
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id! {
    /// Transient identity of one open signaling channel
    SessionId
}
uuid_id! {
    /// Identity of a transport held by the SFU worker
    TransportId
}
uuid_id! {
    /// Identity of an ingested media track
    ProducerId
}
uuid_id! {
    /// Identity of an outbound media forwarding
    ConsumerId
}

/// Router-chosen publishable identity of a video producer
///
/// Formatted as `stream-<transportId>-<epochMs>` so the id is stable across
/// producer replacements on the same client transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub String);

impl StreamId {
    /// Derive the stream id for a client transport at a given instant
    pub fn for_transport(transport: TransportId, at: DateTime<Utc>) -> Self {
        Self(format!("stream-{}-{}", transport, at.timestamp_millis()))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Application data attached to a transport or producer
///
/// Carries the owning device id once the initiating session has completed
/// device registration; bound lazily on first produce otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppData {
    /// Owning device, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<DeviceId>,
}

impl AppData {
    /// App data owned by a known device
    pub fn for_device(device: DeviceId) -> Self {
        Self {
            client_id: Some(device),
        }
    }
}

/// Nominal video geometry of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl Resolution {
    /// Scale down by an encoder factor, flooring each dimension
    pub fn scaled_down_by(self, factor: f64) -> Self {
        if factor <= 1.0 {
            return self;
        }
        Self {
            width: (f64::from(self.width) / factor).floor() as u32,
            height: (f64::from(self.height) / factor).floor() as u32,
        }
    }
}

/// Operator-visible record of a publishable video stream
///
/// Exactly one stream exists per live video producer; audio producers never
/// yield a stream record. The record is updated in place when a producer is
/// replaced on the same client transport, preserving the id and any
/// operator-assigned name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    /// Router-chosen stream id
    pub id: StreamId,
    /// Producer currently feeding the stream
    pub producer_id: ProducerId,
    /// Client transport the producer is bound to
    pub transport_id: TransportId,
    /// Owning device
    pub device_id: DeviceId,
    /// Device display name at synthesis time
    pub device_name: String,
    /// Operator override, preserved across producer replacement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    /// Nominal geometry
    pub resolution: Resolution,
    /// Nominal frame rate
    pub fps: u32,
    /// Nominal bitrate in bits per second
    pub bitrate: u32,
    /// Synthesis instant
    pub created_at: DateTime<Utc>,
}

impl StreamInfo {
    /// Name shown to operators: the override if one was assigned, the device
    /// name otherwise
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.device_name)
    }
}

/// Point-in-time view of a registered device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    /// Stable external identifier
    pub device_id: DeviceId,
    /// Human-readable name, if the client provided one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Currently-bound signaling session, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Whether a signaling channel is currently bound
    pub connected: bool,
    /// Whether a video producer is currently attributed to the device
    pub streaming: bool,
    /// Current stream, while streaming
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    /// Last registry activity
    pub last_seen: DateTime<Utc>,
}
