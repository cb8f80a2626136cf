//! Injected configuration for the ingest fabric
//!
//! Everything here arrives from the embedding process (environment loading
//! itself is the embedder's concern): announced addresses, the two disjoint
//! UDP port ranges, the supported codec set, and the device-removal grace
//! window.

use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A port range is inverted or empty
    #[error("port range {0}-{1} is empty")]
    EmptyPortRange(u16, u16),

    /// The WebRTC and egress pools overlap
    #[error("webrtc port range and egress port range overlap")]
    OverlappingPortRanges,

    /// No codecs configured
    #[error("codec list is empty")]
    NoCodecs,
}

/// An inclusive UDP port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRange {
    /// First port in the range
    pub min: u16,
    /// Last port in the range
    pub max: u16,
}

impl PortRange {
    /// Create a range; `min` and `max` are inclusive
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    /// Number of ports covered
    pub fn len(&self) -> usize {
        if self.max < self.min {
            0
        } else {
            usize::from(self.max - self.min) + 1
        }
    }

    /// Whether the range covers no ports
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether two ranges share any port
    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}

/// One codec the fabric accepts from producers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecSpec {
    /// Track kind
    pub kind: MediaKind,
    /// Full mime type, e.g. `video/VP8`
    pub mime_type: String,
    /// RTP clock rate
    pub clock_rate: u32,
    /// Channel count, audio only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// Codec-specific format parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl CodecSpec {
    fn audio(mime_type: &str, clock_rate: u32, channels: u8) -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: mime_type.to_string(),
            clock_rate,
            channels: Some(channels),
            parameters: BTreeMap::new(),
        }
    }

    fn video(mime_type: &str) -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: mime_type.to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::new(),
        }
    }

    /// The opus/VP8/VP9/H264-baseline set accepted by default
    pub fn default_set() -> Vec<Self> {
        let mut h264 = Self::video("video/H264");
        h264.parameters.insert(
            "packetization-mode".to_string(),
            serde_json::Value::from(1),
        );
        h264.parameters.insert(
            "profile-level-id".to_string(),
            serde_json::Value::from("42e01f"),
        );
        h264.parameters.insert(
            "level-asymmetry-allowed".to_string(),
            serde_json::Value::from(1),
        );
        vec![
            Self::audio("audio/opus", 48_000, 2),
            Self::video("video/VP8"),
            Self::video("video/VP9"),
            h264,
        ]
    }
}

/// Plain-RTP egress settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressConfig {
    /// Address the egress transports bind on
    pub listen_ip: IpAddr,
    /// Address reported to the sink in consume replies
    pub announced_ip: IpAddr,
    /// Dedicated UDP pool, disjoint from the WebRTC range
    pub port_range: PortRange,
    /// Let the sink's first RTCP packet teach the transport its remote tuple
    pub comedia: bool,
    /// Whether RTP and RTCP share one port at this boundary
    pub rtcp_mux: bool,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_range: PortRange::new(20_000, 20_100),
            comedia: true,
            rtcp_mux: false,
        }
    }
}

/// How to launch the SFU worker subprocess
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Path to the worker binary
    pub binary: PathBuf,
    /// Worker log level forwarded on the command line
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("sfu-worker"),
            log_level: "warn".to_string(),
        }
    }
}

/// Top-level fabric configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FabricConfig {
    /// Address client transports bind on
    pub listen_ip: IpAddr,
    /// Public address announced in ICE candidates
    pub announced_ip: IpAddr,
    /// Host the signaling server binds on (consumed by the embedder)
    pub signaling_host: String,
    /// UDP range for WebRTC client transports
    pub webrtc_ports: PortRange,
    /// Plain-RTP egress settings
    pub egress: EgressConfig,
    /// Codec set accepted from producers
    pub codecs: Vec<CodecSpec>,
    /// Initial outgoing bitrate configured on client transports
    pub initial_outgoing_bitrate: u32,
    /// Inbound bitrate ceiling per client transport
    pub max_incoming_bitrate: u32,
    /// Delay between device disconnect and removal
    pub grace_window: Duration,
    /// Worker subprocess settings
    pub worker: WorkerConfig,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            signaling_host: "0.0.0.0".to_string(),
            webrtc_ports: PortRange::new(40_000, 49_999),
            egress: EgressConfig::default(),
            codecs: CodecSpec::default_set(),
            initial_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: 1_500_000,
            grace_window: Duration::from_secs(30),
            worker: WorkerConfig::default(),
        }
    }
}

impl FabricConfig {
    /// Check structural soundness of the configuration
    ///
    /// # Errors
    ///
    /// Returns an error for empty port ranges, overlapping WebRTC/egress
    /// pools, or an empty codec list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.webrtc_ports.is_empty() {
            return Err(ConfigError::EmptyPortRange(
                self.webrtc_ports.min,
                self.webrtc_ports.max,
            ));
        }
        if self.egress.port_range.is_empty() {
            return Err(ConfigError::EmptyPortRange(
                self.egress.port_range.min,
                self.egress.port_range.max,
            ));
        }
        if self.webrtc_ports.overlaps(&self.egress.port_range) {
            return Err(ConfigError::OverlappingPortRanges);
        }
        if self.codecs.is_empty() {
            return Err(ConfigError::NoCodecs);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        FabricConfig::default().validate().unwrap();
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let mut config = FabricConfig::default();
        config.egress.port_range = PortRange::new(40_500, 40_600);
        assert_eq!(
            config.validate(),
            Err(ConfigError::OverlappingPortRanges)
        );
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut config = FabricConfig::default();
        config.webrtc_ports = PortRange::new(5000, 4000);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyPortRange(5000, 4000))
        ));
    }

    #[test]
    fn default_codec_set_is_the_documented_baseline() {
        let mimes: Vec<String> = CodecSpec::default_set()
            .into_iter()
            .map(|c| c.mime_type)
            .collect();
        assert_eq!(mimes, ["audio/opus", "video/VP8", "video/VP9", "video/H264"]);
    }

    #[test]
    fn port_range_arithmetic() {
        let range = PortRange::new(20_000, 20_100);
        assert_eq!(range.len(), 101);
        assert!(range.overlaps(&PortRange::new(20_100, 20_200)));
        assert!(!range.overlaps(&PortRange::new(20_101, 20_200)));
    }
}
