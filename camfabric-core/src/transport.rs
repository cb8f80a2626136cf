//! Transport creation and the egress port pool
//!
//! Wraps worker-level transport creation with project-wide defaults: client
//! transports inherit the configured listen/announced addresses and bitrate
//! settings, egress transports draw (RTP, RTCP) port pairs from a dedicated
//! pool that never overlaps the WebRTC range. Allocation either fully
//! succeeds or releases what it took.

use crate::config::{EgressConfig, FabricConfig, PortRange};
use crate::types::{AppData, ProducerId, SessionId, TransportId};
use crate::worker::{WebRtcTransportData, WorkerError, WorkerLink, WorkerRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Transport creation errors
#[derive(Error, Debug)]
pub enum FactoryError {
    /// The egress pool has no free port pair
    #[error("egress port pool exhausted")]
    PortsExhausted,

    /// The worker refused or the channel failed
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Local ICE parameters of a client transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    /// ICE username fragment
    pub username_fragment: String,
    /// ICE password
    pub password: String,
    /// Whether the router runs ICE-lite
    #[serde(default)]
    pub ice_lite: bool,
}

/// One local ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate foundation
    pub foundation: String,
    /// Candidate priority
    pub priority: u32,
    /// Candidate address (the announced public address)
    pub ip: IpAddr,
    /// Transport protocol, `udp` here
    pub protocol: String,
    /// Candidate port
    pub port: u16,
    /// Candidate type, `host` here
    #[serde(rename = "type")]
    pub kind: String,
}

/// DTLS role of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    /// Role decided by the handshake
    Auto,
    /// Endpoint acts as DTLS client
    Client,
    /// Endpoint acts as DTLS server
    Server,
}

/// One certificate fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsFingerprint {
    /// Hash algorithm, e.g. `sha-256`
    pub algorithm: String,
    /// Fingerprint value
    pub value: String,
}

/// DTLS parameters of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    /// Negotiated role
    pub role: DtlsRole,
    /// Certificate fingerprints
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// An allocated (RTP, RTCP) port pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortPair {
    /// RTP port
    pub rtp: u16,
    /// RTCP port
    pub rtcp: u16,
}

/// Pool of egress port pairs
///
/// Pairs are (even, even+1) steps across the configured range. Release
/// returns a pair to the back of the queue, so a freed tuple is not
/// immediately re-issued while the sink may still be draining it.
#[derive(Debug)]
pub struct PortPool {
    free: VecDeque<PortPair>,
    capacity: usize,
}

impl PortPool {
    /// Build the pool for a port range
    pub fn new(range: &PortRange) -> Self {
        let mut free = VecDeque::new();
        let mut port = range.min;
        while port < range.max {
            free.push_back(PortPair {
                rtp: port,
                rtcp: port + 1,
            });
            match port.checked_add(2) {
                Some(next) => port = next,
                None => break,
            }
        }
        let capacity = free.len();
        Self { free, capacity }
    }

    /// Take a pair, or `None` when the pool is drained
    pub fn allocate(&mut self) -> Option<PortPair> {
        self.free.pop_front()
    }

    /// Return a pair to the pool
    pub fn release(&mut self, pair: PortPair) {
        if self.free.len() < self.capacity {
            self.free.push_back(pair);
        }
    }

    /// Number of free pairs
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of pairs the range yields
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A live encrypted client transport
#[derive(Debug, Clone)]
pub struct ClientTransport {
    /// Transport id
    pub id: TransportId,
    /// Owning session
    pub session: SessionId,
    /// Owning device, once known
    pub app_data: AppData,
    /// ICE/DTLS data handed to the client
    pub connection: WebRtcTransportData,
    /// Whether `connect-transport` completed
    pub connected: bool,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

/// A live plain-RTP egress transport
#[derive(Debug, Clone)]
pub struct EgressTransport {
    /// Transport id
    pub id: TransportId,
    /// Address reported to the sink
    pub ip: IpAddr,
    /// RTP port
    pub port: u16,
    /// RTCP port
    pub rtcp_port: u16,
    /// The pool pair backing the tuple
    pub pair: PortPair,
    /// Producer this transport re-emits, once bound
    pub producer: Option<ProducerId>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

/// Creates transports with project-wide defaults
pub struct TransportFactory {
    worker: Arc<dyn WorkerLink>,
    listen_ip: IpAddr,
    announced_ip: IpAddr,
    webrtc_ports: PortRange,
    initial_outgoing_bitrate: u32,
    max_incoming_bitrate: u32,
    egress: EgressConfig,
    pool: Mutex<PortPool>,
}

impl TransportFactory {
    /// Build the factory from the fabric configuration
    pub fn new(config: &FabricConfig, worker: Arc<dyn WorkerLink>) -> Self {
        Self {
            worker,
            listen_ip: config.listen_ip,
            announced_ip: config.announced_ip,
            webrtc_ports: config.webrtc_ports,
            initial_outgoing_bitrate: config.initial_outgoing_bitrate,
            max_incoming_bitrate: config.max_incoming_bitrate,
            pool: Mutex::new(PortPool::new(&config.egress.port_range)),
            egress: config.egress.clone(),
        }
    }

    /// Create an encrypted client transport for a session
    ///
    /// `app_data.client_id` is populated when the session has already
    /// registered a device; otherwise it stays empty and is bound lazily on
    /// the first produce call.
    ///
    /// # Errors
    ///
    /// Propagates worker failures.
    pub async fn create_client_transport(
        &self,
        session: SessionId,
        app_data: AppData,
    ) -> Result<ClientTransport, FactoryError> {
        let id = TransportId::new();
        let connection = self
            .worker
            .request(WorkerRequest::CreateWebRtcTransport {
                transport_id: id,
                listen_ip: self.listen_ip,
                announced_ip: self.announced_ip,
                port_range: self.webrtc_ports,
                initial_outgoing_bitrate: self.initial_outgoing_bitrate,
                max_incoming_bitrate: self.max_incoming_bitrate,
            })
            .await?
            .into_webrtc_transport()?;

        debug!(transport_id = %id, session_id = %session, "client transport created");
        Ok(ClientTransport {
            id,
            session,
            app_data,
            connection,
            connected: false,
            created_at: Utc::now(),
        })
    }

    /// Create a plain-RTP egress transport on a fresh port pair
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::PortsExhausted`] when the pool is drained.
    /// Worker failures release the acquired pair before propagating.
    pub async fn create_egress_transport(&self) -> Result<EgressTransport, FactoryError> {
        let pair = self
            .pool
            .lock()
            .await
            .allocate()
            .ok_or(FactoryError::PortsExhausted)?;

        let id = TransportId::new();
        let rtcp_port = if self.egress.rtcp_mux {
            None
        } else {
            Some(pair.rtcp)
        };
        let result = self
            .worker
            .request(WorkerRequest::CreatePlainTransport {
                transport_id: id,
                listen_ip: self.egress.listen_ip,
                port: pair.rtp,
                rtcp_port,
                comedia: self.egress.comedia,
                rtcp_mux: self.egress.rtcp_mux,
            })
            .await
            .and_then(crate::worker::WorkerReply::into_plain_transport);

        let data = match result {
            Ok(data) => data,
            Err(e) => {
                self.pool.lock().await.release(pair);
                return Err(e.into());
            }
        };

        debug!(transport_id = %id, port = data.port, "egress transport created");
        Ok(EgressTransport {
            id,
            ip: self.egress.announced_ip,
            port: data.port,
            rtcp_port: data.rtcp_port.unwrap_or(data.port),
            pair,
            producer: None,
            created_at: Utc::now(),
        })
    }

    /// Return an egress pair to the pool once its transport is closed
    pub async fn release_egress_pair(&self, pair: PortPair) {
        debug!(rtp = pair.rtp, rtcp = pair.rtcp, "egress pair released");
        self.pool.lock().await.release(pair);
    }

    /// Number of free egress pairs
    pub async fn available_egress_pairs(&self) -> usize {
        self.pool.lock().await.available()
    }
}
