//! SFU worker IPC
//!
//! The media plane lives in a separate worker subprocess; this module is the
//! message channel to it. Frames are newline-delimited JSON: requests carry a
//! numeric correlation id and a `method` tag, replies echo the id, and
//! unsolicited notification frames surface transport/producer closures
//! observed by the worker (ICE failures, kernel errors).
//!
//! [`WorkerLink`] is the seam the rest of the fabric talks through; tests
//! substitute an in-process implementation.

use crate::config::{CodecSpec, PortRange, WorkerConfig};
use crate::rtp::RtpParameters;
use crate::transport::{DtlsParameters, IceCandidate, IceParameters};
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, error, warn};

/// Notification fan-out depth; closures are rare and small
const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

/// Worker channel errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The worker could not be spawned
    #[error("failed to spawn worker: {0}")]
    Spawn(std::io::Error),

    /// Writing or reading the IPC pipe failed
    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker answered with an error
    #[error("worker rejected the request: {0}")]
    Rejected(String),

    /// The IPC channel is gone; the worker process died
    #[error("worker channel closed")]
    ChannelClosed,

    /// A frame could not be encoded or decoded
    #[error("worker protocol error: {0}")]
    Protocol(String),

    /// The reply did not match the request shape
    #[error("unexpected worker reply")]
    UnexpectedReply,
}

/// Requests the fabric issues to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum WorkerRequest {
    /// Create the routing context with the injected codec set
    #[serde(rename_all = "camelCase")]
    CreateRouter {
        /// Codecs the context accepts
        codecs: Vec<CodecSpec>,
    },
    /// Create an encrypted client transport
    #[serde(rename_all = "camelCase")]
    CreateWebRtcTransport {
        /// Id chosen by the fabric
        transport_id: TransportId,
        /// Bind address
        listen_ip: IpAddr,
        /// Address announced in ICE candidates
        announced_ip: IpAddr,
        /// ICE port range
        port_range: PortRange,
        /// Initial outgoing bitrate
        initial_outgoing_bitrate: u32,
        /// Inbound bitrate ceiling
        max_incoming_bitrate: u32,
    },
    /// Create a plain RTP/UDP transport on an allocated port pair
    #[serde(rename_all = "camelCase")]
    CreatePlainTransport {
        /// Id chosen by the fabric
        transport_id: TransportId,
        /// Bind address
        listen_ip: IpAddr,
        /// RTP port
        port: u16,
        /// RTCP port when not muxed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rtcp_port: Option<u16>,
        /// Learn the remote tuple from the first inbound RTCP packet
        comedia: bool,
        /// Whether RTP and RTCP share the RTP port
        rtcp_mux: bool,
    },
    /// Finish DTLS setup on a client transport
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        /// Transport being connected
        transport_id: TransportId,
        /// Remote DTLS parameters
        dtls_parameters: DtlsParameters,
    },
    /// Bind an inbound track to a client transport
    #[serde(rename_all = "camelCase")]
    Produce {
        /// Owning transport
        transport_id: TransportId,
        /// Id chosen by the fabric
        producer_id: ProducerId,
        /// Track kind
        kind: MediaKind,
        /// Negotiated send parameters
        rtp_parameters: RtpParameters,
    },
    /// Bind an outbound forwarding to a transport
    #[serde(rename_all = "camelCase")]
    Consume {
        /// Owning transport
        transport_id: TransportId,
        /// Id chosen by the fabric
        consumer_id: ConsumerId,
        /// Source producer
        producer_id: ProducerId,
        /// Parameters the consumer must decode
        rtp_parameters: RtpParameters,
    },
    /// Close a producer and everything consuming it
    #[serde(rename_all = "camelCase")]
    CloseProducer {
        /// Producer to close
        producer_id: ProducerId,
    },
    /// Close a transport and everything bound to it
    #[serde(rename_all = "camelCase")]
    CloseTransport {
        /// Transport to close
        transport_id: TransportId,
    },
}

/// Connection-plane data of a freshly created client transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportData {
    /// Local ICE parameters
    pub ice_parameters: IceParameters,
    /// Local ICE candidates
    pub ice_candidates: Vec<IceCandidate>,
    /// Local DTLS parameters
    pub dtls_parameters: DtlsParameters,
}

/// Tuple data of a freshly created plain transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportData {
    /// Bound address
    pub ip: IpAddr,
    /// RTP port
    pub port: u16,
    /// RTCP port when not muxed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp_port: Option<u16>,
}

/// Success payloads from the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerReply {
    /// Plain acknowledgement
    Ack,
    /// Reply to `createWebRtcTransport`
    WebRtcTransport(WebRtcTransportData),
    /// Reply to `createPlainTransport`
    PlainTransport(PlainTransportData),
}

impl WorkerReply {
    /// Expect a plain acknowledgement
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::UnexpectedReply`] for any other payload.
    pub fn expect_ack(self) -> Result<(), WorkerError> {
        match self {
            Self::Ack => Ok(()),
            _ => Err(WorkerError::UnexpectedReply),
        }
    }

    /// Expect client transport data
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::UnexpectedReply`] for any other payload.
    pub fn into_webrtc_transport(self) -> Result<WebRtcTransportData, WorkerError> {
        match self {
            Self::WebRtcTransport(data) => Ok(data),
            _ => Err(WorkerError::UnexpectedReply),
        }
    }

    /// Expect plain transport data
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::UnexpectedReply`] for any other payload.
    pub fn into_plain_transport(self) -> Result<PlainTransportData, WorkerError> {
        match self {
            Self::PlainTransport(data) => Ok(data),
            _ => Err(WorkerError::UnexpectedReply),
        }
    }
}

/// Unsolicited closure notifications from the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum WorkerNotification {
    /// A transport closed on the worker side (e.g. ICE failure)
    #[serde(rename_all = "camelCase")]
    TransportClosed {
        /// The transport
        transport_id: TransportId,
    },
    /// A producer closed on the worker side
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        /// The producer
        producer_id: ProducerId,
    },
    /// The IPC channel is gone; this is terminal for the process
    #[serde(rename_all = "camelCase")]
    Died {
        /// Why the channel ended, as far as known
        reason: String,
    },
}

/// Message channel to the SFU worker
///
/// Exactly the primitives the fabric needs: the typed requests above plus an
/// observable stream of close notifications.
#[async_trait]
pub trait WorkerLink: Send + Sync + 'static {
    /// Issue one request and await its reply
    async fn request(&self, request: WorkerRequest) -> Result<WorkerReply, WorkerError>;

    /// Subscribe to closure notifications
    fn notifications(&self) -> broadcast::Receiver<WorkerNotification>;
}

#[derive(Serialize)]
struct RequestFrame<'a> {
    id: u64,
    #[serde(flatten)]
    request: &'a WorkerRequest,
}

#[derive(Debug, Deserialize)]
struct ReplyFrame {
    id: u64,
    #[serde(default)]
    ok: Option<WorkerReply>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InboundFrame {
    Reply(ReplyFrame),
    Notification(WorkerNotification),
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<WorkerReply, WorkerError>>>>>;

/// [`WorkerLink`] over a spawned worker subprocess
///
/// Port ranges and log level are injected through the spawn arguments; the
/// codec set travels in the `createRouter` request. Loss of the stdio
/// channel fails every pending request and emits a [`WorkerNotification::Died`];
/// per the fabric's failure policy that is terminal and the embedder exits.
pub struct WorkerProcess {
    writer: Mutex<ChildStdin>,
    pending: PendingMap,
    notify: broadcast::Sender<WorkerNotification>,
    next_id: AtomicU64,
    child: Mutex<Child>,
}

impl WorkerProcess {
    /// Spawn the worker subprocess and start the reader task
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Spawn`] if the binary cannot be launched or
    /// its stdio pipes are unavailable.
    pub fn spawn(config: &WorkerConfig, webrtc_ports: PortRange) -> Result<Self, WorkerError> {
        let mut child = Command::new(&config.binary)
            .arg(format!("--logLevel={}", config.log_level))
            .arg(format!("--rtcMinPort={}", webrtc_ports.min))
            .arg(format!("--rtcMaxPort={}", webrtc_ports.max))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Spawn(std::io::Error::other("worker stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Spawn(std::io::Error::other("worker stdout unavailable")))?;

        let (notify, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let reader_pending = Arc::clone(&pending);
        let reader_notify = notify.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        dispatch_inbound(&line, &reader_pending, &reader_notify).await;
                    }
                    Ok(None) => {
                        warn!("worker stdout closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "worker stdout read failed");
                        break;
                    }
                }
            }
            fail_pending(&reader_pending).await;
            let _ = reader_notify.send(WorkerNotification::Died {
                reason: "ipc channel closed".to_string(),
            });
        });

        Ok(Self {
            writer: Mutex::new(stdin),
            pending,
            notify,
            next_id: AtomicU64::new(1),
            child: Mutex::new(child),
        })
    }

    /// Kill the subprocess
    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(error = %e, "worker already gone on shutdown");
        }
    }
}

async fn dispatch_inbound(
    line: &str,
    pending: &PendingMap,
    notify: &broadcast::Sender<WorkerNotification>,
) {
    match serde_json::from_str::<InboundFrame>(line) {
        Ok(InboundFrame::Reply(reply)) => {
            let waiter = pending.lock().await.remove(&reply.id);
            match waiter {
                Some(tx) => {
                    let result = match (reply.ok, reply.error) {
                        (Some(ok), None) => Ok(ok),
                        (None, Some(error)) => Err(WorkerError::Rejected(error)),
                        _ => Err(WorkerError::Protocol("reply carries neither ok nor error".to_string())),
                    };
                    let _ = tx.send(result);
                }
                None => warn!(id = reply.id, "reply for unknown request id"),
            }
        }
        Ok(InboundFrame::Notification(notification)) => {
            debug!(?notification, "worker notification");
            let _ = notify.send(notification);
        }
        Err(e) => warn!(error = %e, "undecodable worker frame"),
    }
}

async fn fail_pending(pending: &PendingMap) {
    let drained: Vec<_> = pending.lock().await.drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(WorkerError::ChannelClosed));
    }
}

#[async_trait]
impl WorkerLink for WorkerProcess {
    async fn request(&self, request: WorkerRequest) -> Result<WorkerReply, WorkerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&RequestFrame { id, request: &request })
            .map_err(|e| WorkerError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(frame.as_bytes()).await {
                self.pending.lock().await.remove(&id);
                return Err(WorkerError::Io(e));
            }
            if let Err(e) = writer.write_all(b"\n").await {
                self.pending.lock().await.remove(&id);
                return Err(WorkerError::Io(e));
            }
        }

        rx.await.map_err(|_| WorkerError::ChannelClosed)?
    }

    fn notifications(&self) -> broadcast::Receiver<WorkerNotification> {
        self.notify.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn request_frame_shape() {
        let request = WorkerRequest::CreatePlainTransport {
            transport_id: TransportId::new(),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 20_000,
            rtcp_port: Some(20_001),
            comedia: true,
            rtcp_mux: false,
        };
        let json = serde_json::to_value(RequestFrame { id: 7, request: &request }).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"], "createPlainTransport");
        assert_eq!(json["data"]["port"], 20_000);
        assert_eq!(json["data"]["rtcpPort"], 20_001);
        assert_eq!(json["data"]["comedia"], true);
    }

    #[test]
    fn reply_frame_parses_ok_and_error() {
        let ok: InboundFrame = serde_json::from_str(r#"{"id":1,"ok":"ack"}"#).unwrap();
        match ok {
            InboundFrame::Reply(reply) => {
                assert_eq!(reply.id, 1);
                assert_eq!(reply.ok, Some(WorkerReply::Ack));
            }
            InboundFrame::Notification(_) => panic!("parsed as notification"),
        }

        let err: InboundFrame =
            serde_json::from_str(r#"{"id":2,"error":"bad rtp parameters"}"#).unwrap();
        match err {
            InboundFrame::Reply(reply) => {
                assert_eq!(reply.error.as_deref(), Some("bad rtp parameters"));
            }
            InboundFrame::Notification(_) => panic!("parsed as notification"),
        }
    }

    #[test]
    fn notification_frame_parses() {
        let producer_id = ProducerId::new();
        let line = format!(
            r#"{{"event":"producerClosed","data":{{"producerId":"{producer_id}"}}}}"#
        );
        let frame: InboundFrame = serde_json::from_str(&line).unwrap();
        match frame {
            InboundFrame::Notification(WorkerNotification::ProducerClosed { producer_id: got }) => {
                assert_eq!(got, producer_id);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn reply_expectation_helpers() {
        assert!(WorkerReply::Ack.expect_ack().is_ok());
        assert!(matches!(
            WorkerReply::Ack.into_plain_transport(),
            Err(WorkerError::UnexpectedReply)
        ));
    }
}
