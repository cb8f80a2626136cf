//! Shared fixtures: an in-process worker link and session drivers
#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use camfabric_core::rtp::{RtpCodecParameters, RtpEncodingParameters, RtpParameters};
use camfabric_core::signaling::{FabricEvent, SignalingReply, SignalingRequest};
use camfabric_core::transport::{DtlsFingerprint, DtlsParameters, DtlsRole, IceParameters};
use camfabric_core::worker::{
    PlainTransportData, WebRtcTransportData, WorkerError, WorkerLink, WorkerNotification,
    WorkerReply, WorkerRequest,
};
use camfabric_core::{FabricConfig, FabricService, MediaKind, ProducerId, Session, StreamId, TransportId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Semaphore};

/// An in-process stand-in for the SFU worker subprocess
pub struct MockWorker {
    notify: broadcast::Sender<WorkerNotification>,
    pub reject_produce: AtomicBool,
    pub reject_consume: AtomicBool,
    consume_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockWorker {
    pub fn new() -> Arc<Self> {
        let (notify, _) = broadcast::channel(64);
        Arc::new(Self {
            notify,
            reject_produce: AtomicBool::new(false),
            reject_consume: AtomicBool::new(false),
            consume_gate: Mutex::new(None),
        })
    }

    /// Make subsequent consume requests block until permits are added
    pub async fn gate_consumes(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.consume_gate.lock().await = Some(Arc::clone(&gate));
        gate
    }

    /// Let consume requests pass freely again
    pub async fn ungate_consumes(&self) {
        *self.consume_gate.lock().await = None;
    }

    /// Inject a worker-side closure notification
    pub fn emit(&self, notification: WorkerNotification) {
        let _ = self.notify.send(notification);
    }
}

#[async_trait]
impl WorkerLink for MockWorker {
    async fn request(&self, request: WorkerRequest) -> Result<WorkerReply, WorkerError> {
        match request {
            WorkerRequest::CreateWebRtcTransport { announced_ip, .. } => {
                Ok(WorkerReply::WebRtcTransport(WebRtcTransportData {
                    ice_parameters: IceParameters {
                        username_fragment: "ufrag".to_string(),
                        password: "secret".to_string(),
                        ice_lite: true,
                    },
                    ice_candidates: vec![camfabric_core::IceCandidate {
                        foundation: "udpcandidate".to_string(),
                        priority: 1_076_302_079,
                        ip: announced_ip,
                        protocol: "udp".to_string(),
                        port: 40_000,
                        kind: "host".to_string(),
                    }],
                    dtls_parameters: DtlsParameters {
                        role: DtlsRole::Auto,
                        fingerprints: vec![DtlsFingerprint {
                            algorithm: "sha-256".to_string(),
                            value: "A1:B2".to_string(),
                        }],
                    },
                }))
            }
            WorkerRequest::CreatePlainTransport {
                listen_ip,
                port,
                rtcp_port,
                ..
            } => Ok(WorkerReply::PlainTransport(PlainTransportData {
                ip: listen_ip,
                port,
                rtcp_port,
            })),
            WorkerRequest::Produce { .. } => {
                if self.reject_produce.load(Ordering::Relaxed) {
                    Err(WorkerError::Rejected("produce refused".to_string()))
                } else {
                    Ok(WorkerReply::Ack)
                }
            }
            WorkerRequest::Consume { .. } => {
                let gate = self.consume_gate.lock().await.clone();
                if let Some(gate) = gate {
                    let permit = gate.acquire().await.unwrap();
                    permit.forget();
                }
                if self.reject_consume.load(Ordering::Relaxed) {
                    Err(WorkerError::Rejected("consume refused".to_string()))
                } else {
                    Ok(WorkerReply::Ack)
                }
            }
            _ => Ok(WorkerReply::Ack),
        }
    }

    fn notifications(&self) -> broadcast::Receiver<WorkerNotification> {
        self.notify.subscribe()
    }
}

/// Assemble a fabric on a mock worker with the default configuration
pub async fn fabric() -> (Arc<FabricService>, Arc<MockWorker>) {
    fabric_with(FabricConfig::default()).await
}

/// Assemble a fabric on a mock worker with a custom configuration
pub async fn fabric_with(config: FabricConfig) -> (Arc<FabricService>, Arc<MockWorker>) {
    let worker = MockWorker::new();
    let link: Arc<dyn WorkerLink> = worker.clone();
    let service = FabricService::new(config, link).await.unwrap();
    (service, worker)
}

/// Send parameters a mobile client would offer for its camera track
pub fn video_rtp_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: Vec::new(),
        }],
        header_extensions: Vec::new(),
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(22_222_222),
            ..RtpEncodingParameters::default()
        }],
        ..RtpParameters::default()
    }
}

/// Send parameters for a microphone track
pub fn audio_rtp_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("1".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48_000,
            channels: Some(2),
            parameters: BTreeMap::new(),
            rtcp_feedback: Vec::new(),
        }],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(33_333_333),
            ..RtpEncodingParameters::default()
        }],
        ..RtpParameters::default()
    }
}

/// Client-side DTLS parameters for connect calls
pub fn client_dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "C3:D4".to_string(),
        }],
    }
}

/// Drive a session through register → capabilities → transport → connect
///
/// Returns the send transport id.
pub async fn negotiate_send_transport(session: &Session, device_id: &str) -> TransportId {
    session
        .handle(SignalingRequest::RegisterDevice {
            device_id: Some(device_id.to_string()),
            device_name: None,
        })
        .await
        .unwrap();
    session
        .handle(SignalingRequest::GetRtpCapabilities)
        .await
        .unwrap();
    let transport_id = match session
        .handle(SignalingRequest::CreateTransport)
        .await
        .unwrap()
    {
        SignalingReply::TransportCreated(reply) => reply.id,
        other => panic!("unexpected reply: {other:?}"),
    };
    session
        .handle(SignalingRequest::ConnectTransport {
            transport_id,
            dtls_parameters: client_dtls(),
        })
        .await
        .unwrap();
    transport_id
}

/// Full happy-path video ingest; returns the transport, producer and stream
pub async fn start_video_ingest(
    session: &Session,
    device_id: &str,
) -> (TransportId, ProducerId, StreamId) {
    let transport_id = negotiate_send_transport(session, device_id).await;
    let produced = session
        .handle(SignalingRequest::Produce {
            transport_id,
            kind: MediaKind::Video,
            rtp_parameters: video_rtp_parameters(),
        })
        .await
        .unwrap();
    let producer_id = match produced {
        SignalingReply::Produced(reply) => reply.id,
        other => panic!("unexpected reply: {other:?}"),
    };
    let streams = match session
        .handle(SignalingRequest::GetActiveStreams)
        .await
        .unwrap()
    {
        SignalingReply::Streams { streams } => streams,
        other => panic!("unexpected reply: {other:?}"),
    };
    let stream = streams
        .into_iter()
        .find(|s| s.producer_id == producer_id)
        .expect("stream record for the new producer");
    (transport_id, producer_id, stream.id)
}

/// Collect every event currently sitting in the receiver
pub fn drain_events(rx: &mut broadcast::Receiver<FabricEvent>) -> Vec<FabricEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Short names of drained events, for order assertions
pub fn event_names(events: &[FabricEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e {
            FabricEvent::DeviceConnected { .. } => "device-connected",
            FabricEvent::DeviceDisconnected { .. } => "device-disconnected",
            FabricEvent::DeviceRemoved { .. } => "device-removed",
            FabricEvent::DeviceStreamingChanged { .. } => "device-streaming-changed",
            FabricEvent::StreamStarted { .. } => "stream-started",
            FabricEvent::StreamEnded { .. } => "stream-ended",
            FabricEvent::StreamNameUpdated { .. } => "stream-name-updated",
        })
        .collect()
}
