//! Per-connection signaling sessions
//!
//! One [`Session`] per open signaling channel. It is a strict sequencer for
//! the producer path (register, capabilities, transport, connect, produce);
//! and any request out of that order fails with `ProtocolOrder` leaving the
//! session in its pre-call state. Observer and sink requests (stream
//! listing, renames, bridge egress) are legal from any non-closing state.
//!
//! Requests are processed in arrival order: the state lock is held for the
//! whole request, including its worker round-trips. Closing the channel runs
//! the full cascade: producers (and their egress bindings) die first, then
//! the owned transports, then the device flips to disconnected and its
//! removal is scheduled.

use crate::egress::EgressError;
use crate::registry::RegistryError;
use crate::router::RouterError;
use crate::service::FabricService;
use crate::signaling::{
    ConsumerReply, ErrorKind, ProducedReply, SignalingReply, SignalingRequest,
    TransportCreatedReply,
};
use crate::types::{AppData, ConsumerId, DeviceId, MediaKind, ProducerId, SessionId, TransportId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

impl From<RouterError> for ErrorKind {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::NotInitialized => Self::NotInitialized,
            RouterError::UnknownTransport(_) | RouterError::InvalidTransport(_) => {
                Self::UnknownTransport
            }
            RouterError::UnknownProducer(_) | RouterError::UnknownConsumer(_) => {
                Self::UnknownProducer
            }
            RouterError::UnsupportedCapabilities(_) => Self::UnsupportedCapabilities,
            RouterError::ProduceFailed(_) => Self::ProduceFailed,
            RouterError::EgressPortsExhausted => Self::EgressPortsExhausted,
            RouterError::Worker(_) => Self::NotInitialized,
        }
    }
}

impl From<EgressError> for ErrorKind {
    fn from(e: EgressError) -> Self {
        match e {
            EgressError::UnknownProducer(_) => Self::UnknownProducer,
            EgressError::UnknownStream(_) => Self::UnknownStream,
            EgressError::PortsExhausted => Self::EgressPortsExhausted,
            EgressError::UnsupportedCapabilities => Self::UnsupportedCapabilities,
            EgressError::ProducerClosed => Self::ProducerClosed,
            EgressError::Router(e) => e.into(),
        }
    }
}

impl From<RegistryError> for ErrorKind {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownStream(_) => Self::UnknownStream,
            // a session whose device vanished is out of protocol
            RegistryError::UnknownDevice(_) => Self::ProtocolOrder,
        }
    }
}

/// Where a session stands on the producer path
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    /// Channel open, nothing negotiated
    Opened,
    /// Device registered
    Registered,
    /// Send transport created
    TransportCreated,
    /// Send transport DTLS-connected
    TransportConnected,
    /// At least one producer bound
    Producing,
}

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    device: Option<DeviceId>,
    send_transport: Option<TransportId>,
    recv_transports: HashSet<TransportId>,
    producers: Vec<ProducerId>,
    consumers: Vec<ConsumerId>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: SessionPhase::Opened,
            device: None,
            send_transport: None,
            recv_transports: HashSet::new(),
            producers: Vec::new(),
            consumers: Vec::new(),
        }
    }
}

/// One open signaling channel
pub struct Session {
    id: SessionId,
    fabric: Arc<FabricService>,
    state: Mutex<SessionState>,
    closing: AtomicBool,
}

impl Session {
    pub(crate) fn new(id: SessionId, fabric: Arc<FabricService>) -> Self {
        Self {
            id,
            fabric,
            state: Mutex::new(SessionState::new()),
            closing: AtomicBool::new(false),
        }
    }

    /// The session's transient identity
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current phase on the producer path
    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    /// Process one signaling request
    ///
    /// # Errors
    ///
    /// Returns the wire [`ErrorKind`]; an error reply never mutates session
    /// state, so the client may retry.
    #[tracing::instrument(skip(self, request), fields(session_id = %self.id))]
    pub async fn handle(&self, request: SignalingRequest) -> Result<SignalingReply, ErrorKind> {
        let mut state = self.state.lock().await;
        if self.closing.load(Ordering::Acquire) {
            return Err(ErrorKind::ProtocolOrder);
        }
        debug!(session_id = %self.id, ?request, "signaling request");

        match request {
            SignalingRequest::RegisterDevice {
                device_id,
                device_name,
            } => self.register_device(&mut state, device_id, device_name).await,
            SignalingRequest::GetRtpCapabilities => {
                if state.phase < SessionPhase::Registered {
                    return Err(ErrorKind::ProtocolOrder);
                }
                let capabilities = self.fabric.router().capabilities()?.clone();
                Ok(SignalingReply::Capabilities(capabilities))
            }
            SignalingRequest::CreateTransport => {
                if state.phase != SessionPhase::Registered {
                    return Err(ErrorKind::ProtocolOrder);
                }
                let reply = self.create_transport(&state).await?;
                state.send_transport = Some(reply.id);
                state.phase = SessionPhase::TransportCreated;
                Ok(SignalingReply::TransportCreated(reply))
            }
            SignalingRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                if state.phase != SessionPhase::TransportCreated {
                    return Err(ErrorKind::ProtocolOrder);
                }
                if state.send_transport != Some(transport_id) {
                    return Err(ErrorKind::UnknownTransport);
                }
                self.fabric
                    .router()
                    .connect_client_transport(self.id, transport_id, dtls_parameters)
                    .await?;
                state.phase = SessionPhase::TransportConnected;
                Ok(SignalingReply::Ack {})
            }
            SignalingRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => self.produce(&mut state, transport_id, kind, rtp_parameters).await,
            SignalingRequest::CreateRecvTransport => {
                if state.phase < SessionPhase::Registered {
                    return Err(ErrorKind::ProtocolOrder);
                }
                let reply = self.create_transport(&state).await?;
                state.recv_transports.insert(reply.id);
                Ok(SignalingReply::TransportCreated(reply))
            }
            SignalingRequest::ConnectRecvTransport {
                transport_id,
                dtls_parameters,
            } => {
                if !state.recv_transports.contains(&transport_id) {
                    return Err(ErrorKind::UnknownTransport);
                }
                self.fabric
                    .router()
                    .connect_client_transport(self.id, transport_id, dtls_parameters)
                    .await?;
                Ok(SignalingReply::Ack {})
            }
            SignalingRequest::ConsumeStream {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                self.consume_stream(&mut state, transport_id, producer_id, rtp_capabilities)
                    .await
            }
            SignalingRequest::ResumeConsumer { consumer_id } => {
                if !state.consumers.contains(&consumer_id) {
                    return Err(ErrorKind::UnknownProducer);
                }
                self.fabric.router().resume_consumer(consumer_id).await?;
                Ok(SignalingReply::Ack {})
            }
            SignalingRequest::StopStream => {
                let device = state.device.clone().ok_or(ErrorKind::ProtocolOrder)?;
                self.fabric
                    .registry()
                    .set_streaming(&device, false, None)
                    .await?;
                info!(session_id = %self.id, device_id = %device, "stream stopped (advisory)");
                Ok(SignalingReply::Ack {})
            }
            SignalingRequest::DisconnectStream { stream_id } => {
                let stream = self
                    .fabric
                    .registry()
                    .stream(&stream_id)
                    .await
                    .ok_or(ErrorKind::UnknownStream)?;
                self.fabric.close_producer_cascade(stream.producer_id).await;
                // the cascade clears flags quietly; announce the flip for
                // the operator-initiated path
                let _ = self
                    .fabric
                    .registry()
                    .set_streaming(&stream.device_id, false, None)
                    .await;
                Ok(SignalingReply::Ack {})
            }
            SignalingRequest::UpdateStreamName { stream_id, name } => {
                self.fabric.registry().rename_stream(&stream_id, name).await?;
                Ok(SignalingReply::Ack {})
            }
            SignalingRequest::GetActiveStreams => Ok(SignalingReply::Streams {
                streams: self.fabric.registry().active_streams().await,
            }),
            SignalingRequest::NdiBridgeConsumeStream {
                stream_id,
                producer_id,
                rtp_capabilities,
            } => {
                let reply = self
                    .fabric
                    .egress()
                    .consume_stream(&stream_id, producer_id, &rtp_capabilities)
                    .await?;
                Ok(SignalingReply::Egress(reply))
            }
        }
    }

    async fn register_device(
        &self,
        state: &mut SessionState,
        device_id: Option<String>,
        device_name: Option<String>,
    ) -> Result<SignalingReply, ErrorKind> {
        let device_id = match device_id {
            Some(id) if !id.is_empty() => DeviceId::new(id),
            _ => return Err(ErrorKind::MissingDeviceId),
        };
        self.fabric
            .registry()
            .upsert(device_id.clone(), device_name, self.id)
            .await;
        state.device = Some(device_id);
        if state.phase == SessionPhase::Opened {
            state.phase = SessionPhase::Registered;
        }
        Ok(SignalingReply::Ack {})
    }

    async fn create_transport(
        &self,
        state: &SessionState,
    ) -> Result<TransportCreatedReply, ErrorKind> {
        let app_data = state
            .device
            .clone()
            .map_or_else(AppData::default, AppData::for_device);
        let transport = self
            .fabric
            .router()
            .create_client_transport(self.id, app_data)
            .await?;
        Ok(TransportCreatedReply {
            id: transport.id,
            ice_parameters: transport.connection.ice_parameters,
            ice_candidates: transport.connection.ice_candidates,
            dtls_parameters: transport.connection.dtls_parameters,
        })
    }

    async fn produce(
        &self,
        state: &mut SessionState,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: crate::rtp::RtpParameters,
    ) -> Result<SignalingReply, ErrorKind> {
        if state.phase != SessionPhase::TransportConnected && state.phase != SessionPhase::Producing
        {
            return Err(ErrorKind::ProtocolOrder);
        }
        if state.send_transport != Some(transport_id) {
            return Err(ErrorKind::UnknownTransport);
        }
        let device = state.device.clone().ok_or(ErrorKind::ProtocolOrder)?;

        let (producer, stream) = self
            .fabric
            .router()
            .bind_producer(transport_id, kind, rtp_parameters, device.clone())
            .await?;

        if let Some(stream) = &stream {
            // stream-started was emitted by the record commit above; the
            // streaming flag flips (and broadcasts) afterwards
            self.fabric
                .registry()
                .set_streaming(&device, true, Some(stream.id.clone()))
                .await?;
        }

        state.producers.push(producer.id);
        state.phase = SessionPhase::Producing;
        Ok(SignalingReply::Produced(ProducedReply {
            id: producer.id,
            kind: producer.kind,
        }))
    }

    async fn consume_stream(
        &self,
        state: &mut SessionState,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: crate::rtp::RtpCapabilities,
    ) -> Result<SignalingReply, ErrorKind> {
        if !state.recv_transports.contains(&transport_id) {
            return Err(ErrorKind::UnknownTransport);
        }
        let connected = self
            .fabric
            .router()
            .client_transport(transport_id)
            .await
            .is_some_and(|t| t.connected);
        if !connected {
            return Err(ErrorKind::ProtocolOrder);
        }

        let consumer = self
            .fabric
            .router()
            .bind_consumer(transport_id, producer_id, &rtp_capabilities)
            .await?;

        // the channel may have closed while the worker round-trip was in
        // flight; unwind the half-created consumer, the reply is discarded
        if self.closing.load(Ordering::Acquire) {
            self.fabric.router().close_consumer(consumer.id).await;
            return Err(ErrorKind::ProtocolOrder);
        }

        state.consumers.push(consumer.id);
        Ok(SignalingReply::Consumer(ConsumerReply {
            id: consumer.id,
            producer_id: consumer.producer,
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters,
        }))
    }

    /// Run the close cascade for this channel
    ///
    /// Idempotent. Producers (with their egress bindings and stream records)
    /// go first, then the owned transports, then the device flips to
    /// disconnected and its deferred removal is scheduled.
    #[tracing::instrument(skip(self), fields(session_id = %self.id))]
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.lock().await;
        info!(session_id = %self.id, "session closing");

        // the registry is authoritative for which streams this channel's
        // device still publishes; the local list additionally covers
        // producers without a stream record (audio). The cascade is
        // idempotent, so the overlap closes once.
        for stream in self.fabric.registry().streams_of_session(self.id).await {
            self.fabric.close_producer_cascade(stream.producer_id).await;
        }
        for producer_id in std::mem::take(&mut state.producers) {
            self.fabric.close_producer_cascade(producer_id).await;
        }
        if let Some(transport_id) = state.send_transport.take() {
            self.fabric.close_transport_cascade(transport_id).await;
        }
        for transport_id in std::mem::take(&mut state.recv_transports) {
            self.fabric.close_transport_cascade(transport_id).await;
        }
        state.consumers.clear();

        if let Some(device) = state.device.take() {
            self.fabric.registry().mark_disconnected(&device).await;
            self.fabric.registry().schedule_removal(device).await;
        }
    }
}
