//! The routing context
//!
//! One router per worker process is enough for the target scale (tens of
//! concurrent producers). The router owns every transport, producer and
//! consumer, synthesizes stream records for video producers, and cascades
//! closes along the ownership tree. All mutating operations serialize behind
//! the writer lock; worker round-trips happen with the lock held, which is
//! exactly the point-in-time consistency the read snapshots rely on.

use crate::config::{CodecSpec, FabricConfig};
use crate::registry::{DeviceRegistry, StreamSynthesis};
use crate::rtp::{self, RtpCapabilities, RtpError, RtpParameters};
use crate::transport::{
    ClientTransport, DtlsParameters, EgressTransport, FactoryError, TransportFactory,
};
use crate::types::{
    AppData, ConsumerId, DeviceId, MediaKind, ProducerId, Resolution, SessionId, StreamInfo,
    TransportId,
};
use crate::worker::{WorkerError, WorkerLink, WorkerRequest};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Nominal frame rate assigned to new streams
const DEFAULT_STREAM_FPS: u32 = 30;

/// Nominal bitrate assigned to new streams, bits per second
const DEFAULT_STREAM_BITRATE: u32 = 1_000_000;

/// Router operation errors
#[derive(Error, Debug)]
pub enum RouterError {
    /// Operation issued before the routing context is ready
    #[error("routing context is not initialized")]
    NotInitialized,

    /// Transport id not known to the router
    #[error("unknown transport: {0}")]
    UnknownTransport(TransportId),

    /// Operation requires a client transport but got an egress one
    #[error("transport {0} is not a client transport")]
    InvalidTransport(TransportId),

    /// Producer not found or already closed
    #[error("unknown producer: {0}")]
    UnknownProducer(ProducerId),

    /// Consumer not found or already closed
    #[error("unknown consumer: {0}")]
    UnknownConsumer(ConsumerId),

    /// Consumer capability set cannot decode the producer
    #[error("unsupported capabilities: {0}")]
    UnsupportedCapabilities(RtpError),

    /// The worker rejected the producer's RTP parameters
    #[error("produce failed: {0}")]
    ProduceFailed(String),

    /// Egress pool drained
    #[error("egress port pool exhausted")]
    EgressPortsExhausted,

    /// Worker channel failure
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl From<FactoryError> for RouterError {
    fn from(e: FactoryError) -> Self {
        match e {
            FactoryError::PortsExhausted => Self::EgressPortsExhausted,
            FactoryError::Worker(e) => Self::Worker(e),
        }
    }
}

/// An ingested media track
#[derive(Debug, Clone)]
pub struct Producer {
    /// Producer id
    pub id: ProducerId,
    /// Track kind
    pub kind: MediaKind,
    /// Negotiated send parameters
    pub rtp_parameters: RtpParameters,
    /// Owning transport
    pub transport: TransportId,
    /// Owning device
    pub app_data: AppData,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

/// An outbound forwarding of a producer
#[derive(Debug, Clone)]
pub struct Consumer {
    /// Consumer id
    pub id: ConsumerId,
    /// Track kind
    pub kind: MediaKind,
    /// Parameters the consumer must decode
    pub rtp_parameters: RtpParameters,
    /// Owning transport
    pub transport: TransportId,
    /// Source producer
    pub producer: ProducerId,
    /// Whether forwarding is paused
    pub paused: bool,
}

/// What a producer close removed
#[derive(Debug)]
pub struct ClosedProducer {
    /// The removed producer
    pub producer: Producer,
    /// Consumers that were forwarding it
    pub consumers: Vec<Consumer>,
}

/// What a transport close removed
#[derive(Debug)]
pub struct ClosedTransport {
    /// Producers the transport owned
    pub producers: Vec<Producer>,
    /// Consumers removed (owned by the transport or consuming its producers)
    pub consumers: Vec<Consumer>,
    /// The egress record, when the transport was an egress one
    pub egress: Option<EgressTransport>,
}

#[derive(Default)]
struct RouterState {
    client_transports: HashMap<TransportId, ClientTransport>,
    egress_transports: HashMap<TransportId, EgressTransport>,
    producers: HashMap<ProducerId, Producer>,
    consumers: HashMap<ConsumerId, Consumer>,
}

/// The media router
pub struct MediaRouter {
    worker: Arc<dyn WorkerLink>,
    factory: Arc<TransportFactory>,
    registry: Arc<DeviceRegistry>,
    codecs: Vec<CodecSpec>,
    capabilities: OnceLock<RtpCapabilities>,
    state: RwLock<RouterState>,
}

impl MediaRouter {
    /// Build an uninitialized router
    pub fn new(
        config: &FabricConfig,
        worker: Arc<dyn WorkerLink>,
        factory: Arc<TransportFactory>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            worker,
            factory,
            registry,
            codecs: config.codecs.clone(),
            capabilities: OnceLock::new(),
            state: RwLock::new(RouterState::default()),
        }
    }

    /// Create the routing context in the worker and compute capabilities
    ///
    /// Idempotent; every other operation fails with
    /// [`RouterError::NotInitialized`] until this has completed.
    ///
    /// # Errors
    ///
    /// Propagates worker failures.
    pub async fn initialize(&self) -> Result<(), RouterError> {
        if self.capabilities.get().is_some() {
            return Ok(());
        }
        self.worker
            .request(WorkerRequest::CreateRouter {
                codecs: self.codecs.clone(),
            })
            .await?
            .expect_ack()?;
        let _ = self.capabilities.set(rtp::router_capabilities(&self.codecs));
        info!(codecs = self.codecs.len(), "routing context ready");
        Ok(())
    }

    /// The router's RTP capability descriptor
    ///
    /// Lock-free after initialization.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NotInitialized`] before [`Self::initialize`].
    pub fn capabilities(&self) -> Result<&RtpCapabilities, RouterError> {
        self.capabilities.get().ok_or(RouterError::NotInitialized)
    }

    /// Create an encrypted client transport owned by a session
    ///
    /// # Errors
    ///
    /// Fails before initialization and on worker failure.
    pub async fn create_client_transport(
        &self,
        session: SessionId,
        app_data: AppData,
    ) -> Result<ClientTransport, RouterError> {
        self.capabilities()?;
        let mut state = self.state.write().await;
        let transport = self.factory.create_client_transport(session, app_data).await?;
        state.client_transports.insert(transport.id, transport.clone());
        Ok(transport)
    }

    /// Finish DTLS setup on a client transport
    ///
    /// # Errors
    ///
    /// [`RouterError::UnknownTransport`] when the id is not a client
    /// transport owned by `session`; worker failures otherwise.
    pub async fn connect_client_transport(
        &self,
        session: SessionId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RouterError> {
        self.capabilities()?;
        let mut state = self.state.write().await;
        let owned = state
            .client_transports
            .get(&transport_id)
            .is_some_and(|t| t.session == session);
        if !owned {
            return Err(RouterError::UnknownTransport(transport_id));
        }

        self.worker
            .request(WorkerRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            })
            .await?
            .expect_ack()?;

        if let Some(transport) = state.client_transports.get_mut(&transport_id) {
            transport.connected = true;
        }
        debug!(transport_id = %transport_id, "client transport connected");
        Ok(())
    }

    /// Bind an inbound track to a client transport
    ///
    /// Registers the producer and, for video, synthesizes (or refreshes) the
    /// transport's stream record; the registry emits `stream-started`. The
    /// transport's `appData.clientId` is bound here if it was created before
    /// the session registered its device.
    ///
    /// # Errors
    ///
    /// [`RouterError::InvalidTransport`] when the transport is egress,
    /// [`RouterError::ProduceFailed`] when the parameters are unusable or
    /// the worker rejects them.
    pub async fn bind_producer(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        device_id: DeviceId,
    ) -> Result<(Producer, Option<StreamInfo>), RouterError> {
        let capabilities = self.capabilities()?;
        let mut state = self.state.write().await;
        if state.egress_transports.contains_key(&transport_id) {
            return Err(RouterError::InvalidTransport(transport_id));
        }
        if !state.client_transports.contains_key(&transport_id) {
            return Err(RouterError::UnknownTransport(transport_id));
        }

        rtp::validate_producer_parameters(&rtp_parameters, capabilities)
            .map_err(|e| RouterError::ProduceFailed(e.to_string()))?;

        let producer_id = ProducerId::new();
        self.worker
            .request(WorkerRequest::Produce {
                transport_id,
                producer_id,
                kind,
                rtp_parameters: rtp_parameters.clone(),
            })
            .await
            .map_err(|e| match e {
                WorkerError::Rejected(reason) => RouterError::ProduceFailed(reason),
                other => RouterError::Worker(other),
            })?
            .expect_ack()?;

        let app_data = AppData::for_device(device_id.clone());
        if let Some(transport) = state.client_transports.get_mut(&transport_id) {
            if transport.app_data.client_id.is_none() {
                transport.app_data = app_data.clone();
            }
        }

        let producer = Producer {
            id: producer_id,
            kind,
            rtp_parameters,
            transport: transport_id,
            app_data,
            created_at: Utc::now(),
        };
        state.producers.insert(producer_id, producer.clone());
        info!(producer_id = %producer_id, transport_id = %transport_id, kind = %kind, "producer bound");

        let stream = if kind == MediaKind::Video {
            let synthesis = self.stream_synthesis(&producer, device_id).await;
            Some(self.registry.upsert_stream(synthesis).await)
        } else {
            None
        };

        Ok((producer, stream))
    }

    async fn stream_synthesis(&self, producer: &Producer, device_id: DeviceId) -> StreamSynthesis {
        let device_name = self
            .registry
            .device(&device_id)
            .await
            .and_then(|d| d.device_name)
            .unwrap_or_else(|| device_id.to_string());

        let encoding = producer.rtp_parameters.primary_encoding();
        let resolution = encoding
            .and_then(|e| e.scale_resolution_down_by)
            .map_or_else(Resolution::default, |s| {
                Resolution::default().scaled_down_by(s)
            });
        let bitrate = encoding
            .and_then(|e| e.max_bitrate)
            .unwrap_or(DEFAULT_STREAM_BITRATE);

        StreamSynthesis {
            transport_id: producer.transport,
            producer_id: producer.id,
            device_id,
            device_name,
            resolution,
            fps: DEFAULT_STREAM_FPS,
            bitrate,
        }
    }

    /// Bind an outbound forwarding to a transport (client or egress)
    ///
    /// The synthesized parameters preserve the producer's payload types and
    /// clock rates. Client consumers start paused and are unpaused by
    /// `resume-consumer`; egress consumers forward immediately.
    ///
    /// # Errors
    ///
    /// [`RouterError::UnsupportedCapabilities`] when the capability set
    /// cannot decode the producer.
    pub async fn bind_consumer(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<Consumer, RouterError> {
        self.capabilities()?;
        let mut state = self.state.write().await;
        let is_egress = state.egress_transports.contains_key(&transport_id);
        if !is_egress && !state.client_transports.contains_key(&transport_id) {
            return Err(RouterError::UnknownTransport(transport_id));
        }
        let producer = state
            .producers
            .get(&producer_id)
            .ok_or(RouterError::UnknownProducer(producer_id))?
            .clone();

        let consumer_id = ConsumerId::new();
        let rtp_parameters =
            rtp::consumer_parameters(&producer.rtp_parameters, capabilities, consumer_id)
                .map_err(RouterError::UnsupportedCapabilities)?;

        self.worker
            .request(WorkerRequest::Consume {
                transport_id,
                consumer_id,
                producer_id,
                rtp_parameters: rtp_parameters.clone(),
            })
            .await?
            .expect_ack()?;

        let consumer = Consumer {
            id: consumer_id,
            kind: producer.kind,
            rtp_parameters,
            transport: transport_id,
            producer: producer_id,
            paused: !is_egress,
        };
        state.consumers.insert(consumer_id, consumer.clone());
        if is_egress {
            if let Some(egress) = state.egress_transports.get_mut(&transport_id) {
                egress.producer = Some(producer_id);
            }
        }
        info!(consumer_id = %consumer_id, producer_id = %producer_id, egress = is_egress, "consumer bound");
        Ok(consumer)
    }

    /// Unpause a consumer
    ///
    /// # Errors
    ///
    /// [`RouterError::UnknownConsumer`] when the id is gone.
    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), RouterError> {
        let mut state = self.state.write().await;
        let consumer = state
            .consumers
            .get_mut(&consumer_id)
            .ok_or(RouterError::UnknownConsumer(consumer_id))?;
        consumer.paused = false;
        debug!(consumer_id = %consumer_id, "consumer resumed");
        Ok(())
    }

    /// Close a consumer
    ///
    /// Idempotent; used for unwinding half-created consumers.
    pub async fn close_consumer(&self, consumer_id: ConsumerId) -> Option<Consumer> {
        let mut state = self.state.write().await;
        let consumer = state.consumers.remove(&consumer_id)?;
        if let Some(egress) = state.egress_transports.get_mut(&consumer.transport) {
            egress.producer = None;
        }
        Some(consumer)
    }

    /// Close a producer and every consumer forwarding it
    ///
    /// Idempotent. Egress teardown and the `stream-ended` broadcast are the
    /// caller's cascade (the binding must die before the event goes out).
    pub async fn close_producer(&self, producer_id: ProducerId) -> Option<ClosedProducer> {
        let mut state = self.state.write().await;
        let producer = state.producers.remove(&producer_id)?;

        if let Err(e) = self
            .worker
            .request(WorkerRequest::CloseProducer { producer_id })
            .await
        {
            warn!(producer_id = %producer_id, error = %e, "worker producer close failed");
        }

        let consumer_ids: Vec<ConsumerId> = state
            .consumers
            .values()
            .filter(|c| c.producer == producer_id)
            .map(|c| c.id)
            .collect();
        let mut consumers = Vec::with_capacity(consumer_ids.len());
        for id in consumer_ids {
            if let Some(consumer) = state.consumers.remove(&id) {
                consumers.push(consumer);
            }
        }

        info!(producer_id = %producer_id, consumers = consumers.len(), "producer closed");
        Some(ClosedProducer { producer, consumers })
    }

    /// Close a transport and everything it owns
    ///
    /// Idempotent. Removes the transport, its producers, its consumers, and
    /// consumers elsewhere that were forwarding its producers.
    pub async fn close_transport(&self, transport_id: TransportId) -> Option<ClosedTransport> {
        let mut state = self.state.write().await;
        let egress = state.egress_transports.remove(&transport_id);
        let client = state.client_transports.remove(&transport_id);
        if egress.is_none() && client.is_none() {
            return None;
        }

        if let Err(e) = self
            .worker
            .request(WorkerRequest::CloseTransport { transport_id })
            .await
        {
            warn!(transport_id = %transport_id, error = %e, "worker transport close failed");
        }

        let producer_ids: Vec<ProducerId> = state
            .producers
            .values()
            .filter(|p| p.transport == transport_id)
            .map(|p| p.id)
            .collect();
        let mut producers = Vec::with_capacity(producer_ids.len());
        for id in &producer_ids {
            if let Some(producer) = state.producers.remove(id) {
                producers.push(producer);
            }
        }

        let consumer_ids: Vec<ConsumerId> = state
            .consumers
            .values()
            .filter(|c| c.transport == transport_id || producer_ids.contains(&c.producer))
            .map(|c| c.id)
            .collect();
        let mut consumers = Vec::with_capacity(consumer_ids.len());
        for id in consumer_ids {
            if let Some(consumer) = state.consumers.remove(&id) {
                consumers.push(consumer);
            }
        }

        info!(
            transport_id = %transport_id,
            producers = producers.len(),
            consumers = consumers.len(),
            "transport closed"
        );
        Some(ClosedTransport {
            producers,
            consumers,
            egress,
        })
    }

    /// Register a freshly created egress transport
    pub async fn register_egress_transport(&self, transport: EgressTransport) {
        let mut state = self.state.write().await;
        state.egress_transports.insert(transport.id, transport);
    }

    /// A producer snapshot by id
    pub async fn producer(&self, producer_id: ProducerId) -> Option<Producer> {
        self.state.read().await.producers.get(&producer_id).cloned()
    }

    /// A client transport snapshot by id
    pub async fn client_transport(&self, transport_id: TransportId) -> Option<ClientTransport> {
        self.state
            .read()
            .await
            .client_transports
            .get(&transport_id)
            .cloned()
    }

    /// All live egress transports (admin view)
    pub async fn egress_transports(&self) -> Vec<EgressTransport> {
        self.state
            .read()
            .await
            .egress_transports
            .values()
            .cloned()
            .collect()
    }

    /// Producers owned by a session's transports
    pub async fn producers_of_session(&self, session: SessionId) -> Vec<Producer> {
        let state = self.state.read().await;
        state
            .producers
            .values()
            .filter(|p| {
                state
                    .client_transports
                    .get(&p.transport)
                    .is_some_and(|t| t.session == session)
            })
            .cloned()
            .collect()
    }
}
