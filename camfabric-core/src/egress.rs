//! Plain-RTP egress bridge
//!
//! On demand, attaches a dedicated plain RTP/UDP tuple to a producer so the
//! external NDI converter can read its media without WebRTC. One producer
//! per egress transport: sharing would complicate teardown and port
//! accounting, and the converter maps one source per producer anyway.
//!
//! The binding is idempotent per producer: repeating the request returns
//! the tuple already handed out, and the tuple never changes for the
//! binding's lifetime. The binding dies synchronously with its producer,
//! before the `stream-ended` broadcast goes out.

use crate::registry::DeviceRegistry;
use crate::router::{MediaRouter, RouterError};
use crate::rtp::{RtpCapabilities, RtpParameters};
use crate::signaling::{EgressConsumeReply, EgressTransportInfo, StreamMetadata};
use crate::transport::{PortPair, TransportFactory};
use crate::types::{ConsumerId, ProducerId, StreamId, TransportId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Egress bridge errors
#[derive(Error, Debug)]
pub enum EgressError {
    /// Producer not found or already closed
    #[error("unknown producer: {0}")]
    UnknownProducer(ProducerId),

    /// No stream record for the producer
    #[error("unknown stream: {0}")]
    UnknownStream(StreamId),

    /// The egress port pool is drained
    #[error("egress port pool exhausted")]
    PortsExhausted,

    /// The sink's capability set cannot decode the producer
    #[error("unsupported capabilities")]
    UnsupportedCapabilities,

    /// Producer closed while the request was in flight
    #[error("producer closed mid-request")]
    ProducerClosed,

    /// Worker channel failure
    #[error(transparent)]
    Router(RouterError),
}

/// A live pairing of a producer with its egress transport and consumer
#[derive(Debug, Clone)]
pub struct EgressBinding {
    /// Consumer on the egress transport
    pub consumer_id: ConsumerId,
    /// The egress transport
    pub transport_id: TransportId,
    /// Stream being re-emitted
    pub stream_id: StreamId,
    /// The stable tuple handed to the sink
    pub tuple: EgressTransportInfo,
    /// Parameters matching the emitted RTP byte-for-byte
    pub rtp_parameters: RtpParameters,
    /// Stream labeling details at binding time
    pub metadata: StreamMetadata,
    /// Pool pair backing the tuple
    pub pair: PortPair,
    /// Binding instant
    pub created_at: DateTime<Utc>,
}

impl EgressBinding {
    fn reply(&self) -> EgressConsumeReply {
        EgressConsumeReply {
            consumer_id: self.consumer_id,
            transport: self.tuple.clone(),
            rtp_parameters: self.rtp_parameters.clone(),
            stream_metadata: self.metadata.clone(),
        }
    }
}

/// Materializes plain-RTP egress bindings per producer
pub struct EgressBridge {
    factory: Arc<TransportFactory>,
    router: Arc<MediaRouter>,
    registry: Arc<DeviceRegistry>,
    bindings: Mutex<HashMap<ProducerId, EgressBinding>>,
}

impl EgressBridge {
    /// Build the bridge
    pub fn new(
        factory: Arc<TransportFactory>,
        router: Arc<MediaRouter>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            factory,
            router,
            registry,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Attach (or return the existing) plain-RTP egress for a producer
    ///
    /// The bindings lock is held across the whole call, so concurrent
    /// duplicate requests collapse onto one binding.
    ///
    /// # Errors
    ///
    /// [`EgressError::UnknownProducer`] for a dead id,
    /// [`EgressError::PortsExhausted`] when the pool is drained (any
    /// partially acquired port is released first),
    /// [`EgressError::UnsupportedCapabilities`] when the sink cannot decode
    /// the producer, and [`EgressError::ProducerClosed`] when the producer
    /// died mid-request.
    #[tracing::instrument(skip(self, capabilities), fields(stream_id = %stream_id, producer_id = %producer_id))]
    pub async fn consume_stream(
        &self,
        stream_id: &StreamId,
        producer_id: ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<EgressConsumeReply, EgressError> {
        let mut bindings = self.bindings.lock().await;

        if let Some(existing) = bindings.get(&producer_id) {
            info!(producer_id = %producer_id, port = existing.tuple.port, "egress binding reused");
            return Ok(existing.reply());
        }

        if self.router.producer(producer_id).await.is_none() {
            return Err(EgressError::UnknownProducer(producer_id));
        }
        let stream = self
            .registry
            .stream_by_producer(producer_id)
            .await
            .ok_or_else(|| EgressError::UnknownStream(stream_id.clone()))?;

        let transport = self
            .factory
            .create_egress_transport()
            .await
            .map_err(|e| match e {
                crate::transport::FactoryError::PortsExhausted => EgressError::PortsExhausted,
                crate::transport::FactoryError::Worker(e) => {
                    EgressError::Router(RouterError::Worker(e))
                }
            })?;
        let pair = transport.pair;
        let transport_id = transport.id;
        let tuple = EgressTransportInfo {
            id: transport_id,
            ip: transport.ip,
            port: transport.port,
            rtcp_port: transport.rtcp_port,
            protocol: "udp".to_string(),
        };
        self.router.register_egress_transport(transport).await;

        let consumer = match self
            .router
            .bind_consumer(transport_id, producer_id, capabilities)
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                self.teardown_transport(transport_id, pair).await;
                return Err(match e {
                    RouterError::UnsupportedCapabilities(_) => EgressError::UnsupportedCapabilities,
                    RouterError::UnknownProducer(_) => EgressError::ProducerClosed,
                    other => EgressError::Router(other),
                });
            }
        };

        // the producer may have closed while the consumer was being set up;
        // release everything and report it gone
        if self.router.producer(producer_id).await.is_none() {
            self.teardown_transport(transport_id, pair).await;
            return Err(EgressError::ProducerClosed);
        }

        let binding = EgressBinding {
            consumer_id: consumer.id,
            transport_id,
            stream_id: stream.id.clone(),
            tuple,
            rtp_parameters: consumer.rtp_parameters.clone(),
            metadata: StreamMetadata {
                width: stream.resolution.width,
                height: stream.resolution.height,
                fps: stream.fps,
                device_name: stream.display_name().to_string(),
            },
            pair,
            created_at: Utc::now(),
        };
        info!(
            producer_id = %producer_id,
            stream_id = %binding.stream_id,
            port = binding.tuple.port,
            rtcp_port = binding.tuple.rtcp_port,
            "egress binding created"
        );
        let reply = binding.reply();
        bindings.insert(producer_id, binding);
        Ok(reply)
    }

    /// Destroy the binding of a producer, if one exists
    ///
    /// Runs as part of the producer-close cascade, before `stream-ended` is
    /// broadcast: closes the consumer and egress transport and returns the
    /// port pair to the pool.
    pub async fn teardown_for_producer(&self, producer_id: ProducerId) -> Option<EgressBinding> {
        let binding = self.bindings.lock().await.remove(&producer_id)?;
        info!(
            producer_id = %producer_id,
            transport_id = %binding.transport_id,
            "egress binding destroyed"
        );
        self.teardown_transport(binding.transport_id, binding.pair).await;
        Some(binding)
    }

    /// Drop the binding whose egress transport is already gone
    ///
    /// Used when the worker reports the transport closed from its side; the
    /// caller releases the port pair.
    pub async fn forget_transport(&self, transport_id: TransportId) -> Option<EgressBinding> {
        let mut bindings = self.bindings.lock().await;
        let producer_id = bindings
            .iter()
            .find(|(_, b)| b.transport_id == transport_id)
            .map(|(id, _)| *id)?;
        bindings.remove(&producer_id)
    }

    async fn teardown_transport(&self, transport_id: TransportId, pair: PortPair) {
        if self.router.close_transport(transport_id).await.is_none() {
            warn!(transport_id = %transport_id, "egress transport already gone");
        }
        self.factory.release_egress_pair(pair).await;
    }

    /// Current bindings (admin view)
    pub async fn bindings(&self) -> Vec<EgressBinding> {
        self.bindings.lock().await.values().cloned().collect()
    }
}
