//! Fabric composition and orchestration
//!
//! [`FabricService`] wires the worker link, router, registry, egress bridge
//! and event broker together, opens sessions, and runs the close cascades
//! that keep the ownership tree consistent: a producer close destroys its
//! egress binding before the stream record (and its `stream-ended`
//! broadcast), a transport close takes its producers and consumers with it.
//!
//! Worker-side closures (ICE failure, kernel errors) arrive as notifications
//! and trigger the same cascades, scoped to the closed object. Loss of the
//! worker channel is terminal: the service flags it and the embedder exits.

use crate::config::{ConfigError, FabricConfig, WorkerConfig};
use crate::egress::EgressBridge;
use crate::events::EventBroker;
use crate::registry::DeviceRegistry;
use crate::router::{MediaRouter, RouterError};
use crate::rtp::RtpCapabilities;
use crate::session::Session;
use crate::signaling::{EgressTransportInfo, FabricEvent};
use crate::transport::TransportFactory;
use crate::types::{DeviceSnapshot, ProducerId, SessionId, StreamId, StreamInfo, TransportId};
use crate::worker::{WorkerError, WorkerLink, WorkerNotification, WorkerProcess};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

/// Service construction errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The injected configuration is unsound
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The worker could not be spawned or reached
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// The routing context could not be created
    #[error(transparent)]
    Router(#[from] RouterError),
}

/// The assembled ingest fabric
pub struct FabricService {
    config: FabricConfig,
    broker: Arc<EventBroker>,
    registry: Arc<DeviceRegistry>,
    factory: Arc<TransportFactory>,
    router: Arc<MediaRouter>,
    egress: Arc<EgressBridge>,
    died: watch::Receiver<bool>,
}

impl FabricService {
    /// Assemble the fabric on an existing worker link
    ///
    /// Validates the configuration, creates the routing context, and starts
    /// watching worker notifications.
    ///
    /// # Errors
    ///
    /// Configuration, worker, and router initialization failures.
    pub async fn new(
        config: FabricConfig,
        worker: Arc<dyn WorkerLink>,
    ) -> Result<Arc<Self>, ServiceError> {
        config.validate()?;

        let broker = Arc::new(EventBroker::default());
        let registry = Arc::new(DeviceRegistry::new(
            Arc::clone(&broker),
            config.grace_window,
        ));
        let factory = Arc::new(TransportFactory::new(&config, Arc::clone(&worker)));
        let router = Arc::new(MediaRouter::new(
            &config,
            Arc::clone(&worker),
            Arc::clone(&factory),
            Arc::clone(&registry),
        ));
        let egress = Arc::new(EgressBridge::new(
            Arc::clone(&factory),
            Arc::clone(&router),
            Arc::clone(&registry),
        ));

        router.initialize().await?;

        let (died_tx, died_rx) = watch::channel(false);
        let service = Arc::new(Self {
            config,
            broker,
            registry,
            factory,
            router,
            egress,
            died: died_rx,
        });
        Self::spawn_worker_watch(Arc::downgrade(&service), worker.notifications(), died_tx);
        info!("fabric service ready");
        Ok(service)
    }

    /// Spawn the SFU worker subprocess and assemble the fabric on it
    ///
    /// # Errors
    ///
    /// Spawn and initialization failures.
    pub async fn with_worker_process(config: FabricConfig) -> Result<Arc<Self>, ServiceError> {
        let worker_config: WorkerConfig = config.worker.clone();
        let worker = Arc::new(WorkerProcess::spawn(&worker_config, config.webrtc_ports)?);
        Self::new(config, worker).await
    }

    fn spawn_worker_watch(
        service: Weak<Self>,
        mut notifications: broadcast::Receiver<WorkerNotification>,
        died: watch::Sender<bool>,
    ) {
        tokio::spawn(async move {
            loop {
                let notification = match notifications.recv().await {
                    Ok(n) => n,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "worker notifications lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(service) = service.upgrade() else {
                    break;
                };
                match notification {
                    WorkerNotification::TransportClosed { transport_id } => {
                        info!(transport_id = %transport_id, "worker reported transport closed");
                        service.close_transport_cascade(transport_id).await;
                    }
                    WorkerNotification::ProducerClosed { producer_id } => {
                        info!(producer_id = %producer_id, "worker reported producer closed");
                        service.close_producer_cascade(producer_id).await;
                    }
                    WorkerNotification::Died { reason } => {
                        error!(reason = %reason, "worker channel lost; fabric is terminal");
                        let _ = died.send(true);
                        break;
                    }
                }
            }
        });
    }

    /// Open a session for a freshly accepted signaling channel
    pub fn open_session(self: &Arc<Self>) -> Arc<Session> {
        let session = Arc::new(Session::new(SessionId::new(), Arc::clone(self)));
        info!(session_id = %session.id(), "session opened");
        session
    }

    /// Close a producer, its egress binding, and its stream record
    ///
    /// The binding dies before `stream-ended` goes out; device streaming
    /// flags are cleared quietly (the stream events tell the story).
    pub async fn close_producer_cascade(&self, producer_id: ProducerId) {
        let closed = self.router.close_producer(producer_id).await;
        self.egress.teardown_for_producer(producer_id).await;
        if let Some(closed) = closed {
            if closed.producer.kind == crate::types::MediaKind::Video {
                self.registry.remove_stream_by_producer(producer_id).await;
            }
        }
    }

    /// Close a transport and everything reachable from it
    ///
    /// The same cascade a session close runs, scoped to one transport.
    pub async fn close_transport_cascade(&self, transport_id: TransportId) {
        let Some(closed) = self.router.close_transport(transport_id).await else {
            return;
        };
        if let Some(egress) = closed.egress {
            self.egress.forget_transport(egress.id).await;
            self.factory.release_egress_pair(egress.pair).await;
        }
        for producer in closed.producers {
            self.egress.teardown_for_producer(producer.id).await;
            if producer.kind == crate::types::MediaKind::Video {
                self.registry.remove_stream_by_producer(producer.id).await;
            }
        }
    }

    /// Subscribe to lifecycle broadcasts
    pub fn events(&self) -> broadcast::Receiver<FabricEvent> {
        self.broker.subscribe()
    }

    /// Watch for terminal worker death
    pub fn worker_died(&self) -> watch::Receiver<bool> {
        self.died.clone()
    }

    /// The injected configuration
    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// The media router
    pub fn router(&self) -> &Arc<MediaRouter> {
        &self.router
    }

    /// The device and stream registry
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// The egress bridge
    pub fn egress(&self) -> &Arc<EgressBridge> {
        &self.egress
    }

    // ------------------------------------------------------------------
    // Read-only views consumed by the admin HTTP surface
    // ------------------------------------------------------------------

    /// Router RTP capabilities
    ///
    /// # Errors
    ///
    /// [`RouterError::NotInitialized`] before startup completes.
    pub fn capabilities(&self) -> Result<RtpCapabilities, RouterError> {
        self.router.capabilities().map(Clone::clone)
    }

    /// All currently publishable streams
    pub async fn active_streams(&self) -> Vec<StreamInfo> {
        self.registry.active_streams().await
    }

    /// One stream by id
    pub async fn stream(&self, stream_id: &StreamId) -> Option<StreamInfo> {
        self.registry.stream(stream_id).await
    }

    /// All registered devices
    pub async fn devices(&self) -> Vec<DeviceSnapshot> {
        self.registry.devices().await
    }

    /// All live plain-RTP egress tuples
    pub async fn plain_transports(&self) -> Vec<EgressTransportInfo> {
        self.router
            .egress_transports()
            .await
            .into_iter()
            .map(|t| EgressTransportInfo {
                id: t.id,
                ip: t.ip,
                port: t.port,
                rtcp_port: t.rtcp_port,
                protocol: "udp".to_string(),
            })
            .collect()
    }
}
