//! camfabric - media router and session fabric for mobile camera ingest
//!
//! Mobile producers publish camera tracks over WebRTC, the fabric keeps an
//! authoritative registry of devices and their publishable streams, and an
//! external NDI bridge pulls any producer back out as a plain unencrypted
//! RTP/UDP flow. Browser observers can additionally consume any producer for
//! monitoring.
//!
//! The crate is the control plane: it terminates the signaling protocol,
//! sequences negotiation per session, owns every transport/producer/consumer
//! held by the SFU worker subprocess, and synthesizes the exact RTP
//! parameters a sink needs to decode an egress flow. The worker itself is an
//! external process spoken to through [`worker::WorkerLink`]; the signaling
//! socket server and the admin HTTP surface are embedder concerns that bind
//! the types in [`signaling`] and the snapshot views on
//! [`service::FabricService`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use camfabric_core::{FabricConfig, FabricService};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Spawn the SFU worker and assemble the fabric
//! let service = FabricService::with_worker_process(FabricConfig::default()).await?;
//!
//! // One session per accepted signaling channel
//! let session = service.open_session();
//! let mut events = service.events();
//!
//! // Feed decoded requests to the session, forward replies and events
//! // to the socket...
//! # let _ = (session, events.recv().await);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Injected configuration
pub mod config;

/// Plain-RTP egress bindings for the NDI bridge
pub mod egress;

/// Lifecycle event fan-out
pub mod events;

/// Device and stream registry
pub mod registry;

/// The routing context over the worker link
pub mod router;

/// RTP capability and parameter descriptors
pub mod rtp;

/// Fabric composition and close cascades
pub mod service;

/// Per-connection signaling sessions
pub mod session;

/// Signaling wire protocol
pub mod signaling;

/// Transport creation and the egress port pool
pub mod transport;

/// Core identifiers and data-model records
pub mod types;

/// SFU worker IPC
pub mod worker;

// Re-export main types at crate root
pub use config::{CodecSpec, EgressConfig, FabricConfig, PortRange, WorkerConfig};
pub use egress::{EgressBinding, EgressBridge, EgressError};
pub use events::EventBroker;
pub use registry::{DeviceRegistry, RegistryError, StreamSynthesis};
pub use router::{Consumer, MediaRouter, Producer, RouterError};
pub use rtp::{RtpCapabilities, RtpParameters};
pub use service::{FabricService, ServiceError};
pub use session::{Session, SessionPhase};
pub use signaling::{
    ErrorKind, FabricEvent, ReplyEnvelope, RequestEnvelope, RequestResult, SignalingReply,
    SignalingRequest,
};
pub use transport::{DtlsParameters, IceCandidate, IceParameters, PortPair, PortPool};
pub use types::{
    AppData, ConsumerId, DeviceId, DeviceSnapshot, MediaKind, ProducerId, Resolution, SessionId,
    StreamId, StreamInfo, TransportId,
};
pub use worker::{WorkerError, WorkerLink, WorkerNotification, WorkerProcess, WorkerRequest};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::FabricConfig;
    pub use crate::service::FabricService;
    pub use crate::session::{Session, SessionPhase};
    pub use crate::signaling::{
        ErrorKind, FabricEvent, SignalingReply, SignalingRequest,
    };
    pub use crate::types::{DeviceId, MediaKind, ProducerId, SessionId, StreamId, TransportId};
    pub use crate::worker::{WorkerLink, WorkerProcess};
}
