//! Device and stream registry
//!
//! The authoritative mapping between externally-visible device identities,
//! open signaling sessions, producers, and publishable streams. All
//! mutations commit under the single writer lock and hand their lifecycle
//! broadcast to the broker before the lock drops, so observers see events in
//! commit order per device.
//!
//! A disconnected device is not deleted immediately: removal is a
//! cancellable scheduled task keyed by device id, and only the cancellation
//! handle is stored on the record. Re-registration (or a produce attributed
//! to the device) inside the grace window cancels it.

use crate::events::EventBroker;
use crate::signaling::FabricEvent;
use crate::types::{
    DeviceId, DeviceSnapshot, ProducerId, Resolution, SessionId, StreamId, StreamInfo, TransportId,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Registry lookup errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No device with this id
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    /// No stream with this id
    #[error("unknown stream: {0}")]
    UnknownStream(StreamId),
}

#[derive(Debug)]
struct Device {
    device_id: DeviceId,
    device_name: Option<String>,
    session: Option<SessionId>,
    connected: bool,
    streaming: bool,
    stream_id: Option<StreamId>,
    last_seen: chrono::DateTime<Utc>,
    removal: Option<AbortHandle>,
}

impl Device {
    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            session_id: self.session,
            connected: self.connected,
            streaming: self.streaming,
            stream_id: self.stream_id.clone(),
            last_seen: self.last_seen,
        }
    }

    fn cancel_removal(&mut self) {
        if let Some(handle) = self.removal.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    devices: HashMap<DeviceId, Device>,
    sessions: HashMap<SessionId, DeviceId>,
    streams: HashMap<StreamId, StreamInfo>,
    by_producer: HashMap<ProducerId, StreamId>,
    by_transport: HashMap<TransportId, StreamId>,
}

/// Inputs for synthesizing or refreshing a stream record
#[derive(Debug, Clone)]
pub struct StreamSynthesis {
    /// Client transport carrying the producer
    pub transport_id: TransportId,
    /// The new producer
    pub producer_id: ProducerId,
    /// Owning device
    pub device_id: DeviceId,
    /// Device display name at this instant
    pub device_name: String,
    /// Nominal geometry after encoder scaling
    pub resolution: Resolution,
    /// Nominal frame rate
    pub fps: u32,
    /// Nominal bitrate
    pub bitrate: u32,
}

/// The device and stream registry
pub struct DeviceRegistry {
    broker: Arc<EventBroker>,
    grace: Duration,
    state: Arc<RwLock<RegistryState>>,
}

impl DeviceRegistry {
    /// Create a registry emitting on the given broker
    pub fn new(broker: Arc<EventBroker>, grace: Duration) -> Self {
        Self {
            broker,
            grace,
            state: Arc::new(RwLock::new(RegistryState::default())),
        }
    }

    /// Register or re-register a device onto a session
    ///
    /// Cancels any pending removal, rebinds the session cleanly, and keeps
    /// the existing name when the new registration omits one. Always emits
    /// `device-connected`.
    pub async fn upsert(
        &self,
        device_id: DeviceId,
        device_name: Option<String>,
        session: SessionId,
    ) -> DeviceSnapshot {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let device = state
            .devices
            .entry(device_id.clone())
            .or_insert_with(|| Device {
                device_id: device_id.clone(),
                device_name: None,
                session: None,
                connected: false,
                streaming: false,
                stream_id: None,
                last_seen: now,
                removal: None,
            });

        device.cancel_removal();
        if device_name.is_some() {
            device.device_name = device_name;
        }
        let previous_session = device.session.replace(session);
        device.connected = true;
        device.last_seen = now;
        let snapshot = device.snapshot();

        if let Some(old) = previous_session {
            if old != session {
                state.sessions.remove(&old);
            }
        }
        state.sessions.insert(session, device_id.clone());

        info!(device_id = %device_id, session_id = %session, "device registered");
        self.broker.emit(FabricEvent::DeviceConnected {
            device_id,
            device_name: snapshot.device_name.clone(),
        });
        snapshot
    }

    /// Mark a device's session as gone
    ///
    /// Clears the session binding and the streaming flag without a
    /// `device-streaming-changed` broadcast; the producers were already torn
    /// down and their `stream-ended` events tell the story. Emits
    /// `device-disconnected`.
    pub async fn mark_disconnected(&self, device_id: &DeviceId) {
        let mut state = self.state.write().await;
        let Some(device) = state.devices.get_mut(device_id) else {
            return;
        };
        device.connected = false;
        device.streaming = false;
        device.stream_id = None;
        device.last_seen = Utc::now();
        let session = device.session.take();
        if let Some(session) = session {
            state.sessions.remove(&session);
        }

        info!(device_id = %device_id, "device disconnected");
        self.broker.emit(FabricEvent::DeviceDisconnected {
            device_id: device_id.clone(),
        });
    }

    /// Schedule deferred removal after the grace window
    ///
    /// The spawned task re-checks the device state when it fires, so a
    /// cancellation racing the wake-up is still safe.
    pub async fn schedule_removal(&self, device_id: DeviceId) {
        let state = Arc::clone(&self.state);
        let broker = Arc::clone(&self.broker);
        let grace = self.grace;
        let task_device = device_id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut state = state.write().await;
            let still_gone = state
                .devices
                .get(&task_device)
                .is_some_and(|d| !d.connected && !d.streaming);
            if still_gone {
                state.devices.remove(&task_device);
                info!(device_id = %task_device, "device removed after grace window");
                broker.emit(FabricEvent::DeviceRemoved {
                    device_id: task_device,
                });
            }
        })
        .abort_handle();

        let mut state = self.state.write().await;
        if let Some(device) = state.devices.get_mut(&device_id) {
            device.cancel_removal();
            device.removal = Some(handle);
            debug!(device_id = %device_id, grace_secs = grace.as_secs(), "removal scheduled");
        } else {
            handle.abort();
        }
    }

    /// Cancel a pending removal, if any
    pub async fn cancel_removal(&self, device_id: &DeviceId) {
        let mut state = self.state.write().await;
        if let Some(device) = state.devices.get_mut(device_id) {
            device.cancel_removal();
        }
    }

    /// Flip the streaming flag
    ///
    /// Setting the flag implicitly reconnects the device and cancels any
    /// pending removal (a produce during the grace window keeps the device
    /// alive). Emits `device-streaming-changed`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownDevice`] for an unregistered id.
    pub async fn set_streaming(
        &self,
        device_id: &DeviceId,
        streaming: bool,
        stream_id: Option<StreamId>,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        let device = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.clone()))?;

        if streaming {
            device.cancel_removal();
            device.connected = true;
        }
        device.streaming = streaming;
        device.stream_id = stream_id.clone();
        device.last_seen = Utc::now();

        self.broker.emit(FabricEvent::DeviceStreamingChanged {
            device_id: device_id.clone(),
            is_streaming: streaming,
            stream_id,
        });
        Ok(())
    }

    /// Synthesize a stream record for a video producer, or refresh the
    /// record already bound to its client transport
    ///
    /// A refresh preserves the stream id and any operator-assigned name, so
    /// labels survive producer re-creation on client reconnect. Emits
    /// `stream-started` either way; observers treat a repeat for a known id
    /// as a refresh.
    pub async fn upsert_stream(&self, synthesis: StreamSynthesis) -> StreamInfo {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let mut refreshed = None;
        if let Some(stream_id) = state.by_transport.get(&synthesis.transport_id).cloned() {
            if let Some(stream) = state.streams.get_mut(&stream_id) {
                let old_producer = stream.producer_id;
                stream.producer_id = synthesis.producer_id;
                stream.device_id = synthesis.device_id.clone();
                stream.device_name = synthesis.device_name.clone();
                stream.resolution = synthesis.resolution;
                stream.fps = synthesis.fps;
                stream.bitrate = synthesis.bitrate;
                stream.created_at = now;
                let stream = stream.clone();
                state.by_producer.remove(&old_producer);
                state.by_producer.insert(synthesis.producer_id, stream_id);
                debug!(stream_id = %stream.id, "stream record refreshed");
                refreshed = Some(stream);
            }
        }
        let stream = match refreshed {
            Some(stream) => stream,
            None => self.insert_new_stream(&mut state, synthesis, now),
        };

        self.broker.emit(FabricEvent::StreamStarted {
            stream: stream.clone(),
        });
        stream
    }

    fn insert_new_stream(
        &self,
        state: &mut RegistryState,
        synthesis: StreamSynthesis,
        now: chrono::DateTime<Utc>,
    ) -> StreamInfo {
        let id = StreamId::for_transport(synthesis.transport_id, now);
        let stream = StreamInfo {
            id: id.clone(),
            producer_id: synthesis.producer_id,
            transport_id: synthesis.transport_id,
            device_id: synthesis.device_id,
            device_name: synthesis.device_name,
            custom_name: None,
            resolution: synthesis.resolution,
            fps: synthesis.fps,
            bitrate: synthesis.bitrate,
            created_at: now,
        };
        state.streams.insert(id.clone(), stream.clone());
        state.by_producer.insert(synthesis.producer_id, id.clone());
        state.by_transport.insert(synthesis.transport_id, id.clone());
        info!(stream_id = %id, device_id = %stream.device_id, "stream record created");
        stream
    }

    /// Remove the stream fed by a producer
    ///
    /// Quietly clears the owning device's streaming flag when it pointed at
    /// this stream, then emits `stream-ended`.
    pub async fn remove_stream_by_producer(&self, producer_id: ProducerId) -> Option<StreamInfo> {
        let mut state = self.state.write().await;
        let stream_id = state.by_producer.remove(&producer_id)?;
        let stream = state.streams.remove(&stream_id)?;
        state.by_transport.remove(&stream.transport_id);
        if let Some(device) = state.devices.get_mut(&stream.device_id) {
            if device.stream_id.as_ref() == Some(&stream_id) {
                device.streaming = false;
                device.stream_id = None;
            }
        }

        info!(stream_id = %stream_id, "stream record removed");
        self.broker.emit(FabricEvent::StreamEnded {
            stream_id: stream_id.clone(),
        });
        Some(stream)
    }

    /// Assign an operator display name to a stream
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownStream`] for an unknown id.
    pub async fn rename_stream(
        &self,
        stream_id: &StreamId,
        name: String,
    ) -> Result<StreamInfo, RegistryError> {
        let mut state = self.state.write().await;
        let stream = state
            .streams
            .get_mut(stream_id)
            .ok_or_else(|| RegistryError::UnknownStream(stream_id.clone()))?;
        stream.custom_name = Some(name.clone());
        let stream = stream.clone();

        info!(stream_id = %stream_id, name = %name, "stream renamed");
        self.broker.emit(FabricEvent::StreamNameUpdated {
            stream_id: stream_id.clone(),
            name,
            stream: stream.clone(),
        });
        Ok(stream)
    }

    /// All currently publishable streams
    pub async fn active_streams(&self) -> Vec<StreamInfo> {
        self.state.read().await.streams.values().cloned().collect()
    }

    /// A stream by id
    pub async fn stream(&self, stream_id: &StreamId) -> Option<StreamInfo> {
        self.state.read().await.streams.get(stream_id).cloned()
    }

    /// The stream a producer feeds, if any
    pub async fn stream_by_producer(&self, producer_id: ProducerId) -> Option<StreamInfo> {
        let state = self.state.read().await;
        let stream_id = state.by_producer.get(&producer_id)?;
        state.streams.get(stream_id).cloned()
    }

    /// A device by id
    pub async fn device(&self, device_id: &DeviceId) -> Option<DeviceSnapshot> {
        self.state
            .read()
            .await
            .devices
            .get(device_id)
            .map(Device::snapshot)
    }

    /// The device bound to a session, if any
    pub async fn device_by_session(&self, session: SessionId) -> Option<DeviceSnapshot> {
        let state = self.state.read().await;
        let device_id = state.sessions.get(&session)?;
        state.devices.get(device_id).map(Device::snapshot)
    }

    /// All registered devices
    pub async fn devices(&self) -> Vec<DeviceSnapshot> {
        self.state
            .read()
            .await
            .devices
            .values()
            .map(Device::snapshot)
            .collect()
    }

    /// Streams owned by the device bound to a session
    pub async fn streams_of_session(&self, session: SessionId) -> Vec<StreamInfo> {
        let state = self.state.read().await;
        let Some(device_id) = state.sessions.get(&session) else {
            return Vec::new();
        };
        state
            .streams
            .values()
            .filter(|s| &s.device_id == device_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(EventBroker::default()), Duration::from_secs(30))
    }

    fn synthesis(transport: TransportId, producer: ProducerId) -> StreamSynthesis {
        StreamSynthesis {
            transport_id: transport,
            producer_id: producer,
            device_id: DeviceId::from("dev-A"),
            device_name: "Pixel 8".to_string(),
            resolution: Resolution::default(),
            fps: 30,
            bitrate: 1_000_000,
        }
    }

    #[tokio::test]
    async fn repeated_registration_is_idempotent() {
        let registry = registry();
        let session = SessionId::new();
        let first = registry
            .upsert(DeviceId::from("dev-A"), Some("Pixel 8".to_string()), session)
            .await;
        let second = registry.upsert(DeviceId::from("dev-A"), None, session).await;

        assert_eq!(second.device_name.as_deref(), Some("Pixel 8"));
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(registry.devices().await.len(), 1);
    }

    #[tokio::test]
    async fn rebinding_transfers_the_session_cleanly() {
        let registry = registry();
        let s1 = SessionId::new();
        let s2 = SessionId::new();
        registry
            .upsert(DeviceId::from("dev-A"), Some("Pixel 8".to_string()), s1)
            .await;
        registry.upsert(DeviceId::from("dev-A"), None, s2).await;

        assert!(registry.device_by_session(s1).await.is_none());
        let via_s2 = registry.device_by_session(s2).await.unwrap();
        assert_eq!(via_s2.device_id, DeviceId::from("dev-A"));
        assert_eq!(via_s2.device_name.as_deref(), Some("Pixel 8"));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_removes_the_device_once() {
        let broker = Arc::new(EventBroker::default());
        let registry = DeviceRegistry::new(Arc::clone(&broker), Duration::from_secs(30));
        let mut events = broker.subscribe();

        let session = SessionId::new();
        registry.upsert(DeviceId::from("dev-A"), None, session).await;
        registry.mark_disconnected(&DeviceId::from("dev-A")).await;
        registry.schedule_removal(DeviceId::from("dev-A")).await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(registry.device(&DeviceId::from("dev-A")).await.is_none());

        // drain: connected, disconnected, removed, exactly once each
        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(match event {
                FabricEvent::DeviceConnected { .. } => "connected",
                FabricEvent::DeviceDisconnected { .. } => "disconnected",
                FabricEvent::DeviceRemoved { .. } => "removed",
                _ => "other",
            });
        }
        assert_eq!(kinds, ["connected", "disconnected", "removed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reregistration_within_grace_cancels_removal() {
        let registry = registry();
        let s1 = SessionId::new();
        registry.upsert(DeviceId::from("dev-A"), None, s1).await;
        registry.mark_disconnected(&DeviceId::from("dev-A")).await;
        registry.schedule_removal(DeviceId::from("dev-A")).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        let s2 = SessionId::new();
        registry.upsert(DeviceId::from("dev-A"), None, s2).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(registry.device(&DeviceId::from("dev-A")).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_during_grace_implicitly_reconnects() {
        let registry = registry();
        let session = SessionId::new();
        registry.upsert(DeviceId::from("dev-A"), None, session).await;
        registry.mark_disconnected(&DeviceId::from("dev-A")).await;
        registry.schedule_removal(DeviceId::from("dev-A")).await;

        registry
            .set_streaming(&DeviceId::from("dev-A"), true, Some(StreamId::from("s-1")))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        let device = registry.device(&DeviceId::from("dev-A")).await.unwrap();
        assert!(device.connected);
        assert!(device.streaming);
    }

    #[tokio::test]
    async fn stream_refresh_preserves_id_and_operator_name() {
        let registry = registry();
        let transport = TransportId::new();
        let p1 = ProducerId::new();
        let first = registry.upsert_stream(synthesis(transport, p1)).await;

        registry
            .rename_stream(&first.id, "CAM-LEFT".to_string())
            .await
            .unwrap();

        let p2 = ProducerId::new();
        let second = registry.upsert_stream(synthesis(transport, p2)).await;

        assert_eq!(second.id, first.id);
        assert_eq!(second.producer_id, p2);
        assert_eq!(second.custom_name.as_deref(), Some("CAM-LEFT"));
        assert!(registry.stream_by_producer(p1).await.is_none());
        assert!(registry.stream_by_producer(p2).await.is_some());
        assert_eq!(registry.active_streams().await.len(), 1);
    }

    #[tokio::test]
    async fn removing_a_stream_clears_the_device_flag_quietly() {
        let broker = Arc::new(EventBroker::default());
        let registry = DeviceRegistry::new(Arc::clone(&broker), Duration::from_secs(30));
        let session = SessionId::new();
        registry.upsert(DeviceId::from("dev-A"), None, session).await;

        let transport = TransportId::new();
        let producer = ProducerId::new();
        let stream = registry.upsert_stream(synthesis(transport, producer)).await;
        registry
            .set_streaming(&DeviceId::from("dev-A"), true, Some(stream.id.clone()))
            .await
            .unwrap();

        let mut events = broker.subscribe();
        registry.remove_stream_by_producer(producer).await.unwrap();

        let device = registry.device(&DeviceId::from("dev-A")).await.unwrap();
        assert!(!device.streaming);
        assert!(device.stream_id.is_none());

        // only the stream-ended broadcast, no streaming-changed
        assert!(matches!(
            events.try_recv().unwrap(),
            FabricEvent::StreamEnded { .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn rename_round_trips_through_the_listing() {
        let registry = registry();
        let stream = registry
            .upsert_stream(synthesis(TransportId::new(), ProducerId::new()))
            .await;
        registry
            .rename_stream(&stream.id, "CAM-LEFT".to_string())
            .await
            .unwrap();

        let listed = registry.active_streams().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].display_name(), "CAM-LEFT");
    }

    #[tokio::test]
    async fn streams_of_session_sees_only_the_bound_device() {
        let registry = registry();
        let s1 = SessionId::new();
        let s2 = SessionId::new();
        registry.upsert(DeviceId::from("dev-A"), None, s1).await;
        registry.upsert(DeviceId::from("dev-B"), None, s2).await;

        let stream_a = registry.upsert_stream(synthesis(TransportId::new(), ProducerId::new())).await;
        let mut other = synthesis(TransportId::new(), ProducerId::new());
        other.device_id = DeviceId::from("dev-B");
        registry.upsert_stream(other).await;

        let via_s1 = registry.streams_of_session(s1).await;
        assert_eq!(via_s1.len(), 1);
        assert_eq!(via_s1[0].id, stream_a.id);
        assert_eq!(registry.streams_of_session(s2).await.len(), 1);

        // an unbound session sees nothing
        assert!(registry.streams_of_session(SessionId::new()).await.is_empty());

        // rebinding the device moves its streams to the new session
        let s3 = SessionId::new();
        registry.upsert(DeviceId::from("dev-A"), None, s3).await;
        assert!(registry.streams_of_session(s1).await.is_empty());
        assert_eq!(registry.streams_of_session(s3).await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_lookups_error() {
        let registry = registry();
        assert!(matches!(
            registry
                .rename_stream(&StreamId::from("missing"), "x".to_string())
                .await,
            Err(RegistryError::UnknownStream(_))
        ));
        assert!(matches!(
            registry
                .set_streaming(&DeviceId::from("missing"), true, None)
                .await,
            Err(RegistryError::UnknownDevice(_))
        ));
    }
}
