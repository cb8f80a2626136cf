//! End-to-end flows through the assembled fabric
//!
//! Each test drives full sessions against an in-process worker link and
//! asserts the exact lifecycle broadcasts observers would see.

mod common;

use camfabric_core::signaling::{FabricEvent, SignalingReply, SignalingRequest};
use camfabric_core::worker::WorkerNotification;
use camfabric_core::{DeviceId, MediaKind};
use common::*;
use std::time::Duration;

#[tokio::test]
async fn happy_path_video_ingest_emits_in_order() {
    let (service, _worker) = fabric().await;
    let mut events = service.events();

    let session = service.open_session();
    session
        .handle(SignalingRequest::RegisterDevice {
            device_id: Some("dev-A".to_string()),
            device_name: Some("Pixel 8".to_string()),
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
    let produced = match session
        .handle(SignalingRequest::Produce {
            transport_id,
            kind: MediaKind::Video,
            rtp_parameters: video_rtp_parameters(),
        })
        .await
        .unwrap()
    {
        SignalingReply::Produced(reply) => reply,
        other => panic!("unexpected reply: {other:?}"),
    };
    assert_eq!(produced.kind, MediaKind::Video);

    let drained = drain_events(&mut events);
    assert_eq!(
        event_names(&drained),
        ["device-connected", "stream-started", "device-streaming-changed"]
    );
    match &drained[1] {
        FabricEvent::StreamStarted { stream } => {
            assert!(stream
                .id
                .as_str()
                .starts_with(&format!("stream-{transport_id}-")));
            assert_eq!(stream.producer_id, produced.id);
            assert_eq!(stream.device_id, DeviceId::from("dev-A"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match &drained[2] {
        FabricEvent::DeviceStreamingChanged {
            device_id,
            is_streaming,
            stream_id,
        } => {
            assert_eq!(device_id, &DeviceId::from("dev-A"));
            assert!(is_streaming);
            assert!(stream_id.is_some());
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn audio_producers_never_yield_streams() {
    let (service, _worker) = fabric().await;
    let session = service.open_session();
    let transport_id = negotiate_send_transport(&session, "dev-A").await;

    let mut events = service.events();
    session
        .handle(SignalingRequest::Produce {
            transport_id,
            kind: MediaKind::Audio,
            rtp_parameters: audio_rtp_parameters(),
        })
        .await
        .unwrap();

    assert!(drain_events(&mut events).is_empty());
    assert!(service.active_streams().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn listing_tracks_started_and_ended_streams() {
    let (service, _worker) = fabric().await;

    let first = service.open_session();
    let (_, _, stream_a) = start_video_ingest(&first, "dev-A").await;
    let second = service.open_session();
    let (_, _, stream_b) = start_video_ingest(&second, "dev-B").await;

    let listed: Vec<_> = service
        .active_streams()
        .await
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&stream_a));
    assert!(listed.contains(&stream_b));

    // ending one producer drops exactly its stream from the listing
    first.close().await;
    let listed: Vec<_> = service
        .active_streams()
        .await
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(listed, vec![stream_b]);
}

#[tokio::test]
async fn monitor_consumers_forward_any_producer() {
    let (service, _worker) = fabric().await;
    let producer_session = service.open_session();
    let (_, producer_id, _) = start_video_ingest(&producer_session, "dev-A").await;

    let observer = service.open_session();
    observer
        .handle(SignalingRequest::RegisterDevice {
            device_id: Some("dashboard-1".to_string()),
            device_name: None,
        })
        .await
        .unwrap();
    let recv_id = match observer
        .handle(SignalingRequest::CreateRecvTransport)
        .await
        .unwrap()
    {
        SignalingReply::TransportCreated(reply) => reply.id,
        other => panic!("unexpected reply: {other:?}"),
    };
    observer
        .handle(SignalingRequest::ConnectRecvTransport {
            transport_id: recv_id,
            dtls_parameters: client_dtls(),
        })
        .await
        .unwrap();
    let consumer = match observer
        .handle(SignalingRequest::ConsumeStream {
            transport_id: recv_id,
            producer_id,
            rtp_capabilities: service.capabilities().unwrap(),
        })
        .await
        .unwrap()
    {
        SignalingReply::Consumer(reply) => reply,
        other => panic!("unexpected reply: {other:?}"),
    };

    // the forwarded parameters keep the producer's payload type
    assert_eq!(consumer.rtp_parameters.codecs[0].payload_type, 96);
    observer
        .handle(SignalingRequest::ResumeConsumer {
            consumer_id: consumer.id,
        })
        .await
        .unwrap();

    // closing the producer's session takes the monitor consumer with it
    producer_session.close().await;
    let gone = observer
        .handle(SignalingRequest::ResumeConsumer {
            consumer_id: consumer.id,
        })
        .await;
    assert!(gone.is_err());
}

#[tokio::test(start_paused = true)]
async fn worker_reported_transport_closure_runs_the_cascade() {
    let (service, worker) = fabric().await;
    let session = service.open_session();
    let (transport_id, producer_id, stream_id) = start_video_ingest(&session, "dev-A").await;

    let mut events = service.events();
    worker.emit(WorkerNotification::TransportClosed { transport_id });
    // let the notification task run
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(service.router().producer(producer_id).await.is_none());
    assert!(service.stream(&stream_id).await.is_none());
    let drained = drain_events(&mut events);
    assert_eq!(event_names(&drained), ["stream-ended"]);

    // the device keeps its channel: no disconnect, no removal
    assert!(service
        .registry()
        .device(&DeviceId::from("dev-A"))
        .await
        .is_some_and(|d| d.connected));
}

#[tokio::test(start_paused = true)]
async fn full_reconnect_cycle_preserves_operator_state() {
    let (service, _worker) = fabric().await;

    // first life: ingest and an operator label
    let first = service.open_session();
    let (_, _, stream_id) = start_video_ingest(&first, "dev-A").await;
    let operator = service.open_session();
    operator
        .handle(SignalingRequest::UpdateStreamName {
            stream_id,
            name: "CAM-LEFT".to_string(),
        })
        .await
        .unwrap();
    first.close().await;

    // the device reconnects within grace on a new session and produces on a
    // new transport: a new stream id, but the device name survives in the
    // registry
    tokio::time::sleep(Duration::from_secs(5)).await;
    let second = service.open_session();
    let (_, _, new_stream) = start_video_ingest(&second, "dev-A").await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    let device = service
        .registry()
        .device(&DeviceId::from("dev-A"))
        .await
        .unwrap();
    assert!(device.connected);
    assert!(device.streaming);
    assert_eq!(device.stream_id, Some(new_stream));
}

#[tokio::test]
async fn bridge_and_monitor_share_one_producer() {
    let (service, _worker) = fabric().await;
    let session = service.open_session();
    let (_, producer_id, stream_id) = start_video_ingest(&session, "dev-A").await;

    // the sink takes a plain egress
    let sink = service.open_session();
    let egress = match sink
        .handle(SignalingRequest::NdiBridgeConsumeStream {
            stream_id: stream_id.clone(),
            producer_id,
            rtp_capabilities: service.capabilities().unwrap(),
        })
        .await
        .unwrap()
    {
        SignalingReply::Egress(reply) => reply,
        other => panic!("unexpected reply: {other:?}"),
    };

    // a browser monitor consumes the same producer over WebRTC
    let observer = service.open_session();
    observer
        .handle(SignalingRequest::RegisterDevice {
            device_id: Some("dashboard-1".to_string()),
            device_name: None,
        })
        .await
        .unwrap();
    let recv_id = match observer
        .handle(SignalingRequest::CreateRecvTransport)
        .await
        .unwrap()
    {
        SignalingReply::TransportCreated(reply) => reply.id,
        other => panic!("unexpected reply: {other:?}"),
    };
    observer
        .handle(SignalingRequest::ConnectRecvTransport {
            transport_id: recv_id,
            dtls_parameters: client_dtls(),
        })
        .await
        .unwrap();
    observer
        .handle(SignalingRequest::ConsumeStream {
            transport_id: recv_id,
            producer_id,
            rtp_capabilities: service.capabilities().unwrap(),
        })
        .await
        .unwrap();

    // one egress binding, one plain transport, both forwarding the producer
    assert_eq!(service.egress().bindings().await.len(), 1);
    assert_eq!(service.plain_transports().await.len(), 1);

    // producer teardown cleans every leg
    let mut events = service.events();
    session.close().await;
    let drained = drain_events(&mut events);
    assert_eq!(event_names(&drained), ["stream-ended", "device-disconnected"]);
    assert!(service.egress().bindings().await.is_empty());
    assert!(service.plain_transports().await.is_empty());
    assert!(service.active_streams().await.is_empty());
    let _ = egress;
}
