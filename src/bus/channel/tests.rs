use super::*;
use bytes::Bytes;
use std::time::Duration;

fn frame(routing_key: &str) -> Frame {
    Frame::new(routing_key, "s/0/1", Bytes::from_static(b"{}"))
}

async fn next_frame(stream: &mut FrameStream) -> Option<Result<Frame>> {
    tokio::time::timeout(Duration::from_millis(50), stream.next())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn test_publish_no_subscribers() {
    let bus = ChannelBus::new();

    // Should not error even with no receivers
    let result = bus.publish(Exchange::Requests, frame("sensor.a")).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_subscribe_and_receive() {
    let bus = ChannelBus::new();
    let mut stream = bus
        .subscribe(&Subscription::new("svc", Exchange::Requests).bind("sensor.#"))
        .await
        .unwrap();

    bus.publish(Exchange::Requests, frame("sensor.a.temperature"))
        .await
        .unwrap();

    let received = next_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(received.routing_key, "sensor.a.temperature");
}

#[tokio::test]
async fn test_binding_filter() {
    let bus = ChannelBus::new();
    let mut stream = bus
        .subscribe(&Subscription::new("svc", Exchange::Requests).bind("sensor.*.temperature"))
        .await
        .unwrap();

    bus.publish(Exchange::Requests, frame("sensor.a.humidity"))
        .await
        .unwrap();
    bus.publish(Exchange::Requests, frame("sensor.a.temperature"))
        .await
        .unwrap();

    // Only the matching frame arrives
    let received = next_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(received.routing_key, "sensor.a.temperature");
    assert!(next_frame(&mut stream).await.is_none());
}

#[tokio::test]
async fn test_exchanges_are_separate() {
    let bus = ChannelBus::new();
    let mut stream = bus
        .subscribe(&Subscription::new("monitor", Exchange::Alerts).bind("#"))
        .await
        .unwrap();

    bus.publish(Exchange::Requests, frame("status.a")).await.unwrap();
    assert!(next_frame(&mut stream).await.is_none());

    bus.publish(Exchange::Alerts, frame("status.a")).await.unwrap();
    assert!(next_frame(&mut stream).await.is_some());
}

#[tokio::test]
async fn test_one_copy_per_queue_even_with_overlapping_bindings() {
    let bus = ChannelBus::new();
    let mut stream = bus
        .subscribe(
            &Subscription::new("svc", Exchange::Requests)
                .bind("sensor.#")
                .bind("sensor.a"),
        )
        .await
        .unwrap();

    bus.publish(Exchange::Requests, frame("sensor.a")).await.unwrap();

    assert!(next_frame(&mut stream).await.is_some());
    assert!(next_frame(&mut stream).await.is_none());
}

#[tokio::test]
async fn test_clones_share_exchanges() {
    let publisher = ChannelBus::new();
    let subscriber = publisher.clone();
    let mut stream = subscriber
        .subscribe(&Subscription::new("svc", Exchange::Requests).bind("svc.#"))
        .await
        .unwrap();

    publisher
        .publish(Exchange::Requests, frame("svc.ping"))
        .await
        .unwrap();

    assert!(next_frame(&mut stream).await.is_some());
}

#[tokio::test]
async fn test_bind_after_subscribe() {
    let bus = ChannelBus::new();
    let mut stream = bus
        .subscribe(&Subscription::new("svc", Exchange::Requests))
        .await
        .unwrap();

    bus.bind("svc", Exchange::Requests, "pump.*").await.unwrap();
    bus.publish(Exchange::Requests, frame("pump.a")).await.unwrap();

    assert!(next_frame(&mut stream).await.is_some());
}

#[tokio::test]
async fn test_bind_unknown_queue_fails() {
    let bus = ChannelBus::new();
    let result = bus.bind("nope", Exchange::Requests, "a.b").await;
    assert!(matches!(result, Err(BusError::Subscribe(_))));
}

#[tokio::test]
async fn test_second_consumer_rejected_until_first_dropped() {
    let bus = ChannelBus::new();
    let sub = Subscription::new("svc", Exchange::Requests).bind("svc.#");
    let stream = bus.subscribe(&sub).await.unwrap();

    assert!(matches!(
        bus.subscribe(&sub).await,
        Err(BusError::Subscribe(_))
    ));

    drop(stream);
    assert!(bus.subscribe(&sub).await.is_ok());
}

#[tokio::test]
async fn test_disconnect_surfaces_connection_lost() {
    let bus = ChannelBus::new();
    let mut stream = bus
        .subscribe(&Subscription::new("svc", Exchange::Requests).bind("#"))
        .await
        .unwrap();

    bus.disconnect().await;

    assert_eq!(bus.connection_state(), ConnectionState::Lost);
    assert!(matches!(
        next_frame(&mut stream).await,
        Some(Err(BusError::ConnectionLost(_)))
    ));
    assert!(matches!(
        bus.publish(Exchange::Requests, frame("a")).await,
        Err(BusError::ConnectionLost(_))
    ));

    bus.reconnect();
    assert_eq!(bus.connection_state(), ConnectionState::Connected);
    assert!(bus.queue_names().await.is_empty());
}

#[tokio::test]
async fn test_invalid_binding_rejected() {
    let bus = ChannelBus::new();
    let result = bus
        .subscribe(&Subscription::new("svc", Exchange::Requests).bind("a..b"))
        .await;
    assert!(matches!(result, Err(BusError::Subscribe(_))));
}

#[tokio::test]
async fn test_full_queue_counts_dropped_frames() {
    let bus = ChannelBus::with_capacity(1);
    let mut stream = bus
        .subscribe(&Subscription::new("svc", Exchange::Requests).bind("sensor.#"))
        .await
        .unwrap();

    for _ in 0..3 {
        assert!(bus.publish(Exchange::Requests, frame("sensor.a")).await.is_ok());
    }

    assert_eq!(bus.dropped_frames(), 2);
    assert!(next_frame(&mut stream).await.unwrap().is_ok());
    assert!(next_frame(&mut stream).await.is_none());

    // Drops are shared between clones.
    let clone = bus.clone();
    assert_eq!(clone.dropped_frames(), 2);
}
