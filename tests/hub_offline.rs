//! Hub behavior end to end over the in-process channel bus.
//!
//! Run with: cargo test --test hub_offline
//!
//! Every test wires two or more hubs to one `ChannelBus`, the same way an
//! offline deployment runs several services in one process.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dripline::bus::Subscription;
use dripline::hub::ReceiverState;
use dripline::{
    Alert, ChannelBus, Codec, CorrelationId, Endpoint, EndpointResult, Exchange, Frame, HubConfig,
    HubError, HubState, Message, MessageBus, ReplyContent, Request, Route,
};
use futures::StreamExt;
use serde_json::{json, Value};

use common::{eventually, start_hub, start_hub_with, AlertLog, Thermometer};

/// Answers `cmd` after a fixed delay.
struct Sluggish {
    delay: Duration,
}

#[async_trait]
impl Endpoint for Sluggish {
    fn name(&self) -> &str {
        "sluggish"
    }

    async fn on_cmd(&self, _request: &Request) -> EndpointResult {
        tokio::time::sleep(self.delay).await;
        Ok(ReplyContent::new(json!("done")))
    }
}

fn shared_bus() -> (ChannelBus, Arc<dyn MessageBus>) {
    let bus = ChannelBus::new();
    let shared: Arc<dyn MessageBus> = Arc::new(bus.clone());
    (bus, shared)
}

// ============================================================================
// Request / reply
// ============================================================================

#[tokio::test]
async fn test_request_reply_between_hubs() {
    let (_, bus) = shared_bus();
    let server = start_hub(bus.clone(), "cryostat").await;
    let sensor = Thermometer::new("temperature", 4.2);
    server
        .register(Route::requests("cryostat.temperature"), sensor.clone())
        .await
        .unwrap();
    let client = start_hub(bus, "operator").await;

    let reply = client
        .send_request(Request::get("cryostat.temperature"), Duration::from_secs(2))
        .await
        .unwrap();

    assert!(reply.is_success());
    assert_eq!(reply.payload(), &json!(4.2));
    assert_eq!(reply.sender().service_name, "cryostat");
    assert_eq!(sensor.handled(), 1);
    assert_eq!(client.outstanding_requests(), 0);
}

#[tokio::test]
async fn test_set_then_get_sees_new_value() {
    let (_, bus) = shared_bus();
    let server = start_hub(bus.clone(), "cryostat").await;
    server
        .register(Route::requests("heater.power"), Thermometer::new("heater", 0.0))
        .await
        .unwrap();
    let client = start_hub(bus, "operator").await;

    let set = client
        .send_request(Request::set("heater.power", json!(1.5)), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(set.return_msg(), "stored");

    let get = client
        .send_request(Request::get("heater.power"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(get.payload(), &json!(1.5));
}

#[tokio::test]
async fn test_dedicated_route_is_answered_once() {
    let (_, bus) = shared_bus();
    let server = start_hub(bus.clone(), "cryostat").await;
    let pump = Thermometer::new("pump", 1.0);
    // Reaches both the dedicated queue and the service queue's
    // `cryostat.#` binding.
    server
        .register(Route::requests("cryostat.pump").dedicated(), pump.clone())
        .await
        .unwrap();
    let client = start_hub(bus, "operator").await;

    let reply = client
        .send_request(Request::get("cryostat.pump"), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(reply.is_success());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pump.handled(), 1);
}

#[tokio::test]
async fn test_ambiguous_key_across_queues_gets_one_error_reply() {
    let (_, bus) = shared_bus();
    let server = start_hub(bus.clone(), "cryostat").await;
    server
        .register(
            Route::requests("cryostat.sensor").dedicated(),
            Thermometer::new("sensor", 1.0),
        )
        .await
        .unwrap();
    server
        .register(Route::requests("cryostat.*"), Thermometer::new("any", 2.0))
        .await
        .unwrap();

    let mut replies = bus
        .subscribe(&Subscription::new("watch", Exchange::Requests).bind("watch.replies"))
        .await
        .unwrap();
    let request = Request::get("cryostat.sensor")
        .build(CorrelationId::generate(), "watch.replies")
        .unwrap();
    for frame in Codec::default().encode(&Message::from(request)).unwrap() {
        bus.publish(Exchange::Requests, frame).await.unwrap();
    }

    let mut answered = Vec::new();
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_millis(300), replies.next()).await
    {
        answered.push(frame.unwrap());
    }
    assert_eq!(answered.len(), 1);

    let reply = match Codec::default().decode(&answered[0]).unwrap() {
        Message::Reply(reply) => reply,
        other => panic!("expected a reply, got {:?}", other),
    };
    assert!(!reply.is_success());
}

#[tokio::test]
async fn test_unroutable_request_gets_error_reply() {
    let (_, bus) = shared_bus();
    let server = start_hub(bus.clone(), "cryostat").await;
    let handle = server
        .register(Route::requests("sensor.#"), Thermometer::new("sensor", 0.0))
        .await
        .unwrap();
    // The queue binding outlives the registration.
    assert!(server.deregister(&handle).await);
    let client = start_hub(bus, "operator").await;

    let reply = client
        .send_request(Request::get("sensor.missing"), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(reply.return_code().value(), 102);
}

#[tokio::test]
async fn test_ping_by_service_name() {
    let (_, bus) = shared_bus();
    let _server = start_hub(bus.clone(), "cryostat").await;
    let client = start_hub(bus, "operator").await;

    let reply = client
        .send_request(Request::cmd("cryostat", "ping"), Duration::from_secs(2))
        .await
        .unwrap();

    assert!(reply.is_success());
    assert!(reply.return_msg().starts_with("Hello"));
}

#[tokio::test]
async fn test_broadcast_reaches_every_service() {
    let (_, bus) = shared_bus();
    let first = start_hub(bus.clone(), "first").await;
    let second = start_hub(bus.clone(), "second").await;
    let client = start_hub(bus, "operator").await;

    let reply = client
        .send_request(Request::get("broadcast"), Duration::from_secs(2))
        .await
        .unwrap();

    let name = reply.payload()["name"].as_str().unwrap().to_string();
    assert!([first.service_name(), second.service_name(), client.service_name()]
        .contains(&name.as_str()));
    // The second answer finds nobody waiting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.outstanding_requests(), 0);
}

#[tokio::test]
async fn test_large_payload_travels_in_chunks() {
    let (_, bus) = shared_bus();
    let server = start_hub_with(
        bus.clone(),
        HubConfig::new("archive")
            .without_heartbeat()
            .with_max_payload_size(128),
    )
    .await;
    server
        .register(Route::requests("archive.log"), Thermometer::new("log", 0.0))
        .await
        .unwrap();
    let client = start_hub_with(
        bus,
        HubConfig::new("operator")
            .without_heartbeat()
            .with_max_payload_size(128),
    )
    .await;

    let lines: Vec<Value> = (0..100).map(|i| json!(format!("line {}", i))).collect();
    let reply = client
        .send_request(
            Request::set("archive.log", Value::Array(lines.clone())),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    assert_eq!(reply.payload(), &Value::Array(lines));
}

// ============================================================================
// Timeouts and shutdown
// ============================================================================

#[tokio::test]
async fn test_request_times_out_within_bound() {
    let (_, bus) = shared_bus();
    let server = start_hub(bus.clone(), "slow").await;
    server
        .register(
            Route::requests("slow.task"),
            Arc::new(Sluggish {
                delay: Duration::from_millis(300),
            }),
        )
        .await
        .unwrap();
    let client = start_hub(bus, "operator").await;
    let timeout = Duration::from_millis(100);

    let begin = tokio::time::Instant::now();
    let result = client
        .send_request(Request::cmd("slow.task", "run"), timeout)
        .await;
    let elapsed = begin.elapsed();

    assert!(matches!(result, Err(HubError::Timeout { .. })));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(500));
    assert_eq!(client.outstanding_requests(), 0);

    // The late reply is dropped and the client keeps working.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.outstanding_requests(), 0);
    let reply = client
        .send_request(Request::cmd("slow.task", "ping"), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(reply.is_success());
}

#[tokio::test]
async fn test_stop_is_idempotent_and_final() {
    let (bus, shared) = shared_bus();
    let hub = start_hub(shared, "cryostat").await;
    assert!(bus.queue_names().await.contains(&"cryostat".to_string()));

    hub.stop().await.unwrap();
    hub.stop().await.unwrap();

    assert_eq!(hub.state(), HubState::Stopped);
    assert!(matches!(
        hub.send_request(Request::get("x"), Duration::from_secs(1)).await,
        Err(HubError::Terminated)
    ));
    assert!(matches!(hub.start().await, Err(HubError::Terminated)));
    assert!(!bus.queue_names().await.contains(&"cryostat".to_string()));
}

#[tokio::test]
async fn test_stop_cancels_waiting_callers() {
    let (_, bus) = shared_bus();
    let server = start_hub(bus.clone(), "slow").await;
    server
        .register(
            Route::requests("slow.task"),
            Arc::new(Sluggish {
                delay: Duration::from_secs(5),
            }),
        )
        .await
        .unwrap();
    let client = start_hub(bus, "operator").await;

    let caller = client.clone();
    let waiting = tokio::spawn(async move {
        caller
            .send_request(Request::cmd("slow.task", "run"), Duration::from_secs(30))
            .await
    });
    assert!(eventually(Duration::from_secs(2), || client.outstanding_requests() == 1).await);

    client.stop().await.unwrap();

    assert!(matches!(
        waiting.await.unwrap(),
        Err(HubError::Cancelled(_))
    ));
}

// ============================================================================
// Alerts and heartbeats
// ============================================================================

#[tokio::test]
async fn test_alert_reaches_all_listeners() {
    let (_, bus) = shared_bus();
    let monitor = start_hub(bus.clone(), "monitor").await;
    let status = AlertLog::new("status");
    let cryostat = AlertLog::new("cryostat");
    let refusing = AlertLog::refusing("refusing");
    monitor
        .register(Route::alerts("status.#"), status.clone())
        .await
        .unwrap();
    monitor
        .register(Route::alerts("*.cryostat"), cryostat.clone())
        .await
        .unwrap();
    monitor
        .register(Route::alerts("status.*"), refusing.clone())
        .await
        .unwrap();
    let source = start_hub(bus, "cryostat").await;

    source
        .send_alert(Alert::new("status.cryostat", json!({"temperature": 4.2})))
        .await
        .unwrap();
    source
        .send_alert(Alert::new("status.pump.speed", json!(1200)))
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(2), || status.count() == 2).await);
    assert!(eventually(Duration::from_secs(2), || cryostat.count() == 1).await);
    assert!(eventually(Duration::from_secs(2), || refusing.count() == 1).await);
    assert_eq!(status.heard()[0].sender().service_name, "cryostat");
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_cadence() {
    let (_, bus) = shared_bus();
    let monitor = start_hub(bus.clone(), "monitor").await;
    let beats = AlertLog::new("beats");
    monitor
        .register(Route::alerts("heartbeat.#"), beats.clone())
        .await
        .unwrap();

    let interval = Duration::from_secs(1);
    let beating = start_hub_with(bus, HubConfig::new("pump").with_heartbeat(interval)).await;

    tokio::time::sleep(interval * 5 + Duration::from_millis(500)).await;
    assert!(eventually(Duration::from_millis(100), || beats.count() == 5).await);

    for (i, beat) in beats.heard().iter().enumerate() {
        assert_eq!(beat.routing_key(), "heartbeat.pump");
        assert_eq!(beat.payload()["name"], "pump");
        assert_eq!(beat.payload()["id"], beating.id().to_string());
        assert_eq!(beat.payload()["sequence"], i as u64 + 1);
    }

    beating.stop().await.unwrap();
    tokio::time::sleep(interval * 3).await;
    assert_eq!(beats.count(), 5);
}

// ============================================================================
// Receivers
// ============================================================================

#[tokio::test]
async fn test_bad_frames_do_not_stop_the_receiver() {
    let (_, bus) = shared_bus();
    let server = start_hub_with(
        bus.clone(),
        HubConfig::new("cryostat")
            .without_heartbeat()
            .with_max_payload_size(2048),
    )
    .await;
    let sensor = Thermometer::new("temperature", 4.2);
    server
        .register(Route::requests("cryostat.temperature"), sensor.clone())
        .await
        .unwrap();

    bus.publish(
        Exchange::Requests,
        Frame::new("cryostat.temperature", "big/0/1", vec![b'x'; 4096]),
    )
    .await
    .unwrap();
    bus.publish(
        Exchange::Requests,
        Frame::new("cryostat.temperature", "junk/0/1", "{\"msgtype\": 3}"),
    )
    .await
    .unwrap();

    let client = start_hub(bus, "operator").await;
    let reply = client
        .send_request(Request::get("cryostat.temperature"), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(reply.is_success());

    let status = server.receiver_status().await;
    let service = status.iter().find(|s| s.queue == "cryostat").unwrap();
    assert_eq!(service.decode_failures, 2);
    assert_eq!(service.state, ReceiverState::Running);
}

#[tokio::test]
async fn test_receivers_recover_after_connection_loss() {
    let (bus, shared) = shared_bus();
    let server = start_hub(shared.clone(), "cryostat").await;
    server
        .register(Route::requests("cryostat.temperature"), Thermometer::new("temperature", 4.2))
        .await
        .unwrap();
    let client = start_hub(shared, "operator").await;

    bus.disconnect().await;

    let mut all_lost = false;
    for _ in 0..200 {
        let status = server.receiver_status().await;
        if status
            .iter()
            .all(|s| matches!(s.state, ReceiverState::Lost(_)))
        {
            all_lost = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(all_lost);

    bus.reconnect();
    for status in server.receiver_status().await {
        server.restart_receiver(&status.queue).await.unwrap();
    }
    for status in client.receiver_status().await {
        client.restart_receiver(&status.queue).await.unwrap();
    }

    let reply = client
        .send_request(Request::get("cryostat.temperature"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.payload(), &json!(4.2));
}
