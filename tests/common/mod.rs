//! Shared utilities for integration tests.
//!
//! Endpoints with observable side effects and hub construction helpers for
//! hubs sharing one bus.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dripline::{
    Alert, Endpoint, EndpointError, EndpointResult, Hub, HubConfig, MessageBus, ReplyContent,
    Request,
};
use serde_json::{json, Value};

/// Builds a started hub without heartbeats.
pub async fn start_hub(bus: Arc<dyn MessageBus>, service: &str) -> Hub {
    start_hub_with(bus, HubConfig::new(service).without_heartbeat()).await
}

pub async fn start_hub_with(bus: Arc<dyn MessageBus>, config: HubConfig) -> Hub {
    let hub = Hub::new(config, bus).expect("valid hub config");
    hub.start().await.expect("hub starts");
    hub
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// passes.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// A temperature sensor. `get` reads the value, `set` stores it, and every
/// request is counted.
pub struct Thermometer {
    name: String,
    value: Mutex<Value>,
    handled: AtomicUsize,
}

impl Thermometer {
    pub fn new(name: &str, initial: f64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            value: Mutex::new(json!(initial)),
            handled: AtomicUsize::new(0),
        })
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Endpoint for Thermometer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_get(&self, _request: &Request) -> EndpointResult {
        self.handled.fetch_add(1, Ordering::SeqCst);
        let value = self.value.lock().unwrap().clone();
        Ok(ReplyContent::new(value))
    }

    async fn on_set(&self, request: &Request) -> EndpointResult {
        self.handled.fetch_add(1, Ordering::SeqCst);
        *self.value.lock().unwrap() = request.payload().clone();
        Ok(ReplyContent::new(request.payload().clone()).with_message("stored"))
    }
}

/// Alert listener that keeps what it hears, or refuses everything.
pub struct AlertLog {
    name: String,
    refuse: bool,
    heard: Mutex<Vec<Alert>>,
}

impl AlertLog {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            refuse: false,
            heard: Mutex::new(Vec::new()),
        })
    }

    pub fn refusing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            refuse: true,
            heard: Mutex::new(Vec::new()),
        })
    }

    pub fn heard(&self) -> Vec<Alert> {
        self.heard.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.heard.lock().unwrap().len()
    }
}

#[async_trait]
impl Endpoint for AlertLog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_alert(&self, alert: &Alert) -> Result<(), EndpointError> {
        self.heard.lock().unwrap().push(alert.clone());
        if self.refuse {
            return Err(EndpointError::device(format!("{} refuses alerts", self.name)));
        }
        Ok(())
    }
}
