//! Shared test helpers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::endpoint::{Endpoint, EndpointError, EndpointResult, ReplyContent};
use crate::message::{Alert, CorrelationId, Request, RequestBuilder};

/// Endpoint that records what it receives.
///
/// - `get` replies `{"endpoint": <name>}`
/// - `set` echoes the payload
/// - `cmd` sleeps for the configured delay, then replies with the specifier
/// - alerts are counted, and fail when `failing_alerts` is set
pub struct RecordingEndpoint {
    name: String,
    delay: Duration,
    fail_alerts: bool,
    requests: Mutex<Vec<Request>>,
    alerts: Mutex<Vec<Alert>>,
    alert_attempts: AtomicUsize,
}

impl RecordingEndpoint {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(name.into(), Duration::ZERO, false))
    }

    pub fn with_delay(name: impl Into<String>, delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(name.into(), delay, false))
    }

    pub fn failing_alerts(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(name.into(), Duration::ZERO, true))
    }

    fn build(name: String, delay: Duration, fail_alerts: bool) -> Self {
        Self {
            name,
            delay,
            fail_alerts,
            requests: Mutex::new(Vec::new()),
            alerts: Mutex::new(Vec::new()),
            alert_attempts: AtomicUsize::new(0),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    /// Alerts delivered, including ones this endpoint then failed.
    pub fn alert_attempts(&self) -> usize {
        self.alert_attempts.load(Ordering::SeqCst)
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }

    fn record(&self, request: &Request) {
        self.requests.lock().unwrap().push(request.clone());
    }
}

#[async_trait]
impl Endpoint for RecordingEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_get(&self, request: &Request) -> EndpointResult {
        self.record(request);
        Ok(ReplyContent::new(json!({ "endpoint": self.name })))
    }

    async fn on_set(&self, request: &Request) -> EndpointResult {
        self.record(request);
        Ok(ReplyContent::new(request.payload().clone()))
    }

    async fn on_cmd(&self, request: &Request) -> EndpointResult {
        self.record(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(ReplyContent::new(Value::String(request.specifier().to_string())))
    }

    async fn on_alert(&self, alert: &Alert) -> Result<(), EndpointError> {
        self.alert_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_alerts {
            return Err(EndpointError::device(format!("{} refused alert", self.name)));
        }
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Address a request with a fresh correlation id.
pub fn make_request(builder: RequestBuilder, reply_to: &str) -> Request {
    builder
        .build(CorrelationId::generate(), reply_to)
        .expect("valid request")
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
