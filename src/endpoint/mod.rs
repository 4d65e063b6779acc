//! Endpoints: addressable units of behavior.
//!
//! An endpoint owns a resource and answers `get`/`set`/`cmd` requests for it.
//! It may also listen for alerts. Failures and panics inside an endpoint are
//! contained by [`handle_request`] and [`deliver_alert`]; they become error
//! replies or log lines, never a fault in the receiver loop.

mod keyed;

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::message::{Alert, Operation, Reply, Request, ReturnCode};

pub use keyed::KeyedEndpoint;

/// Built-in command answered by every endpoint.
pub const PING_COMMAND: &str = "ping";

/// Result of handling one request.
pub type EndpointResult = std::result::Result<ReplyContent, EndpointError>;

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplyContent {
    pub code: ReturnCode,
    pub message: String,
    pub payload: Value,
}

impl ReplyContent {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach a warning code (1-99). The request still counts as handled.
    pub fn with_code(mut self, code: ReturnCode) -> Self {
        self.code = code;
        self
    }
}

/// Failure raised by an endpoint handler.
///
/// Converted into a reply with a nonzero return code at the dispatch boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct EndpointError {
    code: ReturnCode,
    message: String,
    payload: Value,
}

impl EndpointError {
    /// A zero code is replaced with `DEVICE_ERROR`: an error never produces a
    /// success reply.
    pub fn new(code: ReturnCode, message: impl Into<String>) -> Self {
        let code = if code.is_success() {
            ReturnCode::DEVICE_ERROR
        } else {
            code
        };
        Self {
            code,
            message: message.into(),
            payload: Value::Null,
        }
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::new(ReturnCode::DEVICE_ERROR, message)
    }

    pub fn bad_payload(message: impl Into<String>) -> Self {
        Self::new(ReturnCode::MESSAGE_ERROR_BAD_PAYLOAD, message)
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(ReturnCode::MESSAGE_ERROR_INVALID_VALUE, message)
    }

    pub fn invalid_specifier(message: impl Into<String>) -> Self {
        Self::new(ReturnCode::MESSAGE_ERROR_INVALID_SPECIFIER, message)
    }

    pub fn invalid_method(operation: Operation, endpoint: &str) -> Self {
        Self::new(
            ReturnCode::MESSAGE_ERROR_INVALID_METHOD,
            format!("Endpoint '{}' does not support {}", endpoint, operation),
        )
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn code(&self) -> ReturnCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// Handler capability of an addressable endpoint.
///
/// Every operation defaults to `MESSAGE_ERROR_INVALID_METHOD`; implement the
/// ones the endpoint supports. Handlers must not block indefinitely.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Unique name within a hub.
    fn name(&self) -> &str;

    /// Read the endpoint's value. Must not mutate state.
    async fn on_get(&self, request: &Request) -> EndpointResult {
        let _ = request;
        Err(EndpointError::invalid_method(Operation::Get, self.name()))
    }

    /// Change the endpoint's value and return the confirmed value.
    async fn on_set(&self, request: &Request) -> EndpointResult {
        let _ = request;
        Err(EndpointError::invalid_method(Operation::Set, self.name()))
    }

    /// Run a named action.
    async fn on_cmd(&self, request: &Request) -> EndpointResult {
        let _ = request;
        Err(EndpointError::invalid_method(Operation::Cmd, self.name()))
    }

    /// Receive an alert routed to this endpoint.
    async fn on_alert(&self, alert: &Alert) -> Result<(), EndpointError> {
        let _ = alert;
        Ok(())
    }
}

// ============================================================================
// Dispatch boundary
// ============================================================================

/// Run a request against an endpoint and build the reply.
///
/// Errors become replies carrying the error's code; panics become
/// `UNHANDLED_EXCEPTION` replies. The returned reply always carries the
/// request's correlation id.
pub async fn handle_request(endpoint: &dyn Endpoint, request: &Request) -> Reply {
    if request.operation() == Operation::Cmd && request.specifier().first() == Some(PING_COMMAND)
    {
        debug!(endpoint = %endpoint.name(), "Answering ping");
        return request.reply(
            ReturnCode::SUCCESS,
            format!("Hello, {}", request.sender().package),
            Value::Null,
        );
    }

    let handling = async {
        match request.operation() {
            Operation::Get => endpoint.on_get(request).await,
            Operation::Set => endpoint.on_set(request).await,
            Operation::Cmd => endpoint.on_cmd(request).await,
        }
    };

    match AssertUnwindSafe(handling).catch_unwind().await {
        Ok(Ok(content)) => request.reply(content.code, content.message, content.payload),
        Ok(Err(e)) => {
            warn!(
                endpoint = %endpoint.name(),
                operation = %request.operation(),
                code = e.code().value(),
                error = %e,
                "Endpoint returned error"
            );
            request.reply(e.code, e.message, e.payload)
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(
                endpoint = %endpoint.name(),
                operation = %request.operation(),
                panic = %message,
                "Endpoint panicked while handling request"
            );
            request.reply(ReturnCode::UNHANDLED_EXCEPTION, message, Value::Null)
        }
    }
}

/// Deliver an alert to one listener, containing panics.
pub async fn deliver_alert(endpoint: &dyn Endpoint, alert: &Alert) -> Result<(), EndpointError> {
    match AssertUnwindSafe(endpoint.on_alert(alert))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(EndpointError::new(
            ReturnCode::UNHANDLED_EXCEPTION,
            panic_message(panic.as_ref()),
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "endpoint panicked".to_string()
    }
}
