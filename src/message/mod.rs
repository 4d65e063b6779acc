//! Typed message envelopes.
//!
//! Three kinds travel over the bus:
//! - `Request`: addressed to an endpoint, always carries a correlation id and
//!   a reply_to key
//! - `Reply`: answers exactly one request, carries its correlation id and a
//!   return code
//! - `Alert`: fire-and-forget broadcast, no correlation id or reply_to
//!
//! Kind-specific fields are enforced by construction. Messages are immutable
//! once built; the `with_*` helpers consume and return `self`.

mod return_code;
mod sender;
mod specifier;

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use return_code::ReturnCode;
pub use sender::SenderInfo;
pub use specifier::Specifier;

/// Errors raised when a message is built without its required fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("Request to '{0}' has no reply_to")]
    MissingReplyTo(String),

    #[error("{0} to '{1}' has no correlation_id")]
    MissingCorrelationId(MessageKind, String),

    #[error("Routing key must not be empty")]
    EmptyRoutingKey,
}

// ============================================================================
// Discriminators
// ============================================================================

/// Message kind discriminator (`msgtype` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Reply,
    Alert,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Reply => "reply",
            Self::Alert => "alert",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request operation (`msgop` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Read-only query. Never mutates endpoint state.
    Get,
    /// Mutates endpoint state and returns the confirmed value.
    Set,
    /// Named action; the first specifier token names the command.
    Cmd,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Cmd => "cmd",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque token pairing a request with its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh random correlation id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ============================================================================
// Request
// ============================================================================

/// A request addressed to an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    routing_key: String,
    specifier: Specifier,
    operation: Operation,
    payload: Value,
    correlation_id: CorrelationId,
    reply_to: String,
    sender: SenderInfo,
    timestamp: String,
}

impl Request {
    /// Start describing a request. The hub stamps correlation id and reply_to
    /// when it sends the request.
    pub fn builder(routing_key: impl Into<String>, operation: Operation) -> RequestBuilder {
        RequestBuilder::new(routing_key, operation)
    }

    pub fn get(routing_key: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(routing_key, Operation::Get)
    }

    pub fn set(routing_key: impl Into<String>, value: Value) -> RequestBuilder {
        RequestBuilder::new(routing_key, Operation::Set).payload(value)
    }

    pub fn cmd(routing_key: impl Into<String>, command: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(routing_key, Operation::Cmd).specifier(Specifier::new(command))
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn specifier(&self) -> &Specifier {
        &self.specifier
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    pub fn sender(&self) -> &SenderInfo {
        &self.sender
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub(crate) fn with_timestamp(mut self, timestamp: String) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Build the reply answering this request.
    ///
    /// The reply is addressed to `reply_to` and carries the same correlation id.
    pub fn reply(
        &self,
        return_code: ReturnCode,
        return_msg: impl Into<String>,
        payload: Value,
    ) -> Reply {
        Reply {
            routing_key: self.reply_to.clone(),
            specifier: self.specifier.clone(),
            correlation_id: self.correlation_id.clone(),
            return_code,
            return_msg: return_msg.into(),
            payload,
            sender: SenderInfo::default(),
            timestamp: now_timestamp(),
        }
    }
}

/// Describes an outbound request before it is addressed.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    routing_key: String,
    operation: Operation,
    specifier: Specifier,
    payload: Value,
    sender: Option<SenderInfo>,
}

impl RequestBuilder {
    pub fn new(routing_key: impl Into<String>, operation: Operation) -> Self {
        Self {
            routing_key: routing_key.into(),
            operation,
            specifier: Specifier::default(),
            payload: Value::Null,
            sender: None,
        }
    }

    pub fn specifier(mut self, specifier: impl Into<Specifier>) -> Self {
        self.specifier = specifier.into();
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn sender(mut self, sender: SenderInfo) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Address the request. Fails if the routing key, correlation id or
    /// reply_to is empty.
    pub fn build(
        self,
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
    ) -> Result<Request, MessageError> {
        let reply_to = reply_to.into();
        if self.routing_key.is_empty() {
            return Err(MessageError::EmptyRoutingKey);
        }
        if correlation_id.as_str().is_empty() {
            return Err(MessageError::MissingCorrelationId(
                MessageKind::Request,
                self.routing_key,
            ));
        }
        if reply_to.is_empty() {
            return Err(MessageError::MissingReplyTo(self.routing_key));
        }
        Ok(Request {
            routing_key: self.routing_key,
            specifier: self.specifier,
            operation: self.operation,
            payload: self.payload,
            correlation_id,
            reply_to,
            sender: self.sender.unwrap_or_default(),
            timestamp: now_timestamp(),
        })
    }

    /// Like `build`, but keeps an explicit sender if one was set and
    /// otherwise uses `default_sender`.
    pub(crate) fn build_from(
        mut self,
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
        default_sender: &SenderInfo,
    ) -> Result<Request, MessageError> {
        if self.sender.is_none() {
            self.sender = Some(default_sender.clone());
        }
        self.build(correlation_id, reply_to)
    }
}

// ============================================================================
// Reply
// ============================================================================

/// Answer to exactly one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    routing_key: String,
    specifier: Specifier,
    correlation_id: CorrelationId,
    return_code: ReturnCode,
    return_msg: String,
    payload: Value,
    sender: SenderInfo,
    timestamp: String,
}

impl Reply {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        routing_key: String,
        specifier: Specifier,
        correlation_id: CorrelationId,
        return_code: ReturnCode,
        return_msg: String,
        payload: Value,
        sender: SenderInfo,
        timestamp: String,
    ) -> Result<Self, MessageError> {
        if correlation_id.as_str().is_empty() {
            return Err(MessageError::MissingCorrelationId(
                MessageKind::Reply,
                routing_key,
            ));
        }
        Ok(Self {
            routing_key,
            specifier,
            correlation_id,
            return_code,
            return_msg,
            payload,
            sender,
            timestamp,
        })
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn specifier(&self) -> &Specifier {
        &self.specifier
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn return_code(&self) -> ReturnCode {
        self.return_code
    }

    pub fn return_msg(&self) -> &str {
        &self.return_msg
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn sender(&self) -> &SenderInfo {
        &self.sender
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn is_success(&self) -> bool {
        self.return_code.is_success()
    }

    pub fn with_sender(mut self, sender: SenderInfo) -> Self {
        self.sender = sender;
        self
    }
}

// ============================================================================
// Alert
// ============================================================================

/// Broadcast message. No reply is expected.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    routing_key: String,
    specifier: Specifier,
    payload: Value,
    sender: SenderInfo,
    timestamp: String,
}

impl Alert {
    pub fn new(routing_key: impl Into<String>, payload: Value) -> Self {
        Self {
            routing_key: routing_key.into(),
            specifier: Specifier::default(),
            payload,
            sender: SenderInfo::default(),
            timestamp: now_timestamp(),
        }
    }

    pub(crate) fn from_parts(
        routing_key: String,
        specifier: Specifier,
        payload: Value,
        sender: SenderInfo,
        timestamp: String,
    ) -> Self {
        Self {
            routing_key,
            specifier,
            payload,
            sender,
            timestamp,
        }
    }

    pub fn with_specifier(mut self, specifier: impl Into<Specifier>) -> Self {
        self.specifier = specifier.into();
        self
    }

    pub fn with_sender(mut self, sender: SenderInfo) -> Self {
        self.sender = sender;
        self
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn specifier(&self) -> &Specifier {
        &self.specifier
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn sender(&self) -> &SenderInfo {
        &self.sender
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }
}

// ============================================================================
// Message
// ============================================================================

/// Any message that travels over the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Reply(Reply),
    Alert(Alert),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request(_) => MessageKind::Request,
            Self::Reply(_) => MessageKind::Reply,
            Self::Alert(_) => MessageKind::Alert,
        }
    }

    pub fn routing_key(&self) -> &str {
        match self {
            Self::Request(m) => m.routing_key(),
            Self::Reply(m) => m.routing_key(),
            Self::Alert(m) => m.routing_key(),
        }
    }

    pub fn specifier(&self) -> &Specifier {
        match self {
            Self::Request(m) => m.specifier(),
            Self::Reply(m) => m.specifier(),
            Self::Alert(m) => m.specifier(),
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Self::Request(m) => m.payload(),
            Self::Reply(m) => m.payload(),
            Self::Alert(m) => m.payload(),
        }
    }

    pub fn sender(&self) -> &SenderInfo {
        match self {
            Self::Request(m) => m.sender(),
            Self::Reply(m) => m.sender(),
            Self::Alert(m) => m.sender(),
        }
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::Request(m) => Some(m.correlation_id()),
            Self::Reply(m) => Some(m.correlation_id()),
            Self::Alert(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Reply> for Message {
    fn from(reply: Reply) -> Self {
        Self::Reply(reply)
    }
}

impl From<Alert> for Message {
    fn from(alert: Alert) -> Self {
        Self::Alert(alert)
    }
}
