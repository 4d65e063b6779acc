//! Message codec: typed messages to and from bus frames.
//!
//! The wire document is JSON:
//!
//! ```text
//! {
//!   "msgtype": "request" | "reply" | "alert",
//!   "routing_key": "sensor.a",
//!   "specifier": "gain",
//!   "correlation_id": "...",          // requests and replies
//!   "reply_to": "...",                // requests
//!   "msgop": "get" | "set" | "cmd",   // requests
//!   "payload": <any>,
//!   "return_code": 0,                 // replies
//!   "return_msg": "...",              // replies
//!   "sender_info": { ... },
//!   "timestamp": "2026-01-01T00:00:00.000000Z"
//! }
//! ```
//!
//! A serialized document larger than the maximum payload size is split into
//! several frames sharing a stream id (see [`ChunkAssembler`]).

mod assembler;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{Frame, JSON_CONTENT_TYPE};
use crate::message::{
    Alert, CorrelationId, Message, MessageKind, Operation, Reply, RequestBuilder,
    ReturnCode, SenderInfo, Specifier,
};

pub use assembler::ChunkAssembler;

/// Default maximum bytes per frame.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 10_000;

/// Upper bound on chunks per message.
pub const MAX_CHUNKS: usize = 1024;

/// Frame could not be turned into a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Payload of {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Unknown message kind: {0}")]
    UnknownKind(String),
}

/// Message could not be turned into frames.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Message needs {chunks} chunks, more than the maximum of {max}")]
    TooManyChunks { chunks: usize, max: usize },
}

// ============================================================================
// Wire document
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    msgtype: MessageKind,
    routing_key: String,
    #[serde(default, skip_serializing_if = "Specifier::is_empty")]
    specifier: Specifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    msgop: Option<Operation>,
    #[serde(default)]
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    return_code: Option<ReturnCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    return_msg: Option<String>,
    #[serde(default)]
    sender_info: SenderInfo,
    #[serde(default)]
    timestamp: String,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        match message {
            Message::Request(m) => Self {
                msgtype: MessageKind::Request,
                routing_key: m.routing_key().to_string(),
                specifier: m.specifier().clone(),
                correlation_id: Some(m.correlation_id().clone()),
                reply_to: Some(m.reply_to().to_string()),
                msgop: Some(m.operation()),
                payload: m.payload().clone(),
                return_code: None,
                return_msg: None,
                sender_info: m.sender().clone(),
                timestamp: m.timestamp().to_string(),
            },
            Message::Reply(m) => Self {
                msgtype: MessageKind::Reply,
                routing_key: m.routing_key().to_string(),
                specifier: m.specifier().clone(),
                correlation_id: Some(m.correlation_id().clone()),
                reply_to: None,
                msgop: None,
                payload: m.payload().clone(),
                return_code: Some(m.return_code()),
                return_msg: Some(m.return_msg().to_string()),
                sender_info: m.sender().clone(),
                timestamp: m.timestamp().to_string(),
            },
            Message::Alert(m) => Self {
                msgtype: MessageKind::Alert,
                routing_key: m.routing_key().to_string(),
                specifier: m.specifier().clone(),
                correlation_id: None,
                reply_to: None,
                msgop: None,
                payload: m.payload().clone(),
                return_code: None,
                return_msg: None,
                sender_info: m.sender().clone(),
                timestamp: m.timestamp().to_string(),
            },
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = DecodeError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let malformed = |e: crate::message::MessageError| DecodeError::MalformedPayload(e.to_string());

        match wire.msgtype {
            MessageKind::Request => {
                let operation = wire.msgop.ok_or_else(|| {
                    DecodeError::MalformedPayload(format!(
                        "request to '{}' has no msgop",
                        wire.routing_key
                    ))
                })?;
                let correlation_id = wire.correlation_id.unwrap_or_else(|| "".into());
                let reply_to = wire.reply_to.unwrap_or_default();
                let request = RequestBuilder::new(wire.routing_key, operation)
                    .specifier(wire.specifier)
                    .payload(wire.payload)
                    .sender(wire.sender_info)
                    .build(correlation_id, reply_to)
                    .map_err(malformed)?;
                Ok(Message::Request(request.with_timestamp(wire.timestamp)))
            }
            MessageKind::Reply => {
                let return_code = wire.return_code.ok_or_else(|| {
                    DecodeError::MalformedPayload(format!(
                        "reply to '{}' has no return_code",
                        wire.routing_key
                    ))
                })?;
                let reply = Reply::from_parts(
                    wire.routing_key,
                    wire.specifier,
                    wire.correlation_id.unwrap_or_else(|| "".into()),
                    return_code,
                    wire.return_msg.unwrap_or_default(),
                    wire.payload,
                    wire.sender_info,
                    wire.timestamp,
                )
                .map_err(malformed)?;
                Ok(Message::Reply(reply))
            }
            MessageKind::Alert => Ok(Message::Alert(Alert::from_parts(
                wire.routing_key,
                wire.specifier,
                wire.payload,
                wire.sender_info,
                wire.timestamp,
            ))),
        }
    }
}

// ============================================================================
// Chunk identity
// ============================================================================

/// Position of a frame within its message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChunkId {
    pub stream: String,
    pub index: usize,
    pub total: usize,
}

impl ChunkId {
    /// Parse `<stream>/<index>/<total>`. An id without that shape names a
    /// single complete frame.
    fn parse(message_id: &str) -> Result<Self, DecodeError> {
        let mut parts = message_id.rsplitn(3, '/');
        let (total, index, stream) = match (parts.next(), parts.next(), parts.next()) {
            (Some(total), Some(index), Some(stream)) => (total, index, stream),
            _ => return Ok(Self::single(message_id)),
        };
        let (index, total) = match (index.parse::<usize>(), total.parse::<usize>()) {
            (Ok(index), Ok(total)) => (index, total),
            _ => return Ok(Self::single(message_id)),
        };

        if total == 0 || index >= total {
            return Err(DecodeError::MalformedPayload(format!(
                "chunk {} of {} in '{}' is out of range",
                index, total, message_id
            )));
        }
        if total > MAX_CHUNKS {
            return Err(DecodeError::MalformedPayload(format!(
                "message '{}' has {} chunks, more than the maximum of {}",
                stream, total, MAX_CHUNKS
            )));
        }

        Ok(Self {
            stream: stream.to_string(),
            index,
            total,
        })
    }

    fn single(message_id: &str) -> Self {
        Self {
            stream: message_id.to_string(),
            index: 0,
            total: 1,
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Encodes messages into frames and decodes single frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    max_payload_size: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

impl Codec {
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            max_payload_size: max_payload_size.max(1),
        }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Serialize `message` into one or more frames of at most
    /// `max_payload_size` bytes each.
    pub fn encode(&self, message: &Message) -> Result<Vec<Frame>, EncodeError> {
        let document = Bytes::from(serde_json::to_vec(&WireMessage::from(message))?);
        let total = document.len().div_ceil(self.max_payload_size).max(1);
        if total > MAX_CHUNKS {
            return Err(EncodeError::TooManyChunks {
                chunks: total,
                max: MAX_CHUNKS,
            });
        }

        let stream = uuid::Uuid::new_v4().simple().to_string();
        let routing_key = message.routing_key();

        Ok((0..total)
            .map(|index| {
                let start = index * self.max_payload_size;
                let end = (start + self.max_payload_size).min(document.len());
                Frame::new(
                    routing_key,
                    format!("{}/{}/{}", stream, index, total),
                    document.slice(start..end),
                )
            })
            .collect())
    }

    /// Decode a frame that carries a whole message.
    ///
    /// Chunks of a larger message fail with `MalformedPayload`; feed those
    /// through a [`ChunkAssembler`].
    pub fn decode(&self, frame: &Frame) -> Result<Message, DecodeError> {
        let chunk = self.check_frame(frame)?;
        if chunk.total > 1 {
            return Err(DecodeError::MalformedPayload(format!(
                "frame is chunk {} of {}",
                chunk.index, chunk.total
            )));
        }
        self.decode_document(&frame.body)
    }

    /// Size and content-type checks, done before anything is parsed.
    pub(crate) fn check_frame(&self, frame: &Frame) -> Result<ChunkId, DecodeError> {
        if frame.body.len() > self.max_payload_size {
            return Err(DecodeError::PayloadTooLarge {
                size: frame.body.len(),
                max: self.max_payload_size,
            });
        }
        if !frame.content_type.is_empty() && frame.content_type != JSON_CONTENT_TYPE {
            return Err(DecodeError::MalformedPayload(format!(
                "unsupported content type '{}'",
                frame.content_type
            )));
        }
        ChunkId::parse(&frame.message_id)
    }

    /// Decode a complete serialized document.
    pub(crate) fn decode_document(&self, body: &[u8]) -> Result<Message, DecodeError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;

        let object = value.as_object().ok_or_else(|| {
            DecodeError::MalformedPayload("document is not an object".to_string())
        })?;

        let kind = object
            .get("msgtype")
            .ok_or_else(|| DecodeError::UnknownKind("msgtype is missing".to_string()))?;
        if !matches!(kind.as_str(), Some("request" | "reply" | "alert")) {
            return Err(DecodeError::UnknownKind(kind.to_string()));
        }

        let wire: WireMessage = serde_json::from_value(value)
            .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;
        Message::try_from(wire)
    }
}
