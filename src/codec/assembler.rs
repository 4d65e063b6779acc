//! Reassembly of messages split across several frames.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Codec, DecodeError};
use crate::bus::Frame;
use crate::message::Message;

struct PartialMessage {
    chunks: Vec<Option<Bytes>>,
    received: usize,
    last_seen: Instant,
}

impl PartialMessage {
    fn new(total: usize, now: Instant) -> Self {
        Self {
            chunks: vec![None; total],
            received: 0,
            last_seen: now,
        }
    }

    fn assemble(self) -> Bytes {
        let len = self.chunks.iter().flatten().map(Bytes::len).sum();
        let mut body = BytesMut::with_capacity(len);
        for chunk in self.chunks.into_iter().flatten() {
            body.extend_from_slice(&chunk);
        }
        body.freeze()
    }
}

/// Accumulates chunks per stream id until every chunk has arrived.
///
/// One assembler belongs to one receiver; it is not shared. Streams that see
/// no new chunk for `idle_timeout` are dropped by [`evict_idle`].
///
/// [`evict_idle`]: ChunkAssembler::evict_idle
pub struct ChunkAssembler {
    codec: Codec,
    idle_timeout: Duration,
    partial: HashMap<String, PartialMessage>,
}

impl ChunkAssembler {
    pub fn new(codec: Codec, idle_timeout: Duration) -> Self {
        Self {
            codec,
            idle_timeout,
            partial: HashMap::new(),
        }
    }

    /// Feed one frame. Returns the message once its last missing chunk
    /// arrives, `None` while chunks are still outstanding.
    pub fn push(&mut self, frame: &Frame) -> Result<Option<Message>, DecodeError> {
        let chunk = self.codec.check_frame(frame)?;
        if chunk.total == 1 {
            return self.codec.decode_document(&frame.body).map(Some);
        }

        let now = Instant::now();
        let partial = self
            .partial
            .entry(chunk.stream.clone())
            .or_insert_with(|| PartialMessage::new(chunk.total, now));

        if partial.chunks.len() != chunk.total {
            let expected = partial.chunks.len();
            self.partial.remove(&chunk.stream);
            return Err(DecodeError::MalformedPayload(format!(
                "stream '{}' changed chunk count from {} to {}",
                chunk.stream, expected, chunk.total
            )));
        }

        partial.last_seen = now;
        if partial.chunks[chunk.index].is_none() {
            partial.received += 1;
        }
        partial.chunks[chunk.index] = Some(frame.body.clone());

        if partial.received < chunk.total {
            debug!(
                stream = %chunk.stream,
                received = partial.received,
                total = chunk.total,
                "Buffered chunk"
            );
            return Ok(None);
        }

        match self.partial.remove(&chunk.stream) {
            Some(complete) => self.codec.decode_document(&complete.assemble()).map(Some),
            None => Ok(None),
        }
    }

    /// Drop streams idle for longer than the timeout. Returns how many were
    /// dropped.
    pub fn evict_idle(&mut self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.idle_timeout;
        let before = self.partial.len();

        self.partial.retain(|stream, partial| {
            let keep = now.duration_since(partial.last_seen) < idle_timeout;
            if !keep {
                warn!(
                    stream = %stream,
                    received = partial.received,
                    total = partial.chunks.len(),
                    "Dropping incomplete chunked message"
                );
            }
            keep
        });

        before - self.partial.len()
    }

    /// Streams still waiting for chunks.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}
