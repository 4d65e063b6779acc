//! In-memory channel-based message bus for offline mode.
//!
//! Emulates a broker with two topic exchanges inside a single process.
//! Each subscribed queue gets a bounded tokio mpsc channel; a publish
//! delivers one copy to every queue with at least one binding on the target
//! exchange that matches the routing key. Binding patterns use the same
//! topic semantics as the routing registry.
//!
//! Clones share the same exchanges, so several hubs in one process can talk
//! to each other through one `ChannelBus`.
//!
//! Each queue holds at most `capacity` undelivered frames
//! ([`DEFAULT_QUEUE_CAPACITY`] unless built with [`ChannelBus::with_capacity`]).
//! Publishing never waits for a slow consumer: a frame that finds its queue
//! full is dropped for that queue only, and counted in
//! [`ChannelBus::dropped_frames`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{
    BusError, ConnectionState, Exchange, Frame, FrameStream, MessageBus, Result, Subscription,
};
use crate::routing::Pattern;

/// Per-queue channel capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct Queue {
    bindings: Vec<(Exchange, Pattern)>,
    sender: mpsc::Sender<Result<Frame>>,
}

impl Queue {
    fn accepts(&self, exchange: Exchange, routing_key: &str) -> bool {
        self.bindings
            .iter()
            .any(|(ex, pattern)| *ex == exchange && pattern.matches(routing_key))
    }
}

/// In-process message bus.
#[derive(Clone)]
pub struct ChannelBus {
    queues: Arc<RwLock<HashMap<String, Queue>>>,
    connected: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        info!(capacity, "Channel message bus initialized");
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(true)),
            dropped: Arc::new(AtomicU64::new(0)),
            capacity: capacity.max(1),
        }
    }

    /// Frames discarded because their queue was full, summed over every
    /// queue and every clone of this bus.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Simulate losing the broker: every subscriber receives a
    /// `ConnectionLost` error and all queues are dropped.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let queues: Vec<(String, Queue)> = self.queues.write().await.drain().collect();
        for (name, queue) in queues {
            let lost = BusError::ConnectionLost(format!("offline bus disconnected queue '{}'", name));
            if queue.sender.try_send(Err(lost)).is_err() {
                debug!(queue = %name, "Subscriber already gone at disconnect");
            }
        }
        warn!("Channel message bus disconnected");
    }

    /// Undo `disconnect`. Queues must be subscribed again.
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        info!("Channel message bus reconnected");
    }

    /// Names of queues with a live subscriber.
    pub async fn queue_names(&self) -> Vec<String> {
        let queues = self.queues.read().await;
        let mut names: Vec<String> = queues
            .iter()
            .filter(|(_, q)| !q.sender.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::ConnectionLost(
                "offline bus is disconnected".to_string(),
            ))
        }
    }
}

fn parse_binding(binding: &str) -> Result<Pattern> {
    Pattern::parse(binding).map_err(|e| BusError::Subscribe(e.to_string()))
}

#[async_trait]
impl MessageBus for ChannelBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(exchange = %exchange, routing_key = %frame.routing_key))]
    async fn publish(&self, exchange: Exchange, frame: Frame) -> Result<()> {
        self.ensure_connected()?;

        let mut queues = self.queues.write().await;
        let mut closed = Vec::new();
        let mut delivered = 0usize;

        for (name, queue) in queues.iter() {
            if !queue.accepts(exchange, &frame.routing_key) {
                continue;
            }
            match queue.sender.try_send(Ok(frame.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(queue = %name, dropped, "Queue full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(name.clone()),
            }
        }

        for name in closed {
            debug!(queue = %name, "Removing queue with no subscriber");
            queues.remove(&name);
        }

        // Unroutable frames are dropped, as a broker drops them.
        debug!(receivers = delivered, "Published frame to channel");
        Ok(())
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<FrameStream> {
        self.ensure_connected()?;

        let bindings = subscription
            .bindings
            .iter()
            .map(|b| parse_binding(b).map(|p| (subscription.exchange, p)))
            .collect::<Result<Vec<_>>>()?;

        let mut queues = self.queues.write().await;
        if let Some(existing) = queues.get(&subscription.queue) {
            if !existing.sender.is_closed() {
                return Err(BusError::Subscribe(format!(
                    "queue '{}' already has a consumer",
                    subscription.queue
                )));
            }
        }

        let (sender, receiver) = mpsc::channel(self.capacity);
        queues.insert(subscription.queue.clone(), Queue { bindings, sender });

        info!(
            queue = %subscription.queue,
            exchange = %subscription.exchange,
            bindings = ?subscription.bindings,
            "Channel queue subscribed"
        );

        Ok(ReceiverStream::new(receiver).boxed())
    }

    async fn bind(&self, queue: &str, exchange: Exchange, binding: &str) -> Result<()> {
        self.ensure_connected()?;
        let pattern = parse_binding(binding)?;

        let mut queues = self.queues.write().await;
        let entry = queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Subscribe(format!("unknown queue '{}'", queue)))?;

        if !entry
            .bindings
            .iter()
            .any(|(ex, p)| *ex == exchange && p == &pattern)
        {
            entry.bindings.push((exchange, pattern));
        }
        debug!(queue = %queue, binding = %binding, "Added binding");
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Lost
        }
    }
}

#[cfg(test)]
mod tests;
