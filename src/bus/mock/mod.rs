//! Mock message bus implementation for testing.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    BusError, ConnectionState, Exchange, Frame, FrameStream, MessageBus, Result, Subscription,
};

/// Mock message bus for testing.
///
/// Records every publish. Subscriptions receive only what the test injects.
#[derive(Default)]
pub struct MockBus {
    published: RwLock<Vec<(Exchange, Frame)>>,
    subscriptions: RwLock<HashMap<String, mpsc::UnboundedSender<Result<Frame>>>>,
    fail_on_publish: RwLock<bool>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<(Exchange, Frame)> {
        std::mem::take(&mut *self.published.write().await)
    }

    pub async fn subscribed_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscriptions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Deliver `item` to the subscriber of `queue`. Returns false if nobody
    /// is subscribed.
    pub async fn inject(&self, queue: &str, item: Result<Frame>) -> bool {
        self.subscriptions
            .read()
            .await
            .get(queue)
            .map(|tx| tx.send(item).is_ok())
            .unwrap_or(false)
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn publish(&self, exchange: Exchange, frame: Frame) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        self.published.write().await.push((exchange, frame));
        Ok(())
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<FrameStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .write()
            .await
            .insert(subscription.queue.clone(), tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn bind(&self, queue: &str, _exchange: Exchange, _binding: &str) -> Result<()> {
        if self.subscriptions.read().await.contains_key(queue) {
            Ok(())
        } else {
            Err(BusError::Subscribe(format!("unknown queue '{}'", queue)))
        }
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }
}
