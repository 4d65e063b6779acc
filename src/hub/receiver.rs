//! Receivers: one task per subscribed queue.
//!
//! A receiver waits for frames, feeds them through its own chunk assembler
//! and hands complete messages to the hub. Frames of one queue are
//! dispatched strictly in arrival order. Decode failures are counted and
//! logged; they never end the loop. Losing the subscription does: the
//! receiver records `Lost` and exits, and the hub can restart it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::HubInner;
use crate::bus::{FrameStream, Subscription};
use crate::codec::ChunkAssembler;

/// What a receiver's queue carries. Decides which requests it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Called directly through `Hub::dispatch`.
    Direct,
    /// The shared service queue.
    Service,
    /// A queue owned by one endpoint.
    Dedicated(String),
    /// The hub's private reply queue.
    Replies,
    /// The service's alert queue.
    Alerts,
}

/// Lifecycle of one receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverState {
    Running,
    /// The subscription failed; the receiver exited and can be restarted.
    Lost(String),
    Stopped,
}

/// Snapshot of one receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverStatus {
    pub queue: String,
    pub state: ReceiverState,
    /// Frames taken off the queue.
    pub frames: u64,
    /// Frames dropped because they did not decode.
    pub decode_failures: u64,
}

struct ReceiverStats {
    state: Mutex<ReceiverState>,
    frames: AtomicU64,
    decode_failures: AtomicU64,
}

impl ReceiverStats {
    fn set_state(&self, state: ReceiverState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> ReceiverState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Owned by the hub; stops and joins the task.
pub(crate) struct ReceiverHandle {
    pub subscription: Subscription,
    pub origin: Origin,
    stats: Arc<ReceiverStats>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReceiverHandle {
    pub fn status(&self) -> ReceiverStatus {
        ReceiverStatus {
            queue: self.subscription.queue.clone(),
            state: self.stats.state(),
            frames: self.stats.frames.load(Ordering::Relaxed),
            decode_failures: self.stats.decode_failures.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// True when called from inside this receiver's own dispatch, e.g. by
    /// an endpoint handler.
    pub fn is_current_task(&self) -> bool {
        tokio::task::try_id() == Some(self.task.id())
    }

    /// Signal the loop to exit after the message it is dispatching, then
    /// wait for it.
    ///
    /// From inside the receiver's own dispatch there is nothing to wait
    /// for: the loop exits once the current handler returns.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if self.is_current_task() {
            debug!(queue = %self.subscription.queue, "Receiver stops after the current dispatch");
            return;
        }

        let queue = self.subscription.queue;
        if let Err(e) = self.task.await {
            error!(queue = %queue, error = %e, "Receiver task failed");
        }
        self.stats.set_state(ReceiverState::Stopped);
    }
}

pub(crate) fn spawn(
    hub: Weak<HubInner>,
    subscription: Subscription,
    origin: Origin,
    stream: FrameStream,
    assembler: ChunkAssembler,
    eviction_period: Duration,
) -> ReceiverHandle {
    let stats = Arc::new(ReceiverStats {
        state: Mutex::new(ReceiverState::Running),
        frames: AtomicU64::new(0),
        decode_failures: AtomicU64::new(0),
    });
    let (stop, stop_rx) = watch::channel(false);

    let task = tokio::spawn(run(
        hub,
        subscription.queue.clone(),
        origin.clone(),
        stream,
        assembler,
        eviction_period,
        Arc::clone(&stats),
        stop_rx,
    ));

    ReceiverHandle {
        subscription,
        origin,
        stats,
        stop,
        task,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    hub: Weak<HubInner>,
    queue: String,
    origin: Origin,
    mut stream: FrameStream,
    mut assembler: ChunkAssembler,
    eviction_period: Duration,
    stats: Arc<ReceiverStats>,
    mut stop: watch::Receiver<bool>,
) {
    info!(queue = %queue, "Receiver started");

    let mut eviction = tokio::time::interval(eviction_period);
    eviction.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => break,

            _ = eviction.tick() => {
                assembler.evict_idle();
            }

            next = stream.next() => match next {
                Some(Ok(frame)) => {
                    stats.frames.fetch_add(1, Ordering::Relaxed);
                    let message = match assembler.push(&frame) {
                        Ok(Some(message)) => message,
                        Ok(None) => continue,
                        Err(e) => {
                            stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                queue = %queue,
                                routing_key = %frame.routing_key,
                                error = %e,
                                "Dropping frame that failed to decode"
                            );
                            continue;
                        }
                    };

                    let Some(hub) = hub.upgrade() else {
                        debug!(queue = %queue, "Hub dropped, receiver exiting");
                        break;
                    };
                    hub.dispatch_from(message, &origin).await;
                }
                Some(Err(e)) => {
                    error!(queue = %queue, error = %e, "Subscription lost");
                    stats.set_state(ReceiverState::Lost(e.to_string()));
                    return;
                }
                None => {
                    error!(queue = %queue, "Subscription closed by the bus");
                    stats.set_state(ReceiverState::Lost("subscription closed".to_string()));
                    return;
                }
            },
        }
    }

    stats.set_state(ReceiverState::Stopped);
    info!(queue = %queue, "Receiver stopped");
}
