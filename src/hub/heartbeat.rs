//! Heartbeat scheduler.
//!
//! Publishes a liveness alert every interval. Fire times are computed from
//! the start time (`start + n * interval`), so a slow publish delays one beat
//! without shifting the ones after it.

use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::AlertSender;
use crate::message::Alert;

/// Identity fields carried by every beat.
#[derive(Debug, Clone)]
pub(crate) struct HeartbeatIdentity {
    pub name: String,
    pub id: String,
    pub package: String,
    pub version: String,
    pub hostname: String,
}

pub(crate) struct Heartbeat {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub fn spawn(
        sender: AlertSender,
        routing_key: String,
        interval: Duration,
        identity: HeartbeatIdentity,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(sender, routing_key, interval, identity, stop_rx));
        Self { stop, task }
    }

    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Heartbeat task failed");
        }
    }
}

async fn run(
    sender: AlertSender,
    routing_key: String,
    interval: Duration,
    identity: HeartbeatIdentity,
    mut stop: watch::Receiver<bool>,
) {
    info!(routing_key = %routing_key, interval = ?interval, "Heartbeat started");

    let mut next = Instant::now() + interval;
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => break,

            _ = sleep_until(next) => {
                sequence += 1;
                let alert = Alert::new(
                    routing_key.clone(),
                    json!({
                        "name": identity.name,
                        "id": identity.id,
                        "package": identity.package,
                        "version": identity.version,
                        "hostname": identity.hostname,
                        "sequence": sequence,
                    }),
                );
                match sender.publish(alert).await {
                    Ok(()) => debug!(sequence, "Heartbeat sent"),
                    Err(e) => warn!(sequence, error = %e, "Failed to send heartbeat"),
                }

                next += interval;
                let now = Instant::now();
                if next <= now {
                    let missed = (now - next).as_nanos() / interval.as_nanos() + 1;
                    warn!(missed = %missed, "Heartbeat fell behind, skipping beats");
                    while next <= now {
                        next += interval;
                    }
                }
            }
        }
    }

    info!(routing_key = %routing_key, "Heartbeat stopped");
}
