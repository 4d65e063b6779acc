//! Hub: owns the routing registry, receivers, outstanding requests and the
//! publish path of one service.
//!
//! Lifecycle: `Created -> Started -> Stopping -> Stopped`.
//!
//! - `start` subscribes every queue, spawns one receiver per queue and the
//!   heartbeat. Configuration errors surface here, before `Started`.
//! - `dispatch` handles a decoded message: requests get exactly one reply,
//!   replies complete an outstanding request, alerts fan out.
//! - `send_request` publishes a request and waits for its reply or timeout.
//! - `stop` stops receivers and heartbeat, cancels outstanding requests, and
//!   is idempotent. A stopped hub cannot be restarted.
//!
//! `Hub` is a cheap handle; clones share the same hub.

mod heartbeat;
mod pending;
mod receiver;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusError, Exchange, MessageBus, Subscription};
use crate::codec::{ChunkAssembler, Codec, EncodeError, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::config::{ConfigError, DriplineConfig};
use crate::endpoint::{self, Endpoint, EndpointResult, ReplyContent};
use crate::message::{
    Alert, CorrelationId, Message, MessageError, Reply, Request, RequestBuilder, ReturnCode,
    SenderInfo,
};
use crate::routing::{
    Pattern, RegistrationHandle, Route, RoutePolicy, RoutingError, RoutingRegistry,
};

use heartbeat::{Heartbeat, HeartbeatIdentity};
use pending::{PendingGuard, PendingReplies};
use receiver::{Origin, ReceiverHandle};

pub use receiver::{ReceiverState, ReceiverStatus};

/// Default routing key prefix for heartbeats.
pub const DEFAULT_HEARTBEAT_ROUTING_KEY: &str = "heartbeat";
/// Default key every service answers.
pub const DEFAULT_BROADCAST_KEY: &str = "broadcast";
/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// Default reply wait for `request`.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Default idle time before an incomplete chunked message is dropped.
pub const DEFAULT_CHUNK_IDLE_TIMEOUT: Duration = Duration::from_millis(1000);

// ============================================================================
// Errors
// ============================================================================

/// Result type for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;

/// Errors raised by the hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Hub is already started")]
    AlreadyStarted,

    #[error("Hub has been stopped")]
    Terminated,

    #[error("Hub is not started")]
    NotStarted,

    #[error("Invalid hub configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("No reply to '{routing_key}' within {timeout:?}")]
    Timeout {
        routing_key: String,
        timeout: Duration,
    },

    #[error("Request to '{0}' was cancelled because the hub stopped")]
    Cancelled(String),

    #[error("No receiver for queue '{0}'")]
    UnknownReceiver(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Runtime settings of one hub.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// Service identity; names the service queue and the heartbeat key.
    pub service_name: String,
    /// `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    pub heartbeat_routing_key: String,
    pub broadcast_key: String,
    pub max_payload_size: usize,
    pub request_timeout: Duration,
    pub chunk_idle_timeout: Duration,
    pub route_policy: RoutePolicy,
}

impl HubConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            heartbeat_routing_key: DEFAULT_HEARTBEAT_ROUTING_KEY.to_string(),
            broadcast_key: DEFAULT_BROADCAST_KEY.to_string(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            chunk_idle_timeout: DEFAULT_CHUNK_IDLE_TIMEOUT,
            route_policy: RoutePolicy::default(),
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat_interval = None;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn with_route_policy(mut self, policy: RoutePolicy) -> Self {
        self.route_policy = policy;
        self
    }

    /// Reject settings the hub cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (what, key) in [
            ("service_name", &self.service_name),
            ("heartbeat_routing_key", &self.heartbeat_routing_key),
            ("broadcast_key", &self.broadcast_key),
        ] {
            Pattern::parse(key).map_err(|e| HubError::InvalidConfig(format!("{}: {}", what, e)))?;
            if key.contains(['*', '#']) {
                return Err(HubError::InvalidConfig(format!(
                    "{} '{}' must not contain wildcards",
                    what, key
                )));
            }
        }
        if self.heartbeat_interval == Some(Duration::ZERO) {
            return Err(HubError::InvalidConfig(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(HubError::InvalidConfig(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_payload_size == 0 {
            return Err(HubError::InvalidConfig(
                "max payload size must be greater than zero".to_string(),
            ));
        }
        if self.chunk_idle_timeout.is_zero() {
            return Err(HubError::InvalidConfig(
                "chunk idle timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Created,
    Started,
    Stopping,
    Stopped,
}

// ============================================================================
// Alert sender
// ============================================================================

/// Publishes alerts on behalf of a hub.
///
/// Handed to endpoints that raise alerts on their own (state changes), so
/// they do not need a `Hub`. Alerts are stamped with the hub's identity.
#[derive(Clone)]
pub struct AlertSender {
    bus: Arc<dyn MessageBus>,
    codec: Codec,
    sender: SenderInfo,
    state: watch::Receiver<HubState>,
}

impl AlertSender {
    /// Publish `alert`. Fails unless the hub is started.
    pub async fn send(&self, alert: Alert) -> Result<()> {
        ensure_started(*self.state.borrow())?;
        self.publish(alert).await
    }

    pub(crate) async fn publish(&self, alert: Alert) -> Result<()> {
        let message = Message::from(alert.with_sender(self.sender.clone()));
        publish_message(self.bus.as_ref(), &self.codec, Exchange::Alerts, &message).await
    }
}

#[cfg(feature = "amqp")]
async fn connect_bus(config: &DriplineConfig) -> Result<Arc<dyn MessageBus>> {
    use crate::bus::{AmqpBus, AmqpConfig};

    let amqp = AmqpConfig::new(config.amqp_url())
        .with_exchanges(&config.requests_exchange, &config.alerts_exchange);
    Ok(Arc::new(AmqpBus::connect(amqp).await?))
}

#[cfg(not(feature = "amqp"))]
async fn connect_bus(_config: &DriplineConfig) -> Result<Arc<dyn MessageBus>> {
    Err(HubError::InvalidConfig(
        "built without the `amqp` feature; enable it or set offline_mode".to_string(),
    ))
}

fn ensure_started(state: HubState) -> Result<()> {
    match state {
        HubState::Started => Ok(()),
        HubState::Created => Err(HubError::NotStarted),
        HubState::Stopping | HubState::Stopped => Err(HubError::Terminated),
    }
}

#[tracing::instrument(name = "hub.publish", skip_all, fields(kind = %message.kind(), routing_key = %message.routing_key()))]
async fn publish_message(
    bus: &dyn MessageBus,
    codec: &Codec,
    exchange: Exchange,
    message: &Message,
) -> Result<()> {
    let frames = codec.encode(message)?;
    for frame in frames {
        bus.publish(exchange, frame).await?;
    }
    Ok(())
}

// ============================================================================
// Hub
// ============================================================================

#[derive(Default)]
struct Lifecycle {
    receivers: HashMap<String, ReceiverHandle>,
    heartbeat: Option<Heartbeat>,
}

pub(crate) struct HubInner {
    config: HubConfig,
    id: Uuid,
    sender: SenderInfo,
    bus: Arc<dyn MessageBus>,
    codec: Codec,
    registry: RwLock<RoutingRegistry>,
    pending: PendingReplies,
    reply_queue: String,
    state: watch::Sender<HubState>,
    lifecycle: Mutex<Lifecycle>,
}

/// Handle to a running service.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(config: HubConfig, bus: Arc<dyn MessageBus>) -> Result<Self> {
        config.validate()?;

        let id = Uuid::new_v4();
        let reply_queue = format!("{}_reply_{}", config.service_name, id.simple());
        let (state, _) = watch::channel(HubState::Created);

        let inner = HubInner {
            sender: SenderInfo::for_service(&config.service_name),
            codec: Codec::new(config.max_payload_size),
            registry: RwLock::new(RoutingRegistry::new(config.route_policy)),
            pending: PendingReplies::default(),
            lifecycle: Mutex::new(Lifecycle::default()),
            config,
            id,
            bus,
            reply_queue,
            state,
        };

        info!(
            service = %inner.config.service_name,
            id = %inner.id,
            "Hub created"
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Build a hub from file/environment configuration, with the offline
    /// channel bus or the AMQP bus as configured.
    pub async fn connect(config: &DriplineConfig) -> Result<Self> {
        let hub_config = config.hub_config()?;

        let bus: Arc<dyn MessageBus> = if config.offline_mode {
            info!("Offline mode: using in-process channel bus");
            Arc::new(crate::bus::ChannelBus::new())
        } else {
            connect_bus(config).await?
        };

        Self::new(hub_config, bus)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn service_name(&self) -> &str {
        &self.inner.config.service_name
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Identity stamped on everything this hub sends.
    pub fn sender_info(&self) -> &SenderInfo {
        &self.inner.sender
    }

    /// Routing key replies to this hub's requests are addressed to.
    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    pub fn state(&self) -> HubState {
        *self.inner.state.borrow()
    }

    /// Requests still waiting for a reply.
    pub fn outstanding_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_outstanding(&self, correlation_id: &CorrelationId) -> bool {
        self.inner.pending.contains(correlation_id)
    }

    pub fn alert_sender(&self) -> AlertSender {
        AlertSender {
            bus: Arc::clone(&self.inner.bus),
            codec: self.inner.codec,
            sender: self.inner.sender.clone(),
            state: self.inner.state.subscribe(),
        }
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register `endpoint` under `route`.
    ///
    /// Before `start` this only records the route. On a started hub the
    /// route is bound to its queue immediately; a dedicated route gets its
    /// own receiver.
    pub async fn register(
        &self,
        route: Route,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<RegistrationHandle> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let state = self.state();
        if matches!(state, HubState::Stopping | HubState::Stopped) {
            return Err(HubError::Terminated);
        }

        let handle = self
            .inner
            .registry
            .write()
            .await
            .register(route.clone(), endpoint)?;

        if state == HubState::Started {
            if let Err(e) = self.attach_route(&mut lifecycle, &route, handle.name()).await {
                self.inner.registry.write().await.deregister(&handle);
                return Err(e);
            }
        }

        info!(
            endpoint = %handle.name(),
            pattern = %route.pattern(),
            exchange = %route.exchange(),
            dedicated = route.is_dedicated(),
            "Endpoint registered"
        );
        Ok(handle)
    }

    /// Remove a registration. Dispatches already running keep their
    /// endpoint until they finish. A dedicated receiver is stopped.
    ///
    /// Bindings on shared queues stay in place; requests that no longer
    /// resolve are answered with `amqp_error_routingkey_notfound`.
    pub async fn deregister(&self, handle: &RegistrationHandle) -> bool {
        let dedicated = {
            let mut registry = self.inner.registry.write().await;
            let dedicated = registry.get(handle).map(|e| e.is_dedicated());
            if !registry.deregister(handle) {
                return false;
            }
            dedicated.unwrap_or(false)
        };

        if dedicated {
            let queue = self.dedicated_queue(handle.name());
            let receiver = self.inner.lifecycle.lock().await.receivers.remove(&queue);
            if let Some(receiver) = receiver {
                receiver.shutdown().await;
            }
        }

        info!(endpoint = %handle.name(), "Endpoint deregistered");
        true
    }

    fn dedicated_queue(&self, endpoint: &str) -> String {
        format!("{}_{}", self.inner.config.service_name, endpoint)
    }

    fn service_subscription(&self) -> Subscription {
        let config = &self.inner.config;
        Subscription::new(&config.service_name, Exchange::Requests)
            .bind(format!("{}.#", config.service_name))
            .bind(format!("{}.#", config.broadcast_key))
    }

    fn alerts_queue(&self) -> String {
        format!("{}_alerts", self.inner.config.service_name)
    }

    async fn attach_route(
        &self,
        lifecycle: &mut Lifecycle,
        route: &Route,
        endpoint: &str,
    ) -> Result<()> {
        let (queue, origin, base) = match (route.exchange(), route.is_dedicated()) {
            (Exchange::Requests, true) => {
                let queue = self.dedicated_queue(endpoint);
                let base = Subscription::new(&queue, Exchange::Requests);
                (queue, Origin::Dedicated(endpoint.to_string()), base)
            }
            (Exchange::Requests, false) => (
                self.inner.config.service_name.clone(),
                Origin::Service,
                self.service_subscription(),
            ),
            (Exchange::Alerts, _) => {
                let queue = self.alerts_queue();
                let base = Subscription::new(&queue, Exchange::Alerts);
                (queue, Origin::Alerts, base)
            }
        };

        match lifecycle.receivers.get_mut(&queue) {
            Some(receiver) => {
                self.inner
                    .bus
                    .bind(&queue, route.exchange(), route.pattern())
                    .await?;
                receiver.subscription = receiver.subscription.clone().bind(route.pattern());
            }
            None => {
                let subscription = base.bind(route.pattern());
                self.spawn_receiver(lifecycle, subscription, origin).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Subscribe every queue and start receivers and heartbeat.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match self.state() {
            HubState::Created => {}
            HubState::Started => return Err(HubError::AlreadyStarted),
            HubState::Stopping | HubState::Stopped => return Err(HubError::Terminated),
        }

        let plan = self.plan_subscriptions().await;
        for (subscription, origin) in plan {
            if let Err(e) = self
                .spawn_receiver(&mut lifecycle, subscription, origin)
                .await
            {
                error!(error = %e, "Failed to start hub, stopping receivers");
                for (_, receiver) in lifecycle.receivers.drain() {
                    receiver.shutdown().await;
                }
                return Err(e);
            }
        }

        self.inner.state.send_replace(HubState::Started);

        if let Some(interval) = self.inner.config.heartbeat_interval {
            let config = &self.inner.config;
            let sender = &self.inner.sender;
            lifecycle.heartbeat = Some(Heartbeat::spawn(
                self.alert_sender(),
                format!("{}.{}", config.heartbeat_routing_key, config.service_name),
                interval,
                HeartbeatIdentity {
                    name: config.service_name.clone(),
                    id: self.inner.id.to_string(),
                    package: sender.package.clone(),
                    version: sender.version.clone(),
                    hostname: sender.hostname.clone(),
                },
            ));
        }

        info!(
            service = %self.inner.config.service_name,
            receivers = lifecycle.receivers.len(),
            heartbeat = ?self.inner.config.heartbeat_interval,
            "Hub started"
        );
        Ok(())
    }

    async fn plan_subscriptions(&self) -> Vec<(Subscription, Origin)> {
        let registry = self.inner.registry.read().await;

        let mut service = self.service_subscription();
        let mut alerts: Option<Subscription> = None;
        let mut dedicated = Vec::new();

        for entry in registry.entries() {
            let pattern = entry.pattern().as_str();
            match (entry.exchange(), entry.is_dedicated()) {
                (Exchange::Requests, true) => dedicated.push((
                    Subscription::new(self.dedicated_queue(entry.name()), Exchange::Requests)
                        .bind(pattern),
                    Origin::Dedicated(entry.name().to_string()),
                )),
                (Exchange::Requests, false) => service = service.bind(pattern),
                (Exchange::Alerts, _) => {
                    let sub = alerts
                        .take()
                        .unwrap_or_else(|| Subscription::new(self.alerts_queue(), Exchange::Alerts));
                    alerts = Some(sub.bind(pattern));
                }
            }
        }

        let replies = Subscription::new(&self.inner.reply_queue, Exchange::Requests)
            .bind(&self.inner.reply_queue);

        let mut plan = vec![(service, Origin::Service), (replies, Origin::Replies)];
        plan.extend(dedicated);
        if let Some(alerts) = alerts {
            plan.push((alerts, Origin::Alerts));
        }
        plan
    }

    async fn spawn_receiver(
        &self,
        lifecycle: &mut Lifecycle,
        subscription: Subscription,
        origin: Origin,
    ) -> Result<()> {
        let stream = self.inner.bus.subscribe(&subscription).await?;
        let config = &self.inner.config;
        let handle = receiver::spawn(
            Arc::downgrade(&self.inner),
            subscription,
            origin,
            stream,
            ChunkAssembler::new(self.inner.codec, config.chunk_idle_timeout),
            config.chunk_idle_timeout,
        );
        lifecycle
            .receivers
            .insert(handle.subscription.queue.clone(), handle);
        Ok(())
    }

    /// Stop receivers and heartbeat and cancel outstanding requests.
    ///
    /// Idempotent; a concurrent or repeated call returns `Ok` at once.
    /// Called from an endpoint handler, it does not wait for that handler's
    /// own receiver, which exits as soon as the handler returns.
    pub async fn stop(&self) -> Result<()> {
        let (receivers, heartbeat) = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            match self.state() {
                HubState::Started => {}
                HubState::Created => {
                    self.inner.pending.cancel_all();
                    self.inner.state.send_replace(HubState::Stopped);
                    info!(service = %self.inner.config.service_name, "Hub stopped before start");
                    return Ok(());
                }
                HubState::Stopping | HubState::Stopped => return Ok(()),
            }
            self.inner.state.send_replace(HubState::Stopping);
            (
                lifecycle.receivers.drain().map(|(_, r)| r).collect::<Vec<_>>(),
                lifecycle.heartbeat.take(),
            )
        };

        let cancelled = self.inner.pending.cancel_all();
        if cancelled > 0 {
            warn!(cancelled, "Cancelled outstanding requests");
        }

        if let Some(heartbeat) = heartbeat {
            heartbeat.shutdown().await;
        }
        join_all(receivers.into_iter().map(ReceiverHandle::shutdown)).await;

        self.inner.state.send_replace(HubState::Stopped);
        info!(service = %self.inner.config.service_name, "Hub stopped");
        Ok(())
    }

    /// Snapshot of every receiver, sorted by queue.
    pub async fn receiver_status(&self) -> Vec<ReceiverStatus> {
        let lifecycle = self.inner.lifecycle.lock().await;
        let mut status: Vec<ReceiverStatus> =
            lifecycle.receivers.values().map(ReceiverHandle::status).collect();
        status.sort_by(|a, b| a.queue.cmp(&b.queue));
        status
    }

    /// Rebuild the receiver of `queue`, typically after it reported
    /// `ConnectionLost`. A receiver that is still running is stopped first.
    pub async fn restart_receiver(&self, queue: &str) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        ensure_started(self.state())?;

        let old = lifecycle
            .receivers
            .remove(queue)
            .ok_or_else(|| HubError::UnknownReceiver(queue.to_string()))?;
        let subscription = old.subscription.clone();
        let origin = old.origin.clone();

        if old.is_current_task() {
            // The old loop only exits after the calling handler returns, and
            // the queue cannot be consumed twice; finish the restart later.
            debug!(queue = %queue, "Receiver restarting itself");
            let hub = self.clone();
            tokio::spawn(async move {
                let queue = subscription.queue.clone();
                old.shutdown().await;
                if let Err(e) = hub.respawn_receiver(subscription, origin).await {
                    warn!(queue = %queue, error = %e, "Failed to restart receiver");
                }
            });
            return Ok(());
        }

        if old.is_running() {
            debug!(queue = %queue, "Stopping running receiver before restart");
        }
        old.shutdown().await;

        if let Err(e) = self
            .spawn_receiver(&mut lifecycle, subscription, origin)
            .await
        {
            warn!(queue = %queue, error = %e, "Failed to restart receiver");
            return Err(e);
        }
        info!(queue = %queue, "Receiver restarted");
        Ok(())
    }

    async fn respawn_receiver(&self, subscription: Subscription, origin: Origin) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        ensure_started(self.state())?;
        if lifecycle.receivers.contains_key(&subscription.queue) {
            return Ok(());
        }
        let queue = subscription.queue.clone();
        self.spawn_receiver(&mut lifecycle, subscription, origin)
            .await?;
        info!(queue = %queue, "Receiver restarted");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    /// Handle one decoded message as if a receiver had delivered it.
    pub async fn dispatch(&self, message: Message) -> Result<()> {
        ensure_started(self.state())?;
        self.inner.dispatch_from(message, &Origin::Direct).await;
        Ok(())
    }

    /// Publish a request and wait up to `timeout` for its reply.
    ///
    /// The hub stamps a fresh correlation id and its reply key. The
    /// outstanding entry is removed on every exit path, including the
    /// caller dropping this future.
    pub async fn send_request(&self, builder: RequestBuilder, timeout: Duration) -> Result<Reply> {
        ensure_started(self.state())?;

        let inner = &self.inner;
        let correlation_id = CorrelationId::generate();
        let request = builder.build_from(
            correlation_id.clone(),
            inner.reply_queue.clone(),
            &inner.sender,
        )?;
        let routing_key = request.routing_key().to_string();

        let waiter = inner
            .pending
            .insert(correlation_id.clone())
            .ok_or_else(|| HubError::Cancelled(routing_key.clone()))?;
        let _guard = PendingGuard::new(&inner.pending, correlation_id.clone());

        debug!(
            routing_key = %routing_key,
            correlation_id = %correlation_id,
            operation = %request.operation(),
            "Sending request"
        );
        inner
            .publish(Exchange::Requests, &Message::from(request))
            .await?;

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(HubError::Cancelled(routing_key)),
            Err(_) => {
                warn!(
                    routing_key = %routing_key,
                    correlation_id = %correlation_id,
                    timeout = ?timeout,
                    "Request timed out"
                );
                Err(HubError::Timeout {
                    routing_key,
                    timeout,
                })
            }
        }
    }

    /// `send_request` with the configured default timeout.
    pub async fn request(&self, builder: RequestBuilder) -> Result<Reply> {
        self.send_request(builder, self.inner.config.request_timeout)
            .await
    }

    /// Publish an alert stamped with this hub's identity.
    pub async fn send_alert(&self, alert: Alert) -> Result<()> {
        ensure_started(self.state())?;
        let message = Message::from(alert.with_sender(self.inner.sender.clone()));
        self.inner.publish(Exchange::Alerts, &message).await
    }
}

impl HubInner {
    async fn publish(&self, exchange: Exchange, message: &Message) -> Result<()> {
        publish_message(self.bus.as_ref(), &self.codec, exchange, message).await
    }

    pub(crate) async fn dispatch_from(&self, message: Message, origin: &Origin) {
        match message {
            Message::Request(request) => self.dispatch_request(request, origin).await,
            Message::Reply(reply) => {
                let correlation_id = reply.correlation_id().clone();
                if !self.pending.complete(reply) {
                    debug!(
                        correlation_id = %correlation_id,
                        "Dropping reply with no outstanding request"
                    );
                }
            }
            Message::Alert(alert) => self.dispatch_alert(alert).await,
        }
    }

    async fn dispatch_request(&self, request: Request, origin: &Origin) {
        let (resolved, owner) = {
            let registry = self.registry.read().await;
            let resolved = registry
                .resolve_request(request.routing_key())
                .map(|e| Arc::clone(e.endpoint()));
            let owner = self.answering_queue(&registry, &request);
            (resolved, owner)
        };

        // A key can reach the service queue and several dedicated queues;
        // only the owning queue answers, whether it resolved or not.
        if matches!(origin, Origin::Service | Origin::Dedicated(_)) && *origin != owner {
            debug!(
                routing_key = %request.routing_key(),
                queue = ?owner,
                "Left to the owning queue"
            );
            return;
        }

        let reply = match resolved {
            Ok(target) => endpoint::handle_request(target.as_ref(), &request).await,
            Err(RoutingError::NoMatchingEndpoint(_)) if self.addresses_service(&request) => {
                let service = ServiceEndpoint::new(self).await;
                endpoint::handle_request(&service, &request).await
            }
            Err(e) => {
                warn!(
                    routing_key = %request.routing_key(),
                    correlation_id = %request.correlation_id(),
                    error = %e,
                    "Request could not be routed"
                );
                request.reply(
                    ReturnCode::AMQP_ERROR_ROUTINGKEY_NOTFOUND,
                    e.to_string(),
                    Value::Null,
                )
            }
        };

        let reply = reply.with_sender(self.sender.clone());
        if let Err(e) = self.publish(Exchange::Requests, &Message::from(reply)).await {
            error!(
                routing_key = %request.routing_key(),
                reply_to = %request.reply_to(),
                error = %e,
                "Failed to publish reply"
            );
        }
    }

    /// The queue that answers `request`.
    ///
    /// A resolved route is answered by its own queue. Otherwise the service
    /// queue answers if it receives the key at all, and the dedicated queue
    /// of the earliest matching route if it does not.
    fn answering_queue(&self, registry: &RoutingRegistry, request: &Request) -> Origin {
        if let Ok(entry) = registry.resolve_request(request.routing_key()) {
            return if entry.is_dedicated() {
                Origin::Dedicated(entry.name().to_string())
            } else {
                Origin::Service
            };
        }

        let candidates = registry.request_candidates(request.routing_key());
        if self.addresses_service(request) || candidates.iter().any(|e| !e.is_dedicated()) {
            return Origin::Service;
        }
        candidates
            .first()
            .map(|e| Origin::Dedicated(e.name().to_string()))
            .unwrap_or(Origin::Service)
    }

    fn addresses_service(&self, request: &Request) -> bool {
        let first = request.routing_key().split('.').next();
        first == Some(self.config.service_name.as_str())
            || first == Some(self.config.broadcast_key.as_str())
    }

    async fn dispatch_alert(&self, alert: Alert) {
        let listeners = match self
            .registry
            .read()
            .await
            .resolve(alert.routing_key(), crate::message::MessageKind::Alert)
        {
            Ok(listeners) => listeners,
            Err(e) => {
                debug!(routing_key = %alert.routing_key(), error = %e, "Alert not routed");
                return;
            }
        };

        if listeners.is_empty() {
            debug!(routing_key = %alert.routing_key(), "No listeners for alert");
            return;
        }

        let deliveries = listeners.iter().map(|listener| {
            let alert = &alert;
            async move {
                if let Err(e) = endpoint::deliver_alert(listener.as_ref(), alert).await {
                    warn!(
                        listener = %listener.name(),
                        routing_key = %alert.routing_key(),
                        error = %e,
                        "Alert listener failed"
                    );
                }
            }
        });
        join_all(deliveries).await;
    }
}

// ============================================================================
// Built-in service endpoint
// ============================================================================

/// Answers requests addressed to the service itself or the broadcast key
/// when no registered endpoint matches: `ping` and `get`.
struct ServiceEndpoint {
    name: String,
    identity: Value,
}

impl ServiceEndpoint {
    async fn new(hub: &HubInner) -> Self {
        let endpoints: BTreeMap<String, Value> = hub
            .registry
            .read()
            .await
            .entries()
            .iter()
            .map(|e| {
                (
                    e.name().to_string(),
                    json!({
                        "pattern": e.pattern().as_str(),
                        "exchange": e.exchange().to_string(),
                    }),
                )
            })
            .collect();

        Self {
            name: hub.config.service_name.clone(),
            identity: json!({
                "name": hub.config.service_name,
                "id": hub.id.to_string(),
                "sender_info": hub.sender,
                "endpoints": endpoints,
            }),
        }
    }
}

#[async_trait]
impl Endpoint for ServiceEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_get(&self, _request: &Request) -> EndpointResult {
        Ok(ReplyContent::new(self.identity.clone()))
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("service", &self.inner.config.service_name)
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
