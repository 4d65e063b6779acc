//! Routing registry: maps routing-key patterns to endpoints.
//!
//! Resolution rules:
//! - Requests resolve to exactly one endpoint. When several routes match, the
//!   [`RoutePolicy`] decides; the default `Strict` policy reports
//!   `AmbiguousRoute`.
//! - Alerts fan out to every matching listener; no match is not an error.
//!
//! Results are always returned in registration order, so `FirstRegistered`
//! picks the route registered earliest. Callers relying on that policy must
//! register their more specific routes first.

mod pattern;

use std::sync::Arc;

use serde::Deserialize;

use crate::bus::Exchange;
use crate::endpoint::Endpoint;
use crate::message::MessageKind;

pub use pattern::Pattern;

/// Result type for routing operations.
pub type Result<T> = std::result::Result<T, RoutingError>;

/// Errors raised by the routing registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("Endpoint '{0}' is already registered")]
    DuplicateName(String),

    #[error("Invalid routing pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("No endpoint matches routing key '{0}'")]
    NoMatchingEndpoint(String),

    #[error("Routing key '{key}' matches several endpoints: {}", .endpoints.join(", "))]
    AmbiguousRoute { key: String, endpoints: Vec<String> },
}

/// Tie-break policy when several request routes match one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePolicy {
    /// Several matches are a configuration error (`AmbiguousRoute`).
    #[default]
    Strict,
    /// The earliest registered route wins.
    FirstRegistered,
    /// The route with the most literal tokens wins, then the fewest `#`
    /// tokens, then the earliest registered.
    MostSpecific,
}

/// Where an endpoint listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pattern: String,
    exchange: Exchange,
    dedicated: bool,
}

impl Route {
    /// Route requests whose key matches `pattern`.
    pub fn requests(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            exchange: Exchange::Requests,
            dedicated: false,
        }
    }

    /// Route alerts whose key matches `pattern`.
    pub fn alerts(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            exchange: Exchange::Alerts,
            dedicated: false,
        }
    }

    /// Give this route its own queue and receiver instead of sharing the
    /// service queue. Only meaningful for request routes; alert routes always
    /// share the service's alert queue.
    pub fn dedicated(mut self) -> Self {
        self.dedicated = true;
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }
}

/// Proof of registration, used to deregister.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationHandle {
    id: u64,
    name: String,
}

impl RegistrationHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A registered route.
#[derive(Clone)]
pub struct RouteEntry {
    id: u64,
    name: String,
    pattern: Pattern,
    exchange: Exchange,
    dedicated: bool,
    endpoint: Arc<dyn Endpoint>,
}

impl RouteEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }
}

impl std::fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pattern", &self.pattern.as_str())
            .field("exchange", &self.exchange)
            .field("dedicated", &self.dedicated)
            .finish()
    }
}

/// Registry of named endpoints and the patterns they listen on.
///
/// Not synchronized itself; the hub guards it with a lock. Resolution hands
/// out `Arc` clones so that deregistration never interrupts a dispatch that
/// is already running.
#[derive(Debug, Default)]
pub struct RoutingRegistry {
    entries: Vec<RouteEntry>,
    next_id: u64,
    policy: RoutePolicy,
}

impl RoutingRegistry {
    pub fn new(policy: RoutePolicy) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            policy,
        }
    }

    pub fn policy(&self) -> RoutePolicy {
        self.policy
    }

    /// Register `endpoint` under `route`.
    ///
    /// Fails with `DuplicateName` if an endpoint with the same name is
    /// already registered, or `InvalidPattern` if the pattern does not parse.
    pub fn register(
        &mut self,
        route: Route,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<RegistrationHandle> {
        let name = endpoint.name().to_string();
        if self.contains(&name) {
            return Err(RoutingError::DuplicateName(name));
        }
        let pattern = Pattern::parse(&route.pattern)?;

        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(RouteEntry {
            id,
            name: name.clone(),
            pattern,
            exchange: route.exchange,
            dedicated: route.dedicated,
            endpoint,
        });

        Ok(RegistrationHandle { id, name })
    }

    /// Remove a registration. Returns false if it was already removed.
    pub fn deregister(&mut self, handle: &RegistrationHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != handle.id);
        self.entries.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn get(&self, handle: &RegistrationHandle) -> Option<&RouteEntry> {
        self.entries.iter().find(|e| e.id == handle.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered routes in registration order.
    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// Endpoints that should receive a message with `routing_key`.
    ///
    /// Requests and replies resolve to exactly one endpoint or fail; alerts
    /// resolve to every matching listener, possibly none.
    pub fn resolve(&self, routing_key: &str, kind: MessageKind) -> Result<Vec<Arc<dyn Endpoint>>> {
        match kind {
            MessageKind::Alert => Ok(self
                .matching(routing_key, Exchange::Alerts)
                .into_iter()
                .map(|e| Arc::clone(&e.endpoint))
                .collect()),
            MessageKind::Request | MessageKind::Reply => self
                .resolve_request(routing_key)
                .map(|e| vec![Arc::clone(&e.endpoint)]),
        }
    }

    fn matching(&self, routing_key: &str, exchange: Exchange) -> Vec<&RouteEntry> {
        self.entries
            .iter()
            .filter(|e| e.exchange == exchange && e.pattern.matches(routing_key))
            .collect()
    }

    /// Every request route matching `routing_key`, in registration order,
    /// regardless of policy.
    pub fn request_candidates(&self, routing_key: &str) -> Vec<&RouteEntry> {
        self.matching(routing_key, Exchange::Requests)
    }

    /// The single request route for `routing_key`, chosen by the policy.
    pub fn resolve_request(&self, routing_key: &str) -> Result<&RouteEntry> {
        let candidates = self.matching(routing_key, Exchange::Requests);

        match (candidates.as_slice(), self.policy) {
            ([], _) => Err(RoutingError::NoMatchingEndpoint(routing_key.to_string())),
            ([only], _) => Ok(*only),
            ([first, ..], RoutePolicy::FirstRegistered) => Ok(*first),
            ([first, rest @ ..], RoutePolicy::MostSpecific) => {
                let mut best = *first;
                for candidate in rest {
                    if candidate.pattern.specificity() > best.pattern.specificity() {
                        best = *candidate;
                    }
                }
                Ok(best)
            }
            (_, RoutePolicy::Strict) => Err(RoutingError::AmbiguousRoute {
                key: routing_key.to_string(),
                endpoints: candidates.iter().map(|e| e.name.clone()).collect(),
            }),
        }
    }
}
