//! Endpoint built from closures keyed by the first specifier token.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Endpoint, EndpointError, EndpointResult};
use crate::message::{Operation, Request};

type Handler = Arc<dyn Fn(&Request) -> EndpointResult + Send + Sync>;

/// Endpoint whose handlers are looked up by the request's first specifier
/// token, per operation.
///
/// ```ignore
/// let endpoint = KeyedEndpoint::new("cryostat")
///     .on_get("temperature", |_| Ok(ReplyContent::new(json!(4.2))))
///     .on_cmd("reset", |_| Ok(ReplyContent::empty()));
/// ```
///
/// A request whose key has no handler is answered with
/// `MESSAGE_ERROR_BAD_PAYLOAD`.
pub struct KeyedEndpoint {
    name: String,
    get: HashMap<String, Handler>,
    set: HashMap<String, Handler>,
    cmd: HashMap<String, Handler>,
}

impl KeyedEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            get: HashMap::new(),
            set: HashMap::new(),
            cmd: HashMap::new(),
        }
    }

    pub fn on_get<F>(mut self, key: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Request) -> EndpointResult + Send + Sync + 'static,
    {
        self.get.insert(key.into(), Arc::new(handler));
        self
    }

    pub fn on_set<F>(mut self, key: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Request) -> EndpointResult + Send + Sync + 'static,
    {
        self.set.insert(key.into(), Arc::new(handler));
        self
    }

    pub fn on_cmd<F>(mut self, key: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Request) -> EndpointResult + Send + Sync + 'static,
    {
        self.cmd.insert(key.into(), Arc::new(handler));
        self
    }

    fn dispatch(&self, operation: Operation, request: &Request) -> EndpointResult {
        let table = match operation {
            Operation::Get => &self.get,
            Operation::Set => &self.set,
            Operation::Cmd => &self.cmd,
        };

        let key = request.specifier().first().ok_or_else(|| {
            EndpointError::invalid_specifier(format!(
                "{} on '{}' requires a specifier",
                operation, self.name
            ))
        })?;

        let handler = table.get(key).ok_or_else(|| {
            EndpointError::bad_payload(format!(
                "Unrecognized {} key '{}' for '{}'",
                operation, key, self.name
            ))
        })?;

        handler(request)
    }
}

#[async_trait]
impl Endpoint for KeyedEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_get(&self, request: &Request) -> EndpointResult {
        self.dispatch(Operation::Get, request)
    }

    async fn on_set(&self, request: &Request) -> EndpointResult {
        self.dispatch(Operation::Set, request)
    }

    async fn on_cmd(&self, request: &Request) -> EndpointResult {
        self.dispatch(Operation::Cmd, request)
    }
}
