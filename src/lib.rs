//! Dripline - messaging hub for distributed instrumentation services
//!
//! Services exchange three kinds of messages over two shared topic
//! exchanges: requests (answered by exactly one endpoint with a reply) and
//! alerts (broadcast to every interested listener). A [`Hub`] owns the
//! routing registry, one receiver per subscribed queue, the table of
//! outstanding requests and a heartbeat. It runs on any [`MessageBus`]:
//! RabbitMQ (feature `amqp`) or the in-process [`ChannelBus`] for offline
//! use and tests.

pub mod bus;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod hub;
pub mod message;
pub mod routing;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bus::{ChannelBus, Exchange, Frame, MessageBus};
pub use codec::{Codec, DecodeError};
pub use config::DriplineConfig;
pub use endpoint::{Endpoint, EndpointError, EndpointResult, KeyedEndpoint, ReplyContent};
pub use hub::{AlertSender, Hub, HubConfig, HubError, HubState};
pub use message::{
    Alert, CorrelationId, Message, MessageKind, Operation, Reply, Request, RequestBuilder,
    ReturnCode, SenderInfo, Specifier,
};
pub use routing::{RegistrationHandle, Route, RoutePolicy, RoutingError};
