//! Shared helpers: tracing setup and retry policies.

pub mod bootstrap;
pub mod retry;
