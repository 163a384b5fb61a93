//! The configurable client of the whole cluster.
//! The following abstractions are involved:
//! - [ClusterClient](session::ClusterClient) - the main entity. It:
//!     - supervises connect/close of the per-host connection pools,
//!     - reacts to topology events from the registry,
//!     - dispatches CQL requests, taking all policies into consideration.
//! - [ClusterClientBuilder](session_builder::ClusterClientBuilder) - just a
//!   convenient builder for a `ClusterClient`.

pub mod session;
pub mod session_builder;

#[cfg(test)]
mod session_test;

pub use session::{ClusterClient, ClusterClientConfig};
pub use session_builder::ClusterClientBuilder;
