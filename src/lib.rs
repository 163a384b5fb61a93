//! Cluster client core of an async CQL native-protocol driver.
//!
//! This crate implements the subsystem that sits between a session API and
//! the per-connection protocol layer of a Cassandra driver: it dispatches
//! requests (queries, prepared executions, batches) across a pool of
//! per-host connections, enforces the load balancing and retry policies,
//! caches prepared-statement ids per host, keeps connections aligned with
//! the target keyspace and reacts to topology changes.
//!
//! # Collaborators
//! The pieces the core deliberately does not own are consumed through
//! traits:
//! * [`Connection`](network::Connection) - one multiplexed connection,
//!   exchanging semantic [`Request`](frame::Request)/[`Response`](frame::Response)
//!   frames (the wire codec lives behind it),
//! * [`Connector`](cluster::Connector) - opens the connections for a host,
//! * [`Registry`](cluster::Registry) - owns cluster membership and fans out
//!   host up/down events,
//! * the policy plane in [`policies`] - load balancing, reconnection
//!   backoff and retries.
//!
//! # Dispatching
//! All driver activity revolves around the [`ClusterClient`]: build one with
//! the [`ClusterClientBuilder`], `connect()` it, then submit statements with
//! `query`, `prepare`, `execute` and `batch`. Every resolved request carries
//! an [`ExecutionInfo`](response::ExecutionInfo) describing which hosts were
//! tried, the final consistency and how many retries the retry policy spent.

pub mod client;
pub mod cluster;
pub mod errors;
pub mod frame;
pub mod network;
pub mod policies;
pub mod response;
pub mod statement;
pub mod utils;

pub use client::{ClusterClient, ClusterClientBuilder, ClusterClientConfig};
pub use cluster::{Host, HostDistance};
pub use frame::types::Consistency;
pub use response::{ExecutionInfo, QueryResult};
pub use statement::batch::{Batch, BatchStatement, BatchType};
pub use statement::prepared::PreparedStatement;
pub use statement::{ExecutionOptions, Statement};
