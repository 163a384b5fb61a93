//! Semantic frame variants exchanged with the connection layer.
//!
//! The wire format is owned by the connection implementation; the cluster
//! client core only deals in the request and response shapes defined here.

pub mod request;
pub mod response;
pub mod types;

pub use request::Request;
pub use response::Response;
pub use types::Consistency;
