use futures::future::Shared;
use std::future::Future;
use std::pin::Pin;

pub type BoxedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed future that many callers can await, each receiving a clone of the
/// output. Used for all deduplicated work in the crate (in-flight prepares,
/// pending keyspace switches, lifecycle transitions).
pub(crate) type SharedFuture<T> = Shared<BoxedFuture<'static, T>>;
