//! Request retries configurations\
//! To decide when to retry a request the cluster client can use any object
//! which implements the `RetryPolicy` trait. The policy is consulted for the
//! recoverable server errors (UNAVAILABLE, WRITE_TIMEOUT, READ_TIMEOUT); all
//! other server errors surface to the caller directly.

use crate::errors::WriteType;
use crate::frame::types::Consistency;
use crate::policies::load_balancing::RoutingInfo;

/// What the dispatcher should do with a recoverable server error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-send on the same connection at the given consistency, incrementing
    /// the request's retry counter.
    Retry(Consistency),
    /// Swallow the error and resolve the request with an empty result.
    Ignore,
    /// Surface the server error to the caller.
    Reraise,
}

/// Specifies a policy used to decide when to retry a request.
///
/// Each method receives the statement being retried, the detail fields of
/// the corresponding server error and the number of retries performed so
/// far.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// The coordinator believed not enough replicas were alive.
    fn on_unavailable(
        &self,
        request: &RoutingInfo<'_>,
        consistency: Consistency,
        required: i32,
        alive: i32,
        retries: u32,
    ) -> RetryDecision;

    /// The coordinator did not collect enough write acknowledgements in time.
    fn on_write_timeout(
        &self,
        request: &RoutingInfo<'_>,
        consistency: Consistency,
        write_type: &WriteType,
        required: i32,
        received: i32,
        retries: u32,
    ) -> RetryDecision;

    /// The coordinator did not collect enough read responses in time.
    fn on_read_timeout(
        &self,
        request: &RoutingInfo<'_>,
        consistency: Consistency,
        required: i32,
        received: i32,
        data_present: bool,
        retries: u32,
    ) -> RetryDecision;
}

/// Default retry policy - retries once when there is a high chance that a
/// retry might help.\
/// Behaviour based on [DataStax Java Driver](https://docs.datastax.com/en/developer/java-driver/4.10/manual/core/retries/)
#[derive(Debug, Default)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn on_unavailable(
        &self,
        _request: &RoutingInfo<'_>,
        consistency: Consistency,
        _required: i32,
        _alive: i32,
        retries: u32,
    ) -> RetryDecision {
        // The coordinator may have been network-isolated from the replicas;
        // one retry gives it a chance to observe them again. Two coordinators
        // being wrong in a row is unlikely enough to not retry further.
        if retries == 0 {
            RetryDecision::Retry(consistency)
        } else {
            RetryDecision::Reraise
        }
    }

    fn on_write_timeout(
        &self,
        request: &RoutingInfo<'_>,
        consistency: Consistency,
        write_type: &WriteType,
        _required: i32,
        _received: i32,
        retries: u32,
    ) -> RetryDecision {
        // Only a batch-log write is safe to replay wholesale, and only when
        // the statement is known to be idempotent.
        if retries == 0 && request.is_idempotent && *write_type == WriteType::BatchLog {
            RetryDecision::Retry(consistency)
        } else {
            RetryDecision::Reraise
        }
    }

    fn on_read_timeout(
        &self,
        _request: &RoutingInfo<'_>,
        consistency: Consistency,
        required: i32,
        received: i32,
        data_present: bool,
        retries: u32,
    ) -> RetryDecision {
        // Enough replicas answered but none with data: the coordinator picked
        // a dead data replica. It will have marked it down by the retry.
        if retries == 0 && received >= required && !data_present {
            RetryDecision::Retry(consistency)
        } else {
            RetryDecision::Reraise
        }
    }
}

/// Downgrading consistency retry policy - retries with lower consistency
/// level if it knows that the initial consistency is unreachable.\
/// Behaviour based on [DataStax Java Driver](https://docs.datastax.com/en/drivers/java/3.11/com/datastax/driver/core/policies/DowngradingConsistencyRetryPolicy.html)
#[derive(Debug, Default)]
pub struct DowngradingConsistencyRetryPolicy;

impl DowngradingConsistencyRetryPolicy {
    pub fn new() -> DowngradingConsistencyRetryPolicy {
        DowngradingConsistencyRetryPolicy
    }
}

fn max_likely_to_work_cl(known_ok: i32) -> Option<Consistency> {
    if known_ok >= 3 {
        Some(Consistency::Three)
    } else if known_ok == 2 {
        Some(Consistency::Two)
    } else if known_ok == 1 {
        Some(Consistency::One)
    } else {
        None
    }
}

impl RetryPolicy for DowngradingConsistencyRetryPolicy {
    fn on_unavailable(
        &self,
        _request: &RoutingInfo<'_>,
        consistency: Consistency,
        _required: i32,
        alive: i32,
        retries: u32,
    ) -> RetryDecision {
        if retries > 0 || consistency.is_serial() {
            return RetryDecision::Reraise;
        }
        match max_likely_to_work_cl(alive) {
            Some(new_cl) => RetryDecision::Retry(new_cl),
            None => RetryDecision::Reraise,
        }
    }

    fn on_write_timeout(
        &self,
        request: &RoutingInfo<'_>,
        consistency: Consistency,
        write_type: &WriteType,
        _required: i32,
        received: i32,
        retries: u32,
    ) -> RetryDecision {
        // Replaying or ignoring a write is only sound when the statement is
        // known to be idempotent.
        if retries > 0 || consistency.is_serial() || !request.is_idempotent {
            return RetryDecision::Reraise;
        }
        match write_type {
            // At least one replica acknowledged, so the write is persisted
            // somewhere; treating it as a success mirrors eventual
            // consistency semantics.
            WriteType::Simple | WriteType::Batch if received > 0 => RetryDecision::Ignore,
            WriteType::UnloggedBatch => match max_likely_to_work_cl(received) {
                Some(new_cl) => RetryDecision::Retry(new_cl),
                None => RetryDecision::Reraise,
            },
            WriteType::BatchLog => RetryDecision::Retry(consistency),
            _ => RetryDecision::Reraise,
        }
    }

    fn on_read_timeout(
        &self,
        _request: &RoutingInfo<'_>,
        consistency: Consistency,
        required: i32,
        received: i32,
        data_present: bool,
        retries: u32,
    ) -> RetryDecision {
        if retries > 0 || consistency.is_serial() {
            return RetryDecision::Reraise;
        }
        if received < required {
            match max_likely_to_work_cl(received) {
                Some(new_cl) => RetryDecision::Retry(new_cl),
                None => RetryDecision::Reraise,
            }
        } else if !data_present {
            RetryDecision::Retry(consistency)
        } else {
            RetryDecision::Reraise
        }
    }
}

/// Forwards all errors directly to the caller, never retrying or ignoring.
#[derive(Debug, Default)]
pub struct FallthroughRetryPolicy;

impl FallthroughRetryPolicy {
    pub fn new() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_unavailable(
        &self,
        _request: &RoutingInfo<'_>,
        _consistency: Consistency,
        _required: i32,
        _alive: i32,
        _retries: u32,
    ) -> RetryDecision {
        RetryDecision::Reraise
    }

    fn on_write_timeout(
        &self,
        _request: &RoutingInfo<'_>,
        _consistency: Consistency,
        _write_type: &WriteType,
        _required: i32,
        _received: i32,
        _retries: u32,
    ) -> RetryDecision {
        RetryDecision::Reraise
    }

    fn on_read_timeout(
        &self,
        _request: &RoutingInfo<'_>,
        _consistency: Consistency,
        _required: i32,
        _received: i32,
        _data_present: bool,
        _retries: u32,
    ) -> RetryDecision {
        RetryDecision::Reraise
    }
}
