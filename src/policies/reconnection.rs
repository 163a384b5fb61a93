//! Reconnection configurations\
//! A reconnection policy produces, per connect loop, a schedule of waits
//! between consecutive connection attempts towards one host. The schedule
//! iterator ending means the loop gives up on the host for this cycle.

use std::time::Duration;

/// Specifies a policy used to decide when to reattempt connecting to a host.
pub trait ReconnectionPolicy: Send + Sync + std::fmt::Debug {
    /// Starts a fresh schedule of backoff intervals for one connect loop.
    fn schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send>;
}

/// Reconnects at a fixed interval, optionally giving up after a bounded
/// number of retries.
#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    interval: Duration,
    max_retries: Option<usize>,
}

impl ConstantReconnectionPolicy {
    pub fn new(interval: Duration) -> ConstantReconnectionPolicy {
        ConstantReconnectionPolicy {
            interval,
            max_retries: None,
        }
    }

    pub fn with_max_retries(interval: Duration, max_retries: usize) -> ConstantReconnectionPolicy {
        ConstantReconnectionPolicy {
            interval,
            max_retries: Some(max_retries),
        }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match self.max_retries {
            Some(count) => Box::new(std::iter::repeat(self.interval).take(count)),
            None => Box::new(std::iter::repeat(self.interval)),
        }
    }
}

/// Doubles the wait after every failed attempt, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_retries: Option<usize>,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> ExponentialReconnectionPolicy {
        ExponentialReconnectionPolicy {
            base_delay,
            max_delay,
            max_retries: None,
        }
    }

    pub fn with_max_retries(
        base_delay: Duration,
        max_delay: Duration,
        max_retries: usize,
    ) -> ExponentialReconnectionPolicy {
        ExponentialReconnectionPolicy {
            base_delay,
            max_delay,
            max_retries: Some(max_retries),
        }
    }
}

impl Default for ExponentialReconnectionPolicy {
    /// One second doubling up to one minute, giving up after 8 retries, so
    /// that a client connect over a dead contact point eventually settles.
    fn default() -> ExponentialReconnectionPolicy {
        ExponentialReconnectionPolicy::with_max_retries(
            Duration::from_secs(1),
            Duration::from_secs(60),
            8,
        )
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        Box::new(ExponentialSchedule {
            delay: self.base_delay.min(self.max_delay),
            max_delay: self.max_delay,
            remaining: self.max_retries,
        })
    }
}

struct ExponentialSchedule {
    delay: Duration,
    max_delay: Duration,
    remaining: Option<usize>,
}

impl Iterator for ExponentialSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        match self.remaining.as_mut() {
            Some(0) => return None,
            Some(left) => *left -= 1,
            None => {}
        }
        let current = self.delay;
        self.delay = self.delay.saturating_mul(2).min(self.max_delay);
        Some(current)
    }
}
