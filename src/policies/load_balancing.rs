//! Load balancing configurations\
//! The cluster client can use any load balancing policy which implements the
//! `LoadBalancingPolicy` trait.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cluster::{Host, HostDistance};
use crate::frame::types::Consistency;

/// Represents info about the statement that can be used by load balancing
/// and retry policies.
#[derive(Debug, Clone, Default)]
pub struct RoutingInfo<'a> {
    /// The keyspace the request targets, if any.
    pub keyspace: Option<&'a str>,
    /// CQL text of the statement; `None` for batches.
    pub cql: Option<&'a str>,
    /// Consistency the request starts with.
    pub consistency: Consistency,
    /// A request is idempotent if it can be applied multiple times without
    /// changing the result of the initial application.
    pub is_idempotent: bool,
}

/// An ordered, single-pass sequence of hosts to try for one request.
/// The iterator ending signals that there are no more hosts to try.
pub type Plan = Box<dyn Iterator<Item = Host> + Send>;

/// Policy that decides which hosts to contact for each request.
///
/// For every request the dispatcher asks the policy for a plan and walks it
/// host by host until an attempt succeeds or the plan ends. The first
/// elements of the plan are the hosts that are the best to contact.
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    /// How the policy rates `host`; drives how many connections the
    /// connector opens towards it. Hosts at `Ignored` distance are not
    /// connected at all.
    fn distance(&self, host: &Host) -> HostDistance;

    /// Returns the plan for one request over the currently known hosts.
    fn plan(&self, request: &RoutingInfo<'_>, hosts: &[Host]) -> Plan;

    /// Returns the name of load balancing policy.
    fn name(&self) -> String;
}

/// A simple policy that treats every host as local and rotates the starting
/// host between consecutive plans.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> RoundRobinPolicy {
        RoundRobinPolicy::default()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn distance(&self, _host: &Host) -> HostDistance {
        HostDistance::Local
    }

    fn plan(&self, _request: &RoutingInfo<'_>, hosts: &[Host]) -> Plan {
        if hosts.is_empty() {
            return Box::new(std::iter::empty());
        }
        let start = self.index.fetch_add(1, Ordering::Relaxed) % hosts.len();
        let mut ordered = hosts.to_vec();
        ordered.rotate_left(start);
        Box::new(ordered.into_iter())
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::test_host;

    #[test]
    fn round_robin_rotates_the_starting_host() {
        let policy = RoundRobinPolicy::new();
        let hosts = vec![test_host(1), test_host(2), test_host(3)];

        let first: Vec<Host> = policy.plan(&RoutingInfo::default(), &hosts).collect();
        let second: Vec<Host> = policy.plan(&RoutingInfo::default(), &hosts).collect();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        assert_eq!(first[0], hosts[0]);
        assert_eq!(second[0], hosts[1]);
        // Every plan is a permutation of all hosts.
        assert_eq!(first[1..], [hosts[1].clone(), hosts[2].clone()]);
        assert_eq!(second[1..], [hosts[2].clone(), hosts[0].clone()]);
    }

    #[test]
    fn plan_over_no_hosts_is_empty() {
        let policy = RoundRobinPolicy::new();
        assert_eq!(policy.plan(&RoutingInfo::default(), &[]).count(), 0);
    }
}
