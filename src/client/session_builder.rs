use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{Connector, Registry};
use crate::frame::types::Consistency;
use crate::policies::load_balancing::{LoadBalancingPolicy, RoundRobinPolicy};
use crate::policies::reconnection::{ExponentialReconnectionPolicy, ReconnectionPolicy};
use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};

use super::session::{ClusterClient, ClusterClientConfig};

/// A convenient builder for a [ClusterClient], pre-populated with the stock
/// policies: round-robin load balancing, exponential reconnection and the
/// default retry policy.
pub struct ClusterClientBuilder {
    config: ClusterClientConfig,
}

impl ClusterClientBuilder {
    pub fn new(registry: Arc<dyn Registry>, connector: Arc<dyn Connector>) -> ClusterClientBuilder {
        ClusterClientBuilder {
            config: ClusterClientConfig {
                registry,
                connector,
                load_balancing_policy: Arc::new(RoundRobinPolicy::new()),
                reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
                retry_policy: Arc::new(DefaultRetryPolicy::new()),
                default_consistency: Consistency::LocalQuorum,
                request_timeout: Duration::from_secs(30),
            },
        }
    }

    pub fn load_balancing_policy(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.load_balancing_policy = policy;
        self
    }

    pub fn reconnection_policy(mut self, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.config.reconnection_policy = policy;
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = policy;
        self
    }

    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.config.default_consistency = consistency;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn build(self) -> ClusterClient {
        ClusterClient::with_config(self.config)
    }
}
