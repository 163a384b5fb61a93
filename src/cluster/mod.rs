//! Cluster topology: host identities and the contracts of the external
//! collaborators that own membership (the registry) and connection
//! establishment (the connector).

pub(crate) mod connection_manager;

use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use uuid::Uuid;

use crate::errors::ConnectionError;
use crate::network::Connection;
use crate::utils::futures::BoxedFuture;

#[derive(Debug)]
struct HostInfo {
    host_id: Uuid,
    address: SocketAddr,
    datacenter: Option<String>,
    rack: Option<String>,
}

/// A cluster host, as known by the registry.
///
/// `Host` is a cheap handle: cloning it never clones the underlying data.
/// Two hosts compare equal iff the registry gave them the same id; a host
/// that changes its broadcast address is represented by a new instance.
#[derive(Debug, Clone)]
pub struct Host {
    info: Arc<HostInfo>,
}

impl Host {
    pub fn new(host_id: Uuid, address: SocketAddr) -> Host {
        Host::with_location(host_id, address, None, None)
    }

    pub fn with_location(
        host_id: Uuid,
        address: SocketAddr,
        datacenter: Option<String>,
        rack: Option<String>,
    ) -> Host {
        Host {
            info: Arc::new(HostInfo {
                host_id,
                address,
                datacenter,
                rack,
            }),
        }
    }

    /// Unique identifier of the host.
    pub fn host_id(&self) -> Uuid {
        self.info.host_id
    }

    /// Address used to connect to the host.
    pub fn address(&self) -> SocketAddr {
        self.info.address
    }

    /// Datacenter of the host, if known.
    pub fn datacenter(&self) -> Option<&str> {
        self.info.datacenter.as_deref()
    }

    /// Rack of the host, if known.
    pub fn rack(&self) -> Option<&str> {
        self.info.rack.as_deref()
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.host_id() == other.host_id()
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host_id().hash(state);
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address())
    }
}

/// How the load balancing policy rates a host. The distance drives how many
/// connections the connector opens towards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDistance {
    Local,
    Remote,
    Ignored,
}

/// Receives topology callbacks from the registry.
///
/// `host_found` and `host_lost` track bare membership and are no-ops at the
/// cluster client layer; `host_up` and `host_down` drive connection
/// lifecycle.
pub trait HostListener: Send + Sync {
    fn host_found(&self, _host: &Host) {}

    fn host_lost(&self, _host: &Host) {}

    fn host_up(&self, host: &Host);

    /// Tears down per-host state. The returned future resolves once all
    /// connection closes have settled.
    fn host_down(&self, host: &Host) -> BoxedFuture<'static, ()>;
}

/// The host registry: owns cluster membership and fans out topology events.
pub trait Registry: Send + Sync {
    /// Snapshot of the currently known hosts.
    fn hosts(&self) -> Vec<Host>;

    fn add_listener(&self, listener: Arc<dyn HostListener>);

    fn remove_listener(&self, listener: &Arc<dyn HostListener>);
}

/// Establishes the initial set of connections for a host.
pub trait Connector: Send + Sync {
    /// Opens connections towards `host`, as many as `distance` warrants.
    fn connect(
        &self,
        host: &Host,
        distance: HostDistance,
    ) -> BoxedFuture<'static, Result<Vec<Arc<dyn Connection>>, ConnectionError>>;
}
