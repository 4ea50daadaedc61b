//! Environment model.
//!
//! The agent consumes service-discovery state through a single snapshot
//! call; everything here is read-only from its perspective. Snapshots are
//! canonicalized so that equal environments render byte-equal artifacts.

use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Identity of the node the agent runs beside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Service cluster the node belongs to.
    pub service_cluster: String,

    /// Unique node name within the cluster.
    pub service_node: String,

    /// IP address used to match host-local instances.
    pub ip_address: String,
}

/// Application protocol of a service port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP/1.1.
    Http,
    /// HTTP/2.
    Http2,
    /// gRPC over HTTP/2.
    Grpc,
    /// Opaque TCP.
    Tcp,
    /// TLS-wrapped, treated as opaque TCP.
    Https,
}

/// A named service port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Port name, unique within the service.
    pub name: String,

    /// Port number.
    pub port: u16,

    /// Application protocol.
    pub protocol: Protocol,
}

/// An entry in the service catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Fully qualified service hostname.
    pub hostname: String,

    /// Virtual address of the service.
    pub address: String,

    /// Declared ports.
    pub ports: Vec<Port>,
}

/// A service instance co-located with the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Hostname of the owning service.
    pub service_hostname: String,

    /// Endpoint address of the instance.
    pub endpoint_address: String,

    /// Endpoint port of the instance.
    pub endpoint_port: u16,

    /// The service port this endpoint backs.
    pub service_port: Port,
}

/// One immutable snapshot of discovery state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Service catalog.
    #[serde(default)]
    pub services: Vec<Service>,

    /// Instances co-located with the node.
    #[serde(default)]
    pub host_instances: Vec<ServiceInstance>,

    /// Health and management ports exposed by the node itself.
    #[serde(default)]
    pub management_ports: Vec<Port>,
}

impl Environment {
    /// Sort all collections into a canonical order so byte-equal snapshots
    /// render byte-equal payloads.
    pub fn canonicalize(&mut self) {
        self.services.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        for service in &mut self.services {
            service.ports.sort_by_key(|p| p.port);
        }
        self.host_instances
            .sort_by_key(|i| (i.endpoint_address.clone(), i.endpoint_port));
        self.management_ports.sort_by_key(|p| p.port);
    }
}

/// Source of environment snapshots.
///
/// One `snapshot` call corresponds to one environment query per reconcile
/// pass; implementations must not retry internally.
pub trait Discovery: Send + Sync {
    /// Produce a snapshot of the current environment for the given node.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError` when the source is unreadable; the agent
    /// treats this as transient.
    fn snapshot(&self, node: &NodeIdentity) -> Result<Environment, DiscoveryError>;
}

/// Discovery backed by an in-memory snapshot, swappable at runtime.
///
/// Used by tests and by deployments with a fixed service topology.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    environment: RwLock<Environment>,
}

impl StaticDiscovery {
    /// Create a source that serves the given snapshot.
    #[must_use]
    pub fn new(environment: Environment) -> Self {
        Self {
            environment: RwLock::new(environment),
        }
    }

    /// Replace the served snapshot.
    pub fn set(&self, environment: Environment) {
        *self.environment.write().expect("environment lock poisoned") = environment;
    }
}

impl Discovery for StaticDiscovery {
    fn snapshot(&self, _node: &NodeIdentity) -> Result<Environment, DiscoveryError> {
        Ok(self
            .environment
            .read()
            .expect("environment lock poisoned")
            .clone())
    }
}

/// Discovery backed by a JSON snapshot file, re-read on every call.
///
/// The file is typically maintained by an out-of-band sync job; the daemon's
/// poller turns modifications into reconcile requests.
#[derive(Debug)]
pub struct FileDiscovery {
    path: PathBuf,
}

impl FileDiscovery {
    /// Create a source reading from `path`.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Discovery for FileDiscovery {
    fn snapshot(&self, _node: &NodeIdentity) -> Result<Environment, DiscoveryError> {
        let contents = std::fs::read(&self.path)?;
        let environment = serde_json::from_slice(&contents)?;
        Ok(environment)
    }
}

/// Discovery errors.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The snapshot source could not be read.
    #[error("failed to read environment snapshot: {0}")]
    Io(#[from] std::io::Error),

    /// The snapshot could not be decoded.
    #[error("failed to decode environment snapshot: {0}")]
    Decode(#[from] serde_json::Error),
}
