use async_trait::async_trait;
use tokio::sync::mpsc;

use imrpc_common::Result;

/// One registered instance of a named service.
///
/// Instances are immutable snapshots: a resolver replaces its whole set on
/// every registry update instead of patching fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceInstance {
    pub name: String,
    pub address: String,
    pub weight: u32,
    pub group: String,
}

impl ServiceInstance {
    /// An instance with weight 1 in the default (empty) group.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            weight: 1,
            group: String::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }
}

/// Change notification for a watched service.
///
/// Consumers treat any event as "the list changed" and re-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(ServiceInstance),
    Unregistered(ServiceInstance),
}

/// Service registry contract.
///
/// Backends (etcd, consul, the in-memory [`crate::InMemoryRegistry`]) implement
/// this; clients consume it through a [`crate::Resolver`] and servers call
/// `register`/`unregister` around their lifetime.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, instance: &ServiceInstance) -> Result<()>;

    async fn unregister(&self, instance: &ServiceInstance) -> Result<()>;

    /// Current instances of `service`, in registration order.
    async fn list_services(&self, service: &str) -> Result<Vec<ServiceInstance>>;

    /// Stream of change notifications for `service`.
    ///
    /// The stream ends (the receiver yields `None`) when the registry closes.
    async fn subscribe(&self, service: &str) -> Result<mpsc::Receiver<RegistryEvent>>;

    async fn close(&self) -> Result<()>;
}
