use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use imrpc_common::{ImrpcError, Result};

use crate::registry::{Registry, RegistryEvent, ServiceInstance};

const SUBSCRIBER_BUFFER: usize = 16;

#[derive(Default)]
struct State {
    instances: HashMap<String, Vec<ServiceInstance>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<RegistryEvent>>>,
    closed: bool,
}

/// Process-local registry, for tests, demos and single-host deployments.
///
/// Registering an address that is already present replaces that instance.
/// Subscribers whose buffer is full miss the event; they still re-list on the
/// events already queued, which observe the new state.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: Mutex<State>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(state: &mut State, service: &str, event: RegistryEvent) {
        if let Some(subscribers) = state.subscribers.get_mut(service) {
            subscribers.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("subscriber of {} lagging, event coalesced", service);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    fn closed_error() -> ImrpcError {
        ImrpcError::Registry("registry closed".to_string())
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(Self::closed_error());
        }

        let list = state.instances.entry(instance.name.clone()).or_default();
        match list.iter_mut().find(|i| i.address == instance.address) {
            Some(existing) => *existing = instance.clone(),
            None => list.push(instance.clone()),
        }
        debug!("registered {} at {}", instance.name, instance.address);

        Self::notify(&mut state, &instance.name, RegistryEvent::Registered(instance.clone()));
        Ok(())
    }

    async fn unregister(&self, instance: &ServiceInstance) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(Self::closed_error());
        }

        let removed = match state.instances.get_mut(&instance.name) {
            Some(list) => {
                let before = list.len();
                list.retain(|i| i.address != instance.address);
                before != list.len()
            }
            None => false,
        };

        if removed {
            debug!("unregistered {} at {}", instance.name, instance.address);
            Self::notify(
                &mut state,
                &instance.name,
                RegistryEvent::Unregistered(instance.clone()),
            );
        }
        Ok(())
    }

    async fn list_services(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(Self::closed_error());
        }
        Ok(state.instances.get(service).cloned().unwrap_or_default())
    }

    async fn subscribe(&self, service: &str) -> Result<mpsc::Receiver<RegistryEvent>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(Self::closed_error());
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        state.subscribers.entry(service.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        // Dropping the senders ends every subscription stream
        state.subscribers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_list() {
        let registry = InMemoryRegistry::new();
        let a = ServiceInstance::new("user", "127.0.0.1:8081");
        let b = ServiceInstance::new("user", "127.0.0.1:8082").with_group("B");
        registry.register(&a).await.unwrap();
        registry.register(&b).await.unwrap();
        registry
            .register(&ServiceInstance::new("order", "127.0.0.1:9000"))
            .await
            .unwrap();

        assert_eq!(registry.list_services("user").await.unwrap(), vec![a, b]);
        assert!(registry.list_services("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_same_address_replaces() {
        let registry = InMemoryRegistry::new();
        registry
            .register(&ServiceInstance::new("user", "127.0.0.1:8081"))
            .await
            .unwrap();
        let heavier = ServiceInstance::new("user", "127.0.0.1:8081").with_weight(5);
        registry.register(&heavier).await.unwrap();

        assert_eq!(registry.list_services("user").await.unwrap(), vec![heavier]);
    }

    #[tokio::test]
    async fn test_subscribe_receives_changes() {
        let registry = InMemoryRegistry::new();
        let mut events = registry.subscribe("user").await.unwrap();
        let instance = ServiceInstance::new("user", "127.0.0.1:8081");

        registry.register(&instance).await.unwrap();
        registry.unregister(&instance).await.unwrap();
        // Unknown instance: nothing removed, no event
        registry.unregister(&instance).await.unwrap();

        assert_eq!(
            events.recv().await,
            Some(RegistryEvent::Registered(instance.clone()))
        );
        assert_eq!(
            events.recv().await,
            Some(RegistryEvent::Unregistered(instance))
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions_and_rejects_calls() {
        let registry = InMemoryRegistry::new();
        let mut events = registry.subscribe("user").await.unwrap();
        registry.close().await.unwrap();

        assert_eq!(events.recv().await, None);
        assert!(registry.list_services("user").await.is_err());
        assert!(registry
            .register(&ServiceInstance::new("user", "127.0.0.1:1"))
            .await
            .is_err());
    }
}
