use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use imrpc_common::ImrpcError;

use crate::registry::{Registry, RegistryEvent, ServiceInstance};

/// Receives resolved address sets.
pub trait AddressSink: Send + Sync {
    /// Replaces the whole instance set.
    fn update_state(&self, instances: Vec<ServiceInstance>);

    /// A registry call failed. The previous state stays in effect.
    fn report_error(&self, error: ImrpcError);
}

/// Resolver configuration.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Upper bound on a single `list_services` call
    pub list_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            list_timeout: Duration::from_secs(3),
        }
    }
}

impl ResolverConfig {
    pub fn with_list_timeout(mut self, timeout: Duration) -> Self {
        self.list_timeout = timeout;
        self
    }
}

struct Inner {
    service: String,
    registry: Arc<dyn Registry>,
    sink: Arc<dyn AddressSink>,
    config: ResolverConfig,
    // Serializes list + push between the watch loop and resolve_now()
    push: Mutex<()>,
}

impl Inner {
    async fn resolve(&self) {
        let _push = self.push.lock().await;
        let listed =
            tokio::time::timeout(self.config.list_timeout, self.registry.list_services(&self.service))
                .await;

        match listed {
            Ok(Ok(instances)) => {
                debug!("resolved {} instance(s) of {}", instances.len(), self.service);
                self.sink.update_state(instances);
            }
            Ok(Err(e)) => {
                warn!("listing {} failed: {}", self.service, e);
                self.sink.report_error(e);
            }
            Err(_) => {
                let e = ImrpcError::Registry(format!(
                    "listing {} timed out after {}ms",
                    self.service,
                    self.config.list_timeout.as_millis()
                ));
                warn!("{}", e);
                self.sink.report_error(e);
            }
        }
    }

    async fn watch(self: Arc<Self>, mut events: mpsc::Receiver<RegistryEvent>, close: CancellationToken) {
        loop {
            tokio::select! {
                _ = close.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        debug!("registry event for {}: {:?}", self.service, event);
                        self.resolve().await;
                    }
                    None => {
                        debug!("subscription to {} ended", self.service);
                        break;
                    }
                },
            }
        }
    }
}

/// Keeps an [`AddressSink`] in sync with a registry.
///
/// Starting the resolver lists the service once and pushes the result, then a
/// background task re-lists on every registry event and pushes the full set
/// again. Registry failures are reported to the sink and never stop the
/// watch loop.
///
/// # Example
///
/// ```no_run
/// use imrpc_balancer::{Balancer, InMemoryRegistry, Resolver, ResolverConfig, RoundRobinBuilder};
/// use std::sync::Arc;
///
/// # async fn demo() {
/// let registry = Arc::new(InMemoryRegistry::new());
/// let balancer = Arc::new(Balancer::new("user-service", Arc::new(RoundRobinBuilder::new())));
/// let resolver = Resolver::start("user-service", registry, balancer.clone(), ResolverConfig::default()).await;
/// // ...
/// resolver.close();
/// # }
/// ```
pub struct Resolver {
    inner: Arc<Inner>,
    close: CancellationToken,
    closed: AtomicBool,
}

impl Resolver {
    /// Resolves `service` once and starts watching it.
    ///
    /// The subscription is opened before the initial list so that no change
    /// between the two is missed. If subscribing fails the error is reported
    /// and the resolver serves the initial state only.
    pub async fn start(
        service: impl Into<String>,
        registry: Arc<dyn Registry>,
        sink: Arc<dyn AddressSink>,
        config: ResolverConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            service: service.into(),
            registry,
            sink,
            config,
            push: Mutex::new(()),
        });
        let close = CancellationToken::new();

        let events = match inner.registry.subscribe(&inner.service).await {
            Ok(events) => Some(events),
            Err(e) => {
                warn!("subscribing to {} failed: {}", inner.service, e);
                inner.sink.report_error(e);
                None
            }
        };

        inner.resolve().await;

        if let Some(events) = events {
            info!("watching {}", inner.service);
            tokio::spawn(inner.clone().watch(events, close.clone()));
        }

        Self {
            inner,
            close,
            closed: AtomicBool::new(false),
        }
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Re-lists immediately.
    pub async fn resolve_now(&self) {
        self.inner.resolve().await;
    }

    /// Stops the watch loop. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!("closing resolver for {}", self.inner.service);
        self.close.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        states: StdMutex<Vec<Vec<String>>>,
        errors: StdMutex<Vec<String>>,
    }

    impl RecordingSink {
        fn states(&self) -> Vec<Vec<String>> {
            self.states.lock().unwrap().clone()
        }

        fn errors(&self) -> Vec<String> {
            self.errors.lock().unwrap().clone()
        }
    }

    impl AddressSink for RecordingSink {
        fn update_state(&self, instances: Vec<ServiceInstance>) {
            let addresses = instances.into_iter().map(|i| i.address).collect();
            self.states.lock().unwrap().push(addresses);
        }

        fn report_error(&self, error: ImrpcError) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_initial_resolve_and_full_replace_on_events() {
        let registry = Arc::new(InMemoryRegistry::new());
        let a = ServiceInstance::new("user", "10.0.0.1:80");
        let b = ServiceInstance::new("user", "10.0.0.2:80");
        registry.register(&a).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let resolver =
            Resolver::start("user", registry.clone(), sink.clone(), ResolverConfig::default()).await;
        assert_eq!(sink.states(), vec![vec!["10.0.0.1:80".to_string()]]);

        registry.register(&b).await.unwrap();
        eventually(|| sink.states().last().map(Vec::len) == Some(2)).await;

        registry.unregister(&a).await.unwrap();
        eventually(|| sink.states().last() == Some(&vec!["10.0.0.2:80".to_string()])).await;

        assert!(resolver.close());
        assert!(!resolver.close());
    }

    #[tokio::test]
    async fn test_close_stops_watching() {
        let registry = Arc::new(InMemoryRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let resolver =
            Resolver::start("user", registry.clone(), sink.clone(), ResolverConfig::default()).await;
        resolver.close();
        tokio::time::sleep(Duration::from_millis(20)).await;

        registry
            .register(&ServiceInstance::new("user", "10.0.0.1:80"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.states().len(), 1);
        assert!(resolver.is_closed());
    }

    /// Fails every other list call.
    struct FlakyRegistry {
        inner: InMemoryRegistry,
        lists: AtomicUsize,
    }

    #[async_trait]
    impl Registry for FlakyRegistry {
        async fn register(&self, instance: &ServiceInstance) -> imrpc_common::Result<()> {
            self.inner.register(instance).await
        }

        async fn unregister(&self, instance: &ServiceInstance) -> imrpc_common::Result<()> {
            self.inner.unregister(instance).await
        }

        async fn list_services(&self, service: &str) -> imrpc_common::Result<Vec<ServiceInstance>> {
            if self.lists.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                return Err(ImrpcError::Registry("backend unavailable".into()));
            }
            self.inner.list_services(service).await
        }

        async fn subscribe(&self, service: &str) -> imrpc_common::Result<mpsc::Receiver<RegistryEvent>> {
            self.inner.subscribe(service).await
        }

        async fn close(&self) -> imrpc_common::Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_registry_errors_are_reported_and_watch_continues() {
        let registry = Arc::new(FlakyRegistry {
            inner: InMemoryRegistry::new(),
            lists: AtomicUsize::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let _resolver =
            Resolver::start("user", registry.clone(), sink.clone(), ResolverConfig::default()).await;
        assert_eq!(sink.states().len(), 1);

        // Second list fails, third succeeds
        registry
            .register(&ServiceInstance::new("user", "10.0.0.1:80"))
            .await
            .unwrap();
        eventually(|| sink.errors().len() == 1).await;

        registry
            .register(&ServiceInstance::new("user", "10.0.0.2:80"))
            .await
            .unwrap();
        eventually(|| sink.states().len() == 2).await;
        assert_eq!(sink.states()[1].len(), 2);
        assert!(sink.errors()[0].contains("backend unavailable"));
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_reported() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.close().await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let _resolver =
            Resolver::start("user", registry, sink.clone(), ResolverConfig::default()).await;

        // Subscribe and initial list both fail on a closed registry
        assert_eq!(sink.errors().len(), 2);
        assert!(sink.states().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_now_pushes_current_state() {
        let registry = Arc::new(InMemoryRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let resolver =
            Resolver::start("user", registry.clone(), sink.clone(), ResolverConfig::default()).await;
        resolver.resolve_now().await;
        assert_eq!(sink.states().len(), 2);
        assert_eq!(resolver.service(), "user");
    }
}
