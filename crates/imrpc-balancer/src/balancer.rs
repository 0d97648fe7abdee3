use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use imrpc_common::{ImrpcError, Result};

use crate::picker::{PickInfo, PickResult, Picker, PickerBuilder};
use crate::registry::{Registry, ServiceInstance};
use crate::resolver::{AddressSink, Resolver, ResolverConfig};

struct Snapshot {
    instances: Arc<Vec<ServiceInstance>>,
    picker: Option<Arc<dyn Picker>>,
}

/// Holds the picker for one service and swaps it on every resolver update.
///
/// Picks made before the first update fail with
/// [`ImrpcError::NoCandidates`].
pub struct Balancer {
    service: String,
    builder: Arc<dyn PickerBuilder>,
    current: RwLock<Snapshot>,
    last_error: RwLock<Option<String>>,
}

impl Balancer {
    pub fn new(service: impl Into<String>, builder: Arc<dyn PickerBuilder>) -> Self {
        Self {
            service: service.into(),
            builder,
            current: RwLock::new(Snapshot {
                instances: Arc::new(Vec::new()),
                picker: None,
            }),
            last_error: RwLock::new(None),
        }
    }

    /// Creates a balancer for `service` and a resolver feeding it from `registry`.
    ///
    /// Dropping or closing the returned [`Resolver`] freezes the balancer at
    /// its last state.
    pub async fn from_registry(
        service: impl Into<String>,
        registry: Arc<dyn Registry>,
        builder: Arc<dyn PickerBuilder>,
        config: ResolverConfig,
    ) -> (Arc<Self>, Resolver) {
        let service = service.into();
        let balancer = Arc::new(Self::new(service.clone(), builder));
        let resolver = Resolver::start(service, registry, balancer.clone(), config).await;
        (balancer, resolver)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn pick(&self, info: &PickInfo<'_>) -> Result<PickResult> {
        let picker = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .picker
            .clone();
        match picker {
            Some(picker) => picker.pick(info),
            None => Err(ImrpcError::NoCandidates),
        }
    }

    /// The instance set the current picker was built from.
    pub fn instances(&self) -> Arc<Vec<ServiceInstance>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .instances
            .clone()
    }

    /// Most recent error reported by the resolver, cleared by the next update.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AddressSink for Balancer {
    fn update_state(&self, instances: Vec<ServiceInstance>) {
        let picker = self.builder.build(&instances);
        debug!(
            "{} picker for {} rebuilt over {} instance(s)",
            self.builder.name(),
            self.service,
            instances.len()
        );

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Snapshot {
            instances: Arc::new(instances),
            picker: Some(picker),
        };
        *self.last_error.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn report_error(&self, error: ImrpcError) {
        warn!("resolver error for {}: {}", self.service, error);
        *self.last_error.write().unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }
}
