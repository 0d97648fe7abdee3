//! imrpc Balancer - registry-backed client-side load balancing
//!
//! The pieces, leaf first:
//!
//! - [`Registry`]: the service registry contract, plus [`InMemoryRegistry`]
//! - [`Resolver`]: lists a service, then re-lists on every registry event and
//!   pushes the full instance set to an [`AddressSink`]
//! - [`Picker`] / [`PickerBuilder`]: choose one instance per call;
//!   [`RoundRobinBuilder`] and [`WeightedBuilder`] ship here, both accepting a
//!   [`Filter`] such as [`group_filter`]
//! - [`Balancer`]: an [`AddressSink`] that rebuilds its picker on each update
//!
//! # Example
//!
//! ```no_run
//! use imrpc_balancer::{
//!     group_filter, Balancer, InMemoryRegistry, PickInfo, Registry, ResolverConfig,
//!     ServiceInstance, WeightedBuilder,
//! };
//! use std::sync::Arc;
//!
//! # async fn demo() -> imrpc_common::Result<()> {
//! let registry = Arc::new(InMemoryRegistry::new());
//! registry
//!     .register(&ServiceInstance::new("user", "127.0.0.1:8081").with_weight(3))
//!     .await?;
//!
//! let builder = Arc::new(WeightedBuilder::new().with_filter(group_filter()));
//! let (balancer, _resolver) =
//!     Balancer::from_registry("user", registry, builder, ResolverConfig::default()).await;
//!
//! let picked = balancer.pick(&PickInfo { service: "user", method: "GetById", group: None })?;
//! println!("routing to {}", picked.address);
//! picked.finish(None);
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod memory;
pub mod picker;
pub mod registry;
pub mod resolver;
pub mod round_robin;
pub mod weighted;

pub use balancer::Balancer;
pub use memory::InMemoryRegistry;
pub use picker::{group_filter, DoneCallback, DoneInfo, Filter, PickInfo, PickResult, Picker, PickerBuilder};
pub use registry::{Registry, RegistryEvent, ServiceInstance};
pub use resolver::{AddressSink, Resolver, ResolverConfig};
pub use round_robin::{RoundRobinBuilder, RoundRobinPicker};
pub use weighted::{WeightedBuilder, WeightedPicker};
