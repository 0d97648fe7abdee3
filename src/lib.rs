//! # imrpc
//!
//! A lightweight RPC runtime: a binary wire protocol, a pooled TCP client, a
//! server that dispatches requests onto registered methods, pluggable
//! serialization and compression, and registry-backed client-side load
//! balancing.
//!
//! This crate re-exports the workspace members:
//!
//! - [`common`]: frames, errors, codecs, call options, transport
//! - [`client`]: connection pool, typed calls, service stubs
//! - [`server`]: service registration and dispatch
//! - [`balancer`]: registry contract, resolver and pickers
//!
//! # Example
//!
//! ```no_run
//! use imrpc::client::{CallOptions, Client};
//! use imrpc::server::{CallContext, MethodError, Server, ServerConfig, ServiceBuilder};
//! use std::time::Duration;
//!
//! # async fn demo() -> imrpc::common::Result<()> {
//! let math = ServiceBuilder::new("Math")
//!     .method("Add", |_ctx: CallContext, (a, b): (i64, i64)| async move {
//!         Ok::<_, MethodError<i64>>(a + b)
//!     })
//!     .build();
//! let server = Server::new(ServerConfig::default())
//!     .with_service(math)
//!     .start("127.0.0.1:0")
//!     .await?;
//!
//! let client = Client::direct(server.local_addr().to_string());
//! let options = CallOptions::new().with_timeout(Duration::from_secs(1));
//! let sum: i64 = client.call("Math", "Add", &(2, 3), options).await?;
//! assert_eq!(sum, 5);
//!
//! server.stop().await
//! # }
//! ```

pub use imrpc_balancer as balancer;
pub use imrpc_client as client;
pub use imrpc_common as common;
pub use imrpc_server as server;

pub use imrpc_client::service;
pub use imrpc_common::{CallOptions, ImrpcError, Result};
