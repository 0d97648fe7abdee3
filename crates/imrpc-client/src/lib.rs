//! imrpc Client
//!
//! Issues calls to imrpc servers over pooled TCP connections, either to a
//! fixed address or through an [`imrpc_balancer::Balancer`].
//!
//! # Example
//!
//! ```rust,no_run
//! use imrpc_client::{CallOptions, Client};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> imrpc_client::Result<()> {
//! let client = Client::direct("127.0.0.1:8080");
//! let options = CallOptions::new().with_timeout(Duration::from_secs(1));
//! let sum: i64 = client.call("Math", "Add", &(2, 3), options).await?;
//! assert_eq!(sum, 5);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod pool;
mod stub;

pub use client::{BroadcastResult, Client, ClientConfig, Reply, Target};
pub use pool::{ConnectionPool, PoolConfig, PoolSet, PoolStats, PooledConnection};

pub use imrpc_common::{CallOptions, ImrpcError, Result};
