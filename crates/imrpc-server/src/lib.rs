//! imrpc Server
//!
//! Accepts imrpc connections and dispatches each request to a registered
//! method.
//!
//! - [`ServiceBuilder`] turns typed async closures into a [`Service`]
//! - [`Dispatcher`] resolves service and method names, decodes arguments,
//!   enforces the caller's deadline and encodes the result
//! - [`Server`] owns the listener, the per-connection loops, optional rate
//!   limiting and registry announcement
//!
//! One-way calls are answered at once with
//! [`ONEWAY_MESSAGE`](imrpc_common::ONEWAY_MESSAGE) while the method runs
//! detached. Business errors from one-way methods are never reported to the
//! caller.

pub mod dispatch;
pub mod server;
pub mod service;

pub use dispatch::Dispatcher;
pub use server::{Server, ServerConfig, ServerHandle};
pub use service::{CallContext, MethodError, Service, ServiceBuilder};
