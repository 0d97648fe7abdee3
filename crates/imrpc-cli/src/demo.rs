//! Demo service served by `imrpc serve`.
//!
//! Service `Echo` with methods:
//!
//! - `Echo`: returns its argument
//! - `Sleep`: sleeps for `millis` milliseconds, or until the call's deadline
//! - `Fail`: returns its argument as an error message
//! - `Count`: increments a counter and returns the new value
//! - `Stats`: returns the counter without changing it

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::info;

use imrpc_server::{CallContext, MethodError, Service, ServiceBuilder};

pub const SERVICE_NAME: &str = "Echo";

pub fn echo_service() -> Service {
    let counter = Arc::new(AtomicU64::new(0));
    let counted = counter.clone();

    ServiceBuilder::new(SERVICE_NAME)
        .method("Echo", |_ctx: CallContext, value: Value| async move {
            Ok::<_, MethodError<Value>>(value)
        })
        .method("Sleep", |ctx: CallContext, millis: u64| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(millis),
                _ = ctx.cancelled() => Err(MethodError::<u64>::new("sleep interrupted")),
            }
        })
        .method("Fail", |_ctx: CallContext, message: String| async move {
            Err(MethodError::<Value>::new(message))
        })
        .method("Count", move |ctx: CallContext, _: Value| {
            let counted = counted.clone();
            async move {
                let value = counted.fetch_add(1, Ordering::SeqCst) + 1;
                info!("count is now {} (one-way: {})", value, ctx.oneway);
                Ok::<_, MethodError<u64>>(value)
            }
        })
        .method("Stats", move |_ctx: CallContext, _: Value| {
            let counter = counter.clone();
            async move { Ok::<_, MethodError<u64>>(counter.load(Ordering::SeqCst)) }
        })
        .build()
}
