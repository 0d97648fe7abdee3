use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use imrpc_common::{CodecRegistry, ImrpcError, Request, Response, DEADLINE_MESSAGE, ONEWAY_MESSAGE};

use crate::service::{CallContext, Handler, MethodOutcome, Service};

/// Routes decoded requests to registered services.
///
/// Every failure along the way becomes an error response; `dispatch` itself
/// never fails, so the connection stays usable.
pub struct Dispatcher {
    services: HashMap<String, Service>,
    codecs: CodecRegistry,
    /// Parent of every call token; fires on server shutdown
    shutdown: CancellationToken,
    detached: TaskTracker,
}

impl Dispatcher {
    pub fn new(codecs: CodecRegistry) -> Self {
        Self {
            services: HashMap::new(),
            codecs,
            shutdown: CancellationToken::new(),
            detached: TaskTracker::new(),
        }
    }

    pub(crate) fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Adds a service, replacing any previous one with the same name.
    pub fn register(&mut self, service: Service) {
        debug!("registered service {} ({:?})", service.name(), service.methods());
        self.services.insert(service.name().to_string(), service);
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Tracker holding detached one-way invocations.
    pub(crate) fn detached(&self) -> &TaskTracker {
        &self.detached
    }

    /// Handles one request and builds its response.
    ///
    /// One-way requests are answered immediately with [`ONEWAY_MESSAGE`]
    /// while the method runs detached; its result is discarded.
    pub async fn dispatch(&self, request: Request, peer: Option<SocketAddr>) -> Response {
        let reply = Response::for_request(&request);
        let response = match self.prepare(&request) {
            Ok(handler) => {
                match self.run(handler, request, peer).await {
                    Ok(response) => response,
                    Err(e) => reply.with_error(e.to_string()),
                }
            }
            Err(e) => {
                debug!(
                    service = %request.service_name,
                    method = %request.method_name,
                    "rejecting request: {}",
                    e
                );
                reply.with_error(e.to_string())
            }
        };
        response.finalize()
    }

    fn prepare(&self, request: &Request) -> Result<Handler, ImrpcError> {
        let service = self
            .services
            .get(&request.service_name)
            .ok_or_else(|| ImrpcError::ServiceNotFound(request.service_name.clone()))?;
        let handler = service.handler(&request.method_name).ok_or_else(|| {
            ImrpcError::MethodNotFound(format!(
                "{}.{}",
                request.service_name, request.method_name
            ))
        })?;
        Ok(handler.clone())
    }

    async fn run(
        &self,
        handler: Handler,
        request: Request,
        peer: Option<SocketAddr>,
    ) -> Result<Response, ImrpcError> {
        let serialization = self.codecs.serializer(request.serializer)?;
        let compressor = self.codecs.compressor(request.compressor)?;
        let payload = if request.data.is_empty() {
            Vec::new()
        } else {
            compressor.decompress(&request.data)?
        };

        let deadline = request.deadline();
        let expires_at = deadline.map(instant_for);
        if expires_at.is_some_and(|at| at <= Instant::now()) {
            return Err(ImrpcError::DeadlineExceeded);
        }

        let token = self.shutdown.child_token();
        let oneway = request.is_oneway();
        let context = CallContext::new(&request.service_name, &request.method_name, token.clone())
            .with_peer(peer)
            .with_deadline(deadline)
            .with_oneway(oneway);
        let invocation = invoke(handler(context, serialization, payload), expires_at, token);

        let reply = Response::for_request(&request);
        if oneway {
            let service = request.service_name;
            let method = request.method_name;
            self.detached.spawn(async move {
                let outcome = invocation.await;
                if let Some(error) = outcome.error {
                    debug!("one-way call {}.{} failed: {}", service, method, error);
                }
            });
            return Ok(reply.with_error(ONEWAY_MESSAGE));
        }

        let outcome = invocation.await;
        let data = match outcome.data {
            Some(data) => compressor.compress(&data)?,
            None => Vec::new(),
        };
        let mut response = reply.with_data(data);
        if let Some(error) = outcome.error {
            response = response.with_error(error);
        }
        Ok(response)
    }
}

/// Runs a handler future, bounded by the caller's deadline.
///
/// When the deadline passes first the call's token is cancelled so the
/// handler can observe it, and the outcome carries [`DEADLINE_MESSAGE`].
async fn invoke(
    call: futures::future::BoxFuture<'static, MethodOutcome>,
    expires_at: Option<Instant>,
    token: CancellationToken,
) -> MethodOutcome {
    let Some(expires_at) = expires_at else {
        return call.await;
    };
    tokio::select! {
        outcome = call => outcome,
        _ = tokio::time::sleep_until(expires_at) => {
            token.cancel();
            warn!("handler exceeded the caller's deadline");
            MethodOutcome::failed(DEADLINE_MESSAGE)
        }
    }
}

/// Converts a wall-clock deadline into a monotonic instant.
fn instant_for(deadline: SystemTime) -> Instant {
    let left = deadline
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO);
    Instant::now() + left
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{MethodError, ServiceBuilder};
    use imrpc_common::codec::{Compressor, Gzip, Serialization};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn request(service: &str, method: &str, data: &[u8]) -> Request {
        let mut request = Request::new(service, method).with_data(data.to_vec());
        request.request_id = 9;
        request.serializer = Serialization::Json.code();
        request
    }

    fn dispatcher(counter: Arc<AtomicUsize>) -> Dispatcher {
        let service = ServiceBuilder::new("Math")
            .method("Add", |_ctx: CallContext, (a, b): (i64, i64)| async move {
                Ok::<_, MethodError<i64>>(a + b)
            })
            .method("Sleep", |ctx: CallContext, millis: u64| async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(millis),
                    _ = ctx.cancelled() => Err(MethodError::<u64>::new("cancelled")),
                }
            })
            .method("Count", move |_ctx: CallContext, _: ()| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(MethodError::<()>::new("counted"))
                }
            })
            .build();

        let mut dispatcher = Dispatcher::new(CodecRegistry::with_builtins());
        dispatcher.register(service);
        dispatcher
    }

    #[tokio::test]
    async fn test_two_way_call() {
        let dispatcher = dispatcher(Arc::default());
        let response = dispatcher.dispatch(request("Math", "Add", b"[20,22]"), None).await;
        assert_eq!(response.request_id, 9);
        assert_eq!(response.error_message(), None);
        assert_eq!(response.data, b"42");
        assert_eq!(response.serializer, Serialization::Json.code());
    }

    #[tokio::test]
    async fn test_unknown_service_and_method() {
        let dispatcher = dispatcher(Arc::default());
        let response = dispatcher.dispatch(request("Nope", "Add", b"[]"), None).await;
        assert!(response.error_message().unwrap().contains("Service not found: Nope"));

        let response = dispatcher.dispatch(request("Math", "Mul", b"[]"), None).await;
        assert!(response.error_message().unwrap().contains("Method not found: Math.Mul"));
        assert!(response.data.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_codes() {
        let dispatcher = dispatcher(Arc::default());
        let mut bad_serializer = request("Math", "Add", b"[1,2]");
        bad_serializer.serializer = 42;
        let response = dispatcher.dispatch(bad_serializer, None).await;
        assert!(response.error_message().unwrap().contains("Unsupported protocol option"));

        let mut bad_compressor = request("Math", "Add", b"[1,2]");
        bad_compressor.compressor = 42;
        let response = dispatcher.dispatch(bad_compressor, None).await;
        assert!(response.error_message().unwrap().contains("Unsupported protocol option"));
    }

    #[tokio::test]
    async fn test_compressed_round_trip() {
        let dispatcher = dispatcher(Arc::default());
        let gzip = Gzip::new();
        let mut compressed = request("Math", "Add", &gzip.compress(b"[1,2]").unwrap());
        compressed.compressor = gzip.code();

        let response = dispatcher.dispatch(compressed, None).await;
        assert_eq!(response.compressor, gzip.code());
        assert_eq!(gzip.decompress(&response.data).unwrap(), b"3");
    }

    #[tokio::test]
    async fn test_unit_result_is_compressed() {
        let service = ServiceBuilder::new("Unit")
            .method("Touch", |_ctx: CallContext, _: ()| async move {
                Ok::<(), MethodError<()>>(())
            })
            .build();
        let mut dispatcher = Dispatcher::new(CodecRegistry::with_builtins());
        dispatcher.register(service);

        let gzip = Gzip::new();
        let mut touch = request("Unit", "Touch", &gzip.compress(&[]).unwrap());
        touch.serializer = Serialization::Postcard.code();
        touch.compressor = gzip.code();

        let response = dispatcher.dispatch(touch, None).await;
        assert_eq!(response.error_message(), None);
        assert!(!response.data.is_empty());
        let data = gzip.decompress(&response.data).unwrap();
        Serialization::Postcard.decode::<()>(&data).unwrap();
    }

    #[tokio::test]
    async fn test_deadline_cancels_handler() {
        let dispatcher = dispatcher(Arc::default());
        let mut slow = request("Math", "Sleep", b"5000");
        slow.set_deadline(SystemTime::now() + Duration::from_millis(50));

        let started = std::time::Instant::now();
        let response = dispatcher.dispatch(slow, None).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(response.error_message().as_deref(), Some(DEADLINE_MESSAGE));
    }

    #[tokio::test]
    async fn test_expired_deadline_skips_handler() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher(counter.clone());
        let mut late = request("Math", "Count", b"null");
        late.set_deadline(SystemTime::now() - Duration::from_secs(1));

        let response = dispatcher.dispatch(late, None).await;
        assert_eq!(response.error_message().as_deref(), Some(DEADLINE_MESSAGE));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oneway_runs_detached() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher(counter.clone());
        let mut oneway = request("Math", "Count", b"null");
        oneway.set_oneway();

        let response = dispatcher.dispatch(oneway, None).await;
        assert_eq!(response.error_message().as_deref(), Some(ONEWAY_MESSAGE));
        assert!(response.data.is_empty());

        dispatcher.detached().close();
        dispatcher.detached().wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_business_error_has_empty_payload() {
        let dispatcher = dispatcher(Arc::default());
        let response = dispatcher.dispatch(request("Math", "Count", b"null"), None).await;
        assert_eq!(response.error_message().as_deref(), Some("counted"));
        assert!(response.data.is_empty());
    }

    #[test]
    fn test_services_listing() {
        let dispatcher = dispatcher(Arc::default());
        assert_eq!(dispatcher.services(), vec!["Math"]);
    }
}
