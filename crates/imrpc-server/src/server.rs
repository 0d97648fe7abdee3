//! TCP server for imrpc.
//!
//! The server accepts connections in a loop and spawns a task for each one.
//! A connection carries any number of sequential calls: read one frame,
//! dispatch it, write the response, repeat. Framing errors close the
//! connection; everything else is answered with an error response and the
//! connection stays open.
//!
//! # Example
//!
//! ```no_run
//! use imrpc_server::{CallContext, MethodError, Server, ServerConfig, ServiceBuilder};
//!
//! #[tokio::main]
//! async fn main() -> imrpc_common::Result<()> {
//!     let greeter = ServiceBuilder::new("Greeter")
//!         .method("Hello", |_ctx: CallContext, name: String| async move {
//!             Ok::<_, MethodError<String>>(format!("hello, {}", name))
//!         })
//!         .build();
//!
//!     Server::new(ServerConfig::default())
//!         .with_service(greeter)
//!         .run("127.0.0.1:8080")
//!         .await
//! }
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use imrpc_balancer::{Registry, ServiceInstance};
use imrpc_common::protocol::error::{ImrpcError, Result};
use imrpc_common::rate_limit::{RateDecision, RateLimitConfig, RateLimiter, RATE_LIMITED_MESSAGE};
use imrpc_common::transport::{write_frame, FrameTransport};
use imrpc_common::{CodecRegistry, Request, Response, DEFAULT_MAX_FRAME_SIZE};

use crate::dispatch::Dispatcher;
use crate::service::Service;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub max_frame_size: usize,
    /// Serializers and compressors this server accepts
    pub codecs: CodecRegistry,
    /// Registry to announce every service in, if any
    pub registry: Option<Arc<dyn Registry>>,
    /// Upper bound on each register/unregister call
    pub registry_timeout: Duration,
    /// Address announced to the registry; defaults to the bound address
    pub advertise_addr: Option<String>,
    pub weight: u32,
    pub group: String,
    pub rate_limit: Option<RateLimitConfig>,
    /// How long shutdown waits for open connections and one-way calls
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            codecs: CodecRegistry::with_builtins(),
            registry: None,
            registry_timeout: Duration::from_secs(3),
            advertise_addr: None,
            weight: 1,
            group: String::new(),
            rate_limit: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_registry_timeout(mut self, timeout: Duration) -> Self {
        self.registry_timeout = timeout;
        self
    }

    pub fn with_advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.advertise_addr = Some(addr.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("max_frame_size", &self.max_frame_size)
            .field("codecs", &self.codecs)
            .field("registry", &self.registry.is_some())
            .field("registry_timeout", &self.registry_timeout)
            .field("advertise_addr", &self.advertise_addr)
            .field("weight", &self.weight)
            .field("group", &self.group)
            .field("rate_limit", &self.rate_limit)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

/// imrpc server.
pub struct Server {
    config: ServerConfig,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(config.codecs.clone()),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.register(service);
        self
    }

    pub fn register(&mut self, service: Service) {
        self.dispatcher.register(service);
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Cancelling this token stops the server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds `addr` and serves until shut down.
    pub async fn run(self, addr: &str) -> Result<()> {
        let listener = bind(addr).await?;
        self.serve(listener).await
    }

    /// Binds `addr` and serves on a background task.
    pub async fn start(self, addr: &str) -> Result<ServerHandle> {
        let listener = bind(addr).await?;
        let local_addr = local_addr(&listener)?;
        let shutdown = self.shutdown.clone();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(self.serve_with_ready(listener, Some(ready_tx)));

        // Surface registration failures to the caller
        match ready_rx.await {
            Ok(()) => Ok(ServerHandle {
                local_addr,
                shutdown,
                task,
            }),
            Err(_) => match task.await {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => Err(ImrpcError::Connection("server stopped during startup".into())),
                Err(e) => Err(ImrpcError::Connection(format!("server task failed: {}", e))),
            },
        }
    }

    /// Serves connections from `listener` until the shutdown token fires.
    ///
    /// With a registry configured, every service is registered before the
    /// first connection is accepted and unregistered before open connections
    /// are drained.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.serve_with_ready(listener, None).await
    }

    async fn serve_with_ready(
        self,
        listener: TcpListener,
        ready: Option<tokio::sync::oneshot::Sender<()>>,
    ) -> Result<()> {
        let Server {
            config,
            dispatcher,
            shutdown,
        } = self;
        let local_addr = local_addr(&listener)?;
        let dispatcher = Arc::new(dispatcher.with_shutdown(shutdown.clone()));
        let transport = FrameTransport::new().with_max_frame_size(config.max_frame_size);
        let limiter = config.rate_limit.clone().map(|c| Arc::new(RateLimiter::new(c)));

        let instances = announce(&config, &dispatcher, local_addr).await?;
        info!(
            "imrpc server listening on {} with services {:?}",
            local_addr,
            dispatcher.services()
        );
        if let Some(ready) = ready {
            let _ = ready.send(());
        }

        let connections = TaskTracker::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        debug!("connection established from {}", peer);
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            dispatcher.clone(),
                            transport,
                            limiter.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        info!("imrpc server on {} shutting down", local_addr);
        drop(listener);
        withdraw(&config, &instances).await;

        connections.close();
        dispatcher.detached().close();
        let drained = tokio::time::timeout(config.shutdown_timeout, async {
            connections.wait().await;
            dispatcher.detached().wait().await;
        })
        .await;
        if drained.is_err() {
            warn!(
                "gave up waiting for open calls after {}ms",
                config.shutdown_timeout.as_millis()
            );
        }
        Ok(())
    }
}

/// Handle to a server started with [`Server::start`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signals shutdown and waits for the server to finish.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.wait().await
    }

    /// Waits for the server to finish without signalling it.
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ImrpcError::Connection(format!("server task failed: {}", e))),
        }
    }
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ImrpcError::Connection(format!("failed to bind to {}: {}", addr, e)))
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr> {
    listener
        .local_addr()
        .map_err(|e| ImrpcError::Connection(format!("failed to get local addr: {}", e)))
}

/// Registers one instance per service. On failure, rolls back what was
/// already registered.
async fn announce(
    config: &ServerConfig,
    dispatcher: &Dispatcher,
    local_addr: SocketAddr,
) -> Result<Vec<ServiceInstance>> {
    let Some(registry) = &config.registry else {
        return Ok(Vec::new());
    };
    let address = config
        .advertise_addr
        .clone()
        .unwrap_or_else(|| local_addr.to_string());

    let mut registered = Vec::new();
    for name in dispatcher.services() {
        let instance = ServiceInstance::new(name, address.clone())
            .with_weight(config.weight)
            .with_group(config.group.clone());
        let outcome = tokio::time::timeout(config.registry_timeout, registry.register(&instance))
            .await
            .unwrap_or_else(|_| {
                Err(ImrpcError::Registry(format!(
                    "registering {} timed out",
                    instance.name
                )))
            });
        if let Err(e) = outcome {
            error!("failed to register {} at {}: {}", name, address, e);
            withdraw(config, &registered).await;
            return Err(e);
        }
        info!("registered {} at {}", name, address);
        registered.push(instance);
    }
    Ok(registered)
}

async fn withdraw(config: &ServerConfig, instances: &[ServiceInstance]) {
    let Some(registry) = &config.registry else {
        return;
    };
    for instance in instances {
        match tokio::time::timeout(config.registry_timeout, registry.unregister(instance)).await {
            Ok(Ok(())) => info!("unregistered {} at {}", instance.name, instance.address),
            Ok(Err(e)) => warn!("failed to unregister {}: {}", instance.name, e),
            Err(_) => warn!("unregistering {} timed out", instance.name),
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    transport: FrameTransport,
    limiter: Option<Arc<RateLimiter>>,
    shutdown: CancellationToken,
) {
    match handle_connection(stream, peer, &dispatcher, transport, limiter.as_deref(), &shutdown).await {
        Ok(()) => debug!("connection from {} closed", peer),
        Err(e) if e.is_framing() => warn!("closing connection from {}: {}", peer, e),
        Err(e) => debug!("connection from {} ended: {}", peer, e),
    }
}

/// Serves sequential calls on one connection.
///
/// Returns `Ok` on clean EOF or shutdown, and the error that ended the
/// connection otherwise.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: &Dispatcher,
    transport: FrameTransport,
    limiter: Option<&RateLimiter>,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = transport.read_frame(&mut stream) => frame?,
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        let request = Request::decode(&frame)?;
        debug!(
            id = request.request_id,
            "{} called {}.{}",
            peer,
            request.service_name,
            request.method_name
        );

        let decision = limiter.map(|l| l.check(peer.ip()));
        let response = match decision {
            Some(RateDecision::Limited { retry_after }) => {
                debug!(
                    "rate limited {} (retry after {}ms)",
                    peer,
                    retry_after.as_millis()
                );
                Response::for_request(&request)
                    .with_error(RATE_LIMITED_MESSAGE)
                    .finalize()
            }
            _ => dispatcher.dispatch(request, Some(peer)).await,
        };

        write_frame(&mut stream, &response.encode()?).await?;
    }
}
