use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use imrpc_balancer::{Balancer, PickInfo, PickResult};
use imrpc_common::codec::{CodecRegistry, Compressor, Identity, Serialization, Serializer};
use imrpc_common::protocol::error::{ImrpcError, Result};
use imrpc_common::protocol::{Request, RequestId, Response, DEADLINE_MESSAGE, DEFAULT_MAX_FRAME_SIZE};
use imrpc_common::transport::{write_frame, FrameTransport};
use imrpc_common::CallOptions;

use crate::pool::{PoolConfig, PoolSet};

/// Longest a finished one-way call keeps its connection waiting for the
/// server's acknowledgement frame before discarding it.
const ONEWAY_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Client configuration.
///
/// # Example
///
/// ```rust
/// use imrpc_client::ClientConfig;
/// use imrpc_common::codec::{Gzip, Serialization};
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_serialization(Serialization::Postcard)
///     .with_compressor(Gzip::new())
///     .with_default_timeout(Duration::from_secs(2));
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    /// Serializer for outgoing payloads
    pub serialization: Arc<dyn Serializer>,
    /// Compressor for outgoing payloads
    pub compressor: Arc<dyn Compressor>,
    pub pool: PoolConfig,
    /// Deadline applied to calls that carry none
    pub default_timeout: Option<Duration>,
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            serialization: Arc::new(Serialization::Json),
            compressor: Arc::new(Identity),
            pool: PoolConfig::default(),
            default_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn with_serialization(mut self, serialization: impl Serializer) -> Self {
        self.serialization = Arc::new(serialization);
        self
    }

    pub fn with_compressor(mut self, compressor: impl Compressor) -> Self {
        self.compressor = Arc::new(compressor);
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("serialization", &self.serialization.name())
            .field("compressor", &self.compressor.name())
            .field("pool", &self.pool)
            .field("default_timeout", &self.default_timeout)
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

/// Where calls go.
#[derive(Clone)]
pub enum Target {
    /// A single fixed address
    Direct(String),
    /// Whatever the balancer picks per call
    Balanced(Arc<Balancer>),
}

/// Decoded outcome of a two-way call that reached the server.
///
/// A method may fail and still return a partial value, so both fields can be
/// set at once.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<T> {
    pub value: Option<T>,
    pub error: Option<String>,
}

impl<T> Reply<T> {
    /// `Ok(value)` on success, `Err(Remote)` if the method failed.
    pub fn into_result(self) -> Result<T> {
        match (self.error, self.value) {
            (Some(message), _) => Err(ImrpcError::from_remote(message)),
            (None, Some(value)) => Ok(value),
            (None, None) => Err(ImrpcError::Serialization(
                "response carried neither a value nor an error".to_string(),
            )),
        }
    }
}

/// One instance's answer to a broadcast.
#[derive(Debug)]
pub struct BroadcastResult<T> {
    pub address: String,
    pub result: Result<T>,
}

/// imrpc client.
///
/// Each call leases a pooled connection, writes one request frame and, for
/// two-way calls, reads one response frame. The network exchange runs on its
/// own task and the caller races it against the call's deadline and
/// cancellation token: a caller that gives up returns at once, while the task
/// finishes in the background and hands its connection back to the pool.
///
/// One-way calls return [`ImrpcError::Oneway`] as soon as the request is
/// written. Any error the remote method returns for them is never seen by the
/// caller.
///
/// # Example
///
/// ```rust,no_run
/// use imrpc_client::Client;
/// use imrpc_common::CallOptions;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> imrpc_common::Result<()> {
/// let client = Client::direct("127.0.0.1:8080");
/// let options = CallOptions::new().with_timeout(Duration::from_secs(1));
/// let greeting: String = client.call("Greeter", "Hello", &"world", options).await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    target: Target,
    config: ClientConfig,
    codecs: CodecRegistry,
    pools: PoolSet,
    transport: FrameTransport,
    next_id: AtomicU32,
}

impl Client {
    pub fn new(target: Target, config: ClientConfig) -> Self {
        let mut codecs = CodecRegistry::with_builtins();
        codecs.register_shared_serializer(config.serialization.clone());
        codecs.register_shared_compressor(config.compressor.clone());
        let transport = FrameTransport::new()
            .with_max_frame_size(config.max_frame_size)
            .with_connect_timeout(config.pool.connect_timeout);
        Self {
            target,
            pools: PoolSet::new(config.pool.clone()),
            codecs,
            config,
            transport,
            next_id: AtomicU32::new(1),
        }
    }

    /// A client for one address with the default configuration.
    pub fn direct(addr: impl Into<String>) -> Self {
        Self::new(Target::Direct(addr.into()), ClientConfig::default())
    }

    /// A client routing through `balancer` with the default configuration.
    pub fn balanced(balancer: Arc<Balancer>) -> Self {
        Self::new(Target::Balanced(balancer), ClientConfig::default())
    }

    /// Registers an additional compressor for decoding responses.
    pub fn with_compressor_plugin(mut self, compressor: impl Compressor) -> Self {
        self.codecs.register_compressor(compressor);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pools(&self) -> &PoolSet {
        &self.pools
    }

    /// Calls `service.method` and decodes the typed result.
    ///
    /// # Errors
    ///
    /// - `Remote` carrying the method's error message
    /// - `Oneway` when `options.oneway` is set, once the request is written
    /// - `Cancelled` / `DeadlineExceeded` if `options` fire first
    /// - transport, framing and codec errors otherwise
    pub async fn call<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        req: &Req,
        options: CallOptions,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.call_reply(service, method, req, options)
            .await?
            .into_result()
    }

    /// Like [`call`](Self::call), but keeps a partial value that arrives
    /// alongside a method error.
    pub async fn call_reply<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        req: &Req,
        options: CallOptions,
    ) -> Result<Reply<Resp>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let options = self.with_default_deadline(options);
        options.check()?;
        let request = self.prepare(service, method, req, &options)?;

        let pick = self.pick(service, method, &options)?;
        let outcome = self
            .exchange(&pick.address, request, &options)
            .await
            .and_then(expired_on_server);
        pick.finish(outcome.as_ref().err());

        self.into_reply(outcome?)
    }

    /// Calls `service.method` on every resolved instance at once.
    ///
    /// Only available with a balanced target. When `options.group` is set,
    /// only instances of that group are called. One-way broadcasts report
    /// `Err(Oneway)` per instance whose request was written.
    pub async fn broadcast<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        req: &Req,
        options: CallOptions,
    ) -> Result<Vec<BroadcastResult<Resp>>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let Target::Balanced(balancer) = &self.target else {
            return Err(ImrpcError::InvalidRequest(
                "broadcast needs a balanced target".to_string(),
            ));
        };

        let options = self.with_default_deadline(options);
        options.check()?;
        let template = self.prepare(service, method, req, &options)?;

        let instances = balancer.instances();
        let addresses: Vec<String> = instances
            .iter()
            .filter(|i| options.group.as_deref().map_or(true, |g| i.group == g))
            .map(|i| i.address.clone())
            .collect();
        if addresses.is_empty() {
            return Err(ImrpcError::NoCandidates);
        }
        debug!("broadcasting {}.{} to {} instance(s)", service, method, addresses.len());

        let calls = addresses.into_iter().map(|address| {
            let mut request = template.clone();
            request.request_id = self.next_request_id();
            let options = &options;
            async move {
                let outcome = self
                    .exchange(&address, request, options)
                    .await
                    .and_then(expired_on_server);
                let result = match outcome {
                    Ok(response) => self
                        .into_reply(response)
                        .and_then(Reply::into_result),
                    Err(e) => Err(e),
                };
                BroadcastResult { address, result }
            }
        });
        Ok(join_all(calls).await)
    }

    fn next_request_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn with_default_deadline(&self, options: CallOptions) -> CallOptions {
        match (options.deadline, self.config.default_timeout) {
            (None, Some(timeout)) => options.with_timeout(timeout),
            _ => options,
        }
    }

    fn prepare<Req>(
        &self,
        service: &str,
        method: &str,
        req: &Req,
        options: &CallOptions,
    ) -> Result<Request>
    where
        Req: Serialize + ?Sized,
    {
        let encoded = self.config.serialization.encode(req)?;
        let data = self.config.compressor.compress(&encoded)?;

        let mut request = Request::new(service, method).with_data(data);
        request.request_id = self.next_request_id();
        request.serializer = self.config.serialization.code();
        request.compressor = self.config.compressor.code();
        if let Some(deadline) = options.wall_deadline() {
            request.set_deadline(deadline);
        }
        if options.oneway {
            request.set_oneway();
        }
        request.calculate_header_length();
        request.calculate_body_length();
        Ok(request)
    }

    fn pick(&self, service: &str, method: &str, options: &CallOptions) -> Result<PickResult> {
        match &self.target {
            Target::Direct(addr) => Ok(PickResult::new(addr.clone())),
            Target::Balanced(balancer) => balancer.pick(&PickInfo {
                service,
                method,
                group: options.group.as_deref(),
            }),
        }
    }

    /// Runs one request/response exchange against `addr`.
    ///
    /// Returns `Ok(None)` for a one-way request once it has been written.
    async fn exchange(
        &self,
        addr: &str,
        request: Request,
        options: &CallOptions,
    ) -> Result<Option<Response>> {
        let pool = self.pools.get(addr);
        let transport = self.transport;
        let task_options = options.clone();
        let oneway = request.is_oneway();
        let request_id = request.request_id;
        let frame = request.encode()?;
        let (written_tx, written_rx) = oneshot::channel::<()>();

        let mut task = tokio::spawn(async move {
            let mut conn = pool.acquire(&task_options).await?;
            write_frame(&mut conn, &frame).await?;

            if oneway {
                let _ = written_tx.send(());
                // The server acknowledges one-way frames; drain that before reuse
                match tokio::time::timeout(ONEWAY_ACK_TIMEOUT, transport.read_frame(&mut conn)).await {
                    Ok(Ok(Some(_))) => conn.release(),
                    _ => debug!(addr = %conn.addr(), "no one-way acknowledgement, discarding connection"),
                }
                return Ok(None);
            }

            let frame = transport.read_frame(&mut conn).await?.ok_or_else(|| {
                ImrpcError::Connection("connection closed before response".to_string())
            })?;
            let response = Response::decode(&frame)?;
            if response.request_id != request_id {
                return Err(ImrpcError::Framing(format!(
                    "response id {} does not match request id {}",
                    response.request_id, request_id
                )));
            }
            conn.release();
            Ok(Some(response))
        });

        if oneway {
            return tokio::select! {
                written = written_rx => match written {
                    Ok(()) => Ok(None),
                    // The task failed before writing; collect its error
                    Err(_) => join_result(task.await),
                },
                err = options.done() => Err(err),
            };
        }

        tokio::select! {
            joined = &mut task => join_result(joined),
            err = options.done() => {
                debug!(addr, request_id, "caller gave up, leaving exchange to finish in background");
                Err(err)
            }
        }
    }

    fn into_reply<Resp: DeserializeOwned>(&self, response: Option<Response>) -> Result<Reply<Resp>> {
        let Some(response) = response else {
            return Err(ImrpcError::Oneway);
        };

        let error = response.error_message();
        // Some formats encode unit values as zero bytes, so an empty payload
        // only means "no value" alongside an error
        let value = if response.data.is_empty() && error.is_some() {
            None
        } else {
            let serialization = self.codecs.serializer(response.serializer)?;
            let data = if response.data.is_empty() {
                Vec::new()
            } else {
                self.codecs
                    .compressor(response.compressor)?
                    .decompress(&response.data)?
            };
            match serialization.decode(&data) {
                Ok(value) => Some(value),
                // A failed method's partial value is best-effort
                Err(e) if error.is_some() => {
                    warn!("dropping undecodable partial value: {}", e);
                    None
                }
                Err(e) => return Err(e),
            }
        };
        Ok(Reply { value, error })
    }
}

/// Turns a server-side deadline expiry into [`ImrpcError::DeadlineExceeded`].
///
/// The server's timer and the caller's race for the same instant, so either
/// may report the expiry; both must look the same to the caller and to the
/// picker.
fn expired_on_server(response: Option<Response>) -> Result<Option<Response>> {
    match response {
        Some(response) if response.error == DEADLINE_MESSAGE.as_bytes() => {
            Err(ImrpcError::DeadlineExceeded)
        }
        other => Ok(other),
    }
}

fn join_result(
    joined: std::result::Result<Result<Option<Response>>, tokio::task::JoinError>,
) -> Result<Option<Response>> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(ImrpcError::Connection(format!("call task failed: {}", e))),
    }
}
