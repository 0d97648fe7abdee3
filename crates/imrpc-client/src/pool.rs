use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use imrpc_common::protocol::error::{ImrpcError, Result};
use imrpc_common::transport::FrameTransport;
use imrpc_common::CallOptions;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Connection pool configuration.
///
/// # Default Configuration
///
/// - `max_idle`: 10
/// - `max_connections`: 30
/// - `idle_timeout`: 60 seconds
/// - `connect_timeout`: 5 seconds
/// - `acquire_timeout`: 30 seconds
///
/// # Example
///
/// ```rust
/// use imrpc_client::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::default()
///     .with_max_connections(4)
///     .with_idle_timeout(Duration::from_secs(10));
/// assert_eq!(config.max_connections, 4);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept per address
    pub max_idle: usize,
    /// Live connections (leased plus idle) allowed per address
    pub max_connections: usize,
    /// Idle connections older than this are closed instead of reused
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Longest wait for a connection when the pool is at capacity
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 10,
            max_connections: 30,
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub waiters: usize,
}

struct IdleConn {
    stream: TcpStream,
    last_active: Instant,
}

/// What a queued waiter receives.
enum Handoff {
    /// A released connection, ready to use.
    Conn(TcpStream),
    /// A freed live slot, already counted for the waiter, which dials.
    Slot,
}

struct PoolState {
    idle: VecDeque<IdleConn>,
    waiters: VecDeque<oneshot::Sender<Handoff>>,
    live: usize,
}

/// Connection pool for a single address.
///
/// The idle buffer, the waiter queue and the live counter sit behind one
/// mutex. [`acquire`](Self::acquire) prefers an idle connection, dials when
/// under `max_connections`, and otherwise queues until a connection is
/// released, a slot frees up, or the call is cancelled.
///
/// # Example
///
/// ```rust,no_run
/// use imrpc_client::{ConnectionPool, PoolConfig};
/// use imrpc_common::CallOptions;
///
/// # #[tokio::main]
/// # async fn main() -> imrpc_common::Result<()> {
/// let pool = ConnectionPool::new("127.0.0.1:8080", PoolConfig::default());
///
/// let conn = pool.acquire(&CallOptions::default()).await?;
/// // Use the connection...
/// conn.release();
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool {
    addr: String,
    config: PoolConfig,
    transport: FrameTransport,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(addr: impl Into<String>, config: PoolConfig) -> Arc<Self> {
        let transport = FrameTransport::new().with_connect_timeout(config.connect_timeout);
        Arc::new(Self {
            addr: addr.into(),
            config,
            transport,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                live: 0,
            }),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        let mut state = self.lock();
        state.waiters.retain(|waiter| !waiter.is_closed());
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
            waiters: state.waiters.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leases a connection.
    ///
    /// # Errors
    ///
    /// - `Connection` if dialing fails
    /// - `PoolTimeout` if the pool stays at capacity past `acquire_timeout`
    /// - `Cancelled` / `DeadlineExceeded` if `options` fire while waiting
    pub async fn acquire(self: &Arc<Self>, options: &CallOptions) -> Result<PooledConnection> {
        options.check()?;
        let give_up = tokio::time::Instant::now() + self.config.acquire_timeout;

        loop {
            let rx = {
                let mut state = self.lock();

                while let Some(idle) = state.idle.pop_front() {
                    if idle.last_active.elapsed() > self.config.idle_timeout {
                        debug!(addr = %self.addr, "closing expired idle connection");
                        state.live -= 1;
                        continue;
                    }
                    return Ok(self.lease(idle.stream));
                }

                if state.live < self.config.max_connections {
                    state.live += 1;
                    None
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Some(rx)
                }
            };

            let Some(mut rx) = rx else {
                return self.dial(options).await;
            };

            tokio::select! {
                handoff = &mut rx => match handoff {
                    Ok(Handoff::Conn(stream)) => return Ok(self.lease(stream)),
                    Ok(Handoff::Slot) => return self.dial(options).await,
                    Err(_) => continue,
                },
                err = options.done() => {
                    self.abandon(rx);
                    return Err(err);
                }
                _ = tokio::time::sleep_until(give_up) => {
                    self.abandon(rx);
                    warn!(addr = %self.addr, "connection pool exhausted");
                    return Err(ImrpcError::PoolTimeout(self.config.acquire_timeout.as_millis() as u64));
                }
            }
        }
    }

    async fn dial(self: &Arc<Self>, options: &CallOptions) -> Result<PooledConnection> {
        let dialed = tokio::select! {
            dialed = self.transport.connect(&self.addr) => dialed,
            err = options.done() => Err(err),
        };
        match dialed {
            Ok(stream) => {
                debug!(addr = %self.addr, "dialed new connection");
                Ok(self.lease(stream))
            }
            Err(e) => {
                self.free_slot();
                Err(e)
            }
        }
    }

    /// Stops waiting; anything already handed to this waiter goes back.
    fn abandon(&self, mut rx: oneshot::Receiver<Handoff>) {
        rx.close();
        match rx.try_recv() {
            Ok(Handoff::Conn(stream)) => self.put(stream),
            Ok(Handoff::Slot) => self.free_slot(),
            Err(_) => {}
        }
    }

    fn lease(self: &Arc<Self>, stream: TcpStream) -> PooledConnection {
        PooledConnection {
            stream: Some(stream),
            pool: Arc::clone(self),
        }
    }

    /// Returns a healthy connection: to the oldest live waiter, else to the
    /// idle buffer, else closes it.
    fn put(&self, stream: TcpStream) {
        let mut state = self.lock();
        let mut stream = stream;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(Handoff::Conn(stream)) {
                Ok(()) => return,
                Err(Handoff::Conn(returned)) => stream = returned,
                Err(Handoff::Slot) => return,
            }
        }

        if state.idle.len() < self.config.max_idle {
            state.idle.push_back(IdleConn {
                stream,
                last_active: Instant::now(),
            });
        } else {
            debug!(addr = %self.addr, "idle buffer full, closing connection");
            state.live -= 1;
        }
    }

    /// Forgets a connection that is closed or in an unknown state. The slot
    /// passes to the oldest live waiter, keeping its place in the queue.
    fn free_slot(&self) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(Handoff::Slot).is_ok() {
                return;
            }
        }
        state.live -= 1;
    }
}

/// A leased connection.
///
/// Call [`release`](Self::release) after a clean request/response exchange to
/// return it to the pool. Dropping the lease without releasing discards the
/// connection, which is what every error path wants: a stream that failed
/// mid-frame cannot be reused.
pub struct PooledConnection {
    stream: Option<TcpStream>,
    pool: Arc<ConnectionPool>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("addr", &self.pool.addr)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub fn addr(&self) -> &str {
        &self.pool.addr
    }

    /// Returns the connection to the pool for reuse.
    pub fn release(mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.put(stream);
        }
    }

    /// Closes the connection and frees its slot.
    pub fn discard(mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            self.pool.free_slot();
        }
    }

    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection returned to pool"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.stream.take().is_some() {
            self.pool.free_slot();
        }
    }
}

impl AsyncRead for PooledConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for PooledConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

/// One [`ConnectionPool`] per address, created on first use.
pub struct PoolSet {
    config: PoolConfig,
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
}

impl PoolSet {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, addr: &str) -> Arc<ConnectionPool> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools
            .entry(addr.to_string())
            .or_insert_with(|| ConnectionPool::new(addr, self.config.clone()))
            .clone()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}
