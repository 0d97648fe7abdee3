use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::error::{ImrpcError, Result};
use crate::protocol::frame::{split_lengths, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_LEN, PREAMBLE_LEN};
use crate::protocol::{Request, Response};

/// Default timeout for establishing a TCP connection (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Async TCP transport for imrpc frames.
///
/// Frames are self-delimiting: the first eight bytes of every frame carry the
/// head and body lengths, so the reader knows how many more bytes to expect
/// without any extra length prefix.
///
/// ```text
/// [head_length u32] [body_length u32] [rest of preamble] [header] [payload]
/// ```
///
/// # Example
///
/// ```no_run
/// use imrpc_common::transport::FrameTransport;
/// use imrpc_common::protocol::Request;
///
/// # #[tokio::main]
/// # async fn main() -> imrpc_common::Result<()> {
/// let transport = FrameTransport::new();
/// let mut stream = transport.connect("127.0.0.1:8080").await?;
///
/// let mut request = Request::new("Greeter", "Hello");
/// request.calculate_header_length();
/// request.calculate_body_length();
/// let response = transport.send_request(&mut stream, &request).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FrameTransport {
    max_frame_size: usize,
    connect_timeout: Duration,
}

impl FrameTransport {
    /// Creates a transport with the default frame limit and connect timeout.
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Connects to a remote endpoint.
    ///
    /// # Arguments
    ///
    /// * `addr` - The address to connect to (e.g., "127.0.0.1:8080")
    ///
    /// # Errors
    ///
    /// Returns a `Connection` error if the address does not resolve, if every
    /// resolved address refuses, or if the connect timeout elapses.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let connect = TcpStream::connect(addr);
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ImrpcError::Connection(format!(
                    "Failed to connect to {}: {}",
                    addr, e
                )))
            }
            Err(_) => {
                return Err(ImrpcError::Connection(format!(
                    "Timed out connecting to {} after {}ms",
                    addr,
                    self.connect_timeout.as_millis()
                )))
            }
        };

        // Request/response traffic is latency-bound
        stream.set_nodelay(true).map_err(|e| map_io_error(e, "setting TCP_NODELAY"))?;
        Ok(stream)
    }

    /// Encodes `request`, writes it, and reads back one response frame.
    pub async fn send_request<S>(&self, stream: &mut S, request: &Request) -> Result<Response>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let encoded = request.encode()?;
        write_frame(stream, &encoded).await?;
        let frame = self.read_frame(stream).await?.ok_or_else(|| {
            ImrpcError::Connection("connection closed before response".to_string())
        })?;
        Response::decode(&frame)
    }

    /// Reads one complete frame.
    ///
    /// Returns `Ok(None)` if the peer closed the stream cleanly before the first
    /// byte of a frame. EOF in the middle of a frame is a framing error.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The announced frame exceeds the configured maximum
    /// - The head length is shorter than the preamble
    /// - The stream ends or fails mid-frame
    pub async fn read_frame<R>(&self, stream: &mut R) -> Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_LEN {
            let n = stream
                .read(&mut prefix[filled..])
                .await
                .map_err(|e| map_io_error(e, "reading frame lengths"))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ImrpcError::Framing(format!(
                    "stream ended after {} of {} length bytes",
                    filled, LENGTH_PREFIX_LEN
                )));
            }
            filled += n;
        }

        let (head_length, body_length) = split_lengths(&prefix);
        if (head_length as usize) < PREAMBLE_LEN {
            return Err(ImrpcError::Framing(format!(
                "head length {} is shorter than the preamble",
                head_length
            )));
        }

        // Validate before allocating
        let total = head_length as usize + body_length as usize;
        if total > self.max_frame_size {
            return Err(ImrpcError::Framing(format!(
                "frame too large: {} bytes (max {} bytes)",
                total, self.max_frame_size
            )));
        }

        let mut frame = vec![0u8; total];
        frame[..LENGTH_PREFIX_LEN].copy_from_slice(&prefix);
        stream
            .read_exact(&mut frame[LENGTH_PREFIX_LEN..])
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => ImrpcError::Framing(format!(
                    "stream ended inside a {} byte frame",
                    total
                )),
                _ => map_io_error(e, "reading frame"),
            })?;

        Ok(Some(frame))
    }
}

impl Default for FrameTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes one encoded frame and flushes the stream.
pub async fn write_frame<W>(stream: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream
        .write_all(frame)
        .await
        .map_err(|e| map_io_error(e, "writing frame"))?;
    stream
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;
    Ok(())
}

/// Map IO errors to imrpc error variants
///
/// - Connection resets and broken pipes -> `Connection`
/// - Other IO errors -> `Io`
pub fn map_io_error(err: std::io::Error, context: &str) -> ImrpcError {
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe => ImrpcError::Connection(format!("{}: connection lost", context)),
        _ => ImrpcError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_defaults() {
        let transport = FrameTransport::default();
        assert_eq!(transport.max_frame_size(), DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(transport.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn test_map_io_error() {
        let err = map_io_error(std::io::Error::from(ErrorKind::ConnectionReset), "reading");
        assert!(matches!(err, ImrpcError::Connection(_)));

        let err = map_io_error(std::io::Error::from(ErrorKind::PermissionDenied), "reading");
        assert!(matches!(err, ImrpcError::Io(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = FrameTransport::new().connect(&addr).await.unwrap_err();
        assert!(matches!(err, ImrpcError::Connection(_)));
    }
}
