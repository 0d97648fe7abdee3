//! imrpc Transport Layer
//!
//! Moves whole frames over async byte streams.
//!
//! # Components
//!
//! - **[`FrameTransport`]**: connect with timeout, read one frame, request/response exchange
//! - **[`write_frame`]**: write and flush an encoded frame
//!
//! # Message Size Limits
//!
//! Readers reject any frame announcing more than the configured maximum
//! (16 MiB by default) before allocating a buffer for it.

pub mod tcp;

pub use tcp::{map_io_error, write_frame, FrameTransport, DEFAULT_CONNECT_TIMEOUT};
