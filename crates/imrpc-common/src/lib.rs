//! imrpc Common Types and Transport
//!
//! Shared building blocks for the imrpc client, server and balancer crates.
//!
//! # Overview
//!
//! - **Protocol Layer**: binary Request/Response frames and the error taxonomy
//! - **Codec Layer**: serialization and compression plugins, looked up by the
//!   one-byte codes carried in each frame
//! - **Transport Layer**: async TCP framing with a maximum frame size
//! - **Call options**: deadline, cancellation, one-way flag and routing group
//!
//! # Wire Format
//!
//! ```text
//! request:  [preamble 15B] [service\n] [method\n] [key\rvalue\n]* [\n] [payload]
//! response: [preamble 15B] [error bytes] [payload]
//! ```
//!
//! All integers are big-endian. See [`protocol::frame`] for the preamble layout.
//!
//! # Example
//!
//! ```
//! use imrpc_common::{Request, Response};
//!
//! let mut request = Request::new("UserService", "GetById").with_data(b"{\"id\":1}".to_vec());
//! request.calculate_header_length();
//! request.calculate_body_length();
//!
//! let frame = request.encode().unwrap();
//! let decoded = Request::decode(&frame).unwrap();
//! assert_eq!(decoded.method_name, "GetById");
//!
//! let response = Response::for_request(&decoded).with_error("not found").finalize();
//! assert_eq!(response.error_message().as_deref(), Some("not found"));
//! ```

pub mod codec;
pub mod options;
pub mod protocol;
pub mod rate_limit;
pub mod transport;

pub use codec::{CodecRegistry, Compressor, Serialization, Serializer};
pub use options::CallOptions;
pub use protocol::*;
