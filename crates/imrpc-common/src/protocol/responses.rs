//! Response frames.
//!
//! A response mirrors the request preamble but has no name or metadata
//! section. The bytes between the preamble and `head_length` hold the error
//! message (empty on success), and the payload follows.
//!
//! A non-empty error still means the round trip itself succeeded: the server
//! received the request and answered. Transport and timeout failures never
//! produce a `Response`.

use super::error::{ImrpcError, Result};
use super::frame::{wire_len, Preamble, PREAMBLE_LEN, PROTOCOL_VERSION};
use super::requests::{Request, RequestId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub head_length: u32,
    pub body_length: u32,
    pub request_id: RequestId,
    pub version: u8,
    pub compressor: u8,
    pub serializer: u8,
    pub error: Vec<u8>,
    pub data: Vec<u8>,
}

impl Response {
    pub fn new(request_id: RequestId) -> Self {
        Response {
            head_length: 0,
            body_length: 0,
            request_id,
            version: PROTOCOL_VERSION,
            compressor: 0,
            serializer: 0,
            error: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Creates an empty response echoing the request's id and codec choices.
    pub fn for_request(request: &Request) -> Self {
        Response {
            compressor: request.compressor,
            serializer: request.serializer,
            ..Response::new(request.request_id)
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = message.into().into_bytes();
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// The error message, if the remote side reported one.
    pub fn error_message(&self) -> Option<String> {
        if self.error.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.error).into_owned())
        }
    }

    pub fn calculate_header_length(&mut self) {
        self.head_length = (PREAMBLE_LEN + self.error.len()) as u32;
    }

    pub fn calculate_body_length(&mut self) {
        self.body_length = self.data.len() as u32;
    }

    /// Recomputes both length fields. Convenience for the common
    /// "build, then encode" sequence.
    pub fn finalize(mut self) -> Self {
        self.calculate_header_length();
        self.calculate_body_length();
        self
    }

    /// Encodes the response into a single frame.
    ///
    /// # Errors
    ///
    /// Returns a framing error if the length fields are stale.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let head = wire_len(PREAMBLE_LEN + self.error.len(), "response header")?;
        let body = wire_len(self.data.len(), "response body")?;
        if self.head_length != head || self.body_length != body {
            return Err(ImrpcError::Framing(format!(
                "stale lengths: head {}/{} body {}/{}",
                self.head_length, head, self.body_length, body
            )));
        }

        let mut buf = Vec::with_capacity(head as usize + body as usize);
        Preamble {
            head_length: head,
            body_length: body,
            request_id: self.request_id,
            version: self.version,
            compressor: self.compressor,
            serializer: self.serializer,
        }
        .write(&mut buf);
        buf.extend_from_slice(&self.error);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Decodes a complete response frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let preamble = Preamble::parse(frame)?;
        let head = preamble.head_length as usize;

        Ok(Response {
            head_length: preamble.head_length,
            body_length: preamble.body_length,
            request_id: preamble.request_id,
            version: preamble.version,
            compressor: preamble.compressor,
            serializer: preamble.serializer,
            error: frame[PREAMBLE_LEN..head].to_vec(),
            data: frame[head..].to_vec(),
        })
    }
}
