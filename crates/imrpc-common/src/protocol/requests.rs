use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::error::{ImrpcError, Result};
use super::frame::{
    wire_len, Preamble, KV_SEPARATOR, PAIR_SEPARATOR, PREAMBLE_LEN, PROTOCOL_VERSION,
};

pub type RequestId = u32;

/// Metadata key carrying the caller's deadline as unix epoch milliseconds.
pub const META_DEADLINE: &str = "deadline";

/// Metadata key marking a fire-and-forget call.
pub const META_ONEWAY: &str = "one-way";

/// A request frame.
///
/// Wire layout after the preamble:
///
/// ```text
/// service \n method \n (key \r value \n)* \n payload
/// ```
///
/// `head_length` and `body_length` are derived values. Call
/// [`calculate_header_length`](Self::calculate_header_length) and
/// [`calculate_body_length`](Self::calculate_body_length) after the last
/// mutation; [`encode`](Self::encode) refuses stale lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub head_length: u32,
    pub body_length: u32,
    pub request_id: RequestId,
    pub version: u8,
    pub compressor: u8,
    pub serializer: u8,
    pub service_name: String,
    pub method_name: String,
    pub meta: HashMap<String, String>,
    pub data: Vec<u8>,
}

impl Request {
    pub fn new(service_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Request {
            head_length: 0,
            body_length: 0,
            request_id: 0,
            version: PROTOCOL_VERSION,
            compressor: 0,
            serializer: 0,
            service_name: service_name.into(),
            method_name: method_name.into(),
            meta: HashMap::new(),
            data: Vec::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn is_oneway(&self) -> bool {
        self.meta.get(META_ONEWAY).map(String::as_str) == Some("true")
    }

    pub fn set_oneway(&mut self) {
        self.meta.insert(META_ONEWAY.to_string(), "true".to_string());
    }

    /// Deadline carried in metadata, if any.
    ///
    /// An unparseable deadline is treated as absent.
    pub fn deadline(&self) -> Option<SystemTime> {
        let millis: u64 = self.meta.get(META_DEADLINE)?.parse().ok()?;
        Some(UNIX_EPOCH + Duration::from_millis(millis))
    }

    pub fn set_deadline(&mut self, deadline: SystemTime) {
        let millis = deadline
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.meta.insert(META_DEADLINE.to_string(), millis.to_string());
    }

    /// Recomputes `head_length` from the current names and metadata.
    pub fn calculate_header_length(&mut self) {
        self.head_length = self.header_len() as u32;
    }

    /// Recomputes `body_length` from the payload.
    pub fn calculate_body_length(&mut self) {
        self.body_length = self.data.len() as u32;
    }

    /// Encodes the request into a single frame.
    ///
    /// # Errors
    ///
    /// Returns a framing error if a name or metadata entry contains a reserved
    /// separator, or if the length fields were not recalculated after the last
    /// mutation.
    pub fn encode(&self) -> Result<Vec<u8>> {
        check_field(&self.service_name, "service name", true)?;
        check_field(&self.method_name, "method name", true)?;
        for (key, value) in &self.meta {
            check_field(key, "metadata key", true)?;
            check_field(value, "metadata value", false)?;
        }

        let head = wire_len(self.header_len(), "request header")?;
        let body = wire_len(self.data.len(), "request body")?;
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

        buf.extend_from_slice(self.service_name.as_bytes());
        buf.push(PAIR_SEPARATOR);
        buf.extend_from_slice(self.method_name.as_bytes());
        buf.push(PAIR_SEPARATOR);
        for (key, value) in &self.meta {
            buf.extend_from_slice(key.as_bytes());
            buf.push(KV_SEPARATOR);
            buf.extend_from_slice(value.as_bytes());
            buf.push(PAIR_SEPARATOR);
        }
        buf.push(PAIR_SEPARATOR);
        buf.extend_from_slice(&self.data);

        Ok(buf)
    }

    /// Decodes a complete request frame.
    ///
    /// The header section is bounded by the encoded `head_length`; the payload
    /// is never scanned for separators.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let preamble = Preamble::parse(frame)?;
        let head = preamble.head_length as usize;
        let mut header = HeaderCursor::new(&frame[PREAMBLE_LEN..head]);

        let service_name = header.field(PAIR_SEPARATOR, "service name")?;
        let method_name = header.field(PAIR_SEPARATOR, "method name")?;

        let mut meta = HashMap::new();
        loop {
            match header.peek() {
                Some(PAIR_SEPARATOR) => {
                    header.advance();
                    break;
                }
                Some(_) => {
                    let key = header.field(KV_SEPARATOR, "metadata key")?;
                    let value = header.field(PAIR_SEPARATOR, "metadata value")?;
                    meta.insert(key, value);
                }
                None => {
                    return Err(ImrpcError::Framing(
                        "metadata section is not terminated".to_string(),
                    ))
                }
            }
        }

        if !header.is_empty() {
            return Err(ImrpcError::Framing(format!(
                "{} unexpected bytes after metadata terminator",
                header.remaining()
            )));
        }

        Ok(Request {
            head_length: preamble.head_length,
            body_length: preamble.body_length,
            request_id: preamble.request_id,
            version: preamble.version,
            compressor: preamble.compressor,
            serializer: preamble.serializer,
            service_name,
            method_name,
            meta,
            data: frame[head..].to_vec(),
        })
    }

    fn header_len(&self) -> usize {
        let meta: usize = self
            .meta
            .iter()
            .map(|(k, v)| k.len() + 1 + v.len() + 1)
            .sum();
        PREAMBLE_LEN + self.service_name.len() + 1 + self.method_name.len() + 1 + meta + 1
    }
}

/// Rejects fields that would corrupt the header layout.
///
/// Names and keys may contain neither separator; values only need to avoid
/// the pair terminator.
fn check_field(value: &str, what: &str, strict: bool) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.contains(&PAIR_SEPARATOR) || (strict && bytes.contains(&KV_SEPARATOR)) {
        return Err(ImrpcError::Framing(format!(
            "{} {:?} contains a reserved separator",
            what, value
        )));
    }
    Ok(())
}

/// Forward-only reader over the variable header section.
struct HeaderCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> HeaderCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Reads up to `sep`, consuming the separator.
    ///
    /// A field ended by the key/value separator must not span a pair terminator.
    fn field(&mut self, sep: u8, what: &str) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == sep || (sep == KV_SEPARATOR && b == PAIR_SEPARATOR))
            .filter(|&i| rest[i] == sep)
            .ok_or_else(|| ImrpcError::Framing(format!("{} is not terminated", what)))?;

        let field = String::from_utf8(rest[..end].to_vec())
            .map_err(|_| ImrpcError::Framing(format!("{} is not valid UTF-8", what)))?;
        self.pos += end + 1;
        Ok(field)
    }
}
