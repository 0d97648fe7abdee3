use thiserror::Error;

/// Fixed message returned to callers of one-way calls.
///
/// One-way calls deliberately swallow business errors: the caller never learns
/// whether the remote method failed, only that the request was written.
pub const ONEWAY_MESSAGE: &str = "oneway call, no result expected";

/// Error text a server answers with when the caller's deadline passed before
/// the method finished. Clients map it back to [`ImrpcError::DeadlineExceeded`].
pub const DEADLINE_MESSAGE: &str = "Deadline exceeded";

#[derive(Error, Debug)]
pub enum ImrpcError {
    /// Malformed or truncated frame. Fatal for the connection it arrived on.
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// Unknown serializer or compressor code.
    #[error("Unsupported protocol option: {0}")]
    UnsupportedOption(String),

    /// Error returned by the remote method, rehydrated from its message.
    #[error("{0}")]
    Remote(String),

    #[error("{}", ONEWAY_MESSAGE)]
    Oneway,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection pool exhausted after {0}ms")]
    PoolTimeout(u64),

    #[error("Call cancelled")]
    Cancelled,

    #[error("{}", DEADLINE_MESSAGE)]
    DeadlineExceeded,

    #[error("No candidates available")]
    NoCandidates,

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ImrpcError {
    /// Rehydrates an error message received in a response.
    ///
    /// Reserved messages map back to their variants; anything else is a
    /// business error.
    pub fn from_remote(message: String) -> Self {
        if message == DEADLINE_MESSAGE {
            ImrpcError::DeadlineExceeded
        } else {
            ImrpcError::Remote(message)
        }
    }

    /// Returns `true` for errors caused by the caller's cancellation or deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ImrpcError::Cancelled | ImrpcError::DeadlineExceeded)
    }

    /// Returns `true` for errors that leave the connection in an unknown state.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ImrpcError::Framing(_) | ImrpcError::VersionMismatch { .. }
        )
    }

    /// Returns `true` for dial/read/write failures and pool exhaustion.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ImrpcError::Connection(_) | ImrpcError::Io(_) | ImrpcError::PoolTimeout(_)
        )
    }

    /// Returns `true` if retrying the call on another connection may succeed.
    ///
    /// Business errors are never retryable: the method already ran.
    pub fn is_retryable(&self) -> bool {
        self.is_transport() || matches!(self, ImrpcError::NoCandidates)
    }
}

impl From<serde_json::Error> for ImrpcError {
    fn from(err: serde_json::Error) -> Self {
        ImrpcError::Serialization(err.to_string())
    }
}

impl From<erased_serde::Error> for ImrpcError {
    fn from(err: erased_serde::Error) -> Self {
        ImrpcError::Serialization(err.to_string())
    }
}

impl From<postcard::Error> for ImrpcError {
    fn from(err: postcard::Error) -> Self {
        ImrpcError::Serialization(err.to_string())
    }
}

impl From<std::net::AddrParseError> for ImrpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        ImrpcError::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ImrpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oneway_message_is_fixed() {
        assert_eq!(ImrpcError::Oneway.to_string(), ONEWAY_MESSAGE);
    }

    #[test]
    fn test_remote_error_displays_bare_message() {
        let err = ImrpcError::Remote("mock error".to_string());
        assert_eq!(err.to_string(), "mock error");
    }

    #[test]
    fn test_from_remote_recovers_deadline() {
        let err = ImrpcError::from_remote(ImrpcError::DeadlineExceeded.to_string());
        assert!(matches!(err, ImrpcError::DeadlineExceeded));
        assert!(err.is_cancellation());

        let err = ImrpcError::from_remote("deadline exceeded by a lot".to_string());
        assert!(matches!(err, ImrpcError::Remote(_)));
    }

    #[test]
    fn test_classification_is_disjoint() {
        let cancelled = ImrpcError::DeadlineExceeded;
        assert!(cancelled.is_cancellation());
        assert!(!cancelled.is_transport());
        assert!(!cancelled.is_retryable());

        let remote = ImrpcError::Remote("boom".into());
        assert!(!remote.is_cancellation());
        assert!(!remote.is_transport());
        assert!(!remote.is_retryable());

        let transport = ImrpcError::Connection("reset".into());
        assert!(transport.is_transport());
        assert!(transport.is_retryable());

        let framing = ImrpcError::VersionMismatch { expected: 1, actual: 2 };
        assert!(framing.is_framing());
        assert!(!framing.is_retryable());
    }
}
