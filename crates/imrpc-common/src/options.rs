//! Per-call options: deadline, cancellation, one-way flag and routing group.

use std::time::{Duration, Instant, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::protocol::error::ImrpcError;

/// Options attached to a single call.
///
/// A call is bounded by whichever fires first: the deadline or the
/// cancellation token. Either one abandons the wait and surfaces
/// [`ImrpcError::DeadlineExceeded`] or [`ImrpcError::Cancelled`].
///
/// # Example
///
/// ```
/// use imrpc_common::options::CallOptions;
/// use std::time::Duration;
///
/// let options = CallOptions::new()
///     .with_timeout(Duration::from_secs(1))
///     .with_group("A");
/// assert!(options.deadline.is_some());
/// assert!(!options.oneway);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Fire-and-forget: return as soon as the request is written
    pub oneway: bool,
    /// Routing group the picker filters candidates by
    pub group: Option<String>,
    pub deadline: Option<Instant>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn oneway() -> Self {
        Self {
            oneway: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets the deadline, keeping the earlier one if already set.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_oneway(mut self, oneway: bool) -> Self {
        self.oneway = oneway;
        self
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// The deadline as wall-clock time, for the `deadline` metadata entry.
    pub fn wall_deadline(&self) -> Option<SystemTime> {
        self.remaining().map(|left| SystemTime::now() + left)
    }

    /// Returns the error this call should fail with right now, if any.
    pub fn check(&self) -> Result<(), ImrpcError> {
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(ImrpcError::Cancelled);
        }
        if self.deadline.is_some_and(|d| d <= Instant::now()) {
            return Err(ImrpcError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves once the call is cancelled or its deadline passes.
    ///
    /// Pending forever if neither is set, so it can always sit in a `select!`.
    pub async fn done(&self) -> ImrpcError {
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => ImrpcError::Cancelled,
            _ = expired => ImrpcError::DeadlineExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_deadline_keeps_earliest() {
        let now = Instant::now();
        let options = CallOptions::new()
            .with_deadline(now + Duration::from_secs(5))
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(3));
        assert_eq!(options.deadline, Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_check() {
        assert!(CallOptions::new().check().is_ok());

        let token = CancellationToken::new();
        let options = CallOptions::new().with_cancel(token.clone());
        assert!(options.check().is_ok());
        token.cancel();
        assert!(matches!(options.check(), Err(ImrpcError::Cancelled)));

        let expired = CallOptions::new().with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(matches!(expired.check(), Err(ImrpcError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_done_fires_on_deadline() {
        let options = CallOptions::new().with_timeout(Duration::from_millis(20));
        let err = options.done().await;
        assert!(matches!(err, ImrpcError::DeadlineExceeded));
        assert_eq!(options.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_done_fires_on_cancel() {
        let token = CancellationToken::new();
        let options = CallOptions::new()
            .with_timeout(Duration::from_secs(30))
            .with_cancel(token.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        assert!(matches!(options.done().await, ImrpcError::Cancelled));
    }

    #[tokio::test]
    async fn test_done_without_bounds_stays_pending() {
        let options = CallOptions::new();
        let result = tokio::time::timeout(Duration::from_millis(20), options.done()).await;
        assert!(result.is_err());
    }
}
