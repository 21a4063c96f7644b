//! Protocol adapters.
//!
//! Adapters translate an external protocol into calls on the liaison's
//! services. The services themselves are transport-agnostic: they take a
//! [`RequestContext`] carrying the caller's cancellation and deadline, and
//! inbound streams whose failures are already classified as [`InboundError`].
//!
//! Currently implemented:
//! - [`stream`] - stream write ingestion and query over gRPC

use crate::core::error::{LiaisonError, LiaisonResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub mod stream;

/// Request context propagated through service processing.
///
/// Cancellation and deadline are observed while the request is suspended;
/// they are never polled.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context with no deadline that is never cancelled unless asked to.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deadline relative to now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Tie cancellation to an existing token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel the request.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The termination error if the request is already over.
    pub fn err(&self) -> Option<LiaisonError> {
        if self.cancel.is_cancelled() {
            return Some(LiaisonError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(LiaisonError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the request is cancelled or its deadline passes.
    pub async fn done(&self) -> LiaisonError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => LiaisonError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => LiaisonError::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                LiaisonError::Cancelled
            }
        }
    }

    /// Drive `fut` unless the request ends first.
    pub async fn run<F: Future>(&self, fut: F) -> LiaisonResult<F::Output> {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

/// Parse a `grpc-timeout` header value (`<digits><unit>`, unit one of
/// `H M S m u n`).
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

/// Why an inbound stream stopped yielding messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundError {
    /// The caller went away.
    Cancelled,
    /// The caller's deadline passed.
    DeadlineExceeded,
    /// Any other receive failure.
    Transport(String),
}

impl From<InboundError> for LiaisonError {
    fn from(err: InboundError) -> Self {
        match err {
            InboundError::Cancelled => LiaisonError::Cancelled,
            InboundError::DeadlineExceeded => LiaisonError::DeadlineExceeded,
            InboundError::Transport(message) => LiaisonError::Receive { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_timeout_units() {
        assert_eq!(parse_grpc_timeout("5S"), Some(Duration::from_secs(5)));
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("2H"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_grpc_timeout("100n"), Some(Duration::from_nanos(100)));
        assert_eq!(parse_grpc_timeout("S"), None);
        assert_eq!(parse_grpc_timeout("10x"), None);
        assert_eq!(parse_grpc_timeout("123456789S"), None);
    }

    #[tokio::test]
    async fn run_completes_before_cancellation() {
        let ctx = RequestContext::new();
        assert_eq!(ctx.run(async { 7 }).await.unwrap(), 7);
        assert!(ctx.err().is_none());
    }

    #[tokio::test]
    async fn cancellation_aborts_wait() {
        let ctx = RequestContext::new();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move { waiter.run(std::future::pending::<()>()).await });
        ctx.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(LiaisonError::Cancelled)));
        assert!(matches!(ctx.err(), Some(LiaisonError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_wait() {
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(50));
        let result = ctx.run(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(LiaisonError::DeadlineExceeded)));
    }

    #[test]
    fn inbound_error_mapping() {
        assert!(LiaisonError::from(InboundError::Cancelled).is_cancellation());
        assert!(matches!(
            LiaisonError::from(InboundError::Transport("reset".into())),
            LiaisonError::Receive { .. }
        ));
    }
}
