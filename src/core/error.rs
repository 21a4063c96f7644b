//! Error types and adapter-specific mapping.
//!
//! Write-path failures never surface as RPC errors: they are turned into a
//! per-message [`StatusCode`] reply. Query-path failures and stream-level
//! failures surface as [`LiaisonError`] and are mapped to gRPC status codes at
//! the adapter boundary.

use crate::bus::BusError;
use crate::core::time::TimeError;
use crate::proto::{StatusCode, TimeRange};
use thiserror::Error;

/// Common liaison error conditions.
#[derive(Debug, Clone, Error)]
pub enum LiaisonError {
    /// Element timestamp is missing, malformed or out of range.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(#[source] TimeError),

    /// Query time range failed validation. The message names the range.
    #[error("{range} is invalid: {reason}")]
    InvalidTimeRange { range: TimeRange, reason: TimeError },

    /// No schema is cached for the entity.
    #[error("schema {group}/{name} not found")]
    SchemaNotFound { group: String, name: String },

    /// The client wrote against a stale schema revision.
    #[error("schema {group}/{name} expired: cached revision {cached}, requested {requested}")]
    SchemaExpired {
        group: String,
        name: String,
        cached: i64,
        requested: i64,
    },

    /// Entity, shard or series could not be derived from the request.
    #[error("failed to resolve write target: {message}")]
    Resolve { message: String },

    /// No node owns the requested shard.
    #[error("no available node for {group}/{name} shard {shard_id}: {message}")]
    NodeUnavailable {
        group: String,
        name: String,
        shard_id: u32,
        message: String,
    },

    /// Transport failure.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Receiving from the client stream failed for a reason other than cancellation.
    #[error("failed to receive message: {message}")]
    Receive { message: String },

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The caller's deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A data node answered a query with a domain error.
    #[error("failed to query: {message}")]
    QueryFailed { status: StatusCode, message: String },

    /// Invalid request.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl LiaisonError {
    /// Create a Resolve error.
    pub fn resolve(message: impl Into<String>) -> Self {
        Self::Resolve {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Cancellation and deadline expiry are expected terminations, not faults.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Write status reported to a client for a per-message failure.
    pub fn write_status(&self) -> StatusCode {
        match self {
            Self::InvalidTimestamp(_) => StatusCode::InvalidTimestamp,
            Self::SchemaNotFound { .. } => StatusCode::NotFound,
            Self::SchemaExpired { .. } => StatusCode::ExpiredSchema,
            _ => StatusCode::InternalError,
        }
    }
}

/// Result type using LiaisonError.
pub type LiaisonResult<T> = Result<T, LiaisonError>;

/// Convert a LiaisonError to a tonic Status.
#[cfg(feature = "grpc")]
pub fn liaison_error_to_status(e: LiaisonError) -> tonic::Status {
    use tonic::Status;

    match e {
        LiaisonError::InvalidTimeRange { .. }
        | LiaisonError::InvalidTimestamp(_)
        | LiaisonError::InvalidRequest { .. } => Status::invalid_argument(e.to_string()),
        LiaisonError::SchemaNotFound { .. } => Status::not_found(e.to_string()),
        LiaisonError::SchemaExpired { .. } => Status::failed_precondition(e.to_string()),
        LiaisonError::Cancelled => Status::cancelled(e.to_string()),
        LiaisonError::DeadlineExceeded => Status::deadline_exceeded(e.to_string()),
        LiaisonError::NodeUnavailable { .. } => Status::unavailable(e.to_string()),
        LiaisonError::Bus(BusError::Timeout { .. }) => Status::deadline_exceeded(e.to_string()),
        LiaisonError::Bus(BusError::Closed) | LiaisonError::Bus(BusError::Unavailable { .. }) => {
            Status::unavailable(e.to_string())
        }
        _ => Status::internal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Timestamp;

    #[test]
    fn invalid_time_range_names_range() {
        let range = TimeRange::new(Timestamp::from_millis(2_000), Timestamp::from_millis(1_000));
        let err = LiaisonError::InvalidTimeRange {
            range,
            reason: TimeError::Inverted,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("[1970-01-01T00:00:02Z, 1970-01-01T00:00:01Z)"));
        assert!(msg.ends_with("is invalid: begin must be before end"));
    }

    #[test]
    fn write_status_mapping() {
        assert_eq!(
            LiaisonError::InvalidTimestamp(TimeError::Empty).write_status(),
            StatusCode::InvalidTimestamp
        );
        assert_eq!(
            LiaisonError::SchemaNotFound {
                group: "g".into(),
                name: "n".into()
            }
            .write_status(),
            StatusCode::NotFound
        );
        assert_eq!(
            LiaisonError::resolve("missing tag").write_status(),
            StatusCode::InternalError
        );
    }

    #[test]
    fn cancellation_classification() {
        assert!(LiaisonError::Cancelled.is_cancellation());
        assert!(LiaisonError::DeadlineExceeded.is_cancellation());
        assert!(!LiaisonError::internal("x").is_cancellation());
    }

    #[cfg(feature = "grpc")]
    #[test]
    fn invalid_range_maps_to_invalid_argument() {
        let err = LiaisonError::InvalidTimeRange {
            range: TimeRange::default(),
            reason: TimeError::Empty,
        };
        let status = liaison_error_to_status(err);
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("is invalid"));
    }
}
