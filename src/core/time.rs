//! Timestamp and time-range validation.
//!
//! Element timestamps are stored with millisecond precision and must fit in a
//! signed 64-bit nanosecond counter. The representable window is therefore
//! `[MIN_NANOS, MAX_NANOS]`, where the lower bound excludes the zero value so
//! that an unset timestamp can never be mistaken for a real one.

use crate::proto::{TimeRange, Timestamp};
use thiserror::Error;

const NANOS_PER_MILLI: i128 = 1_000_000;
const NANOS_PER_SECOND: i32 = 1_000_000_000;

/// Smallest accepted timestamp: one millisecond past the epoch.
pub const MIN_NANOS: i128 = NANOS_PER_MILLI;

/// Largest accepted timestamp: `i64::MAX` nanoseconds truncated to milliseconds.
pub const MAX_NANOS: i128 = (i64::MAX as i128 / NANOS_PER_MILLI) * NANOS_PER_MILLI;

// Protobuf's well-known timestamp bounds: 0001-01-01 .. 9999-12-31.
const MIN_VALID_SECONDS: i64 = -62_135_596_800;
const MAX_VALID_SECONDS: i64 = 253_402_300_799;

/// Why a timestamp or range was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("time is empty")]
    Empty,

    #[error("timestamp ({seconds}s, {nanos}ns) is not a valid protobuf timestamp")]
    Malformed { seconds: i64, nanos: i32 },

    #[error("time is out of range {} - {}", MIN_NANOS, MAX_NANOS)]
    OutOfRange,

    #[error("time is not millisecond precision")]
    NotMillisecond,

    #[error("begin must be before end")]
    Inverted,
}

/// Smallest accepted timestamp.
pub fn min_timestamp() -> Timestamp {
    nanos_to_timestamp(MIN_NANOS)
}

/// Largest accepted timestamp.
pub fn max_timestamp() -> Timestamp {
    nanos_to_timestamp(MAX_NANOS)
}

/// The range substituted for queries that omit one: everything representable.
pub fn default_time_range() -> TimeRange {
    TimeRange::new(min_timestamp(), max_timestamp())
}

fn nanos_to_timestamp(nanos: i128) -> Timestamp {
    let per_sec = i128::from(NANOS_PER_SECOND);
    Timestamp {
        seconds: nanos.div_euclid(per_sec) as i64,
        nanos: nanos.rem_euclid(per_sec) as i32,
    }
}

/// Validate a single element timestamp.
pub fn check_timestamp(ts: Option<&Timestamp>) -> Result<(), TimeError> {
    let ts = ts.ok_or(TimeError::Empty)?;

    if ts.nanos < 0
        || ts.nanos >= NANOS_PER_SECOND
        || ts.seconds < MIN_VALID_SECONDS
        || ts.seconds > MAX_VALID_SECONDS
    {
        return Err(TimeError::Malformed {
            seconds: ts.seconds,
            nanos: ts.nanos,
        });
    }

    let nanos = ts.as_nanos();
    if !(MIN_NANOS..=MAX_NANOS).contains(&nanos) {
        return Err(TimeError::OutOfRange);
    }
    if nanos % NANOS_PER_MILLI != 0 {
        return Err(TimeError::NotMillisecond);
    }
    Ok(())
}

/// Validate a query time range. Both ends must be valid and `begin < end`.
pub fn check_time_range(range: &TimeRange) -> Result<(), TimeError> {
    check_timestamp(range.begin.as_ref())?;
    check_timestamp(range.end.as_ref())?;

    // Both ends were validated above.
    let (begin, end) = match (range.begin.as_ref(), range.end.as_ref()) {
        (Some(begin), Some(end)) => (begin.as_nanos(), end.as_nanos()),
        _ => return Err(TimeError::Empty),
    };
    if begin >= end {
        return Err(TimeError::Inverted);
    }
    Ok(())
}

/// Wall-clock nanoseconds since the epoch.
pub fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Wall-clock time as a protobuf timestamp.
pub fn now_timestamp() -> Timestamp {
    nanos_to_timestamp(i128::from(now_nanos()))
}
