//! Wire-format messages for the stream service.
//!
//! Messages are declared with `prost` derives directly in Rust instead of being
//! generated from `.proto` files at build time. Field tags are part of the wire
//! contract and must not be renumbered.

use std::fmt;

// ============================================================================
// Common model
// ============================================================================

/// Seconds + nanoseconds since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, prost::Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        Self { seconds, nanos }
    }

    /// Build a timestamp from milliseconds since the epoch.
    pub fn from_millis(millis: i64) -> Self {
        Self {
            seconds: millis.div_euclid(1000),
            nanos: (millis.rem_euclid(1000) * 1_000_000) as i32,
        }
    }

    /// Nanoseconds since the epoch, widened so that out-of-range inputs can be compared.
    pub fn as_nanos(&self) -> i128 {
        i128::from(self.seconds) * 1_000_000_000 + i128::from(self.nanos)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::from_timestamp(self.seconds, self.nanos.max(0) as u32) {
            Some(dt) => write!(f, "{}", dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)),
            None => write!(f, "{}s{}ns", self.seconds, self.nanos),
        }
    }
}

/// Half-open time window `[begin, end)`.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct TimeRange {
    #[prost(message, optional, tag = "1")]
    pub begin: Option<Timestamp>,
    #[prost(message, optional, tag = "2")]
    pub end: Option<Timestamp>,
}

impl TimeRange {
    pub fn new(begin: Timestamp, end: Timestamp) -> Self {
        Self {
            begin: Some(begin),
            end: Some(end),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |ts: &Option<Timestamp>| match ts {
            Some(ts) => ts.to_string(),
            None => "<nil>".to_string(),
        };
        write!(f, "[{}, {})", render(&self.begin), render(&self.end))
    }
}

/// Identifies a schema object: the stream `name` inside `group`.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct Metadata {
    #[prost(string, tag = "1")]
    pub group: String,
    #[prost(string, tag = "2")]
    pub name: String,
    /// Schema revision the client wrote against. Zero skips the schema check.
    #[prost(int64, tag = "3")]
    pub mod_revision: i64,
}

impl Metadata {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            mod_revision: 0,
        }
    }

    pub fn with_mod_revision(mut self, mod_revision: i64) -> Self {
        self.mod_revision = mod_revision;
        self
    }
}

/// Per-request outcome reported back to writers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Unspecified = 0,
    Succeed = 1,
    InvalidTimestamp = 2,
    NotFound = 3,
    ExpiredSchema = 4,
    InternalError = 5,
    DiskFull = 6,
}

impl StatusCode {
    /// Stable string form carried in [`WriteResponse::status`].
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Self::Unspecified => "STATUS_UNSPECIFIED",
            Self::Succeed => "STATUS_SUCCEED",
            Self::InvalidTimestamp => "STATUS_INVALID_TIMESTAMP",
            Self::NotFound => "STATUS_NOT_FOUND",
            Self::ExpiredSchema => "STATUS_EXPIRED_SCHEMA",
            Self::InternalError => "STATUS_INTERNAL_ERROR",
            Self::DiskFull => "STATUS_DISK_FULL",
        }
    }

    pub fn from_str_name(value: &str) -> Option<Self> {
        match value {
            "STATUS_UNSPECIFIED" => Some(Self::Unspecified),
            "STATUS_SUCCEED" => Some(Self::Succeed),
            "STATUS_INVALID_TIMESTAMP" => Some(Self::InvalidTimestamp),
            "STATUS_NOT_FOUND" => Some(Self::NotFound),
            "STATUS_EXPIRED_SCHEMA" => Some(Self::ExpiredSchema),
            "STATUS_INTERNAL_ERROR" => Some(Self::InternalError),
            "STATUS_DISK_FULL" => Some(Self::DiskFull),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeed)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str_name())
    }
}

// ============================================================================
// Tag values
// ============================================================================

#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct StrArray {
    #[prost(string, repeated, tag = "1")]
    pub value: Vec<String>,
}

#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct IntArray {
    #[prost(int64, repeated, tag = "1")]
    pub value: Vec<i64>,
}

#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct TagValue {
    #[prost(oneof = "tag_value::Value", tags = "1, 2, 3, 4, 5, 6")]
    pub value: Option<tag_value::Value>,
}

pub mod tag_value {
    #[derive(Clone, PartialEq, Eq, Hash, prost::Oneof)]
    pub enum Value {
        #[prost(int32, tag = "1")]
        Null(i32),
        #[prost(string, tag = "2")]
        Str(String),
        #[prost(int64, tag = "3")]
        Int(i64),
        #[prost(message, tag = "4")]
        StrArray(super::StrArray),
        #[prost(message, tag = "5")]
        IntArray(super::IntArray),
        #[prost(bytes = "vec", tag = "6")]
        BinaryData(Vec<u8>),
    }
}

impl TagValue {
    pub fn null() -> Self {
        Self {
            value: Some(tag_value::Value::Null(0)),
        }
    }

    pub fn str(value: impl Into<String>) -> Self {
        Self {
            value: Some(tag_value::Value::Str(value.into())),
        }
    }

    pub fn int(value: i64) -> Self {
        Self {
            value: Some(tag_value::Value::Int(value)),
        }
    }

    pub fn binary(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: Some(tag_value::Value::BinaryData(value.into())),
        }
    }

    /// A tag that is absent or explicitly null.
    pub fn is_null(&self) -> bool {
        matches!(self.value, None | Some(tag_value::Value::Null(_)))
    }
}

// ============================================================================
// Write
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct TagFamilyForWrite {
    #[prost(message, repeated, tag = "1")]
    pub tags: Vec<TagValue>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ElementValue {
    #[prost(string, tag = "1")]
    pub element_id: String,
    #[prost(message, optional, tag = "2")]
    pub timestamp: Option<Timestamp>,
    /// Positional: family `i` and tag `j` follow the stream schema's declaration order.
    #[prost(message, repeated, tag = "3")]
    pub tag_families: Vec<TagFamilyForWrite>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteRequest {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
    #[prost(message, optional, tag = "2")]
    pub element: Option<ElementValue>,
    #[prost(uint64, tag = "3")]
    pub message_id: u64,
}

impl WriteRequest {
    pub fn metadata(&self) -> Metadata {
        self.metadata.clone().unwrap_or_default()
    }

    pub fn group(&self) -> &str {
        self.metadata.as_ref().map(|m| m.group.as_str()).unwrap_or("")
    }

    pub fn timestamp(&self) -> Option<&Timestamp> {
        self.element.as_ref().and_then(|e| e.timestamp.as_ref())
    }

    pub fn tag_families(&self) -> &[TagFamilyForWrite] {
        self.element
            .as_ref()
            .map(|e| e.tag_families.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteResponse {
    #[prost(uint64, tag = "1")]
    pub message_id: u64,
    #[prost(string, tag = "2")]
    pub status: String,
    #[prost(message, optional, tag = "3")]
    pub metadata: Option<Metadata>,
}

impl WriteResponse {
    pub fn new(metadata: Option<Metadata>, status: StatusCode, message_id: u64) -> Self {
        Self {
            message_id,
            status: status.as_str_name().to_string(),
            metadata,
        }
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_str_name(&self.status)
    }
}

/// Envelope published to the owning data node.
#[derive(Clone, PartialEq, prost::Message)]
pub struct InternalWriteRequest {
    #[prost(uint32, tag = "1")]
    pub shard_id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub series_hash: Vec<u8>,
    /// Entity tag values, without the leading subject name.
    #[prost(message, repeated, tag = "3")]
    pub entity_values: Vec<TagValue>,
    #[prost(message, optional, tag = "4")]
    pub request: Option<WriteRequest>,
}

// ============================================================================
// Query
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct Tag {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(message, optional, tag = "2")]
    pub value: Option<TagValue>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TagFamily {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub tags: Vec<Tag>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Element {
    #[prost(string, tag = "1")]
    pub element_id: String,
    #[prost(message, optional, tag = "2")]
    pub timestamp: Option<Timestamp>,
    #[prost(message, repeated, tag = "3")]
    pub tag_families: Vec<TagFamily>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryRequest {
    #[prost(string, repeated, tag = "1")]
    pub groups: Vec<String>,
    #[prost(string, tag = "2")]
    pub name: String,
    /// Optional; the default range is substituted when absent.
    #[prost(message, optional, tag = "3")]
    pub time_range: Option<TimeRange>,
    #[prost(uint32, tag = "4")]
    pub offset: u32,
    #[prost(uint32, tag = "5")]
    pub limit: u32,
    /// Lifecycle stages (e.g. "warm") used to pick serving nodes.
    #[prost(string, repeated, tag = "6")]
    pub stages: Vec<String>,
    #[prost(bool, tag = "7")]
    pub trace: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryResponse {
    #[prost(message, repeated, tag = "1")]
    pub elements: Vec<Element>,
    #[prost(message, optional, tag = "2")]
    pub trace: Option<Trace>,
}

// ============================================================================
// Trace
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct SpanTag {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Span {
    #[prost(message, optional, tag = "1")]
    pub start_time: Option<Timestamp>,
    #[prost(message, optional, tag = "2")]
    pub end_time: Option<Timestamp>,
    #[prost(bool, tag = "3")]
    pub error: bool,
    #[prost(message, repeated, tag = "4")]
    pub tags: Vec<SpanTag>,
    #[prost(string, tag = "5")]
    pub message: String,
    #[prost(message, repeated, tag = "6")]
    pub children: Vec<Span>,
    /// Duration in nanoseconds.
    #[prost(int64, tag = "7")]
    pub duration: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Trace {
    #[prost(string, tag = "1")]
    pub trace_id: String,
    #[prost(message, repeated, tag = "2")]
    pub spans: Vec<Span>,
    #[prost(bool, tag = "3")]
    pub error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn status_code_string_names() {
        assert_eq!(StatusCode::Succeed.as_str_name(), "STATUS_SUCCEED");
        assert_eq!(
            StatusCode::from_str_name("STATUS_EXPIRED_SCHEMA"),
            Some(StatusCode::ExpiredSchema)
        );
        assert_eq!(StatusCode::from_str_name("bogus"), None);
    }

    #[test]
    fn timestamp_from_millis_handles_negative() {
        let ts = Timestamp::from_millis(-1);
        assert_eq!(ts.seconds, -1);
        assert_eq!(ts.nanos, 999_000_000);
        assert_eq!(ts.as_nanos(), -1_000_000);
    }

    #[test]
    fn write_request_wire_compat() {
        let req = WriteRequest {
            metadata: Some(Metadata::new("sw", "log").with_mod_revision(3)),
            element: Some(ElementValue {
                element_id: "e1".into(),
                timestamp: Some(Timestamp::from_millis(1_700_000_000_000)),
                tag_families: vec![TagFamilyForWrite {
                    tags: vec![TagValue::str("svc"), TagValue::int(7)],
                }],
            }),
            message_id: 42,
        };
        let bytes = req.encode_to_vec();
        let decoded = WriteRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.group(), "sw");
    }

    #[test]
    fn write_response_carries_status_name() {
        let resp = WriteResponse::new(None, StatusCode::InvalidTimestamp, 9);
        assert_eq!(resp.status, "STATUS_INVALID_TIMESTAMP");
        assert_eq!(resp.status_code(), Some(StatusCode::InvalidTimestamp));
    }

    #[test]
    fn time_range_display() {
        let range = TimeRange::new(Timestamp::new(0, 0), Timestamp::new(60, 0));
        assert_eq!(range.to_string(), "[1970-01-01T00:00:00Z, 1970-01-01T00:01:00Z)");
        let open = TimeRange {
            begin: None,
            end: Some(Timestamp::new(60, 0)),
        };
        assert!(open.to_string().starts_with("[<nil>"));
    }
}
