//! Telemetry.
//!
//! Sampled logging for hot paths and the request tracer that queries attach
//! to their responses when the client asks for a trace.

use crate::core::time::now_timestamp;
use crate::proto;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Default sampling ratio for per-message write errors.
pub const DEFAULT_LOG_SAMPLE_EVERY: u64 = 10;

/// Admits one of every `every` log events.
///
/// A single misbehaving client can produce a rejection per message; sampling
/// keeps the error log readable without hiding that the errors exist.
#[derive(Debug)]
pub struct LogSampler {
    every: u64,
    seen: AtomicU64,
}

impl LogSampler {
    /// Create a sampler. `every` values of 0 and 1 both admit every event.
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            seen: AtomicU64::new(0),
        }
    }

    /// Whether the current event should be logged. The first event always is.
    pub fn sample(&self) -> bool {
        self.seen.fetch_add(1, Ordering::Relaxed) % self.every == 0
    }

    pub fn every(&self) -> u64 {
        self.every
    }
}

impl Default for LogSampler {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_SAMPLE_EVERY)
    }
}

/// Trace span for timing operations.
#[derive(Debug)]
pub struct Span {
    name: String,
    start: Instant,
    start_time: proto::Timestamp,
    tags: Vec<(String, String)>,
    error: Option<String>,
    children: Vec<proto::Span>,
}

impl Span {
    /// Create a new span.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
            start_time: now_timestamp(),
            tags: Vec::new(),
            error: None,
            children: Vec::new(),
        }
    }

    /// Add a tag.
    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.push((key.into(), value.into()));
    }

    /// Mark the span failed.
    pub fn error(&mut self, err: &dyn std::fmt::Display) {
        self.error = Some(err.to_string());
    }

    /// Adopt the spans of a downstream trace as children.
    pub fn add_sub_trace(&mut self, trace: Option<&proto::Trace>) {
        if let Some(trace) = trace {
            self.children.extend(trace.spans.iter().cloned());
        }
    }

    /// Get span name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get elapsed time.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// End the span.
    pub fn stop(self) -> proto::Span {
        let duration = self.elapsed();
        let mut tags: Vec<proto::SpanTag> = self
            .tags
            .into_iter()
            .map(|(key, value)| proto::SpanTag { key, value })
            .collect();
        if let Some(message) = &self.error {
            tags.push(proto::SpanTag {
                key: "error_msg".to_string(),
                value: message.clone(),
            });
        }
        proto::Span {
            start_time: Some(self.start_time),
            end_time: Some(now_timestamp()),
            error: self.error.is_some(),
            tags,
            message: self.name,
            children: self.children,
            duration: i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX),
        }
    }
}

/// Collects the spans of one traced request.
#[derive(Debug)]
pub struct Tracer {
    trace_id: String,
    spans: Vec<proto::Span>,
}

impl Tracer {
    /// Start a tracer. The id is the request's start time in RFC 3339.
    pub fn new() -> Self {
        let trace_id = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        Self::with_id(trace_id)
    }

    pub fn with_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            spans: Vec::new(),
        }
    }

    pub fn start_span(&self, name: impl Into<String>) -> Span {
        Span::new(name)
    }

    /// Record a finished span.
    pub fn finish(&mut self, span: Span) {
        self.spans.push(span.stop());
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn to_proto(&self) -> proto::Trace {
        proto::Trace {
            trace_id: self.trace_id.clone(),
            error: self.spans.iter().any(|s| s.error),
            spans: self.spans.clone(),
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}
