//! Message bus contracts.
//!
//! The liaison never talks to data nodes directly. Writes go through a
//! [`BatchPublisher`] bound to one client stream, and queries go through a
//! [`Broadcaster`] that fans one logical message out to every eligible node and
//! hands back a single [`QueryFuture`].
//!
//! ```text
//!  write stream ──publish──▶ BatchPublisher ──(buffered)──▶ nodes
//!                 ◀──close── NodeOutcomes (node → failure)
//!
//!  query ──publish──▶ Broadcaster ──▶ nodes ──merge──▶ QueryFuture::get
//! ```
//!
//! Implementations must tolerate many concurrent streams and queries; a
//! `BatchPublisher` itself is owned by exactly one stream task.

pub mod local;

use crate::proto::{InternalWriteRequest, QueryRequest, QueryResponse, StatusCode, TimeRange};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Boxed future used at the trait seams, as the adapters do.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Identifier of a data node.
pub type NodeId = String;

// ============================================================================
// Message identity
// ============================================================================

/// Bus message identifier. Strictly increasing within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates message ids seeded from wall-clock nanoseconds.
///
/// Two ids drawn in the same nanosecond (or after a clock step backwards)
/// still come out strictly increasing.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    last: AtomicU64,
}

impl MessageIdGenerator {
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> MessageId {
        let now = crate::core::time::now_nanos();
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return MessageId(candidate),
                Err(observed) => current = observed,
            }
        }
    }
}

static MESSAGE_IDS: MessageIdGenerator = MessageIdGenerator::new();

/// Draw the next process-wide message id.
pub fn next_message_id() -> MessageId {
    MESSAGE_IDS.next()
}

/// Bus topics served by data nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    StreamWrite,
    StreamQuery,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StreamWrite => "stream-write",
            Self::StreamQuery => "stream-query",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A write addressed to exactly one node.
#[derive(Debug, Clone)]
pub struct BatchMessage {
    pub id: MessageId,
    pub node: NodeId,
    pub payload: InternalWriteRequest,
}

impl BatchMessage {
    pub fn new(node: impl Into<NodeId>, payload: InternalWriteRequest) -> Self {
        Self {
            id: next_message_id(),
            node: node.into(),
            payload,
        }
    }
}

/// Per-group candidate nodes. `None` means every node is eligible.
pub type NodeSelectors = BTreeMap<String, Option<Vec<String>>>;

/// One logical query addressed to several groups' node selectors.
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub id: MessageId,
    pub node_selectors: NodeSelectors,
    pub time_range: TimeRange,
    pub payload: QueryRequest,
}

impl QueryMessage {
    pub fn new(node_selectors: NodeSelectors, time_range: TimeRange, payload: QueryRequest) -> Self {
        Self {
            id: next_message_id(),
            node_selectors,
            time_range,
            payload,
        }
    }
}

// ============================================================================
// Outcomes and errors
// ============================================================================

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The transport has nothing more to deliver; queries treat this as empty.
    #[error("no further input")]
    NoMoreInput,

    /// The publisher or future was closed before completion.
    #[error("bus closed")]
    Closed,

    #[error("bus operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("bus unavailable: {message}")]
    Unavailable { message: String },

    #[error("transport error: {message}")]
    Transport { message: String },
}

/// The failure a node reported for the messages it was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub status: StatusCode,
    pub message: String,
}

impl NodeFailure {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Failures by node, produced once when a batch closes. Nodes without an
/// entry are treated as having succeeded.
pub type NodeOutcomes = HashMap<NodeId, NodeFailure>;

/// Result of handing one message to a batch, decided where the failure happens.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// Buffered; its fate is reported when the batch closes.
    Accepted,
    /// Refused with an explicit status that should be reported as-is.
    Rejected { status: StatusCode, message: String },
    /// Refused for an opaque reason.
    Failed(BusError),
}

/// What closing a batch produced.
#[derive(Debug, Default)]
pub struct BatchClose {
    pub outcomes: NodeOutcomes,
    /// Close-level failure, reported alongside the outcome map.
    pub error: Option<BusError>,
}

// ============================================================================
// Publishers
// ============================================================================

/// Buffering sink bound to one stream.
///
/// `publish` may return before delivery. `close` consumes the publisher, so
/// it can run at most once and nothing can be published afterwards.
pub trait BatchPublisher: Send {
    fn publish(&mut self, topic: Topic, message: BatchMessage) -> BoxFuture<'_, PublishOutcome>;

    /// Wait for every buffered message to be acknowledged or failed.
    fn close(self: Box<Self>) -> BoxFuture<'static, BatchClose>;
}

/// Source of batch publishers.
pub trait Pipeline: Send + Sync {
    fn new_batch_publisher(&self, timeout: Duration) -> Box<dyn BatchPublisher>;
}

/// Fans one query out and merges the replies.
pub trait Broadcaster: Send + Sync {
    fn publish(
        &self,
        topic: Topic,
        message: QueryMessage,
    ) -> BoxFuture<'_, Result<QueryFuture, BusError>>;
}

/// Merged payload of a broadcast query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryData {
    Response(QueryResponse),
    /// A node answered with a domain error.
    Error { status: StatusCode, message: String },
}

// ============================================================================
// Single-shot result handle
// ============================================================================

/// Handle to a query result that is not available yet.
#[derive(Debug)]
pub struct QueryFuture {
    rx: oneshot::Receiver<Result<QueryData, BusError>>,
}

/// Completing side of a [`QueryFuture`].
#[derive(Debug)]
pub struct QueryPromise {
    tx: oneshot::Sender<Result<QueryData, BusError>>,
}

impl QueryFuture {
    /// Create an unresolved future and the promise that resolves it.
    pub fn pending() -> (QueryPromise, QueryFuture) {
        let (tx, rx) = oneshot::channel();
        (QueryPromise { tx }, QueryFuture { rx })
    }

    /// A future that is already resolved.
    pub fn ready(result: Result<QueryData, BusError>) -> Self {
        let (promise, future) = Self::pending();
        promise.fulfil(result);
        future
    }

    /// Wait for the result. A dropped promise reads as [`BusError::Closed`].
    pub async fn get(self) -> Result<QueryData, BusError> {
        self.rx.await.unwrap_or(Err(BusError::Closed))
    }
}

impl QueryPromise {
    /// Resolve the future. Ignored if the waiter has gone away.
    pub fn fulfil(self, result: Result<QueryData, BusError>) {
        let _ = self.tx.send(result);
    }

    /// Whether anyone is still waiting.
    pub fn is_waiting(&self) -> bool {
        !self.tx.is_closed()
    }
}

// ============================================================================
// Scoped batch
// ============================================================================

/// Owns a stream's batch publisher and guarantees it gets closed.
///
/// The normal path calls [`BatchScope::close`]. If the scope is dropped while
/// still holding the publisher (a panic unwinding through the stream task),
/// the close is spawned onto the current runtime so the batch is not leaked.
pub struct BatchScope {
    publisher: Option<Box<dyn BatchPublisher>>,
}

impl BatchScope {
    pub fn new(publisher: Box<dyn BatchPublisher>) -> Self {
        Self {
            publisher: Some(publisher),
        }
    }

    /// Publish through the scoped batch.
    pub async fn publish(&mut self, topic: Topic, message: BatchMessage) -> PublishOutcome {
        match self.publisher.as_mut() {
            Some(publisher) => publisher.publish(topic, message).await,
            None => PublishOutcome::Failed(BusError::Closed),
        }
    }

    /// Close the batch and return its outcomes.
    pub async fn close(mut self) -> BatchClose {
        match self.publisher.take() {
            Some(publisher) => publisher.close().await,
            None => BatchClose {
                outcomes: NodeOutcomes::new(),
                error: Some(BusError::Closed),
            },
        }
    }
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        let Some(publisher) = self.publisher.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!("batch scope dropped without close; closing in background");
                handle.spawn(async move {
                    let closed = publisher.close().await;
                    if let Some(err) = closed.error {
                        tracing::error!(error = %err, "background batch close failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!("batch scope dropped outside a runtime; batch leaked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn message_ids_strictly_increase() {
        let generator = MessageIdGenerator::new();
        let mut last = generator.next();
        for _ in 0..10_000 {
            let id = generator.next();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn topic_names() {
        assert_eq!(Topic::StreamWrite.to_string(), "stream-write");
        assert_eq!(Topic::StreamQuery.as_str(), "stream-query");
    }

    #[tokio::test]
    async fn query_future_resolves() {
        let (promise, future) = QueryFuture::pending();
        assert!(promise.is_waiting());
        promise.fulfil(Ok(QueryData::Response(QueryResponse::default())));
        assert_eq!(
            future.get().await,
            Ok(QueryData::Response(QueryResponse::default()))
        );
    }

    #[tokio::test]
    async fn dropped_promise_reads_closed() {
        let (promise, future) = QueryFuture::pending();
        drop(promise);
        assert_eq!(future.get().await, Err(BusError::Closed));
    }

    struct CountingPublisher {
        closes: Arc<AtomicUsize>,
    }

    impl BatchPublisher for CountingPublisher {
        fn publish(&mut self, _topic: Topic, _message: BatchMessage) -> BoxFuture<'_, PublishOutcome> {
            Box::pin(async { PublishOutcome::Accepted })
        }

        fn close(self: Box<Self>) -> BoxFuture<'static, BatchClose> {
            let closes = Arc::clone(&self.closes);
            Box::pin(async move {
                closes.fetch_add(1, Ordering::SeqCst);
                BatchClose::default()
            })
        }
    }

    #[tokio::test]
    async fn scope_closes_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let scope = BatchScope::new(Box::new(CountingPublisher {
            closes: Arc::clone(&closes),
        }));
        let closed = scope.close().await;
        assert!(closed.error.is_none());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_scope_closes_in_background() {
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let _scope = BatchScope::new(Box::new(CountingPublisher {
                closes: Arc::clone(&closes),
            }));
        }
        for _ in 0..10 {
            if closes.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
