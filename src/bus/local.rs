//! In-process transport.
//!
//! `LocalBus` delivers messages to [`NodeHandler`]s registered per node id.
//! It backs the embedded runtime and the integration tests: writes are
//! buffered per batch and flushed every `batch_size` messages or at close,
//! and queries are fanned out to every node matching the message's node
//! selectors, then merged into one response.

use super::{
    BatchClose, BatchMessage, BatchPublisher, BoxFuture, Broadcaster, BusError, NodeFailure,
    NodeId, NodeOutcomes, NodeSelectors, Pipeline, PublishOutcome, QueryData, QueryFuture,
    QueryMessage, Topic,
};
use crate::control::groups::matches_selector;
use crate::proto::{QueryRequest, QueryResponse, StatusCode, Trace};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Receives messages addressed to one node.
pub trait NodeHandler: Send + Sync {
    fn write(&self, topic: Topic, message: BatchMessage) -> BoxFuture<'_, Result<(), NodeFailure>>;

    fn query(&self, topic: Topic, request: QueryRequest) -> BoxFuture<'_, Result<QueryData, BusError>>;
}

struct LocalNode {
    labels: BTreeMap<String, String>,
    handler: Arc<dyn NodeHandler>,
}

struct LocalBusInner {
    nodes: RwLock<BTreeMap<NodeId, LocalNode>>,
    batch_size: usize,
}

impl LocalBusInner {
    fn handler(&self, node: &str) -> Option<Arc<dyn NodeHandler>> {
        self.nodes.read().get(node).map(|n| Arc::clone(&n.handler))
    }

    /// Nodes eligible under any group's selectors, in id order.
    fn select(&self, selectors: &NodeSelectors) -> Vec<(NodeId, Arc<dyn NodeHandler>)> {
        let nodes = self.nodes.read();
        nodes
            .iter()
            .filter(|(_, node)| {
                selectors.is_empty()
                    || selectors.values().any(|selector| match selector {
                        None => true,
                        Some(list) => list.iter().any(|s| matches_selector(s, &node.labels)),
                    })
            })
            .map(|(id, node)| (id.clone(), Arc::clone(&node.handler)))
            .collect()
    }
}

/// In-process bus.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

impl LocalBus {
    pub fn new(batch_size: usize) -> Self {
        Self {
            inner: Arc::new(LocalBusInner {
                nodes: RwLock::new(BTreeMap::new()),
                batch_size: batch_size.max(1),
            }),
        }
    }

    /// Register (or replace) the handler for a node.
    pub fn register(
        &self,
        node: impl Into<NodeId>,
        labels: BTreeMap<String, String>,
        handler: Arc<dyn NodeHandler>,
    ) {
        self.inner
            .nodes
            .write()
            .insert(node.into(), LocalNode { labels, handler });
    }

    pub fn deregister(&self, node: &str) {
        self.inner.nodes.write().remove(node);
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.inner.nodes.read().keys().cloned().collect()
    }
}

impl Pipeline for LocalBus {
    fn new_batch_publisher(&self, timeout: Duration) -> Box<dyn BatchPublisher> {
        Box::new(LocalBatchPublisher {
            inner: Arc::clone(&self.inner),
            timeout,
            buffer: Vec::new(),
            outcomes: NodeOutcomes::new(),
            error: None,
        })
    }
}

struct LocalBatchPublisher {
    inner: Arc<LocalBusInner>,
    timeout: Duration,
    buffer: Vec<(Topic, BatchMessage)>,
    outcomes: NodeOutcomes,
    error: Option<BusError>,
}

impl LocalBatchPublisher {
    async fn flush(&mut self) {
        for (topic, message) in std::mem::take(&mut self.buffer) {
            let node = message.node.clone();
            if self.outcomes.contains_key(&node) {
                // Only the first failure per node is reported.
                continue;
            }
            let failure = match self.inner.handler(&node) {
                None => Some(NodeFailure::new(
                    StatusCode::InternalError,
                    format!("node {} left before delivery", node),
                )),
                Some(handler) => {
                    match tokio::time::timeout(self.timeout, handler.write(topic, message)).await {
                        Ok(Ok(())) => None,
                        Ok(Err(failure)) => Some(failure),
                        Err(_) => {
                            let elapsed_ms = self.timeout.as_millis() as u64;
                            self.error.get_or_insert(BusError::Timeout { elapsed_ms });
                            Some(NodeFailure::new(
                                StatusCode::InternalError,
                                format!("write to {} timed out", node),
                            ))
                        }
                    }
                }
            };
            if let Some(failure) = failure {
                tracing::debug!(node = %node, status = %failure.status, message = %failure.message, "node failed batch");
                self.outcomes.insert(node, failure);
            }
        }
    }
}

impl BatchPublisher for LocalBatchPublisher {
    fn publish(&mut self, topic: Topic, message: BatchMessage) -> BoxFuture<'_, PublishOutcome> {
        Box::pin(async move {
            if self.inner.handler(&message.node).is_none() {
                return PublishOutcome::Rejected {
                    status: StatusCode::NotFound,
                    message: format!("node {} is not registered", message.node),
                };
            }
            self.buffer.push((topic, message));
            if self.buffer.len() >= self.inner.batch_size {
                self.flush().await;
            }
            PublishOutcome::Accepted
        })
    }

    fn close(mut self: Box<Self>) -> BoxFuture<'static, BatchClose> {
        Box::pin(async move {
            self.flush().await;
            BatchClose {
                outcomes: std::mem::take(&mut self.outcomes),
                error: self.error.take(),
            }
        })
    }
}

impl Broadcaster for LocalBus {
    fn publish(
        &self,
        topic: Topic,
        message: QueryMessage,
    ) -> BoxFuture<'_, Result<QueryFuture, BusError>> {
        Box::pin(async move {
            let targets = self.inner.select(&message.node_selectors);
            if targets.is_empty() {
                return Err(BusError::NoMoreInput);
            }
            let (promise, future) = QueryFuture::pending();
            let request = message.payload;
            tokio::spawn(async move {
                promise.fulfil(gather(topic, request, targets).await);
            });
            Ok(future)
        })
    }
}

async fn gather(
    topic: Topic,
    request: QueryRequest,
    targets: Vec<(NodeId, Arc<dyn NodeHandler>)>,
) -> Result<QueryData, BusError> {
    let mut merged = QueryResponse::default();
    let mut spans = Vec::new();
    let mut answered = false;
    for (node, handler) in targets {
        match handler.query(topic, request.clone()).await {
            Ok(QueryData::Response(response)) => {
                answered = true;
                merged.elements.extend(response.elements);
                if let Some(trace) = response.trace {
                    spans.extend(trace.spans);
                }
            }
            Ok(error @ QueryData::Error { .. }) => return Ok(error),
            Err(BusError::NoMoreInput) => {}
            Err(err) => {
                tracing::debug!(node = %node, error = %err, "query fan-out failed");
                return Err(err);
            }
        }
    }
    if !answered {
        return Err(BusError::NoMoreInput);
    }
    if !spans.is_empty() {
        merged.trace = Some(Trace {
            trace_id: String::new(),
            error: spans.iter().any(|s| s.error),
            spans,
        });
    }
    Ok(QueryData::Response(merged))
}

/// Handler that acknowledges every write and answers queries with no
/// elements. Used by the embedded runtime.
#[derive(Debug, Default)]
pub struct AckingNode {
    writes: AtomicU64,
    queries: AtomicU64,
}

impl AckingNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }
}

impl NodeHandler for AckingNode {
    fn write(&self, _topic: Topic, _message: BatchMessage) -> BoxFuture<'_, Result<(), NodeFailure>> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        Box::pin(async { Ok(()) })
    }

    fn query(&self, _topic: Topic, _request: QueryRequest) -> BoxFuture<'_, Result<QueryData, BusError>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        Box::pin(async { Ok(QueryData::Response(QueryResponse::default())) })
    }
}
