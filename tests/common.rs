//! Common test utilities.
//!
//! Scripted transport fakes and registry builders shared by the integration
//! tests. Import with `mod common;` in test files.

#![allow(dead_code)]

use liaison::adapters::stream::{Registries, StreamService};
use liaison::adapters::{InboundError, RequestContext};
use liaison::bus::{
    BatchClose, BatchMessage, BatchPublisher, BoxFuture, Broadcaster, BusError, NodeFailure,
    NodeOutcomes, Pipeline, PublishOutcome, QueryData, QueryFuture, QueryMessage, QueryPromise,
    Topic,
};
use liaison::control::groups::{GroupEvent, GroupRepository, GroupSpec, StageSpec};
use liaison::control::placement::{NodeInfo, NodeTable};
use liaison::control::routing::EntityResolver;
use liaison::control::schema::{EntityRepository, SchemaEvent, StreamSchema, TagFamilySpec};
use liaison::core::error::{LiaisonError, LiaisonResult};
use liaison::proto::{
    ElementValue, Metadata, StatusCode, TagFamilyForWrite, TagValue, Timestamp, WriteRequest,
    WriteResponse,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const GROUP: &str = "sw";
pub const STREAM: &str = "log";
pub const REVISION: i64 = 1;
pub const NODE: &str = "n1";

/// A valid element time.
pub const NOW_MILLIS: i64 = 1_700_000_000_000;

// ============================================================================
// Registries
// ============================================================================

/// Registries with group `sw` (2 shards, a `warm` stage), stream `sw/log`
/// at revision 1 and the given data nodes.
pub fn registries(nodes: &[&str]) -> Registries {
    let schemas = Arc::new(EntityRepository::new());
    schemas
        .apply(SchemaEvent::Upsert(StreamSchema {
            group: GROUP.to_string(),
            name: STREAM.to_string(),
            mod_revision: REVISION,
            tag_families: vec![TagFamilySpec {
                name: "default".to_string(),
                tags: vec!["service_id".to_string(), "trace_id".to_string()],
            }],
            entity: vec!["service_id".to_string()],
        }))
        .expect("schema is valid");

    let groups = Arc::new(GroupRepository::new());
    groups.apply(GroupEvent::Upsert(GroupSpec {
        name: GROUP.to_string(),
        shard_num: 2,
        stages: vec![StageSpec {
            name: "warm".to_string(),
            node_selector: "type=warm".to_string(),
        }],
    }));

    let table = Arc::new(NodeTable::new());
    for node in nodes {
        table.register(NodeInfo::new(*node));
    }

    let resolver = Arc::new(EntityResolver::new(schemas.clone(), groups.clone()));
    Registries {
        schemas,
        groups,
        nodes: table,
        resolver,
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A write against `sw/log` with the given revision and element time.
pub fn write_at(message_id: u64, mod_revision: i64, timestamp: Timestamp) -> WriteRequest {
    WriteRequest {
        metadata: Some(Metadata::new(GROUP, STREAM).with_mod_revision(mod_revision)),
        element: Some(ElementValue {
            element_id: format!("e{}", message_id),
            timestamp: Some(timestamp),
            tag_families: vec![TagFamilyForWrite {
                tags: vec![TagValue::str("svc-1"), TagValue::str("trace-1")],
            }],
        }),
        message_id,
    }
}

/// A valid write at the current schema revision.
pub fn write(message_id: u64) -> WriteRequest {
    write_at(message_id, REVISION, Timestamp::from_millis(NOW_MILLIS))
}

// ============================================================================
// Scripted pipeline
// ============================================================================

/// Pipeline whose publishers record every message and answer from a script.
#[derive(Clone, Default)]
pub struct ScriptedPipeline {
    inner: Arc<PipelineState>,
}

#[derive(Default)]
struct PipelineState {
    published: Mutex<Vec<BatchMessage>>,
    outcomes: Mutex<HashMap<u64, PublishOutcome>>,
    close_outcomes: Mutex<NodeOutcomes>,
    close_error: Mutex<Option<BusError>>,
    closes: AtomicUsize,
    timeouts: Mutex<Vec<Duration>>,
}

impl ScriptedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the publish of `message_id` with `outcome` instead of accepting it.
    pub fn script(&self, message_id: u64, outcome: PublishOutcome) {
        self.inner.outcomes.lock().insert(message_id, outcome);
    }

    /// Report `node` as failed with `status` when the batch closes.
    pub fn fail_node(&self, node: &str, status: StatusCode) {
        self.inner
            .close_outcomes
            .lock()
            .insert(node.to_string(), NodeFailure::new(status, "scripted failure"));
    }

    pub fn fail_close(&self, err: BusError) {
        *self.inner.close_error.lock() = Some(err);
    }

    pub fn published(&self) -> Vec<BatchMessage> {
        self.inner.published.lock().clone()
    }

    pub fn published_count(&self) -> usize {
        self.inner.published.lock().len()
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.inner.timeouts.lock().clone()
    }
}

impl Pipeline for ScriptedPipeline {
    fn new_batch_publisher(&self, timeout: Duration) -> Box<dyn BatchPublisher> {
        self.inner.timeouts.lock().push(timeout);
        Box::new(ScriptedPublisher {
            state: Arc::clone(&self.inner),
        })
    }
}

struct ScriptedPublisher {
    state: Arc<PipelineState>,
}

impl BatchPublisher for ScriptedPublisher {
    fn publish(&mut self, _topic: Topic, message: BatchMessage) -> BoxFuture<'_, PublishOutcome> {
        Box::pin(async move {
            let message_id = message
                .payload
                .request
                .as_ref()
                .map(|r| r.message_id)
                .unwrap_or_default();
            self.state.published.lock().push(message);
            self.state
                .outcomes
                .lock()
                .get(&message_id)
                .cloned()
                .unwrap_or(PublishOutcome::Accepted)
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, BatchClose> {
        Box::pin(async move {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
            BatchClose {
                outcomes: self.state.close_outcomes.lock().clone(),
                error: self.state.close_error.lock().clone(),
            }
        })
    }
}

// ============================================================================
// Scripted broadcaster
// ============================================================================

/// How the broadcaster answers the next query.
#[derive(Debug, Clone)]
pub enum Reply {
    Data(QueryData),
    /// The handle resolves with a transport error.
    Fail(BusError),
    /// `publish` itself fails.
    Refuse(BusError),
    /// The handle never resolves.
    Hang,
}

/// Broadcaster that records each message and answers with a fixed reply.
#[derive(Clone)]
pub struct ScriptedBroadcaster {
    reply: Arc<Mutex<Reply>>,
    messages: Arc<Mutex<Vec<QueryMessage>>>,
    held: Arc<Mutex<Vec<QueryPromise>>>,
}

impl ScriptedBroadcaster {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply: Arc::new(Mutex::new(reply)),
            messages: Arc::new(Mutex::new(Vec::new())),
            held: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn messages(&self) -> Vec<QueryMessage> {
        self.messages.lock().clone()
    }

    /// Whether a hung handle has been abandoned by its waiter.
    pub fn abandoned(&self) -> bool {
        self.held.lock().iter().all(|p| !p.is_waiting())
    }
}

impl Broadcaster for ScriptedBroadcaster {
    fn publish(
        &self,
        _topic: Topic,
        message: QueryMessage,
    ) -> BoxFuture<'_, Result<QueryFuture, BusError>> {
        Box::pin(async move {
            self.messages.lock().push(message);
            let reply = self.reply.lock().clone();
            match reply {
                Reply::Data(data) => Ok(QueryFuture::ready(Ok(data))),
                Reply::Fail(err) => Ok(QueryFuture::ready(Err(err))),
                Reply::Refuse(err) => Err(err),
                Reply::Hang => {
                    let (promise, future) = QueryFuture::pending();
                    self.held.lock().push(promise);
                    Ok(future)
                }
            }
        })
    }
}

// ============================================================================
// Service
// ============================================================================

/// A stream service over the standard registries and the given fakes.
pub fn service(
    nodes: &[&str],
    pipeline: &ScriptedPipeline,
    broadcaster: &ScriptedBroadcaster,
) -> StreamService {
    StreamService::new(
        registries(nodes),
        Arc::new(pipeline.clone()),
        Arc::new(broadcaster.clone()),
    )
}

/// Run a write stream over `requests` to completion and collect every item
/// sent back, the terminal error included.
pub async fn run_write(
    service: &StreamService,
    requests: Vec<Result<WriteRequest, InboundError>>,
) -> (LiaisonResult<()>, Vec<LiaisonResult<WriteResponse>>) {
    let (tx, mut rx) = mpsc::channel(requests.len() + 1);
    let result = service
        .write(RequestContext::new(), tokio_stream::iter(requests), tx)
        .await;
    let mut replies = Vec::new();
    while let Some(item) = rx.recv().await {
        replies.push(item);
    }
    (result, replies)
}

/// `(message_id, status)` of each successful reply.
pub fn statuses(replies: &[LiaisonResult<WriteResponse>]) -> Vec<(u64, StatusCode)> {
    replies
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|r| (r.message_id, r.status_code().unwrap_or(StatusCode::Unspecified)))
        .collect()
}

/// The terminal error, if the stream ended with one.
pub fn terminal_error(replies: &[LiaisonResult<WriteResponse>]) -> Option<&LiaisonError> {
    replies.iter().find_map(|r| r.as_ref().err())
}
