//! Write ingestion.
//!
//! Each write stream is driven by one task that processes requests strictly
//! in receipt order:
//!
//! ```text
//!  recv ─▶ timestamp ─▶ schema ─▶ resolve ─▶ locate ─▶ access log ─▶ publish
//!            │            │          │          │                      │
//!            └────────────┴──────────┴──────────┴── reply now ◀────────┤ rejected
//!                                                                      │ accepted
//!                                                        pending ◀─────┘
//!  stream end ─▶ close batch ─▶ reply every pending entry, in order
//! ```
//!
//! Every received request gets exactly one reply. Rejections are replied at
//! the point of detection; accepted requests are replied after the batch
//! closes, with the status their destination node reported (success when
//! the node is absent from the outcome map). The batch is closed on every
//! exit path: EOF, cancellation, deadline and receive failure.

use super::StreamService;
use crate::adapters::{InboundError, RequestContext};
use crate::bus::{BatchClose, BatchMessage, BatchScope, NodeId, PublishOutcome, Topic};
use crate::control::routing::ResolvedWrite;
use crate::control::schema::SchemaId;
use crate::core::error::{LiaisonError, LiaisonResult};
use crate::core::time::check_timestamp;
use crate::ops::observability::{LiaisonMetrics, RpcLabels};
use crate::ops::telemetry::LogSampler;
use crate::proto::{InternalWriteRequest, Metadata, StatusCode, WriteRequest, WriteResponse};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};

const RPC: RpcLabels = RpcLabels::STREAM_WRITE;

/// Outbound half of a write stream.
///
/// Carries replies, and finally the stream's terminal error if it ended
/// abnormally.
pub type ReplySender = mpsc::Sender<LiaisonResult<WriteResponse>>;

/// Sends replies and attributes them in metrics.
struct ReplySink<'a> {
    tx: ReplySender,
    metrics: &'a LiaisonMetrics,
}

impl ReplySink<'_> {
    async fn reply(
        &self,
        group: &str,
        metadata: Option<Metadata>,
        status: StatusCode,
        message_id: u64,
    ) {
        if !status.is_success() {
            self.metrics.msg_received_err(group, RPC);
        }
        let response = WriteResponse::new(metadata, status, message_id);
        if let Err(err) = self.tx.send(Ok(response)).await {
            tracing::debug!(error = %err, "failed to send stream write response");
            self.metrics.msg_sent_err(group, RPC);
        }
    }

    async fn fail(&self, err: LiaisonError) {
        // The client may already be gone.
        let _ = self.tx.send(Err(err)).await;
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// A request accepted into the batch, awaiting its deferred reply.
#[derive(Debug)]
struct PendingReply {
    metadata: Metadata,
    message_id: u64,
    node: NodeId,
}

/// State accumulated over one stream's lifetime.
struct WriteSession {
    batch: BatchScope,
    pending: Vec<PendingReply>,
}

impl WriteSession {
    /// Close the batch and emit every deferred reply in acceptance order.
    async fn finish(self, sink: &ReplySink<'_>, sampled: &LogSampler) {
        let BatchClose { outcomes, error } = self.batch.close().await;
        for pending in self.pending {
            let status = outcomes
                .get(&pending.node)
                .map(|failure| failure.status)
                .unwrap_or(StatusCode::Succeed);
            let group = pending.metadata.group.clone();
            sink.reply(&group, Some(pending.metadata), status, pending.message_id)
                .await;
        }
        if let Some(err) = error {
            if sampled.sample() {
                tracing::error!(error = %err, "failed to close the publisher");
            }
        }
    }
}

impl StreamService {
    /// Drive one write stream to completion.
    ///
    /// Returns `Ok` on client half-close. Cancellation, deadline expiry and
    /// receive failures end the stream with the matching error; in every case
    /// all accepted requests are replied before this returns.
    pub async fn write<S>(&self, ctx: RequestContext, inbound: S, replies: ReplySender) -> LiaisonResult<()>
    where
        S: Stream<Item = Result<WriteRequest, InboundError>> + Send,
    {
        self.metrics.stream_started(RPC);
        let start = Instant::now();

        let sink = ReplySink {
            tx: replies,
            metrics: &self.metrics,
        };
        let mut session = WriteSession {
            batch: BatchScope::new(self.pipeline.new_batch_publisher(self.write_timeout)),
            pending: Vec::new(),
        };

        let inbound = std::pin::pin!(inbound);
        let result = self.receive(&ctx, inbound, &sink, &mut session).await;

        session.finish(&sink, &self.sampled).await;
        if let Err(err) = &result {
            sink.fail(err.clone()).await;
        }

        self.metrics
            .stream_finished(RPC, start.elapsed().as_secs_f64());
        result
    }

    async fn receive<S>(
        &self,
        ctx: &RequestContext,
        mut inbound: std::pin::Pin<&mut S>,
        sink: &ReplySink<'_>,
        session: &mut WriteSession,
    ) -> LiaisonResult<()>
    where
        S: Stream<Item = Result<WriteRequest, InboundError>> + Send,
    {
        loop {
            let next = tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                _ = sink.closed() => return Err(LiaisonError::Cancelled),
                next = inbound.next() => next,
            };
            let request = match next {
                None => return Ok(()),
                Some(Ok(request)) => request,
                Some(Err(InboundError::Transport(message))) => {
                    if self.sampled.sample() {
                        tracing::error!(error = %message, "failed to receive message");
                    }
                    return Err(LiaisonError::Receive { message });
                }
                Some(Err(err)) => return Err(err.into()),
            };
            self.metrics.msg_received(request.group(), RPC);
            self.handle(request, sink, session).await;
        }
    }

    async fn handle(&self, request: WriteRequest, sink: &ReplySink<'_>, session: &mut WriteSession) {
        let group = request.group().to_string();
        let message_id = request.message_id;

        if let Err(err) = check_timestamp(request.timestamp()) {
            let err = LiaisonError::InvalidTimestamp(err);
            if self.sampled.sample() {
                tracing::error!(error = %err, written = ?request, "the element time is invalid");
            }
            sink.reply(&group, None, err.write_status(), message_id).await;
            return;
        }

        let metadata = request.metadata();
        let (node, resolved) = match self.route(&metadata, &request) {
            Ok(routed) => routed,
            Err(err) => {
                if self.sampled.sample() {
                    tracing::error!(error = %err, written = ?request, "failed to route the write");
                }
                sink.reply(&group, Some(metadata), err.write_status(), message_id)
                    .await;
                return;
            }
        };

        if let Some(log) = &self.access_log {
            if let Err(err) = log.write(&request) {
                if self.sampled.sample() {
                    tracing::error!(error = %err, "failed to write ingestion access log");
                }
            }
        }

        let payload = InternalWriteRequest {
            shard_id: resolved.shard_id,
            series_hash: resolved.series_hash,
            entity_values: resolved.entity_values,
            request: Some(request),
        };
        let outcome = session
            .batch
            .publish(Topic::StreamWrite, BatchMessage::new(node.clone(), payload))
            .await;
        match outcome {
            PublishOutcome::Accepted => session.pending.push(PendingReply {
                metadata,
                message_id,
                node,
            }),
            PublishOutcome::Rejected { status, message } => {
                tracing::debug!(node = %node, status = %status, message = %message, "publish rejected");
                sink.reply(&group, Some(metadata), status, message_id).await;
            }
            PublishOutcome::Failed(err) => {
                if self.sampled.sample() {
                    tracing::error!(error = %err, node = %node, message_id, "failed to send a message");
                }
                sink.reply(&group, Some(metadata), StatusCode::InternalError, message_id)
                    .await;
            }
        }
    }

    /// Schema check, resolution and node lookup.
    fn route(&self, metadata: &Metadata, request: &WriteRequest) -> LiaisonResult<(NodeId, ResolvedWrite)> {
        self.check_schema(metadata)?;
        let resolved = self
            .registries
            .resolver
            .resolve(metadata, request.tag_families())?;
        let node = self
            .registries
            .nodes
            .locate(&metadata.group, &metadata.name, resolved.shard_id)?;
        Ok((node, resolved))
    }

    /// A zero revision opts out of the check.
    fn check_schema(&self, metadata: &Metadata) -> LiaisonResult<()> {
        if metadata.mod_revision <= 0 {
            return Ok(());
        }
        let id = SchemaId::from(metadata);
        let locator = self
            .registries
            .schemas
            .lookup(&id)
            .ok_or_else(|| LiaisonError::SchemaNotFound {
                group: id.group.clone(),
                name: id.name.clone(),
            })?;
        if locator.mod_revision != metadata.mod_revision {
            return Err(LiaisonError::SchemaExpired {
                group: id.group,
                name: id.name,
                cached: locator.mod_revision,
                requested: metadata.mod_revision,
            });
        }
        Ok(())
    }
}
