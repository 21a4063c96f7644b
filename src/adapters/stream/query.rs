//! Query broadcast.
//!
//! A query is validated, addressed to the node selectors of every requested
//! group, published once, and answered from the single merged result. The
//! only suspension point is the wait on that result, and it ends early when
//! the caller cancels or its deadline passes.

use super::StreamService;
use crate::adapters::RequestContext;
use crate::bus::{BusError, NodeSelectors, QueryData, QueryMessage, Topic};
use crate::core::error::{LiaisonError, LiaisonResult};
use crate::core::time::{check_time_range, default_time_range};
use crate::ops::observability::RpcLabels;
use crate::ops::telemetry::Tracer;
use crate::proto::{QueryRequest, QueryResponse, TimeRange};
use std::time::Instant;

const RPC: RpcLabels = RpcLabels::STREAM_QUERY;

impl StreamService {
    /// Serve one query.
    pub async fn query(&self, ctx: &RequestContext, request: QueryRequest) -> LiaisonResult<QueryResponse> {
        for group in &request.groups {
            self.metrics.call_started(group, RPC);
        }
        let start = Instant::now();
        let groups = request.groups.clone();

        let result = self.traced_query(ctx, request).await;

        let latency = start.elapsed().as_secs_f64();
        for group in &groups {
            self.metrics
                .call_finished(group, RPC, latency, result.is_err());
        }
        if let Err(err) = &result {
            if !err.is_cancellation() {
                tracing::warn!(error = %err, groups = ?groups, "query failed");
            }
        }
        result
    }

    async fn traced_query(&self, ctx: &RequestContext, mut request: QueryRequest) -> LiaisonResult<QueryResponse> {
        let time_range = *request.time_range.get_or_insert_with(default_time_range);
        check_time_range(&time_range)
            .map_err(|reason| LiaisonError::InvalidTimeRange { range: time_range, reason })?;

        if !request.trace {
            return Ok(self.dispatch(ctx, request, time_range).await?.unwrap_or_default());
        }

        let mut tracer = Tracer::new();
        let mut span = tracer.start_span("stream-grpc");
        span.tag("request", format!("{:?}", request));
        let result = self.dispatch(ctx, request, time_range).await;
        match result {
            Ok(Some(mut response)) => {
                span.add_sub_trace(response.trace.as_ref());
                tracer.finish(span);
                response.trace = Some(tracer.to_proto());
                Ok(response)
            }
            Ok(None) => {
                tracer.finish(span);
                Ok(QueryResponse::default())
            }
            Err(err) => {
                span.error(&err);
                tracer.finish(span);
                tracing::debug!(trace_id = tracer.trace_id(), error = %err, "traced query failed");
                Err(err)
            }
        }
    }

    /// Publish and await. `None` means the transport had no further input.
    async fn dispatch(
        &self,
        ctx: &RequestContext,
        request: QueryRequest,
        time_range: TimeRange,
    ) -> LiaisonResult<Option<QueryResponse>> {
        let selectors: NodeSelectors = request
            .groups
            .iter()
            .map(|group| {
                let selector = self.registries.groups.node_selector(group, &request.stages);
                (group.clone(), selector)
            })
            .collect();

        let message = QueryMessage::new(selectors, time_range, request);
        let future = match ctx
            .run(self.broadcaster.publish(Topic::StreamQuery, message))
            .await?
        {
            Ok(future) => future,
            Err(BusError::NoMoreInput) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let data = match ctx
            .run(tokio::time::timeout(self.query_timeout, future.get()))
            .await?
        {
            Ok(Ok(data)) => data,
            Ok(Err(BusError::NoMoreInput)) => return Ok(None),
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(LiaisonError::Bus(BusError::Timeout {
                    elapsed_ms: self.query_timeout.as_millis() as u64,
                }))
            }
        };

        match data {
            QueryData::Response(response) => Ok(Some(response)),
            QueryData::Error { status, message } => Err(LiaisonError::QueryFailed { status, message }),
        }
    }
}
