//! gRPC binding for the stream service.
//!
//! `StreamServiceServer` is a hand-written tonic service in the shape of
//! generated code: it routes by path to a streaming handler for `Write` and a
//! unary handler for `Query`, both using the prost codec.

use super::proto::{QueryRequest, QueryResponse, WriteRequest, WriteResponse};
use super::StreamService;
use crate::adapters::{parse_grpc_timeout, InboundError, RequestContext};
use crate::core::error::{liaison_error_to_status, LiaisonError, LiaisonResult};
use bytes::Bytes;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

/// Fully qualified service name.
pub const SERVICE_NAME: &str = "liaison.stream.v1.StreamService";

const WRITE_PATH: &str = "/liaison.stream.v1.StreamService/Write";
const QUERY_PATH: &str = "/liaison.stream.v1.StreamService/Query";

/// Replies buffered per write stream before the worker waits on the client.
const REPLY_BUFFER: usize = 128;

type BoxFuture<T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'static>>;

/// Outbound stream of a `Write` call.
pub type WriteResponseStream = Pin<Box<dyn Stream<Item = Result<WriteResponse, Status>> + Send>>;

fn context_from(metadata: &tonic::metadata::MetadataMap) -> RequestContext {
    let ctx = RequestContext::new();
    match metadata
        .get("grpc-timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_grpc_timeout)
    {
        Some(timeout) => ctx.with_timeout(timeout),
        None => ctx,
    }
}

fn inbound_error(status: Status) -> InboundError {
    match status.code() {
        tonic::Code::Cancelled => InboundError::Cancelled,
        tonic::Code::DeadlineExceeded => InboundError::DeadlineExceeded,
        _ => InboundError::Transport(status.to_string()),
    }
}

fn outbound(item: LiaisonResult<WriteResponse>) -> Result<WriteResponse, Status> {
    item.map_err(liaison_error_to_status)
}

/// Start a write stream: spawn its worker and hand back the reply stream.
fn start_write(
    service: Arc<StreamService>,
    request: Request<Streaming<WriteRequest>>,
) -> Response<WriteResponseStream> {
    let ctx = context_from(request.metadata());
    let inbound = request
        .into_inner()
        .map(|item: Result<WriteRequest, Status>| item.map_err(inbound_error));
    let (tx, rx) = mpsc::channel(REPLY_BUFFER);

    tokio::spawn(async move {
        match service.write(ctx, inbound, tx).await {
            Ok(()) => {}
            Err(err) if err.is_cancellation() => {
                tracing::debug!(error = %err, "write stream ended by the client");
            }
            Err(err) => tracing::debug!(error = %err, "write stream aborted"),
        }
    });

    let stream = ReceiverStream::new(rx).map(outbound);
    Response::new(Box::pin(stream) as WriteResponseStream)
}

async fn serve_query(
    service: Arc<StreamService>,
    request: Request<QueryRequest>,
) -> Result<Response<QueryResponse>, Status> {
    let ctx = context_from(request.metadata());
    service
        .query(&ctx, request.into_inner())
        .await
        .map(Response::new)
        .map_err(liaison_error_to_status)
}

// ============================================================================
// Tonic Service Wrapper
// ============================================================================

/// Tonic service for [`StreamService`].
#[derive(Clone)]
pub struct StreamServiceServer {
    inner: Arc<StreamService>,
}

impl StreamServiceServer {
    pub fn new(inner: Arc<StreamService>) -> Self {
        Self { inner }
    }
}

impl tonic::server::NamedService for StreamServiceServer {
    const NAME: &'static str = SERVICE_NAME;
}

struct WriteSvc(Arc<StreamService>);

impl tonic::server::StreamingService<WriteRequest> for WriteSvc {
    type Response = WriteResponse;
    type ResponseStream = WriteResponseStream;
    type Future = BoxFuture<Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<WriteRequest>>) -> Self::Future {
        let service = Arc::clone(&self.0);
        Box::pin(async move { Ok(start_write(service, request)) })
    }
}

struct QuerySvc(Arc<StreamService>);

impl tonic::server::UnaryService<QueryRequest> for QuerySvc {
    type Response = QueryResponse;
    type Future = BoxFuture<Result<Response<Self::Response>, Status>>;

    fn call(&mut self, request: Request<QueryRequest>) -> Self::Future {
        let service = Arc::clone(&self.0);
        Box::pin(serve_query(service, request))
    }
}

impl<B> tonic::codegen::Service<tonic::codegen::http::Request<B>> for StreamServiceServer
where
    B: tonic::codegen::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<tonic::codegen::StdError> + Send + 'static,
{
    type Response = tonic::codegen::http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: tonic::codegen::http::Request<B>) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        match req.uri().path() {
            WRITE_PATH => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.streaming(WriteSvc(inner), req).await)
            }),
            QUERY_PATH => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.unary(QuerySvc(inner), req).await)
            }),
            path => {
                tracing::warn!(path = %path, "unknown stream service method");
                let status = Status::unimplemented(format!("Unknown method: {}", path));
                Box::pin(async move { Ok(status.into_http()) })
            }
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// gRPC server for the stream service.
pub struct StreamGrpcServer {
    bind_addr: SocketAddr,
    service: Arc<StreamService>,
    shutdown_rx: watch::Receiver<bool>,
}

impl StreamGrpcServer {
    pub fn new(
        bind_addr: SocketAddr,
        service: Arc<StreamService>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            service,
            shutdown_rx,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Run the gRPC server until shutdown is signalled.
    pub async fn run(self) -> LiaisonResult<()> {
        use tonic::transport::Server;

        let addr = self.bind_addr;
        let mut shutdown_rx = self.shutdown_rx;

        tracing::info!(%addr, "starting stream gRPC server");

        Server::builder()
            .add_service(StreamServiceServer::new(self.service))
            .serve_with_shutdown(addr, async move {
                loop {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                tracing::info!("gRPC server shutting down");
            })
            .await
            .map_err(|e| LiaisonError::internal(format!("gRPC server error: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_classify_inbound_errors() {
        assert_eq!(
            inbound_error(Status::cancelled("gone")),
            InboundError::Cancelled
        );
        assert_eq!(
            inbound_error(Status::deadline_exceeded("late")),
            InboundError::DeadlineExceeded
        );
        assert!(matches!(
            inbound_error(Status::internal("h2 reset")),
            InboundError::Transport(_)
        ));
    }

    #[test]
    fn grpc_timeout_header_sets_deadline() {
        let mut metadata = tonic::metadata::MetadataMap::new();
        metadata.insert("grpc-timeout", "500m".parse().unwrap());
        assert!(context_from(&metadata).deadline().is_some());
        assert!(context_from(&tonic::metadata::MetadataMap::new())
            .deadline()
            .is_none());
    }

    #[test]
    fn terminal_error_maps_to_status() {
        let status = outbound(Err(LiaisonError::Cancelled)).unwrap_err();
        assert_eq!(status.code(), tonic::Code::Cancelled);
    }
}
