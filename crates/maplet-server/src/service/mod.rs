//! gRPC data plane.
//!
//! Every request borrows one worker from the pool for its whole duration.
//! The per-request timeout is the configured `server.timeout`, tightened
//! by the client's gRPC deadline when one is set; it covers the wait for
//! a worker, the engine call and the streaming of the reply body.
//! Abandoned or expired streams drop their worker guard, which routes the
//! child through the cancel/kill ladder of the recycler.

pub mod admin;

use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tonic::{Request, Response, Status};

use maplet_core::frames::{ApiParams, HttpMethod, OwsParams, RequestParams};
use maplet_core::proto::{
    CollectionsPage, CollectionsRequest, OwsRequest, PingReply, PingRequest, ReplyHeaders,
    ResponseChunk, collections_page::CollectionsItem, response_chunk,
};
use maplet_pool::{Receiver, RequestReply, ScopedWorker};

use crate::utils::{effective_timeout, metadata_to_headers};

// Response headers marked with this prefix by the engine are forwarded to
// the caller.
pub(crate) const HEADER_PREFIX: &str = "x-reply-header-";

/// Worker checkout shared by both servicers.
pub(crate) struct Inner(pub Receiver);

impl Inner {
    /// Wait for a worker, bounded by the request deadline.
    pub async fn get_worker(&self, deadline: Instant) -> Result<ScopedWorker, Status> {
        match timeout_at(deadline, self.0.get()).await {
            Ok(result) => result.map_err(Status::from),
            Err(_) => Err(Status::deadline_exceeded(
                "no worker available within the request deadline",
            )),
        }
    }

    pub fn get_ref(&self) -> &Receiver {
        &self.0
    }
}

pub use maplet_core::proto::map_service_server::MapServiceServer;
use maplet_core::proto::map_service_server::MapService;

/// The data-plane servicer.
pub struct MapServicer {
    inner: Inner,
    timeout: Duration,
}

impl MapServicer {
    pub fn new(queue: Receiver, timeout: Duration) -> Self {
        Self {
            inner: Inner(queue),
            timeout,
        }
    }

    fn deadline(&self, metadata: &tonic::metadata::MetadataMap) -> Instant {
        Instant::now() + effective_timeout(metadata, self.timeout)
    }
}

type ResponseChunkStream = Pin<Box<dyn Stream<Item = Result<ResponseChunk, Status>> + Send>>;

/// Forward the reply body to the caller.
///
/// Every suspension point is bounded by the request deadline: reading the
/// next chunk from the child catches a stalled child, forwarding it to
/// the caller catches a stalled caller. Dropping the worker guard on any
/// early exit hands the child to the cancel ladder.
fn stream_response(
    mut worker: ScopedWorker,
    reply: RequestReply,
    deadline: Instant,
) -> mpsc::Receiver<Result<ResponseChunk, Status>> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let headers = ResponseChunk {
            payload: Some(response_chunk::Payload::Headers(ReplyHeaders {
                status: i32::from(reply.status),
                headers: reply.headers.into_iter().collect(),
            })),
        };
        if tx.send(Ok(headers)).await.is_err() {
            tracing::debug!("connection cancelled by client");
            return;
        }

        let mut stream = worker.byte_stream();
        loop {
            let chunk = match timeout_at(deadline, stream.next()).await {
                Err(_) => {
                    tracing::warn!("request exceeded its deadline mid-stream");
                    let _ = tx
                        .send(Err(Status::deadline_exceeded("request timed out")))
                        .await;
                    return;
                }
                Ok(Err(err)) => {
                    let _ = tx.send(Err(err.into())).await;
                    return;
                }
                Ok(Ok(None)) => return,
                Ok(Ok(Some(chunk))) => chunk,
            };

            let msg = ResponseChunk {
                payload: Some(response_chunk::Payload::Chunk(chunk)),
            };
            match timeout_at(deadline, tx.send(Ok(msg))).await {
                Err(_) => {
                    tracing::warn!("caller stalled past the request deadline");
                    return;
                }
                Ok(Err(_)) => {
                    tracing::debug!("connection cancelled by client");
                    return;
                }
                Ok(Ok(())) => {}
            }
        }
    });
    rx
}

#[tonic::async_trait]
impl MapService for MapServicer {
    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingReply>, Status> {
        let deadline = self.deadline(request.metadata());
        let mut worker = self.inner.get_worker(deadline).await?;
        let echo = timeout_at(deadline, worker.ping(&request.into_inner().echo))
            .await
            .map_err(|_| Status::deadline_exceeded("request timed out"))??;
        Ok(Response::new(PingReply { echo }))
    }

    type ExecuteOwsRequestStream = ResponseChunkStream;

    async fn execute_ows_request(
        &self,
        request: Request<OwsRequest>,
    ) -> Result<Response<Self::ExecuteOwsRequestStream>, Status> {
        let deadline = self.deadline(request.metadata());
        let headers = metadata_to_headers(request.metadata());
        let mut worker = self.inner.get_worker(deadline).await?;

        let req = request.get_ref();
        let method = req
            .method
            .as_deref()
            .map(HttpMethod::try_from)
            .transpose()
            .map_err(|err| Status::invalid_argument(err.to_string()))?;

        let params = RequestParams::Ows(OwsParams {
            service: req.service.clone(),
            request: req.request.clone(),
            target: req.target.clone(),
            version: req.version.clone(),
            url: req.url.clone(),
            direct: req.direct,
            options: req.options.clone(),
            request_id: req.request_id.clone(),
            header_prefix: Some(HEADER_PREFIX.to_string()),
            content_type: req.content_type.clone(),
            method,
            body: req.body.as_ref().map(|b| b.to_vec()),
            headers,
        });

        let reply = timeout_at(deadline, worker.request(params))
            .await
            .map_err(|_| Status::deadline_exceeded("request timed out"))??;

        let rx = stream_response(worker, reply, deadline);
        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::ExecuteOwsRequestStream
        ))
    }

    type ExecuteApiRequestStream = ResponseChunkStream;

    async fn execute_api_request(
        &self,
        request: Request<maplet_core::proto::ApiRequest>,
    ) -> Result<Response<Self::ExecuteApiRequestStream>, Status> {
        let deadline = self.deadline(request.metadata());
        let headers = metadata_to_headers(request.metadata());
        let mut worker = self.inner.get_worker(deadline).await?;

        let req = request.get_ref();
        let method = Some(
            HttpMethod::try_from(req.method.as_str())
                .map_err(|err| Status::invalid_argument(err.to_string()))?,
        );

        let params = RequestParams::Api(ApiParams {
            name: req.name.clone(),
            path: req.path.clone(),
            method,
            url: req.url.clone(),
            data: req.data.as_ref().map(|b| b.to_vec()),
            delegate: req.delegate,
            target: req.target.clone(),
            direct: req.direct,
            options: req.options.clone(),
            request_id: req.request_id.clone(),
            header_prefix: Some(HEADER_PREFIX.to_string()),
            content_type: req.content_type.clone(),
            headers,
        });

        let reply = timeout_at(deadline, worker.request(params))
            .await
            .map_err(|_| Status::deadline_exceeded("request timed out"))??;

        let rx = stream_response(worker, reply, deadline);
        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::ExecuteApiRequestStream
        ))
    }

    async fn collections(
        &self,
        request: Request<CollectionsRequest>,
    ) -> Result<Response<CollectionsPage>, Status> {
        let deadline = self.deadline(request.metadata());
        let mut worker = self.inner.get_worker(deadline).await?;

        let req = request.into_inner();
        let page = timeout_at(
            deadline,
            worker.collections(req.location.as_deref(), req.resource.as_deref(), req.start..req.end),
        )
        .await
        .map_err(|_| Status::deadline_exceeded("request timed out"))??;

        Ok(Response::new(CollectionsPage {
            schema: page.schema,
            next: page.next,
            items: page
                .items
                .into_iter()
                .map(|item| CollectionsItem {
                    name: item.name,
                    json: item.json,
                    endpoints: item.endpoints.bits(),
                })
                .collect(),
        }))
    }
}
