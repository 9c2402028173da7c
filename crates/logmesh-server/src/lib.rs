//! logmesh gRPC Server
//!
//! Exposes the commit log over the four RPCs of the `CommitLog` service:
//!
//! - `Produce`: append one record, return its offset
//! - `Consume`: read the record at an offset
//! - `ProduceStream`: append a stream of records, answering with an offset
//!   per record
//! - `ConsumeStream`: stream records from an offset onward, following the
//!   tail as new records arrive
//!
//! ## Tail Following
//!
//! Every successful produce advances a `watch` channel holding the log's
//! next offset. A `ConsumeStream` that catches up with the tail parks on
//! that channel and resumes as soon as something is appended, so
//! replicating peers receive records with no polling.
//!
//! ## Error Mapping
//!
//! `OffsetOutOfRange` maps to gRPC `OUT_OF_RANGE` with the offending
//! offset in the message; every other storage failure maps to `INTERNAL`.
//! Status codes raised by outer layers (authorization and the like) pass
//! through tonic untouched.

use std::sync::Arc;

use logmesh_core::Error;
use logmesh_proto::v1::commit_log_server::{CommitLog as CommitLogRpc, CommitLogServer};
use logmesh_proto::v1::{ConsumeRequest, ConsumeResponse, ProduceRequest, ProduceResponse};
use logmesh_storage::CommitLog;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

/// gRPC service implementation over a shared [`CommitLog`].
pub struct LogService {
    log: Arc<CommitLog>,
    /// Next offset the log will assign; bumped on every produce.
    tail: watch::Sender<u64>,
}

impl LogService {
    pub fn new(log: Arc<CommitLog>) -> Self {
        let (tail, _) = watch::channel(0);
        Self { log, tail }
    }

    /// Append through a blocking task (the storage stack does file I/O)
    /// and wake tail followers.
    async fn append(
        log: Arc<CommitLog>,
        tail: &watch::Sender<u64>,
        request: ProduceRequest,
    ) -> Result<u64, Status> {
        let record = request
            .record
            .ok_or_else(|| Status::invalid_argument("record is required"))?;
        let offset = tokio::task::spawn_blocking(move || log.append(record))
            .await
            .map_err(|err| Status::internal(format!("append task failed: {err}")))?
            .map_err(error_status)?;
        // send_replace updates the channel even when no follower is
        // subscribed yet; plain send would drop the update.
        tail.send_replace(offset + 1);
        Ok(offset)
    }
}

fn error_status(err: Error) -> Status {
    match err {
        Error::OffsetOutOfRange(offset) => {
            Status::out_of_range(format!("offset out of range: {offset}"))
        }
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl CommitLogRpc for LogService {
    async fn produce(
        &self,
        request: Request<ProduceRequest>,
    ) -> Result<Response<ProduceResponse>, Status> {
        let offset =
            Self::append(Arc::clone(&self.log), &self.tail, request.into_inner()).await?;
        Ok(Response::new(ProduceResponse { offset }))
    }

    async fn consume(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<ConsumeResponse>, Status> {
        let offset = request.into_inner().offset;
        let log = Arc::clone(&self.log);
        let record = tokio::task::spawn_blocking(move || log.read(offset))
            .await
            .map_err(|err| Status::internal(format!("read task failed: {err}")))?
            .map_err(error_status)?;
        Ok(Response::new(ConsumeResponse {
            record: Some(record),
        }))
    }

    type ProduceStreamStream = ReceiverStream<Result<ProduceResponse, Status>>;

    async fn produce_stream(
        &self,
        request: Request<Streaming<ProduceRequest>>,
    ) -> Result<Response<Self::ProduceStreamStream>, Status> {
        let mut requests = request.into_inner();
        let (tx, rx) = mpsc::channel(64);
        let log = Arc::clone(&self.log);
        let tail = self.tail.clone();

        tokio::spawn(async move {
            loop {
                let request = match requests.message().await {
                    Ok(Some(request)) => request,
                    Ok(None) => return,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                };
                match Self::append(Arc::clone(&log), &tail, request).await {
                    Ok(offset) => {
                        if tx.send(Ok(ProduceResponse { offset })).await.is_err() {
                            return;
                        }
                    }
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type ConsumeStreamStream = ReceiverStream<Result<ConsumeResponse, Status>>;

    async fn consume_stream(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<Self::ConsumeStreamStream>, Status> {
        let mut offset = request.into_inner().offset;
        let (tx, rx) = mpsc::channel(64);
        let log = Arc::clone(&self.log);
        let mut tail = self.tail.subscribe();

        tokio::spawn(async move {
            loop {
                let read_log = Arc::clone(&log);
                let result = tokio::task::spawn_blocking(move || read_log.read(offset)).await;
                match result {
                    Ok(Ok(record)) => {
                        let response = ConsumeResponse {
                            record: Some(record),
                        };
                        if tx.send(Ok(response)).await.is_err() {
                            return;
                        }
                        offset += 1;
                    }
                    Ok(Err(Error::OffsetOutOfRange(_))) => {
                        // Caught up; park until the next produce.
                        if tail.changed().await.is_err() {
                            return;
                        }
                        tail.borrow_and_update();
                    }
                    Ok(Err(err)) => {
                        let _ = tx.send(Err(error_status(err))).await;
                        return;
                    }
                    Err(err) => {
                        let _ = tx
                            .send(Err(Status::internal(format!("read task failed: {err}"))))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Serve the commit log service on an already-bound listener until the
/// process or the transport shuts it down.
pub async fn serve(
    log: Arc<CommitLog>,
    listener: TcpListener,
) -> Result<(), tonic::transport::Error> {
    let addr = listener.local_addr().ok();
    let service = LogService::new(log);
    debug!(addr = ?addr, "serving commit log rpc");
    Server::builder()
        .add_service(CommitLogServer::new(service))
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await
}
