//! logmesh Protocol Buffer Definitions
//!
//! This crate contains the gRPC service definition and message types for
//! communication between logmesh nodes and their clients.
//!
//! The `Record` message doubles as the storage codec: the storage layer
//! appends prost-encoded `Record` frames to its store files, so a consumer
//! of the bulk log reader can decode the raw store stream with nothing but
//! this crate and the store's length prefixes.
//!
//! ## Usage
//!
//! ```ignore
//! use logmesh_proto::v1::{commit_log_client::CommitLogClient, ProduceRequest, Record};
//!
//! let mut client = CommitLogClient::connect("http://127.0.0.1:9090").await?;
//! let response = client
//!     .produce(ProduceRequest {
//!         record: Some(Record { value: b"hello".to_vec(), offset: 0 }),
//!     })
//!     .await?;
//! println!("offset: {}", response.into_inner().offset);
//! ```

pub mod v1 {
    tonic::include_proto!("logmesh.v1");
}
