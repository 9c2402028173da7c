//! logmesh Server
//!
//! Main entry point for a logmesh node: one process that stores a commit
//! log, serves it over gRPC, participates in cluster membership and
//! replicates every peer's log into its own.
//!
//! ## Configuration
//!
//! All configuration is done via environment variables:
//!
//! - `LOGMESH_NODE_NAME`: unique node name in the cluster (default: logmesh-0)
//! - `LOGMESH_DATA_DIR`: log directory (default: ./data/log)
//! - `LOGMESH_RPC_ADDR`: gRPC bind address (default: 127.0.0.1:9090)
//! - `LOGMESH_ADVERTISE_ADDR`: gRPC address advertised to peers
//!   (default: the bind address)
//! - `LOGMESH_BIND_ADDR`: membership bind address (default: 127.0.0.1:9091)
//! - `LOGMESH_JOIN_ADDRS`: comma-separated membership addresses of
//!   existing cluster nodes (default: empty, start a fresh cluster)
//! - `LOGMESH_MAX_STORE_BYTES` / `LOGMESH_MAX_INDEX_BYTES` /
//!   `LOGMESH_INITIAL_OFFSET`: segment tuning (defaults per config crate)
//!
//! ## Logging
//!
//! Controlled via `RUST_LOG` (default: info).

use std::collections::HashMap;
use std::sync::Arc;

use logmesh_cluster::{Membership, MembershipConfig, Replicator};
use logmesh_core::LogConfig;
use logmesh_proto::v1::commit_log_client::CommitLogClient;
use logmesh_storage::CommitLog;
use tonic::transport::Channel;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let node_name = env_or("LOGMESH_NODE_NAME", "logmesh-0");
    let data_dir = env_or("LOGMESH_DATA_DIR", "./data/log");
    let rpc_addr = env_or("LOGMESH_RPC_ADDR", "127.0.0.1:9090");
    let advertise_addr = env_or("LOGMESH_ADVERTISE_ADDR", &rpc_addr);
    let bind_addr = env_or("LOGMESH_BIND_ADDR", "127.0.0.1:9091");
    let join_addrs: Vec<String> = std::env::var("LOGMESH_JOIN_ADDRS")
        .unwrap_or_default()
        .split(',')
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
        .collect();

    let mut config = LogConfig::default();
    if let Some(bytes) = env_u64("LOGMESH_MAX_STORE_BYTES")? {
        config.segment.max_store_bytes = bytes;
    }
    if let Some(bytes) = env_u64("LOGMESH_MAX_INDEX_BYTES")? {
        config.segment.max_index_bytes = bytes;
    }
    if let Some(offset) = env_u64("LOGMESH_INITIAL_OFFSET")? {
        config.segment.initial_offset = offset;
    }

    tracing::info!(node = %node_name, dir = %data_dir, "opening commit log");
    let log = Arc::new(CommitLog::open(&data_dir, config)?);

    let listener = tokio::net::TcpListener::bind(&rpc_addr).await?;
    tracing::info!(addr = %rpc_addr, "serving commit log rpc");
    let server = tokio::spawn(logmesh_server::serve(Arc::clone(&log), listener));

    // The replicator produces through this node's own RPC surface; connect
    // lazily so startup order does not matter.
    let channel = Channel::from_shared(format!("http://{advertise_addr}"))?.connect_lazy();
    let replicator = Replicator::new(CommitLogClient::new(channel));

    let mut tags = HashMap::new();
    tags.insert("rpc_addr".to_string(), advertise_addr.clone());
    let membership = Membership::new(
        Arc::new(replicator.clone()),
        MembershipConfig {
            node_name,
            bind_addr,
            tags,
            start_join_addrs: join_addrs,
            heartbeat_interval: std::time::Duration::from_secs(1),
            failure_timeout: std::time::Duration::from_secs(5),
        },
    )
    .await?;

    tokio::select! {
        result = server => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            membership.leave().await;
            replicator.close();
            log.close()?;
        }
    }

    Ok(())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str) -> Result<Option<u64>, std::num::ParseIntError> {
    match std::env::var(key) {
        Ok(value) => Ok(Some(value.parse()?)),
        Err(_) => Ok(None),
    }
}
