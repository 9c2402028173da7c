//! Full-path cluster test: membership discovery drives the replicator, so
//! a record produced on one node shows up on a node that only ever learned
//! about it through a join event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use logmesh_cluster::{Handler, Membership, MembershipConfig, Replicator};
use logmesh_core::LogConfig;
use logmesh_proto::v1::commit_log_client::CommitLogClient;
use logmesh_proto::v1::{ProduceRequest, Record};
use logmesh_storage::CommitLog;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tonic::transport::Channel;

/// Handler for the node that should not replicate anyone (keeping the
/// test one-directional and deterministic).
struct IgnoreHandler;

#[async_trait]
impl Handler for IgnoreHandler {
    async fn join(
        &self,
        _name: &str,
        _addr: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    async fn leave(&self, _name: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

async fn start_log_server() -> (String, Arc<CommitLog>, TempDir) {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(CommitLog::open(dir.path().join("log"), LogConfig::default()).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(logmesh_server::serve(Arc::clone(&log), listener));
    (addr, log, dir)
}

fn membership_config(name: &str, rpc_addr: &str, seeds: Vec<String>) -> MembershipConfig {
    let mut tags = HashMap::new();
    tags.insert("rpc_addr".to_string(), rpc_addr.to_string());
    MembershipConfig {
        node_name: name.to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        tags,
        start_join_addrs: seeds,
        heartbeat_interval: Duration::from_millis(250),
        failure_timeout: Duration::from_secs(10),
    }
}

#[tokio::test]
async fn test_membership_event_starts_replication() {
    // Node A: serves a log, ignores membership events.
    let (rpc_a, _log_a, _dir_a) = start_log_server().await;
    let membership_a = Membership::new(
        Arc::new(IgnoreHandler),
        membership_config("a", &rpc_a, vec![]),
    )
    .await
    .unwrap();

    // Node B: serves a log and replicates every peer membership reports.
    let (rpc_b, log_b, _dir_b) = start_log_server().await;
    let channel = Channel::from_shared(format!("http://{rpc_b}"))
        .unwrap()
        .connect_lazy();
    let replicator = Replicator::new(CommitLogClient::new(channel));
    let _membership_b = Membership::new(
        Arc::new(replicator.clone()),
        membership_config("b", &rpc_b, vec![membership_a.bound_addr().to_string()]),
    )
    .await
    .unwrap();

    // Produce on A; B must pick it up purely via the join event.
    let mut client_a = CommitLogClient::connect(format!("http://{rpc_a}"))
        .await
        .unwrap();
    client_a
        .produce(ProduceRequest {
            record: Some(Record {
                value: b"discovered and replicated".to_vec(),
                offset: 0,
            }),
        })
        .await
        .unwrap();

    let mut replicated = None;
    for _ in 0..50 {
        if let Ok(record) = log_b.read(0) {
            replicated = Some(record);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let record = replicated.expect("record never replicated through membership");
    assert_eq!(record.value, b"discovered and replicated");

    replicator.close();
}
