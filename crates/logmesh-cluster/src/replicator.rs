//! Peer Replication
//!
//! The replicator turns membership events into long-lived streaming pulls:
//! one task per known peer consumes that peer's log over gRPC and produces
//! every received record into the local server, so each node eventually
//! holds a copy of every record produced anywhere in the cluster.
//!
//! ## Protocol
//!
//! - `join(name, addr)`: start replicating from the peer, at most one
//!   stream per peer name. No-op if the peer is already tracked or the
//!   replicator is closed.
//! - `leave(name)`: cancel the peer's replication task.
//! - `close()`: cancel every task and refuse future joins. Idempotent.
//!
//! Each task dials the peer, opens a consume stream and forwards records
//! until its per-peer cancel signal fires, the global shutdown signal
//! fires, or the stream fails. Failures are terminal for the task: they
//! are logged and replication from that peer stops until it leaves and
//! rejoins.
//!
//! ## Duplicate suppression
//!
//! The replicator remembers, per peer name, the offset after the last
//! record it produced locally. A peer that flaps (leave then join) within
//! the process lifetime resumes from that high-water mark instead of
//! re-pulling its history from offset zero. The mark is not persisted;
//! a restarted process starts over.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use logmesh_proto::v1::commit_log_client::CommitLogClient;
use logmesh_proto::v1::{ConsumeRequest, ProduceRequest, Record};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::membership::Handler;

/// Capacity of the hand-off between a stream's receive task and the
/// produce loop.
const HANDOFF_DEPTH: usize = 64;

/// Replicates every known peer's log into the local server.
#[derive(Clone)]
pub struct Replicator {
    shared: Arc<Shared>,
}

struct Shared {
    local: CommitLogClient<Channel>,
    state: Mutex<State>,
    shutdown: watch::Sender<bool>,
}

#[derive(Default)]
struct State {
    /// One cancel handle per peer currently being replicated.
    peers: HashMap<String, watch::Sender<bool>>,
    /// Next offset to request per peer name; survives leave/join.
    progress: HashMap<String, u64>,
    closed: bool,
}

impl Replicator {
    /// Create a replicator that produces received records through `local`,
    /// a client on this node's own server.
    pub fn new(local: CommitLogClient<Channel>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                local,
                state: Mutex::new(State::default()),
                shutdown,
            }),
        }
    }

    /// Start replicating from the named peer at `addr`. At most one stream
    /// exists per peer name; joining a tracked peer is a no-op.
    pub fn join(&self, name: &str, addr: &str) {
        let (cancel_rx, start_offset) = {
            let mut state = self.shared.state.lock();
            if state.closed || state.peers.contains_key(name) {
                return;
            }
            let (cancel_tx, cancel_rx) = watch::channel(false);
            state.peers.insert(name.to_string(), cancel_tx);
            (cancel_rx, state.progress.get(name).copied().unwrap_or(0))
        };

        info!(peer = name, addr, start_offset, "replication starting");
        let shared = Arc::clone(&self.shared);
        let name = name.to_string();
        let addr = addr.to_string();
        tokio::spawn(async move {
            shared.replicate(&name, &addr, start_offset, cancel_rx).await;
        });
    }

    /// Stop replicating from the named peer. No-op for untracked peers.
    pub fn leave(&self, name: &str) {
        let mut state = self.shared.state.lock();
        if let Some(cancel) = state.peers.remove(name) {
            info!(peer = name, "replication stopping");
            let _ = cancel.send(true);
        }
    }

    /// Stop every replication task and refuse future joins. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        let _ = self.shared.shutdown.send(true);
    }
}

#[async_trait]
impl Handler for Replicator {
    async fn join(&self, name: &str, addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Replicator::join(self, name, addr);
        Ok(())
    }

    async fn leave(&self, name: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Replicator::leave(self, name);
        Ok(())
    }
}

impl Shared {
    async fn replicate(
        self: Arc<Self>,
        name: &str,
        addr: &str,
        start_offset: u64,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        let mut client = match CommitLogClient::connect(format!("http://{addr}")).await {
            Ok(client) => client,
            Err(err) => {
                warn!(peer = name, addr, error = %err, "failed to dial peer");
                return;
            }
        };

        let mut stream = match client
            .consume_stream(ConsumeRequest {
                offset: start_offset,
            })
            .await
        {
            Ok(response) => response.into_inner(),
            Err(status) => {
                warn!(peer = name, addr, error = %status, "failed to open consume stream");
                return;
            }
        };

        // Dedicated receive task pushes records into a bounded hand-off so
        // the main loop can select among cancel, shutdown and records.
        let (tx, mut rx) = mpsc::channel::<Record>(HANDOFF_DEPTH);
        let recv_peer = name.to_string();
        let recv_task = tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(response)) => {
                        let Some(record) = response.record else {
                            continue;
                        };
                        if tx.send(record).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!(peer = %recv_peer, "consume stream ended");
                        return;
                    }
                    Err(status) => {
                        warn!(peer = %recv_peer, error = %status, "failed to receive record");
                        return;
                    }
                }
            }
        });

        let mut local = self.local.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = cancel.changed() => break,
                record = rx.recv() => {
                    let Some(record) = record else { break };
                    let source_offset = record.offset;
                    let request = ProduceRequest { record: Some(record) };
                    if let Err(status) = local.produce(request).await {
                        warn!(peer = name, error = %status, "failed to produce replicated record");
                        break;
                    }
                    self.state
                        .lock()
                        .progress
                        .insert(name.to_string(), source_offset + 1);
                }
            }
        }
        recv_task.abort();
        debug!(peer = name, "replication task exited");
    }
}
