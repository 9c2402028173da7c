//! Cluster Membership
//!
//! Tracks which nodes are in the cluster and dispatches join/leave events
//! to a [`Handler`] (in practice, the replicator). The dispatcher contract
//! is narrow on purpose: for every non-local member that becomes alive the
//! handler's `join(name, tags["rpc_addr"])` runs, and for every non-local
//! member that leaves or fails the handler's `leave(name)` runs. Handler
//! errors are logged, never propagated, so membership delivery cannot
//! stall on handler progress.
//!
//! ## Transport
//!
//! Nodes exchange full-state envelopes (the sender's whole member table as
//! one JSON line) over short-lived TCP connections. A node pushes its
//! state to its seeds when it starts, to every live peer whenever its
//! table changes, and periodically as a heartbeat. Merging is idempotent,
//! so convergence settles quickly and repeated pushes are harmless.
//!
//! Each member carries an epoch counter bumped by its owner on status
//! changes. Merge rules: a higher epoch always wins; at equal epochs a
//! departed status (`Left`, then `Failed`) outranks `Alive`, except that
//! an `Alive` entry received directly from the member itself refutes a
//! local `Failed` suspicion.
//!
//! ## Failure Detection
//!
//! A member that has not been heard from within `failure_timeout` is
//! marked `Failed` locally and dispatched as a leave, mirroring how the
//! heartbeat/failure-timeout pair works in coordinator-style clusters.
//! Members that leave voluntarily stay in the table with status `Left`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Receives membership changes. Implemented by the replicator.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn join(&self, name: &str, addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    async fn leave(&self, name: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Left,
    Failed,
}

impl MemberStatus {
    /// Precedence at equal epochs; a more departed status wins.
    fn rank(self) -> u8 {
        match self {
            MemberStatus::Alive => 0,
            MemberStatus::Failed => 1,
            MemberStatus::Left => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    /// Membership transport address (host:port) the member listens on.
    pub addr: String,
    /// Arbitrary metadata; `rpc_addr` names the member's log RPC endpoint.
    pub tags: HashMap<String, String>,
    pub status: MemberStatus,
    /// Bumped by the owning node on every status change it makes.
    pub epoch: u64,
}

impl Member {
    pub fn rpc_addr(&self) -> &str {
        self.tags.get("rpc_addr").map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    pub node_name: String,

    /// Address to bind the membership listener on.
    pub bind_addr: String,

    /// Metadata advertised with this node; must include `rpc_addr`.
    #[serde(default)]
    pub tags: HashMap<String, String>,

    /// Existing cluster members to push our state to at startup.
    #[serde(default)]
    pub start_join_addrs: Vec<String>,

    /// How often full state is pushed to every live peer.
    #[serde(default = "default_heartbeat_interval", with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Silence longer than this marks a peer as failed.
    #[serde(default = "default_failure_timeout", with = "duration_ms")]
    pub failure_timeout: Duration,
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_failure_timeout() -> Duration {
    Duration::from_secs(5)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// One full-state push: the sender's name plus its whole member table.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    from: String,
    members: Vec<Member>,
}

#[derive(Clone)]
pub struct Membership {
    shared: Arc<Shared>,
}

struct Shared {
    config: MembershipConfig,
    bound_addr: SocketAddr,
    handler: Arc<dyn Handler>,
    state: Mutex<Table>,
    shutdown: watch::Sender<bool>,
}

struct Table {
    members: HashMap<String, Member>,
    last_seen: HashMap<String, Instant>,
}

impl Membership {
    /// Bind the membership listener, start the background tasks and push
    /// our state to the configured seed addresses.
    pub async fn new(
        handler: Arc<dyn Handler>,
        config: MembershipConfig,
    ) -> logmesh_core::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let bound_addr = listener.local_addr()?;

        let local = Member {
            name: config.node_name.clone(),
            addr: bound_addr.to_string(),
            tags: config.tags.clone(),
            status: MemberStatus::Alive,
            epoch: 0,
        };
        let mut members = HashMap::new();
        members.insert(local.name.clone(), local);

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            bound_addr,
            handler,
            state: Mutex::new(Table {
                members,
                last_seen: HashMap::new(),
            }),
            shutdown,
        });

        info!(
            node = %shared.config.node_name,
            addr = %bound_addr,
            "membership started"
        );

        tokio::spawn(Arc::clone(&shared).run_listener(listener));
        tokio::spawn(Arc::clone(&shared).run_heartbeat());

        let seeds = shared.config.start_join_addrs.clone();
        if !seeds.is_empty() {
            let envelope = shared.envelope();
            for seed in seeds {
                send_envelope(seed, envelope.clone()).await;
            }
        }

        Ok(Self { shared })
    }

    /// Snapshot of every known member, including departed ones.
    pub fn members(&self) -> Vec<Member> {
        let table = self.shared.state.lock();
        let mut members: Vec<Member> = table.members.values().cloned().collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// The address the membership listener actually bound.
    pub fn bound_addr(&self) -> SocketAddr {
        self.shared.bound_addr
    }

    /// Depart the cluster: mark ourselves `Left`, tell every live peer and
    /// stop the background tasks.
    pub async fn leave(&self) {
        {
            let mut table = self.shared.state.lock();
            if let Some(me) = table.members.get_mut(&self.shared.config.node_name) {
                if me.status == MemberStatus::Left {
                    return;
                }
                me.epoch += 1;
                me.status = MemberStatus::Left;
            }
        }
        info!(node = %self.shared.config.node_name, "leaving cluster");
        self.shared.push_state().await;
        let _ = self.shared.shutdown.send(true);
    }
}

impl Shared {
    fn local_name(&self) -> &str {
        &self.config.node_name
    }

    fn envelope(&self) -> String {
        let table = self.state.lock();
        let envelope = Envelope {
            from: self.config.node_name.clone(),
            members: table.members.values().cloned().collect(),
        };
        // The envelope is built from plain maps and strings; serialization
        // cannot fail.
        serde_json::to_string(&envelope).unwrap_or_default()
    }

    /// Addresses of every live remote member.
    fn push_targets(&self) -> Vec<String> {
        let table = self.state.lock();
        table
            .members
            .values()
            .filter(|m| m.status == MemberStatus::Alive && m.name != self.config.node_name)
            .map(|m| m.addr.clone())
            .collect()
    }

    async fn push_state(&self) {
        let envelope = self.envelope();
        for addr in self.push_targets() {
            let envelope = envelope.clone();
            tokio::spawn(send_envelope(addr, envelope));
        }
    }

    async fn run_listener(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                accepted = listener.accept() => {
                    let Ok((socket, _)) = accepted else { continue };
                    let shared = Arc::clone(&self);
                    tokio::spawn(async move {
                        let mut lines = BufReader::new(socket).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            match serde_json::from_str::<Envelope>(&line) {
                                Ok(envelope) => shared.apply(envelope).await,
                                Err(err) => {
                                    debug!(error = %err, "discarding malformed envelope")
                                }
                            }
                        }
                    });
                }
            }
        }
    }

    /// Merge a received envelope into the member table, dispatch the
    /// resulting join/leave events and propagate if anything changed.
    async fn apply(&self, envelope: Envelope) {
        let mut joins: Vec<(String, String)> = Vec::new();
        let mut leaves: Vec<String> = Vec::new();
        let mut changed = false;
        {
            let mut table = self.state.lock();
            let now = Instant::now();
            table.last_seen.insert(envelope.from.clone(), now);

            for incoming in envelope.members {
                if incoming.name == self.local_name() {
                    // We are authoritative for our own entry.
                    continue;
                }
                let direct = incoming.name == envelope.from;
                if let Some(current) = table.members.get_mut(&incoming.name) {
                    let refutes_suspicion = direct
                        && incoming.status == MemberStatus::Alive
                        && current.status == MemberStatus::Failed;
                    let newer = incoming.epoch > current.epoch
                        || (incoming.epoch == current.epoch
                            && (incoming.status.rank() > current.status.rank()
                                || refutes_suspicion));
                    if !newer
                        || (incoming.epoch == current.epoch
                            && incoming.status == current.status)
                    {
                        continue;
                    }
                    match (current.status, incoming.status) {
                        (MemberStatus::Alive, MemberStatus::Left)
                        | (MemberStatus::Alive, MemberStatus::Failed) => {
                            leaves.push(incoming.name.clone())
                        }
                        (MemberStatus::Left, MemberStatus::Alive)
                        | (MemberStatus::Failed, MemberStatus::Alive) => {
                            joins.push((incoming.name.clone(), incoming.rpc_addr().to_string()))
                        }
                        _ => {}
                    }
                    *current = incoming;
                    changed = true;
                } else {
                    if incoming.status == MemberStatus::Alive {
                        joins.push((incoming.name.clone(), incoming.rpc_addr().to_string()));
                    }
                    table.last_seen.insert(incoming.name.clone(), now);
                    table.members.insert(incoming.name.clone(), incoming);
                    changed = true;
                }
            }
        }

        self.dispatch(joins, leaves).await;
        if changed {
            self.push_state().await;
        }
    }

    async fn dispatch(&self, joins: Vec<(String, String)>, leaves: Vec<String>) {
        for (name, rpc_addr) in joins {
            debug!(node = %self.local_name(), member = %name, "member joined");
            if let Err(err) = self.handler.join(&name, &rpc_addr).await {
                error!(member = %name, error = %err, "membership join handler failed");
            }
        }
        for name in leaves {
            debug!(node = %self.local_name(), member = %name, "member left");
            if let Err(err) = self.handler.leave(&name).await {
                error!(member = %name, error = %err, "membership leave handler failed");
            }
        }
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }

            // Mark peers we have not heard from as failed.
            let mut leaves = Vec::new();
            {
                let mut table = self.state.lock();
                let now = Instant::now();
                let Table {
                    members, last_seen, ..
                } = &mut *table;
                for member in members.values_mut() {
                    if member.name == self.config.node_name
                        || member.status != MemberStatus::Alive
                    {
                        continue;
                    }
                    let seen = *last_seen.entry(member.name.clone()).or_insert(now);
                    if now.duration_since(seen) > self.config.failure_timeout {
                        warn!(member = %member.name, "member failed heartbeat timeout");
                        member.status = MemberStatus::Failed;
                        leaves.push(member.name.clone());
                    }
                }
            }
            self.dispatch(Vec::new(), leaves).await;

            // Keep courting the seeds until some peer has answered, then
            // heartbeat the peers we know.
            if self.push_targets().is_empty() {
                let envelope = self.envelope();
                for seed in self.config.start_join_addrs.clone() {
                    tokio::spawn(send_envelope(seed, envelope.clone()));
                }
            } else {
                self.push_state().await;
            }
        }
    }
}

async fn send_envelope(addr: String, envelope: String) {
    match TcpStream::connect(&addr).await {
        Ok(mut socket) => {
            if let Err(err) = socket.write_all(envelope.as_bytes()).await {
                debug!(addr = %addr, error = %err, "failed to push membership state");
                return;
            }
            let _ = socket.write_all(b"\n").await;
        }
        Err(err) => {
            debug!(addr = %addr, error = %err, "failed to reach member");
        }
    }
}
