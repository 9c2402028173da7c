//! logmesh Cluster Layer
//!
//! Membership plus replication: nodes discover each other through the
//! membership transport, and every join event starts a replication stream
//! that pulls the new peer's records into the local log. Together they
//! give the cluster eventually-consistent full-mesh replication without
//! cross-producer ordering guarantees.
//!
//! - [`Membership`]: tracks the cluster's member table and dispatches
//!   join/leave events to a [`Handler`].
//! - [`Replicator`]: the standard handler; one streaming pull per peer,
//!   produced into the local server.

pub mod membership;
pub mod replicator;

pub use membership::{Handler, Member, MemberStatus, Membership, MembershipConfig};
pub use replicator::Replicator;
