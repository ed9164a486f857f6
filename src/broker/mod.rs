//! Group broker seam and the in-memory implementation.
//!
//! A group is a named broadcast channel: connections join and leave by name,
//! and a publish to a group reaches every currently joined connection. The
//! engine only ever talks to the [`GroupBroker`] trait; [`LocalBroker`] is
//! the in-process implementation used by tests and single-process embeddings.

mod local;

pub use local::{BrokerConfig, LocalBroker};

use crate::error::Result;
use crate::types::{ChangeEvent, ConnectionId};
use async_trait::async_trait;

/// Broadcast-group primitives consumed by the engine.
#[async_trait]
pub trait GroupBroker: Send + Sync {
    /// Join a connection to a named group. Joining a group the connection is
    /// already a member of is a no-op.
    async fn join_group(&self, conn: ConnectionId, group: &str) -> Result<()>;

    /// Remove a connection from a named group. Fails with
    /// `ObserveError::Broker` if the connection was not a member.
    async fn leave_group(&self, conn: ConnectionId, group: &str) -> Result<()>;

    /// Deliver an event to every connection currently joined to the group.
    async fn publish(&self, group: &str, event: ChangeEvent) -> Result<()>;

    /// Drop a connection's memberships in every group. Called on teardown.
    async fn deregister(&self, conn: ConnectionId);
}
