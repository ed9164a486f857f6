//! In-memory group broker.

use crate::error::{ObserveError, Result};
use crate::types::{ChangeEvent, ConnectionId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tracing::{debug, warn};

use super::GroupBroker;

/// Configuration for the in-memory broker.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Max buffered events per connection inbox before events are dropped.
    /// Default: 1000
    pub inbox_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1000,
        }
    }
}

/// Per-connection broker state.
struct Registration {
    inbox: Sender<ChangeEvent>,
    /// Groups this connection belongs to (reverse index for deregister).
    groups: HashSet<String>,
}

/// In-memory [`GroupBroker`].
///
/// Membership is a group-name → connection map guarded by a single lock;
/// membership add/remove are independent per connection/group pair, so no
/// locking is required of callers. Delivery is best-effort: a full inbox
/// drops the event.
pub struct LocalBroker {
    config: BrokerConfig,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    groups: HashMap<String, HashSet<ConnectionId>>,
    connections: HashMap<ConnectionId, Registration>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Register a connection and hand back its event inbox.
    ///
    /// Must be called before the connection joins any group. Re-registering
    /// replaces the previous inbox and clears prior memberships.
    pub fn register(&self, conn: ConnectionId) -> Receiver<ChangeEvent> {
        let (tx, rx) = channel(self.config.inbox_capacity);
        let mut inner = self.inner.write();
        if let Some(old) = inner.connections.insert(
            conn,
            Registration {
                inbox: tx,
                groups: HashSet::new(),
            },
        ) {
            for group in &old.groups {
                if let Some(members) = inner.groups.get_mut(group) {
                    members.remove(&conn);
                }
            }
        }
        rx
    }

    /// Number of connections currently joined to a group.
    pub fn group_size(&self, group: &str) -> usize {
        self.inner
            .read()
            .groups
            .get(group)
            .map_or(0, |members| members.len())
    }

    /// Number of groups a connection currently belongs to.
    pub fn membership_count(&self, conn: ConnectionId) -> usize {
        self.inner
            .read()
            .connections
            .get(&conn)
            .map_or(0, |reg| reg.groups.len())
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GroupBroker for LocalBroker {
    async fn join_group(&self, conn: ConnectionId, group: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let registration = inner
            .connections
            .get_mut(&conn)
            .ok_or_else(|| ObserveError::Broker(format!("connection {conn} is not registered")))?;
        registration.groups.insert(group.to_string());
        inner
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(conn);
        debug!(%conn, group, "joined group");
        Ok(())
    }

    async fn leave_group(&self, conn: ConnectionId, group: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let was_member = inner
            .groups
            .get_mut(group)
            .map_or(false, |members| members.remove(&conn));
        if let Some(registration) = inner.connections.get_mut(&conn) {
            registration.groups.remove(group);
        }
        if !was_member {
            return Err(ObserveError::Broker(format!(
                "connection {conn} is not a member of group {group}"
            )));
        }
        debug!(%conn, group, "left group");
        Ok(())
    }

    async fn publish(&self, group: &str, event: ChangeEvent) -> Result<()> {
        // Collect senders under the lock, send outside it.
        let inboxes: Vec<(ConnectionId, Sender<ChangeEvent>)> = {
            let inner = self.inner.read();
            let Some(members) = inner.groups.get(group) else {
                return Ok(());
            };
            members
                .iter()
                .filter_map(|conn| {
                    inner
                        .connections
                        .get(conn)
                        .map(|reg| (*conn, reg.inbox.clone()))
                })
                .collect()
        };

        for (conn, inbox) in inboxes {
            if inbox.try_send(event.clone()).is_err() {
                warn!(%conn, group, "inbox full or closed, dropping event");
            }
        }
        Ok(())
    }

    async fn deregister(&self, conn: ConnectionId) {
        let mut inner = self.inner.write();
        if let Some(registration) = inner.connections.remove(&conn) {
            for group in &registration.groups {
                if let Some(members) = inner.groups.get_mut(group) {
                    members.remove(&conn);
                }
            }
            debug!(%conn, "deregistered connection");
        }
    }
}
