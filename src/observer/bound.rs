//! Bound observers: the runtime objects produced by binding.

use crate::broker::GroupBroker;
use crate::error::Result;
use crate::model::{Entity, EntitySerializer};
use crate::observer::descriptor::{ChangeHandler, GroupNameFn};
use crate::types::{Action, ChangeEvent, ConnectionId, ObservedEvent, ObserverId};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// An observer bound to a concrete entity kind and its resolved strategies.
///
/// Produced exactly once per (consumer, observer name) pair at registration
/// time; immutable afterwards and shared across connections via `Arc`.
/// Carries no per-instance state.
pub struct BoundObserver {
    pub(crate) id: ObserverId,
    pub(crate) consumer: String,
    pub(crate) name: String,
    pub(crate) entity_kind: String,
    pub(crate) prefix: String,
    pub(crate) stream: String,
    pub(crate) group_strategy: Option<GroupNameFn>,
    pub(crate) serializer: Option<Arc<dyn EntitySerializer>>,
    pub(crate) handler: Arc<dyn ChangeHandler>,
}

impl BoundObserver {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Name of the declaring consumer.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Observer name within the consumer.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entity_kind(&self) -> &str {
        &self.entity_kind
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Envelope tag routing change events to this observer.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn serializer(&self) -> Option<&Arc<dyn EntitySerializer>> {
        self.serializer.as_ref()
    }

    pub fn handler(&self) -> Arc<dyn ChangeHandler> {
        self.handler.clone()
    }

    /// Compute the group names for an instance.
    ///
    /// A strategy override fully replaces the default; the default yields a
    /// single name `"{prefix}-{stable-id-or-primary-key}"`.
    pub fn group_names(&self, instance: &dyn Entity) -> Vec<String> {
        match &self.group_strategy {
            Some(strategy) => strategy(&self.prefix, instance),
            None => vec![format!("{}-{}", self.prefix, instance.identity())],
        }
    }

    /// Join the connection to every group computed for `instance`.
    ///
    /// On a join failure the groups already joined are left again, so a
    /// failed subscribe leaves no partial membership. Returns the joined
    /// group names.
    pub async fn subscribe(
        &self,
        broker: &dyn GroupBroker,
        conn: ConnectionId,
        instance: &dyn Entity,
    ) -> Result<Vec<String>> {
        let groups = self.group_names(instance);
        let mut joined: Vec<&str> = Vec::with_capacity(groups.len());
        for group in &groups {
            if let Err(e) = broker.join_group(conn, group).await {
                for rolled_back in joined {
                    if let Err(leave_err) = broker.leave_group(conn, rolled_back).await {
                        warn!(%conn, group = rolled_back, error = %leave_err,
                              "rollback leave failed");
                    }
                }
                return Err(e);
            }
            joined.push(group);
        }
        debug!(%conn, observer = %self.id, ?groups, "subscribed instance");
        Ok(groups)
    }

    /// Leave every group computed for `instance`.
    ///
    /// A failed leave (not a member) is reported via the returned error but
    /// the remaining groups are still left.
    pub async fn unsubscribe(
        &self,
        broker: &dyn GroupBroker,
        conn: ConnectionId,
        instance: &dyn Entity,
    ) -> Result<()> {
        let mut first_err = None;
        for group in self.group_names(instance) {
            if let Err(e) = broker.leave_group(conn, &group).await {
                warn!(%conn, group, error = %e, "leave failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Strip the transport envelope from a raw event.
    pub fn on_event(&self, raw: ChangeEvent) -> ObservedEvent {
        ObservedEvent {
            action: raw.action,
            payload: raw.payload,
        }
    }

    /// Build the change event for an instance and publish it to every
    /// computed group.
    ///
    /// The payload carries the serialized data (when a serializer is bound)
    /// plus the addressing fields `pk` and, when present, `uuid`. For
    /// deletes, call before the instance is gone so subscribers receive its
    /// last-known data.
    pub async fn notify(
        &self,
        broker: &dyn GroupBroker,
        action: Action,
        instance: &dyn Entity,
    ) -> Result<()> {
        let mut payload = match &self.serializer {
            Some(serializer) => serializer.serialize(instance).await?,
            None => json!({}),
        };
        if let Value::Object(map) = &mut payload {
            map.insert("pk".to_string(), json!(instance.primary_key()));
            if let Some(id) = instance.stable_id() {
                map.insert("uuid".to_string(), json!(id));
            }
        }

        let event = ChangeEvent {
            stream: self.stream.clone(),
            action,
            payload,
        };
        for group in self.group_names(instance) {
            broker.publish(&group, event.clone()).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for BoundObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundObserver")
            .field("id", &self.id)
            .field("consumer", &self.consumer)
            .field("name", &self.name)
            .field("entity_kind", &self.entity_kind)
            .field("prefix", &self.prefix)
            .field("stream", &self.stream)
            .finish()
    }
}
