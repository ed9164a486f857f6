//! Collaborator seams: entity identity, retrieval, permissions, serialization.
//!
//! The engine never touches a persistence layer or a serializer body
//! directly; embedders supply implementations of these traits.

use crate::error::Result;
use crate::types::{Action, Selector};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// An entity instance the engine can observe.
///
/// Identity is immutable for the lifetime of a binding: a stable kind name,
/// a primary key, and an optional globally-unique secondary id.
pub trait Entity: Send + Sync {
    /// Stable name of the entity type (e.g. "gadget").
    fn kind(&self) -> &str;

    /// Primary identifier, rendered as a string.
    fn primary_key(&self) -> String;

    /// Secondary globally-unique identifier, if the entity carries one.
    fn stable_id(&self) -> Option<Uuid> {
        None
    }

    /// Identity used to key subscriptions and name groups: the stable id
    /// when present, otherwise the primary key.
    fn identity(&self) -> String {
        match self.stable_id() {
            Some(id) => id.to_string(),
            None => self.primary_key(),
        }
    }
}

/// Resolves entity-addressing kwargs to an instance.
#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Fetch one instance. Fails with `ObserveError::NotFound` when the
    /// selector resolves to nothing.
    async fn get_object(&self, selector: &Selector) -> Result<Arc<dyn Entity>>;
}

/// Gate on whether an action may be observed/dispatched for a selector.
#[async_trait]
pub trait PermissionGuard: Send + Sync {
    /// Fails with `ObserveError::PermissionDenied` on rejection.
    async fn check_permissions(&self, action: Action, selector: &Selector) -> Result<()>;
}

/// Turns instances into plain data for replies and event payloads.
#[async_trait]
pub trait EntitySerializer: Send + Sync {
    async fn serialize(&self, instance: &dyn Entity) -> Result<Value>;

    async fn serialize_many(&self, instances: &[Arc<dyn Entity>]) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(instances.len());
        for instance in instances {
            out.push(self.serialize(instance.as_ref()).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Widget {
        pk: u64,
        uuid: Option<Uuid>,
    }

    impl Entity for Widget {
        fn kind(&self) -> &str {
            "widget"
        }

        fn primary_key(&self) -> String {
            self.pk.to_string()
        }

        fn stable_id(&self) -> Option<Uuid> {
            self.uuid
        }
    }

    #[test]
    fn test_identity_prefers_stable_id() {
        let id = Uuid::new_v4();
        let with_uuid = Widget {
            pk: 3,
            uuid: Some(id),
        };
        let without = Widget { pk: 3, uuid: None };

        assert_eq!(with_uuid.identity(), id.to_string());
        assert_eq!(without.identity(), "3");
    }
}
