//! Unbound observer descriptor.

use crate::error::Result;
use crate::model::{Entity, EntitySerializer};
use crate::observer::BoundObserver;
use crate::session::{ForwardingHandler, Session};
use crate::types::ObservedEvent;
use async_trait::async_trait;
use std::sync::Arc;

/// Handler invoked on the owning connection's task when a change event
/// reaches a subscribed connection.
///
/// The default implementation ([`ForwardingHandler`]) looks up the recorded
/// request id and forwards the event through the dispatch boundary; custom
/// handlers can short-circuit, transform, or fan out instead.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(
        &self,
        session: &mut Session,
        observer: Arc<BoundObserver>,
        event: ObservedEvent,
    ) -> Result<()>;
}

/// Per-instance group-name strategy: `(prefix, instance)` → group names.
/// Must be pure and deterministic given the same instance state.
pub type GroupNameFn = Arc<dyn Fn(&str, &dyn Entity) -> Vec<String> + Send + Sync>;

/// An unbound observer: a change-handler plus optional strategy overrides,
/// declared before binding.
///
/// Not usable for subscription until [`ObserverRegistry::register`] binds it
/// to an entity kind.
///
/// [`ObserverRegistry::register`]: crate::observer::ObserverRegistry::register
#[derive(Clone)]
pub struct Descriptor {
    pub(crate) handler: Arc<dyn ChangeHandler>,
    pub(crate) group_override: Option<GroupNameFn>,
    pub(crate) serializer_override: Option<Arc<dyn EntitySerializer>>,
}

impl Descriptor {
    pub fn new(handler: Arc<dyn ChangeHandler>) -> Self {
        Self {
            handler,
            group_override: None,
            serializer_override: None,
        }
    }

    /// Descriptor with the default request-id-correlating handler.
    pub fn forwarding() -> Self {
        Self::new(Arc::new(ForwardingHandler))
    }

    /// Set the per-instance group-name generator. Fully replaces the default
    /// single-name strategy.
    pub fn groups(mut self, f: GroupNameFn) -> Self {
        self.group_override = Some(f);
        self
    }

    /// Set the serializer override for this observer.
    pub fn serializer(mut self, serializer: Arc<dyn EntitySerializer>) -> Self {
        self.serializer_override = Some(serializer);
        self
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("group_override", &self.group_override.is_some())
            .field("serializer_override", &self.serializer_override.is_some())
            .finish()
    }
}
