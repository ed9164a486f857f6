//! # Vigil
//!
//! An observer binding and dispatch engine for live entity subscriptions:
//! persistent-connection clients subscribe to change notifications
//! (create/update/delete) for a specific entity instance and receive
//! re-serialized state pushed back, correlated by their own request id.
//!
//! ## Core Concepts
//!
//! - **Descriptors**: unbound change-handlers with optional group-name and
//!   serializer overrides
//! - **Binding**: the registry resolves entity kind, prefix, group strategy
//!   and serializer across an ancestor chain, once, at startup
//! - **Groups**: named broadcast channels in the broker; group names are
//!   computed from entity identity
//! - **Sessions**: one task per connection owning its subscription table;
//!   dispatch converts a raw change event into a permission-checked,
//!   re-fetched reply
//!
//! ## Example
//!
//! ```ignore
//! use vigil::{ConsumerSpec, Descriptor, LocalBroker, ObserverRegistry, Session};
//!
//! let mut registry = ObserverRegistry::new();
//! let ids = registry.register(
//!     &ConsumerSpec::new("gadgets")
//!         .entity_kind("gadget")
//!         .prefix("gadgets")
//!         .serializer(gadget_serializer)
//!         .observer("handle_instance_change", Descriptor::forwarding()),
//!     &[],
//! )?;
//!
//! let broker = Arc::new(LocalBroker::new());
//! let events = broker.register(conn_id);
//! let session = Session::new(conn_id, registry.into(), broker, source, guard, replies);
//! tokio::spawn(session.run(commands, events));
//! ```

pub mod broker;
pub mod error;
pub mod model;
pub mod observer;
pub mod session;
pub mod types;

// Re-exports
pub use broker::{BrokerConfig, GroupBroker, LocalBroker};
pub use error::{ObserveError, Result};
pub use model::{Entity, EntitySerializer, EntitySource, PermissionGuard};
pub use observer::{
    BoundObserver, ChangeHandler, ConsumerSpec, Descriptor, GroupNameFn, ObserverRegistry,
};
pub use session::{
    Dispatcher, ForwardingHandler, Session, SessionCommand, SubscriptionEntry, SubscriptionKey,
    SubscriptionTable,
};
pub use types::*;
