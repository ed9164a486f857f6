//! Observer binding: descriptors, the registry, and bound observers.
//!
//! Binding happens once, at program initialization:
//!
//! 1. A [`Descriptor`] holds an unbound change-handler plus optional
//!    group-name and serializer overrides.
//! 2. A [`ConsumerSpec`] declares an entity kind, prefix, group-name
//!    strategy, serializer and stream tag for a set of descriptors, and may
//!    name ancestor specs whose values fill gaps.
//! 3. [`ObserverRegistry::register`] resolves those values across the
//!    ancestor chain and produces one [`BoundObserver`] per descriptor.
//!
//! Bound observers are immutable and shared across connections; unresolvable
//! bindings fail at registration, never at request time.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = ObserverRegistry::new();
//! let spec = ConsumerSpec::new("gadgets")
//!     .entity_kind("gadget")
//!     .prefix("gadgets")
//!     .serializer(gadget_serializer)
//!     .observer("handle_instance_change", Descriptor::forwarding());
//! let ids = registry.register(&spec, &[])?;
//! ```

mod bound;
mod descriptor;
mod registry;

pub use bound::BoundObserver;
pub use descriptor::{ChangeHandler, Descriptor, GroupNameFn};
pub use registry::{ConsumerSpec, ObserverRegistry};
