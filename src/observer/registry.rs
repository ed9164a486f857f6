//! Observer registry and binding resolution.

use crate::error::{ObserveError, Result};
use crate::model::EntitySerializer;
use crate::observer::bound::BoundObserver;
use crate::observer::descriptor::{Descriptor, GroupNameFn};
use crate::types::ObserverId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Declarative registration unit: one consumer's declared values and
/// descriptors.
///
/// A consumer that declares no entity kind binds nothing itself; it only
/// contributes values and descriptors when listed as an ancestor of a spec
/// that does declare one.
#[derive(Clone, Default)]
pub struct ConsumerSpec {
    pub name: String,
    pub entity_kind: Option<String>,
    pub prefix: Option<String>,
    pub group_fn: Option<GroupNameFn>,
    pub serializer: Option<Arc<dyn EntitySerializer>>,
    pub stream: Option<String>,
    pub observers: Vec<(String, Descriptor)>,
}

impl ConsumerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn entity_kind(mut self, kind: impl Into<String>) -> Self {
        self.entity_kind = Some(kind.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn group_fn(mut self, f: GroupNameFn) -> Self {
        self.group_fn = Some(f);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn EntitySerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    pub fn observer(mut self, name: impl Into<String>, descriptor: Descriptor) -> Self {
        self.observers.push((name.into(), descriptor));
        self
    }
}

/// Values resolved so far while walking the ancestor chain.
struct ResolvedValues {
    entity_kind: String,
    prefix: Option<String>,
    group_fn: Option<GroupNameFn>,
    serializer: Option<Arc<dyn EntitySerializer>>,
    stream: Option<String>,
}

/// Registry of bound observers, keyed by a stable integer handle.
///
/// Built once at program initialization, then shared immutably (wrap in
/// `Arc`) with every connection.
pub struct ObserverRegistry {
    next_id: u64,
    observers: HashMap<ObserverId, Arc<BoundObserver>>,
    by_name: HashMap<(String, String), ObserverId>,
    by_stream: HashMap<String, ObserverId>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            observers: HashMap::new(),
            by_name: HashMap::new(),
            by_stream: HashMap::new(),
        }
    }

    /// Bind every descriptor reachable from `spec` and its ancestors.
    ///
    /// Resolution:
    ///
    /// 1. The entity kind comes from `spec`'s own declaration only. With no
    ///    entity kind and no reachable descriptors this is a no-op; with
    ///    descriptors it is a configuration error.
    /// 2. `prefix`, `group_fn` and `stream` start from `spec` and take an
    ///    ancestor's value only while still unset; `serializer` takes the
    ///    value of every ancestor that defines one (nearest ancestor wins
    ///    last along the walk).
    /// 3. `spec`'s own descriptors bind with the starting values; each
    ///    ancestor's descriptors re-bind with the values resolved up to that
    ///    ancestor, replacing earlier bindings of the same observer name.
    ///
    /// Binding is idempotent: re-binding a descriptor with the same resolved
    /// inputs keeps the observer's id and behavior.
    pub fn register(
        &mut self,
        spec: &ConsumerSpec,
        ancestors: &[&ConsumerSpec],
    ) -> Result<Vec<ObserverId>> {
        let Some(entity_kind) = spec.entity_kind.clone() else {
            let reachable = spec.observers.len()
                + ancestors.iter().map(|a| a.observers.len()).sum::<usize>();
            if reachable > 0 {
                return Err(ObserveError::Configuration(format!(
                    "consumer {} declares {} observer(s) but no entity kind",
                    spec.name, reachable
                )));
            }
            return Ok(Vec::new());
        };

        let mut values = ResolvedValues {
            entity_kind,
            prefix: spec.prefix.clone(),
            group_fn: spec.group_fn.clone(),
            serializer: spec.serializer.clone(),
            stream: spec.stream.clone(),
        };

        let mut bound = Vec::new();
        for (name, descriptor) in &spec.observers {
            bound.push(self.bind(&spec.name, name, descriptor, &values)?);
        }

        for ancestor in ancestors {
            if values.prefix.is_none() {
                values.prefix = ancestor.prefix.clone();
            }
            if values.group_fn.is_none() {
                values.group_fn = ancestor.group_fn.clone();
            }
            if values.stream.is_none() {
                values.stream = ancestor.stream.clone();
            }
            // Serializer resolution is the asymmetric one: every ancestor
            // that defines a serializer overwrites the value resolved so far.
            if let Some(serializer) = &ancestor.serializer {
                values.serializer = Some(serializer.clone());
            }

            for (name, descriptor) in &ancestor.observers {
                bound.push(self.bind(&spec.name, name, descriptor, &values)?);
            }
        }

        Ok(bound)
    }

    fn bind(
        &mut self,
        consumer: &str,
        name: &str,
        descriptor: &Descriptor,
        values: &ResolvedValues,
    ) -> Result<ObserverId> {
        let key = (consumer.to_string(), name.to_string());
        // Re-binding keeps the observer's id stable.
        let id = match self.by_name.get(&key) {
            Some(existing) => *existing,
            None => {
                let id = ObserverId(self.next_id);
                self.next_id += 1;
                id
            }
        };

        let stream = values
            .stream
            .clone()
            .unwrap_or_else(|| format!("{consumer}.{name}"));
        if let Some(other) = self.by_stream.get(&stream) {
            if *other != id {
                return Err(ObserveError::Configuration(format!(
                    "stream tag {stream} already bound to observer {other}"
                )));
            }
        }

        let observer = BoundObserver {
            id,
            consumer: consumer.to_string(),
            name: name.to_string(),
            entity_kind: values.entity_kind.clone(),
            prefix: values.prefix.clone().unwrap_or_default(),
            stream: stream.clone(),
            group_strategy: descriptor
                .group_override
                .clone()
                .or_else(|| values.group_fn.clone()),
            serializer: descriptor
                .serializer_override
                .clone()
                .or_else(|| values.serializer.clone()),
            handler: descriptor.handler.clone(),
        };

        // Replace any earlier binding of this observer, stream index included.
        if let Some(previous) = self.observers.insert(id, Arc::new(observer)) {
            self.by_stream.remove(&previous.stream);
        }
        self.by_name.insert(key, id);
        self.by_stream.insert(stream, id);
        debug!(consumer, name, %id, "bound observer");
        Ok(id)
    }

    pub fn get(&self, id: ObserverId) -> Option<Arc<BoundObserver>> {
        self.observers.get(&id).cloned()
    }

    pub fn find(&self, consumer: &str, name: &str) -> Option<Arc<BoundObserver>> {
        self.by_name
            .get(&(consumer.to_string(), name.to_string()))
            .and_then(|id| self.get(*id))
    }

    /// Resolve the observer a raw change event is addressed to.
    pub fn find_by_stream(&self, stream: &str) -> Option<Arc<BoundObserver>> {
        self.by_stream.get(stream).and_then(|id| self.get(*id))
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
