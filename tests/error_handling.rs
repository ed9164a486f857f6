//! Error handling and edge case tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;
use vigil::{
    Action, ChangeEvent, ConnectionId, ConsumerSpec, Descriptor, Entity, EntitySerializer,
    EntitySource, LocalBroker, ObserveError, ObserverId, ObserverRegistry, PermissionGuard, Reply,
    Result, Selector, Session, Status,
};

#[derive(Clone)]
struct Gadget {
    pk: u64,
    uuid: Uuid,
}

impl Entity for Gadget {
    fn kind(&self) -> &str {
        "gadget"
    }

    fn primary_key(&self) -> String {
        self.pk.to_string()
    }

    fn stable_id(&self) -> Option<Uuid> {
        Some(self.uuid)
    }
}

#[derive(Default)]
struct GadgetStore {
    items: RwLock<HashMap<u64, Gadget>>,
    fetches: AtomicUsize,
}

impl GadgetStore {
    fn insert(&self, gadget: Gadget) {
        self.items.write().insert(gadget.pk, gadget);
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

fn value_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl EntitySource for GadgetStore {
    async fn get_object(&self, selector: &Selector) -> Result<Arc<dyn Entity>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let items = self.items.read();
        let found = if let Some(uuid) = selector.get("uuid") {
            let wanted = value_str(uuid);
            items.values().find(|g| g.uuid.to_string() == wanted)
        } else if let Some(pk) = selector.get("pk") {
            let wanted = value_str(pk);
            items.values().find(|g| g.pk.to_string() == wanted)
        } else {
            None
        };
        found
            .map(|g| Arc::new(g.clone()) as Arc<dyn Entity>)
            .ok_or_else(|| ObserveError::NotFound(format!("no gadget matches {selector:?}")))
    }
}

struct CountingSerializer {
    calls: AtomicUsize,
}

#[async_trait]
impl EntitySerializer for CountingSerializer {
    async fn serialize(&self, instance: &dyn Entity) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"pk": instance.primary_key()}))
    }
}

/// Permission guard that can be flipped after subscription.
struct Gate {
    allow: AtomicBool,
    checks: AtomicUsize,
}

impl Gate {
    fn open() -> Self {
        Self {
            allow: AtomicBool::new(true),
            checks: AtomicUsize::new(0),
        }
    }

    fn close(&self) {
        self.allow.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl PermissionGuard for Gate {
    async fn check_permissions(&self, action: Action, _selector: &Selector) -> Result<()> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.allow.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ObserveError::PermissionDenied(format!(
                "action {action} not permitted"
            )))
        }
    }
}

struct Fixture {
    store: Arc<GadgetStore>,
    serializer: Arc<CountingSerializer>,
    gate: Arc<Gate>,
    registry: Arc<ObserverRegistry>,
    broker: Arc<LocalBroker>,
    observer: ObserverId,
}

fn fixture() -> Fixture {
    fixture_with(|spec, serializer| spec.serializer(serializer))
}

/// Build the fixture, letting the caller decide how the spec uses the
/// serializer (or not at all).
fn fixture_with(
    configure: impl FnOnce(ConsumerSpec, Arc<CountingSerializer>) -> ConsumerSpec,
) -> Fixture {
    let store = Arc::new(GadgetStore::default());
    store.insert(Gadget {
        pk: 1,
        uuid: Uuid::new_v4(),
    });

    let serializer = Arc::new(CountingSerializer {
        calls: AtomicUsize::new(0),
    });
    let spec = configure(
        ConsumerSpec::new("gadgets")
            .entity_kind("gadget")
            .prefix("gadgets")
            .observer("handle_instance_change", Descriptor::forwarding()),
        serializer.clone(),
    );

    let mut registry = ObserverRegistry::new();
    let ids = registry.register(&spec, &[]).unwrap();

    Fixture {
        store,
        serializer,
        gate: Arc::new(Gate::open()),
        registry: Arc::new(registry),
        broker: Arc::new(LocalBroker::new()),
        observer: ids[0],
    }
}

impl Fixture {
    fn session(&self, conn: u64) -> (Session, mpsc::UnboundedReceiver<Reply>) {
        let conn = ConnectionId(conn);
        let _events = self.broker.register(conn);
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let session = Session::new(
            conn,
            self.registry.clone(),
            self.broker.clone(),
            self.store.clone(),
            self.gate.clone(),
            replies_tx,
        );
        (session, replies_rx)
    }

    fn event(&self, action: Action) -> ChangeEvent {
        let gadget = self.store.items.read().get(&1).unwrap().clone();
        ChangeEvent {
            stream: "gadgets.handle_instance_change".into(),
            action,
            payload: json!({"pk": "1", "uuid": gadget.uuid}),
        }
    }
}

// --- Subscribe/unsubscribe errors ---

#[tokio::test]
async fn test_subscribe_without_request_id_has_no_side_effects() {
    let fx = fixture();
    let (mut session, _replies) = fx.session(1);

    let reply = session
        .subscribe_instance(fx.observer, None, Selector::field("pk", 1))
        .await;

    assert!(reply.is_error());
    assert_eq!(reply.status, Status::BAD_REQUEST);
    // Validated before any collaborator call: nothing fetched, nothing joined.
    assert_eq!(fx.store.fetch_count(), 0);
    assert_eq!(fx.broker.membership_count(ConnectionId(1)), 0);
    assert_eq!(session.subscription_count(), 0);
}

#[tokio::test]
async fn test_subscribe_unknown_instance_is_not_found() {
    let fx = fixture();
    let (mut session, _replies) = fx.session(1);

    let reply = session
        .subscribe_instance(fx.observer, Some("r1".into()), Selector::field("pk", 999))
        .await;

    assert!(reply.is_error());
    assert_eq!(reply.status, Status::NOT_FOUND);
    assert_eq!(fx.broker.membership_count(ConnectionId(1)), 0);
    assert_eq!(session.subscription_count(), 0);
}

#[tokio::test]
async fn test_unsubscribe_without_entry_is_reported() {
    let fx = fixture();
    let (mut session, _replies) = fx.session(1);

    let reply = session
        .unsubscribe_instance(fx.observer, Some("r1".into()), Selector::field("pk", 1))
        .await;

    assert!(reply.is_error());
    assert_eq!(reply.status, Status::NOT_FOUND);
    assert!(reply.errors[0].contains("Not subscribed"));
}

#[tokio::test]
async fn test_unsubscribe_without_request_id_fails_validation() {
    let fx = fixture();
    let (mut session, _replies) = fx.session(1);

    session
        .subscribe_instance(fx.observer, Some("r1".into()), Selector::field("pk", 1))
        .await;

    let reply = session
        .unsubscribe_instance(fx.observer, None, Selector::field("pk", 1))
        .await;
    assert_eq!(reply.status, Status::BAD_REQUEST);
    // The subscription is untouched.
    assert_eq!(session.subscription_count(), 1);
}

#[tokio::test]
async fn test_subscribe_unknown_observer_is_configuration_error() {
    let fx = fixture();
    let (mut session, _replies) = fx.session(1);

    let reply = session
        .subscribe_instance(ObserverId(999), Some("r1".into()), Selector::field("pk", 1))
        .await;

    assert!(reply.is_error());
    assert_eq!(reply.status, Status::INTERNAL_ERROR);
}

// --- Dispatch errors ---

#[tokio::test]
async fn test_permission_denial_skips_retrieval() {
    let fx = fixture();
    let (mut session, mut replies) = fx.session(1);

    session
        .subscribe_instance(fx.observer, Some("r1".into()), Selector::field("pk", 1))
        .await;
    let _ = replies.recv().await.unwrap();
    let fetches_before = fx.store.fetch_count();

    fx.gate.close();
    session.on_change_event(fx.event(Action::Updated)).await;

    let reply = replies.recv().await.unwrap();
    assert!(reply.is_error());
    assert_eq!(reply.status, Status::FORBIDDEN);
    assert_eq!(reply.request_id, Some("r1".into()));
    // Denial short-circuits: no re-fetch, no serialization.
    assert_eq!(fx.store.fetch_count(), fetches_before);
    assert_eq!(fx.serializer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_event_without_recorded_request_id_fails_validation() {
    let fx = fixture();
    let (mut session, mut replies) = fx.session(1);

    // No subscription was ever made; the event still reaches the handler.
    session.on_change_event(fx.event(Action::Updated)).await;

    let reply = replies.recv().await.unwrap();
    assert!(reply.is_error());
    assert_eq!(reply.status, Status::BAD_REQUEST);
    assert_eq!(reply.request_id, None);
}

#[tokio::test]
async fn test_event_for_unknown_stream_is_dropped() {
    let fx = fixture();
    let (mut session, mut replies) = fx.session(1);

    session
        .on_change_event(ChangeEvent {
            stream: "nope.nothing".into(),
            action: Action::Updated,
            payload: json!({"pk": "1"}),
        })
        .await;

    // No reply of any kind.
    assert!(replies.try_recv().is_err());
}

#[tokio::test]
async fn test_missing_serializer_surfaces_as_error_reply() {
    // Spec never binds the serializer.
    let fx = fixture_with(|spec, _serializer| spec);
    let (mut session, mut replies) = fx.session(1);

    session
        .subscribe_instance(fx.observer, Some("r1".into()), Selector::field("pk", 1))
        .await;
    let _ = replies.recv().await.unwrap();

    session.on_change_event(fx.event(Action::Updated)).await;

    let reply = replies.recv().await.unwrap();
    assert!(reply.is_error());
    assert_eq!(reply.status, Status::INTERNAL_ERROR);
    // The connection survives; further events still dispatch.
    session.on_change_event(fx.event(Action::Deleted)).await;
    let reply = replies.recv().await.unwrap();
    assert_eq!(reply.status, Status::NO_CONTENT);
}

#[tokio::test]
async fn test_deleted_event_skips_permission_denied_retrieval_path() {
    // Deletes still go through the permission check.
    let fx = fixture();
    let (mut session, mut replies) = fx.session(1);

    session
        .subscribe_instance(fx.observer, Some("r1".into()), Selector::field("pk", 1))
        .await;
    let _ = replies.recv().await.unwrap();

    fx.gate.close();
    session.on_change_event(fx.event(Action::Deleted)).await;

    let reply = replies.recv().await.unwrap();
    assert!(reply.is_error());
    assert_eq!(reply.status, Status::FORBIDDEN);
}

// --- Teardown ---

#[tokio::test]
async fn test_teardown_releases_all_memberships() {
    let fx = fixture();
    fx.store.insert(Gadget {
        pk: 2,
        uuid: Uuid::new_v4(),
    });
    let (mut session, _replies) = fx.session(1);

    session
        .subscribe_instance(fx.observer, Some("r1".into()), Selector::field("pk", 1))
        .await;
    session
        .subscribe_instance(fx.observer, Some("r2".into()), Selector::field("pk", 2))
        .await;
    assert_eq!(fx.broker.membership_count(ConnectionId(1)), 2);

    session.teardown().await;

    assert_eq!(fx.broker.membership_count(ConnectionId(1)), 0);
    assert_eq!(session.subscription_count(), 0);
}
