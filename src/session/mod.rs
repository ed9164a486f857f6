//! Per-connection session: subscription operations, event handling, teardown.
//!
//! One `Session` per connection, driven by a single cooperative task so that
//! change-event dispatches and subscribe/unsubscribe calls are processed
//! strictly in order — there is no shared mutable state between connections
//! in this engine beyond the broker's membership table.
//!
//! # Example
//!
//! ```ignore
//! let broker = Arc::new(LocalBroker::new());
//! let events = broker.register(conn_id);
//! let session = Session::new(conn_id, registry, broker, source, guard, replies_tx);
//!
//! let (commands_tx, commands_rx) = mpsc::unbounded_channel();
//! tokio::spawn(session.run(commands_rx, events));
//! ```

mod dispatcher;
mod table;

pub use dispatcher::Dispatcher;
pub use table::{SubscriptionEntry, SubscriptionKey, SubscriptionTable};

use crate::broker::GroupBroker;
use crate::error::{ObserveError, Result};
use crate::model::{EntitySource, PermissionGuard};
use crate::observer::{BoundObserver, ChangeHandler, ObserverRegistry};
use crate::types::{
    ChangeEvent, ConnectionId, ObservedEvent, ObserverId, Reply, RequestId, Selector, Status,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Inbound operation on a session, processed in order with change events.
#[derive(Debug)]
pub enum SessionCommand {
    Subscribe {
        observer: ObserverId,
        request_id: Option<RequestId>,
        selector: Selector,
    },
    Unsubscribe {
        observer: ObserverId,
        request_id: Option<RequestId>,
        selector: Selector,
    },
    Shutdown,
}

/// State for one client connection.
pub struct Session {
    id: ConnectionId,
    registry: Arc<ObserverRegistry>,
    broker: Arc<dyn GroupBroker>,
    source: Arc<dyn EntitySource>,
    dispatcher: Dispatcher,
    table: SubscriptionTable,
    replies: mpsc::UnboundedSender<Reply>,
}

impl Session {
    pub fn new(
        id: ConnectionId,
        registry: Arc<ObserverRegistry>,
        broker: Arc<dyn GroupBroker>,
        source: Arc<dyn EntitySource>,
        guard: Arc<dyn PermissionGuard>,
        replies: mpsc::UnboundedSender<Reply>,
    ) -> Self {
        let dispatcher = Dispatcher::new(source.clone(), guard);
        Self {
            id,
            registry,
            broker,
            source,
            dispatcher,
            table: SubscriptionTable::new(),
            replies,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    /// Number of live subscriptions on this connection.
    pub fn subscription_count(&self) -> usize {
        self.table.len()
    }

    /// Request id recorded for an observer/instance pair, if any.
    pub fn recorded_request_id(
        &self,
        observer: ObserverId,
        instance: &str,
    ) -> Option<RequestId> {
        self.table
            .lookup(&SubscriptionKey::new(observer, instance))
            .map(|entry| entry.request_id.clone())
    }

    /// Push a reply to the connection's outbound channel.
    pub fn send_reply(&self, reply: Reply) {
        if self.replies.send(reply).is_err() {
            warn!(conn = %self.id, "reply channel closed, dropping reply");
        }
    }

    /// Run the observed action through the dispatch boundary.
    pub async fn dispatch(
        &self,
        observer: &BoundObserver,
        request_id: Option<RequestId>,
        event: ObservedEvent,
    ) -> Reply {
        self.dispatcher
            .handle_observed_action(observer, request_id, event)
            .await
    }

    /// Subscribe this connection to change events for one instance.
    ///
    /// Requires a request id; validated before any side effect, so a failed
    /// subscribe leaves no group membership and no table entry. The reply is
    /// also pushed to the outbound channel.
    pub async fn subscribe_instance(
        &mut self,
        observer: ObserverId,
        request_id: Option<RequestId>,
        selector: Selector,
    ) -> Reply {
        let reply = match self
            .do_subscribe(observer, request_id.clone(), selector)
            .await
        {
            Ok(request_id) => Reply::ok(
                "subscribe_instance",
                Some(request_id),
                None,
                Status::CREATED,
            ),
            Err(e) => Reply::error("subscribe_instance", request_id, &e),
        };
        self.send_reply(reply.clone());
        reply
    }

    async fn do_subscribe(
        &mut self,
        observer_id: ObserverId,
        request_id: Option<RequestId>,
        selector: Selector,
    ) -> Result<RequestId> {
        let request_id = request_id
            .ok_or_else(|| ObserveError::Validation("request_id must have a value set".into()))?;
        let observer = self.observer(observer_id)?;

        let instance = self.source.get_object(&selector).await?;
        let groups = observer
            .subscribe(self.broker.as_ref(), self.id, instance.as_ref())
            .await?;

        let key = SubscriptionKey::new(observer_id, instance.identity());
        if let Some(replaced) = self.table.record(key, request_id.clone(), groups) {
            debug!(conn = %self.id, observer = %observer_id,
                   old = %replaced.request_id, new = %request_id,
                   "replaced request id for re-subscribed instance");
        }
        Ok(request_id)
    }

    /// Remove this connection's subscription for one instance.
    ///
    /// The table entry is removed even when a group leave fails (the failure
    /// is still reported in the reply), so accounting never outlives
    /// membership.
    pub async fn unsubscribe_instance(
        &mut self,
        observer: ObserverId,
        request_id: Option<RequestId>,
        selector: Selector,
    ) -> Reply {
        let reply = match self
            .do_unsubscribe(observer, request_id.clone(), selector)
            .await
        {
            Ok(request_id) => Reply::ok(
                "unsubscribe_instance",
                Some(request_id),
                None,
                Status::NO_CONTENT,
            ),
            Err(e) => Reply::error("unsubscribe_instance", request_id, &e),
        };
        self.send_reply(reply.clone());
        reply
    }

    async fn do_unsubscribe(
        &mut self,
        observer_id: ObserverId,
        request_id: Option<RequestId>,
        selector: Selector,
    ) -> Result<RequestId> {
        let request_id = request_id
            .ok_or_else(|| ObserveError::Validation("request_id must have a value set".into()))?;
        let observer = self.observer(observer_id)?;

        let instance = self.source.get_object(&selector).await?;
        let key = SubscriptionKey::new(observer_id, instance.identity());
        if !self.table.contains(&key) {
            return Err(ObserveError::NotSubscribed {
                observer: observer_id,
                instance: key.instance,
            });
        }

        let leave_result = observer
            .unsubscribe(self.broker.as_ref(), self.id, instance.as_ref())
            .await;
        // Deterministic removal: the entry goes even if a leave failed.
        let _ = self.table.remove(&key);
        leave_result?;
        Ok(request_id)
    }

    /// Handle one raw change event delivered by the broker.
    ///
    /// Resolves the target observer by the event's envelope tag, strips the
    /// envelope, and invokes the observer's bound handler. Events for
    /// unknown streams are dropped.
    pub async fn on_change_event(&mut self, raw: ChangeEvent) {
        let Some(observer) = self.registry.find_by_stream(&raw.stream) else {
            warn!(conn = %self.id, stream = %raw.stream, "event for unknown stream, dropping");
            return;
        };
        let event = observer.on_event(raw);
        let handler = observer.handler();
        if let Err(e) = handler.handle(self, observer, event).await {
            warn!(conn = %self.id, error = %e, "change handler failed");
        }
    }

    /// Drive the session until shutdown, then tear it down.
    ///
    /// Commands and change events are interleaved but processed one at a
    /// time. The loop ends on `Shutdown`, on either channel closing, or on
    /// transport disconnect (command sender dropped) — teardown runs in
    /// every case.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut events: mpsc::Receiver<ChangeEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Subscribe { observer, request_id, selector }) => {
                        self.subscribe_instance(observer, request_id, selector).await;
                    }
                    Some(SessionCommand::Unsubscribe { observer, request_id, selector }) => {
                        self.unsubscribe_instance(observer, request_id, selector).await;
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                },
                event = events.recv() => match event {
                    Some(raw) => self.on_change_event(raw).await,
                    None => break,
                },
            }
        }
        self.teardown().await;
    }

    /// Release every group membership and clear the table.
    ///
    /// Runs on every termination path; no event for this connection is
    /// processed once teardown begins.
    pub async fn teardown(&mut self) {
        for (key, entry) in self.table.drain() {
            for group in &entry.groups {
                if let Err(e) = self.broker.leave_group(self.id, group).await {
                    debug!(conn = %self.id, group, error = %e, "teardown leave failed");
                }
            }
            debug!(conn = %self.id, observer = %key.observer, instance = %key.instance,
                   "dropped subscription");
        }
        self.broker.deregister(self.id).await;
    }

    fn observer(&self, id: ObserverId) -> Result<Arc<BoundObserver>> {
        self.registry
            .get(id)
            .ok_or_else(|| ObserveError::Configuration(format!("unknown observer {id}")))
    }
}

/// The default change handler: look up the request id recorded for the
/// event's observer/instance pair and forward through the dispatch boundary.
pub struct ForwardingHandler;

#[async_trait]
impl ChangeHandler for ForwardingHandler {
    async fn handle(
        &self,
        session: &mut Session,
        observer: Arc<BoundObserver>,
        event: ObservedEvent,
    ) -> Result<()> {
        let selector = Selector::from_payload(&event.payload);
        let instance = payload_identity(&selector);
        let request_id = session.recorded_request_id(observer.id(), &instance);
        let reply = session.dispatch(observer.as_ref(), request_id, event).await;
        session.send_reply(reply);
        Ok(())
    }
}

/// Instance identity carried in an event payload: the stable id when
/// present, else the primary key.
fn payload_identity(selector: &Selector) -> String {
    match selector.get("uuid").or_else(|| selector.get("pk")) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
