//! Change-event dispatch: raw event in, client reply out.

use crate::error::{ObserveError, Result};
use crate::model::{EntitySource, PermissionGuard};
use crate::observer::BoundObserver;
use crate::types::{Action, ObservedEvent, Reply, RequestId, Selector, Status};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Turns one observed change event into one reply for one connection.
///
/// Per dispatch: permission check, then either a short-circuit reply
/// (deletes) or re-fetch + serialize. Every failure is converted to an error
/// reply at this boundary; nothing propagates out and kills the connection
/// task.
pub struct Dispatcher {
    source: Arc<dyn EntitySource>,
    guard: Arc<dyn PermissionGuard>,
}

impl Dispatcher {
    pub fn new(source: Arc<dyn EntitySource>, guard: Arc<dyn PermissionGuard>) -> Self {
        Self { source, guard }
    }

    /// Run the observed action.
    pub async fn handle_observed_action(
        &self,
        observer: &BoundObserver,
        request_id: Option<RequestId>,
        event: ObservedEvent,
    ) -> Reply {
        let action = event.action;
        match self.dispatch(observer, request_id.clone(), event).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(%action, error = %e, "dispatch failed, replying with error");
                Reply::error(action.as_str(), request_id, &e)
            }
        }
    }

    async fn dispatch(
        &self,
        observer: &BoundObserver,
        request_id: Option<RequestId>,
        event: ObservedEvent,
    ) -> Result<Reply> {
        let request_id = request_id.ok_or_else(|| {
            ObserveError::Validation("no request id recorded for this observer".to_string())
        })?;

        let selector = Selector::from_payload(&event.payload);
        self.guard
            .check_permissions(event.action, &selector)
            .await?;

        // Deletes reply with the event's last-known payload; the entity is
        // gone and must not be re-fetched.
        if event.action == Action::Deleted {
            return Ok(Reply::ok(
                event.action.as_str(),
                Some(request_id),
                Some(event.payload),
                Status::NO_CONTENT,
            ));
        }

        let (data, status) = self.retrieve(observer, &selector).await?;
        Ok(Reply::ok(
            event.action.as_str(),
            Some(request_id),
            Some(data),
            status,
        ))
    }

    /// Retrieval path: re-fetch the instance and re-serialize its state.
    async fn retrieve(
        &self,
        observer: &BoundObserver,
        selector: &Selector,
    ) -> Result<(Value, Status)> {
        let instance = self.source.get_object(selector).await?;
        let serializer = observer.serializer().ok_or_else(|| {
            ObserveError::Configuration(format!(
                "observer {}.{} has no serializer bound",
                observer.consumer(),
                observer.name()
            ))
        })?;
        let data = serializer.serialize(instance.as_ref()).await?;
        Ok((data, Status::OK))
    }
}
