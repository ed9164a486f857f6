//! Core types for the observer engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Unique identifier for a connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable handle for a bound observer, assigned by the registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObserverId(pub u64);

impl fmt::Debug for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObserverId({})", self.0)
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque client-supplied correlation token, echoed back on every reply
/// tied to a given subscribe call.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        RequestId(id.into())
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId(s.to_string())
    }
}

/// Kind of change observed on an entity instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Created,
    Updated,
    Deleted,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Symbolic HTTP-style result code. Not tied to any transport.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Status(pub u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const CREATED: Status = Status(201);
    pub const NO_CONTENT: Status = Status(204);
    pub const BAD_REQUEST: Status = Status(400);
    pub const FORBIDDEN: Status = Status(403);
    pub const NOT_FOUND: Status = Status(404);
    pub const INTERNAL_ERROR: Status = Status(500);
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({})", self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entity-addressing kwargs: the fields a collaborator needs to locate one
/// instance (primary key, uuid, parent ids, ...).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Selector(pub BTreeMap<String, Value>);

impl Selector {
    pub fn new() -> Self {
        Selector(BTreeMap::new())
    }

    /// Single-field selector, the common case.
    pub fn field(key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(key.into(), value.into());
        Selector(map)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read the selector fields out of an event payload. Non-object payloads
    /// yield an empty selector.
    pub fn from_payload(payload: &Value) -> Self {
        match payload {
            Value::Object(map) => Selector(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            _ => Selector::new(),
        }
    }

    /// Render as a JSON object (for delete replies and event payloads).
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// Raw change event as published to a group.
///
/// `stream` is the envelope tag naming the target observer; everything else
/// is the observed change. Delivered to every connection currently joined to
/// the event's group(s).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Envelope tag routing the event to a bound observer.
    #[serde(rename = "type")]
    pub stream: String,

    /// What happened to the instance.
    pub action: Action,

    /// Entity fields: addressing kwargs plus, for deletes, the last-known data.
    pub payload: Value,
}

/// Change event with the transport envelope stripped, as handed to a
/// change handler.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedEvent {
    pub action: Action,
    pub payload: Value,
}

/// Outbound message to the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Name of the action this reply answers ("subscribe_instance",
    /// "created", ...).
    pub action: String,

    /// Correlation token from the subscribe call, if one was recorded.
    pub request_id: Option<RequestId>,

    /// Serialized payload, when the action produced one.
    pub data: Option<Value>,

    /// Error descriptions; empty on success.
    pub errors: Vec<String>,

    pub status: Status,
}

impl Reply {
    pub fn ok(
        action: impl Into<String>,
        request_id: Option<RequestId>,
        data: Option<Value>,
        status: Status,
    ) -> Self {
        Reply {
            action: action.into(),
            request_id,
            data,
            errors: Vec::new(),
            status,
        }
    }

    pub fn error(
        action: impl Into<String>,
        request_id: Option<RequestId>,
        error: &crate::error::ObserveError,
    ) -> Self {
        Reply {
            action: action.into(),
            request_id,
            data: None,
            errors: vec![error.to_string()],
            status: error.status(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_serde() {
        assert_eq!(serde_json::to_value(Action::Created).unwrap(), json!("created"));
        let parsed: Action = serde_json::from_value(json!("deleted")).unwrap();
        assert_eq!(parsed, Action::Deleted);
    }

    #[test]
    fn test_selector_from_payload() {
        let payload = json!({"pk": 7, "uuid": "abc"});
        let selector = Selector::from_payload(&payload);
        assert_eq!(selector.get("pk"), Some(&json!(7)));
        assert_eq!(selector.get("uuid"), Some(&json!("abc")));

        // Non-object payloads resolve to nothing
        assert!(Selector::from_payload(&json!(42)).is_empty());
    }

    #[test]
    fn test_selector_roundtrip() {
        let selector = Selector::field("pk", 3).with("branch", "main");
        let value = selector.to_value();
        assert_eq!(Selector::from_payload(&value), selector);
    }

    #[test]
    fn test_change_event_envelope_tag() {
        let event = ChangeEvent {
            stream: "gadgets.handle_instance_change".into(),
            action: Action::Updated,
            payload: json!({"pk": 1}),
        };
        let wire = serde_json::to_value(&event).unwrap();
        // The envelope tag serializes under "type"
        assert_eq!(wire["type"], json!("gadgets.handle_instance_change"));
        let back: ChangeEvent = serde_json::from_value(wire).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_reply_error_carries_status() {
        let err = crate::error::ObserveError::PermissionDenied("nope".into());
        let reply = Reply::error("updated", Some("r1".into()), &err);
        assert!(reply.is_error());
        assert_eq!(reply.status, Status::FORBIDDEN);
        assert_eq!(reply.errors, vec!["Permission denied: nope".to_string()]);
    }
}
