//! Server-push message decoding and routing.
//!
//! Messages arrive as `{topic, type, payload}` where `topic` is `"<prefix>/<table>/<id>/..."` and `payload` is a
//! JSON-encoded string. The [`PushRouter`] decides what a message type does to the local table.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// Raw message as delivered by the push stream. Every field may be missing in a malformed message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(default)]
    pub topic:      Option<String>,
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub payload:    Option<String>,
}

impl PushMessage {
    pub fn new<T: Into<String>, E: Into<String>, P: Into<String>>(topic: T, event_type: E, payload: P) -> Self {
        Self {
            topic:      Some(topic.into()),
            event_type: Some(event_type.into()),
            payload:    Some(payload.into()),
        }
    }
}

/// A decoded push message.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub table:      String,
    pub id:         Option<String>,
    pub event_type: String,
    pub payload:    Value,
}

impl PushEvent {
    /// Returns `None` for malformed messages.
    pub fn parse(message: &PushMessage) -> Option<Self> {
        let (Some(topic), Some(event_type), Some(payload)) = (&message.topic, &message.event_type, &message.payload)
        else {
            return None;
        };

        let mut segments = topic.split('/').skip(1);
        let table = segments.next().filter(|s| !s.is_empty())?.to_string();
        let id = segments.next().filter(|s| !s.is_empty()).map(str::to_string);

        let payload = match serde_json::from_str(payload) {
            Ok(p) => p,
            Err(err) => {
                warn!("Undecodable payload of a '{event_type}' push on '{topic}': {err}");
                return None;
            }
        };

        Some(Self {
            table,
            id,
            event_type: event_type.clone(),
            payload,
        })
    }
}

/// How to pick the new field value out of a patch payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchValue {
    Whole,
    /// A member of an object payload.
    Member(String),
    /// The first element of an array payload, as in `[new, old]` pairs.
    First,
}

impl PatchValue {
    pub fn extract(&self, payload: Value) -> Option<Value> {
        match (self, payload) {
            (Self::Whole, payload) => Some(payload),
            (Self::Member(name), Value::Object(mut map)) => map.remove(name),
            (Self::First, Value::Array(items)) => items.into_iter().next(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushAction {
    /// Insert or replace the whole record.
    Upsert,
    Remove,
    /// Set a single field of an existing record identified by the topic id.
    Patch { field: String, value: PatchValue },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventMatch {
    Exact(String),
    Suffix(String),
}

impl EventMatch {
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Exact(name) => name == event_type,
            Self::Suffix(suffix) => event_type.ends_with(suffix.as_str()),
        }
    }
}

/// Ordered list of routes. The first matching route wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRouter {
    routes: Vec<(EventMatch, PushAction)>,
}

impl PushRouter {
    pub fn empty() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn route(mut self, matcher: EventMatch, action: PushAction) -> Self {
        self.routes.push((matcher, action));
        self
    }

    pub fn action_for(&self, event_type: &str) -> Option<&PushAction> {
        self.routes
            .iter()
            .find(|(matcher, _)| matcher.matches(event_type))
            .map(|(_, action)| action)
    }
}

impl Default for PushRouter {
    fn default() -> Self {
        let patch = |field: &str, value: PatchValue| PushAction::Patch {
            field: field.to_string(),
            value,
        };
        Self::empty()
            .route(
                EventMatch::Exact("ItemStateChangedEvent".into()),
                patch("state", PatchValue::Member("value".into())),
            )
            .route(
                EventMatch::Exact("ItemStateEvent".into()),
                patch("state", PatchValue::Member("value".into())),
            )
            .route(
                EventMatch::Exact("ThingStatusInfoChangedEvent".into()),
                patch("statusInfo", PatchValue::First),
            )
            .route(
                EventMatch::Exact("RuleStatusInfoEvent".into()),
                patch("status", PatchValue::Whole),
            )
            .route(EventMatch::Suffix("AddedEvent".into()), PushAction::Upsert)
            .route(EventMatch::Suffix("UpdatedEvent".into()), PushAction::Upsert)
            .route(EventMatch::Suffix("RemovedEvent".into()), PushAction::Remove)
    }
}
