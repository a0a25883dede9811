//! Pushed event envelope and payload decoding.
//!
//! The channel delivers named messages `{ action, entity, payload }` where
//! the payload is a full entity (create), a partial patch (update) or a bare
//! key (delete). Deduplication keys on business identity (entity kind +
//! entity id + action), never on a transport-level message id.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::ids::InvalidId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
}

impl EventAction {
    pub fn as_str(self) -> &'static str {
        match self {
            EventAction::Created => "created",
            EventAction::Updated => "updated",
            EventAction::Deleted => "deleted",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Visitor,
    Ticket,
    Company,
    User,
    Appointment,
    Conversation,
    Message,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Visitor => "visitor",
            EntityKind::Ticket => "ticket",
            EntityKind::Company => "company",
            EntityKind::User => "user",
            EntityKind::Appointment => "appointment",
            EntityKind::Conversation => "conversation",
            EntityKind::Message => "message",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("{entity} event payload has no id")]
    MissingId { entity: &'static str },
    #[error("malformed {entity} payload: {source}")]
    Malformed {
        entity: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
}

/// One pushed create/update/delete notification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushEvent {
    pub action: EventAction,
    pub entity: EntityKind,
    pub payload: Value,
}

impl PushEvent {
    /// Business identity of this event, for deduplication.
    pub fn event_key(&self) -> Result<EventKey, EventError> {
        let id = payload_key(self.entity, &self.payload)?;
        Ok(EventKey {
            entity: self.entity,
            action: self.action,
            id,
        })
    }

    /// Decode the payload as a full entity or a partial patch.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| EventError::Malformed {
            entity: self.entity.as_str(),
            source,
        })
    }

    /// Decode a delete payload: either a bare key string or `{ "id": ... }`.
    pub fn decode_key(&self) -> Result<String, EventError> {
        payload_key(self.entity, &self.payload)
    }
}

fn payload_key(entity: EntityKind, payload: &Value) -> Result<String, EventError> {
    let raw = match payload {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("id").and_then(id_value_str),
        _ => None,
    };
    match raw {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(EventError::MissingId {
            entity: entity.as_str(),
        }),
    }
}

fn id_value_str(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        _ => None,
    }
}

/// `(entity kind, action, entity id)` - the dedup signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub entity: EntityKind,
    pub action: EventAction,
    pub id: String,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.entity, self.action.as_str(), self.id)
    }
}
