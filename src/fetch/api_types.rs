//! Serde types matching the admin API's response bodies.
//!
//! Endpoints wrap their bodies inconsistently (`data.data.data`, `data.data`,
//! `data` or nothing at all). [`normalize`] peels those envelopes once so
//! nothing downstream branches on response shape.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{Payload, RemotePage};
use crate::entity::{Entity, EntityId, ResourceType};
use crate::lifecycle::LifecycleState;

/// Envelopes never nest deeper than `data.data.data`.
const MAX_ENVELOPE_DEPTH: usize = 3;

// ============================================================================
// Entity body
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiEntity {
  pub id: i64,
  #[serde(rename = "isDeleted", default)]
  pub is_deleted: bool,
  // Everything else is resource-specific
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl ApiEntity {
  pub fn into_entity(self, resource: ResourceType) -> Entity {
    Entity {
      id: EntityId(self.id),
      resource,
      state: LifecycleState::from_deleted_flag(self.is_deleted),
      payload: self.fields,
    }
  }
}

// ============================================================================
// Envelope handling
// ============================================================================

fn read_total(map: &Map<String, Value>) -> Option<u64> {
  ["totalCount", "total", "count"]
    .iter()
    .find_map(|field| map.get(*field).and_then(Value::as_u64))
}

/// Strip response envelopes and classify the body.
pub fn normalize(resource: ResourceType, body: Value) -> serde_json::Result<Payload> {
  let mut current = body;
  let mut total = None;

  for _ in 0..MAX_ENVELOPE_DEPTH {
    let Value::Object(mut map) = current else {
      break;
    };
    total = read_total(&map).or(total);
    match map.remove("data") {
      Some(inner @ (Value::Object(_) | Value::Array(_))) => current = inner,
      Some(other) => {
        map.insert("data".to_string(), other);
        current = Value::Object(map);
        break;
      }
      None => {
        current = Value::Object(map);
        break;
      }
    }
  }

  match current {
    Value::Null => Ok(Payload::Empty),
    Value::Array(items) => Ok(Payload::Page(RemotePage {
      items: parse_items(resource, items)?,
      total,
    })),
    Value::Object(mut map) => {
      if let Some(Value::Array(items)) = map.remove("items") {
        let total = read_total(&map).or(total);
        return Ok(Payload::Page(RemotePage {
          items: parse_items(resource, items)?,
          total,
        }));
      }
      if !map.contains_key("id") {
        return Ok(Payload::Empty);
      }
      let entity: ApiEntity = serde_json::from_value(Value::Object(map))?;
      Ok(Payload::Entity(entity.into_entity(resource)))
    }
    _ => Ok(Payload::Empty),
  }
}

fn parse_items(resource: ResourceType, items: Vec<Value>) -> serde_json::Result<Vec<Entity>> {
  items
    .into_iter()
    .map(|item| serde_json::from_value::<ApiEntity>(item).map(|e| e.into_entity(resource)))
    .collect()
}

/// Pull a human-readable message out of an error body.
pub fn error_message(body: &str) -> Option<String> {
  let value: Value = serde_json::from_str(body).ok()?;
  let mut current = &value;
  for _ in 0..MAX_ENVELOPE_DEPTH {
    if let Some(msg) = current.get("message").and_then(Value::as_str) {
      return Some(msg.to_string());
    }
    if let Some(msg) = current.get("error").and_then(Value::as_str) {
      return Some(msg.to_string());
    }
    current = current.get("data")?;
  }
  None
}
