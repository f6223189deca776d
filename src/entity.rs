//! Domain-agnostic entity types shared by every admin resource.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::lifecycle::LifecycleState;

/// Stable identifier of an entity within one resource type.
///
/// Server-assigned ids are positive. Negative ids are temporary ids handed out
/// by [`EntityId::temporary`] for rows created optimistically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

static NEXT_TEMPORARY_ID: AtomicI64 = AtomicI64::new(-1);

impl EntityId {
  /// Allocate a fresh client-side id that can never collide with a server id.
  pub fn temporary() -> Self {
    Self(NEXT_TEMPORARY_ID.fetch_sub(1, Ordering::Relaxed))
  }

  pub fn is_temporary(self) -> bool {
    self.0 < 0
  }
}

impl fmt::Display for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Resource types managed by the admin console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
  Categories,
  Bills,
  PaymentMethods,
  PaymentRequests,
  PromoCodes,
  ShippingConfigurations,
  Notifications,
  StoreProducts,
}

impl ResourceType {
  pub const ALL: [ResourceType; 8] = [
    ResourceType::Categories,
    ResourceType::Bills,
    ResourceType::PaymentMethods,
    ResourceType::PaymentRequests,
    ResourceType::PromoCodes,
    ResourceType::ShippingConfigurations,
    ResourceType::Notifications,
    ResourceType::StoreProducts,
  ];

  /// REST path segment for this resource (e.g. "promo-codes").
  pub fn path(self) -> &'static str {
    match self {
      Self::Categories => "categories",
      Self::Bills => "bills",
      Self::PaymentMethods => "payment-methods",
      Self::PaymentRequests => "payment-requests",
      Self::PromoCodes => "promo-codes",
      Self::ShippingConfigurations => "shipping-configurations",
      Self::Notifications => "notifications",
      Self::StoreProducts => "store-products",
    }
  }
}

impl fmt::Display for ResourceType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.path())
  }
}

impl FromStr for ResourceType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let wanted = s.trim().to_lowercase().replace('_', "-");
    Self::ALL
      .into_iter()
      .find(|r| r.path() == wanted)
      .ok_or_else(|| format!("unknown resource type: {}", s))
  }
}

/// One cached domain record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
  pub id: EntityId,
  pub resource: ResourceType,
  pub state: LifecycleState,
  /// Resource-specific fields, opaque to the cache.
  #[serde(default)]
  pub payload: Map<String, Value>,
}

impl Entity {
  pub fn new(resource: ResourceType, id: EntityId, payload: Map<String, Value>) -> Self {
    Self {
      id,
      resource,
      state: LifecycleState::Active,
      payload,
    }
  }

  pub fn with_state(mut self, state: LifecycleState) -> Self {
    self.state = state;
    self
  }

  pub fn field(&self, name: &str) -> Option<&Value> {
    self.payload.get(name)
  }
}

/// A set of field writes against an entity payload.
///
/// `Some(value)` sets a field, `None` removes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldDelta(BTreeMap<String, Option<Value>>);

impl FieldDelta {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.0.insert(field.into(), Some(value.into()));
    self
  }

  pub fn unset(mut self, field: impl Into<String>) -> Self {
    self.0.insert(field.into(), None);
    self
  }

  pub fn fields(&self) -> impl Iterator<Item = &str> {
    self.0.keys().map(String::as_str)
  }

  pub fn get(&self, field: &str) -> Option<&Option<Value>> {
    self.0.get(field)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
  }

  pub fn apply(&self, payload: &mut Map<String, Value>) {
    for (field, value) in &self.0 {
      match value {
        Some(v) => {
          payload.insert(field.clone(), v.clone());
        }
        None => {
          payload.remove(field);
        }
      }
    }
  }

  /// Whether `payload` already holds exactly what this delta would write.
  pub fn is_reflected_in(&self, payload: &Map<String, Value>) -> bool {
    self
      .0
      .iter()
      .all(|(field, value)| payload.get(field) == value.as_ref())
  }

  /// The delta that puts this delta's fields back to their values in `payload`.
  pub fn inverse_against(&self, payload: &Map<String, Value>) -> FieldDelta {
    FieldDelta(
      self
        .0
        .keys()
        .map(|field| (field.clone(), payload.get(field).cloned()))
        .collect(),
    )
  }

  /// The subset of this delta whose field names satisfy `keep`.
  pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> FieldDelta {
    FieldDelta(
      self
        .0
        .iter()
        .filter(|(k, _)| keep(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }
}

/// Render a payload value the way filters and search compare it.
pub fn value_text(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}
