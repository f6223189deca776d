//! In-process authoritative server.
//!
//! Behaves like the admin API for one session: server-side paging, filters,
//! sort and search, soft and hard deletes. Failures, latency and held calls
//! can be injected to exercise rollback and response ordering.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

use super::{Fetcher, Operation, Payload, RemotePage};
use crate::cache::QueryKey;
use crate::entity::{Entity, EntityId, ResourceType};
use crate::error::HttpError;
use crate::lifecycle::LifecycleState;

/// Releases a held call.
pub struct Gate(oneshot::Sender<()>);

impl Gate {
  pub fn release(self) {
    let _ = self.0.send(());
  }
}

#[derive(Default)]
struct Server {
  tables: BTreeMap<ResourceType, BTreeMap<EntityId, Entity>>,
  last_id: i64,
  omit_totals: bool,
  failures: VecDeque<HttpError>,
  garbled: usize,
  holds: VecDeque<oneshot::Receiver<()>>,
  latency: Option<Duration>,
  calls: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MemoryFetcher {
  server: Arc<Mutex<Server>>,
}

impl MemoryFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Server> {
    self.server.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Insert an active row with a server-assigned id.
  pub fn seed(&self, resource: ResourceType, payload: Value) -> EntityId {
    let mut server = self.lock();
    server.last_id += 1;
    let id = EntityId(server.last_id);
    let payload = match payload {
      Value::Object(map) => map,
      _ => Map::new(),
    };
    server
      .tables
      .entry(resource)
      .or_default()
      .insert(id, Entity::new(resource, id, payload));
    id
  }

  /// Change a row behind the client's back.
  pub fn put_entity(&self, entity: Entity) {
    let mut server = self.lock();
    server.last_id = server.last_id.max(entity.id.0);
    server
      .tables
      .entry(entity.resource)
      .or_default()
      .insert(entity.id, entity);
  }

  pub fn entity(&self, resource: ResourceType, id: EntityId) -> Option<Entity> {
    self.lock().tables.get(&resource)?.get(&id).cloned()
  }

  /// Respond to list calls with `{items}` only.
  pub fn omit_totals(&self, omit: bool) {
    self.lock().omit_totals = omit;
  }

  /// Fail the next call with `error`, leaving server state untouched.
  pub fn fail_next(&self, error: HttpError) {
    self.lock().failures.push_back(error);
  }

  /// Apply the next call but answer it with an unreadable success body.
  pub fn garble_next(&self) {
    self.lock().garbled += 1;
  }

  /// Hold the next call until the returned gate is released.
  ///
  /// The response is computed when the call is made, not when it is released.
  pub fn hold_next(&self) -> Gate {
    let (tx, rx) = oneshot::channel();
    self.lock().holds.push_back(rx);
    Gate(tx)
  }

  pub fn set_latency(&self, latency: Option<Duration>) {
    self.lock().latency = latency;
  }

  /// Calls made so far, as `resource:operation`.
  pub fn calls(&self) -> Vec<String> {
    self.lock().calls.clone()
  }

  pub fn call_count(&self, resource: ResourceType, operation: &str) -> usize {
    let wanted = format!("{}:{}", resource, operation);
    self.lock().calls.iter().filter(|c| **c == wanted).count()
  }
}

impl Server {
  fn execute(&mut self, resource: ResourceType, operation: Operation) -> Result<Payload, HttpError> {
    let omit_totals = self.omit_totals;
    let table = self.tables.entry(resource).or_default();
    let missing = |id: EntityId| HttpError::status(404, format!("{} {} not found", resource, id));

    match operation {
      Operation::List(key) => Ok(Payload::Page(list(table, &key, omit_totals))),
      Operation::Get(id) => table.get(&id).cloned().map(Payload::Entity).ok_or_else(|| missing(id)),
      Operation::Create(payload) => {
        self.last_id += 1;
        let entity = Entity::new(resource, EntityId(self.last_id), payload);
        self
          .tables
          .entry(resource)
          .or_default()
          .insert(entity.id, entity.clone());
        Ok(Payload::Entity(entity))
      }
      Operation::Update { id, delta } => {
        let entity = table.get_mut(&id).ok_or_else(|| missing(id))?;
        delta.apply(&mut entity.payload);
        Ok(Payload::Entity(entity.clone()))
      }
      Operation::SoftDelete(id) => set_state(table, id, LifecycleState::Trashed).ok_or_else(|| missing(id)),
      Operation::Restore(id) => set_state(table, id, LifecycleState::Active).ok_or_else(|| missing(id)),
      Operation::HardDelete(id) => table.remove(&id).map(|_| Payload::Empty).ok_or_else(|| missing(id)),
    }
  }
}

fn set_state(table: &mut BTreeMap<EntityId, Entity>, id: EntityId, state: LifecycleState) -> Option<Payload> {
  let entity = table.get_mut(&id)?;
  entity.state = state;
  Some(Payload::Entity(entity.clone()))
}

fn list(table: &BTreeMap<EntityId, Entity>, key: &QueryKey, omit_totals: bool) -> RemotePage {
  let mut rows: Vec<&Entity> = table.values().filter(|e| key.matches(e)).collect();
  rows.sort_by(|a, b| key.compare(a, b));
  let total = rows.len() as u64;
  let items = rows
    .into_iter()
    .skip(key.offset() as usize)
    .take(key.page_size as usize)
    .cloned()
    .collect();
  RemotePage {
    items,
    total: if omit_totals { None } else { Some(total) },
  }
}

impl Fetcher for MemoryFetcher {
  fn call(&self, resource: ResourceType, operation: Operation) -> BoxFuture<'_, Result<Payload, HttpError>> {
    let (result, hold, latency) = {
      let mut server = self.lock();
      server.calls.push(format!("{}:{}", resource, operation.name()));
      let mut result = match server.failures.pop_front() {
        Some(error) => Err(error),
        None => server.execute(resource, operation),
      };
      if result.is_ok() && server.garbled > 0 {
        server.garbled -= 1;
        result = Err(HttpError::undecodable(200, "unreadable response body"));
      }
      (result, server.holds.pop_front(), server.latency)
    };

    async move {
      if let Some(hold) = hold {
        let _ = hold.await;
      }
      if let Some(latency) = latency {
        tokio::time::sleep(latency).await;
      }
      result
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entity::FieldDelta;
  use crate::lifecycle::LifecycleView;
  use serde_json::json;

  const R: ResourceType = ResourceType::Categories;

  #[tokio::test]
  async fn test_list_pages_and_totals() {
    let server = MemoryFetcher::new();
    for name in ["a", "b", "c"] {
      server.seed(R, json!({ "name": name }));
    }

    let key = QueryKey::new(R).with_page_size(2).with_page(2);
    let page = server.call(R, Operation::List(key.clone())).await.unwrap().into_page().unwrap();
    assert_eq!(page.total, Some(3));
    assert_eq!(page.items.len(), 1);

    server.omit_totals(true);
    let page = server.call(R, Operation::List(key)).await.unwrap().into_page().unwrap();
    assert_eq!(page.total, None);
  }

  #[tokio::test]
  async fn test_lifecycle_operations() {
    let server = MemoryFetcher::new();
    let id = server.seed(R, json!({ "name": "a" }));

    server.call(R, Operation::SoftDelete(id)).await.unwrap();
    let trash = QueryKey::new(R).with_view(LifecycleView::Trashed);
    let page = server.call(R, Operation::List(trash)).await.unwrap().into_page().unwrap();
    assert_eq!(page.items[0].id, id);

    server.call(R, Operation::Restore(id)).await.unwrap();
    assert_eq!(server.entity(R, id).map(|e| e.state), Some(LifecycleState::Active));

    server.call(R, Operation::HardDelete(id)).await.unwrap();
    assert!(server.entity(R, id).is_none());
    let err = server.call(R, Operation::Restore(id)).await.unwrap_err();
    assert_eq!(err.status, Some(404));
  }

  #[tokio::test]
  async fn test_injected_failure_leaves_state_untouched() {
    let server = MemoryFetcher::new();
    let id = server.seed(R, json!({ "name": "a" }));
    server.fail_next(HttpError::status(422, "in use"));

    let delta = FieldDelta::new().set("name", "b");
    let err = server.call(R, Operation::Update { id, delta }).await.unwrap_err();
    assert_eq!(err.message, "in use");
    assert_eq!(server.entity(R, id).and_then(|e| e.field("name").cloned()), Some(json!("a")));
    assert_eq!(server.call_count(R, "update"), 1);
  }

  #[tokio::test]
  async fn test_held_call_reports_state_at_call_time() {
    let server = MemoryFetcher::new();
    server.seed(R, json!({ "name": "a" }));

    let gate = server.hold_next();
    let pending = server.call(R, Operation::List(QueryKey::new(R)));
    server.seed(R, json!({ "name": "b" }));
    gate.release();

    let page = pending.await.unwrap().into_page().unwrap();
    assert_eq!(page.items.len(), 1);
  }
}
