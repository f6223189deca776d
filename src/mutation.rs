//! Write side of the cache: optimistic mutations with rollback.
//!
//! Every mutation follows the same protocol:
//!
//! 1. Validate the lifecycle transition (deletes and restores)
//! 2. Snapshot the cached pages the mutation touches
//! 3. Project the expected end state into the cache
//! 4. Dispatch the request
//! 5. On success, write the server's entity through and evict membership
//!    for views the change could have reshaped
//! 6. On failure, roll the projection back and report the error
//!
//! Steps 1-3 run synchronously before the first await, so two mutations on
//! the same row always snapshot each other's projections in order.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{PageSnapshot, ResourceCache, Tombstone};
use crate::config::Config;
use crate::entity::{Entity, EntityId, FieldDelta, ResourceType};
use crate::error::{CacheError, CacheResult};
use crate::fetch::{dispatch, Fetcher, Operation};
use crate::lifecycle::{self, LifecycleState};

/// What a mutation speculatively wrote into the cache.
#[derive(Debug, Clone)]
pub enum Projection {
  /// Field writes, plus the values they replaced
  Fields { applied: FieldDelta, prior: FieldDelta },
  Lifecycle { from: LifecycleState, to: LifecycleState },
  /// A temporary row inserted for a create
  Insert(EntityId),
  /// Nothing was projected (create without a temporary id)
  Nothing,
}

/// Per-mutation record kept until the request resolves.
#[derive(Debug, Clone)]
pub struct OptimisticProjection {
  pub resource: ResourceType,
  pub id: Option<EntityId>,
  pub projection: Projection,
  snapshot: PageSnapshot,
}

type PendingRows = HashMap<(ResourceType, EntityId), usize>;

/// Marks a row pending for as long as it is alive.
struct PendingGuard<'a> {
  rows: &'a Mutex<PendingRows>,
  row: (ResourceType, EntityId),
}

impl Drop for PendingGuard<'_> {
  fn drop(&mut self) {
    let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(count) = rows.get_mut(&self.row) {
      *count -= 1;
      if *count == 0 {
        rows.remove(&self.row);
      }
    }
  }
}

/// Runs create/update/delete/restore against one shared cache.
pub struct MutationCoordinator {
  cache: Arc<ResourceCache>,
  fetcher: Arc<dyn Fetcher>,
  request_timeout: Duration,
  pending: Mutex<PendingRows>,
}

impl MutationCoordinator {
  pub fn new(cache: Arc<ResourceCache>, fetcher: Arc<dyn Fetcher>) -> Self {
    Self {
      cache,
      fetcher,
      request_timeout: Duration::from_secs(30),
      pending: Mutex::new(HashMap::new()),
    }
  }

  pub fn from_config(cache: Arc<ResourceCache>, fetcher: Arc<dyn Fetcher>, config: &Config) -> Self {
    Self::new(cache, fetcher).with_request_timeout(config.cache.request_timeout())
  }

  pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
    self.request_timeout = timeout;
    self
  }

  fn pending_rows_lock(&self) -> MutexGuard<'_, PendingRows> {
    self.pending.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn begin(&self, resource: ResourceType, id: EntityId) -> PendingGuard<'_> {
    *self.pending_rows_lock().entry((resource, id)).or_default() += 1;
    PendingGuard {
      rows: &self.pending,
      row: (resource, id),
    }
  }

  /// Whether a mutation on this row is in flight.
  pub fn is_pending(&self, resource: ResourceType, id: EntityId) -> bool {
    self.pending_rows_lock().contains_key(&(resource, id))
  }

  pub fn pending_rows(&self, resource: ResourceType) -> Vec<EntityId> {
    let mut ids: Vec<EntityId> = self
      .pending_rows_lock()
      .keys()
      .filter(|(r, _)| *r == resource)
      .map(|(_, id)| *id)
      .collect();
    ids.sort();
    ids
  }

  /// Lifecycle state as best known: tombstones first, then the cached copy,
  /// then whatever the caller holds.
  fn current_state(&self, entity: &Entity) -> LifecycleState {
    if self.cache.tombstone(entity.resource, entity.id).is_some() {
      return LifecycleState::Purged;
    }
    self
      .cache
      .find_entity(entity.resource, entity.id)
      .map(|cached| cached.state)
      .unwrap_or(entity.state)
  }

  async fn send(&self, resource: ResourceType, operation: Operation) -> CacheResult<Option<Entity>> {
    let payload = dispatch(self.fetcher.as_ref(), self.request_timeout, resource, operation).await?;
    Ok(payload.into_entity())
  }

  /// Undo a failed projection and hand the error back.
  ///
  /// After a stale write the snapshot is known to be wrong, and after an
  /// unreadable success response the server has probably applied the
  /// change. Either way the resource's pages are dropped and refetched
  /// instead of restored.
  fn settle_failure(&self, projection: &OptimisticProjection, err: CacheError) -> CacheError {
    let resource = projection.resource;
    if matches!(err, CacheError::StaleWrite(_) | CacheError::UnexpectedPayload(_)) {
      warn!(%resource, id = ?projection.id, error = %err, "outcome unknown, evicting resource");
      self.cache.evict_membership(resource);
      return err;
    }

    warn!(%resource, id = ?projection.id, error = %err, "mutation failed, rolling back");
    match (&projection.projection, projection.id) {
      (Projection::Fields { applied, prior }, Some(id)) => {
        self
          .cache
          .revert_fields(resource, id, applied, prior, &projection.snapshot);
      }
      (Projection::Lifecycle { .. } | Projection::Insert(_), _) => {
        self.cache.restore(&projection.snapshot);
      }
      _ => {}
    }
    err
  }

  /// Create an entity.
  ///
  /// With a temporary id (see [`EntityId::temporary`]) an active row is shown
  /// at the head of unfiltered first pages until the server answers. Without
  /// one nothing is projected, since the server decides where the row sorts.
  pub async fn create(
    &self,
    resource: ResourceType,
    payload: Map<String, Value>,
    temp_id: Option<EntityId>,
  ) -> CacheResult<Option<Entity>> {
    let temp_id = temp_id.filter(|id| id.is_temporary());
    let _guard = temp_id.map(|id| self.begin(resource, id));

    let projection = match temp_id {
      Some(id) => {
        let snapshot = self.cache.snapshot_heads(resource, LifecycleState::Active);
        self
          .cache
          .insert_head(&Entity::new(resource, id, payload.clone()));
        OptimisticProjection {
          resource,
          id: Some(id),
          projection: Projection::Insert(id),
          snapshot,
        }
      }
      None => OptimisticProjection {
        resource,
        id: None,
        projection: Projection::Nothing,
        snapshot: PageSnapshot::default(),
      },
    };

    match self.send(resource, Operation::Create(payload)).await {
      Ok(created) => {
        self.cache.evict_membership(resource);
        info!(%resource, id = ?created.as_ref().map(|e| e.id), "created");
        Ok(created)
      }
      Err(err) => Err(self.settle_failure(&projection, err)),
    }
  }

  /// Update fields of an entity.
  pub async fn update(
    &self,
    resource: ResourceType,
    id: EntityId,
    delta: FieldDelta,
  ) -> CacheResult<Option<Entity>> {
    if self.cache.tombstone(resource, id).is_some() {
      return Err(CacheError::InvalidLifecycleTransition {
        from: LifecycleState::Purged,
        to: LifecycleState::Purged,
      });
    }
    let _guard = self.begin(resource, id);

    let snapshot = self.cache.snapshot_containing(resource, id);
    let prior = snapshot
      .entity(id)
      .map(|e| delta.inverse_against(&e.payload))
      .unwrap_or_default();
    self.cache.patch_entity(resource, id, &delta);
    let projection = OptimisticProjection {
      resource,
      id: Some(id),
      projection: Projection::Fields {
        applied: delta.clone(),
        prior,
      },
      snapshot,
    };

    let operation = Operation::Update {
      id,
      delta: delta.clone(),
    };
    match self.send(resource, operation).await {
      Ok(canonical) => {
        if let Some(entity) = &canonical {
          self.cache.replace_entity(entity);
        }
        if self.cache.any_key_depends_on(resource, &delta) {
          self.cache.evict_membership(resource);
        }
        info!(%resource, %id, "updated");
        Ok(canonical)
      }
      Err(err) => Err(self.settle_failure(&projection, err)),
    }
  }

  /// Move an entity to the trash.
  pub async fn soft_delete(&self, entity: &Entity) -> CacheResult<Option<Entity>> {
    self.change_lifecycle(entity, LifecycleState::Trashed).await
  }

  /// Bring an entity back from the trash.
  ///
  /// Restoring an entity that is already active succeeds without a request.
  pub async fn restore(&self, entity: &Entity) -> CacheResult<Option<Entity>> {
    if self.current_state(entity) == LifecycleState::Active {
      debug!(resource = %entity.resource, id = %entity.id, "restore of active entity is a no-op");
      return Ok(
        self
          .cache
          .find_entity(entity.resource, entity.id)
          .or_else(|| Some(entity.clone())),
      );
    }
    self.change_lifecycle(entity, LifecycleState::Active).await
  }

  /// Delete an entity permanently, from either active or trashed state.
  pub async fn hard_delete(&self, entity: &Entity) -> CacheResult<Option<Entity>> {
    self.change_lifecycle(entity, LifecycleState::Purged).await
  }

  async fn change_lifecycle(&self, entity: &Entity, to: LifecycleState) -> CacheResult<Option<Entity>> {
    let (resource, id) = (entity.resource, entity.id);
    let from = self.current_state(entity);
    lifecycle::transition(from, to)?;
    let _guard = self.begin(resource, id);

    let snapshot = self.cache.snapshot_containing(resource, id);
    if to == LifecycleState::Purged {
      self.cache.mark_purge_pending(resource, id);
    }
    self.cache.project_lifecycle(resource, id, to);
    let projection = OptimisticProjection {
      resource,
      id: Some(id),
      projection: Projection::Lifecycle { from, to },
      snapshot,
    };

    let operation = match to {
      LifecycleState::Active => Operation::Restore(id),
      LifecycleState::Trashed => Operation::SoftDelete(id),
      LifecycleState::Purged => Operation::HardDelete(id),
    };

    match self.send(resource, operation).await {
      Ok(canonical) => {
        if to == LifecycleState::Purged {
          self.cache.confirm_purge(resource, id);
        } else if let Some(entity) = &canonical {
          self.cache.replace_entity(entity);
        }
        self.cache.evict_membership(resource);
        info!(%resource, %id, %from, %to, "lifecycle change committed");
        Ok(canonical)
      }
      Err(err) => {
        if self.cache.tombstone(resource, id) == Some(Tombstone::Pending) {
          self.cache.clear_purge(resource, id);
        }
        Err(self.settle_failure(&projection, err))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{QueryKey, TotalCount};
  use crate::error::HttpError;
  use crate::fetch::MemoryFetcher;
  use crate::lifecycle::LifecycleView;
  use crate::query::QuerySurface;
  use serde_json::json;

  const R: ResourceType = ResourceType::PromoCodes;

  struct Harness {
    server: MemoryFetcher,
    surface: QuerySurface,
    coordinator: Arc<MutationCoordinator>,
  }

  fn harness() -> Harness {
    let server = MemoryFetcher::new();
    let cache = Arc::new(ResourceCache::new());
    let fetcher: Arc<dyn Fetcher> = Arc::new(server.clone());
    Harness {
      server,
      surface: QuerySurface::new(cache.clone(), fetcher.clone()),
      coordinator: Arc::new(MutationCoordinator::new(cache, fetcher)),
    }
  }

  impl Harness {
    fn cache(&self) -> &ResourceCache {
      self.surface.cache()
    }

    async fn load(&self, key: &QueryKey) -> Vec<Entity> {
      self.surface.query(key).await.unwrap().page.items
    }
  }

  #[tokio::test]
  async fn test_soft_delete_moves_row_to_trash_view() {
    let h = harness();
    let id = h.server.seed(R, json!({"code": "A"}));
    h.server.seed(R, json!({"code": "B"}));
    let active = QueryKey::new(R);
    let trash = QueryKey::new(R).with_view(LifecycleView::Trashed);
    let rows = h.load(&active).await;
    assert!(h.load(&trash).await.is_empty());

    let trashed = h.coordinator.soft_delete(&rows[0]).await.unwrap();
    assert_eq!(trashed.map(|e| e.state), Some(LifecycleState::Trashed));
    assert!(h.load(&active).await.iter().all(|e| e.id != id));
    let in_trash = h.load(&trash).await;
    assert_eq!(in_trash.len(), 1);
    assert_eq!(in_trash[0].id, id);
  }

  #[tokio::test]
  async fn test_soft_delete_of_trashed_entity_fails_cleanly() {
    let h = harness();
    h.server.seed(R, json!({"code": "A"}));
    let all = QueryKey::new(R).with_view(LifecycleView::All);
    let mut rows = h.load(&all).await;
    let entity = rows.remove(0);
    h.server.put_entity(entity.clone().with_state(LifecycleState::Trashed));
    h.cache().project_lifecycle(R, entity.id, LifecycleState::Trashed);
    let before = h.cache().get(&all);

    let err = h.coordinator.soft_delete(&entity).await.unwrap_err();
    assert_eq!(
      err,
      CacheError::InvalidLifecycleTransition {
        from: LifecycleState::Trashed,
        to: LifecycleState::Trashed
      }
    );
    assert_eq!(h.cache().get(&all), before);
    assert_eq!(h.server.call_count(R, "soft_delete"), 0);
  }

  #[tokio::test]
  async fn test_update_failure_restores_page_exactly() {
    let h = harness();
    let id = h.server.seed(R, json!({"code": "A", "label": "Spring"}));
    let key = QueryKey::new(R);
    h.load(&key).await;
    let before = h.cache().get(&key);

    h.server.fail_next(HttpError::status(422, "code already used"));
    let err = h
      .coordinator
      .update(R, id, FieldDelta::new().set("code", "B").set("extra", 1))
      .await
      .unwrap_err();
    assert_eq!(err.to_string(), "code already used");
    assert_eq!(h.cache().get(&key), before);
    assert!(!h.coordinator.is_pending(R, id));
  }

  #[tokio::test]
  async fn test_update_success_keeps_membership_when_unrelated() {
    let h = harness();
    let id = h.server.seed(R, json!({"code": "A"}));
    let key = QueryKey::new(R);
    h.load(&key).await;

    let updated = h
      .coordinator
      .update(R, id, FieldDelta::new().set("label", "Summer"))
      .await
      .unwrap();
    assert_eq!(updated.and_then(|e| e.field("label").cloned()), Some(json!("Summer")));
    let cached = h.cache().find_entity(R, id);
    assert_eq!(cached.and_then(|e| e.field("label").cloned()), Some(json!("Summer")));
  }

  #[tokio::test]
  async fn test_update_of_filtered_field_evicts_membership() {
    let h = harness();
    let id = h.server.seed(R, json!({"code": "A", "status": "live"}));
    let live = QueryKey::new(R).with_filter("status", "live");
    h.load(&live).await;

    h.coordinator
      .update(R, id, FieldDelta::new().set("status", "expired"))
      .await
      .unwrap();
    assert!(h.cache().get(&live).is_none());
    assert!(h.load(&live).await.is_empty());
  }

  #[tokio::test]
  async fn test_overlapping_updates_do_not_clobber_each_other() {
    let h = harness();
    let id = h.server.seed(R, json!({"code": "A", "label": "x"}));
    let key = QueryKey::new(R);
    h.load(&key).await;

    let first_gate = h.server.hold_next();
    h.server.fail_next(HttpError::status(409, "edited elsewhere"));

    let first = tokio::spawn({
      let coordinator = h.coordinator.clone();
      async move {
        coordinator
          .update(R, id, FieldDelta::new().set("code", "B").set("label", "y"))
          .await
      }
    });
    while h.server.call_count(R, "update") < 1 {
      tokio::task::yield_now().await;
    }
    assert!(h.coordinator.is_pending(R, id));

    h.coordinator
      .update(R, id, FieldDelta::new().set("label", "z"))
      .await
      .unwrap();
    first_gate.release();
    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, CacheError::StaleWrite(_)));
    assert!(!h.coordinator.is_pending(R, id));
  }

  #[tokio::test]
  async fn test_field_rollback_only_reverts_its_own_fields() {
    let h = harness();
    let id = h.server.seed(R, json!({"code": "A", "label": "x"}));
    let key = QueryKey::new(R);
    h.load(&key).await;

    let gate = h.server.hold_next();
    h.server.fail_next(HttpError::status(422, "rejected"));
    let first = tokio::spawn({
      let coordinator = h.coordinator.clone();
      async move {
        coordinator
          .update(R, id, FieldDelta::new().set("code", "B").set("label", "y"))
          .await
      }
    });
    while h.server.call_count(R, "update") < 1 {
      tokio::task::yield_now().await;
    }

    // A second edit lands on the label while the first is still in flight.
    h.cache().patch_entity(R, id, &FieldDelta::new().set("label", "z"));
    gate.release();
    assert!(first.await.unwrap().is_err());

    let cached = h.cache().find_entity(R, id).map(|e| e.payload);
    let mut expected = Map::new();
    expected.insert("code".into(), json!("A"));
    expected.insert("label".into(), json!("z"));
    assert_eq!(cached, Some(expected));
  }

  #[tokio::test]
  async fn test_hard_delete_confirms_and_blocks_further_transitions() {
    let h = harness();
    let id = h.server.seed(R, json!({"code": "A"}));
    let key = QueryKey::new(R);
    let rows = h.load(&key).await;

    h.coordinator.hard_delete(&rows[0]).await.unwrap();
    assert_eq!(h.cache().tombstone(R, id), Some(Tombstone::Confirmed));
    assert!(h.load(&key).await.is_empty());

    let err = h.coordinator.restore(&rows[0]).await.unwrap_err();
    assert_eq!(
      err,
      CacheError::InvalidLifecycleTransition {
        from: LifecycleState::Purged,
        to: LifecycleState::Active
      }
    );
    assert!(h.coordinator.update(R, id, FieldDelta::new().set("code", "B")).await.is_err());
    assert_eq!(h.server.call_count(R, "update"), 0);
  }

  #[tokio::test]
  async fn test_hard_delete_failure_restores_row_and_total() {
    let h = harness();
    h.server.seed(R, json!({"code": "A"}));
    h.server.seed(R, json!({"code": "B"}));
    let key = QueryKey::new(R);
    let rows = h.load(&key).await;
    let before = h.cache().get(&key);

    h.server.fail_next(HttpError::transport("connection reset"));
    let err = h.coordinator.hard_delete(&rows[1]).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(h.cache().get(&key), before);
    assert_eq!(h.cache().get(&key).map(|p| p.total), Some(TotalCount::Exact(2)));
    assert_eq!(h.cache().tombstone(R, rows[1].id), None);
  }

  #[tokio::test]
  async fn test_stale_write_evicts_instead_of_rolling_back() {
    let h = harness();
    h.server.seed(R, json!({"code": "A"}));
    let key = QueryKey::new(R);
    let rows = h.load(&key).await;

    h.server.fail_next(HttpError::status(412, "changed since read"));
    let err = h.coordinator.soft_delete(&rows[0]).await.unwrap_err();
    assert!(matches!(err, CacheError::StaleWrite(_)));
    assert!(h.cache().get(&key).is_none());
    assert_eq!(h.load(&key).await.len(), 1);
  }

  #[tokio::test]
  async fn test_unreadable_success_evicts_instead_of_rolling_back() {
    let h = harness();
    let id = h.server.seed(R, json!({"code": "A"}));
    let key = QueryKey::new(R);
    let rows = h.load(&key).await;

    h.server.garble_next();
    let err = h.coordinator.soft_delete(&rows[0]).await.unwrap_err();
    assert!(matches!(err, CacheError::UnexpectedPayload(_)));
    assert!(h.cache().get(&key).is_none());
    assert_eq!(h.server.entity(R, id).map(|e| e.state), Some(LifecycleState::Trashed));
    assert!(h.load(&key).await.is_empty());
  }

  #[tokio::test]
  async fn test_unreadable_hard_delete_does_not_leave_a_tombstone() {
    let h = harness();
    let id = h.server.seed(R, json!({"code": "A"}));
    let key = QueryKey::new(R);
    let rows = h.load(&key).await;

    h.server.garble_next();
    assert!(h.coordinator.hard_delete(&rows[0]).await.is_err());
    assert_eq!(h.cache().tombstone(R, id), None);
    assert!(h.server.entity(R, id).is_none());
    assert!(h.load(&key).await.is_empty());
  }

  #[tokio::test]
  async fn test_create_with_temporary_id_projects_then_refetches() {
    let h = harness();
    h.server.seed(R, json!({"code": "A"}));
    let key = QueryKey::new(R);
    h.load(&key).await;

    let temp = EntityId::temporary();
    let gate = h.server.hold_next();
    let create = tokio::spawn({
      let coordinator = h.coordinator.clone();
      let payload = json!({"code": "NEW"}).as_object().cloned().unwrap_or_default();
      async move { coordinator.create(R, payload, Some(temp)).await }
    });
    while h.server.call_count(R, "create") < 1 {
      tokio::task::yield_now().await;
    }
    assert_eq!(h.cache().get(&key).map(|p| p.items[0].id), Some(temp));
    assert_eq!(h.coordinator.pending_rows(R), vec![temp]);

    gate.release();
    let created = create.await.unwrap().unwrap().unwrap();
    assert!(!created.id.is_temporary());
    assert!(h.cache().get(&key).is_none());
    let ids: Vec<EntityId> = h.load(&key).await.iter().map(|e| e.id).collect();
    assert!(ids.contains(&created.id));
    assert!(!ids.contains(&temp));
  }

  #[tokio::test]
  async fn test_failed_create_removes_temporary_row() {
    let h = harness();
    h.server.seed(R, json!({"code": "A"}));
    let key = QueryKey::new(R);
    h.load(&key).await;
    let before = h.cache().get(&key);

    h.server.fail_next(HttpError::status(400, "code required"));
    let payload = Map::new();
    let err = h
      .coordinator
      .create(R, payload, Some(EntityId::temporary()))
      .await
      .unwrap_err();
    assert_eq!(err.to_string(), "code required");
    assert_eq!(h.cache().get(&key), before);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_rolls_back_and_late_result_is_ignored() {
    let h = harness();
    let id = h.server.seed(R, json!({"code": "A"}));
    let key = QueryKey::new(R);
    let rows = h.load(&key).await;
    let before = h.cache().get(&key);

    h.server.set_latency(Some(Duration::from_secs(120)));
    let coordinator = MutationCoordinator::new(h.cache_arc(), Arc::new(h.server.clone()))
      .with_request_timeout(Duration::from_secs(5));
    let err = coordinator.soft_delete(&rows[0]).await.unwrap_err();
    assert!(matches!(err, CacheError::NetworkFailure(_)));
    assert_eq!(h.cache().get(&key), before);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.cache().get(&key), before);
    assert_eq!(h.cache().find_entity(R, id).map(|e| e.state), Some(LifecycleState::Active));
  }

  impl Harness {
    fn cache_arc(&self) -> Arc<ResourceCache> {
      self.surface.cache().clone()
    }
  }
}
