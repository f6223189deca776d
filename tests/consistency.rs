use serde_json::{json, Map, Value};
use std::sync::Arc;

use rescache::cache::CachePage;
use rescache::lifecycle::transition;
use rescache::{
  CacheError, CacheSource, Entity, EntityId, FieldDelta, Fetcher, HttpError, LifecycleState, LifecycleView,
  MemoryFetcher, MutationCoordinator, QueryKey, QuerySurface, ResourceCache, ResourceType,
};

const R: ResourceType = ResourceType::Bills;

struct World {
  server: MemoryFetcher,
  cache: Arc<ResourceCache>,
  surface: Arc<QuerySurface>,
  coordinator: Arc<MutationCoordinator>,
}

impl World {
  fn new() -> Self {
    let server = MemoryFetcher::new();
    let cache = Arc::new(ResourceCache::new());
    let fetcher: Arc<dyn Fetcher> = Arc::new(server.clone());
    Self {
      surface: Arc::new(QuerySurface::new(cache.clone(), fetcher.clone())),
      coordinator: Arc::new(MutationCoordinator::new(cache.clone(), fetcher)),
      server,
      cache,
    }
  }

  fn seed_42(&self) -> Entity {
    let entity = Entity::new(R, EntityId(42), object(json!({"number": "B-42", "status": "open"})));
    self.server.put_entity(entity.clone());
    entity
  }

  async fn load(&self, key: &QueryKey) -> CachePage {
    self.surface.query(key).await.unwrap().page
  }

  fn pages(&self, keys: &[QueryKey]) -> Vec<Option<CachePage>> {
    keys.iter().map(|k| self.cache.get(k)).collect()
  }
}

fn object(value: Value) -> Map<String, Value> {
  value.as_object().cloned().unwrap_or_default()
}

fn views() -> Vec<QueryKey> {
  vec![
    QueryKey::new(R),
    QueryKey::new(R).with_view(LifecycleView::All),
    QueryKey::new(R).with_filter("status", "open"),
  ]
}

#[tokio::test]
async fn soft_delete_moves_entity_to_trash() {
  let world = World::new();
  let entity = world.seed_42();
  let active = QueryKey::new(R);
  assert!(world.load(&active).await.contains(entity.id));

  let gate = world.server.hold_next();
  let pending = tokio::spawn({
    let coordinator = world.coordinator.clone();
    let entity = entity.clone();
    async move { coordinator.soft_delete(&entity).await }
  });
  while world.server.call_count(R, "soft_delete") == 0 {
    tokio::task::yield_now().await;
  }

  // Optimistic: gone from the active view before the server answers.
  let page = world.cache.get(&active).unwrap();
  assert!(!page.contains(entity.id));
  assert_eq!(page.total.value(), 0);

  gate.release();
  let trashed = pending.await.unwrap().unwrap().unwrap();
  assert_eq!(trashed.state, LifecycleState::Trashed);

  assert!(!world.load(&active).await.contains(entity.id));
  let trash = world.load(&QueryKey::new(R).with_view(LifecycleView::Trashed)).await;
  assert_eq!(trash.ids(), vec![entity.id]);
  assert_eq!(trash.items[0].state, LifecycleState::Trashed);
}

#[tokio::test]
async fn rejected_soft_delete_restores_entity() {
  let world = World::new();
  let entity = world.seed_42();
  let keys = views();
  for key in &keys {
    world.load(key).await;
  }
  let before = world.pages(&keys);

  world.server.fail_next(HttpError::status(422, "in use"));
  let err = world.coordinator.soft_delete(&entity).await.unwrap_err();
  assert_eq!(err.to_string(), "in use");
  assert!(!err.is_retryable());

  assert_eq!(world.pages(&keys), before);
  for page in world.pages(&keys).into_iter().flatten() {
    assert!(page.items.iter().all(|e| e.state == LifecycleState::Active));
    assert!(page.contains(entity.id));
  }
}

#[tokio::test]
async fn every_failed_mutation_rolls_back_completely() {
  let world = World::new();
  let entity = world.seed_42();
  world.server.seed(R, json!({"number": "B-43", "status": "open"}));
  let keys = views();
  for key in &keys {
    world.load(key).await;
  }
  let before = world.pages(&keys);

  let failures = [
    HttpError::status(422, "in use"),
    HttpError::status(500, "internal"),
    HttpError::transport("connection reset"),
  ];
  for failure in failures {
    world.server.fail_next(failure.clone());
    assert!(world
      .coordinator
      .update(R, entity.id, FieldDelta::new().set("status", "paid").set("memo", "x"))
      .await
      .is_err());
    assert_eq!(world.pages(&keys), before, "update after {}", failure);

    world.server.fail_next(failure.clone());
    assert!(world.coordinator.soft_delete(&entity).await.is_err());
    assert_eq!(world.pages(&keys), before, "soft delete after {}", failure);

    world.server.fail_next(failure.clone());
    assert!(world.coordinator.hard_delete(&entity).await.is_err());
    assert_eq!(world.pages(&keys), before, "hard delete after {}", failure);
    assert_eq!(world.cache.tombstone(R, entity.id), None);

    world.server.fail_next(failure.clone());
    let payload = object(json!({"number": "B-44"}));
    assert!(world
      .coordinator
      .create(R, payload, Some(EntityId::temporary()))
      .await
      .is_err());
    assert_eq!(world.pages(&keys), before, "create after {}", failure);
  }
  assert!(world.coordinator.pending_rows(R).is_empty());
}

#[test]
fn transition_table_is_exhaustive() {
  use LifecycleState::*;
  let legal = [(Active, Trashed), (Trashed, Active), (Active, Purged), (Trashed, Purged)];
  for from in [Active, Trashed, Purged] {
    for to in [Active, Trashed, Purged] {
      let result = transition(from, to);
      if legal.contains(&(from, to)) {
        assert_eq!(result, Ok(to));
      } else {
        assert_eq!(result, Err(CacheError::InvalidLifecycleTransition { from, to }));
      }
    }
  }
}

#[tokio::test]
async fn illegal_transitions_leave_cache_and_server_alone() {
  let world = World::new();
  let entity = world.seed_42();
  let all = QueryKey::new(R).with_view(LifecycleView::All);
  world.load(&all).await;

  world.coordinator.soft_delete(&entity).await.unwrap();
  world.load(&all).await;
  let before = world.cache.get(&all);
  let trashed = entity.clone().with_state(LifecycleState::Trashed);
  assert!(matches!(
    world.coordinator.soft_delete(&trashed).await,
    Err(CacheError::InvalidLifecycleTransition { .. })
  ));
  assert_eq!(world.cache.get(&all), before);
  assert_eq!(world.server.call_count(R, "soft_delete"), 1);

  world.coordinator.hard_delete(&trashed).await.unwrap();
  let calls = world.server.calls().len();
  for result in [
    world.coordinator.soft_delete(&trashed).await,
    world.coordinator.restore(&trashed).await,
    world.coordinator.hard_delete(&trashed).await,
  ] {
    assert!(matches!(result, Err(CacheError::InvalidLifecycleTransition { from: LifecycleState::Purged, .. })));
  }
  assert_eq!(world.server.calls().len(), calls);
}

#[tokio::test]
async fn later_issued_query_wins() {
  let world = World::new();
  world.server.seed(R, json!({"number": "B-1"}));
  let key = QueryKey::new(R);

  let gate = world.server.hold_next();
  let slow = tokio::spawn({
    let surface = world.surface.clone();
    let key = key.clone();
    async move { surface.query(&key).await }
  });
  while world.server.call_count(R, "list") == 0 {
    tokio::task::yield_now().await;
  }

  world.server.seed(R, json!({"number": "B-2"}));
  let fast = world.surface.query(&key).await.unwrap();
  assert_eq!(fast.source, CacheSource::Network);
  assert_eq!(fast.page.items.len(), 2);

  gate.release();
  let slow = slow.await.unwrap().unwrap();
  assert_eq!(slow.page.items.len(), 2);
  assert_eq!(world.cache.get(&key).map(|p| p.items.len()), Some(2));
}

#[tokio::test]
async fn patch_reaches_every_page() {
  let world = World::new();
  let entity = world.seed_42();
  for n in 0..5 {
    world.server.seed(R, json!({"number": format!("B-{}", n)}));
  }
  let keys = vec![
    QueryKey::new(R),
    QueryKey::new(R).with_page_size(2),
    QueryKey::new(R).with_view(LifecycleView::All),
    QueryKey::new(R).with_search("B-42"),
  ];
  for key in &keys {
    world.load(key).await;
  }
  let holding: Vec<&QueryKey> = keys
    .iter()
    .filter(|k| world.cache.get(k).is_some_and(|p| p.contains(entity.id)))
    .collect();
  assert_eq!(holding.len(), 4);

  let delta = FieldDelta::new().set("memo", "checked");
  assert_eq!(world.cache.patch_entity(R, entity.id, &delta), 4);
  for key in holding {
    let page = world.cache.get(key).unwrap();
    let copy = page.items.iter().find(|e| e.id == entity.id).unwrap();
    assert!(delta.is_reflected_in(&copy.payload), "missed {}", key);
  }
}

#[tokio::test]
async fn fresh_fetch_writes_through_to_other_pages() {
  let world = World::new();
  let entity = world.seed_42();
  let active = QueryKey::new(R);
  let all = QueryKey::new(R).with_view(LifecycleView::All);
  world.load(&active).await;
  world.load(&all).await;

  world
    .server
    .put_entity(entity.clone().with_state(LifecycleState::Trashed));
  world.surface.invalidate(&all);
  world.load(&all).await;

  // The active page no longer admits the trashed copy.
  assert!(!world.cache.get(&active).unwrap().contains(entity.id));
}

#[tokio::test]
async fn restore_of_active_entity_is_a_noop() {
  let world = World::new();
  let entity = world.seed_42();
  let keys = views();
  for key in &keys {
    world.load(key).await;
  }
  let before = world.pages(&keys);

  let restored = world.coordinator.restore(&entity).await.unwrap();
  assert_eq!(restored.map(|e| e.id), Some(entity.id));
  assert_eq!(world.pages(&keys), before);
  assert_eq!(world.server.call_count(R, "restore"), 0);
  for page in world.pages(&keys).into_iter().flatten() {
    assert_eq!(page.items.iter().filter(|e| e.id == entity.id).count(), 1);
  }
}

#[tokio::test]
async fn local_pagination_follows_soft_delete_and_refresh() {
  let shipping = ResourceType::ShippingConfigurations;
  let server = MemoryFetcher::new();
  let ids: Vec<EntityId> = ["a", "b", "c"]
    .iter()
    .map(|name| server.seed(shipping, json!({ "name": name })))
    .collect();
  let cache = Arc::new(ResourceCache::new());
  let fetcher: Arc<dyn Fetcher> = Arc::new(server.clone());
  let surface = QuerySurface::new(cache.clone(), fetcher.clone()).with_local_pagination(shipping, 50);
  let coordinator = MutationCoordinator::new(cache, fetcher);

  let first = QueryKey::new(shipping).with_page_size(2);
  let trash = QueryKey::new(shipping).with_view(LifecycleView::Trashed);
  assert_eq!(surface.query(&first).await.unwrap().page.ids(), ids[..2].to_vec());
  assert!(surface.query(&trash).await.unwrap().page.items.is_empty());

  let entity = server.entity(shipping, ids[0]).unwrap();
  coordinator.soft_delete(&entity).await.unwrap();

  let active = surface.query(&first).await.unwrap();
  assert_eq!(active.source, CacheSource::Network);
  assert_eq!(active.page.ids(), ids[1..].to_vec());
  assert_eq!(surface.query(&trash).await.unwrap().page.ids(), vec![ids[0]]);

  // A change made elsewhere shows up once the superset is invalidated.
  let d = server.seed(shipping, json!({ "name": "d" }));
  let second = first.clone().with_page(2);
  assert!(surface.query(&second).await.unwrap().page.items.is_empty());
  assert!(surface.invalidate(&second));
  assert_eq!(surface.query(&second).await.unwrap().page.ids(), vec![d]);
  assert_eq!(surface.peek(&first).map(|p| p.ids()), Some(ids[1..].to_vec()));
}
