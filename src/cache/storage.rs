//! In-memory resource cache with per-key fetch generations.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::key::QueryKey;
use super::page::CachePage;
use crate::entity::{Entity, EntityId, FieldDelta, ResourceType};
use crate::lifecycle::LifecycleState;

/// Issue-order stamp of a fetch for one query key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
  fn next(self) -> Self {
    Self(self.0 + 1)
  }
}

/// Marker for entities that were hard-deleted (or are being hard-deleted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tombstone {
  /// Hard delete dispatched, not yet confirmed
  Pending,
  /// Server confirmed the hard delete
  Confirmed,
}

#[derive(Debug, Clone)]
struct Entry {
  page: CachePage,
  generation: Generation,
}

#[derive(Debug, Clone, Copy, Default)]
struct KeyGenerations {
  issued: Generation,
  landed: Generation,
}

#[derive(Debug, Default)]
struct Inner {
  entries: HashMap<QueryKey, Entry>,
  generations: HashMap<QueryKey, KeyGenerations>,
  tombstones: HashMap<(ResourceType, EntityId), Tombstone>,
  revision: u64,
}

/// Copies of cache pages taken before an optimistic write.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
  pages: Vec<(QueryKey, CachePage, Generation)>,
}

impl PageSnapshot {
  /// The entity as it was before the write, if any snapshot page held it.
  pub fn entity(&self, id: EntityId) -> Option<&Entity> {
    self
      .pages
      .iter()
      .flat_map(|(_, page, _)| page.items.iter())
      .find(|e| e.id == id)
  }
}

/// Keyed store of the last-known page for each query key.
///
/// All writes go through the typed operations below; callers only ever see
/// clones of cached pages. Every operation holds the lock for its whole
/// duration, so no reader can observe a half-applied write.
#[derive(Debug, Default)]
pub struct ResourceCache {
  inner: Mutex<Inner>,
}

impl ResourceCache {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Pure lookup, no network.
  pub fn get(&self, key: &QueryKey) -> Option<CachePage> {
    self.lock().entries.get(key).map(|entry| entry.page.clone())
  }

  /// Incremented on every write.
  pub fn revision(&self) -> u64 {
    self.lock().revision
  }

  /// Whether any cached key of this resource could change membership or
  /// order when the delta's fields change.
  pub fn any_key_depends_on(&self, resource: ResourceType, delta: &FieldDelta) -> bool {
    self
      .lock()
      .entries
      .keys()
      .any(|k| k.resource == resource && k.depends_on(delta))
  }

  /// Record that a fetch for `key` is being issued.
  pub fn begin_fetch(&self, key: &QueryKey) -> Generation {
    let mut guard = self.lock();
    let gens = guard.generations.entry(key.clone()).or_default();
    gens.issued = gens.issued.next();
    gens.issued
  }

  /// Authoritative replace.
  ///
  /// Returns `false` without touching the cache when a fetch issued later has
  /// already landed for the same key, or when the page's pagination mode
  /// differs from what is cached under the key.
  pub fn put(&self, key: QueryKey, mut page: CachePage, generation: Generation) -> bool {
    let mut guard = self.lock();
    let inner = &mut *guard;

    let gens = inner.generations.entry(key.clone()).or_default();
    if generation <= gens.landed {
      debug!(
        key = %key.fingerprint(),
        generation = generation.0,
        landed = gens.landed.0,
        "discarding superseded page"
      );
      return false;
    }
    if let Some(existing) = inner.entries.get(&key) {
      if existing.page.mode != page.mode {
        debug!(key = %key.fingerprint(), "refusing to mix pagination modes");
        return false;
      }
    }
    gens.landed = generation;
    gens.issued = gens.issued.max(generation);

    let buried: Vec<EntityId> = page
      .items
      .iter()
      .filter(|e| inner.tombstones.contains_key(&(e.resource, e.id)))
      .map(|e| e.id)
      .collect();
    for id in buried {
      page.remove(id);
    }
    page.stale = false;

    for entity in &page.items {
      write_through(&mut inner.entries, &key, entity);
    }

    debug!(
      key = %key.fingerprint(),
      generation = generation.0,
      rows = page.items.len(),
      "stored page"
    );
    inner.entries.insert(key, Entry { page, generation });
    inner.revision += 1;
    true
  }

  /// Apply a field delta to every cached copy of an entity.
  pub fn patch_entity(&self, resource: ResourceType, id: EntityId, delta: &FieldDelta) -> usize {
    let mut guard = self.lock();
    let inner = &mut *guard;

    let mut patched = 0;
    for (_, entry) in inner.entries.iter_mut().filter(|(k, _)| k.resource == resource) {
      for entity in entry.page.items.iter_mut().filter(|e| e.id == id) {
        delta.apply(&mut entity.payload);
        patched += 1;
      }
    }
    if patched > 0 {
      inner.revision += 1;
    }
    debug!(%resource, %id, copies = patched, "patched entity");
    patched
  }

  /// Replace every cached copy of an entity with the server's version.
  pub fn replace_entity(&self, entity: &Entity) -> usize {
    let mut guard = self.lock();
    let inner = &mut *guard;
    let mut touched = 0;
    for (key, entry) in inner.entries.iter_mut().filter(|(k, _)| k.resource == entity.resource) {
      touched += usize::from(replace_in_page(key, &mut entry.page, entity));
    }
    if touched > 0 {
      inner.revision += 1;
    }
    touched
  }

  /// Set the lifecycle state of every cached copy, dropping the entity from
  /// pages whose view no longer admits it.
  pub fn project_lifecycle(&self, resource: ResourceType, id: EntityId, state: LifecycleState) -> usize {
    let mut guard = self.lock();
    let inner = &mut *guard;

    let mut touched = 0;
    for (key, entry) in inner.entries.iter_mut().filter(|(k, _)| k.resource == resource) {
      if !entry.page.contains(id) {
        continue;
      }
      if key.view.admits(state) {
        for entity in entry.page.items.iter_mut().filter(|e| e.id == id) {
          entity.state = state;
        }
      } else {
        entry.page.remove(id);
      }
      touched += 1;
    }
    if touched > 0 {
      inner.revision += 1;
    }
    debug!(%resource, %id, %state, pages = touched, "projected lifecycle state");
    touched
  }

  /// Remove one entity from every page it appears in.
  pub fn evict_entity(&self, resource: ResourceType, id: EntityId) -> usize {
    self.project_lifecycle(resource, id, LifecycleState::Purged)
  }

  /// Drop every page of a resource type.
  ///
  /// Fetches issued before the eviction can no longer land.
  pub fn evict_membership(&self, resource: ResourceType) -> usize {
    let mut guard = self.lock();
    let inner = &mut *guard;

    let before = inner.entries.len();
    inner.entries.retain(|k, _| k.resource != resource);
    let evicted = before - inner.entries.len();

    for (_, gens) in inner.generations.iter_mut().filter(|(k, _)| k.resource == resource) {
      gens.issued = gens.issued.next();
      gens.landed = gens.issued;
    }
    inner.revision += 1;
    debug!(%resource, pages = evicted, "evicted membership");
    evicted
  }

  /// Mark one key stale so the next read refetches it.
  pub fn invalidate(&self, key: &QueryKey) -> bool {
    let mut guard = self.lock();
    let inner = &mut *guard;
    match inner.entries.get_mut(key) {
      Some(entry) => {
        entry.page.stale = true;
        inner.revision += 1;
        true
      }
      None => false,
    }
  }

  /// Optimistically insert a new row at the head of unfiltered first pages
  /// that admit its state.
  pub fn insert_head(&self, entity: &Entity) -> usize {
    let mut guard = self.lock();
    let inner = &mut *guard;

    let mut inserted = 0;
    for (key, entry) in inner.entries.iter_mut() {
      if key.resource != entity.resource || !key.is_plain_head() || !key.view.admits(entity.state) {
        continue;
      }
      if entry.page.contains(entity.id) {
        continue;
      }
      entry.page.items.insert(0, entity.clone());
      entry.page.total = entry.page.total.increment();
      if entry.page.items.len() > entry.page.page_size as usize {
        entry.page.items.pop();
      }
      inserted += 1;
    }
    if inserted > 0 {
      inner.revision += 1;
    }
    inserted
  }

  /// Any cached copy of the entity.
  pub fn find_entity(&self, resource: ResourceType, id: EntityId) -> Option<Entity> {
    self
      .lock()
      .entries
      .iter()
      .filter(|(k, _)| k.resource == resource)
      .find_map(|(_, entry)| entry.page.items.iter().find(|e| e.id == id).cloned())
  }

  /// Snapshot every page that currently holds the entity.
  pub fn snapshot_containing(&self, resource: ResourceType, id: EntityId) -> PageSnapshot {
    self.snapshot_where(resource, |_, page| page.contains(id))
  }

  /// Snapshot the pages `insert_head` would write to.
  pub fn snapshot_heads(&self, resource: ResourceType, state: LifecycleState) -> PageSnapshot {
    self.snapshot_where(resource, |key, _| key.is_plain_head() && key.view.admits(state))
  }

  fn snapshot_where(
    &self,
    resource: ResourceType,
    pred: impl Fn(&QueryKey, &CachePage) -> bool,
  ) -> PageSnapshot {
    let guard = self.lock();
    let pages = guard
      .entries
      .iter()
      .filter(|(k, entry)| k.resource == resource && pred(k, &entry.page))
      .map(|(k, entry)| (k.clone(), entry.page.clone(), entry.generation))
      .collect();
    PageSnapshot { pages }
  }

  /// Put snapshot pages back.
  ///
  /// A page is restored only while no newer fetch has landed (and no eviction
  /// happened) for its key; otherwise the newer server data is kept.
  pub fn restore(&self, snapshot: &PageSnapshot) -> usize {
    let mut guard = self.lock();
    let inner = &mut *guard;

    let mut restored = Vec::new();
    for (key, page, generation) in &snapshot.pages {
      let landed = inner
        .generations
        .get(key)
        .map(|g| g.landed)
        .unwrap_or_default();
      if landed != *generation {
        debug!(key = %key.fingerprint(), "snapshot superseded, not restoring");
        continue;
      }
      inner.entries.insert(
        key.clone(),
        Entry {
          page: page.clone(),
          generation: *generation,
        },
      );
      restored.push(key.clone());
    }

    // Pages fetched after the snapshot carry fresher copies.
    for key in &restored {
      let Some(restored_page) = inner.entries.get(key).map(|e| e.page.clone()) else {
        continue;
      };
      for entity in &restored_page.items {
        let fresher = inner
          .entries
          .iter()
          .filter(|(k, _)| k.resource == key.resource && !restored.contains(*k))
          .filter(|(_, e)| e.page.fetched_at > restored_page.fetched_at)
          .find_map(|(_, e)| e.page.items.iter().find(|c| c.id == entity.id))
          .cloned();
        if let (Some(fresher), Some(entry)) = (fresher, inner.entries.get_mut(key)) {
          replace_in_page(key, &mut entry.page, &fresher);
        }
      }
    }

    if !restored.is_empty() {
      inner.revision += 1;
    }
    restored.len()
  }

  /// Undo a field update on the snapshot's pages.
  ///
  /// Only fields that still hold the value this update projected are put
  /// back, so a later update to the same field is not clobbered.
  pub fn revert_fields(
    &self,
    resource: ResourceType,
    id: EntityId,
    projected: &FieldDelta,
    prior: &FieldDelta,
    snapshot: &PageSnapshot,
  ) -> usize {
    let mut guard = self.lock();
    let inner = &mut *guard;

    let mut reverted = 0;
    for (key, _, generation) in &snapshot.pages {
      let Some(entry) = inner.entries.get_mut(key) else {
        continue;
      };
      if entry.generation != *generation || key.resource != resource {
        continue;
      }
      for entity in entry.page.items.iter_mut().filter(|e| e.id == id) {
        let still_ours = projected
          .retain(|field| entity.payload.get(field) == projected.get(field).and_then(Option::as_ref));
        let undo = prior.retain(|field| still_ours.get(field).is_some());
        undo.apply(&mut entity.payload);
        reverted += 1;
      }
    }
    if reverted > 0 {
      inner.revision += 1;
    }
    reverted
  }

  pub fn tombstone(&self, resource: ResourceType, id: EntityId) -> Option<Tombstone> {
    self.lock().tombstones.get(&(resource, id)).copied()
  }

  pub fn mark_purge_pending(&self, resource: ResourceType, id: EntityId) {
    self.lock().tombstones.insert((resource, id), Tombstone::Pending);
  }

  pub fn confirm_purge(&self, resource: ResourceType, id: EntityId) {
    self.lock().tombstones.insert((resource, id), Tombstone::Confirmed);
  }

  pub fn clear_purge(&self, resource: ResourceType, id: EntityId) {
    self.lock().tombstones.remove(&(resource, id));
  }
}

/// Copy a fresh version of `entity` into every other page that holds it.
fn write_through(entries: &mut HashMap<QueryKey, Entry>, origin: &QueryKey, entity: &Entity) {
  for (key, entry) in entries.iter_mut() {
    if key.resource != entity.resource || key == origin {
      continue;
    }
    replace_in_page(key, &mut entry.page, entity);
  }
}

fn replace_in_page(key: &QueryKey, page: &mut CachePage, entity: &Entity) -> bool {
  let Some(pos) = page.items.iter().position(|e| e.id == entity.id) else {
    return false;
  };
  if key.view.admits(entity.state) {
    page.items[pos] = entity.clone();
  } else {
    page.remove(entity.id);
  }
  true
}
