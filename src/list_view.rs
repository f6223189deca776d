//! Per-resource list screen state: the current query, its rows, and the
//! row actions that run through the mutation coordinator.
//!
//! Loads and mutations run as background tasks that report back over a
//! channel. Presentation code calls [`ListViewController::poll`] on every
//! tick (or awaits [`ListViewController::settle`]) and re-renders when it
//! returns `true`.

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::{CachePage, CacheSource, QueryKey, QueryResult, SortField};
use crate::entity::{Entity, EntityId, FieldDelta, ResourceType};
use crate::error::CacheResult;
use crate::lifecycle::LifecycleView;
use crate::mutation::MutationCoordinator;
use crate::query::QuerySurface;

/// Load state of the list.
#[derive(Debug, Clone, PartialEq)]
pub enum ListState {
  Idle,
  Loading,
  Loaded(CachePage),
  Failed(String),
}

impl ListState {
  pub fn is_loading(&self) -> bool {
    matches!(self, ListState::Loading)
  }

  pub fn page(&self) -> Option<&CachePage> {
    match self {
      ListState::Loaded(page) => Some(page),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      ListState::Failed(e) => Some(e),
      _ => None,
    }
  }
}

/// A mutation failure to show the user.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
  pub message: String,
  /// Offer a retry button
  pub retryable: bool,
}

enum Outcome {
  Load {
    seq: u64,
    result: CacheResult<QueryResult>,
  },
  Mutation {
    id: EntityId,
    action: &'static str,
    result: CacheResult<Option<Entity>>,
  },
}

pub struct ListViewController {
  surface: Arc<QuerySurface>,
  coordinator: Arc<MutationCoordinator>,
  key: QueryKey,
  state: ListState,
  source: Option<CacheSource>,
  row_pending: HashSet<EntityId>,
  notices: Vec<Notice>,
  load_seq: u64,
  seen_revision: u64,
  in_flight: usize,
  tx: mpsc::UnboundedSender<Outcome>,
  rx: mpsc::UnboundedReceiver<Outcome>,
}

impl ListViewController {
  /// Create an idle controller; nothing is fetched until [`load`](Self::load).
  pub fn new(surface: Arc<QuerySurface>, coordinator: Arc<MutationCoordinator>, key: QueryKey) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      surface,
      coordinator,
      key,
      state: ListState::Idle,
      source: None,
      row_pending: HashSet::new(),
      notices: Vec::new(),
      load_seq: 0,
      seen_revision: 0,
      in_flight: 0,
      tx,
      rx,
    }
  }

  pub fn resource(&self) -> ResourceType {
    self.key.resource
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn state(&self) -> &ListState {
    &self.state
  }

  /// Where the current rows came from; `Offline` means they may be out of date.
  pub fn source(&self) -> Option<CacheSource> {
    self.source
  }

  pub fn rows(&self) -> &[Entity] {
    self.state.page().map(|p| p.items.as_slice()).unwrap_or(&[])
  }

  /// Whether a next page probably exists.
  pub fn has_next_page(&self) -> bool {
    self
      .state
      .page()
      .map(|p| p.more_likely(self.key.offset()))
      .unwrap_or(false)
  }

  /// Whether this row has a mutation in flight, from this view or any other
  /// sharing the coordinator.
  pub fn is_row_pending(&self, id: EntityId) -> bool {
    self.row_pending.contains(&id) || self.coordinator.is_pending(self.key.resource, id)
  }

  pub fn take_notices(&mut self) -> Vec<Notice> {
    std::mem::take(&mut self.notices)
  }

  /// Start loading the current key. Any load still in flight is superseded.
  pub fn load(&mut self) {
    self.load_seq += 1;
    let seq = self.load_seq;
    self.state = ListState::Loading;

    let surface = self.surface.clone();
    let key = self.key.clone();
    self.spawn(async move {
      let result = surface.query(&key).await;
      Outcome::Load { seq, result }
    });
  }

  /// Mark the current page stale and reload it.
  pub fn refresh(&mut self) {
    self.surface.invalidate(&self.key);
    self.load();
  }

  pub fn set_page(&mut self, page: u32) {
    self.key.page = page.max(1);
    self.load();
  }

  /// Set or clear (`None`) a filter. Returns to the first page.
  pub fn set_filter(&mut self, field: impl Into<String>, value: Option<String>) {
    let field = field.into();
    match value {
      Some(value) => {
        self.key.filters.insert(field, value);
      }
      None => {
        self.key.filters.remove(&field);
      }
    }
    self.key.page = 1;
    self.load();
  }

  /// Replace the sort order. An empty list means server default order.
  pub fn set_sort(&mut self, sort: Vec<SortField>) {
    self.key.sort = sort;
    self.key.page = 1;
    self.load();
  }

  pub fn set_search(&mut self, term: &str) {
    self.key = self.key.clone().with_search(term).with_page(1);
    self.load();
  }

  /// Switch between the active list, the trash, and everything.
  pub fn set_view(&mut self, view: LifecycleView) {
    self.key.view = view;
    self.key.page = 1;
    self.load();
  }

  fn spawn<F>(&mut self, task: F)
  where
    F: Future<Output = Outcome> + Send + 'static,
  {
    self.in_flight += 1;
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let outcome = task.await;
      // Ignore send errors - the controller may have been dropped
      let _ = tx.send(outcome);
    });
  }

  fn find_row(&self, id: EntityId) -> Option<Entity> {
    self
      .rows()
      .iter()
      .find(|e| e.id == id)
      .cloned()
      .or_else(|| self.surface.cache().find_entity(self.key.resource, id))
  }

  /// Run a mutation on one row unless that row already has one pending.
  fn mutate<F, Fut>(&mut self, id: EntityId, action: &'static str, run: F) -> bool
  where
    F: FnOnce(Arc<MutationCoordinator>) -> Fut,
    Fut: Future<Output = CacheResult<Option<Entity>>> + Send + 'static,
  {
    if self.is_row_pending(id) {
      debug!(resource = %self.key.resource, %id, action, "row busy, action refused");
      return false;
    }
    self.row_pending.insert(id);
    let pending = run(self.coordinator.clone());
    self.spawn(async move {
      let result = pending.await;
      Outcome::Mutation { id, action, result }
    });
    true
  }

  fn lifecycle_action(&mut self, id: EntityId, action: &'static str) -> bool {
    let Some(entity) = self.find_row(id) else {
      return false;
    };
    self.mutate(id, action, move |coordinator| async move {
      match action {
        "restore" => coordinator.restore(&entity).await,
        "hard_delete" => coordinator.hard_delete(&entity).await,
        _ => coordinator.soft_delete(&entity).await,
      }
    })
  }

  pub fn soft_delete(&mut self, id: EntityId) -> bool {
    self.lifecycle_action(id, "soft_delete")
  }

  pub fn restore(&mut self, id: EntityId) -> bool {
    self.lifecycle_action(id, "restore")
  }

  pub fn hard_delete(&mut self, id: EntityId) -> bool {
    self.lifecycle_action(id, "hard_delete")
  }

  pub fn update(&mut self, id: EntityId, delta: FieldDelta) -> bool {
    let resource = self.key.resource;
    self.mutate(id, "update", move |coordinator| async move {
      coordinator.update(resource, id, delta).await
    })
  }

  /// Create a row, shown under a temporary id until the server answers.
  pub fn create(&mut self, payload: Map<String, Value>) -> EntityId {
    let resource = self.key.resource;
    let temp = EntityId::temporary();
    self.mutate(temp, "create", move |coordinator| async move {
      coordinator.create(resource, payload, Some(temp)).await
    });
    temp
  }

  fn apply(&mut self, outcome: Outcome) -> bool {
    self.in_flight = self.in_flight.saturating_sub(1);
    match outcome {
      Outcome::Load { seq, result } => {
        if seq != self.load_seq {
          debug!(seq, current = self.load_seq, "dropping superseded load");
          return false;
        }
        self.seen_revision = self.surface.cache().revision();
        match result {
          Ok(result) => {
            self.source = Some(result.source);
            self.state = ListState::Loaded(result.page);
          }
          Err(err) => {
            self.source = None;
            self.state = ListState::Failed(err.to_string());
          }
        }
        true
      }
      Outcome::Mutation { id, action, result } => {
        self.row_pending.remove(&id);
        if let Err(err) = result {
          debug!(%id, action, error = %err, "row action failed");
          self.notices.push(Notice {
            message: err.to_string(),
            retryable: err.is_retryable(),
          });
        }
        true
      }
    }
  }

  /// Pick up cache writes made by anyone since the last look.
  fn sync_with_cache(&mut self) -> bool {
    if !matches!(self.state, ListState::Loaded(_)) {
      return false;
    }
    let revision = self.surface.cache().revision();
    if revision == self.seen_revision {
      return false;
    }
    self.seen_revision = revision;

    match self.surface.peek(&self.key) {
      Some(page) if !page.stale => {
        if self.state.page() == Some(&page) {
          return false;
        }
        self.state = ListState::Loaded(page);
        true
      }
      _ => {
        debug!(key = %self.key.fingerprint(), "page evicted, reloading");
        self.load();
        true
      }
    }
  }

  /// Apply every outcome that is ready, without blocking.
  ///
  /// Returns `true` if anything visible changed.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    loop {
      match self.rx.try_recv() {
        Ok(outcome) => changed |= self.apply(outcome),
        Err(_) => break,
      }
    }
    changed | self.sync_with_cache()
  }

  /// Wait for at least one background task to report, then poll.
  ///
  /// Returns immediately when nothing is in flight.
  pub async fn settle(&mut self) -> bool {
    if self.in_flight == 0 {
      return self.poll();
    }
    let changed = match self.rx.recv().await {
      Some(outcome) => self.apply(outcome),
      None => false,
    };
    changed | self.poll()
  }

  /// Settle until no background task is left.
  pub async fn settle_all(&mut self) {
    while self.in_flight > 0 {
      self.settle().await;
    }
    self.poll();
  }
}

impl std::fmt::Debug for ListViewController {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ListViewController")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("row_pending", &self.row_pending)
      .field("in_flight", &self.in_flight)
      .finish_non_exhaustive()
  }
}
