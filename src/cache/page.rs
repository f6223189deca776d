//! Cached pages of entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityId};

/// Total number of rows behind a paginated view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TotalCount {
  /// The server reported an exact total
  Exact(u64),
  /// No total was reported; this many rows are known to exist
  LowerBound(u64),
}

impl TotalCount {
  pub fn value(self) -> u64 {
    match self {
      Self::Exact(n) | Self::LowerBound(n) => n,
    }
  }

  pub fn is_exact(self) -> bool {
    matches!(self, Self::Exact(_))
  }

  pub(crate) fn decrement(self) -> Self {
    match self {
      Self::Exact(n) => Self::Exact(n.saturating_sub(1)),
      Self::LowerBound(n) => Self::LowerBound(n.saturating_sub(1)),
    }
  }

  pub(crate) fn increment(self) -> Self {
    match self {
      Self::Exact(n) => Self::Exact(n + 1),
      Self::LowerBound(n) => Self::LowerBound(n + 1),
    }
  }
}

/// How a page was paginated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaginationMode {
  /// The endpoint filtered, sorted and paginated
  #[default]
  Server,
  /// A bounded superset was fetched and paginated locally
  Local,
}

/// The last-known contents of one query key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePage {
  pub items: Vec<Entity>,
  pub total: TotalCount,
  pub page_size: u32,
  pub mode: PaginationMode,
  pub fetched_at: DateTime<Utc>,
  /// Explicitly invalidated; refetch on next read
  pub stale: bool,
}

impl CachePage {
  pub fn new(items: Vec<Entity>, total: TotalCount, page_size: u32, mode: PaginationMode) -> Self {
    Self {
      items,
      total,
      page_size,
      mode,
      fetched_at: Utc::now(),
      stale: false,
    }
  }

  pub fn contains(&self, id: EntityId) -> bool {
    self.items.iter().any(|e| e.id == id)
  }

  pub fn ids(&self) -> Vec<EntityId> {
    self.items.iter().map(|e| e.id).collect()
  }

  /// Whether another page probably exists.
  ///
  /// With an exact total this is arithmetic; without one, a full page is the
  /// only hint available.
  pub fn more_likely(&self, offset: u64) -> bool {
    match self.total {
      TotalCount::Exact(total) => offset + (self.items.len() as u64) < total,
      TotalCount::LowerBound(_) => self.items.len() as u64 >= u64::from(self.page_size),
    }
  }

  /// Remove an entity; returns whether it was present.
  pub(crate) fn remove(&mut self, id: EntityId) -> bool {
    let before = self.items.len();
    self.items.retain(|e| e.id != id);
    let removed = self.items.len() != before;
    if removed {
      self.total = self.total.decrement();
    }
    removed
  }
}
