//! Read results annotated with where the data came from.

use serde::Serialize;

use super::page::CachePage;

/// Indicates where a page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Fresh data from the network
  Network,
  /// Cached page, still within its time-to-live
  CacheFresh,
  /// Refetch failed; serving the last stale page
  Offline,
}

/// A page returned by the query surface.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
  pub page: CachePage,
  pub source: CacheSource,
}

impl QueryResult {
  pub fn from_network(page: CachePage) -> Self {
    Self {
      page,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(page: CachePage) -> Self {
    Self {
      page,
      source: CacheSource::CacheFresh,
    }
  }

  pub fn offline(page: CachePage) -> Self {
    Self {
      page,
      source: CacheSource::Offline,
    }
  }

  pub fn is_offline(&self) -> bool {
    self.source == CacheSource::Offline
  }
}
