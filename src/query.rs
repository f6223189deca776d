//! Read side of the cache: paginated, filtered, sorted views.
//!
//! A read is served from the cache while the page is fresh. Otherwise the
//! fetcher is called and its result stored with the generation issued for
//! the call, so a slow response can never replace one issued after it.
//!
//! Resources whose endpoints cannot filter or paginate are read in local
//! fallback mode: a bounded superset is fetched once and every page is
//! derived from it on the client. A key is always read in one mode only.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CachePage, PaginationMode, QueryKey, QueryResult, ResourceCache, TotalCount};
use crate::config::Config;
use crate::entity::ResourceType;
use crate::error::CacheResult;
use crate::fetch::{dispatch, Fetcher, Operation, RemotePage};

/// Attempts made when an eviction lands while a fetch is in flight.
const MAX_ATTEMPTS: usize = 2;

pub struct QuerySurface {
  cache: Arc<ResourceCache>,
  fetcher: Arc<dyn Fetcher>,
  /// How long before cached data is considered stale
  stale_time: chrono::Duration,
  request_timeout: Duration,
  local_fallback_cap: u32,
  modes: HashMap<ResourceType, PaginationMode>,
}

impl QuerySurface {
  pub fn new(cache: Arc<ResourceCache>, fetcher: Arc<dyn Fetcher>) -> Self {
    Self {
      cache,
      fetcher,
      stale_time: chrono::Duration::minutes(5),
      request_timeout: Duration::from_secs(30),
      local_fallback_cap: 1000,
      modes: HashMap::new(),
    }
  }

  pub fn from_config(cache: Arc<ResourceCache>, fetcher: Arc<dyn Fetcher>, config: &Config) -> Self {
    let mut surface = Self::new(cache, fetcher)
      .with_stale_time(config.cache.stale_time())
      .with_request_timeout(config.cache.request_timeout());
    surface.local_fallback_cap = config.cache.local_fallback_cap.max(1);
    for (resource, settings) in &config.resources {
      surface.modes.insert(*resource, settings.pagination);
    }
    surface
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = chrono::Duration::from_std(stale_time).unwrap_or_else(|_| chrono::Duration::days(36500));
    self
  }

  pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
    self.request_timeout = timeout;
    self
  }

  /// Paginate this resource on the client from at most `cap` rows.
  pub fn with_local_pagination(mut self, resource: ResourceType, cap: u32) -> Self {
    self.modes.insert(resource, PaginationMode::Local);
    self.local_fallback_cap = cap.max(1);
    self
  }

  pub fn cache(&self) -> &Arc<ResourceCache> {
    &self.cache
  }

  pub fn mode(&self, resource: ResourceType) -> PaginationMode {
    self.modes.get(&resource).copied().unwrap_or_default()
  }

  fn is_stale(&self, page: &CachePage) -> bool {
    page.stale || Utc::now() - page.fetched_at > self.stale_time
  }

  /// Key the rows for `key` are stored under: the key itself, or in local
  /// fallback mode the bounded superset every page is derived from.
  fn storage_key(&self, key: &QueryKey) -> QueryKey {
    match self.mode(key.resource) {
      PaginationMode::Server => key.clone(),
      PaginationMode::Local => key.superset(self.local_fallback_cap),
    }
  }

  /// Turn a stored page into the page `key` asks for.
  fn shape(&self, key: &QueryKey, stored: CachePage) -> CachePage {
    match self.mode(key.resource) {
      PaginationMode::Server => stored,
      PaginationMode::Local => derive_local_page(key, &stored),
    }
  }

  /// Cached page for a key, without any network activity.
  pub fn peek(&self, key: &QueryKey) -> Option<CachePage> {
    self
      .cache
      .get(&self.storage_key(key))
      .map(|stored| self.shape(key, stored))
  }

  /// Force the next read of this key to refetch.
  ///
  /// In local fallback mode this marks the shared superset, so every page
  /// of the same view refetches.
  pub fn invalidate(&self, key: &QueryKey) -> bool {
    self.cache.invalidate(&self.storage_key(key))
  }

  /// Read one page.
  ///
  /// 1. Fresh cached page: returned immediately
  /// 2. Missing or stale: fetched, stored, returned
  /// 3. Refetch of a stale page failed in transport: the stale page is
  ///    returned marked offline
  pub async fn query(&self, key: &QueryKey) -> CacheResult<QueryResult> {
    let target = self.storage_key(key);
    let cached = self.cache.get(&target);
    if let Some(page) = &cached {
      if !self.is_stale(page) {
        debug!(key = %key.fingerprint(), "cache hit");
        return Ok(QueryResult::from_cache(self.shape(key, page.clone())));
      }
    }
    debug!(key = %key.fingerprint(), desc = %key, stale = cached.is_some(), "cache miss");

    match (self.fetch(key, &target).await, cached) {
      (Ok(result), _) => Ok(result),
      (Err(err), Some(stale)) if err.is_retryable() => {
        warn!(key = %key.fingerprint(), error = %err, "refetch failed, serving stale page");
        Ok(QueryResult::offline(self.shape(key, stale)))
      }
      (Err(err), _) => Err(err),
    }
  }

  /// Fetch and store the rows for `key` under `target`.
  ///
  /// A put discarded because an eviction landed mid-flight means the
  /// response predates a committed mutation; it is refetched rather than
  /// shown.
  async fn fetch(&self, key: &QueryKey, target: &QueryKey) -> CacheResult<QueryResult> {
    let mode = self.mode(key.resource);
    let mut last = None;
    for _ in 0..MAX_ATTEMPTS {
      let generation = self.cache.begin_fetch(target);
      let remote = dispatch(
        self.fetcher.as_ref(),
        self.request_timeout,
        key.resource,
        Operation::List(target.clone()),
      )
      .await?
      .into_page()?;
      let page = match mode {
        PaginationMode::Server => server_page(target, remote),
        PaginationMode::Local => superset_page(remote, self.local_fallback_cap),
      };

      if self.cache.put(target.clone(), page.clone(), generation) {
        return Ok(QueryResult::from_network(self.shape(key, page)));
      }
      if let Some(newer) = self.cache.get(target) {
        return Ok(QueryResult::from_cache(self.shape(key, newer)));
      }
      debug!(key = %target.fingerprint(), "fetch superseded by eviction, refetching");
      last = Some(page);
    }
    let page = last.unwrap_or_else(|| empty_page(target, mode));
    Ok(QueryResult::from_network(self.shape(key, page)))
  }
}

fn empty_page(key: &QueryKey, mode: PaginationMode) -> CachePage {
  CachePage::new(Vec::new(), TotalCount::LowerBound(0), key.page_size, mode)
}

/// Without a reported total, all that is known is how many rows exist up to
/// the end of this page.
fn server_page(key: &QueryKey, remote: RemotePage) -> CachePage {
  let total = match remote.total {
    Some(total) => TotalCount::Exact(total),
    None => TotalCount::LowerBound(key.offset() + remote.items.len() as u64),
  };
  CachePage::new(remote.items, total, key.page_size, PaginationMode::Server)
}

fn superset_page(mut remote: RemotePage, cap: u32) -> CachePage {
  remote.items.truncate(cap as usize);
  let complete = (remote.items.len() as u64) < u64::from(cap)
    || remote.total == Some(remote.items.len() as u64);
  let count = remote.items.len() as u64;
  let total = if complete {
    TotalCount::Exact(count)
  } else {
    TotalCount::LowerBound(count)
  };
  CachePage::new(remote.items, total, cap, PaginationMode::Local)
}

/// Filter, sort and paginate a superset on the client.
pub fn derive_local_page(key: &QueryKey, superset: &CachePage) -> CachePage {
  let mut rows: Vec<_> = superset.items.iter().filter(|e| key.matches(e)).collect();
  rows.sort_by(|a, b| key.compare(a, b));

  let matched = rows.len() as u64;
  let total = if superset.total.is_exact() {
    TotalCount::Exact(matched)
  } else {
    TotalCount::LowerBound(matched)
  };
  let items = rows
    .into_iter()
    .skip(key.offset() as usize)
    .take(key.page_size as usize)
    .cloned()
    .collect();

  let mut page = CachePage::new(items, total, key.page_size, PaginationMode::Local);
  page.fetched_at = superset.fetched_at;
  page.stale = superset.stale;
  page
}
