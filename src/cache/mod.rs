//! Client-side cache of server-owned resource pages.
//!
//! This module provides:
//! - Query keys compared by value, so equal parameters share one page
//! - A per-key fetch generation so late responses never overwrite newer ones
//! - Write-through entity patches across every page holding a copy
//! - Snapshots for rolling optimistic writes back

mod key;
mod page;
mod result;
mod storage;

pub use key::{QueryKey, SortField};
pub use page::{CachePage, PaginationMode, TotalCount};
pub use result::{CacheSource, QueryResult};
pub use storage::{Generation, PageSnapshot, ResourceCache, Tombstone};
