//! Client-side cache for admin list screens.
//!
//! A [`QuerySurface`] serves pages out of a shared [`ResourceCache`], a
//! [`MutationCoordinator`] applies writes optimistically and rolls them back
//! on failure, and a [`ListViewController`] ties both to one list screen.

pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod lifecycle;
pub mod list_view;
pub mod mutation;
pub mod query;
pub mod telemetry;

pub use cache::{CachePage, CacheSource, QueryKey, QueryResult, ResourceCache, SortField, TotalCount};
pub use config::Config;
pub use entity::{Entity, EntityId, FieldDelta, ResourceType};
pub use error::{CacheError, CacheResult, HttpError};
pub use fetch::{Fetcher, HttpFetcher, MemoryFetcher};
pub use lifecycle::{LifecycleState, LifecycleView};
pub use list_view::{ListState, ListViewController, Notice};
pub use mutation::MutationCoordinator;
pub use query::QuerySurface;
