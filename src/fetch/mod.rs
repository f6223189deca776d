//! Fetcher interface between the cache core and the remote API.
//!
//! Fetchers normalize whatever envelope the server wraps responses in, so the
//! rest of the crate only ever sees [`Payload`].

mod api_types;
mod http;
mod memory;

pub use http::HttpFetcher;
pub use memory::{Gate, MemoryFetcher};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::warn;

use crate::cache::QueryKey;
use crate::entity::{Entity, EntityId, FieldDelta, ResourceType};
use crate::error::{CacheError, CacheResult, HttpError};

/// A request against one resource type.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
  /// Read one page; the key carries page, size, view, filters, sort, search
  List(QueryKey),
  Get(EntityId),
  Create(Map<String, Value>),
  Update { id: EntityId, delta: FieldDelta },
  SoftDelete(EntityId),
  Restore(EntityId),
  HardDelete(EntityId),
}

impl Operation {
  pub fn name(&self) -> &'static str {
    match self {
      Self::List(_) => "list",
      Self::Get(_) => "get",
      Self::Create(_) => "create",
      Self::Update { .. } => "update",
      Self::SoftDelete(_) => "soft_delete",
      Self::Restore(_) => "restore",
      Self::HardDelete(_) => "hard_delete",
    }
  }
}

/// One page as returned by a list endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePage {
  pub items: Vec<Entity>,
  /// `None` when the endpoint does not report a total
  pub total: Option<u64>,
}

/// Normalized response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
  Page(RemotePage),
  Entity(Entity),
  Empty,
}

impl Payload {
  pub fn into_page(self) -> Result<RemotePage, CacheError> {
    match self {
      Payload::Page(page) => Ok(page),
      other => Err(CacheError::UnexpectedPayload(format!(
        "expected a page, got {}",
        other.kind()
      ))),
    }
  }

  /// The canonical entity, if the server sent one back.
  pub fn into_entity(self) -> Option<Entity> {
    match self {
      Payload::Entity(entity) => Some(entity),
      _ => None,
    }
  }

  fn kind(&self) -> &'static str {
    match self {
      Payload::Page(_) => "a page",
      Payload::Entity(_) => "an entity",
      Payload::Empty => "nothing",
    }
  }
}

/// Executes requests against the remote API. Stateless per call.
pub trait Fetcher: Send + Sync {
  fn call(&self, resource: ResourceType, operation: Operation) -> BoxFuture<'_, Result<Payload, HttpError>>;
}

/// Run one call with a deadline and classify its failure.
///
/// A call that misses the deadline is dropped; whatever it would have
/// returned is never observed.
pub async fn dispatch(
  fetcher: &dyn Fetcher,
  timeout: Duration,
  resource: ResourceType,
  operation: Operation,
) -> CacheResult<Payload> {
  let op = operation.name();
  match tokio::time::timeout(timeout, fetcher.call(resource, operation)).await {
    Ok(result) => result.map_err(CacheError::from),
    Err(_) => {
      warn!(%resource, op, timeout_ms = timeout.as_millis() as u64, "request timed out");
      Err(CacheError::NetworkFailure(format!(
        "{} {} timed out after {:?}",
        op, resource, timeout
      )))
    }
  }
}
