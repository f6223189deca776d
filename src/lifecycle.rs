//! Soft/hard-delete lifecycle shared by every resource type.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CacheError;

/// Lifecycle state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  /// Visible and mutable in normal views
  Active,
  /// Soft-deleted, shown only in trash views
  Trashed,
  /// Hard-deleted; terminal
  Purged,
}

impl LifecycleState {
  /// Map the server's `isDeleted` flag onto a state.
  pub fn from_deleted_flag(is_deleted: bool) -> Self {
    if is_deleted {
      Self::Trashed
    } else {
      Self::Active
    }
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Active => "active",
      Self::Trashed => "trashed",
      Self::Purged => "purged",
    };
    f.write_str(s)
  }
}

/// Validate a lifecycle transition.
///
/// Legal moves: Active -> Trashed, Trashed -> Active, and either of them ->
/// Purged. Nothing leaves Purged.
pub fn transition(from: LifecycleState, to: LifecycleState) -> Result<LifecycleState, CacheError> {
  use LifecycleState::*;

  match (from, to) {
    (Active, Trashed) | (Trashed, Active) | (Active, Purged) | (Trashed, Purged) => Ok(to),
    _ => Err(CacheError::InvalidLifecycleTransition { from, to }),
  }
}

/// Which lifecycle states a list view shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleView {
  /// Default view, hides trashed rows
  #[default]
  Active,
  /// Trash view
  Trashed,
  All,
}

impl LifecycleView {
  pub fn admits(self, state: LifecycleState) -> bool {
    match self {
      Self::Active => state == LifecycleState::Active,
      Self::Trashed => state == LifecycleState::Trashed,
      Self::All => state != LifecycleState::Purged,
    }
  }

  /// Value for the server's `isDeleted` query parameter, if the view filters on it.
  pub fn deleted_param(self) -> Option<bool> {
    match self {
      Self::Active => Some(false),
      Self::Trashed => Some(true),
      Self::All => None,
    }
  }
}
