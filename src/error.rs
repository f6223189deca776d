//! Error taxonomy for cache reads and mutations.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// Failure reported by a Fetcher.
///
/// `status` is `None` for transport-level failures (connection reset, DNS, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpError {
  pub status: Option<u16>,
  pub message: String,
  /// The server answered with a success status but the body could not be
  /// read, so the request may well have been applied
  #[serde(default)]
  pub undecodable: bool,
}

impl HttpError {
  pub fn transport(message: impl Into<String>) -> Self {
    Self {
      status: None,
      message: message.into(),
      undecodable: false,
    }
  }

  pub fn status(status: u16, message: impl Into<String>) -> Self {
    Self {
      status: Some(status),
      message: message.into(),
      undecodable: false,
    }
  }

  /// A success response whose body did not parse.
  pub fn undecodable(status: u16, message: impl Into<String>) -> Self {
    Self {
      status: Some(status),
      message: message.into(),
      undecodable: true,
    }
  }
}

impl fmt::Display for HttpError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.status {
      Some(status) if self.undecodable => write!(f, "HTTP {} with unreadable body: {}", status, self.message),
      Some(status) => write!(f, "HTTP {}: {}", status, self.message),
      None => write!(f, "transport error: {}", self.message),
    }
  }
}

impl std::error::Error for HttpError {}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
  #[error("cannot move entity from {from} to {to}")]
  InvalidLifecycleTransition {
    from: LifecycleState,
    to: LifecycleState,
  },

  #[error("network failure: {0}")]
  NetworkFailure(String),

  #[error("{message}")]
  ServerRejected { status: u16, message: String },

  #[error("entity changed on the server: {0}")]
  StaleWrite(String),

  #[error("unexpected response payload: {0}")]
  UnexpectedPayload(String),
}

impl CacheError {
  /// Only transport failures are worth offering a retry for.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::NetworkFailure(_))
  }
}

impl From<HttpError> for CacheError {
  fn from(err: HttpError) -> Self {
    if err.undecodable {
      return Self::UnexpectedPayload(err.message);
    }
    match err.status {
      None | Some(408) | Some(504) => Self::NetworkFailure(err.message),
      Some(409) | Some(412) => Self::StaleWrite(err.message),
      Some(status) => Self::ServerRejected {
        status,
        message: err.message,
      },
    }
  }
}

pub type CacheResult<T> = Result<T, CacheError>;
