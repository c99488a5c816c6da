//! Error taxonomy shared by the cache store, the mutation executor and the
//! remote collaborators that feed them.

use thiserror::Error;

use super::keys::CacheKey;

/// How an error behaves with respect to retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  /// Session invalid or expired. Never retried; the caller redirects to login.
  Authentication,
  /// Network failure or server-side hiccup. Fetches may retry.
  Transient,
  /// Retrying cannot change the outcome.
  Permanent,
}

/// Errors surfaced by the cache layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
  /// The server rejected the write on business grounds.
  #[error("Validation failed: {message}")]
  Validation { message: String },

  #[error("Authentication required: {message}")]
  Authentication { message: String },

  #[error("Transient failure{}: {message}", status_suffix(.status))]
  Transient { status: Option<u16>, message: String },

  /// A programming error, such as an event the router has no mapping for.
  #[error("Configuration error: {message}")]
  Configuration { message: String },

  /// Rollback targeted an entry that no longer exists.
  #[error("Store inconsistency: no entry for {key}")]
  StoreInconsistency { key: CacheKey },
}

fn status_suffix(status: &Option<u16>) -> String {
  match status {
    Some(code) => format!(" (status {code})"),
    None => String::new(),
  }
}

impl CacheError {
  pub fn validation(message: impl Into<String>) -> Self {
    Self::Validation {
      message: message.into(),
    }
  }

  pub fn authentication(message: impl Into<String>) -> Self {
    Self::Authentication {
      message: message.into(),
    }
  }

  pub fn transient(message: impl Into<String>) -> Self {
    Self::Transient {
      status: None,
      message: message.into(),
    }
  }

  pub fn configuration(message: impl Into<String>) -> Self {
    Self::Configuration {
      message: message.into(),
    }
  }

  /// Classify an HTTP-like status code returned by a remote collaborator.
  ///
  /// 401, 403 and 419 (session expired) are authentication failures,
  /// 408, 429 and every 5xx are transient, and any other 4xx is a
  /// validation rejection.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    match status {
      401 | 403 | 419 => Self::Authentication { message },
      408 | 429 | 500..=599 => Self::Transient {
        status: Some(status),
        message,
      },
      _ => Self::Validation { message },
    }
  }

  pub fn class(&self) -> ErrorClass {
    match self {
      Self::Authentication { .. } => ErrorClass::Authentication,
      Self::Transient { .. } => ErrorClass::Transient,
      Self::Validation { .. } | Self::Configuration { .. } | Self::StoreInconsistency { .. } => {
        ErrorClass::Permanent
      }
    }
  }

  pub fn is_authentication(&self) -> bool {
    self.class() == ErrorClass::Authentication
  }

  pub fn is_transient(&self) -> bool {
    self.class() == ErrorClass::Transient
  }
}
