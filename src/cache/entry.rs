//! Read-only views of cached entries handed to callers and subscribers.

use chrono::{DateTime, Duration, Utc};

use super::error::{CacheError, ErrorClass};
use super::keys::CacheKey;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
  /// Entry exists but nothing has been loaded yet
  Idle,
  /// A fetch is in flight and no revalidation was requested
  Fetching,
  /// Value confirmed by the remote side, or optimistically projected
  Success,
  /// The last fetch failed; any previous value is kept
  Error,
  /// Value kept but marked for revalidation
  Stale,
}

/// Error details recorded on an entry after a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
  pub class: ErrorClass,
  pub message: String,
}

impl From<&CacheError> for ErrorInfo {
  fn from(err: &CacheError) -> Self {
    Self {
      class: err.class(),
      message: err.to_string(),
    }
  }
}

/// Identifier of a single mutation invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutationId(pub u64);

impl std::fmt::Display for MutationId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "m{}", self.0)
  }
}

/// Snapshot of one cache entry as seen by readers.
///
/// `value` already has every pending optimistic projection applied.
/// `pending` lists the mutations whose projections are visible, in
/// invocation order; an empty list means the value is confirmed.
/// `fetching` is set while a load is in flight, including the background
/// revalidation of a `Stale` entry, whose status stays `Stale` until the
/// load completes.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
  pub key: CacheKey,
  pub value: Option<V>,
  pub status: FetchStatus,
  pub last_updated: Option<DateTime<Utc>>,
  pub error: Option<ErrorInfo>,
  pub pending: Vec<MutationId>,
  pub fetching: bool,
}

impl<V> CacheEntry<V> {
  pub fn is_optimistic(&self) -> bool {
    !self.pending.is_empty()
  }

  pub fn is_stale(&self) -> bool {
    self.status == FetchStatus::Stale
  }

  pub fn is_fetching(&self) -> bool {
    self.fetching
  }

  /// A successful entry younger than `stale_time`. Optimistic entries are
  /// always fresh so that reads do not trigger a refetch mid-mutation.
  pub fn is_fresh(&self, stale_time: Duration) -> bool {
    if self.status != FetchStatus::Success {
      return false;
    }
    if self.is_optimistic() {
      return true;
    }
    match self.last_updated {
      Some(at) => Utc::now() - at <= stale_time,
      None => false,
    }
  }
}
