//! Maps semantic change events onto the cache keys they make stale.
//!
//! The mapping itself is supplied by the application as a route function.
//! Routes that fail are configuration errors: in strict mode they are
//! returned to the caller, otherwise they are logged and dropped.

use std::sync::Arc;
use tracing::{debug, error};

use super::error::CacheError;
use super::keys::CacheKey;
use super::store::CacheStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityClass {
  User,
  Categorization,
  Configuration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
  Created,
  /// `None` for singleton entities
  Updated { id: Option<String> },
  EnabledChanged { id: String, enabled: bool },
  Deleted { id: String },
  /// Many entities of the class changed at once
  Bulk,
}

/// One logical change, emitted once by whoever performed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
  pub class: EntityClass,
  pub change: Change,
}

impl InvalidationEvent {
  pub fn new(class: EntityClass, change: Change) -> Self {
    Self { class, change }
  }
}

/// Keys an event makes stale, or a configuration error for events that
/// have no mapping.
pub type RouteFn =
  Arc<dyn Fn(&InvalidationEvent) -> Result<Vec<CacheKey>, CacheError> + Send + Sync>;

/// Drop keys already covered by an ancestor in the same set.
pub fn minimize(mut keys: Vec<CacheKey>) -> Vec<CacheKey> {
  keys.sort();
  keys.dedup();
  let mut kept: Vec<CacheKey> = Vec::with_capacity(keys.len());
  for key in keys {
    if !kept.iter().any(|k| k.is_ancestor_of(&key)) {
      kept.push(key);
    }
  }
  kept
}

/// Routes events and invalidates the resulting keys in a store.
pub struct InvalidationRouter<V = serde_json::Value> {
  store: CacheStore<V>,
  route: RouteFn,
  strict: bool,
}

impl<V> Clone for InvalidationRouter<V> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      route: Arc::clone(&self.route),
      strict: self.strict,
    }
  }
}

impl<V> InvalidationRouter<V>
where
  V: Clone + Send + Sync + 'static,
{
  /// Strict by default in debug builds.
  pub fn new<F>(store: CacheStore<V>, route: F) -> Self
  where
    F: Fn(&InvalidationEvent) -> Result<Vec<CacheKey>, CacheError> + Send + Sync + 'static,
  {
    Self {
      store,
      route: Arc::new(route),
      strict: cfg!(debug_assertions),
    }
  }

  pub fn strict(mut self, strict: bool) -> Self {
    self.strict = strict;
    self
  }

  pub fn is_strict(&self) -> bool {
    self.strict
  }

  /// Route `event` and invalidate the keys it maps to. Returns the keys
  /// actually invalidated.
  pub fn dispatch(&self, event: &InvalidationEvent) -> Result<Vec<CacheKey>, CacheError> {
    self.dispatch_with(event, Vec::new())
  }

  /// Like [`dispatch`](Self::dispatch), adding `extra` keys to the routed
  /// set before minimizing it.
  pub fn dispatch_with(
    &self,
    event: &InvalidationEvent,
    extra: Vec<CacheKey>,
  ) -> Result<Vec<CacheKey>, CacheError> {
    let routed = match (self.route)(event) {
      Ok(keys) => keys,
      Err(err) if self.strict => return Err(err),
      Err(err) => {
        error!(error = %err, "dropping unroutable invalidation event");
        Vec::new()
      }
    };
    let keys = self.invalidate_keys(routed.into_iter().chain(extra).collect());
    debug!(?event, keys = keys.len(), "invalidation dispatched");
    Ok(keys)
  }

  pub fn invalidate_keys(&self, keys: Vec<CacheKey>) -> Vec<CacheKey> {
    let keys = minimize(keys);
    for key in &keys {
      self.store.invalidate(key);
    }
    keys
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{FetchStatus, Segment};
  use crate::key;
  use serde_json::json;

  fn notes_only(event: &InvalidationEvent) -> Result<Vec<CacheKey>, CacheError> {
    match (&event.class, &event.change) {
      (EntityClass::User, Change::Deleted { id }) => {
        Ok(vec![key!("notes", "list"), key!("notes", "detail", id)])
      }
      _ => Err(CacheError::configuration("unmapped")),
    }
  }

  #[test]
  fn test_minimize_drops_covered_keys() {
    let list = key!("notes", "list", Segment::record([("page", 1i64)]));
    let keys = minimize(vec![
      key!("notes", "detail", "n1"),
      list,
      key!("notes", "list"),
      key!("notes", "detail", "n1"),
    ]);
    assert_eq!(keys, vec![key!("notes", "detail", "n1"), key!("notes", "list")]);
    assert_eq!(
      minimize(vec![key!("notes", "list"), key!("notes")]),
      vec![key!("notes")]
    );
  }

  #[test]
  fn test_dispatch_marks_routed_keys_stale() {
    let store: CacheStore = CacheStore::new();
    let page = key!("notes", "list", Segment::record([("page", 1i64)]));
    store.set(&page, json!([]));
    store.set(&key!("notes", "detail", "n2"), json!({}));
    store.set(&key!("settings"), json!({}));

    let router = InvalidationRouter::new(store.clone(), notes_only).strict(true);
    let keys = router
      .dispatch_with(
        &InvalidationEvent::new(EntityClass::User, Change::Deleted { id: "n1".into() }),
        vec![key!("notes", "list", Segment::record([("page", 2i64)]))],
      )
      .unwrap();

    assert_eq!(keys, vec![key!("notes", "detail", "n1"), key!("notes", "list")]);
    assert_eq!(store.get(&page).unwrap().status, FetchStatus::Stale);
    assert_eq!(
      store.get(&key!("notes", "detail", "n2")).unwrap().status,
      FetchStatus::Success
    );
    assert_eq!(store.get(&key!("settings")).unwrap().status, FetchStatus::Success);
  }

  #[test]
  fn test_lenient_router_swallows_unmapped_events() {
    let store: CacheStore = CacheStore::new();
    store.set(&key!("settings"), json!({}));
    let router = InvalidationRouter::new(store.clone(), notes_only).strict(false);

    let keys = router
      .dispatch(&InvalidationEvent::new(EntityClass::Configuration, Change::Created))
      .unwrap();
    assert!(keys.is_empty());
    assert_eq!(store.get(&key!("settings")).unwrap().status, FetchStatus::Success);
  }

  #[test]
  fn test_strict_router_reports_unmapped_events() {
    let router =
      InvalidationRouter::new(CacheStore::<serde_json::Value>::new(), notes_only).strict(true);
    assert!(router
      .dispatch(&InvalidationEvent::new(EntityClass::Configuration, Change::Created))
      .is_err());
  }
}
