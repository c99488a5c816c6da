//! In-memory keyed cache with subscriptions, background refetch and
//! optimistic layers.
//!
//! Every entry keeps the last value confirmed by the remote side plus an
//! ordered stack of optimistic layers, one per in-flight mutation that
//! touched it. Readers see the confirmed value with every layer folded on
//! top in invocation order. Rolling back a mutation removes only its own
//! layer, so a later mutation's projection survives an earlier failure.
//!
//! The state lock is never held across an await or while subscriber
//! callbacks run.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::entry::{CacheEntry, ErrorInfo, FetchStatus, MutationId};
use super::error::CacheError;
use super::keys::CacheKey;
use super::retry::{RetryDecision, RetryPolicy};

/// Loads the value for a key from the remote source of truth.
pub type FetchFn<V> = Arc<dyn Fn(CacheKey) -> BoxFuture<'static, Result<V, CacheError>> + Send + Sync>;

/// Optimistic projection of a cached value. `None` means the value is not
/// affected and must be left untouched.
pub type Projection<V> = Arc<dyn Fn(&V) -> Option<V> + Send + Sync>;

type Callback<V> = Arc<dyn Fn(&CacheEntry<V>) + Send + Sync>;

struct Layer<V> {
  mutation: MutationId,
  projection: Projection<V>,
  committed: bool,
}

struct Slot<V> {
  confirmed: Option<V>,
  visible: Option<V>,
  status: FetchStatus,
  last_updated: Option<DateTime<Utc>>,
  error: Option<ErrorInfo>,
  /// Bumped on every confirmed write
  generation: u64,
  layers: Vec<Layer<V>>,
  fetching: bool,
}

impl<V: Clone> Slot<V> {
  fn empty() -> Self {
    Self {
      confirmed: None,
      visible: None,
      status: FetchStatus::Idle,
      last_updated: None,
      error: None,
      generation: 0,
      layers: Vec::new(),
      fetching: false,
    }
  }

  fn view(&self, key: &CacheKey) -> CacheEntry<V> {
    CacheEntry {
      key: key.clone(),
      value: self.visible.clone(),
      status: self.status,
      last_updated: self.last_updated,
      error: self.error.clone(),
      pending: self.layers.iter().map(|l| l.mutation).collect(),
      fetching: self.fetching,
    }
  }

  fn refold(&mut self) {
    let mut value = self.confirmed.clone();
    if let Some(current) = value.as_mut() {
      for layer in &self.layers {
        if let Some(next) = (layer.projection)(current) {
          *current = next;
        }
      }
    }
    self.visible = value;
  }

  fn write_confirmed(&mut self, value: V) {
    self.confirmed = Some(value);
    self.generation += 1;
    self.status = FetchStatus::Success;
    self.last_updated = Some(Utc::now());
    self.error = None;
    self.refold();
  }

  /// Fold committed layers that no longer sit above a pending one into the
  /// confirmed value. Returns whether any layer was folded.
  fn settle_committed(&mut self) -> bool {
    let mut settled = false;
    while self.layers.first().is_some_and(|l| l.committed) {
      let layer = self.layers.remove(0);
      if let Some(base) = &self.confirmed {
        if let Some(next) = (layer.projection)(base) {
          self.confirmed = Some(next);
        }
      }
      self.generation += 1;
      settled = true;
    }
    settled
  }
}

struct InFlight {
  token: u64,
  abort: Option<AbortHandle>,
}

struct Subscriber<V> {
  id: u64,
  key: CacheKey,
  callback: Callback<V>,
}

struct State<V> {
  entries: BTreeMap<CacheKey, Slot<V>>,
  fetchers: Vec<(CacheKey, FetchFn<V>)>,
  in_flight: HashMap<CacheKey, InFlight>,
  subscribers: Vec<Subscriber<V>>,
  next_subscriber: u64,
  next_token: u64,
  disposed: bool,
}

impl<V: Clone> State<V> {
  fn new() -> Self {
    Self {
      entries: BTreeMap::new(),
      fetchers: Vec::new(),
      in_flight: HashMap::new(),
      subscribers: Vec::new(),
      next_subscriber: 0,
      next_token: 0,
      disposed: false,
    }
  }

  /// Subscribers registered on `key` or one of its ancestors.
  fn listeners(&self, key: &CacheKey) -> Vec<Callback<V>> {
    self
      .subscribers
      .iter()
      .filter(|s| s.key.is_ancestor_of(key))
      .map(|s| Arc::clone(&s.callback))
      .collect()
  }

  fn notification(&self, key: &CacheKey) -> Option<Notification<V>> {
    let slot = self.entries.get(key)?;
    let listeners = self.listeners(key);
    if listeners.is_empty() {
      return None;
    }
    Some(Notification {
      entry: slot.view(key),
      listeners,
    })
  }

  fn fetcher_for(&self, key: &CacheKey) -> Option<FetchFn<V>> {
    self
      .fetchers
      .iter()
      .filter(|(prefix, _)| prefix.is_ancestor_of(key))
      .max_by_key(|(prefix, _)| prefix.len())
      .map(|(_, f)| Arc::clone(f))
  }

  fn keys_under(&self, prefix: &CacheKey) -> Vec<CacheKey> {
    self
      .entries
      .range(prefix.clone()..)
      .take_while(|(k, _)| prefix.is_ancestor_of(k))
      .map(|(k, _)| k.clone())
      .collect()
  }

  /// Register an in-flight fetch for `key`. A background revalidation
  /// leaves the status alone so a `Stale` entry stays visibly stale.
  fn begin_fetch(&mut self, key: &CacheKey, background: bool) -> Option<(u64, FetchFn<V>)> {
    let fetcher = self.fetcher_for(key)?;
    self.next_token += 1;
    let token = self.next_token;
    if let Some(previous) = self.in_flight.insert(key.clone(), InFlight { token, abort: None }) {
      if let Some(handle) = previous.abort {
        handle.abort();
      }
    }
    let slot = self.entries.entry(key.clone()).or_insert_with(Slot::empty);
    slot.fetching = true;
    if !background {
      slot.status = FetchStatus::Fetching;
    }
    Some((token, fetcher))
  }

  fn is_current(&self, key: &CacheKey, token: u64) -> bool {
    self.in_flight.get(key).is_some_and(|f| f.token == token)
  }
}

struct Notification<V> {
  entry: CacheEntry<V>,
  listeners: Vec<Callback<V>>,
}

fn deliver<V>(notifications: Vec<Notification<V>>) {
  for n in notifications {
    for listener in &n.listeners {
      listener(&n.entry);
    }
  }
}

struct SnapshotEntry<V> {
  previous: CacheEntry<V>,
  generation: u64,
}

/// Entries as they were immediately before one mutation's optimistic apply.
///
/// Only entries the projection actually changed are recorded.
pub struct Snapshot<V> {
  mutation: MutationId,
  entries: Vec<SnapshotEntry<V>>,
}

impl<V> Snapshot<V> {
  pub fn mutation(&self) -> MutationId {
    self.mutation
  }

  pub fn entries(&self) -> impl Iterator<Item = &CacheEntry<V>> {
    self.entries.iter().map(|e| &e.previous)
  }

  pub fn keys(&self) -> Vec<CacheKey> {
    self.entries.iter().map(|e| e.previous.key.clone()).collect()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

struct Inner<V> {
  state: Mutex<State<V>>,
  retry: RetryPolicy,
}

/// Process-wide cache of server-derived values.
///
/// Cloning yields another handle to the same store.
pub struct CacheStore<V = serde_json::Value> {
  inner: Arc<Inner<V>>,
}

impl<V> Clone for CacheStore<V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<V> CacheStore<V>
where
  V: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self::with_retry_policy(RetryPolicy::default())
  }

  pub fn with_retry_policy(retry: RetryPolicy) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State::new()),
        retry,
      }),
    }
  }

  pub fn retry_policy(&self) -> &RetryPolicy {
    &self.inner.retry
  }

  fn lock(&self) -> MutexGuard<'_, State<V>> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Abort every in-flight fetch and drop all entries, fetchers and
  /// subscribers. Invalidations after disposal no longer refetch.
  pub fn dispose(&self) {
    let mut state = self.lock();
    for (_, fetch) in state.in_flight.drain() {
      if let Some(handle) = fetch.abort {
        handle.abort();
      }
    }
    state.entries.clear();
    state.fetchers.clear();
    state.subscribers.clear();
    state.disposed = true;
    debug!("cache store disposed");
  }

  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
    let state = self.lock();
    state.entries.get(key).map(|slot| slot.view(key))
  }

  /// Visible value for `key`, if any.
  pub fn value(&self, key: &CacheKey) -> Option<V> {
    self.get(key).and_then(|entry| entry.value)
  }

  pub fn keys(&self) -> Vec<CacheKey> {
    self.lock().entries.keys().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Write a confirmed value, creating the entry if needed.
  ///
  /// Pending optimistic layers are re-applied on top of the new value.
  pub fn set(&self, key: &CacheKey, value: V) {
    let notification = {
      let mut state = self.lock();
      let slot = state.entries.entry(key.clone()).or_insert_with(Slot::empty);
      slot.write_confirmed(value);
      trace!(key = %key, "cache set");
      state.notification(key)
    };
    deliver(notification.into_iter().collect());
  }

  /// Apply `updater` to the confirmed value of every entry whose key matches
  /// `predicate`. Entries for which the updater returns `None` are left
  /// untouched. Returns the entries as they were before the write.
  pub fn set_many<P, U>(&self, predicate: P, mut updater: U) -> Vec<CacheEntry<V>>
  where
    P: Fn(&CacheKey) -> bool,
    U: FnMut(&CacheKey, &V) -> Option<V>,
  {
    let (previous, notifications) = {
      let mut state = self.lock();
      let mut previous = Vec::new();
      let mut changed = Vec::new();
      for (key, slot) in state.entries.iter_mut() {
        if !predicate(key) {
          continue;
        }
        let Some(current) = slot.confirmed.as_ref() else {
          continue;
        };
        if let Some(next) = updater(key, current) {
          previous.push(slot.view(key));
          slot.write_confirmed(next);
          changed.push(key.clone());
        }
      }
      let notifications: Vec<_> = changed.iter().filter_map(|k| state.notification(k)).collect();
      (previous, notifications)
    };
    deliver(notifications);
    previous
  }

  /// Mark `key` and every descendant stale, keeping their values, and
  /// schedule a background refetch for each one a fetcher is registered for.
  /// Entries stay `Stale` (with `fetching` set) until their refetch lands.
  /// Returns the number of entries marked.
  pub fn invalidate(&self, key: &CacheKey) -> usize {
    let (marked, notifications, refetches) = {
      let mut state = self.lock();
      let marked = state.keys_under(key);
      for k in &marked {
        if let Some(slot) = state.entries.get_mut(k) {
          slot.status = FetchStatus::Stale;
        }
      }
      let notifications: Vec<_> = marked.iter().filter_map(|k| state.notification(k)).collect();

      let runtime = tokio::runtime::Handle::try_current().ok();
      let mut refetches = Vec::new();
      if let (Some(runtime), false) = (runtime, state.disposed) {
        for k in &marked {
          if let Some((token, fetcher)) = state.begin_fetch(k, true) {
            refetches.push((runtime.clone(), k.clone(), token, fetcher));
          }
        }
      }
      (marked, notifications, refetches)
    };
    debug!(key = %key, fingerprint = %key.fingerprint(), count = marked.len(), "cache invalidated");
    deliver(notifications);

    for (runtime, k, token, fetcher) in refetches {
      let store = self.clone();
      let task_key = k.clone();
      let handle = runtime.spawn(async move {
        let _ = store.complete_fetch(&task_key, token, fetcher).await;
      });
      let mut state = self.lock();
      if let Some(fetch) = state.in_flight.get_mut(&k) {
        if fetch.token == token {
          fetch.abort = Some(handle.abort_handle());
        }
      }
    }
    marked.len()
  }

  /// Evict `key` and every descendant, cancelling their fetches.
  pub fn remove(&self, key: &CacheKey) -> usize {
    let mut state = self.lock();
    let doomed = state.keys_under(key);
    for k in &doomed {
      state.entries.remove(k);
      if let Some(fetch) = state.in_flight.remove(k) {
        if let Some(handle) = fetch.abort {
          handle.abort();
        }
      }
    }
    doomed.len()
  }

  /// Register `callback` for changes to `key` or any of its descendants.
  ///
  /// The callback runs synchronously inside the call that caused the
  /// change. Dropping the returned guard unsubscribes.
  pub fn subscribe<F>(&self, key: &CacheKey, callback: F) -> Subscription<V>
  where
    F: Fn(&CacheEntry<V>) + Send + Sync + 'static,
  {
    let mut state = self.lock();
    state.next_subscriber += 1;
    let id = state.next_subscriber;
    state.subscribers.push(Subscriber {
      id,
      key: key.clone(),
      callback: Arc::new(callback),
    });
    Subscription {
      store: Arc::downgrade(&self.inner),
      id,
    }
  }

  /// Register the loader used for `prefix` and every key beneath it.
  /// The most specific registered prefix wins.
  pub fn register_fetcher<F, Fut>(&self, prefix: CacheKey, fetcher: F)
  where
    F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, CacheError>> + Send + 'static,
  {
    let fetcher: FetchFn<V> =
      Arc::new(move |key: CacheKey| -> BoxFuture<'static, Result<V, CacheError>> {
        Box::pin(fetcher(key))
      });
    let mut state = self.lock();
    state.fetchers.retain(|(p, _)| p != &prefix);
    state.fetchers.push((prefix, fetcher));
  }

  /// Load `key` through its registered fetcher, retrying transient failures
  /// per the store's retry policy, and cache the result.
  ///
  /// If the fetch is cancelled or superseded while running, its result is
  /// returned to the caller but not written to the store.
  pub async fn fetch(&self, key: &CacheKey) -> Result<V, CacheError> {
    let (begun, notification) = {
      let mut state = self.lock();
      let begun = state.begin_fetch(key, false);
      let notification = begun.as_ref().and_then(|_| state.notification(key));
      (begun, notification)
    };
    let Some((token, fetcher)) = begun else {
      return Err(CacheError::configuration(format!(
        "no fetcher registered for {key}"
      )));
    };
    deliver(notification.into_iter().collect());
    self.complete_fetch(key, token, fetcher).await
  }

  async fn complete_fetch(
    &self,
    key: &CacheKey,
    token: u64,
    fetcher: FetchFn<V>,
  ) -> Result<V, CacheError> {
    let mut attempt = 0;
    let result = loop {
      match fetcher(key.clone()).await {
        Ok(value) => break Ok(value),
        Err(err) => match self.inner.retry.decide(&err, attempt) {
          RetryDecision::Retry(delay) => {
            debug!(key = %key, attempt, ?delay, error = %err, "retrying fetch");
            tokio::time::sleep(delay).await;
            if !self.lock().is_current(key, token) {
              break Err(err);
            }
            attempt += 1;
          }
          RetryDecision::GiveUp => break Err(err),
        },
      }
    };

    let notification = {
      let mut state = self.lock();
      if !state.is_current(key, token) {
        trace!(key = %key, "discarding superseded fetch result");
        return result;
      }
      state.in_flight.remove(key);
      let slot = state.entries.entry(key.clone()).or_insert_with(Slot::empty);
      slot.fetching = false;
      match &result {
        Ok(value) => slot.write_confirmed(value.clone()),
        Err(err) => {
          slot.status = FetchStatus::Error;
          slot.error = Some(ErrorInfo::from(err));
          warn!(key = %key, fingerprint = %key.fingerprint(), error = %err, "fetch failed");
        }
      }
      state.notification(key)
    };
    deliver(notification.into_iter().collect());
    result
  }

  /// Cancel in-flight fetches for `prefix` and its descendants so a late
  /// response cannot overwrite newer data. Returns how many were cancelled.
  pub fn cancel_fetches(&self, prefix: &CacheKey) -> usize {
    let (cancelled, notifications) = {
      let mut state = self.lock();
      let cancelled: Vec<CacheKey> = state
        .in_flight
        .keys()
        .filter(|k| prefix.is_ancestor_of(k))
        .cloned()
        .collect();
      for k in &cancelled {
        if let Some(fetch) = state.in_flight.remove(k) {
          if let Some(handle) = fetch.abort {
            handle.abort();
          }
        }
        if let Some(slot) = state.entries.get_mut(k) {
          slot.fetching = false;
          if slot.status == FetchStatus::Fetching {
            slot.status = if slot.visible.is_some() {
              FetchStatus::Stale
            } else {
              FetchStatus::Idle
            };
          }
        }
      }
      let notifications: Vec<_> = cancelled.iter().filter_map(|k| state.notification(k)).collect();
      (cancelled, notifications)
    };
    if !cancelled.is_empty() {
      debug!(prefix = %prefix, count = cancelled.len(), "cancelled in-flight fetches");
    }
    deliver(notifications);
    cancelled.len()
  }

  /// Push an optimistic layer for `mutation` onto every entry under one of
  /// `scopes` whose visible value the projection changes. Entries the
  /// projection leaves alone are not touched. The returned snapshot holds
  /// each changed entry exactly as it was before.
  pub fn apply_optimistic(
    &self,
    mutation: MutationId,
    scopes: &[CacheKey],
    projection: Projection<V>,
  ) -> Snapshot<V> {
    let (snapshot, notifications) = {
      let mut state = self.lock();
      let mut entries = Vec::new();
      let mut changed = Vec::new();
      for (key, slot) in state.entries.iter_mut() {
        if !scopes.iter().any(|scope| scope.is_ancestor_of(key)) {
          continue;
        }
        let Some(current) = slot.visible.as_ref() else {
          continue;
        };
        let Some(next) = projection(current) else {
          continue;
        };
        entries.push(SnapshotEntry {
          previous: slot.view(key),
          generation: slot.generation,
        });
        slot.layers.push(Layer {
          mutation,
          projection: Arc::clone(&projection),
          committed: false,
        });
        slot.visible = Some(next);
        slot.status = FetchStatus::Success;
        slot.last_updated = Some(Utc::now());
        slot.error = None;
        changed.push(key.clone());
      }
      let notifications: Vec<_> = changed.iter().filter_map(|k| state.notification(k)).collect();
      (Snapshot { mutation, entries }, notifications)
    };
    debug!(%mutation, entries = snapshot.entries.len(), "optimistic projection applied");
    deliver(notifications);
    snapshot
  }

  /// Undo the layer `snapshot` recorded. When no other layer remains and no
  /// confirmed write happened meanwhile, each entry is restored exactly as
  /// snapshotted; otherwise later layers are re-applied over the confirmed
  /// value. Entries that disappeared are reported, not restored.
  pub fn rollback_optimistic(&self, snapshot: &Snapshot<V>) -> Vec<CacheError> {
    let (missing, notifications) = {
      let mut state = self.lock();
      let mut missing = Vec::new();
      let mut changed = Vec::new();
      for snap in &snapshot.entries {
        let key = &snap.previous.key;
        let Some(slot) = state.entries.get_mut(key) else {
          missing.push(CacheError::StoreInconsistency { key: key.clone() });
          continue;
        };
        let Some(pos) = slot.layers.iter().position(|l| l.mutation == snapshot.mutation) else {
          missing.push(CacheError::StoreInconsistency { key: key.clone() });
          continue;
        };
        slot.layers.remove(pos);
        slot.settle_committed();
        slot.refold();
        if slot.layers.is_empty() && slot.generation == snap.generation {
          slot.status = snap.previous.status;
          slot.last_updated = snap.previous.last_updated;
          slot.error = snap.previous.error.clone();
        } else {
          slot.last_updated = Some(Utc::now());
        }
        changed.push(key.clone());
      }
      let notifications: Vec<_> = changed.iter().filter_map(|k| state.notification(k)).collect();
      (missing, notifications)
    };
    debug!(mutation = %snapshot.mutation, restored = snapshot.entries.len() - missing.len(), "optimistic projection rolled back");
    deliver(notifications);
    missing
  }

  /// Mark the layer `snapshot` recorded as confirmed by the server. It is
  /// folded into the confirmed value once no pending layer sits beneath it.
  /// The visible value does not change; subscribers of entries whose pending
  /// list shrank are notified.
  pub fn commit_optimistic(&self, snapshot: &Snapshot<V>) {
    let notifications = {
      let mut state = self.lock();
      let mut settled = Vec::new();
      for snap in &snapshot.entries {
        let key = &snap.previous.key;
        let Some(slot) = state.entries.get_mut(key) else {
          continue;
        };
        if let Some(layer) = slot
          .layers
          .iter_mut()
          .find(|l| l.mutation == snapshot.mutation)
        {
          layer.committed = true;
        }
        if slot.settle_committed() {
          settled.push(key.clone());
        }
      }
      settled
        .iter()
        .filter_map(|k| state.notification(k))
        .collect::<Vec<_>>()
    };
    deliver(notifications);
  }
}

impl<V> Default for CacheStore<V>
where
  V: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

impl CacheStore<serde_json::Value> {
  /// Visible value for `key` decoded as `T`. Values that do not decode are
  /// treated as absent.
  pub fn get_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
    let value = self.value(key)?;
    serde_json::from_value(value).ok()
  }

  pub fn set_as<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<(), CacheError> {
    let encoded = serde_json::to_value(value)
      .map_err(|e| CacheError::configuration(format!("failed to encode value for {key}: {e}")))?;
    self.set(key, encoded);
    Ok(())
  }
}

/// Guard returned by [`CacheStore::subscribe`].
pub struct Subscription<V> {
  store: Weak<Inner<V>>,
  id: u64,
}

impl<V> Subscription<V> {
  pub fn unsubscribe(self) {
    drop(self);
  }
}

impl<V> Drop for Subscription<V> {
  fn drop(&mut self) {
    if let Some(inner) = self.store.upgrade() {
      let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
      state.subscribers.retain(|s| s.id != self.id);
    }
  }
}
