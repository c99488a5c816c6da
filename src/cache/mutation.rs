//! Optimistic mutations with rollback.
//!
//! A mutation runs in a fixed order:
//!
//! 1. Cancel in-flight fetches for the target and affected groups
//! 2. Snapshot and apply the optimistic projection (one store call)
//! 3. Await the remote commit, the only suspension point
//! 4. On success, confirm the projection and invalidate related keys
//! 5. On failure, or when the server rejects the write in a 2xx response,
//!    roll back this mutation's layer before returning the error
//!
//! Mutations are never retried here. A failed mutation is retried only when
//! the caller invokes it again.

use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument};

use super::entry::MutationId;
use super::error::CacheError;
use super::invalidation::{InvalidationEvent, InvalidationRouter};
use super::keys::CacheKey;
use super::store::{CacheStore, Projection};

static NEXT_MUTATION: AtomicU64 = AtomicU64::new(1);

/// Inspects a successful commit response for a business-level rejection.
pub trait CommitOutcome {
  /// `Some(reason)` when the server refused the write despite answering
  /// successfully.
  fn rejection(&self) -> Option<String> {
    None
  }
}

impl CommitOutcome for () {}

/// Objects of the form `{"success": false, "message": ...}` are rejections.
impl CommitOutcome for Value {
  fn rejection(&self) -> Option<String> {
    match self.get("success") {
      Some(Value::Bool(false)) => Some(
        self
          .get("message")
          .and_then(Value::as_str)
          .unwrap_or("the server rejected the change")
          .to_string(),
      ),
      _ => None,
    }
  }
}

/// One mutation invocation.
pub struct MutationDescriptor<V, R> {
  id: MutationId,
  target: CacheKey,
  projection: Option<Projection<V>>,
  commit: BoxFuture<'static, Result<R, CacheError>>,
  affected_groups: Vec<CacheKey>,
  event: Option<InvalidationEvent>,
}

impl<V, R> MutationDescriptor<V, R> {
  /// `commit` is not polled until the mutation executes.
  pub fn new<F>(target: CacheKey, commit: F) -> Self
  where
    F: Future<Output = Result<R, CacheError>> + Send + 'static,
  {
    Self {
      id: MutationId(NEXT_MUTATION.fetch_add(1, Ordering::Relaxed)),
      target,
      projection: None,
      commit: Box::pin(commit),
      affected_groups: Vec::new(),
      event: None,
    }
  }

  /// Optimistic projection applied to the target and every affected group
  /// entry. Return `None` for values the mutation does not change.
  pub fn projection<F>(mut self, projection: F) -> Self
  where
    F: Fn(&V) -> Option<V> + Send + Sync + 'static,
  {
    self.projection = Some(Arc::new(projection));
    self
  }

  pub fn affects(mut self, group: CacheKey) -> Self {
    self.affected_groups.push(group);
    self
  }

  /// Semantic event routed for invalidation once the commit succeeds.
  pub fn emits(mut self, event: InvalidationEvent) -> Self {
    self.event = Some(event);
    self
  }

  pub fn id(&self) -> MutationId {
    self.id
  }

  pub fn target(&self) -> &CacheKey {
    &self.target
  }

  pub fn affected_groups(&self) -> &[CacheKey] {
    &self.affected_groups
  }
}

/// Runs mutations against a store and its invalidation router.
pub struct MutationExecutor<V = Value> {
  store: CacheStore<V>,
  router: InvalidationRouter<V>,
}

impl<V> Clone for MutationExecutor<V> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      router: self.router.clone(),
    }
  }
}

impl<V> MutationExecutor<V>
where
  V: Clone + Send + Sync + 'static,
{
  pub fn new(store: CacheStore<V>, router: InvalidationRouter<V>) -> Self {
    Self { store, router }
  }

  pub fn store(&self) -> &CacheStore<V> {
    &self.store
  }

  /// Execute `mutation`. On error the cache has already been rolled back
  /// when this returns.
  pub async fn execute<R>(&self, mutation: MutationDescriptor<V, R>) -> Result<R, CacheError>
  where
    R: CommitOutcome,
  {
    let span = info_span!("mutation", id = %mutation.id, target = %mutation.target);
    self.run(mutation).instrument(span).await
  }

  async fn run<R>(&self, mutation: MutationDescriptor<V, R>) -> Result<R, CacheError>
  where
    R: CommitOutcome,
  {
    let MutationDescriptor {
      id,
      target,
      projection,
      commit,
      affected_groups,
      event,
    } = mutation;

    let mut scopes = Vec::with_capacity(affected_groups.len() + 1);
    scopes.push(target.clone());
    scopes.extend(affected_groups.iter().cloned());

    for scope in &scopes {
      self.store.cancel_fetches(scope);
    }

    let snapshot = projection.map(|p| self.store.apply_optimistic(id, &scopes, p));

    let outcome = match commit.await {
      Ok(response) => match response.rejection() {
        Some(reason) => Err(CacheError::validation(reason)),
        None => Ok(response),
      },
      Err(err) => Err(err),
    };

    match outcome {
      Ok(response) => {
        if let Some(snapshot) = &snapshot {
          self.store.commit_optimistic(snapshot);
        }
        let invalidated = match &event {
          Some(event) => self.router.dispatch_with(event, scopes)?,
          None => self.router.invalidate_keys(scopes),
        };
        debug!(invalidated = invalidated.len(), "mutation committed");
        Ok(response)
      }
      Err(err) => {
        if let Some(snapshot) = &snapshot {
          for inconsistency in self.store.rollback_optimistic(snapshot) {
            warn!(error = %inconsistency, "rollback skipped missing entry");
          }
        }
        warn!(error = %err, class = ?err.class(), "mutation failed, optimistic state rolled back");
        Err(err)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::admin::keys::users;
  use crate::admin::routing::route;
  use crate::admin::types::UserFilter;
  use crate::cache::{Change, EntityClass, FetchStatus};
  use serde_json::json;
  use tokio::sync::oneshot;

  fn executor() -> (CacheStore, MutationExecutor) {
    let store: CacheStore = CacheStore::new();
    let router = InvalidationRouter::new(store.clone(), route).strict(true);
    (store.clone(), MutationExecutor::new(store, router))
  }

  fn set_enabled(id: &'static str, enabled: bool) -> impl Fn(&Value) -> Option<Value> + Send + Sync {
    move |value: &Value| {
      if let Some(list) = value.as_array() {
        let pos = list.iter().position(|u| u["id"] == id)?;
        let mut list = list.clone();
        list[pos]["enabled"] = json!(enabled);
        return Some(Value::Array(list));
      }
      if value["id"] == id {
        let mut user = value.clone();
        user["enabled"] = json!(enabled);
        return Some(user);
      }
      None
    }
  }

  fn toggle(
    id: &'static str,
    enabled: bool,
    commit: oneshot::Receiver<Result<Value, CacheError>>,
  ) -> MutationDescriptor<Value, Value> {
    MutationDescriptor::new(users::detail(id), async move {
      commit
        .await
        .unwrap_or_else(|_| Err(CacheError::transient("commit dropped")))
    })
    .projection(set_enabled(id, enabled))
    .affects(users::lists())
    .emits(InvalidationEvent::new(
      EntityClass::User,
      Change::EnabledChanged {
        id: id.to_string(),
        enabled,
      },
    ))
  }

  async fn settle() {
    for _ in 0..10 {
      tokio::task::yield_now().await;
    }
  }

  #[tokio::test]
  async fn test_failed_commit_rolls_back_target_and_groups() {
    let (store, executor) = executor();
    let list = users::list(&UserFilter::default());
    store.set(&list, json!([{"id": "u1", "enabled": true}]));
    store.set(&users::detail("u1"), json!({"id": "u1", "enabled": true}));
    let list_before = store.get(&list).unwrap();
    let detail_before = store.get(&users::detail("u1")).unwrap();

    let (tx, rx) = oneshot::channel();
    let task = {
      let executor = executor.clone();
      tokio::spawn(async move { executor.execute(toggle("u1", false, rx)).await })
    };
    settle().await;

    assert_eq!(
      store.value(&list),
      Some(json!([{"id": "u1", "enabled": false}]))
    );
    assert!(store.get(&users::detail("u1")).unwrap().is_optimistic());

    tx.send(Err(CacheError::from_status(503, "unavailable"))).unwrap();
    let err = task.await.unwrap().unwrap_err();

    assert!(err.is_transient());
    assert_eq!(store.get(&list).unwrap(), list_before);
    assert_eq!(store.get(&users::detail("u1")).unwrap(), detail_before);
  }

  #[tokio::test]
  async fn test_business_rejection_rolls_back_as_validation() {
    let (store, executor) = executor();
    store.set(&users::detail("u1"), json!({"id": "u1", "enabled": true}));
    let before = store.get(&users::detail("u1")).unwrap();

    let (tx, rx) = oneshot::channel();
    tx.send(Ok(json!({"success": false, "message": "Cannot disable the last admin"})))
      .unwrap();
    let err = executor.execute(toggle("u1", false, rx)).await.unwrap_err();

    assert_eq!(err, CacheError::validation("Cannot disable the last admin"));
    assert_eq!(store.get(&users::detail("u1")).unwrap(), before);
  }

  #[tokio::test]
  async fn test_success_keeps_projection_and_invalidates() {
    let (store, executor) = executor();
    let list = users::list(&UserFilter::default());
    store.set(&list, json!([{"id": "u1", "enabled": true}]));
    store.set(&users::detail("u1"), json!({"id": "u1", "enabled": true}));
    store.set(&users::detail("u2"), json!({"id": "u2", "enabled": true}));

    let (tx, rx) = oneshot::channel();
    tx.send(Ok(json!({"success": true}))).unwrap();
    executor.execute(toggle("u1", false, rx)).await.unwrap();

    let entry = store.get(&list).unwrap();
    assert_eq!(entry.value, Some(json!([{"id": "u1", "enabled": false}])));
    assert_eq!(entry.status, FetchStatus::Stale);
    assert!(entry.pending.is_empty());
    assert_eq!(
      store.get(&users::detail("u1")).unwrap().status,
      FetchStatus::Stale
    );
    assert_eq!(
      store.get(&users::detail("u2")).unwrap().status,
      FetchStatus::Success
    );
  }

  #[tokio::test]
  async fn test_projection_leaves_unrelated_lists_untouched() {
    let (store, executor) = executor();
    let others = users::list(&UserFilter {
      page: Some(2),
      ..UserFilter::default()
    });
    store.set(&others, json!([{"id": "u9", "enabled": true}]));
    let before = store.get(&others).unwrap();

    let (tx, rx) = oneshot::channel();
    let task = {
      let executor = executor.clone();
      tokio::spawn(async move { executor.execute(toggle("u1", false, rx)).await })
    };
    settle().await;
    assert_eq!(store.get(&others).unwrap(), before);

    tx.send(Err(CacheError::transient("timeout"))).unwrap();
    task.await.unwrap().unwrap_err();
    assert_eq!(store.get(&others).unwrap().last_updated, before.last_updated);
  }

  #[tokio::test]
  async fn test_earlier_failure_does_not_clobber_later_mutation() {
    let (store, executor) = executor();
    let list = users::list(&UserFilter::default());
    store.set(&list, json!([{"id": "u1", "enabled": true}]));

    let (tx1, rx1) = oneshot::channel();
    let (tx2, rx2) = oneshot::channel();
    let first = {
      let executor = executor.clone();
      tokio::spawn(async move { executor.execute(toggle("u1", false, rx1)).await })
    };
    settle().await;
    let second = {
      let executor = executor.clone();
      tokio::spawn(async move { executor.execute(toggle("u1", true, rx2)).await })
    };
    settle().await;
    assert_eq!(store.get(&list).unwrap().pending.len(), 2);

    tx1.send(Err(CacheError::transient("timeout"))).unwrap();
    assert!(first.await.unwrap().is_err());
    assert_eq!(store.value(&list), Some(json!([{"id": "u1", "enabled": true}])));

    tx2.send(Ok(json!({"success": true}))).unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(store.value(&list), Some(json!([{"id": "u1", "enabled": true}])));
    assert!(store.get(&list).unwrap().pending.is_empty());
  }

  #[tokio::test]
  async fn test_later_failure_restores_value_left_by_earlier_apply() {
    let (store, executor) = executor();
    store.set(&users::detail("u1"), json!({"id": "u1", "enabled": true}));

    let (tx1, rx1) = oneshot::channel();
    let (tx2, rx2) = oneshot::channel();
    let first = {
      let executor = executor.clone();
      tokio::spawn(async move { executor.execute(toggle("u1", false, rx1)).await })
    };
    settle().await;
    let second = {
      let executor = executor.clone();
      tokio::spawn(async move { executor.execute(toggle("u1", true, rx2)).await })
    };
    settle().await;

    tx2.send(Err(CacheError::transient("timeout"))).unwrap();
    assert!(second.await.unwrap().is_err());
    assert_eq!(
      store.value(&users::detail("u1")),
      Some(json!({"id": "u1", "enabled": false}))
    );

    tx1.send(Ok(json!({"success": true}))).unwrap();
    first.await.unwrap().unwrap();
    assert_eq!(
      store.value(&users::detail("u1")),
      Some(json!({"id": "u1", "enabled": false}))
    );
  }

  #[tokio::test]
  async fn test_mutation_cancels_in_flight_fetch() {
    let (store, executor) = executor();
    let list = users::list(&UserFilter::default());
    store.set(&list, json!([{"id": "u1", "enabled": true}]));

    let (release, gate) = oneshot::channel::<()>();
    let gate = Arc::new(tokio::sync::Mutex::new(Some(gate)));
    store.register_fetcher(users::lists(), move |_| {
      let gate = Arc::clone(&gate);
      async move {
        if let Some(rx) = gate.lock().await.take() {
          let _ = rx.await;
        }
        Ok(json!([{"id": "u1", "enabled": true}]))
      }
    });
    let fetching = {
      let store = store.clone();
      let list = list.clone();
      tokio::spawn(async move { store.fetch(&list).await })
    };
    settle().await;
    assert_eq!(store.get(&list).unwrap().status, FetchStatus::Fetching);

    let (tx, rx) = oneshot::channel::<Result<Value, CacheError>>();
    let mutation = MutationDescriptor::new(users::detail("u1"), async move {
      rx.await
        .unwrap_or_else(|_| Err(CacheError::transient("commit dropped")))
    })
    .projection(set_enabled("u1", false))
    .affects(users::lists());
    let task = {
      let executor = executor.clone();
      tokio::spawn(async move { executor.execute(mutation).await })
    };
    settle().await;

    release.send(()).unwrap();
    fetching.await.unwrap().unwrap();
    assert_eq!(
      store.value(&list),
      Some(json!([{"id": "u1", "enabled": false}]))
    );

    tx.send(Err(CacheError::authentication("session expired"))).unwrap();
    assert!(task.await.unwrap().unwrap_err().is_authentication());
  }

  #[tokio::test]
  async fn test_mutation_without_projection_only_invalidates() {
    let (store, executor) = executor();
    let list = users::list(&UserFilter::default());
    store.set(&list, json!([]));

    let mutation = MutationDescriptor::new(users::lists(), async { Ok(()) })
      .emits(InvalidationEvent::new(EntityClass::User, Change::Created));
    executor.execute(mutation).await.unwrap();

    let entry = store.get(&list).unwrap();
    assert_eq!(entry.value, Some(json!([])));
    assert_eq!(entry.status, FetchStatus::Stale);
  }

  #[tokio::test]
  async fn test_unroutable_event_surfaces_in_strict_mode() {
    let (_store, executor) = executor();
    let mutation = MutationDescriptor::<Value, ()>::new(users::lists(), async { Ok(()) })
      .emits(InvalidationEvent::new(EntityClass::User, Change::Updated { id: None }));
    let err = executor.execute(mutation).await.unwrap_err();
    assert!(matches!(err, CacheError::Configuration { .. }));
  }

  #[test]
  fn test_value_commit_outcome() {
    assert_eq!(json!({"success": true}).rejection(), None);
    assert_eq!(json!({"id": "u1"}).rejection(), None);
    assert_eq!(
      json!({"success": false}).rejection(),
      Some("the server rejected the change".to_string())
    );
  }
}
