//! Cached admin data service.
//!
//! Reads are cache-first: a fresh entry is returned directly, otherwise the
//! value is fetched (with retries) and cached. When the remote side is
//! unreachable a previously cached value is served instead. Writes go
//! through the mutation executor with optimistic projections.

use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use tracing::{info, warn};

use crate::admin::client::AdminClient;
use crate::admin::keys::{categorizations, configuration, users};
use crate::admin::types::{
  ActionResponse, Categorization, Configuration, NewUser, User, UserFilter,
};
use crate::admin::routing::route;
use crate::cache::{
  CacheError, CacheKey, CacheStore, Change, EntityClass, InvalidationEvent, InvalidationRouter,
  MutationDescriptor, MutationExecutor, Segment,
};
use crate::config::{CacheConfig, Config};

fn encode<T: Serialize>(value: &T) -> Result<Value, CacheError> {
  serde_json::to_value(value)
    .map_err(|e| CacheError::validation(format!("failed to encode cached value: {e}")))
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, CacheError> {
  serde_json::from_value(value)
    .map_err(|e| CacheError::validation(format!("cached value has unexpected shape: {e}")))
}

/// Set `enabled` on the user `id`, whether `value` is a user list or a
/// single user. `None` if the user is not there.
pub fn project_user_enabled(value: &Value, id: &str, enabled: bool) -> Option<Value> {
  match value {
    Value::Array(items) => {
      let pos = items.iter().position(|u| u.get("id").and_then(Value::as_str) == Some(id))?;
      let mut items = items.clone();
      items[pos]
        .as_object_mut()?
        .insert("enabled".to_string(), Value::Bool(enabled));
      Some(Value::Array(items))
    }
    Value::Object(fields) if fields.get("id").and_then(Value::as_str) == Some(id) => {
      let mut fields = fields.clone();
      fields.insert("enabled".to_string(), Value::Bool(enabled));
      Some(Value::Object(fields))
    }
    _ => None,
  }
}

/// Drop the item `id` from a list. `None` if it is not listed.
pub fn project_removed(value: &Value, id: &str) -> Option<Value> {
  let items = value.as_array()?;
  let pos = items
    .iter()
    .position(|item| item.get("id").and_then(Value::as_str) == Some(id))?;
  let mut items = items.clone();
  items.remove(pos);
  Some(Value::Array(items))
}

/// Optimistic enable/disable of a user account.
pub fn user_enabled_mutation<F>(
  id: &str,
  enabled: bool,
  commit: F,
) -> MutationDescriptor<Value, ActionResponse>
where
  F: Future<Output = Result<ActionResponse, CacheError>> + Send + 'static,
{
  let user_id = id.to_string();
  MutationDescriptor::new(users::detail(id), commit)
    .projection(move |value| project_user_enabled(value, &user_id, enabled))
    .affects(users::lists())
    .emits(InvalidationEvent::new(
      EntityClass::User,
      Change::EnabledChanged {
        id: id.to_string(),
        enabled,
      },
    ))
}

/// Optimistic removal of a user from every cached list.
pub fn delete_user_mutation<F>(id: &str, commit: F) -> MutationDescriptor<Value, ActionResponse>
where
  F: Future<Output = Result<ActionResponse, CacheError>> + Send + 'static,
{
  let user_id = id.to_string();
  MutationDescriptor::new(users::detail(id), commit)
    .projection(move |value| project_removed(value, &user_id))
    .affects(users::lists())
    .emits(InvalidationEvent::new(
      EntityClass::User,
      Change::Deleted { id: id.to_string() },
    ))
}

/// Optimistic removal of a categorization upload from every cached page.
pub fn delete_categorization_mutation<F>(
  id: &str,
  commit: F,
) -> MutationDescriptor<Value, ActionResponse>
where
  F: Future<Output = Result<ActionResponse, CacheError>> + Send + 'static,
{
  let categorization_id = id.to_string();
  MutationDescriptor::new(categorizations::detail(id), commit)
    .projection(move |value| project_removed(value, &categorization_id))
    .affects(categorizations::lists())
    .emits(InvalidationEvent::new(
      EntityClass::Categorization,
      Change::Deleted { id: id.to_string() },
    ))
}

/// Last segment of a key addressing a single query beneath a branch
/// (`[<entity>, "list" | "detail", <leaf>]`).
fn leaf(key: &CacheKey) -> Result<&Segment, CacheError> {
  match key.segments() {
    [_, _, leaf] => Ok(leaf),
    _ => Err(CacheError::configuration(format!("no remote query for {key}"))),
  }
}

fn leaf_id(key: &CacheKey) -> Result<&str, CacheError> {
  match leaf(key)? {
    Segment::Str(id) => Ok(id.as_str()),
    _ => Err(CacheError::configuration(format!("no entity id in {key}"))),
  }
}

/// Admin data access with transparent caching.
#[derive(Clone)]
pub struct AdminService {
  client: AdminClient,
  store: CacheStore,
  executor: MutationExecutor,
  stale_time: chrono::Duration,
}

impl AdminService {
  /// Create a service with a fresh cache from the loaded configuration.
  pub fn from_config(config: &Config) -> Result<Self> {
    let client = AdminClient::new(config)?;
    Ok(Self::new(client, &config.cache))
  }

  pub fn new(client: AdminClient, cache: &CacheConfig) -> Self {
    let store = CacheStore::with_retry_policy(cache.retry);
    let router = InvalidationRouter::new(store.clone(), route).strict(cache.strict_routing());
    let executor = MutationExecutor::new(store.clone(), router);
    register_fetchers(&store, &client);
    Self {
      client,
      store,
      executor,
      stale_time: cache.stale_time(),
    }
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  /// Cache-first read of `key`. A transient failure serves the cached value
  /// when there is one; any other failure reaches the caller.
  async fn query<T: DeserializeOwned>(&self, key: CacheKey) -> Result<T, CacheError> {
    if let Some(entry) = self.store.get(&key) {
      if entry.is_fresh(self.stale_time) {
        if let Some(value) = entry.value {
          return decode(value);
        }
      }
    }

    match self.store.fetch(&key).await {
      Ok(value) => decode(value),
      Err(err) if err.is_transient() => match self.store.value(&key) {
        Some(cached) => {
          warn!(key = %key, error = %err, "serving cached value, remote unavailable");
          decode(cached)
        }
        None => Err(err),
      },
      Err(err) => Err(err),
    }
  }

  pub async fn users(&self, filter: &UserFilter) -> Result<Vec<User>, CacheError> {
    self.query(users::list(filter)).await
  }

  pub async fn user(&self, id: &str) -> Result<User, CacheError> {
    self.query(users::detail(id)).await
  }

  pub async fn categorizations(&self, page: u32) -> Result<Vec<Categorization>, CacheError> {
    self.query(categorizations::list(page)).await
  }

  pub async fn categorization(&self, id: &str) -> Result<Categorization, CacheError> {
    self.query(categorizations::detail(id)).await
  }

  pub async fn configuration(&self) -> Result<Configuration, CacheError> {
    self.query(configuration::current()).await
  }

  /// Enable or disable a user (optimistic).
  pub async fn set_user_enabled(&self, id: &str, enabled: bool) -> Result<ActionResponse, CacheError> {
    let client = self.client.clone();
    let user_id = id.to_string();
    let mutation = user_enabled_mutation(id, enabled, async move {
      client.set_user_enabled(&user_id, enabled).await
    });
    let response = self.executor.execute(mutation).await?;
    info!(user = id, enabled, "user status updated");
    Ok(response)
  }

  /// Delete a user (optimistic). The user's detail entry is evicted once
  /// the server confirms.
  pub async fn delete_user(&self, id: &str) -> Result<ActionResponse, CacheError> {
    let client = self.client.clone();
    let user_id = id.to_string();
    let mutation = delete_user_mutation(id, async move { client.delete_user(&user_id).await });
    let response = self.executor.execute(mutation).await?;
    self.store.remove(&users::detail(id));
    info!(user = id, "user deleted");
    Ok(response)
  }

  /// Create a user. Not optimistic: the server assigns the id.
  pub async fn create_user(&self, user: NewUser) -> Result<ActionResponse, CacheError> {
    let client = self.client.clone();
    let email = user.email.clone();
    let mutation = MutationDescriptor::new(users::lists(), async move {
      client.create_user(&user).await
    })
    .emits(InvalidationEvent::new(EntityClass::User, Change::Created));
    let response = self.executor.execute(mutation).await?;
    info!(email = %email, "user created");
    Ok(response)
  }

  pub async fn delete_categorization(&self, id: &str) -> Result<ActionResponse, CacheError> {
    let client = self.client.clone();
    let categorization_id = id.to_string();
    let mutation = delete_categorization_mutation(id, async move {
      client.delete_categorization(&categorization_id).await
    });
    let response = self.executor.execute(mutation).await?;
    self.store.remove(&categorizations::detail(id));
    info!(categorization = id, "categorization deleted");
    Ok(response)
  }

  /// Replace the configuration (optimistic).
  pub async fn update_configuration(
    &self,
    settings: Configuration,
  ) -> Result<ActionResponse, CacheError> {
    let projected = encode(&settings)?;
    let client = self.client.clone();
    let mutation = MutationDescriptor::new(configuration::current(), async move {
      client.update_configuration(&settings).await
    })
    .projection(move |current| (current != &projected).then(|| projected.clone()))
    .emits(InvalidationEvent::new(
      EntityClass::Configuration,
      Change::Updated { id: None },
    ));
    let response = self.executor.execute(mutation).await?;
    info!("configuration updated");
    Ok(response)
  }
}

/// One loader per key branch. Each rebuilds its request from the key, so
/// the registry stays the same size however many filters or pages are read.
fn register_fetchers(store: &CacheStore, client: &AdminClient) {
  let c = client.clone();
  store.register_fetcher(users::lists(), move |key| {
    let client = c.clone();
    async move {
      let filter = UserFilter::from_segment(leaf(&key)?)
        .ok_or_else(|| CacheError::configuration(format!("no user filter in {key}")))?;
      encode(&client.list_users(&filter).await?)
    }
  });

  let c = client.clone();
  store.register_fetcher(users::details(), move |key| {
    let client = c.clone();
    async move { encode(&client.get_user(leaf_id(&key)?).await?) }
  });

  let c = client.clone();
  store.register_fetcher(categorizations::lists(), move |key| {
    let client = c.clone();
    async move {
      let page = match leaf(&key)? {
        Segment::Int(page) => u32::try_from(*page).ok(),
        _ => None,
      }
      .ok_or_else(|| CacheError::configuration(format!("no page number in {key}")))?;
      encode(&client.list_categorizations(page).await?)
    }
  });

  let c = client.clone();
  store.register_fetcher(categorizations::details(), move |key| {
    let client = c.clone();
    async move { encode(&client.get_categorization(leaf_id(&key)?).await?) }
  });

  let c = client.clone();
  store.register_fetcher(configuration::current(), move |key| {
    let client = c.clone();
    async move {
      if key != configuration::current() {
        return Err(CacheError::configuration(format!("no remote query for {key}")));
      }
      encode(&client.get_configuration().await?)
    }
  });
}
