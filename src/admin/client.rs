use color_eyre::{eyre::eyre, Result};
use reqwest::{redirect, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use crate::admin::types::{
  ActionResponse, Categorization, Configuration, NewUser, User, UserFilter,
};
use crate::cache::CacheError;
use crate::config::Config;

/// Admin API client
#[derive(Clone)]
pub struct AdminClient {
  http: reqwest::Client,
  base: Url,
  token: String,
}

impl AdminClient {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token()?;
    Self::with_token(config.api.url.clone(), token, config.api.timeout())
  }

  pub fn with_token(base: Url, token: String, timeout: Duration) -> Result<Self> {
    if base.cannot_be_a_base() {
      return Err(eyre!("Admin API URL cannot be used as a base: {}", base));
    }

    // Redirects are never followed: the server answers an expired session
    // with a redirect to its login page.
    let http = reqwest::Client::builder()
      .redirect(redirect::Policy::none())
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base, token })
  }

  fn endpoint(&self, segments: &[&str]) -> Url {
    let mut url = self.base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().push("api").extend(segments);
    }
    url
  }

  async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, CacheError> {
    let response = request
      .bearer_auth(&self.token)
      .send()
      .await
      .map_err(transport_error)?;

    let status = response.status();
    if status.is_redirection() {
      return Err(CacheError::authentication("session expired (redirected to login)"));
    }
    if !status.is_success() {
      let message = error_message(response).await;
      return Err(CacheError::from_status(status.as_u16(), message));
    }

    response
      .json::<T>()
      .await
      .map_err(|e| CacheError::validation(format!("unexpected response body: {e}")))
  }

  /// List users matching `filter`
  pub async fn list_users(&self, filter: &UserFilter) -> Result<Vec<User>, CacheError> {
    let request = self
      .http
      .get(self.endpoint(&["users"]))
      .query(&filter.query_pairs());
    self.send(request).await
  }

  /// Get a single user by id
  pub async fn get_user(&self, id: &str) -> Result<User, CacheError> {
    self.send(self.http.get(self.endpoint(&["users", id]))).await
  }

  pub async fn create_user(&self, user: &NewUser) -> Result<ActionResponse, CacheError> {
    self
      .send(self.http.post(self.endpoint(&["users"])).json(user))
      .await
  }

  /// Enable or disable a user account
  pub async fn set_user_enabled(&self, id: &str, enabled: bool) -> Result<ActionResponse, CacheError> {
    let body = serde_json::json!({ "enabled": enabled });
    self
      .send(self.http.patch(self.endpoint(&["users", id])).json(&body))
      .await
  }

  pub async fn delete_user(&self, id: &str) -> Result<ActionResponse, CacheError> {
    self
      .send(self.http.delete(self.endpoint(&["users", id])))
      .await
  }

  /// One page of uploaded categorization files, newest first
  pub async fn list_categorizations(&self, page: u32) -> Result<Vec<Categorization>, CacheError> {
    let request = self
      .http
      .get(self.endpoint(&["categorizations"]))
      .query(&[("page", page)]);
    self.send(request).await
  }

  pub async fn get_categorization(&self, id: &str) -> Result<Categorization, CacheError> {
    self
      .send(self.http.get(self.endpoint(&["categorizations", id])))
      .await
  }

  pub async fn delete_categorization(&self, id: &str) -> Result<ActionResponse, CacheError> {
    self
      .send(self.http.delete(self.endpoint(&["categorizations", id])))
      .await
  }

  pub async fn get_configuration(&self) -> Result<Configuration, CacheError> {
    self
      .send(self.http.get(self.endpoint(&["configuration"])))
      .await
  }

  pub async fn update_configuration(
    &self,
    configuration: &Configuration,
  ) -> Result<ActionResponse, CacheError> {
    self
      .send(self.http.put(self.endpoint(&["configuration"])).json(configuration))
      .await
  }
}

fn transport_error(err: reqwest::Error) -> CacheError {
  match err.status() {
    Some(status) => CacheError::from_status(status.as_u16(), err.to_string()),
    None => CacheError::transient(err.to_string()),
  }
}

/// Best-effort error message: the JSON `message` field, else the raw body.
async fn error_message(response: Response) -> String {
  let status = response.status();
  let body = response.text().await.unwrap_or_default();
  serde_json::from_str::<serde_json::Value>(&body)
    .ok()
    .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
    .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
    .unwrap_or_else(|| status.to_string())
}
