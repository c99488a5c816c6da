//! Domain types for the admin console's remote data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::cache::{CommitOutcome, Segment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Admin,
  User,
}

impl Role {
  pub fn as_str(&self) -> &'static str {
    match self {
      Role::Admin => "admin",
      Role::User => "user",
    }
  }

  pub fn from_name(name: &str) -> Option<Self> {
    match name {
      "admin" => Some(Role::Admin),
      "user" => Some(Role::User),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
  pub id: String,
  pub name: String,
  pub email: String,
  pub role: Role,
  pub enabled: bool,
}

/// Payload for creating a user.
#[derive(Debug, Clone, Serialize)]
pub struct NewUser {
  pub name: String,
  pub email: String,
  pub role: Role,
  pub password: String,
}

/// Filters of the user list screen.
///
/// Unset fields are left out of the cache key, so a filter with only
/// `role` set addresses the same entry however it was built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFilter {
  pub role: Option<Role>,
  pub enabled: Option<bool>,
  pub search: Option<String>,
  pub page: Option<u32>,
}

impl UserFilter {
  pub fn role(role: Role) -> Self {
    Self {
      role: Some(role),
      ..Self::default()
    }
  }

  /// Whether `user` belongs in a list fetched with this filter.
  pub fn matches(&self, user: &User) -> bool {
    if self.role.is_some_and(|r| r != user.role) {
      return false;
    }
    if self.enabled.is_some_and(|e| e != user.enabled) {
      return false;
    }
    match self.search.as_deref().map(str::trim) {
      Some(q) if !q.is_empty() => {
        let q = q.to_lowercase();
        user.name.to_lowercase().contains(&q) || user.email.to_lowercase().contains(&q)
      }
      _ => true,
    }
  }

  pub fn to_segment(&self) -> Segment {
    let mut fields = BTreeMap::new();
    if let Some(role) = self.role {
      fields.insert("role".to_string(), Segment::from(role.as_str()));
    }
    if let Some(enabled) = self.enabled {
      fields.insert("enabled".to_string(), Segment::from(enabled));
    }
    if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
      fields.insert("search".to_string(), Segment::from(search.to_lowercase()));
    }
    if let Some(page) = self.page {
      fields.insert("page".to_string(), Segment::from(page));
    }
    Segment::Record(fields)
  }

  /// Inverse of [`to_segment`](Self::to_segment). `None` for segments no
  /// filter produces.
  pub fn from_segment(segment: &Segment) -> Option<Self> {
    let Segment::Record(fields) = segment else {
      return None;
    };
    let mut filter = Self::default();
    for (name, value) in fields {
      match (name.as_str(), value) {
        ("role", Segment::Str(role)) => filter.role = Some(Role::from_name(role)?),
        ("enabled", Segment::Bool(enabled)) => filter.enabled = Some(*enabled),
        ("search", Segment::Str(search)) => filter.search = Some(search.clone()),
        ("page", Segment::Int(page)) => filter.page = Some(u32::try_from(*page).ok()?),
        _ => return None,
      }
    }
    Some(filter)
  }

  /// Query string pairs for the remote list endpoint.
  pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
    let mut pairs = Vec::new();
    if let Some(role) = self.role {
      pairs.push(("role", role.as_str().to_string()));
    }
    if let Some(enabled) = self.enabled {
      pairs.push(("enabled", enabled.to_string()));
    }
    if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
      pairs.push(("q", search.to_string()));
    }
    if let Some(page) = self.page {
      pairs.push(("page", page.to_string()));
    }
    pairs
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategorizationStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

/// An uploaded product file sent through the classification API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Categorization {
  pub id: String,
  pub file_name: String,
  pub status: CategorizationStatus,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub total_products: u64,
}

/// Settings edited on the configuration screen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
  #[serde(flatten)]
  pub settings: BTreeMap<String, Value>,
}

/// Result envelope of the server's write actions.
///
/// A 200 response may still carry `success: false` when the server
/// rejected the write on business grounds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
  pub success: bool,
  #[serde(default)]
  pub message: Option<String>,
}

impl CommitOutcome for ActionResponse {
  fn rejection(&self) -> Option<String> {
    if self.success {
      None
    } else {
      Some(
        self
          .message
          .clone()
          .unwrap_or_else(|| "the server rejected the change".to_string()),
      )
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn user(role: Role, enabled: bool) -> User {
    User {
      id: "u1".into(),
      name: "Lucía Pérez".into(),
      email: "lucia@example.com".into(),
      role,
      enabled,
    }
  }

  #[test]
  fn test_filter_segment_omits_unset_fields() {
    let a = UserFilter::role(Role::Admin);
    let b = UserFilter {
      role: Some(Role::Admin),
      search: Some("   ".into()),
      ..UserFilter::default()
    };
    assert_eq!(a.to_segment(), b.to_segment());
    assert_eq!(UserFilter::default().to_segment(), Segment::Record(BTreeMap::new()));
  }

  #[test]
  fn test_filter_recovered_from_segment() {
    let filter = UserFilter {
      role: Some(Role::User),
      enabled: Some(false),
      search: Some("Ana".into()),
      page: Some(3),
    };
    let recovered = UserFilter::from_segment(&filter.to_segment()).unwrap();
    assert_eq!(recovered.role, Some(Role::User));
    assert_eq!(recovered.enabled, Some(false));
    assert_eq!(recovered.search.as_deref(), Some("ana"));
    assert_eq!(recovered.page, Some(3));

    assert_eq!(UserFilter::from_segment(&Segment::from("list")), None);
    assert_eq!(
      UserFilter::from_segment(&Segment::record([("role", "root")])),
      None
    );
  }

  #[test]
  fn test_filter_matches() {
    let admin = user(Role::Admin, true);
    assert!(UserFilter::default().matches(&admin));
    assert!(UserFilter::role(Role::Admin).matches(&admin));
    assert!(!UserFilter::role(Role::User).matches(&admin));
    let search = UserFilter {
      search: Some("LUCÍA".into()),
      ..UserFilter::default()
    };
    assert!(search.matches(&admin));
    let disabled = UserFilter {
      enabled: Some(false),
      ..UserFilter::default()
    };
    assert!(!disabled.matches(&admin));
  }

  #[test]
  fn test_action_response_rejection() {
    let ok: ActionResponse = serde_json::from_str(r#"{"success": true}"#).unwrap();
    assert_eq!(ok.rejection(), None);
    let rejected: ActionResponse =
      serde_json::from_str(r#"{"success": false, "message": "Email already in use"}"#).unwrap();
    assert_eq!(rejected.rejection(), Some("Email already in use".to_string()));
  }

  #[test]
  fn test_configuration_flattens_settings() {
    let config: Configuration =
      serde_json::from_str(r#"{"defaultLanguage": "es", "batchSize": 200}"#).unwrap();
    assert_eq!(config.settings.get("batchSize"), Some(&Value::from(200)));
  }
}
