//! Cache key factories for the admin console's entities.
//!
//! Lists live under `[<entity>, "list", <filter>]` and single entities under
//! `[<entity>, "detail", <id>]`, so invalidating the `list` branch never
//! touches cached details and vice versa.

pub mod users {
  use crate::admin::types::UserFilter;
  use crate::cache::CacheKey;
  use crate::key;

  pub fn all() -> CacheKey {
    key!("users")
  }

  pub fn lists() -> CacheKey {
    key!("users", "list")
  }

  pub fn list(filter: &UserFilter) -> CacheKey {
    lists().child(filter.to_segment())
  }

  pub fn details() -> CacheKey {
    key!("users", "detail")
  }

  pub fn detail(id: &str) -> CacheKey {
    details().child(id)
  }
}

pub mod categorizations {
  use crate::cache::CacheKey;
  use crate::key;

  pub fn all() -> CacheKey {
    key!("categorizations")
  }

  pub fn lists() -> CacheKey {
    key!("categorizations", "list")
  }

  pub fn list(page: u32) -> CacheKey {
    lists().child(page)
  }

  pub fn details() -> CacheKey {
    key!("categorizations", "detail")
  }

  pub fn detail(id: &str) -> CacheKey {
    details().child(id)
  }
}

pub mod configuration {
  use crate::cache::CacheKey;
  use crate::key;

  pub fn current() -> CacheKey {
    key!("configuration")
  }
}
