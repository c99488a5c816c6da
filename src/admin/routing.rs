//! Which cached queries each admin change makes stale.
//!
//! Every entity class and change kind is matched explicitly. Combinations
//! that make no sense for a class are configuration errors.

use crate::admin::keys::{categorizations, configuration, users};
use crate::cache::{CacheError, CacheKey, Change, EntityClass, InvalidationEvent};

fn unmapped(event: &InvalidationEvent) -> CacheError {
  CacheError::configuration(format!(
    "no invalidation mapping for {:?} on {:?}",
    event.change, event.class
  ))
}

/// Ancestor keys that must be invalidated after `event`.
pub fn route(event: &InvalidationEvent) -> Result<Vec<CacheKey>, CacheError> {
  use Change::*;
  use EntityClass::*;

  let keys = match (&event.class, &event.change) {
    (User, Created) => vec![users::lists()],
    (User, Updated { id: Some(id) })
    | (User, EnabledChanged { id, .. })
    | (User, Deleted { id }) => vec![users::lists(), users::detail(id)],
    (User, Updated { id: None }) => return Err(unmapped(event)),
    (User, Bulk) => vec![users::all()],

    (Categorization, Created) => vec![categorizations::lists()],
    (Categorization, Updated { id: Some(id) }) | (Categorization, Deleted { id }) => {
      vec![categorizations::lists(), categorizations::detail(id)]
    }
    (Categorization, Updated { id: None }) | (Categorization, EnabledChanged { .. }) => {
      return Err(unmapped(event))
    }
    (Categorization, Bulk) => vec![categorizations::all()],

    (Configuration, Updated { id: None }) | (Configuration, Bulk) => {
      vec![configuration::current()]
    }
    (Configuration, Created)
    | (Configuration, Updated { id: Some(_) })
    | (Configuration, EnabledChanged { .. })
    | (Configuration, Deleted { .. }) => return Err(unmapped(event)),
  };
  Ok(keys)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::admin::types::{Role, UserFilter};
  use crate::cache::{CacheStore, FetchStatus, InvalidationRouter};
  use serde_json::json;

  #[test]
  fn test_user_events() {
    let keys = route(&InvalidationEvent::new(
      EntityClass::User,
      Change::EnabledChanged {
        id: "u1".into(),
        enabled: false,
      },
    ))
    .unwrap();
    assert_eq!(keys, vec![users::lists(), users::detail("u1")]);

    let keys = route(&InvalidationEvent::new(EntityClass::User, Change::Created)).unwrap();
    assert_eq!(keys, vec![users::lists()]);

    let keys = route(&InvalidationEvent::new(EntityClass::User, Change::Bulk)).unwrap();
    assert_eq!(keys, vec![users::all()]);
  }

  #[test]
  fn test_nonsense_events_are_configuration_errors() {
    for change in [
      Change::Created,
      Change::Deleted { id: "x".into() },
      Change::Updated {
        id: Some("x".into()),
      },
    ] {
      let err = route(&InvalidationEvent::new(EntityClass::Configuration, change)).unwrap_err();
      assert!(matches!(err, CacheError::Configuration { .. }));
    }
    assert!(route(&InvalidationEvent::new(
      EntityClass::Categorization,
      Change::EnabledChanged {
        id: "c1".into(),
        enabled: true
      }
    ))
    .is_err());
  }

  #[test]
  fn test_user_deletion_marks_lists_and_its_detail() {
    let store: CacheStore = CacheStore::new();
    let admins = users::list(&UserFilter::role(Role::Admin));
    store.set(&admins, json!([]));
    store.set(&users::detail("u1"), json!({}));
    store.set(&users::detail("u2"), json!({}));
    store.set(&configuration::current(), json!({}));

    let router = InvalidationRouter::new(store.clone(), route).strict(true);
    router
      .dispatch(&InvalidationEvent::new(
        EntityClass::User,
        Change::Deleted { id: "u1".into() },
      ))
      .unwrap();

    assert_eq!(store.get(&admins).unwrap().status, FetchStatus::Stale);
    assert_eq!(store.get(&users::detail("u1")).unwrap().status, FetchStatus::Stale);
    assert_eq!(store.get(&users::detail("u2")).unwrap().status, FetchStatus::Success);
    assert_eq!(
      store.get(&configuration::current()).unwrap().status,
      FetchStatus::Success
    );
  }
}
