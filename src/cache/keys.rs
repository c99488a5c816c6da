//! Hierarchical cache keys.
//!
//! A key is an ordered list of segments. Keys form a prefix lattice:
//! `["users"]` is an ancestor of `["users", "list"]` and of
//! `["users", "list", {"role": "admin"}]`. Record segments are ordered maps,
//! so two records built from the same fields in any order are equal.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// One segment of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum Segment {
  Str(String),
  Int(i64),
  Bool(bool),
  Record(BTreeMap<String, Segment>),
}

impl Segment {
  /// Build a record segment from field/value pairs.
  pub fn record<K, V, I>(fields: I) -> Self
  where
    K: Into<String>,
    V: Into<Segment>,
    I: IntoIterator<Item = (K, V)>,
  {
    Segment::Record(
      fields
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

impl From<&str> for Segment {
  fn from(s: &str) -> Self {
    Segment::Str(s.to_string())
  }
}

impl From<String> for Segment {
  fn from(s: String) -> Self {
    Segment::Str(s)
  }
}

impl From<&String> for Segment {
  fn from(s: &String) -> Self {
    Segment::Str(s.clone())
  }
}

impl From<i64> for Segment {
  fn from(n: i64) -> Self {
    Segment::Int(n)
  }
}

impl From<u32> for Segment {
  fn from(n: u32) -> Self {
    Segment::Int(i64::from(n))
  }
}

impl From<bool> for Segment {
  fn from(b: bool) -> Self {
    Segment::Bool(b)
  }
}

impl From<BTreeMap<String, Segment>> for Segment {
  fn from(map: BTreeMap<String, Segment>) -> Self {
    Segment::Record(map)
  }
}

/// Identifier of a cached entity or query result set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct CacheKey(Vec<Segment>);

impl CacheKey {
  pub fn new<I, S>(segments: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<Segment>,
  {
    Self(segments.into_iter().map(Into::into).collect())
  }

  pub fn segments(&self) -> &[Segment] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Extend this key with one more segment.
  pub fn child(&self, segment: impl Into<Segment>) -> Self {
    let mut segments = self.0.clone();
    segments.push(segment.into());
    Self(segments)
  }

  /// The key with the last segment removed, if any.
  pub fn parent(&self) -> Option<Self> {
    match self.0.split_last() {
      Some((_, rest)) => Some(Self(rest.to_vec())),
      None => None,
    }
  }

  /// True if `other` starts with every segment of `self`.
  /// A key is considered an ancestor of itself.
  pub fn is_ancestor_of(&self, other: &CacheKey) -> bool {
    other.0.starts_with(&self.0)
  }

  /// Stable SHA-256 hex digest of the canonical JSON encoding.
  pub fn fingerprint(&self) -> String {
    let encoded = serde_json::to_vec(self).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    hex::encode(hasher.finalize())
  }
}

/// True iff `candidate`'s segments start with `ancestor`'s.
pub fn is_descendant(ancestor: &CacheKey, candidate: &CacheKey) -> bool {
  ancestor.is_ancestor_of(candidate)
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match serde_json::to_string(self) {
      Ok(s) => f.write_str(&s),
      Err(_) => write!(f, "{:?}", self.0),
    }
  }
}

/// Build a [`CacheKey`] from a list of segment expressions.
///
/// ```ignore
/// let k = key!("users", "list", Segment::record([("role", "admin")]));
/// ```
#[macro_export]
macro_rules! key {
  ($($segment:expr),* $(,)?) => {
    $crate::cache::CacheKey::new(
      ::std::vec![$($crate::cache::Segment::from($segment)),*]
    )
  };
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::key;

  #[test]
  fn test_key_construction_is_deterministic() {
    let a = key!("users", "list", Segment::record([("role", "admin")]));
    let b = key!("users", "list", Segment::record([("role", "admin")]));
    assert_eq!(a, b);
    assert_eq!(a.fingerprint(), b.fingerprint());
  }

  #[test]
  fn test_record_field_order_does_not_matter() {
    let a = key!(
      "users",
      Segment::record([("role", Segment::from("admin")), ("page", Segment::from(2u32))])
    );
    let b = key!(
      "users",
      Segment::record([("page", Segment::from(2u32)), ("role", Segment::from("admin"))])
    );
    assert_eq!(a, b);
    assert_eq!(a.to_string(), r#"["users",{"page":2,"role":"admin"}]"#);
  }

  #[test]
  fn test_descendants() {
    let users = key!("users");
    let lists = key!("users", "list");
    let admins = key!("users", "list", Segment::record([("role", "admin")]));
    let detail = key!("users", "detail", "u1");

    assert!(is_descendant(&users, &admins));
    assert!(is_descendant(&lists, &admins));
    assert!(is_descendant(&lists, &lists));
    assert!(!is_descendant(&lists, &detail));
    assert!(!is_descendant(&admins, &lists));
    assert!(is_descendant(&CacheKey::new(Vec::<Segment>::new()), &detail));
  }

  #[test]
  fn test_parent_and_child() {
    let detail = key!("users", "detail").child("u1");
    assert_eq!(detail, key!("users", "detail", "u1"));
    assert_eq!(detail.parent(), Some(key!("users", "detail")));
    assert_eq!(CacheKey::new(Vec::<Segment>::new()).parent(), None);
  }

  #[test]
  fn test_string_and_int_segments_differ() {
    assert_ne!(key!("users", "1"), key!("users", 1i64));
  }
}
