//! Cache keys for resource queries.
//!
//! Keys are ordered segment lists such as `[tanks, list, {"status":"active"}]`
//! or `[tanks, detail, t1]`. Filters are canonicalized into sorted JSON, so two
//! filter objects built in a different insertion order map to the same key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

const LIST: &str = "list";
const DETAIL: &str = "detail";
const SUMMARY: &str = "summary";

/// Flat key/value filters narrowing a list query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filters(BTreeMap<String, Value>);

impl Filters {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style insert.
  pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.insert(field, value);
    self
  }

  pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
    self.0.insert(field.into(), value.into());
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.0.get(field)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.0.iter()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Canonical JSON text: object keys sorted at every depth.
  fn canonical(&self) -> String {
    let object: Map<String, Value> = self
      .0
      .iter()
      .map(|(k, v)| (k.clone(), canonical_value(v)))
      .collect();
    Value::Object(object).to_string()
  }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Filters {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self(
      iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

/// Rebuild nested objects in sorted key order, regardless of how the JSON map
/// type orders its entries.
fn canonical_value(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let sorted: BTreeMap<&String, Value> =
        map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
      Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
    }
    Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
    other => other.clone(),
  }
}

/// One segment of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeySegment {
  /// Resource name, scope ("list", "detail", "summary") or entity id
  Name(String),
  /// Canonical JSON of a filter object
  Filters(String),
}

impl fmt::Display for KeySegment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeySegment::Name(name) => f.write_str(name),
      KeySegment::Filters(json) => f.write_str(json),
    }
  }
}

/// Structurally comparable cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
  pub fn new(segments: Vec<KeySegment>) -> Self {
    Self(segments)
  }

  pub fn segments(&self) -> &[KeySegment] {
    &self.0
  }

  /// The resource this key belongs to, if it has one.
  pub fn resource(&self) -> Option<&str> {
    match self.0.first() {
      Some(KeySegment::Name(name)) => Some(name),
      _ => None,
    }
  }

  /// Whether `prefix` matches the leading segments of this key.
  /// Every key starts with itself.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// SHA256 of the display form, for compact and stable log fields.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, segment) in self.0.iter().enumerate() {
      if i > 0 {
        f.write_str("/")?;
      }
      write!(f, "{}", segment)?;
    }
    Ok(())
  }
}

fn name(s: &str) -> KeySegment {
  KeySegment::Name(s.to_string())
}

/// Prefix matching every key of a resource.
pub fn resource_key(resource: &str) -> QueryKey {
  QueryKey(vec![name(resource)])
}

/// Key for one filtered list of a resource. No filters and empty filters
/// produce the same key.
pub fn list_key(resource: &str, filters: Option<&Filters>) -> QueryKey {
  let canonical = filters
    .map(Filters::canonical)
    .unwrap_or_else(|| Filters::new().canonical());
  QueryKey(vec![name(resource), name(LIST), KeySegment::Filters(canonical)])
}

/// Prefix matching every list variant of a resource.
pub fn lists_key(resource: &str) -> QueryKey {
  QueryKey(vec![name(resource), name(LIST)])
}

pub fn detail_key(resource: &str, id: &str) -> QueryKey {
  QueryKey(vec![name(resource), name(DETAIL), name(id)])
}

pub fn summary_key(resource: &str) -> QueryKey {
  QueryKey(vec![name(resource), name(SUMMARY)])
}
