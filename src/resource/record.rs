//! Schemaless record used when the entity shape is only known at runtime.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::traits::Entity;
use crate::query::Filters;

/// A JSON object with an `id` field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Map<String, Value>);

impl Record {
  pub fn get(&self, field: &str) -> Option<&Value> {
    self.0.get(field)
  }

  /// Whether every filter field equals the record's field.
  pub fn matches(&self, filters: &Filters) -> bool {
    matches_filters(&self.0, filters)
  }
}

impl Entity for Record {
  fn id(&self) -> String {
    match self.0.get("id") {
      Some(Value::String(id)) => id.clone(),
      Some(Value::Null) | None => String::new(),
      Some(other) => other.to_string(),
    }
  }
}

pub(crate) fn matches_filters(object: &Map<String, Value>, filters: &Filters) -> bool {
  filters
    .iter()
    .all(|(field, expected)| object.get(field) == Some(expected))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn record(value: Value) -> Record {
    serde_json::from_value(value).unwrap()
  }

  #[test]
  fn test_id_from_string_or_number() {
    assert_eq!(record(json!({"id": "t1"})).id(), "t1");
    assert_eq!(record(json!({"id": 7})).id(), "7");
    assert_eq!(record(json!({"name": "Tank"})).id(), "");
  }

  #[test]
  fn test_filters_match_on_equality() {
    let tank = record(json!({"id": "t1", "fuel": "diesel", "active": true}));
    assert!(tank.matches(&Filters::new()));
    assert!(tank.matches(&Filters::new().with("fuel", "diesel").with("active", true)));
    assert!(!tank.matches(&Filters::new().with("fuel", "petrol")));
    assert!(!tank.matches(&Filters::new().with("missing", "x")));
  }
}
