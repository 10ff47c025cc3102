//! Core traits and types for resource services.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::query::Filters;

/// Trait for records that can be cached per resource.
///
/// Implementors must provide an identifier usable as a string key.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity (e.g., tank id, employee id)
  fn id(&self) -> String;
}

/// The operations a service supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operations {
  pub list: bool,
  pub get: bool,
  pub create: bool,
  pub update: bool,
  pub delete: bool,
  pub summary: bool,
}

impl Operations {
  /// Full CRUD without a summary.
  pub const CRUD: Self = Self {
    list: true,
    get: true,
    create: true,
    update: true,
    delete: true,
    summary: false,
  };

  /// Reads only, as served by views without write access.
  pub const READ_ONLY: Self = Self {
    list: true,
    get: true,
    create: false,
    update: false,
    delete: false,
    summary: false,
  };

  pub const fn with_summary(self) -> Self {
    Self {
      summary: true,
      ..self
    }
  }

  /// Names of the required operations that are not supported.
  pub fn missing_required(&self) -> Vec<&'static str> {
    [
      ("get_list", self.list),
      ("get_by_id", self.get),
      ("create", self.create),
      ("update", self.update),
      ("delete", self.delete),
    ]
    .into_iter()
    .filter(|(_, supported)| !supported)
    .map(|(name, _)| name)
    .collect()
  }
}

impl Default for Operations {
  fn default() -> Self {
    Self::CRUD
  }
}

/// Aggregate figures for a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
  pub count: u64,
}

/// Data-access contract for one resource.
///
/// Every method fails with an error rather than returning an error-shaped
/// value; callers never inspect bodies for embedded errors.
#[async_trait]
pub trait ResourceService: Send + Sync + 'static {
  type Entity: Entity;
  type Create: Clone + Send + Sync + 'static;
  type Update: Clone + Send + Sync + 'static;
  type Summary: Clone + Send + Sync + Serialize + DeserializeOwned + 'static;

  /// Supported operations. Defaults to full CRUD without a summary.
  fn operations(&self) -> Operations {
    Operations::CRUD
  }

  async fn get_list(&self, filters: Option<&Filters>) -> Result<Vec<Self::Entity>>;

  async fn get_by_id(&self, id: &str) -> Result<Self::Entity>;

  async fn create(&self, data: Self::Create) -> Result<Self::Entity>;

  async fn update(&self, id: &str, data: Self::Update) -> Result<Self::Entity>;

  async fn delete(&self, id: &str) -> Result<()>;

  /// Only called when `operations().summary` is set.
  async fn get_summary(&self) -> Result<Self::Summary> {
    Err(eyre!("Summary is not supported by this service"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_crud_has_no_missing_operations() {
    assert!(Operations::CRUD.missing_required().is_empty());
    assert!(Operations::CRUD.with_summary().summary);
  }

  #[test]
  fn test_read_only_is_missing_writes() {
    assert_eq!(
      Operations::READ_ONLY.missing_required(),
      vec!["create", "update", "delete"]
    );
  }
}
