//! Local SQLite backend.
//!
//! Records of every resource live in one table as JSON blobs. Used offline,
//! in development, and as the default backend of the CLI.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::query::Filters;
use crate::resource::{matches_filters, Entity, Operations, ResourceService, ResourceSummary};

/// Schema for record storage.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    resource TEXT NOT NULL,
    id TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (resource, id)
);

CREATE INDEX IF NOT EXISTS idx_records_resource ON records(resource);
"#;

/// SQLite database shared by all resources.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the database at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  /// Private database that disappears with the store.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("station-query").join("station.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// One resource backed by a [`SqliteStore`].
///
/// Ids are assigned on create as increasing integers (stored as text).
/// Updates merge the patch object into the stored record; `null` values
/// remove fields.
pub struct SqliteService<T> {
  store: Arc<SqliteStore>,
  resource: String,
  _entity: PhantomData<fn() -> T>,
}

impl<T> SqliteService<T> {
  pub fn new(store: Arc<SqliteStore>, resource: impl Into<String>) -> Self {
    Self {
      store,
      resource: resource.into(),
      _entity: PhantomData,
    }
  }

  fn load(&self, conn: &Connection, id: &str) -> Result<Map<String, Value>> {
    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM records WHERE resource = ? AND id = ?",
        params![self.resource, id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} {}: {}", self.resource, id, e))?;

    let data = data.ok_or_else(|| eyre!("{} {} not found", self.resource, id))?;
    parse_object(&data)
  }

  fn store(&self, conn: &Connection, id: &str, object: &Map<String, Value>) -> Result<()> {
    let data =
      serde_json::to_vec(object).map_err(|e| eyre!("Failed to serialize record: {}", e))?;
    conn
      .execute(
        "INSERT OR REPLACE INTO records (resource, id, data, updated_at) VALUES (?, ?, ?, ?)",
        params![self.resource, id, data, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to store {} {}: {}", self.resource, id, e))?;
    Ok(())
  }
}

fn parse_object(data: &[u8]) -> Result<Map<String, Value>> {
  match serde_json::from_slice(data) {
    Ok(Value::Object(object)) => Ok(object),
    Ok(_) => Err(eyre!("Stored record is not an object")),
    Err(e) => Err(eyre!("Failed to parse stored record: {}", e)),
  }
}

fn into_entity<T: Entity>(object: Map<String, Value>) -> Result<T> {
  serde_json::from_value(Value::Object(object)).map_err(|e| eyre!("Failed to decode record: {}", e))
}

fn expect_object(value: Value, what: &str) -> Result<Map<String, Value>> {
  match value {
    Value::Object(object) => Ok(object),
    other => Err(eyre!("{} must be a JSON object, got {}", what, other)),
  }
}

#[async_trait]
impl<T: Entity> ResourceService for SqliteService<T> {
  type Entity = T;
  type Create = Value;
  type Update = Value;
  type Summary = ResourceSummary;

  fn operations(&self) -> Operations {
    Operations::CRUD.with_summary()
  }

  async fn get_list(&self, filters: Option<&Filters>) -> Result<Vec<T>> {
    let conn = self.store.conn()?;
    let mut stmt = conn
      .prepare("SELECT data FROM records WHERE resource = ? ORDER BY CAST(id AS INTEGER), id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<Vec<u8>> = stmt
      .query_map(params![self.resource], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list {}: {}", self.resource, e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read {} row: {}", self.resource, e))?;

    let mut entities = Vec::with_capacity(rows.len());
    for data in rows {
      let object = parse_object(&data)?;
      if filters.map_or(true, |f| matches_filters(&object, f)) {
        entities.push(into_entity(object)?);
      }
    }
    debug!(resource = %self.resource, count = entities.len(), "listed records");
    Ok(entities)
  }

  async fn get_by_id(&self, id: &str) -> Result<T> {
    let conn = self.store.conn()?;
    into_entity(self.load(&conn, id)?)
  }

  async fn create(&self, data: Value) -> Result<T> {
    let mut object = expect_object(data, "Create payload")?;
    let conn = self.store.conn()?;

    let next_id: i64 = conn
      .query_row(
        "SELECT COALESCE(MAX(CAST(id AS INTEGER)), 0) + 1 FROM records WHERE resource = ?",
        params![self.resource],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to allocate id: {}", e))?;
    let id = next_id.to_string();

    object.insert("id".to_string(), Value::String(id.clone()));
    self.store(&conn, &id, &object)?;
    debug!(resource = %self.resource, id = %id, "created record");
    into_entity(object)
  }

  async fn update(&self, id: &str, data: Value) -> Result<T> {
    let patch = expect_object(data, "Update payload")?;
    let conn = self.store.conn()?;
    let mut object = self.load(&conn, id)?;

    for (field, value) in patch {
      if field == "id" {
        continue;
      }
      if value.is_null() {
        object.remove(&field);
      } else {
        object.insert(field, value);
      }
    }

    self.store(&conn, id, &object)?;
    into_entity(object)
  }

  async fn delete(&self, id: &str) -> Result<()> {
    let conn = self.store.conn()?;
    let deleted = conn
      .execute(
        "DELETE FROM records WHERE resource = ? AND id = ?",
        params![self.resource, id],
      )
      .map_err(|e| eyre!("Failed to delete {} {}: {}", self.resource, id, e))?;

    if deleted == 0 {
      return Err(eyre!("{} {} not found", self.resource, id));
    }
    Ok(())
  }

  async fn get_summary(&self) -> Result<ResourceSummary> {
    let conn = self.store.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM records WHERE resource = ?",
        params![self.resource],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count {}: {}", self.resource, e))?;

    Ok(ResourceSummary {
      count: count.max(0) as u64,
    })
  }
}
