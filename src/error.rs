//! Error types for the query cache layer.

use color_eyre::Report;
use std::sync::Arc;
use thiserror::Error;

/// Error surfaced by query and mutation observers.
///
/// Cloneable so that one failed fetch can be handed to every observer that
/// was waiting on the same de-duplicated request.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
  /// The backing service rejected the call
  #[error("{0}")]
  Service(Arc<Report>),

  /// A cached value could not be decoded into the observer's type
  #[error("Failed to decode cached value for {key}: {message}")]
  Decode { key: String, message: String },

  /// A value could not be encoded for storage in the cache
  #[error("Failed to encode value for {key}: {message}")]
  Encode { key: String, message: String },

  /// The fetch task went away without producing a result
  #[error("Query was cancelled")]
  Cancelled,
}

impl QueryError {
  /// The underlying service report, if this is a service failure.
  pub fn report(&self) -> Option<&Report> {
    match self {
      QueryError::Service(report) => Some(report),
      _ => None,
    }
  }
}

impl From<Report> for QueryError {
  fn from(report: Report) -> Self {
    QueryError::Service(Arc::new(report))
  }
}

/// Misuse of the resource hooks factory, reported at construction time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractViolation {
  #[error("Resource name must not be empty")]
  EmptyResourceName,

  #[error("Service for `{resource}` is missing required operations: {}", missing.join(", "))]
  MissingOperations {
    resource: String,
    missing: Vec<&'static str>,
  },
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;

  #[test]
  fn test_service_error_keeps_report_message() {
    let err = QueryError::from(eyre!("tank sensor offline"));
    assert_eq!(err.to_string(), "tank sensor offline");
    assert!(err.report().is_some());

    // Clones share the same report
    let cloned = err.clone();
    assert_eq!(cloned.to_string(), err.to_string());
  }

  #[test]
  fn test_missing_operations_message_lists_names() {
    let err = ContractViolation::MissingOperations {
      resource: "tanks".to_string(),
      missing: vec!["update", "delete"],
    };
    assert_eq!(
      err.to_string(),
      "Service for `tanks` is missing required operations: update, delete"
    );
  }
}
