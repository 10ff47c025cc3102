//! Resource hooks factory: binds a service to the query cache.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::traits::{Operations, ResourceService};
use crate::error::ContractViolation;
use crate::query::{
  detail_key, list_key, lists_key, resource_key, summary_key, Filters, Mutation, Query,
  QueryClient, QueryKey,
};

/// Per-resource overrides of the client defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookOptions {
  pub stale_time: Option<Duration>,
}

/// Input of the update mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateInput<U> {
  pub id: String,
  pub data: U,
}

impl<U> UpdateInput<U> {
  pub fn new(id: impl Into<String>, data: U) -> Self {
    Self {
      id: id.into(),
      data,
    }
  }
}

/// Ready-made queries and mutations for one resource.
///
/// Writes invalidate every list variant and the summary of the resource;
/// update also writes the returned entity into its detail entry, and delete
/// removes the detail entry.
pub struct ResourceHooks<S: ResourceService> {
  client: QueryClient,
  resource: Arc<str>,
  service: Arc<S>,
  operations: Operations,
  options: HookOptions,
}

impl<S: ResourceService> Clone for ResourceHooks<S> {
  fn clone(&self) -> Self {
    Self {
      client: self.client.clone(),
      resource: Arc::clone(&self.resource),
      service: Arc::clone(&self.service),
      operations: self.operations,
      options: self.options,
    }
  }
}

/// Build the hooks for `resource_name`.
///
/// Fails if the name is empty or the service does not support all five
/// required operations.
pub fn create_resource_hooks<S: ResourceService>(
  client: &QueryClient,
  resource_name: &str,
  service: S,
) -> Result<ResourceHooks<S>, ContractViolation> {
  if resource_name.trim().is_empty() {
    return Err(ContractViolation::EmptyResourceName);
  }

  let operations = service.operations();
  let missing = operations.missing_required();
  if !missing.is_empty() {
    return Err(ContractViolation::MissingOperations {
      resource: resource_name.to_string(),
      missing,
    });
  }

  debug!(resource = resource_name, summary = operations.summary, "resource hooks created");
  Ok(ResourceHooks {
    client: client.clone(),
    resource: Arc::from(resource_name),
    service: Arc::new(service),
    operations,
    options: HookOptions::default(),
  })
}

impl<S: ResourceService> ResourceHooks<S> {
  pub fn with_options(mut self, options: HookOptions) -> Self {
    self.options = options;
    self
  }

  pub fn resource_name(&self) -> &str {
    &self.resource
  }

  pub fn client(&self) -> &QueryClient {
    &self.client
  }

  pub fn service(&self) -> &S {
    &self.service
  }

  pub fn operations(&self) -> Operations {
    self.operations
  }

  fn stale_time(&self) -> Duration {
    self
      .options
      .stale_time
      .unwrap_or(self.client.options().stale_time)
  }

  /// Keys every write of this resource invalidates.
  fn write_invalidations(&self) -> Vec<QueryKey> {
    vec![lists_key(&self.resource), summary_key(&self.resource)]
  }

  pub fn use_list(&self, filters: Option<Filters>) -> Query<Vec<S::Entity>> {
    let key = list_key(&self.resource, filters.as_ref());
    let service = Arc::clone(&self.service);
    Query::new(&self.client, key, move || {
      let service = Arc::clone(&service);
      let filters = filters.clone();
      async move { service.get_list(filters.as_ref()).await }
    })
    .with_stale_time(self.stale_time())
  }

  /// Disabled until an id is chosen.
  pub fn use_by_id(&self, id: Option<&str>) -> Query<S::Entity> {
    let id = id.unwrap_or_default().to_string();
    let enabled = !id.is_empty();
    let key = detail_key(&self.resource, &id);
    let service = Arc::clone(&self.service);
    Query::new(&self.client, key, move || {
      let service = Arc::clone(&service);
      let id = id.clone();
      async move { service.get_by_id(&id).await }
    })
    .with_stale_time(self.stale_time())
    .enabled(enabled)
  }

  /// `None` when the service has no summary.
  pub fn use_summary(&self) -> Option<Query<S::Summary>> {
    if !self.operations.summary {
      return None;
    }
    let service = Arc::clone(&self.service);
    let query = Query::new(&self.client, summary_key(&self.resource), move || {
      let service = Arc::clone(&service);
      async move { service.get_summary().await }
    })
    .with_stale_time(self.stale_time());
    Some(query)
  }

  pub fn use_create(&self) -> Mutation<S::Create, S::Entity> {
    let service = Arc::clone(&self.service);
    Mutation::new(&self.client, move |data: S::Create| {
      let service = Arc::clone(&service);
      async move { service.create(data).await }
    })
    .invalidates(self.write_invalidations())
  }

  /// Writes the returned entity into its detail entry, falling back to
  /// invalidating that entry if the write fails.
  pub fn use_update(&self) -> Mutation<UpdateInput<S::Update>, S::Entity> {
    let service = Arc::clone(&self.service);
    let resource = Arc::clone(&self.resource);
    Mutation::new(&self.client, move |input: UpdateInput<S::Update>| {
      let service = Arc::clone(&service);
      async move { service.update(&input.id, input.data).await }
    })
    .on_success(move |entity, input, client| {
      let key = detail_key(&resource, &input.id);
      if let Err(error) = client.set_query_data(&key, entity) {
        warn!(key = %key, %error, "direct cache write failed, invalidating instead");
        client.invalidate_queries(&key);
      }
    })
    .invalidates(self.write_invalidations())
  }

  pub fn use_delete(&self) -> Mutation<String, ()> {
    let service = Arc::clone(&self.service);
    let resource = Arc::clone(&self.resource);
    Mutation::new(&self.client, move |id: String| {
      let service = Arc::clone(&service);
      async move { service.delete(&id).await }
    })
    .on_success(move |_, id, client| {
      client.remove_query(&detail_key(&resource, id));
    })
    .invalidates(self.write_invalidations())
  }

  /// Mark every cached key of this resource stale.
  pub fn invalidate_all(&self) -> usize {
    self.client.invalidate_queries(&resource_key(&self.resource))
  }
}
