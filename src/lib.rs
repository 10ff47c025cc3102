//! Resource query cache and data-access layer for petrol station management.
//!
//! A [`QueryClient`](query::QueryClient) holds the shared cache. The resource
//! hooks factory binds a [`ResourceService`](resource::ResourceService) to it
//! and hands out ready-made queries and mutations:
//!
//! ```ignore
//! let client = QueryClient::new(CacheOptions::default());
//! let tanks = create_resource_hooks(&client, "tanks", SqliteService::<Record>::new(store, "tanks"))?;
//!
//! let mut list = tanks.use_list(None);
//! list.fetch();
//!
//! tanks.use_create().mutate_async(json!({"name": "Tank B"})).await?;
//! // `list` refetches on its next poll
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod query;
pub mod resource;

pub use error::{ContractViolation, QueryError};
pub use query::{CacheOptions, Filters, Mutation, Query, QueryClient, QueryKey};
pub use resource::{create_resource_hooks, Entity, ResourceHooks, ResourceService};
