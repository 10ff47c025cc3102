//! Data-access backends implementing [`ResourceService`](crate::resource::ResourceService).
//!
//! - `rest`: the hosted backend-as-a-service, PostgREST dialect
//! - `sqlite`: a local database for offline use and tests

mod rest;
mod sqlite;

pub use rest::{parse_content_range_total, RestClient, RestService};
pub use sqlite::{SqliteService, SqliteStore};
