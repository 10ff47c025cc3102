//! Resources: the service contract and the hooks bound to it.

mod hooks;
mod record;
mod traits;

pub use hooks::{create_resource_hooks, HookOptions, ResourceHooks, UpdateInput};
pub use record::Record;
pub(crate) use record::matches_filters;
pub use traits::{Entity, Operations, ResourceService, ResourceSummary};
