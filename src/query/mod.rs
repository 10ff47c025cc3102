//! Query cache: keys, the shared client, and the read/write observers built
//! on top of it.
//!
//! - Reads of the same key are de-duplicated into one in-flight fetch
//! - Cached values are served until stale or invalidated
//! - Mutations patch or invalidate the entries they can affect

mod client;
mod key;
mod mutation;
mod observer;

pub use client::{CacheOptions, EntrySnapshot, QueryClient};
pub use key::{
  detail_key, list_key, lists_key, resource_key, summary_key, Filters, KeySegment, QueryKey,
};
pub use mutation::{Mutation, MutationStatus, SuccessFn};
pub use observer::{Query, QueryResult, QueryStatus};
