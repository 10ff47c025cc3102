//! Query observers: the read side of the cache.
//!
//! Inspired by TanStack Query, a `Query<T>` watches one cache key, fetches
//! through the shared [`QueryClient`] and exposes loading, fetching and error
//! state for rendering.
//!
//! # Example
//!
//! ```ignore
//! let service = tank_service.clone();
//! let mut query = Query::new(&client, list_key("tanks", None), move || {
//!   let service = service.clone();
//!   async move { service.get_list(None).await }
//! });
//!
//! // Mount: serve the cache or start fetching
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!   // State changed, trigger re-render
//! }
//!
//! // In render
//! match query.status() {
//!   QueryStatus::Loading => render_spinner(),
//!   QueryStatus::Success => render_tanks(query.data()),
//!   QueryStatus::Error => render_error(query.error()),
//!   QueryStatus::Idle => {}
//! }
//! ```

use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::client::{decode, encode, QueryClient};
use super::key::QueryKey;
use crate::error::QueryError;

/// Lifecycle of a query observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Not started, disabled, or its entry was removed
  Idle,
  /// First fetch in progress, no data yet
  Loading,
  /// Data is available
  Success,
  /// The last fetch failed; earlier data may still be present
  Error,
}

/// Normalized view of a query for consumers.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
  pub data: Option<T>,
  pub is_loading: bool,
  pub is_error: bool,
  pub error: Option<QueryError>,
  pub is_fetching: bool,
}

/// A boxed future that returns the fetched data
type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// A factory function that creates futures for fetching data
type FetcherFn<T> = Arc<dyn Fn() -> BoxFuture<T> + Send + Sync>;

/// Observer of one cache key.
///
/// Query<T> encapsulates:
/// - The fetching logic (via a closure)
/// - Loading/success/error states
/// - Async result handling via channels
/// - Change notifications from the shared cache
///
/// Dropping a query unmounts it; a fetch still running completes into the
/// cache, but its result is never applied to this observer.
pub struct Query<T> {
  client: QueryClient,
  key: QueryKey,
  fetcher: FetcherFn<T>,
  enabled: bool,
  stale_time: Duration,
  status: QueryStatus,
  data: Option<T>,
  error: Option<QueryError>,
  receiver: Option<mpsc::UnboundedReceiver<Result<Value, QueryError>>>,
  subscription: watch::Receiver<u64>,
  fetched_at: Option<Instant>,
  seen_invalidation: u64,
}

impl<T> Query<T>
where
  T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
  /// Create a query for `key`. The fetcher is called each time the cache
  /// needs a fresh value and nobody else is already fetching it.
  pub fn new<F, Fut>(client: &QueryClient, key: QueryKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let subscription = client.subscribe(&key);
    Self {
      client: client.clone(),
      key,
      fetcher: Arc::new(move || -> BoxFuture<T> { Box::pin(fetcher()) }),
      enabled: true,
      stale_time: client.options().stale_time,
      status: QueryStatus::Idle,
      data: None,
      error: None,
      receiver: None,
      subscription,
      fetched_at: None,
      seen_invalidation: 0,
    }
  }

  /// A disabled query never fetches and never reports loading.
  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  /// Set how long fetched data is served without refetching.
  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_time = duration;
    self
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn status(&self) -> QueryStatus {
    self.status
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.error.as_ref()
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled
  }

  /// True only for the first fetch, while there is no data to show.
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  /// True whenever a fetch for this observer is outstanding.
  pub fn is_fetching(&self) -> bool {
    self.receiver.is_some()
  }

  /// Check if the cached data needs a refetch.
  pub fn is_stale(&self) -> bool {
    self.client.is_stale(&self.key, self.stale_time)
  }

  pub fn snapshot(&self) -> QueryResult<T> {
    QueryResult {
      data: self.data.clone(),
      is_loading: self.is_loading(),
      is_error: self.is_error(),
      error: self.error.clone(),
      is_fetching: self.is_fetching(),
    }
  }

  /// Mount the query: show whatever the cache holds and fetch if it is not
  /// fresh. No-op when disabled or already fetching.
  pub fn fetch(&mut self) {
    if !self.enabled || self.is_fetching() {
      return;
    }
    self.hydrate();
    self.start_fetch(false);
  }

  /// Force a fetch regardless of staleness, keeping current data visible.
  /// A pending fetch of this observer is abandoned.
  pub fn refetch(&mut self) {
    if !self.enabled {
      return;
    }
    self.receiver = None;
    self.start_fetch(true);
  }

  /// Poll for results and cache changes.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let mut landed = false;

    if let Some(receiver) = &mut self.receiver {
      match receiver.try_recv() {
        Ok(result) => {
          self.receiver = None;
          self.apply(result);
          landed = true;
        }
        Err(mpsc::error::TryRecvError::Empty) => {}
        Err(mpsc::error::TryRecvError::Disconnected) => {
          // Sender dropped without sending - treat as error
          self.receiver = None;
          self.apply(Err(QueryError::Cancelled));
          landed = true;
        }
      }
    }

    // A landed fetch may have missed an invalidation; check even without a
    // fresh notification.
    if landed || self.subscription.has_changed().unwrap_or(false) {
      self.sync_from_cache() || landed
    } else {
      false
    }
  }

  /// Wait for the outstanding fetch, if any, then apply cache changes.
  pub async fn settled(&mut self) -> bool {
    let Some(receiver) = &mut self.receiver else {
      return self.poll();
    };
    let result = receiver.recv().await.unwrap_or(Err(QueryError::Cancelled));
    self.receiver = None;
    self.apply(result);
    self.sync_from_cache();
    true
  }

  /// Seed the observer from the cache, fresh or stale.
  fn hydrate(&mut self) {
    let Some(entry) = self.client.peek(&self.key) else {
      return;
    };
    self.seen_invalidation = entry.invalidation_epoch;
    if self.data.is_some() {
      return;
    }
    if let Some(value) = entry.value {
      if let Ok(data) = decode::<T>(&self.key, value) {
        self.data = Some(data);
        self.status = QueryStatus::Success;
        self.fetched_at = entry.updated_at;
      }
    }
  }

  fn apply(&mut self, result: Result<Value, QueryError>) {
    match result.and_then(|value| decode::<T>(&self.key, value)) {
      Ok(data) => {
        self.data = Some(data);
        self.error = None;
        self.status = QueryStatus::Success;
        self.fetched_at = Some(Instant::now());
      }
      Err(error) => {
        self.error = Some(error);
        self.status = QueryStatus::Error;
      }
    }
  }

  /// React to a change notification for our key.
  fn sync_from_cache(&mut self) -> bool {
    self.subscription.borrow_and_update();
    if !self.enabled {
      return false;
    }

    let Some(entry) = self.client.peek(&self.key) else {
      if self.is_fetching() || self.data.is_none() {
        return false;
      }
      debug!(key = %self.key, "observed entry removed");
      self.data = None;
      self.error = None;
      self.fetched_at = None;
      self.status = QueryStatus::Idle;
      return true;
    };

    // While our own fetch is outstanding the invalidation stays unseen and
    // is handled once that fetch lands.
    if entry.invalidation_epoch > self.seen_invalidation && !self.is_fetching() {
      self.seen_invalidation = entry.invalidation_epoch;
      if entry.invalidated && self.status != QueryStatus::Idle {
        debug!(key = %self.key, "refetching invalidated query");
        self.start_fetch(false);
        return true;
      }
    }

    let newer = match (entry.updated_at, self.fetched_at) {
      (Some(cached), Some(ours)) => cached > ours,
      (Some(_), None) => true,
      _ => false,
    };
    if newer && !entry.invalidated {
      if let Some(value) = entry.value {
        self.apply(Ok(value));
        self.fetched_at = entry.updated_at;
        return true;
      }
    }

    false
  }

  /// Internal: start the fetch operation
  fn start_fetch(&mut self, force: bool) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    if self.data.is_none() {
      self.status = QueryStatus::Loading;
    }

    let client = self.client.clone();
    let key = self.key.clone();
    let fetcher = self.fetcher.clone();
    let stale_time = self.stale_time;

    tokio::spawn(async move {
      let encode_key = key.clone();
      let fetch = move || {
        let future = fetcher();
        async move {
          let data = future.await?;
          encode(&encode_key, &data)
        }
      };
      let result = if force {
        client.refetch_query(&key, fetch).await
      } else {
        client.fetch_query(&key, stale_time, fetch).await
      };
      // Ignore send errors - the observer may have been dropped
      let _ = tx.send(result);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("status", &self.status)
      .field("data", &self.data)
      .field("enabled", &self.enabled)
      .field("stale_time", &self.stale_time)
      .finish_non_exhaustive()
  }
}
