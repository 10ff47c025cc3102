//! Process-wide query cache shared by every observer.
//!
//! Values are stored as JSON so entries of any entity shape can live in one
//! map. All bookkeeping happens under a single mutex that is never held
//! across an `.await`; service calls are the only suspension points.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::key::QueryKey;
use crate::error::QueryError;

type SharedFetch = Shared<BoxFuture<'static, Result<Value, QueryError>>>;

/// Default freshness window and inactivity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
  /// How long a fetched value is served without refetching
  pub stale_time: Duration,
  /// How long an unobserved entry is kept before garbage collection
  pub gc_time: Duration,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(5 * 60),
      gc_time: Duration::from_secs(5 * 60),
    }
  }
}

struct InFlight {
  id: u64,
  /// Invalidation epoch of the entry when the fetch started
  epoch: u64,
  fetch: SharedFetch,
}

#[derive(Default)]
struct CacheEntry {
  value: Option<Value>,
  updated_at: Option<Instant>,
  invalidated: bool,
  /// Bumped on every invalidation so observers can tell new ones from old
  invalidation_epoch: u64,
  error: Option<QueryError>,
  in_flight: Option<InFlight>,
  touched_at: Option<Instant>,
}

impl CacheEntry {
  fn is_fresh(&self, stale_time: Duration) -> bool {
    match (&self.value, self.updated_at) {
      (Some(_), Some(at)) => !self.invalidated && at.elapsed() <= stale_time,
      _ => false,
    }
  }

  fn touch(&mut self) {
    self.touched_at = Some(Instant::now());
  }
}

/// Point-in-time copy of one cache entry.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
  pub value: Option<Value>,
  pub updated_at: Option<Instant>,
  pub invalidated: bool,
  pub invalidation_epoch: u64,
  pub error: Option<QueryError>,
  pub is_fetching: bool,
}

#[derive(Default)]
struct Inner {
  entries: HashMap<QueryKey, CacheEntry>,
  watchers: HashMap<QueryKey, watch::Sender<u64>>,
  next_fetch_id: u64,
}

impl Inner {
  fn notify(&self, key: &QueryKey) {
    if let Some(tx) = self.watchers.get(key) {
      tx.send_modify(|version| *version += 1);
    }
  }
}

/// Handle to the shared cache. Cloning is cheap; all clones see the same
/// entries.
#[derive(Clone, Default)]
pub struct QueryClient {
  inner: Arc<Mutex<Inner>>,
  options: CacheOptions,
}

impl QueryClient {
  pub fn new(options: CacheOptions) -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner::default())),
      options,
    }
  }

  pub fn options(&self) -> CacheOptions {
    self.options
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    lock_inner(&self.inner)
  }

  /// Return the cached value for `key` if it is fresh, otherwise run
  /// `fetcher`. Concurrent callers for the same key share one fetch, unless
  /// the key was invalidated after that fetch started.
  ///
  /// `fetcher` runs outside the cache lock and may read the client.
  pub async fn fetch_query<F, Fut>(
    &self,
    key: &QueryKey,
    stale_time: Duration,
    fetcher: F,
  ) -> Result<Value, QueryError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
  {
    self.fetch_inner(key, Some(stale_time), fetcher).await
  }

  /// Run `fetcher` regardless of freshness. A fetch already in flight for
  /// the key is superseded: its callers still get their result, but only
  /// the newest fetch writes to the cache.
  pub async fn refetch_query<F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<Value, QueryError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
  {
    self.fetch_inner(key, None, fetcher).await
  }

  async fn fetch_inner<F, Fut>(
    &self,
    key: &QueryKey,
    stale_time: Option<Duration>,
    fetcher: F,
  ) -> Result<Value, QueryError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
  {
    let shared = {
      let mut inner = self.lock();
      inner.next_fetch_id += 1;
      let fetch_id = inner.next_fetch_id;
      let entry = inner.entries.entry(key.clone()).or_default();
      entry.touch();

      match stale_time {
        Some(stale_time) => {
          if entry.is_fresh(stale_time) {
            if let Some(value) = &entry.value {
              debug!(key = %key, "cache hit");
              return Ok(value.clone());
            }
          }
          let joinable = entry
            .in_flight
            .as_ref()
            .filter(|in_flight| in_flight.epoch == entry.invalidation_epoch)
            .map(|in_flight| in_flight.fetch.clone());
          if let Some(fetch) = joinable {
            debug!(key = %key, "joining in-flight fetch");
            fetch
          } else {
            if entry.in_flight.is_some() {
              debug!(key = %key, "in-flight fetch predates invalidation, fetching again");
            } else {
              debug!(key = %key, fingerprint = %key.fingerprint(), "cache miss, fetching");
            }
            self.start_fetch(entry, key, fetch_id, fetcher)
          }
        }
        None => {
          debug!(key = %key, "forced refetch");
          self.start_fetch(entry, key, fetch_id, fetcher)
        }
      }
    };

    shared.await
  }

  /// Install a new in-flight fetch on `entry`. The fetcher is only called
  /// once the returned future is first polled, after the lock is released.
  /// Whichever caller drives it also records the result.
  fn start_fetch<F, Fut>(
    &self,
    entry: &mut CacheEntry,
    key: &QueryKey,
    fetch_id: u64,
    fetcher: F,
  ) -> SharedFetch
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
  {
    let inner = Arc::downgrade(&self.inner);
    let settle_key = key.clone();
    let fetch = async move {
      let result = fetcher().await;
      settle(&inner, &settle_key, fetch_id, &result);
      result
    }
    .boxed()
    .shared();

    entry.in_flight = Some(InFlight {
      id: fetch_id,
      epoch: entry.invalidation_epoch,
      fetch: fetch.clone(),
    });
    fetch
  }

  /// Raw cached value, fresh or stale.
  pub fn get_query_data(&self, key: &QueryKey) -> Option<Value> {
    let mut inner = self.lock();
    let entry = inner.entries.get_mut(key)?;
    entry.touch();
    entry.value.clone()
  }

  /// Cached value decoded into `T`.
  pub fn get<T: DeserializeOwned>(&self, key: &QueryKey) -> Result<Option<T>, QueryError> {
    self
      .get_query_data(key)
      .map(|value| decode(key, value))
      .transpose()
  }

  /// Write a value directly, marking it fresh.
  pub fn set_query_data<T: Serialize>(&self, key: &QueryKey, data: &T) -> Result<(), QueryError> {
    let value = encode(key, data)?;
    let mut inner = self.lock();
    let entry = inner.entries.entry(key.clone()).or_default();
    entry.value = Some(value);
    entry.updated_at = Some(Instant::now());
    entry.invalidated = false;
    entry.error = None;
    entry.touch();
    inner.notify(key);
    debug!(key = %key, "cache entry written");
    Ok(())
  }

  /// Mark every entry whose key starts with `prefix` as stale. Returns the
  /// number of entries affected.
  pub fn invalidate_queries(&self, prefix: &QueryKey) -> usize {
    let mut inner = self.lock();
    let mut affected = Vec::new();
    for (key, entry) in inner.entries.iter_mut() {
      if key.starts_with(prefix) {
        entry.invalidated = true;
        entry.invalidation_epoch += 1;
        affected.push(key.clone());
      }
    }
    for key in &affected {
      inner.notify(key);
    }
    debug!(prefix = %prefix, count = affected.len(), "invalidated queries");
    affected.len()
  }

  /// Drop the entry for `key` entirely. Returns whether one existed.
  pub fn remove_query(&self, key: &QueryKey) -> bool {
    let mut inner = self.lock();
    let removed = inner.entries.remove(key).is_some();
    if removed {
      inner.notify(key);
      debug!(key = %key, "cache entry removed");
    }
    removed
  }

  /// Change notifications for `key`. The receiver sees a new version after
  /// every write, invalidation or removal of the entry.
  pub fn subscribe(&self, key: &QueryKey) -> watch::Receiver<u64> {
    let mut inner = self.lock();
    inner
      .watchers
      .entry(key.clone())
      .or_insert_with(|| watch::channel(0).0)
      .subscribe()
  }

  pub fn peek(&self, key: &QueryKey) -> Option<EntrySnapshot> {
    let inner = self.lock();
    inner.entries.get(key).map(|entry| EntrySnapshot {
      value: entry.value.clone(),
      updated_at: entry.updated_at,
      invalidated: entry.invalidated,
      invalidation_epoch: entry.invalidation_epoch,
      error: entry.error.clone(),
      is_fetching: entry.in_flight.is_some(),
    })
  }

  /// Whether `key` would be refetched by a read with `stale_time`.
  pub fn is_stale(&self, key: &QueryKey, stale_time: Duration) -> bool {
    let inner = self.lock();
    inner
      .entries
      .get(key)
      .map(|entry| !entry.is_fresh(stale_time))
      .unwrap_or(true)
  }

  /// Remove entries nobody observes that have been idle for longer than the
  /// configured `gc_time`. Returns the number of entries removed.
  pub fn collect_garbage(&self) -> usize {
    let gc_time = self.options.gc_time;
    let mut inner = self.lock();
    let Inner {
      entries, watchers, ..
    } = &mut *inner;

    let before = entries.len();
    entries.retain(|key, entry| {
      let observed = watchers
        .get(key)
        .map(|tx| tx.receiver_count() > 0)
        .unwrap_or(false);
      let idle = entry
        .touched_at
        .map(|at| at.elapsed() >= gc_time)
        .unwrap_or(true);
      observed || entry.in_flight.is_some() || !idle
    });
    watchers.retain(|key, tx| tx.receiver_count() > 0 || entries.contains_key(key));

    let removed = before - entries.len();
    if removed > 0 {
      debug!(removed, "collected idle cache entries");
    }
    removed
  }

  /// Run [`collect_garbage`](Self::collect_garbage) every `period` until
  /// the last client handle is dropped.
  pub fn spawn_gc(&self, period: Duration) -> JoinHandle<()> {
    let inner = Arc::downgrade(&self.inner);
    let options = self.options;
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      // The first tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
          trace!("query client dropped, stopping garbage collection");
          break;
        };
        QueryClient { inner, options }.collect_garbage();
      }
    })
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
  // No code path panics while holding the lock, so the data stays consistent.
  inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Record a finished fetch. Superseded fetches and fetches for entries that
/// were removed meanwhile leave the cache alone.
fn settle(inner: &Weak<Mutex<Inner>>, key: &QueryKey, fetch_id: u64, result: &Result<Value, QueryError>) {
  let Some(inner) = inner.upgrade() else {
    return;
  };
  let mut inner = lock_inner(&inner);
  let Some(entry) = inner.entries.get_mut(key) else {
    trace!(key = %key, "fetch finished after entry was removed");
    return;
  };
  let started_epoch = match &entry.in_flight {
    Some(in_flight) if in_flight.id == fetch_id => in_flight.epoch,
    _ => {
      trace!(key = %key, fetch_id, "superseded fetch finished");
      return;
    }
  };
  entry.in_flight = None;

  match result {
    Ok(value) => {
      entry.value = Some(value.clone());
      entry.updated_at = Some(Instant::now());
      entry.error = None;
      // An invalidation that landed mid-fetch still applies to this value
      if entry.invalidation_epoch == started_epoch {
        entry.invalidated = false;
      } else {
        debug!(key = %key, "invalidated while fetching, value stays stale");
      }
    }
    Err(error) => {
      // Keep whatever value was cached before
      debug!(key = %key, %error, "fetch failed");
      entry.error = Some(error.clone());
    }
  }
  entry.touch();
  inner.notify(key);
}

pub(crate) fn encode<T: Serialize>(key: &QueryKey, data: &T) -> Result<Value, QueryError> {
  serde_json::to_value(data).map_err(|e| QueryError::Encode {
    key: key.to_string(),
    message: e.to_string(),
  })
}

pub(crate) fn decode<T: DeserializeOwned>(key: &QueryKey, value: Value) -> Result<T, QueryError> {
  serde_json::from_value(value).map_err(|e| QueryError::Decode {
    key: key.to_string(),
    message: e.to_string(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::key::{detail_key, list_key, lists_key, Filters};
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn counting_fetch(
    counter: &Arc<AtomicU32>,
    value: Value,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<Value, QueryError>> {
    let counter = counter.clone();
    move || {
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(value)
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_concurrent_fetches_are_deduplicated() {
    let client = QueryClient::default();
    let key = list_key("tanks", None);
    let counter = Arc::new(AtomicU32::new(0));
    let stale = client.options().stale_time;

    let (a, b) = tokio::join!(
      client.fetch_query(&key, stale, counting_fetch(&counter, json!([1]))),
      client.fetch_query(&key, stale, counting_fetch(&counter, json!([2]))),
    );

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap(), json!([1]));
    assert_eq!(b.unwrap(), json!([1]));
  }

  #[tokio::test]
  async fn test_fresh_value_is_served_from_cache() {
    let client = QueryClient::default();
    let key = detail_key("tanks", "t1");
    let counter = Arc::new(AtomicU32::new(0));
    let stale = Duration::from_secs(60);

    client
      .fetch_query(&key, stale, counting_fetch(&counter, json!({"id": "t1"})))
      .await
      .unwrap();
    let again = client
      .fetch_query(&key, stale, counting_fetch(&counter, json!({"id": "other"})))
      .await
      .unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(again, json!({"id": "t1"}));
  }

  #[tokio::test]
  async fn test_zero_stale_time_always_refetches() {
    let client = QueryClient::default();
    let key = detail_key("tanks", "t1");
    let counter = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
      client
        .fetch_query(&key, Duration::ZERO, counting_fetch(&counter, json!(1)))
        .await
        .unwrap();
      tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_invalidation_uses_prefix() {
    let client = QueryClient::default();
    let active = Filters::new().with("status", "active");
    client.set_query_data(&list_key("tanks", None), &json!([])).unwrap();
    client
      .set_query_data(&list_key("tanks", Some(&active)), &json!([]))
      .unwrap();
    client
      .set_query_data(&detail_key("tanks", "t1"), &json!({}))
      .unwrap();

    assert_eq!(client.invalidate_queries(&lists_key("tanks")), 2);

    let stale = Duration::from_secs(60);
    assert!(client.is_stale(&list_key("tanks", None), stale));
    assert!(client.is_stale(&list_key("tanks", Some(&active)), stale));
    assert!(!client.is_stale(&detail_key("tanks", "t1"), stale));
  }

  #[tokio::test]
  async fn test_failed_fetch_keeps_previous_value() {
    let client = QueryClient::default();
    let key = list_key("sales", None);
    client.set_query_data(&key, &json!(["s1"])).unwrap();

    let result = client
      .refetch_query(&key, || async { Err(QueryError::from(eyre!("offline"))) })
      .await;

    assert!(result.is_err());
    assert_eq!(client.get_query_data(&key), Some(json!(["s1"])));
    let snapshot = client.peek(&key).unwrap();
    assert!(snapshot.error.is_some());
    assert!(!snapshot.is_fetching);
  }

  #[tokio::test]
  async fn test_removed_entry_is_not_resurrected_by_late_fetch() {
    let client = QueryClient::default();
    let key = detail_key("employees", "e1");
    let stale = client.options().stale_time;

    let fetch = client.fetch_query(&key, stale, || async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      Ok(json!({"id": "e1"}))
    });
    let remove = async {
      tokio::time::sleep(Duration::from_millis(5)).await;
      client.remove_query(&key)
    };
    let (fetched, removed) = tokio::join!(fetch, remove);

    assert!(fetched.is_ok());
    assert!(removed);
    assert!(client.get_query_data(&key).is_none());
  }

  #[tokio::test]
  async fn test_subscribers_see_writes_and_removals() {
    let client = QueryClient::default();
    let key = detail_key("providers", "p1");
    let mut rx = client.subscribe(&key);

    client.set_query_data(&key, &json!({"id": "p1"})).unwrap();
    assert!(rx.has_changed().unwrap());
    rx.borrow_and_update();

    client.remove_query(&key);
    assert!(rx.has_changed().unwrap());
  }

  #[tokio::test]
  async fn test_garbage_collection_spares_observed_entries() {
    let client = QueryClient::new(CacheOptions {
      stale_time: Duration::from_secs(60),
      gc_time: Duration::ZERO,
    });
    let watched = detail_key("tanks", "t1");
    let idle = detail_key("tanks", "t2");
    client.set_query_data(&watched, &json!({})).unwrap();
    client.set_query_data(&idle, &json!({})).unwrap();

    let rx = client.subscribe(&watched);
    assert_eq!(client.collect_garbage(), 1);
    assert!(client.get_query_data(&watched).is_some());
    assert!(client.get_query_data(&idle).is_none());

    drop(rx);
    assert_eq!(client.collect_garbage(), 1);
    assert!(client.is_empty());
  }

  #[tokio::test]
  async fn test_invalidation_during_fetch_keeps_entry_stale() {
    let client = QueryClient::default();
    let key = list_key("tanks", None);
    let counter = Arc::new(AtomicU32::new(0));
    let stale = Duration::from_secs(60);

    let fetch = client.fetch_query(&key, stale, counting_fetch(&counter, json!(["old"])));
    let invalidate = async {
      tokio::time::sleep(Duration::from_millis(5)).await;
      client.invalidate_queries(&lists_key("tanks"))
    };
    let (fetched, invalidated) = tokio::join!(fetch, invalidate);

    assert_eq!(fetched.unwrap(), json!(["old"]));
    assert_eq!(invalidated, 1);
    assert!(client.is_stale(&key, stale));

    let next = client
      .fetch_query(&key, stale, counting_fetch(&counter, json!(["new"])))
      .await
      .unwrap();
    assert_eq!(next, json!(["new"]));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert!(!client.is_stale(&key, stale));
  }

  #[tokio::test]
  async fn test_read_after_invalidation_does_not_join_older_fetch() {
    let client = QueryClient::default();
    let key = list_key("tanks", None);
    let counter = Arc::new(AtomicU32::new(0));
    let stale = Duration::from_secs(60);

    let early = client.fetch_query(&key, stale, counting_fetch(&counter, json!(["old"])));
    let late = async {
      tokio::time::sleep(Duration::from_millis(5)).await;
      client.invalidate_queries(&key);
      client
        .fetch_query(&key, stale, counting_fetch(&counter, json!(["new"])))
        .await
    };
    let (early, late) = tokio::join!(early, late);

    assert_eq!(early.unwrap(), json!(["old"]));
    assert_eq!(late.unwrap(), json!(["new"]));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(client.get_query_data(&key), Some(json!(["new"])));
    assert!(!client.is_stale(&key, stale));
  }

  #[tokio::test]
  async fn test_superseded_fetch_does_not_overwrite_newer_value() {
    let client = QueryClient::default();
    let key = detail_key("tanks", "t1");

    let slow = client.fetch_query(&key, client.options().stale_time, || async {
      tokio::time::sleep(Duration::from_millis(30)).await;
      Ok(json!("slow"))
    });
    let fast = async {
      tokio::time::sleep(Duration::from_millis(5)).await;
      client
        .refetch_query(&key, || async { Ok(json!("fast")) })
        .await
    };
    let (slow, fast) = tokio::join!(slow, fast);

    assert_eq!(slow.unwrap(), json!("slow"));
    assert_eq!(fast.unwrap(), json!("fast"));
    assert_eq!(client.get_query_data(&key), Some(json!("fast")));
    assert!(!client.peek(&key).unwrap().is_fetching);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_fetcher_may_read_the_client() {
    let client = QueryClient::default();
    let seed_key = detail_key("sales", "page-1");
    let key = detail_key("sales", "page-2");
    client.set_query_data(&seed_key, &json!(1)).unwrap();

    let reader = client.clone();
    let fetch = client.fetch_query(&key, client.options().stale_time, move || {
      let seed = reader.get_query_data(&seed_key);
      async move { Ok(json!([seed, 2])) }
    });
    let fetched = tokio::time::timeout(Duration::from_millis(500), fetch)
      .await
      .expect("fetch settles");

    assert_eq!(fetched.unwrap(), json!([1, 2]));
  }

  #[tokio::test]
  async fn test_spawned_gc_collects_until_client_is_dropped() {
    let client = QueryClient::new(CacheOptions {
      stale_time: Duration::from_secs(60),
      gc_time: Duration::ZERO,
    });
    client
      .set_query_data(&detail_key("tanks", "t1"), &json!({}))
      .unwrap();

    let handle = client.spawn_gc(Duration::from_millis(5));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(client.is_empty());

    drop(client);
    tokio::time::timeout(Duration::from_millis(100), handle)
      .await
      .expect("gc task stops")
      .unwrap();
  }

  #[test]
  fn test_typed_get_reports_decode_errors() {
    let client = QueryClient::default();
    let key = detail_key("tanks", "t1");
    client.set_query_data(&key, &json!({"id": 5})).unwrap();

    let decoded: Result<Option<Vec<String>>, _> = client.get(&key);
    assert!(matches!(decoded, Err(QueryError::Decode { .. })));
  }
}
