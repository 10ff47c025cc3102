//! Mutation observers: the write side of the cache.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, warn};

use super::client::QueryClient;
use super::key::QueryKey;
use crate::error::QueryError;

/// Lifecycle of a mutation observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Idle,
  Pending,
  Success,
  Error,
}

type BoxFuture<O> = Pin<Box<dyn Future<Output = Result<O>> + Send>>;
type MutationFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<O> + Send + Sync>;

/// Success callback with direct access to the cache.
pub type SuccessFn<I, O> = Arc<dyn Fn(&O, &I, &QueryClient) + Send + Sync>;

#[derive(Debug)]
struct MutationState<O> {
  pending: usize,
  status: MutationStatus,
  data: Option<O>,
  error: Option<QueryError>,
}

impl<O> Default for MutationState<O> {
  fn default() -> Self {
    Self {
      pending: 0,
      status: MutationStatus::Idle,
      data: None,
      error: None,
    }
  }
}

/// Everything a running call needs; detached from the observer's state so
/// the call can outlive the handle.
struct Runner<I, O> {
  client: QueryClient,
  mutation_fn: MutationFn<I, O>,
  on_success: Option<SuccessFn<I, O>>,
  invalidate_keys: Arc<Vec<QueryKey>>,
}

impl<I, O> Clone for Runner<I, O> {
  fn clone(&self) -> Self {
    Self {
      client: self.client.clone(),
      mutation_fn: Arc::clone(&self.mutation_fn),
      on_success: self.on_success.clone(),
      invalidate_keys: Arc::clone(&self.invalidate_keys),
    }
  }
}

/// Wraps one write operation with pending/error tracking and cache effects.
///
/// Calls are independent: concurrent `mutate_async` calls each run the
/// mutation function, nothing is coalesced. Clones share the same state.
pub struct Mutation<I, O> {
  runner: Runner<I, O>,
  state: Arc<Mutex<MutationState<O>>>,
}

impl<I, O> Clone for Mutation<I, O> {
  fn clone(&self) -> Self {
    Self {
      runner: self.runner.clone(),
      state: Arc::clone(&self.state),
    }
  }
}

impl<I, O> Mutation<I, O>
where
  I: Clone + Send + Sync + 'static,
  O: Clone + Send + Sync + 'static,
{
  pub fn new<F, Fut>(client: &QueryClient, mutation_fn: F) -> Self
  where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
  {
    Self {
      runner: Runner {
        client: client.clone(),
        mutation_fn: Arc::new(move |input| -> BoxFuture<O> { Box::pin(mutation_fn(input)) }),
        on_success: None,
        invalidate_keys: Arc::new(Vec::new()),
      },
      state: Arc::new(Mutex::new(MutationState::default())),
    }
  }

  /// Callback run after a successful call, before invalidation.
  pub fn on_success<F>(mut self, callback: F) -> Self
  where
    F: Fn(&O, &I, &QueryClient) + Send + Sync + 'static,
  {
    self.runner.on_success = Some(Arc::new(callback));
    self
  }

  /// Keys (used as prefixes) to invalidate after every successful call.
  pub fn invalidates(mut self, keys: Vec<QueryKey>) -> Self {
    self.runner.invalidate_keys = Arc::new(keys);
    self
  }

  pub fn invalidate_keys(&self) -> &[QueryKey] {
    &self.runner.invalidate_keys
  }

  /// Run the mutation and wait for it. Errors are returned to the caller
  /// after being recorded on the observer.
  ///
  /// The call runs on its own task: dropping the returned future stops the
  /// wait, not the write or its cache effects.
  pub async fn mutate_async(&self, input: I) -> Result<O, QueryError> {
    begin(&self.state);
    let state = Arc::downgrade(&self.state);
    let task = tokio::spawn(self.runner.clone().run(state.clone(), input));

    match task.await {
      Ok(result) => result,
      Err(join_error) => {
        let error = QueryError::from(eyre!("Mutation task failed: {}", join_error));
        finish(&state, |s| {
          s.error = Some(error.clone());
          MutationStatus::Error
        });
        Err(error)
      }
    }
  }

  /// Fire and forget. The call runs to completion even if this handle is
  /// dropped; only its cache effects remain visible then.
  pub fn mutate(&self, input: I) {
    begin(&self.state);
    let runner = self.runner.clone();
    let state = Arc::downgrade(&self.state);
    tokio::spawn(async move {
      if let Err(error) = runner.run(state, input).await {
        warn!(%error, "mutation failed");
      }
    });
  }

  pub fn status(&self) -> MutationStatus {
    lock(&self.state).status
  }

  pub fn is_pending(&self) -> bool {
    lock(&self.state).pending > 0
  }

  pub fn is_success(&self) -> bool {
    self.status() == MutationStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status() == MutationStatus::Error
  }

  pub fn error(&self) -> Option<QueryError> {
    lock(&self.state).error.clone()
  }

  /// Output of the last successful call.
  pub fn data(&self) -> Option<O> {
    lock(&self.state).data.clone()
  }

  /// Back to idle, forgetting the last outcome. Pending calls keep counting.
  pub fn reset(&self) {
    let mut state = lock(&self.state);
    state.data = None;
    state.error = None;
    if state.pending == 0 {
      state.status = MutationStatus::Idle;
    }
  }
}

impl<I, O> Runner<I, O>
where
  I: Clone + Send + Sync + 'static,
  O: Clone + Send + Sync + 'static,
{
  async fn run(self, state: Weak<Mutex<MutationState<O>>>, input: I) -> Result<O, QueryError> {
    let result = (self.mutation_fn)(input.clone()).await;

    match result {
      Ok(output) => {
        if let Some(on_success) = &self.on_success {
          on_success(&output, &input, &self.client);
        }
        for key in self.invalidate_keys.iter() {
          self.client.invalidate_queries(key);
        }
        debug!(invalidated = self.invalidate_keys.len(), "mutation succeeded");
        finish(&state, |s| {
          s.data = Some(output.clone());
          s.error = None;
          MutationStatus::Success
        });
        Ok(output)
      }
      Err(report) => {
        let error = QueryError::from(report);
        finish(&state, |s| {
          s.error = Some(error.clone());
          MutationStatus::Error
        });
        Err(error)
      }
    }
  }
}

fn lock<O>(state: &Mutex<MutationState<O>>) -> std::sync::MutexGuard<'_, MutationState<O>> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn begin<O>(state: &Mutex<MutationState<O>>) {
  let mut state = lock(state);
  state.pending += 1;
  state.status = MutationStatus::Pending;
}

/// Record the outcome of one call. No-op once the observer is gone.
fn finish<O>(
  state: &Weak<Mutex<MutationState<O>>>,
  record: impl FnOnce(&mut MutationState<O>) -> MutationStatus,
) {
  let Some(state) = state.upgrade() else {
    return;
  };
  let mut state = lock(&state);
  state.pending = state.pending.saturating_sub(1);
  let outcome = record(&mut state);
  state.status = if state.pending > 0 {
    MutationStatus::Pending
  } else {
    outcome
  };
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::key::{detail_key, list_key, lists_key};
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn test_success_runs_callback_then_invalidates() {
    let client = QueryClient::default();
    client
      .set_query_data(&list_key("tanks", None), &json!([]))
      .unwrap();

    let mutation = Mutation::new(&client, |name: String| async move { Ok(format!("{}!", name)) })
      .on_success(|output: &String, input: &String, client: &QueryClient| {
        assert_eq!(output, &format!("{}!", input));
        client
          .set_query_data(&detail_key("tanks", "t9"), output)
          .unwrap();
      })
      .invalidates(vec![lists_key("tanks")]);

    let output = mutation.mutate_async("Tank Z".to_string()).await.unwrap();

    assert_eq!(output, "Tank Z!");
    assert!(mutation.is_success());
    assert!(!mutation.is_pending());
    assert_eq!(mutation.data(), Some("Tank Z!".to_string()));
    assert!(client.is_stale(&list_key("tanks", None), Duration::from_secs(60)));
    assert_eq!(
      client.get::<String>(&detail_key("tanks", "t9")).unwrap(),
      Some("Tank Z!".to_string())
    );
  }

  #[tokio::test]
  async fn test_failure_has_no_cache_effects() {
    let client = QueryClient::default();
    let key = list_key("sales", None);
    client.set_query_data(&key, &json!(["s1"])).unwrap();

    let called = Arc::new(AtomicU32::new(0));
    let called_clone = called.clone();
    let mutation: Mutation<u32, u32> =
      Mutation::new(&client, |_: u32| async { Err(eyre!("rejected")) })
        .on_success(move |_, _, _| {
          called_clone.fetch_add(1, Ordering::SeqCst);
        })
        .invalidates(vec![lists_key("sales")]);

    let result = mutation.mutate_async(1).await;

    assert_eq!(result.unwrap_err().to_string(), "rejected");
    assert!(mutation.is_error());
    assert_eq!(mutation.error().map(|e| e.to_string()), Some("rejected".to_string()));
    assert_eq!(called.load(Ordering::SeqCst), 0);
    assert!(!client.is_stale(&key, Duration::from_secs(60)));
  }

  #[tokio::test]
  async fn test_concurrent_calls_are_independent() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();
    let mutation = Mutation::new(&client, move |n: u32| {
      let calls = calls_clone.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(n * 2)
      }
    });

    let (a, b) = tokio::join!(mutation.mutate_async(1), mutation.mutate_async(2));

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(a.unwrap(), 2);
    assert_eq!(b.unwrap(), 4);
    assert_eq!(mutation.status(), MutationStatus::Success);
  }

  #[tokio::test]
  async fn test_mutate_reports_pending_immediately() {
    let client = QueryClient::default();
    let mutation = Mutation::new(&client, |n: u32| async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      Ok(n)
    });

    mutation.mutate(5);
    assert!(mutation.is_pending());
    assert_eq!(mutation.status(), MutationStatus::Pending);

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!mutation.is_pending());
    assert_eq!(mutation.data(), Some(5));

    mutation.reset();
    assert_eq!(mutation.status(), MutationStatus::Idle);
    assert!(mutation.data().is_none());
  }

  #[tokio::test]
  async fn test_abandoned_call_still_finishes() {
    let client = QueryClient::default();
    let key = list_key("tanks", None);
    client.set_query_data(&key, &json!([])).unwrap();

    let mutation = Mutation::new(&client, |n: u32| async move {
      tokio::time::sleep(Duration::from_millis(30)).await;
      Ok(n)
    })
    .invalidates(vec![lists_key("tanks")]);

    let waited = tokio::time::timeout(Duration::from_millis(5), mutation.mutate_async(1)).await;
    assert!(waited.is_err());
    assert!(mutation.is_pending());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!mutation.is_pending());
    assert_eq!(mutation.status(), MutationStatus::Success);
    assert_eq!(mutation.data(), Some(1));
    assert!(client.is_stale(&key, Duration::from_secs(60)));
  }

  #[tokio::test]
  async fn test_dropped_handle_still_applies_cache_effects() {
    let client = QueryClient::default();
    let key = list_key("employees", None);
    client.set_query_data(&key, &json!([])).unwrap();

    let mutation = Mutation::new(&client, |n: u32| async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      Ok(n)
    })
    .invalidates(vec![lists_key("employees")]);

    mutation.mutate(1);
    drop(mutation);
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert!(client.is_stale(&key, Duration::from_secs(60)));
  }
}
