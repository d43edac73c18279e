//! Request coalescing: concurrent calls sharing a batch key become one upstream call.

use futures::future::join_all;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::Backend;
use crate::error::RequestError;
use crate::key::{Params, RequestKey};
use crate::schedule::{CancelHandle, Scheduler};

struct Waiter {
  params: Params,
  reply: oneshot::Sender<Result<Value, RequestError>>,
}

/// Calls collected for one batch key while its window is open.
struct PendingBatch {
  endpoint: String,
  created_at: Instant,
  waiters: Vec<Waiter>,
  _timer: CancelHandle,
}

type Pending = Arc<Mutex<HashMap<String, PendingBatch>>>;

fn lock(pending: &Mutex<HashMap<String, PendingBatch>>) -> MutexGuard<'_, HashMap<String, PendingBatch>> {
  pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Coalesces calls per batch key within a short window.
///
/// The first call for a key opens a batch and starts the window timer; later calls join
/// it. When the window closes the batch leaves the pending map and one upstream call
/// carries every distinct parameter set. Its response is split back out by position.
/// If the batched call fails, each distinct parameter set is fetched on its own so one
/// bad request cannot fail its neighbours.
#[derive(Clone)]
pub struct RequestBatcher {
  backend: Arc<dyn Backend>,
  scheduler: Arc<dyn Scheduler>,
  window: Duration,
  pending: Pending,
}

impl RequestBatcher {
  pub fn new(backend: Arc<dyn Backend>, scheduler: Arc<dyn Scheduler>, window: Duration) -> Self {
    Self {
      backend,
      scheduler,
      window,
      pending: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub async fn add(&self, endpoint: &str, batch_key: &RequestKey, params: Params) -> Result<Value, RequestError> {
    let (reply, rx) = oneshot::channel();
    let waiter = Waiter { params, reply };

    {
      let mut pending = lock(&self.pending);
      match pending.entry(batch_key.canonical().to_string()) {
        Entry::Occupied(mut batch) => batch.get_mut().waiters.push(waiter),
        Entry::Vacant(slot) => {
          let task = Self::execute(
            Arc::clone(&self.pending),
            Arc::clone(&self.backend),
            slot.key().clone(),
          );
          let timer = self.scheduler.after(self.window, Box::pin(task));
          debug!(batch_key = %batch_key, "batch opened");
          slot.insert(PendingBatch {
            endpoint: endpoint.to_string(),
            created_at: Instant::now(),
            waiters: vec![waiter],
            _timer: timer,
          });
        }
      }
    }

    rx.await.unwrap_or(Err(RequestError::Cancelled))
  }

  /// Batches still collecting waiters.
  pub fn active(&self) -> usize {
    lock(&self.pending).len()
  }

  async fn execute(pending: Pending, backend: Arc<dyn Backend>, batch_key: String) {
    // Whoever removes the batch owns its execution; it can only happen once.
    let Some(batch) = lock(&pending).remove(&batch_key) else {
      return;
    };
    Self::settle(backend.as_ref(), batch).await;
  }

  async fn settle(backend: &dyn Backend, batch: PendingBatch) {
    let endpoint = batch.endpoint;

    // Waiters with equal params share one slot of the upstream request.
    let mut distinct: Vec<Params> = Vec::new();
    let mut slot_of: HashMap<String, usize> = HashMap::new();
    let mut routes = Vec::with_capacity(batch.waiters.len());
    for waiter in batch.waiters {
      let key = RequestKey::new(&endpoint, &waiter.params);
      let slot = *slot_of
        .entry(key.canonical().to_string())
        .or_insert_with(|| {
          distinct.push(waiter.params.clone());
          distinct.len() - 1
        });
      routes.push((slot, waiter.reply));
    }

    info!(
      endpoint = %endpoint,
      waiters = routes.len(),
      requests = distinct.len(),
      age_ms = batch.created_at.elapsed().as_millis() as u64,
      "sending batch"
    );

    let results: Vec<Result<Value, RequestError>> = match backend.call_batch(&endpoint, &distinct).await {
      Ok(values) if values.len() == distinct.len() => values.into_iter().map(Ok).collect(),
      Ok(values) => {
        let err = RequestError::batch(
          &endpoint,
          format!("expected {} results, got {}", distinct.len(), values.len()),
        );
        warn!(error = %err, "batch response unusable, falling back to individual calls");
        Self::fallback(backend, &endpoint, &distinct).await
      }
      Err(err) => {
        warn!(error = %err, "batch failed, falling back to individual calls");
        Self::fallback(backend, &endpoint, &distinct).await
      }
    };

    for (slot, reply) in routes {
      let _ = reply.send(results[slot].clone());
    }
  }

  async fn fallback(backend: &dyn Backend, endpoint: &str, distinct: &[Params]) -> Vec<Result<Value, RequestError>> {
    join_all(distinct.iter().map(|params| backend.call(endpoint, params))).await
  }
}
