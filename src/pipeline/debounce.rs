//! Keyed debouncing: run an operation once a key has been quiet for a while.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::RequestError;
use crate::schedule::{CancelHandle, Scheduler};

type Reply<T> = oneshot::Sender<Result<T, RequestError>>;

/// The one pending invocation for a key.
struct DebounceSlot<T> {
  /// Distinguishes this slot from any that replaced it after its timer fired
  generation: u64,
  timer: CancelHandle,
  /// Operation of the most recent call
  operation: BoxFuture<'static, Result<T, RequestError>>,
  /// Every caller folded into this invocation, oldest first
  waiters: Vec<Reply<T>>,
}

type Slots<T> = Arc<Mutex<HashMap<String, DebounceSlot<T>>>>;

/// Collapses bursts of calls per key into a single execution.
///
/// Every call for a key restarts its quiet period. When the period elapses the
/// operation passed by the *latest* call runs once, and all callers of the burst
/// receive its result. Superseded callers are not rejected.
pub struct Debouncer<T> {
  scheduler: Arc<dyn Scheduler>,
  slots: Slots<T>,
  generation: Arc<AtomicU64>,
}

impl<T> Clone for Debouncer<T> {
  fn clone(&self) -> Self {
    Self {
      scheduler: Arc::clone(&self.scheduler),
      slots: Arc::clone(&self.slots),
      generation: Arc::clone(&self.generation),
    }
  }
}

fn lock<T>(slots: &Mutex<HashMap<String, DebounceSlot<T>>>) -> MutexGuard<'_, HashMap<String, DebounceSlot<T>>> {
  slots.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone + Send + 'static> Debouncer<T> {
  pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
    Self {
      scheduler,
      slots: Arc::new(Mutex::new(HashMap::new())),
      generation: Arc::new(AtomicU64::new(0)),
    }
  }

  pub async fn debounce<Fut>(&self, key: &str, delay: Duration, operation: Fut) -> Result<T, RequestError>
  where
    Fut: Future<Output = Result<T, RequestError>> + Send + 'static,
  {
    let (tx, rx) = oneshot::channel();
    let generation = self.generation.fetch_add(1, Ordering::Relaxed);

    {
      let mut slots = lock(&self.slots);
      let mut waiters = Vec::new();
      if let Some(previous) = slots.remove(key) {
        previous.timer.cancel();
        waiters = previous.waiters;
        debug!(key, waiting = waiters.len(), "debounce timer restarted");
      }
      waiters.push(tx);

      let timer = self.scheduler.after(
        delay,
        Box::pin(Self::fire(Arc::clone(&self.slots), key.to_string(), generation)),
      );
      slots.insert(
        key.to_string(),
        DebounceSlot {
          generation,
          timer,
          operation: Box::pin(operation),
          waiters,
        },
      );
    }

    rx.await.unwrap_or(Err(RequestError::Cancelled))
  }

  /// Drop the pending invocation for `key`. Its callers receive `Cancelled`.
  pub fn cancel(&self, key: &str) -> bool {
    let Some(slot) = lock(&self.slots).remove(key) else {
      return false;
    };
    slot.timer.cancel();
    for waiter in slot.waiters {
      let _ = waiter.send(Err(RequestError::Cancelled));
    }
    true
  }

  /// Number of keys with a live timer.
  pub fn pending(&self) -> usize {
    lock(&self.slots).len()
  }

  async fn fire(slots: Slots<T>, key: String, generation: u64) {
    let slot = {
      let mut slots = lock(&slots);
      let current = slots
        .get(&key)
        .is_some_and(|slot| slot.generation == generation);
      if current {
        slots.remove(&key)
      } else {
        None
      }
    };
    let Some(DebounceSlot {
      operation, waiters, ..
    }) = slot
    else {
      return;
    };

    debug!(key = %key, callers = waiters.len(), "debounced operation firing");
    let result = operation.await;
    for waiter in waiters {
      let _ = waiter.send(result.clone());
    }
  }
}
