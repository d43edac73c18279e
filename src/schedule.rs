//! Timer abstraction used for debounce and batch windows.
//!
//! Production code runs on [`TokioScheduler`]. Tests run the same scheduler under
//! tokio's paused clock (`#[tokio::test(start_paused = true)]`), which gives
//! deterministic virtual time without a separate implementation.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::task::AbortHandle;

/// Schedules deferred work.
pub trait Scheduler: Send + Sync {
  /// Run `task` once `delay` has elapsed. The returned handle cancels it if it has not
  /// started yet.
  fn after(&self, delay: Duration, task: BoxFuture<'static, ()>) -> CancelHandle;

  /// Suspend the caller for `delay`.
  fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()>;
}

/// Handle to a scheduled task. Dropping it leaves the task scheduled.
#[must_use = "dropping a CancelHandle does not cancel the task"]
pub struct CancelHandle {
  cancel: Box<dyn FnOnce() + Send>,
}

impl CancelHandle {
  pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
    Self {
      cancel: Box::new(cancel),
    }
  }

  /// Cancel the task and release the timer.
  pub fn cancel(self) {
    (self.cancel)();
  }
}

impl std::fmt::Debug for CancelHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CancelHandle").finish_non_exhaustive()
  }
}

/// Scheduler backed by `tokio::spawn` and `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
  fn after(&self, delay: Duration, task: BoxFuture<'static, ()>) -> CancelHandle {
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      task.await;
    });
    let abort: AbortHandle = handle.abort_handle();
    CancelHandle::new(move || abort.abort())
  }

  fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
    Box::pin(tokio::time::sleep(delay))
  }
}
