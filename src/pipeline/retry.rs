//! Bounded retry with exponential backoff.

use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::api::RetryPolicy;
use crate::error::RequestError;
use crate::schedule::Scheduler;

/// Runs an operation under a [`RetryPolicy`].
///
/// Attempts are strictly sequential. The executor never looks at the error; whether
/// an operation is safe to repeat is the caller's decision.
#[derive(Clone)]
pub struct RetryExecutor {
  scheduler: Arc<dyn Scheduler>,
}

impl RetryExecutor {
  pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
    Self { scheduler }
  }

  /// Without a policy the operation runs exactly once and its error is returned as is.
  pub async fn execute<T, F, Fut>(
    &self,
    policy: Option<&RetryPolicy>,
    mut operation: F,
  ) -> Result<T, RequestError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
  {
    let Some(policy) = policy else {
      return operation().await;
    };

    let mut attempt: u32 = 0;
    loop {
      match operation().await {
        Ok(value) => return Ok(value),
        Err(err) if attempt >= policy.max_attempts => {
          return Err(RequestError::RetryExhausted {
            attempts: attempt + 1,
            last: Box::new(err),
          });
        }
        Err(err) => {
          let delay = policy.delay_for(attempt);
          debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
          self.scheduler.sleep(delay).await;
          attempt += 1;
        }
      }
    }
  }
}
