//! Re-run commands that lost an optimistic locking race

use async_trait::async_trait;
use tracing::warn;

use super::CommandInterceptor;
use crate::command::{CommandOutput, Invocation, Next};
use crate::error::EngineError;
use crate::reliability::RetryPolicy;

/// Retries a command whose unit of work failed with an optimistic lock
/// conflict
///
/// Every attempt runs in a fresh unit of work and so re-reads current state.
/// Other errors pass through untouched.
#[derive(Debug, Clone)]
pub struct RetryInterceptor {
    policy: RetryPolicy,
}

impl RetryInterceptor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl CommandInterceptor for RetryInterceptor {
    async fn execute(
        &self,
        invocation: &Invocation,
        next: Next<'_>,
    ) -> Result<CommandOutput, EngineError> {
        let mut retries = 0;
        loop {
            match next.run(invocation).await {
                Err(err) if err.is_optimistic_lock() && self.policy.allows_retry(retries) => {
                    retries += 1;
                    let delay = self.policy.retry_delay(retries);
                    warn!(
                        command = invocation.name(),
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "optimistic lock conflict, retrying command"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}
