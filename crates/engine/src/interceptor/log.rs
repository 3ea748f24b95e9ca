use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use super::CommandInterceptor;
use crate::command::{CommandOutput, Invocation, Next};
use crate::error::EngineError;

/// Logs command start and end at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogInterceptor;

#[async_trait]
impl CommandInterceptor for LogInterceptor {
    async fn execute(
        &self,
        invocation: &Invocation,
        next: Next<'_>,
    ) -> Result<CommandOutput, EngineError> {
        let command = invocation.name();
        let propagation = invocation.config().propagation;
        debug!(command, ?propagation, "starting command");

        let started = Instant::now();
        let result = next.run(invocation).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => debug!(command, elapsed_ms, "finished command"),
            Err(err) => debug!(command, elapsed_ms, error = %err, "command failed"),
        }
        result
    }
}
