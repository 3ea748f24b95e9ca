//! Command interceptors
//!
//! Interceptors wrap every command the executor runs. The executor installs
//! [`LogInterceptor`] and [`RetryInterceptor`] first; interceptors registered
//! on the configuration follow in registration order.

mod log;
mod retry;

pub use log::LogInterceptor;
pub use retry::RetryInterceptor;

use async_trait::async_trait;

use crate::command::{CommandOutput, Invocation, Next};
use crate::error::EngineError;

/// One link of the command chain
///
/// Call `next.run(invocation)` to continue; not calling it short-circuits the
/// command.
#[async_trait]
pub trait CommandInterceptor: Send + Sync + 'static {
    async fn execute(
        &self,
        invocation: &Invocation,
        next: Next<'_>,
    ) -> Result<CommandOutput, EngineError>;
}
