//! Callbacks around unit-of-work close

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::trace;

use super::CommandContext;
use crate::error::EngineError;

/// Hook into the close phases of a [`CommandContext`]
///
/// Phases fire in order: `closing`, then (after a successful flush)
/// `after_session_flush`, then either `closed` or `close_failure`. Errors
/// returned from a phase are captured by the context like any other error.
pub trait CloseListener: Send + 'static {
    fn closing(&mut self, _ctx: &CommandContext) -> Result<(), EngineError> {
        Ok(())
    }

    fn after_session_flush(&mut self, _ctx: &CommandContext) -> Result<(), EngineError> {
        Ok(())
    }

    fn closed(&mut self, _ctx: &CommandContext) -> Result<(), EngineError> {
        Ok(())
    }

    fn close_failure(&mut self, _ctx: &CommandContext) {}
}

/// Wakes the async executor once a unit of work that created jobs committed
pub(crate) struct JobAddedNotification {
    notifier: Arc<Notify>,
}

impl JobAddedNotification {
    pub(crate) fn new(notifier: Arc<Notify>) -> Self {
        Self { notifier }
    }
}

impl CloseListener for JobAddedNotification {
    fn closed(&mut self, ctx: &CommandContext) -> Result<(), EngineError> {
        trace!(command = ctx.command_name(), "notifying async executor of new jobs");
        self.notifier.notify_one();
        Ok(())
    }
}
