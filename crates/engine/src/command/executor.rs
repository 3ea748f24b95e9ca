//! Command executor and interceptor chain
//!
//! Every command passes through the interceptor chain (logging, optimistic
//! lock retry, then user interceptors) before the terminal step opens a fresh
//! [`CommandContext`] and runs it.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use super::{Command, CommandConfig, CommandOutput, DynCommand};
use crate::config::EngineConfig;
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::interceptor::{CommandInterceptor, LogInterceptor, RetryInterceptor};

struct Inner {
    config: Arc<EngineConfig>,
    interceptors: Vec<Arc<dyn CommandInterceptor>>,
}

/// Entry point for running commands
///
/// Cheap to clone; clones share the configuration and interceptor chain.
#[derive(Clone)]
pub struct CommandExecutor {
    inner: Arc<Inner>,
}

impl CommandExecutor {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let mut interceptors: Vec<Arc<dyn CommandInterceptor>> = vec![
            Arc::new(LogInterceptor),
            Arc::new(RetryInterceptor::new(config.command_retry().clone())),
        ];
        interceptors.extend(config.interceptors().iter().cloned());

        Self {
            inner: Arc::new(Inner {
                config,
                interceptors,
            }),
        }
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.inner.config
    }

    /// Run a command in a new unit of work
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output, EngineError> {
        self.execute_with(CommandConfig::default(), command).await
    }

    pub async fn execute_with<C: Command>(
        &self,
        config: CommandConfig,
        command: C,
    ) -> Result<C::Output, EngineError> {
        let invocation = Invocation {
            command: Arc::new(command),
            config,
        };
        let next = Next {
            interceptors: &self.inner.interceptors,
            executor: self,
        };
        let output = next.run(&invocation).await?;
        output
            .downcast::<C::Output>()
            .map(|boxed| *boxed)
            .map_err(|_| {
                EngineError::illegal_state(format!(
                    "command {} returned an unexpected output type",
                    invocation.name()
                ))
            })
    }

    /// Terminal step of the chain
    pub(crate) async fn invoke(&self, invocation: &Invocation) -> Result<CommandOutput, EngineError> {
        CommandContext::new(self.clone(), invocation.name())
            .run(Arc::clone(&invocation.command))
            .await
    }
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("interceptors", &self.inner.interceptors.len())
            .finish()
    }
}

/// A command on its way through the interceptor chain
///
/// Interceptors that retry call `next.run` again with the same invocation;
/// each call opens a fresh unit of work.
pub struct Invocation {
    command: Arc<dyn DynCommand>,
    config: CommandConfig,
}

impl Invocation {
    pub fn name(&self) -> &'static str {
        self.command.name()
    }

    pub fn config(&self) -> CommandConfig {
        self.config
    }
}

/// The rest of the interceptor chain
#[derive(Clone, Copy)]
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn CommandInterceptor>],
    executor: &'a CommandExecutor,
}

impl<'a> Next<'a> {
    pub fn run(self, invocation: &'a Invocation) -> BoxFuture<'a, Result<CommandOutput, EngineError>> {
        async move {
            match self.interceptors.split_first() {
                Some((interceptor, rest)) => {
                    let next = Next {
                        interceptors: rest,
                        executor: self.executor,
                    };
                    interceptor.execute(invocation, next).await
                }
                None => self.executor.invoke(invocation).await,
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Tagging {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl CommandInterceptor for Tagging {
        async fn execute(
            &self,
            invocation: &Invocation,
            next: Next<'_>,
        ) -> Result<CommandOutput, EngineError> {
            self.log.lock().push(format!("{}>{}", self.tag, invocation.name()));
            let result = next.run(invocation).await;
            self.log.lock().push(format!("{}<", self.tag));
            result
        }
    }

    struct Answer;

    #[async_trait]
    impl Command for Answer {
        type Output = String;

        fn name(&self) -> &'static str {
            "Answer"
        }

        async fn execute(&self, _ctx: &mut CommandContext) -> Result<String, EngineError> {
            Ok("42".to_string())
        }
    }

    #[tokio::test]
    async fn test_interceptors_wrap_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let config = EngineConfig::builder(Arc::new(InMemoryStore::new()))
            .with_interceptor(Arc::new(Tagging {
                tag: "outer",
                log: log.clone(),
            }))
            .with_interceptor(Arc::new(Tagging {
                tag: "inner",
                log: log.clone(),
            }))
            .build();
        let executor = CommandExecutor::new(Arc::new(config));

        let answer = executor.execute(Answer).await.unwrap();

        assert_eq!(answer, "42");
        assert_eq!(
            *log.lock(),
            vec!["outer>Answer", "inner>Answer", "inner<", "outer<"]
        );
    }
}
