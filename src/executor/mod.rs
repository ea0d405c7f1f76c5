//! The execution function supplied by the session runtime.
//!
//! Neither the queue nor the gateway knows how a message turns into a model
//! completion. They drive an [`Executor`] and only care about its result,
//! its failure, or its cooperative cancellation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::security::SecurityContext;

/// Options handed to the executor with each message.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Queue priority the message was accepted with.
    pub priority: i32,
    /// Security context the message runs under, when one was built.
    pub context: Option<Arc<SecurityContext>>,
    /// The execution is a long-lived stream that can take more input.
    pub streaming: bool,
}

/// Errors produced by an execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// The execution ran and failed.
    #[error("execution failed: {0}")]
    Failed(String),
    /// The execution observed its cancellation signal and stopped.
    #[error("execution cancelled")]
    Cancelled,
    /// The execution panicked.
    #[error("execution panicked: {0}")]
    Panicked(String),
}

impl ExecutionError {
    /// Returns `true` for the cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Runs one message against one session.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute `message` in `session_key`.
    ///
    /// Implementations must watch `cancel` and return
    /// [`ExecutionError::Cancelled`] promptly once it fires.
    async fn execute(
        &self,
        session_key: &str,
        message: &str,
        options: ExecuteOptions,
        cancel: CancellationToken,
    ) -> Result<String, ExecutionError>;

    /// Whether this executor registers `options.context` as the session's
    /// current context itself, for exactly the time the message runs.
    ///
    /// Executors that queue before running return `true` so callers do not
    /// register a context that is still waiting.
    fn tracks_context(&self) -> bool {
        false
    }

    /// Whether the running execution of `session_key` can take more input.
    fn accepts_stream_input(&self, _session_key: &str) -> bool {
        false
    }

    /// Push `message` into the running execution of `session_key`.
    ///
    /// Returns `Ok(true)` only when the stream took the message. `Ok(false)`
    /// and errors make the caller fall back to queueing.
    async fn inject_into_stream(
        &self,
        _session_key: &str,
        _message: &str,
    ) -> Result<bool, ExecutionError> {
        Ok(false)
    }
}
