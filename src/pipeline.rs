//! Injection pipeline: source, context, checks, then gateway routing or the
//! target session's queue.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::gateway::{ForwardError, ForwardOutcome, GatewayForwarder};
use crate::queue::{InjectError, InjectOptions, InjectOutcome, QueueRegistry};
use crate::security::{InjectionSource, PolicyResolver, PolicyViolation, SecurityContext};

/// Why an injection was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The source may not inject into the session.
    #[error(transparent)]
    PolicyViolation(#[from] PolicyViolation),
    /// Gateway routing failed.
    #[error(transparent)]
    Forward(#[from] ForwardError),
    /// The queued execution failed or was cancelled.
    #[error(transparent)]
    Inject(#[from] InjectError),
}

impl PipelineError {
    /// Returns `true` when the injection was cancelled at any layer.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Forward(e) => e.is_cancelled(),
            Self::Inject(e) => e.is_cancelled(),
            Self::PolicyViolation(_) => false,
        }
    }
}

/// How an injection was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Executed through the session queue.
    Completed {
        /// Executor response.
        response: String,
    },
    /// Delivered into the session's running stream.
    Injected,
    /// Executed through a gateway.
    Forwarded {
        /// Forward request id.
        request_id: String,
        /// Executor response.
        response: String,
    },
    /// Routed to a gateway that requires approval first.
    PendingApproval {
        /// Forward request id.
        request_id: String,
    },
}

impl From<ForwardOutcome> for PipelineOutcome {
    fn from(outcome: ForwardOutcome) -> Self {
        match outcome {
            ForwardOutcome::Completed {
                request_id,
                response,
            } => Self::Forwarded {
                request_id,
                response,
            },
            ForwardOutcome::PendingApproval { request_id } => Self::PendingApproval { request_id },
        }
    }
}

impl From<InjectOutcome> for PipelineOutcome {
    fn from(outcome: InjectOutcome) -> Self {
        match outcome {
            InjectOutcome::Completed(response) => Self::Completed { response },
            InjectOutcome::Injected => Self::Injected,
        }
    }
}

/// Entry point for every injection.
pub struct InjectionPipeline {
    resolver: Arc<dyn PolicyResolver>,
    registry: Arc<QueueRegistry>,
    forwarder: Arc<GatewayForwarder>,
}

impl std::fmt::Debug for InjectionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionPipeline")
            .field("registry", &self.registry)
            .field("forwarder", &self.forwarder)
            .finish_non_exhaustive()
    }
}

impl InjectionPipeline {
    /// Pipeline over the given collaborators.
    ///
    /// The forwarder should share the registry's
    /// [`contexts`](QueueRegistry::contexts) table, otherwise
    /// `handle_gateway_forward` cannot see the caller running in a gateway
    /// session.
    pub fn new(
        resolver: Arc<dyn PolicyResolver>,
        registry: Arc<QueueRegistry>,
        forwarder: Arc<GatewayForwarder>,
    ) -> Self {
        Self {
            resolver,
            registry,
            forwarder,
        }
    }

    /// The queue registry.
    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    /// The gateway forwarder.
    pub fn forwarder(&self) -> &Arc<GatewayForwarder> {
        &self.forwarder
    }

    /// Build the security context `source` would run under in `session`.
    pub fn context(&self, source: InjectionSource, session: &str) -> SecurityContext {
        SecurityContext::new(source, session, Arc::clone(&self.resolver))
    }

    /// Inject `message` from `source` into `session`.
    ///
    /// Sources whose policy requires a gateway are routed through one;
    /// everything else must pass the session access check and is queued with
    /// its context attached. The queue registers that context as the
    /// session's current context only while the item executes.
    ///
    /// # Errors
    ///
    /// [`PipelineError`] from whichever layer refused or failed.
    pub async fn inject(
        &self,
        source: InjectionSource,
        session: &str,
        message: impl Into<String>,
        options: InjectOptions,
    ) -> Result<PipelineOutcome, PipelineError> {
        let ctx = Arc::new(self.context(source, session));

        if ctx.requires_gateway() {
            info!(source = %ctx.source(), session, "source requires gateway routing");
            let outcome = self
                .forwarder
                .route_through_gateway(ctx.source().clone(), session, message)
                .await?;
            return Ok(outcome.into());
        }

        ctx.require_session_access()?;

        let options = InjectOptions {
            context: Some(Arc::clone(&ctx)),
            ..options
        };
        debug!(source = %ctx.source(), session, priority = options.priority, "queueing injection");
        let outcome = self.registry.queue(session).enqueue(message, options).await?;
        Ok(outcome.into())
    }
}
