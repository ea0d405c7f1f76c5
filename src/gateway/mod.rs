//! Gateway forwarding: a gateway session delegates a caller's message into
//! another session under its forward rules, optionally after approval.
//!
//! The forwarded call runs under a context derived from the gateway's own
//! (see [`SecurityContext::derive_for_forward`]), so it is attributed to the
//! gateway at semi-trusted and never inherits the caller's trust.

pub mod pending;
pub mod request;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::executor::{ExecuteOptions, ExecutionError, Executor};
use crate::queue::event::EventEmitter;
use crate::security::rate_limit::RateLimiter;
use crate::security::source::CAP_INJECT;
use crate::security::{
    ContextGuard, CurrentContexts, GatewayForwardRules, InjectionSource, PolicyResolver,
    SecurityContext,
};

pub use pending::PendingForwards;
pub use request::{
    ActionType, ForwardError, ForwardEvent, ForwardOptions, ForwardOutcome, ForwardRequest,
    ForwardResult, ForwardStatus,
};

// ---------------------------------------------------------------------------
// GatewayForwarder
// ---------------------------------------------------------------------------

/// Validates, stores, approves, and executes forward requests.
pub struct GatewayForwarder {
    resolver: Arc<dyn PolicyResolver>,
    executor: Arc<dyn Executor>,
    config: GatewayConfig,
    requests: PendingForwards,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
    contexts: Arc<CurrentContexts>,
    events: EventEmitter<ForwardEvent>,
}

impl std::fmt::Debug for GatewayForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayForwarder")
            .field("config", &self.config)
            .field("requests", &self.requests.len())
            .finish_non_exhaustive()
    }
}

impl GatewayForwarder {
    /// Create a forwarder executing through `executor` with its own
    /// current-context table.
    pub fn new(
        resolver: Arc<dyn PolicyResolver>,
        executor: Arc<dyn Executor>,
        config: GatewayConfig,
    ) -> Self {
        Self::with_contexts(resolver, executor, config, Arc::new(CurrentContexts::new()))
    }

    /// Create a forwarder reading and writing a shared current-context
    /// table, normally the one of the [`QueueRegistry`](crate::queue::QueueRegistry)
    /// it executes through.
    pub fn with_contexts(
        resolver: Arc<dyn PolicyResolver>,
        executor: Arc<dyn Executor>,
        config: GatewayConfig,
        contexts: Arc<CurrentContexts>,
    ) -> Self {
        Self {
            resolver,
            executor,
            requests: PendingForwards::new(config.history_limit),
            limiters: Mutex::new(HashMap::new()),
            contexts,
            events: EventEmitter::with_capacity(config.event_capacity),
            config,
        }
    }

    /// Forward `message` from `gateway` into `target` on behalf of
    /// `original_source`.
    ///
    /// # Errors
    ///
    /// Structural failures (`NotAGateway`, `InvalidForwardTarget`,
    /// `ActionNotAllowed`, `SourceNotAccepted`, `RateLimited`) return before
    /// any request is stored. Execution failures are recorded on the request
    /// and returned as `Refused`, `Execution`, or `Cancelled`.
    pub async fn forward_request(
        &self,
        gateway: &str,
        target: &str,
        message: impl Into<String>,
        original_source: InjectionSource,
        options: ForwardOptions,
    ) -> Result<ForwardOutcome, ForwardError> {
        let gateway_ctx =
            SecurityContext::new(original_source.clone(), gateway, Arc::clone(&self.resolver));
        let rules = match gateway_ctx.forward_rules() {
            Some(rules) if gateway_ctx.can_forward() => rules.clone(),
            _ => {
                warn!(gateway, target, source = %original_source, "forward from non-gateway session");
                return Err(ForwardError::NotAGateway {
                    session: gateway.to_owned(),
                });
            }
        };

        self.validate(gateway, target, &original_source, &options, &rules)?;

        let mut request = ForwardRequest::new(
            gateway,
            target,
            message,
            original_source,
            options.action_type,
        );

        if rules.require_approval && !options.bypass_approval {
            let timeout = chrono::Duration::seconds(i64::from(
                u32::try_from(self.config.approval_timeout_secs).unwrap_or(u32::MAX),
            ));
            request.expires_at = request.created_at.checked_add_signed(timeout);
            let request_id = request.request_id.clone();
            info!(
                request_id = %request_id,
                gateway,
                target,
                source = %request.original_source,
                "forward awaiting approval"
            );
            self.requests.insert(request);
            self.events.emit(ForwardEvent::ApprovalRequested {
                request_id: request_id.clone(),
                gateway: gateway.to_owned(),
                target: target.to_owned(),
            });
            return Ok(ForwardOutcome::PendingApproval { request_id });
        }

        request.status = ForwardStatus::Approved;
        self.requests.insert(request.clone());
        self.execute(request, options.priority, options.cancel).await
    }

    /// Forward through whichever gateway routes `source` to `target`.
    ///
    /// # Errors
    ///
    /// `NoGateway` when no gateway session accepts the source for the
    /// target; otherwise whatever [`forward_request`](Self::forward_request)
    /// returns.
    pub async fn route_through_gateway(
        &self,
        source: InjectionSource,
        target: &str,
        message: impl Into<String>,
    ) -> Result<ForwardOutcome, ForwardError> {
        let Some(gateway) = self.resolver.find_gateway_for_source(&source, target) else {
            warn!(source = %source, target, "no gateway for source");
            return Err(ForwardError::NoGateway {
                source_label: source.label(),
                target: target.to_owned(),
            });
        };
        debug!(source = %source, target, gateway = %gateway, "routing through gateway");
        self.forward_request(&gateway, target, message, source, ForwardOptions::default())
            .await
    }

    /// Approve a pending request and execute it.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotPending` (never re-executes), `Expired`, or the
    /// execution errors of [`forward_request`](Self::forward_request).
    pub async fn approve_and_execute(
        &self,
        request_id: &str,
    ) -> Result<ForwardOutcome, ForwardError> {
        let request = match self.requests.begin_approval(request_id, Utc::now()) {
            Ok(request) => request,
            Err(e) => {
                if matches!(e, ForwardError::Expired { .. }) {
                    self.events.emit(ForwardEvent::Expired {
                        request_id: request_id.to_owned(),
                    });
                }
                warn!(request_id, error = %e, "approval refused");
                return Err(e);
            }
        };
        info!(request_id, target = %request.target_session, "forward approved");
        self.events.emit(ForwardEvent::Approved {
            request_id: request_id.to_owned(),
        });
        self.execute(request, 0, None).await
    }

    /// Reject a pending request.
    ///
    /// # Errors
    ///
    /// `NotFound` or `NotPending`.
    pub fn reject_request(
        &self,
        request_id: &str,
        reason: &str,
    ) -> Result<ForwardRequest, ForwardError> {
        let rejected = self.requests.reject(request_id, reason)?;
        info!(request_id, reason, "forward rejected");
        self.events.emit(ForwardEvent::Rejected {
            request_id: request_id.to_owned(),
            reason: reason.to_owned(),
        });
        Ok(rejected)
    }

    /// Tool-side entry point for a gateway session's agent.
    ///
    /// The caller currently talking to `gateway` is used as the original
    /// source; without one the call is attributed to an internal source
    /// naming the gateway.
    ///
    /// # Errors
    ///
    /// Same as [`forward_request`](Self::forward_request).
    pub async fn handle_gateway_forward(
        &self,
        gateway: &str,
        target: &str,
        message: impl Into<String>,
        action_type: ActionType,
    ) -> Result<ForwardOutcome, ForwardError> {
        let original_source = self.current_context(gateway).map_or_else(
            || InjectionSource::internal(format!("gateway:{gateway}")),
            |ctx| ctx.source().clone(),
        );
        self.forward_request(
            gateway,
            target,
            message,
            original_source,
            ForwardOptions::action(action_type),
        )
        .await
    }

    /// Requests waiting for approval, oldest first.
    pub fn pending_requests(&self) -> Vec<ForwardRequest> {
        self.requests.pending()
    }

    /// Snapshot of one request, pending or recently finished.
    pub fn request(&self, request_id: &str) -> Option<ForwardRequest> {
        self.requests.get(request_id)
    }

    /// Context of the call currently running in `session`, if any.
    pub fn current_context(&self, session: &str) -> Option<Arc<SecurityContext>> {
        self.contexts.current(session)
    }

    /// Register `ctx` as the current context of `session` until the guard
    /// is dropped. Nested registrations stack.
    pub fn enter_context(&self, session: &str, ctx: Arc<SecurityContext>) -> ContextGuard {
        self.contexts.enter(session, ctx)
    }

    /// The current-context table this forwarder reads.
    pub fn contexts(&self) -> &Arc<CurrentContexts> {
        &self.contexts
    }

    /// Reject every pending request past its deadline. Returns how many.
    pub fn gc_expired(&self) -> usize {
        let expired = self.requests.expire(Utc::now());
        for request_id in &expired {
            info!(request_id = %request_id, "forward approval expired");
            self.events.emit(ForwardEvent::Expired {
                request_id: request_id.clone(),
            });
        }
        expired.len()
    }

    /// Subscribe to forward lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        self.events.subscribe()
    }

    // -- internals ----------------------------------------------------------

    fn validate(
        &self,
        gateway: &str,
        target: &str,
        source: &InjectionSource,
        options: &ForwardOptions,
        rules: &GatewayForwardRules,
    ) -> Result<(), ForwardError> {
        if !rules.allows_target(gateway, target) {
            warn!(gateway, target, "forward target not allowed");
            return Err(ForwardError::InvalidForwardTarget {
                gateway: gateway.to_owned(),
                target: target.to_owned(),
            });
        }
        if !rules.allows_action(options.action_type) {
            warn!(gateway, action = %options.action_type, "forward action not allowed");
            return Err(ForwardError::ActionNotAllowed {
                action: options.action_type,
            });
        }
        if !rules.accepts_source(source.source_type) {
            warn!(gateway, source = %source, "gateway does not accept source");
            return Err(ForwardError::SourceNotAccepted {
                source_type: source.source_type,
            });
        }
        if let Some(limit) = rules.rate_limit_per_minute {
            self.limiter(gateway, limit).try_acquire(gateway)?;
        }
        Ok(())
    }

    fn limiter(&self, gateway: &str, per_minute: u32) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        let limiter = limiters
            .entry(gateway.to_owned())
            .or_insert_with(|| Arc::new(RateLimiter::per_minute(per_minute)));
        if limiter.max_count() != per_minute {
            *limiter = Arc::new(RateLimiter::per_minute(per_minute));
        }
        Arc::clone(limiter)
    }

    /// Run an `Approved` request and record its end state.
    async fn execute(
        &self,
        request: ForwardRequest,
        priority: i32,
        cancel: Option<CancellationToken>,
    ) -> Result<ForwardOutcome, ForwardError> {
        let request_id = request.request_id.clone();
        let gateway_ctx = SecurityContext::new(
            request.original_source.clone(),
            request.source_session.clone(),
            Arc::clone(&self.resolver),
        );
        let derived = Arc::new(gateway_ctx.derive_for_forward(request.target_session.clone()));

        if let Err(violation) = derived.require_capability(CAP_INJECT) {
            warn!(request_id = %request_id, error = %violation, "forwarded context refused");
            self.finish(&request_id, Err(violation.to_string()));
            return Err(ForwardError::Refused {
                request_id,
                violation,
            });
        }

        let result = {
            let _guard = (!self.executor.tracks_context())
                .then(|| self.enter_context(&request.target_session, Arc::clone(&derived)));
            let executor = Arc::clone(&self.executor);
            let target = request.target_session.clone();
            let message = request.message;
            let options = ExecuteOptions {
                priority,
                context: Some(derived),
                streaming: false,
            };
            let token = cancel.unwrap_or_else(CancellationToken::new);
            debug!(request_id = %request_id, target = %target, "executing forward");
            tokio::spawn(async move { executor.execute(&target, &message, options, token).await })
                .await
                .unwrap_or_else(|join_err| Err(ExecutionError::Panicked(join_err.to_string())))
        };

        match result {
            Ok(response) => {
                info!(request_id = %request_id, target = %request.target_session, "forward completed");
                self.finish(&request_id, Ok(&response));
                Ok(ForwardOutcome::Completed {
                    request_id,
                    response,
                })
            }
            Err(ExecutionError::Cancelled) => {
                info!(request_id = %request_id, "forward cancelled");
                self.finish(&request_id, Err("cancelled".to_owned()));
                Err(ForwardError::Cancelled { request_id })
            }
            Err(error) => {
                warn!(request_id = %request_id, error = %error, "forward failed");
                self.finish(&request_id, Err(error.to_string()));
                Err(ForwardError::Execution { request_id, error })
            }
        }
    }

    fn finish(&self, request_id: &str, result: Result<&str, String>) {
        let success = result.is_ok();
        self.requests.complete(request_id, result);
        self.events.emit(ForwardEvent::Completed {
            request_id: request_id.to_owned(),
            success,
        });
    }
}
