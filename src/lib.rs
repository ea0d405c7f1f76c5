//! Conduit: authorization and request execution for multi-session agents.
//!
//! Every injection is attributed to a typed source, checked against a
//! capability policy, optionally routed through an approving gateway
//! session, and finally ordered in the target session's queue.
//!
//! * [`security`]: sources, trust levels, policy resolution, and the
//!   per-request [`SecurityContext`](security::SecurityContext).
//! * [`gateway`]: forwarding through gateway sessions, with approval.
//! * [`queue`]: the per-session execution queue and its registry.
//! * [`pipeline`]: the entry point tying the three together.
//! * [`executor`]: the execution function supplied by the session runtime.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod executor;
pub mod logging;

pub mod security;

pub mod gateway;
pub mod queue;

pub mod pipeline;
