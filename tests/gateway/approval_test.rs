//! Approval, rejection, and expiry of forward requests.

use std::sync::Arc;
use std::time::Duration;

use conduit::config::GatewayConfig;
use conduit::gateway::{
    ForwardError, ForwardEvent, ForwardOptions, ForwardOutcome, ForwardResult, ForwardStatus,
    GatewayForwarder,
};
use conduit::security::{GatewayForwardRules, InjectionSource, TrustLevel};

use crate::common::{forwarder, gateway_security, main_rules, FakeExecutor};

fn approval_rules() -> GatewayForwardRules {
    GatewayForwardRules {
        require_approval: true,
        ..main_rules()
    }
}

fn peer() -> InjectionSource {
    InjectionSource::p2p("peer", TrustLevel::Untrusted, None, None)
}

async fn submit(fwd: &GatewayForwarder, message: &str) -> String {
    let outcome = fwd
        .forward_request("gw", "main", message, peer(), ForwardOptions::default())
        .await
        .expect("request stored");
    let ForwardOutcome::PendingApproval { request_id } = outcome else {
        panic!("expected pending approval, got {outcome:?}");
    };
    request_id
}

#[tokio::test]
async fn approval_required_stores_pending_request() {
    let executor = FakeExecutor::new();
    let fwd = forwarder(gateway_security(approval_rules()), GatewayConfig::default(), executor.clone());
    let mut events = fwd.subscribe();

    let request_id = submit(&fwd, "please").await;
    assert_eq!(executor.call_count(), 0);

    let pending = fwd.pending_requests();
    assert_eq!(pending.len(), 1);
    let request = &pending[0];
    assert_eq!(request.request_id, request_id);
    assert_eq!(request.status, ForwardStatus::Pending);
    assert_eq!(request.message, "please");
    let deadline = request.expires_at.expect("deadline set");
    assert_eq!((deadline - request.created_at).num_seconds(), 300);

    assert_eq!(
        events.recv().await.expect("event"),
        ForwardEvent::ApprovalRequested {
            request_id: request_id.clone(),
            gateway: "gw".to_owned(),
            target: "main".to_owned(),
        }
    );

    let view = ForwardResult::from(Ok::<_, ForwardError>(ForwardOutcome::PendingApproval {
        request_id: request_id.clone(),
    }));
    assert!(view.requires_approval);
    assert!(!view.success);
}

#[tokio::test]
async fn approve_executes_exactly_once() {
    let executor = FakeExecutor::new();
    let fwd = forwarder(gateway_security(approval_rules()), GatewayConfig::default(), executor.clone());
    let request_id = submit(&fwd, "deploy").await;

    let outcome = fwd.approve_and_execute(&request_id).await.expect("approved");
    assert_eq!(
        outcome,
        ForwardOutcome::Completed {
            request_id: request_id.clone(),
            response: "done:deploy".to_owned(),
        }
    );
    assert!(fwd.pending_requests().is_empty());
    assert_eq!(
        fwd.request(&request_id).expect("kept in history").status,
        ForwardStatus::Completed
    );

    let err = fwd.approve_and_execute(&request_id).await.unwrap_err();
    assert_eq!(
        err,
        ForwardError::NotPending {
            request_id: request_id.clone(),
            status: ForwardStatus::Completed,
        }
    );
    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn concurrent_approvals_execute_once() {
    let executor = FakeExecutor::new();
    let fwd = forwarder(gateway_security(approval_rules()), GatewayConfig::default(), executor.clone());
    let request_id = submit(&fwd, "once").await;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let fwd = Arc::clone(&fwd);
            let id = request_id.clone();
            tokio::spawn(async move { fwd.approve_and_execute(&id).await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => successes += 1,
            Err(e) => assert!(matches!(e, ForwardError::NotPending { .. }), "{e:?}"),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn approval_events_in_order() {
    let fwd = forwarder(gateway_security(approval_rules()), GatewayConfig::default(), FakeExecutor::new());
    let request_id = submit(&fwd, "hi").await;
    let mut events = fwd.subscribe();

    fwd.approve_and_execute(&request_id).await.expect("approved");
    assert_eq!(
        events.recv().await.expect("approved event"),
        ForwardEvent::Approved {
            request_id: request_id.clone()
        }
    );
    assert_eq!(
        events.recv().await.expect("completed event"),
        ForwardEvent::Completed {
            request_id,
            success: true,
        }
    );
}

#[tokio::test]
async fn rejected_request_cannot_be_approved() {
    let executor = FakeExecutor::new();
    let fwd = forwarder(gateway_security(approval_rules()), GatewayConfig::default(), executor.clone());
    let request_id = submit(&fwd, "nope").await;
    let mut events = fwd.subscribe();

    let rejected = fwd.reject_request(&request_id, "not today").expect("rejected");
    assert_eq!(rejected.status, ForwardStatus::Rejected);
    assert_eq!(rejected.error.as_deref(), Some("not today"));
    assert_eq!(
        events.recv().await.expect("event"),
        ForwardEvent::Rejected {
            request_id: request_id.clone(),
            reason: "not today".to_owned(),
        }
    );

    let err = fwd.approve_and_execute(&request_id).await.unwrap_err();
    assert!(matches!(
        err,
        ForwardError::NotPending {
            status: ForwardStatus::Rejected,
            ..
        }
    ));
    assert!(matches!(
        fwd.reject_request(&request_id, "again"),
        Err(ForwardError::NotPending { .. })
    ));
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn unknown_request_is_not_found() {
    let fwd = forwarder(gateway_security(approval_rules()), GatewayConfig::default(), FakeExecutor::new());
    let missing = ForwardError::NotFound {
        request_id: "missing".to_owned(),
    };
    assert_eq!(fwd.approve_and_execute("missing").await.unwrap_err(), missing);
    assert_eq!(fwd.reject_request("missing", "x").unwrap_err(), missing);
}

#[tokio::test]
async fn expired_request_is_rejected_on_approval() {
    let executor = FakeExecutor::new();
    let config = GatewayConfig {
        approval_timeout_secs: 0,
        ..GatewayConfig::default()
    };
    let fwd = forwarder(gateway_security(approval_rules()), config, executor.clone());
    let request_id = submit(&fwd, "late").await;
    let mut events = fwd.subscribe();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = fwd.approve_and_execute(&request_id).await.unwrap_err();
    assert_eq!(
        err,
        ForwardError::Expired {
            request_id: request_id.clone()
        }
    );
    assert_eq!(
        events.recv().await.expect("event"),
        ForwardEvent::Expired {
            request_id: request_id.clone()
        }
    );
    let request = fwd.request(&request_id).expect("kept in history");
    assert_eq!(request.status, ForwardStatus::Rejected);
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn gc_rejects_overdue_requests() {
    let config = GatewayConfig {
        approval_timeout_secs: 0,
        ..GatewayConfig::default()
    };
    let fwd = forwarder(gateway_security(approval_rules()), config, FakeExecutor::new());
    let first = submit(&fwd, "a").await;
    let second = submit(&fwd, "b").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(fwd.gc_expired(), 2);
    assert!(fwd.pending_requests().is_empty());
    for id in [first, second] {
        assert_eq!(fwd.request(&id).expect("history").status, ForwardStatus::Rejected);
    }
    assert_eq!(fwd.gc_expired(), 0);
}

#[tokio::test]
async fn gc_leaves_live_requests() {
    let fwd = forwarder(gateway_security(approval_rules()), GatewayConfig::default(), FakeExecutor::new());
    submit(&fwd, "a").await;
    assert_eq!(fwd.gc_expired(), 0);
    assert_eq!(fwd.pending_requests().len(), 1);
}

#[tokio::test]
async fn bypass_skips_approval() {
    let executor = FakeExecutor::new();
    let fwd = forwarder(gateway_security(approval_rules()), GatewayConfig::default(), executor.clone());
    let options = ForwardOptions {
        bypass_approval: true,
        ..ForwardOptions::default()
    };
    let outcome = fwd
        .forward_request("gw", "main", "now", peer(), options)
        .await
        .expect("executed");
    assert!(matches!(outcome, ForwardOutcome::Completed { .. }));
    assert!(fwd.pending_requests().is_empty());
    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn pending_list_is_oldest_first() {
    let fwd = forwarder(gateway_security(approval_rules()), GatewayConfig::default(), FakeExecutor::new());
    let first = submit(&fwd, "first").await;
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = submit(&fwd, "second").await;

    let ids: Vec<String> = fwd
        .pending_requests()
        .into_iter()
        .map(|r| r.request_id)
        .collect();
    assert_eq!(ids, vec![first, second]);
}
