//! Direct stream injection tests for `SessionQueue`.

use std::sync::Arc;

use conduit::queue::{InjectOptions, InjectOutcome, QueueEvent, SessionQueue};

use crate::common::{wait_until, FakeExecutor, StreamAnswer};

fn streaming() -> InjectOptions {
    InjectOptions {
        streaming: true,
        ..InjectOptions::default()
    }
}

fn direct() -> InjectOptions {
    InjectOptions {
        allow_direct_inject: true,
        ..InjectOptions::default()
    }
}

#[tokio::test]
async fn message_goes_into_open_stream() {
    let executor = FakeExecutor::gated();
    executor.open_stream(StreamAnswer::Accept);
    let queue = Arc::new(SessionQueue::new("main", executor.clone()));
    let mut events = queue.subscribe();

    let stream = queue.submit("stream", streaming());
    wait_until(|| executor.call_count() == 1).await;

    let outcome = queue.enqueue("follow-up", direct()).await.expect("inject");
    assert_eq!(outcome, InjectOutcome::Injected);
    assert_eq!(outcome.response(), None);
    assert_eq!(executor.injected(), vec!["follow-up"]);
    assert!(!queue.has_queued());

    executor.release(1);
    stream.wait().await.expect("stream completes");
    assert_eq!(executor.calls(), vec!["stream"]);

    let mut saw_direct = false;
    while let Ok(event) = events.try_recv() {
        saw_direct |= matches!(event, QueueEvent::DirectInject { active_id, .. } if active_id == 1);
    }
    assert!(saw_direct);
}

#[tokio::test]
async fn declined_stream_falls_back_to_queue() {
    let executor = FakeExecutor::gated();
    executor.open_stream(StreamAnswer::Decline);
    let queue = Arc::new(SessionQueue::new("main", executor.clone()));

    let stream = queue.submit("stream", streaming());
    wait_until(|| executor.call_count() == 1).await;

    executor.release(2);
    let outcome = queue.enqueue("follow-up", direct()).await.expect("queued");
    assert_eq!(outcome, InjectOutcome::Completed("done:follow-up".to_owned()));
    stream.wait().await.expect("stream");
    assert_eq!(executor.calls(), vec!["stream", "follow-up"]);
    assert!(executor.injected().is_empty());
}

#[tokio::test]
async fn failing_stream_falls_back_to_queue() {
    let executor = FakeExecutor::gated();
    executor.open_stream(StreamAnswer::Fail);
    let queue = Arc::new(SessionQueue::new("main", executor.clone()));

    let stream = queue.submit("stream", streaming());
    wait_until(|| executor.call_count() == 1).await;

    executor.release(2);
    let outcome = queue.enqueue("follow-up", direct()).await.expect("queued");
    assert_eq!(outcome.response(), Some("done:follow-up"));
    stream.wait().await.expect("stream");
}

#[tokio::test]
async fn non_streaming_execution_is_never_injected_into() {
    let executor = FakeExecutor::gated();
    executor.open_stream(StreamAnswer::Accept);
    let queue = Arc::new(SessionQueue::new("main", executor.clone()));

    let plain = queue.submit("plain", InjectOptions::default());
    wait_until(|| executor.call_count() == 1).await;

    executor.release(2);
    let outcome = queue.enqueue("follow-up", direct()).await.expect("queued");
    assert!(matches!(outcome, InjectOutcome::Completed(_)));
    plain.wait().await.expect("plain");
    assert!(executor.injected().is_empty());
}

#[tokio::test]
async fn queued_items_block_direct_injection() {
    let executor = FakeExecutor::gated();
    executor.open_stream(StreamAnswer::Accept);
    let queue = Arc::new(SessionQueue::new("main", executor.clone()));

    let stream = queue.submit("stream", streaming());
    wait_until(|| executor.call_count() == 1).await;
    let waiting = queue.submit("waiting", InjectOptions::default());

    executor.release(3);
    let outcome = queue.enqueue("follow-up", direct()).await.expect("queued");
    assert!(matches!(outcome, InjectOutcome::Completed(_)));
    stream.wait().await.expect("stream");
    waiting.wait().await.expect("waiting");
    assert!(executor.injected().is_empty());
    assert_eq!(executor.calls(), vec!["stream", "waiting", "follow-up"]);
}

#[tokio::test]
async fn caller_must_opt_in() {
    let executor = FakeExecutor::gated();
    executor.open_stream(StreamAnswer::Accept);
    let queue = Arc::new(SessionQueue::new("main", executor.clone()));

    let stream = queue.submit("stream", streaming());
    wait_until(|| executor.call_count() == 1).await;

    executor.release(2);
    let outcome = queue
        .enqueue("follow-up", InjectOptions::default())
        .await
        .expect("queued");
    assert!(matches!(outcome, InjectOutcome::Completed(_)));
    stream.wait().await.expect("stream");
    assert!(executor.injected().is_empty());
}
