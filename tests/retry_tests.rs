#![allow(clippy::unwrap_used)]
#![allow(clippy::clone_on_ref_ptr)]
#![allow(clippy::expect_used)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use workloom::runtime::{ActivityRegistry, WorkflowRegistry};
use workloom::{
    AppError, EventKind, RetryPolicy, Runtime, WorkflowClient, WorkflowDefinition, WorkflowStatus,
};
mod common;

fn retrying_workflow(policy: RetryPolicy) -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register(WorkflowDefinition::function(
            "caller",
            move |ctx, input: String| {
                let policy = policy.clone();
                async move { ctx.activity_with_retry("target", input, &policy).await }
            },
        ))
        .build()
}

fn flaky_activities(fail_first: u32) -> (ActivityRegistry, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    let registry = ActivityRegistry::builder()
        .register("target", move |_ctx, _input: String| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= fail_first {
                    Err(AppError::new("io", format!("transient failure #{n}")))
                } else {
                    Ok(format!("ok after {n}"))
                }
            }
        })
        .build();
    (registry, seen)
}

// Two transient failures, then success: every attempt is history, the
// backoff delays are durable timers, and the workflow sees only the final
// result.
#[tokio::test]
async fn transient_failures_are_retried_to_success() {
    let store = common::memory_store();
    let policy = RetryPolicy::fixed(Duration::from_millis(10)).with_maximum_attempts(5);
    let (activities, calls) = flaky_activities(2);
    let rt = Runtime::start_with_store(store.clone(), retrying_workflow(policy), activities).await;
    let client = WorkflowClient::new(store.clone());

    client.start_workflow("wf-retry", "caller", "").await.unwrap();
    let status = client
        .wait_for_completion("wf-retry", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        WorkflowStatus::Completed {
            output: "ok after 3".to_string()
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let history = client.read_history("wf-retry").await.unwrap();
    let attempts: Vec<u32> = history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ActivityScheduled { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    let failures = common::count_events(&history, |k| matches!(k, EventKind::ActivityFailed { .. }));
    let successes = common::count_events(&history, |k| {
        matches!(k, EventKind::ActivityCompleted { .. })
    });
    assert_eq!(failures, 2);
    assert_eq!(successes, 1);
    // One durable backoff timer per failed attempt, at the policy's delay.
    let backoff_delays: Vec<u64> = history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::TimerStarted { delay_ms } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(backoff_delays, vec![10, 10]);

    rt.shutdown().await;
}

// Exhausting the attempt budget surfaces the last attempt's error.
#[tokio::test]
async fn exhausted_retries_fail_the_workflow() {
    let store = common::memory_store();
    let policy = RetryPolicy::fixed(Duration::from_millis(5)).with_maximum_attempts(2);
    let (activities, calls) = flaky_activities(u32::MAX);
    let rt = Runtime::start_with_store(store.clone(), retrying_workflow(policy), activities).await;
    let client = WorkflowClient::new(store.clone());

    client.start_workflow("wf-exhaust", "caller", "").await.unwrap();
    let status = client
        .wait_for_completion("wf-exhaust", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        WorkflowStatus::Failed { error } => {
            assert_eq!(error.kind(), "io");
            assert!(error.to_string().contains("transient failure #2"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    rt.shutdown().await;
}

// A failure kind on the policy's non-retryable list stops after one attempt
// even with budget left.
#[tokio::test]
async fn non_retryable_kind_short_circuits() {
    let store = common::memory_store();
    let policy = RetryPolicy::fixed(Duration::from_millis(5))
        .with_maximum_attempts(5)
        .with_non_retryable("insufficient_funds");
    let workflows = retrying_workflow(policy);
    let activities = ActivityRegistry::builder()
        .register("target", |_ctx, _input: String| async move {
            Err::<String, _>(AppError::new("insufficient_funds", "balance too low"))
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), workflows, activities).await;
    let client = WorkflowClient::new(store.clone());

    client.start_workflow("wf-funds", "caller", "").await.unwrap();
    let status = client
        .wait_for_completion("wf-funds", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        WorkflowStatus::Failed { error } => assert_eq!(error.kind(), "insufficient_funds"),
        other => panic!("expected failure, got {other:?}"),
    }

    let history = client.read_history("wf-funds").await.unwrap();
    let schedules = common::count_events(&history, |k| {
        matches!(k, EventKind::ActivityScheduled { .. })
    });
    assert_eq!(schedules, 1);

    rt.shutdown().await;
}

// An error flagged non-retryable by the activity itself overrides a
// permissive policy.
#[tokio::test]
async fn non_retryable_flag_overrides_policy() {
    let store = common::memory_store();
    let policy = RetryPolicy::fixed(Duration::from_millis(5)).with_maximum_attempts(10);
    let workflows = retrying_workflow(policy);
    let activities = ActivityRegistry::builder()
        .register("target", |_ctx, _input: String| async move {
            Err::<String, _>(AppError::non_retryable("validation", "malformed request"))
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), workflows, activities).await;
    let client = WorkflowClient::new(store.clone());

    client.start_workflow("wf-flag", "caller", "").await.unwrap();
    let status = client
        .wait_for_completion("wf-flag", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        WorkflowStatus::Failed { error } => assert_eq!(error.kind(), "validation"),
        other => panic!("expected failure, got {other:?}"),
    }

    let history = client.read_history("wf-flag").await.unwrap();
    let schedules = common::count_events(&history, |k| {
        matches!(k, EventKind::ActivityScheduled { .. })
    });
    assert_eq!(schedules, 1);

    rt.shutdown().await;
}

// A per-attempt start-to-close bound races each attempt against a durable
// timer; the losing attempt is recorded as a timeout.
#[tokio::test]
async fn per_attempt_timeout_bounds_a_stuck_activity() {
    let store = common::memory_store();
    let policy = RetryPolicy::no_retry().with_timeout(Duration::from_millis(60));
    let workflows = retrying_workflow(policy);
    let activities = ActivityRegistry::builder()
        .register("target", |_ctx, _input: String| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok("too late".to_string())
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), workflows, activities).await;
    let client = WorkflowClient::new(store.clone());

    client.start_workflow("wf-stuck", "caller", "").await.unwrap();
    let status = client
        .wait_for_completion("wf-stuck", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, WorkflowStatus::TimedOut);

    let history = client.read_history("wf-stuck").await.unwrap();
    let schedules = common::count_events(&history, |k| {
        matches!(k, EventKind::ActivityScheduled { .. })
    });
    assert_eq!(schedules, 1);
    assert!(history
        .iter()
        .any(|e| matches!(&e.kind, EventKind::TimerStarted { delay_ms: 60 })));

    rt.shutdown().await;
}
