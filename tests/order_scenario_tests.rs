#![allow(clippy::unwrap_used)]
#![allow(clippy::clone_on_ref_ptr)]
#![allow(clippy::expect_used)]

use std::time::Duration;

use workloom::runtime::{ActivityRegistry, WorkflowRegistry};
use workloom::{EventKind, Runtime, WorkflowClient, WorkflowDefinition, WorkflowStatus};
mod common;

#[derive(Default)]
struct Review {
    decided: bool,
    approved: bool,
}

// Human-in-the-loop approval: a decision signal races a review deadline.
fn order_registry() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register(
            WorkflowDefinition::new("order-approval", |_| Review::default())
                .run(|ctx, state, input| async move {
                    let wait = ctx
                        .wait_condition(&state, |r| r.decided, Some(Duration::from_millis(200)))
                        .await;
                    match wait {
                        Ok(()) => {}
                        Err(e) if e.is_timeout() => {
                            ctx.activity("record_expiry", input.as_str()).await?;
                            return Ok("auto-rejected".to_string());
                        }
                        Err(e) => return Err(e),
                    }
                    if !state.read(|r| r.approved) {
                        return Ok("declined".to_string());
                    }
                    workloom::wf_info!(ctx, order = %input, "approved, charging");
                    ctx.activity("charge", input.as_str()).await?;
                    let tracking = ctx.activity("ship", input.as_str()).await?;
                    Ok(format!("shipped:{tracking}"))
                })
                .on_signal("decision", |r: &mut Review, input| {
                    r.decided = true;
                    r.approved = input == "approve";
                    Ok(())
                }),
        )
        .build()
}

fn order_activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("charge", |_ctx, _input| async move { Ok("paid".to_string()) })
        .register("ship", |_ctx, input| async move { Ok(format!("track-{input}")) })
        .register("record_expiry", |_ctx, _input| async move { Ok("noted".to_string()) })
        .build()
}

// An approval signal before the deadline sends the order through charge and
// shipment.
#[tokio::test]
async fn approved_order_is_charged_and_shipped() {
    let store = common::memory_store();
    let rt = Runtime::start_with_store(store.clone(), order_registry(), order_activities()).await;
    let client = WorkflowClient::new(store.clone());

    client.start_workflow("wf-order-ok", "order-approval", "ord-9").await.unwrap();
    common::wait_for_history(&store, "wf-order-ok", 1, Duration::from_secs(5)).await;
    client.signal("wf-order-ok", "decision", "approve").await.unwrap();

    let status = client
        .wait_for_completion("wf-order-ok", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        WorkflowStatus::Completed {
            output: "shipped:track-ord-9".to_string()
        }
    );

    // Fulfillment only starts once the decision is in the history.
    let history = client.read_history("wf-order-ok").await.unwrap();
    let decision_pos = history
        .iter()
        .position(|e| matches!(&e.kind, EventKind::SignalReceived { name, .. } if name == "decision"))
        .unwrap();
    let charge_pos = history
        .iter()
        .position(|e| matches!(&e.kind, EventKind::ActivityScheduled { name, .. } if name == "charge"))
        .unwrap();
    assert!(decision_pos < charge_pos);
    let completions =
        common::count_events(&history, |k| matches!(k, EventKind::ActivityCompleted { .. }));
    assert_eq!(completions, 2);

    rt.shutdown().await;
}

// A rejection completes the order without touching any fulfillment activity.
#[tokio::test]
async fn declined_order_skips_fulfillment() {
    let store = common::memory_store();
    let rt = Runtime::start_with_store(store.clone(), order_registry(), order_activities()).await;
    let client = WorkflowClient::new(store.clone());

    client.start_workflow("wf-order-no", "order-approval", "ord-4").await.unwrap();
    common::wait_for_history(&store, "wf-order-no", 1, Duration::from_secs(5)).await;
    client.signal("wf-order-no", "decision", "reject").await.unwrap();

    let status = client
        .wait_for_completion("wf-order-no", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        WorkflowStatus::Completed {
            output: "declined".to_string()
        }
    );

    let history = client.read_history("wf-order-no").await.unwrap();
    let scheduled =
        common::count_events(&history, |k| matches!(k, EventKind::ActivityScheduled { .. }));
    assert_eq!(scheduled, 0);

    rt.shutdown().await;
}

// No decision at all: the deadline timer wins the race and the order
// auto-rejects after recording the expiry.
#[tokio::test]
async fn unattended_order_auto_rejects_at_the_deadline() {
    let store = common::memory_store();
    let rt = Runtime::start_with_store(store.clone(), order_registry(), order_activities()).await;
    let client = WorkflowClient::new(store.clone());

    client.start_workflow("wf-order-idle", "order-approval", "ord-2").await.unwrap();
    let status = client
        .wait_for_completion("wf-order-idle", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        WorkflowStatus::Completed {
            output: "auto-rejected".to_string()
        }
    );

    let history = client.read_history("wf-order-idle").await.unwrap();
    assert!(history
        .iter()
        .any(|e| matches!(&e.kind, EventKind::TimerStarted { delay_ms: 200 })));
    let fired_pos = history
        .iter()
        .position(|e| matches!(&e.kind, EventKind::TimerFired { .. }))
        .unwrap();
    let expiry_pos = history
        .iter()
        .position(|e| matches!(&e.kind, EventKind::ActivityScheduled { name, .. } if name == "record_expiry"))
        .unwrap();
    assert!(fired_pos < expiry_pos);
    let charges = common::count_events(
        &history,
        |k| matches!(k, EventKind::ActivityScheduled { name, .. } if name == "charge"),
    );
    assert_eq!(charges, 0);

    rt.shutdown().await;
}
