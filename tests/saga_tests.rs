#![allow(clippy::unwrap_used)]
#![allow(clippy::clone_on_ref_ptr)]
#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use workloom::runtime::{ActivityRegistry, WorkflowRegistry};
use workloom::{
    AppError, Compensations, EventKind, RetryPolicy, Runtime, WorkflowClient, WorkflowDefinition,
    WorkflowStatus,
};
mod common;

fn trip_registry() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register(WorkflowDefinition::function(
            "trip",
            |ctx, input: String| async move {
                let mut comp = Compensations::new();
                let car = ctx.activity("reserve_car", input.as_str()).await?;
                comp.add_with_policy("release_car", car.clone(), RetryPolicy::no_retry());
                let hotel = ctx.activity("reserve_hotel", input.as_str()).await?;
                comp.add_with_policy("release_hotel", hotel.clone(), RetryPolicy::no_retry());
                match ctx.activity("book_flight", input.as_str()).await {
                    Ok(flight) => Ok(format!("booked {car}, {hotel}, {flight}")),
                    Err(err) => {
                        comp.run(&ctx).await;
                        Err(err)
                    }
                }
            },
        ))
        .build()
}

fn trip_activities(release_hotel_fails: bool) -> (ActivityRegistry, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let hotel_log = log.clone();
    let car_log = log.clone();
    let registry = ActivityRegistry::builder()
        .register("reserve_car", |_ctx, _input: String| async move {
            Ok("car-9".to_string())
        })
        .register("reserve_hotel", |_ctx, _input: String| async move {
            Ok("hotel-2".to_string())
        })
        .register("book_flight", |_ctx, input: String| async move {
            if input == "storm" {
                Err(AppError::non_retryable("no_seats", "flight is full"))
            } else {
                Ok("flight-1".to_string())
            }
        })
        .register("release_hotel", move |_ctx, input: String| {
            let log = hotel_log.clone();
            async move {
                log.lock().unwrap().push(format!("release_hotel:{input}"));
                if release_hotel_fails {
                    Err(AppError::non_retryable("gone", "already released"))
                } else {
                    Ok(String::new())
                }
            }
        })
        .register("release_car", move |_ctx, input: String| {
            let log = car_log.clone();
            async move {
                log.lock().unwrap().push(format!("release_car:{input}"));
                Ok(String::new())
            }
        })
        .build();
    (registry, log)
}

// The flight fails, so the reservations unwind newest first and the run
// surfaces the original booking error.
#[tokio::test]
async fn failed_step_unwinds_in_reverse_order() {
    let store = common::memory_store();
    let (activities, log) = trip_activities(false);
    let rt = Runtime::start_with_store(store.clone(), trip_registry(), activities).await;
    let client = WorkflowClient::new(store.clone());

    client.start_workflow("wf-trip", "trip", "storm").await.unwrap();
    let status = client
        .wait_for_completion("wf-trip", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        WorkflowStatus::Failed { error } => assert_eq!(error.kind(), "no_seats"),
        other => panic!("expected booking failure, got {other:?}"),
    }

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "release_hotel:hotel-2".to_string(),
            "release_car:car-9".to_string()
        ]
    );

    // Compensations are ordinary recorded activities.
    let history = client.read_history("wf-trip").await.unwrap();
    let hotel_pos = history
        .iter()
        .position(|e| matches!(&e.kind, EventKind::ActivityScheduled { name, .. } if name == "release_hotel"))
        .unwrap();
    let car_pos = history
        .iter()
        .position(|e| matches!(&e.kind, EventKind::ActivityScheduled { name, .. } if name == "release_car"))
        .unwrap();
    assert!(hotel_pos < car_pos);

    rt.shutdown().await;
}

// A clean booking runs no compensations at all.
#[tokio::test]
async fn successful_trip_skips_compensation() {
    let store = common::memory_store();
    let (activities, log) = trip_activities(false);
    let rt = Runtime::start_with_store(store.clone(), trip_registry(), activities).await;
    let client = WorkflowClient::new(store.clone());

    client.start_workflow("wf-trip-2", "trip", "sunny").await.unwrap();
    let status = client
        .wait_for_completion("wf-trip-2", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        WorkflowStatus::Completed {
            output: "booked car-9, hotel-2, flight-1".to_string()
        }
    );
    assert!(log.lock().unwrap().is_empty());

    rt.shutdown().await;
}

// One compensation failing does not stop the remaining steps from running.
#[tokio::test]
async fn failed_compensation_does_not_block_the_rest() {
    let store = common::memory_store();
    let (activities, log) = trip_activities(true);
    let rt = Runtime::start_with_store(store.clone(), trip_registry(), activities).await;
    let client = WorkflowClient::new(store.clone());

    client.start_workflow("wf-trip-3", "trip", "storm").await.unwrap();
    let status = client
        .wait_for_completion("wf-trip-3", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        WorkflowStatus::Failed { error } => assert_eq!(error.kind(), "no_seats"),
        other => panic!("expected booking failure, got {other:?}"),
    }

    let ran = log.lock().unwrap().clone();
    assert_eq!(ran.len(), 2);
    assert!(ran[0].starts_with("release_hotel"));
    assert!(ran[1].starts_with("release_car"));

    rt.shutdown().await;
}
