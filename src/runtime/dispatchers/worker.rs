//! Worker dispatcher: executes activities at-least-once.
//!
//! Each activity runs under a peek lock that a background task renews for
//! as long as the invocation lasts. The completion commits atomically with
//! the queue removal through `ack_work_item`; a crash before that ack means
//! the lock expires and the attempt redelivers, which is why activities
//! must tolerate re-execution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::providers::{Provider, WorkItem};
use crate::runtime::Runtime;
use crate::{ActivityContext, WorkflowError};

impl Runtime {
    pub(in crate::runtime) fn start_worker_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.worker_concurrency;
        tokio::spawn(async move {
            let mut worker_handles = Vec::new();
            for worker_idx in 0..concurrency {
                let rt = self.clone();
                let worker_id = format!("work-{}-{}", worker_idx, rt.runtime_id);
                let handle = tokio::spawn(async move {
                    loop {
                        if rt.is_shutdown() {
                            break;
                        }
                        match rt.store.fetch_work_item(rt.lock_timeout()).await {
                            Ok(Some((item, token))) => rt.run_activity(item, token, &worker_id).await,
                            Ok(None) => {
                                tokio::time::sleep(Duration::from_millis(
                                    rt.options.dispatcher_idle_sleep_ms,
                                ))
                                .await
                            }
                            Err(e) => {
                                warn!(
                                    target: "workloom::runtime::worker",
                                    worker_id = %worker_id,
                                    error = %e,
                                    "worker fetch failed"
                                );
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                });
                worker_handles.push(handle);
            }
            for handle in worker_handles {
                let _ = handle.await;
            }
        })
    }

    async fn run_activity(self: &Arc<Self>, item: WorkItem, token: String, worker_id: &str) {
        let (workflow_id, run_id, event_id, name, input, attempt) = match item {
            WorkItem::ActivityExecute {
                workflow_id,
                run_id,
                event_id,
                name,
                input,
                attempt,
            } => (workflow_id, run_id, event_id, name, input, attempt),
            other => {
                error!(?other, "unexpected item in worker queue; state corruption");
                panic!("unexpected item in worker queue");
            }
        };

        let renewal = spawn_lock_renewal_task(
            self.store.clone(),
            token.clone(),
            self.options.lock_timeout_ms,
            self.options.lock_renewal_buffer_ms,
            self.shutdown_flag.clone(),
        );

        debug!(
            target: "workloom::runtime::worker",
            workflow_id = %workflow_id,
            run_id,
            event_id,
            activity_name = %name,
            attempt,
            worker_id = %worker_id,
            "activity started"
        );
        let start_time = std::time::Instant::now();

        let ctx = ActivityContext {
            workflow_id: workflow_id.clone(),
            run_id,
            activity_name: name.clone(),
            event_id,
            attempt,
        };
        let completion = match self.activities.resolve_handler(&name) {
            Some((_, handler)) => match handler.invoke(ctx, input).await {
                Ok(result) => {
                    debug!(
                        target: "workloom::runtime::worker",
                        workflow_id = %workflow_id,
                        run_id,
                        event_id,
                        activity_name = %name,
                        worker_id = %worker_id,
                        outcome = "success",
                        duration_ms = start_time.elapsed().as_millis() as u64,
                        result_size = result.len(),
                        "activity completed"
                    );
                    WorkItem::ActivityCompleted {
                        workflow_id: workflow_id.clone(),
                        run_id,
                        event_id,
                        result,
                    }
                }
                Err(error) => {
                    warn!(
                        target: "workloom::runtime::worker",
                        workflow_id = %workflow_id,
                        run_id,
                        event_id,
                        activity_name = %name,
                        attempt,
                        worker_id = %worker_id,
                        outcome = "app_error",
                        duration_ms = start_time.elapsed().as_millis() as u64,
                        error = %error,
                        "activity failed"
                    );
                    WorkItem::ActivityFailed {
                        workflow_id: workflow_id.clone(),
                        run_id,
                        event_id,
                        error: WorkflowError::Application(error),
                    }
                }
            },
            None => {
                error!(
                    target: "workloom::runtime::worker",
                    workflow_id = %workflow_id,
                    run_id,
                    event_id,
                    activity_name = %name,
                    worker_id = %worker_id,
                    outcome = "config_error",
                    "activity failed (unregistered)"
                );
                WorkItem::ActivityFailed {
                    workflow_id: workflow_id.clone(),
                    run_id,
                    event_id,
                    error: WorkflowError::configuration(format!(
                        "activity '{name}' is not registered"
                    )),
                }
            }
        };

        renewal.abort();

        if let Err(e) = self.store.ack_work_item(&token, completion).await {
            warn!(
                target: "workloom::runtime::worker",
                workflow_id = %workflow_id,
                run_id,
                event_id,
                worker_id = %worker_id,
                error = %e,
                "activity ack failed"
            );
        }
    }
}

/// Renewal cadence for an activity's peek lock. Generous timeouts renew a
/// buffer ahead of expiry; short ones renew at half the timeout.
fn calculate_renewal_interval_ms(lock_timeout_ms: u64, buffer_ms: u64) -> u64 {
    if lock_timeout_ms >= 15_000 {
        lock_timeout_ms.saturating_sub(buffer_ms).max(1_000)
    } else {
        ((lock_timeout_ms as f64) * 0.5).ceil() as u64
    }
}

/// Keep an in-flight activity's lock alive until the returned handle is
/// aborted, renewal fails (lock already gone), or shutdown is flagged.
fn spawn_lock_renewal_task(
    store: Arc<dyn Provider>,
    token: String,
    lock_timeout_ms: u64,
    buffer_ms: u64,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let renewal_interval_ms = calculate_renewal_interval_ms(lock_timeout_ms, buffer_ms);

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(renewal_interval_ms));
        // The first tick completes immediately; skip it.
        interval.tick().await;

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match store
                .renew_work_lock(&token, Duration::from_millis(lock_timeout_ms))
                .await
            {
                Ok(()) => {
                    trace!(
                        target: "workloom::runtime::worker",
                        lock_token = %token,
                        "lock renewed"
                    );
                }
                Err(e) => {
                    debug!(
                        target: "workloom::runtime::worker",
                        lock_token = %token,
                        error = %e,
                        "lock renewal failed (item likely acked or abandoned)"
                    );
                    break;
                }
            }
        }
    })
}
