//! Timer dispatcher: converts due timer schedules into workflow messages.
//!
//! Each `TimerSchedule` becomes a `TimerFired` enqueued with delayed
//! visibility, so the provider holds the wait rather than this process.
//! The fired message is enqueued before the schedule is acked; a crash
//! between the two redelivers the schedule and the workflow queue's value
//! deduplication drops the second fire.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::providers::WorkItem;
use crate::runtime::{now_ms, Runtime};

impl Runtime {
    pub(in crate::runtime) fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_shutdown() {
                    break;
                }
                match self.store.fetch_timer_item(self.lock_timeout()).await {
                    Ok(Some((item, token))) => match item {
                        WorkItem::TimerSchedule {
                            workflow_id,
                            run_id,
                            event_id,
                            fire_at_ms,
                        } => {
                            let delay_ms = fire_at_ms.saturating_sub(now_ms());
                            debug!(
                                target: "workloom::runtime::timer",
                                workflow_id = %workflow_id,
                                run_id,
                                event_id,
                                delay_ms,
                                "arming timer"
                            );
                            let fired = WorkItem::TimerFired {
                                workflow_id,
                                run_id,
                                event_id,
                                fire_at_ms,
                            };
                            if let Err(e) = self
                                .store
                                .enqueue_workflow_work(fired, Some(Duration::from_millis(delay_ms)))
                                .await
                            {
                                // Leave the schedule locked; expiry redelivers it.
                                warn!(
                                    target: "workloom::runtime::timer",
                                    error = %e,
                                    "failed to enqueue timer fire"
                                );
                                continue;
                            }
                            if let Err(e) = self.store.ack_timer_item(&token).await {
                                warn!(
                                    target: "workloom::runtime::timer",
                                    error = %e,
                                    "timer ack failed"
                                );
                            }
                        }
                        other => {
                            error!(?other, "unexpected item in timer queue; state corruption");
                            panic!("unexpected item in timer queue");
                        }
                    },
                    Ok(None) => {
                        tokio::time::sleep(Duration::from_millis(
                            self.options.dispatcher_idle_sleep_ms,
                        ))
                        .await
                    }
                    Err(e) => {
                        warn!(
                            target: "workloom::runtime::timer",
                            error = %e,
                            "timer fetch failed"
                        );
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        })
    }
}
