//! Workflow dispatcher: fetch a locked batch, process it as one turn.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::runtime::Runtime;

impl Runtime {
    pub(in crate::runtime) fn start_workflow_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.workflow_concurrency;
        tokio::spawn(async move {
            let mut worker_handles = Vec::new();
            for worker_idx in 0..concurrency {
                let rt = self.clone();
                let worker_id = format!("wf-{}-{}", worker_idx, rt.runtime_id);
                let handle = tokio::spawn(async move {
                    loop {
                        if rt.is_shutdown() {
                            break;
                        }
                        match rt.store.fetch_workflow_item(rt.lock_timeout()).await {
                            Ok(Some(item)) => rt.process_workflow_item(item, &worker_id).await,
                            Ok(None) => {
                                tokio::time::sleep(Duration::from_millis(
                                    rt.options.dispatcher_idle_sleep_ms,
                                ))
                                .await
                            }
                            Err(e) => {
                                warn!(
                                    target: "workloom::runtime",
                                    worker_id = %worker_id,
                                    error = %e,
                                    "workflow fetch failed"
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
}
