//! Runtime: registries plus the dispatcher loops that pump the three
//! provider queues.
//!
//! Three loops run per runtime. The workflow dispatcher fetches a locked
//! message batch for one workflow, runs a [`turn::WorkflowTurn`] over it,
//! and commits the outcome atomically. The worker dispatcher executes
//! activities at-least-once under a renewable peek lock. The timer
//! dispatcher converts due timer schedules into workflow messages. All
//! three stop when [`Runtime::shutdown`] is called.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::providers::{InMemoryProvider, Provider, WorkItem};

mod dispatchers;
mod execution;
pub mod registry;
pub(crate) mod turn;

pub use registry::{
    ActivityHandler, ActivityRegistry, ActivityRegistryBuilder, FnActivity, VersionPolicy,
    WorkflowRegistry, WorkflowRegistryBuilder,
};

/// Tuning knobs for the dispatcher loops. Defaults suit tests and small
/// deployments; production hosts mostly raise the concurrency numbers.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Concurrent workflow-turn processors.
    pub workflow_concurrency: usize,
    /// Concurrent activity executors.
    pub worker_concurrency: usize,
    /// Sleep between polls when a queue comes up empty.
    pub dispatcher_idle_sleep_ms: u64,
    /// Peek-lock duration for fetched items.
    pub lock_timeout_ms: u64,
    /// Headroom subtracted from the lock timeout when scheduling lock
    /// renewal for long-running activities.
    pub lock_renewal_buffer_ms: u64,
    /// Redelivery delay for items abandoned after a permanent commit error.
    pub abandon_delay_ms: u64,
    /// Redelivery delay for batches parked by a nondeterministic replay.
    pub suspended_retry_delay_ms: u64,
    /// Redelivery delay for updates deferred behind an in-flight one.
    pub deferred_update_delay_ms: u64,
    /// Deliveries after which a repeatedly crashing batch fails the run.
    pub max_delivery_attempts: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            workflow_concurrency: 2,
            worker_concurrency: 4,
            dispatcher_idle_sleep_ms: 10,
            lock_timeout_ms: 30_000,
            lock_renewal_buffer_ms: 10_000,
            abandon_delay_ms: 50,
            suspended_retry_delay_ms: 2_000,
            deferred_update_delay_ms: 25,
            max_delivery_attempts: 10,
        }
    }
}

/// A running engine instance: registries, a provider, and the dispatcher
/// tasks pumping it. Construct with [`Runtime::start`] or one of its
/// variants, hold the `Arc`, and call [`Runtime::shutdown`] when done.
pub struct Runtime {
    joins: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn Provider>,
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
    options: RuntimeOptions,
    /// Distinguishes this instance's dispatcher ids in logs when several
    /// runtimes share a process (common in tests).
    runtime_id: String,
    shutdown_flag: Arc<AtomicBool>,
    /// workflow_id -> divergence reason for runs parked by replay mismatch.
    /// Cleared when a later delivery of the batch replays cleanly.
    suspended: std::sync::Mutex<HashMap<String, String>>,
}

impl Runtime {
    /// Start against a fresh in-memory provider. State lives only as long
    /// as the process; suits tests and examples.
    pub async fn start(workflows: WorkflowRegistry, activities: ActivityRegistry) -> Arc<Self> {
        Self::start_with_store(Arc::new(InMemoryProvider::new()), workflows, activities).await
    }

    /// Start against an explicit provider with default options.
    pub async fn start_with_store(
        store: Arc<dyn Provider>,
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, workflows, activities, RuntimeOptions::default()).await
    }

    pub async fn start_with_options(
        store: Arc<dyn Provider>,
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Respect RUST_LOG; fall back to info. Ignore errors when the host
        // already installed a subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let runtime_id = format!(
            "{:x}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default()
        );

        let runtime = Arc::new(Self {
            joins: tokio::sync::Mutex::new(Vec::new()),
            store,
            workflows,
            activities,
            options,
            runtime_id,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            suspended: std::sync::Mutex::new(HashMap::new()),
        });

        let workflow_join = runtime.clone().start_workflow_dispatcher();
        let worker_join = runtime.clone().start_worker_dispatcher();
        let timer_join = runtime.clone().start_timer_dispatcher();
        {
            let mut joins = runtime.joins.lock().await;
            joins.push(workflow_join);
            joins.push(worker_join);
            joins.push(timer_join);
        }
        runtime
    }

    /// Stop the dispatcher loops. In-flight locked items are left to lock
    /// expiry and redelivery, which a restarted runtime picks up.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let mut joins = self.joins.lock().await;
        for join in joins.drain(..) {
            join.abort();
        }
    }

    /// Workflows currently parked by replay divergence, with the recorded
    /// reason. Entries clear themselves when a redelivery replays cleanly
    /// against fixed code.
    pub fn suspended_workflows(&self) -> Vec<(String, String)> {
        self.suspended
            .lock()
            .expect("suspended map mutex poisoned")
            .iter()
            .map(|(id, reason)| (id.clone(), reason.clone()))
            .collect()
    }

    pub fn store(&self) -> Arc<dyn Provider> {
        self.store.clone()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    pub(crate) fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.options.lock_timeout_ms)
    }
}

/// Short label for a work item, for log lines.
pub(crate) fn kind_of(item: &WorkItem) -> &'static str {
    match item {
        WorkItem::StartWorkflow { .. } => "StartWorkflow",
        WorkItem::ContinueAsNew { .. } => "ContinueAsNew",
        WorkItem::ActivityExecute { .. } => "ActivityExecute",
        WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
        WorkItem::ActivityFailed { .. } => "ActivityFailed",
        WorkItem::TimerSchedule { .. } => "TimerSchedule",
        WorkItem::TimerFired { .. } => "TimerFired",
        WorkItem::SignalWorkflow { .. } => "SignalWorkflow",
        WorkItem::UpdateRequest { .. } => "UpdateRequest",
        WorkItem::QueryRequest { .. } => "QueryRequest",
        WorkItem::CancelWorkflow { .. } => "CancelWorkflow",
        WorkItem::ExecutionTimeout { .. } => "ExecutionTimeout",
    }
}

/// Wall-clock milliseconds since the epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
