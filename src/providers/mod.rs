//! Storage abstraction: append-only event log, work queues, response slots.
//!
//! A [`Provider`] owns everything durable: per-run histories, the three
//! work queues (workflow, worker, timer), and one-shot response slots for
//! query and update callers. Dispatchers drive the queues with peek-lock
//! semantics: a fetched item stays invisible while locked, and either an
//! ack removes it together with its effects in one atomic step, or an
//! abandon (or lock expiry) makes it visible again with its delivery
//! attempt count bumped. Crash recovery falls out of that contract: a
//! dispatcher that dies mid-item loses the lock, not the item.
//!
//! Queue placement: `ActivityExecute` rides the worker queue,
//! `TimerSchedule` rides the timer queue, everything else rides the
//! workflow queue addressed by workflow id.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Event, WorkflowError};

pub mod error;
pub mod fs;
pub mod in_memory;

pub use error::ProviderError;
pub use fs::FsProvider;
pub use in_memory::InMemoryProvider;

/// A unit of queued work. Serialized as JSON by the bundled providers.
///
/// Providers deduplicate by value: enqueueing an item equal to one already
/// pending in the same queue is a no-op. Non-atomic enqueues around an ack
/// stay harmless under redelivery because of this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkItem {
    /// Begin run 1 of a workflow.
    StartWorkflow {
        workflow_id: String,
        name: String,
        version: Option<String>,
        input: String,
        timeout_ms: Option<u64>,
    },
    /// Close run N, open run N+1 with fresh input.
    ContinueAsNew {
        workflow_id: String,
        name: String,
        version: Option<String>,
        input: String,
    },
    /// One activity attempt, addressed back by schedule event id.
    ActivityExecute {
        workflow_id: String,
        run_id: u64,
        event_id: u64,
        name: String,
        input: String,
        attempt: u32,
    },
    ActivityCompleted {
        workflow_id: String,
        run_id: u64,
        event_id: u64,
        result: String,
    },
    ActivityFailed {
        workflow_id: String,
        run_id: u64,
        event_id: u64,
        error: WorkflowError,
    },
    /// Pending timer; the timer dispatcher turns it into `TimerFired`
    /// with delayed visibility.
    TimerSchedule {
        workflow_id: String,
        run_id: u64,
        event_id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        workflow_id: String,
        run_id: u64,
        event_id: u64,
        fire_at_ms: u64,
    },
    SignalWorkflow {
        workflow_id: String,
        name: String,
        input: String,
    },
    UpdateRequest {
        workflow_id: String,
        update_id: String,
        name: String,
        input: String,
    },
    QueryRequest {
        workflow_id: String,
        query_id: String,
        name: String,
        input: String,
    },
    CancelWorkflow {
        workflow_id: String,
        reason: String,
    },
    /// Fires when a run's execution timeout elapses; enqueued with delayed
    /// visibility at start.
    ExecutionTimeout {
        workflow_id: String,
        run_id: u64,
    },
}

impl WorkItem {
    /// The workflow this item addresses. Providers group workflow-queue
    /// messages by this key.
    pub fn workflow_id(&self) -> &str {
        match self {
            WorkItem::StartWorkflow { workflow_id, .. }
            | WorkItem::ContinueAsNew { workflow_id, .. }
            | WorkItem::ActivityExecute { workflow_id, .. }
            | WorkItem::ActivityCompleted { workflow_id, .. }
            | WorkItem::ActivityFailed { workflow_id, .. }
            | WorkItem::TimerSchedule { workflow_id, .. }
            | WorkItem::TimerFired { workflow_id, .. }
            | WorkItem::SignalWorkflow { workflow_id, .. }
            | WorkItem::UpdateRequest { workflow_id, .. }
            | WorkItem::QueryRequest { workflow_id, .. }
            | WorkItem::CancelWorkflow { workflow_id, .. }
            | WorkItem::ExecutionTimeout { workflow_id, .. } => workflow_id,
        }
    }
}

/// One locked batch from the workflow queue: every visible message for a
/// single workflow, plus the latest run's history as of the fetch.
#[derive(Debug, Clone)]
pub struct WorkflowItem {
    pub workflow_id: String,
    /// Latest run id at fetch time; 0 when no run exists yet.
    pub run_id: u64,
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
    /// Highest delivery attempt among the batched messages, 1-based.
    pub attempt_count: u32,
}

/// Durable storage for histories, queues, and response slots.
///
/// Implementations must keep `ack_workflow_item` atomic: the history
/// delta, the enqueued items, the consumed messages, and the lock release
/// commit together or not at all. Everything the runtime guarantees about
/// crash recovery leans on that one method.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Lock and return the next workflow with visible messages, batching
    /// all of its visible messages under one lock token. The lock expires
    /// after `lock_timeout` unless acked, abandoned, or renewed by a
    /// subsequent fetch cycle.
    async fn fetch_workflow_item(&self, lock_timeout: Duration)
        -> Result<Option<WorkflowItem>, ProviderError>;

    /// Atomically commit a turn: append `history_delta` to the run's log,
    /// enqueue worker, timer, and workflow items, delete the consumed
    /// messages, and release the lock.
    ///
    /// `run_id` addresses the run the delta belongs to; a continue-as-new
    /// turn acks against the closing run while its `workflow_items` carry
    /// the successor start message.
    async fn ack_workflow_item(
        &self,
        lock_token: &str,
        run_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        workflow_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError>;

    /// Release the lock without consuming the messages. With a delay, the
    /// messages stay invisible until the delay elapses. Delivery attempt
    /// counts increase by one.
    async fn abandon_workflow_item(
        &self,
        lock_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError>;

    /// Enqueue one item onto the workflow queue, optionally invisible for
    /// `delay`. Used by the client and by the runtime for deferred
    /// redelivery (execution timeouts, postponed updates).
    async fn enqueue_workflow_work(
        &self,
        item: WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError>;

    /// Peek-lock the next visible worker-queue item.
    async fn fetch_work_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Atomically remove the locked worker item and enqueue its completion
    /// onto the workflow queue.
    async fn ack_work_item(&self, token: &str, completion: WorkItem) -> Result<(), ProviderError>;

    /// Extend the lock on an in-flight worker item.
    async fn renew_work_lock(&self, token: &str, extend_for: Duration) -> Result<(), ProviderError>;

    /// Peek-lock the next visible timer-queue item.
    async fn fetch_timer_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Remove a locked timer item. The fired message is enqueued
    /// separately with delayed visibility before this ack; the workflow
    /// queue's deduplication absorbs the crash window between the two.
    async fn ack_timer_item(&self, token: &str) -> Result<(), ProviderError>;

    /// Read the latest run's history; empty when the workflow is unknown.
    async fn read(&self, workflow_id: &str) -> Result<Vec<Event>, ProviderError>;

    /// Read one run's history.
    async fn read_run(&self, workflow_id: &str, run_id: u64) -> Result<Vec<Event>, ProviderError>;

    /// Read one run's history from an event id onward. Pollers that already
    /// hold a prefix restart here instead of rereading the whole run.
    async fn read_run_from(
        &self,
        workflow_id: &str,
        run_id: u64,
        from_event_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        Ok(self
            .read_run(workflow_id, run_id)
            .await?
            .into_iter()
            .filter(|e| e.event_id >= from_event_id)
            .collect())
    }

    /// Append events to one run's log, creating the run when absent.
    /// `ack_workflow_item` is the runtime's append path; this one serves
    /// seeding and recovery tooling.
    async fn append_run(
        &self,
        workflow_id: &str,
        run_id: u64,
        events: Vec<Event>,
    ) -> Result<(), ProviderError>;

    /// Highest run id for the workflow, if any run exists.
    async fn latest_run(&self, workflow_id: &str) -> Result<Option<u64>, ProviderError>;

    async fn list_workflows(&self) -> Result<Vec<String>, ProviderError>;

    /// Store a one-shot response payload under a request id.
    async fn put_response(&self, request_id: &str, payload: String) -> Result<(), ProviderError>;

    /// Take a response if present, removing it.
    async fn take_response(&self, request_id: &str) -> Result<Option<String>, ProviderError>;
}
