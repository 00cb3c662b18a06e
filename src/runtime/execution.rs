//! Per-batch workflow processing: run selection, the turn itself, and the
//! atomic commit with retry.
//!
//! The workflow dispatcher hands each locked [`WorkflowItem`] to
//! [`Runtime::process_workflow_item`]. Everything a turn produces (history
//! delta, activity and timer items, a successor start, responses) commits
//! through one `ack_workflow_item` call so a crash either replays the whole
//! batch or none of it. Responses are delivered only after the ack lands;
//! a crash before that leaves the client polling until redelivery answers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::turn::{TurnResult, WorkflowTurn};
use super::{kind_of, now_ms, Runtime};
use crate::providers::{ProviderError, WorkItem, WorkflowItem};
use crate::{Command, Event, EventKind, UpdateOutcome, WorkflowError, INITIAL_EVENT_ID};

const ACK_MAX_ATTEMPTS: u32 = 5;

impl Runtime {
    pub(crate) async fn process_workflow_item(
        self: &Arc<Self>,
        item: WorkflowItem,
        worker_id: &str,
    ) {
        let WorkflowItem {
            workflow_id,
            run_id,
            history,
            messages,
            lock_token,
            attempt_count,
        } = item;
        let started = std::time::Instant::now();

        debug!(
            target: "workloom::runtime",
            worker_id,
            workflow_id = %workflow_id,
            run_id,
            messages = messages.len(),
            attempt_count,
            "processing workflow batch"
        );

        // A batch that keeps crashing its processor fails the run rather
        // than looping forever. Replay divergence is exempt: those batches
        // redeliver until the code is fixed.
        if attempt_count > self.options.max_delivery_attempts && !self.is_suspended(&workflow_id) {
            self.fail_as_poison(&workflow_id, run_id, &history, &messages, &lock_token, attempt_count)
                .await;
            return;
        }

        // Split out the control messages that decide which run this turn
        // addresses; everything else feeds the turn.
        let mut start_msg: Option<(String, Option<String>, String, Option<u64>)> = None;
        let mut can_msg: Option<(String, Option<String>, String)> = None;
        let mut timed_out = false;
        let mut turn_messages: Vec<WorkItem> = Vec::new();
        for msg in messages {
            match msg {
                WorkItem::StartWorkflow {
                    name,
                    version,
                    input,
                    timeout_ms,
                    ..
                } => {
                    if start_msg.is_some() || !history.is_empty() {
                        warn!(
                            target: "workloom::runtime",
                            workflow_id = %workflow_id,
                            "dropping duplicate start message"
                        );
                    } else {
                        start_msg = Some((name, version, input, timeout_ms));
                    }
                }
                WorkItem::ContinueAsNew {
                    name,
                    version,
                    input,
                    ..
                } => {
                    if can_msg.is_some() {
                        warn!(
                            target: "workloom::runtime",
                            workflow_id = %workflow_id,
                            "dropping duplicate continue-as-new message"
                        );
                    } else {
                        can_msg = Some((name, version, input));
                    }
                }
                WorkItem::ExecutionTimeout { run_id: timed_run, .. } => {
                    if timed_run == run_id && !history_is_terminal(&history) {
                        timed_out = true;
                    } else {
                        debug!(
                            target: "workloom::runtime",
                            workflow_id = %workflow_id,
                            timed_run,
                            "dropping stale execution timeout"
                        );
                    }
                }
                other => turn_messages.push(other),
            }
        }

        // An elapsed execution timeout closes the run without replaying it.
        if timed_out {
            let after_ms = run_timeout(&history).unwrap_or(0);
            warn!(
                target: "workloom::runtime",
                workflow_id = %workflow_id,
                run_id,
                after_ms,
                "workflow run timed out"
            );
            let next = next_event_id(&history);
            let delta = vec![Event::new(
                next,
                EventKind::WorkflowFailed {
                    error: WorkflowError::Timeout {
                        what: "workflow run".to_string(),
                        after_ms,
                    },
                },
            )];
            self.clear_suspension(&workflow_id);
            if self
                .ack_with_retry(&lock_token, run_id, delta, vec![], vec![], vec![])
                .await
                .is_ok()
            {
                self.fail_requests(&turn_messages, "workflow run timed out").await;
            }
            return;
        }

        // Pick the run and its handler. A fresh start carries its staging
        // data; an existing run pins the handler version recorded at start.
        let last_terminal = history_is_terminal(&history);
        let continued_as_new = matches!(
            history.last().map(|e| &e.kind),
            Some(EventKind::WorkflowContinuedAsNew { .. })
        );

        let fresh: Option<(String, Option<String>, String, Option<u64>)> =
            if let Some((name, version, input)) = can_msg {
                if continued_as_new {
                    // Successor inherits the predecessor's timeout bound,
                    // restarted for the new run.
                    Some((name, version, input, run_timeout(&history)))
                } else {
                    warn!(
                        target: "workloom::runtime",
                        workflow_id = %workflow_id,
                        "dropping continue-as-new for a run that did not continue"
                    );
                    None
                }
            } else {
                start_msg
            };

        let exec_run_id;
        let run_name;
        let handler;
        let mut turn;
        let mut pending_timeout: Option<u64> = None;

        match fresh {
            Some((name, version_req, input, timeout_ms)) => {
                // Run ids count from 1; `run_id` is 0 for a first start and
                // the predecessor's id for a continue-as-new successor.
                exec_run_id = run_id + 1;
                let resolved = match &version_req {
                    Some(raw) => match semver::Version::parse(raw) {
                        Ok(v) => self
                            .workflows
                            .resolve_handler_exact(&name, &v)
                            .map(|h| (v, h)),
                        Err(e) => {
                            self.fail_start(
                                &lock_token,
                                &workflow_id,
                                exec_run_id,
                                &name,
                                input,
                                format!("invalid version request '{raw}': {e}"),
                                &turn_messages,
                            )
                            .await;
                            return;
                        }
                    },
                    None => self.workflows.resolve_handler(&name),
                };
                let (version, h) = match resolved {
                    Some((v, h)) => (v, h),
                    None => {
                        let wanted = version_req.as_deref().unwrap_or("any");
                        self.fail_start(
                            &lock_token,
                            &workflow_id,
                            exec_run_id,
                            &name,
                            input,
                            format!("workflow '{name}' (version {wanted}) is not registered"),
                            &turn_messages,
                        )
                        .await;
                        return;
                    }
                };
                handler = h;
                turn = WorkflowTurn::new(workflow_id.clone(), exec_run_id, Vec::new());
                turn.stage_started(&name, &version.to_string(), input, now_ms(), timeout_ms);
                pending_timeout = timeout_ms;
                run_name = name;
            }
            None => {
                if history.is_empty() {
                    // Messages for a workflow that was never started.
                    warn!(
                        target: "workloom::runtime",
                        workflow_id = %workflow_id,
                        "dropping messages for unknown workflow"
                    );
                    self.fail_requests(&turn_messages, "workflow not found").await;
                    let _ = self
                        .ack_with_retry(&lock_token, run_id, vec![], vec![], vec![], vec![])
                        .await;
                    return;
                }

                let has_requests = turn_messages.iter().any(|m| {
                    matches!(
                        m,
                        WorkItem::QueryRequest { .. } | WorkItem::UpdateRequest { .. }
                    )
                });
                if last_terminal && !has_requests {
                    // Late completions and signals for a closed run.
                    for msg in &turn_messages {
                        warn!(
                            target: "workloom::runtime",
                            workflow_id = %workflow_id,
                            run_id,
                            kind = kind_of(msg),
                            "dropping message for completed workflow"
                        );
                    }
                    let _ = self
                        .ack_with_retry(&lock_token, run_id, vec![], vec![], vec![], vec![])
                        .await;
                    return;
                }

                let (name, version) = match pinned_start(&history) {
                    Some(pair) => pair,
                    None => {
                        // History not opened by a start event is corrupt.
                        self.suspend_batch(
                            &workflow_id,
                            "history does not begin with a start event".to_string(),
                            &lock_token,
                        )
                        .await;
                        return;
                    }
                };
                let resolved = semver::Version::parse(&version)
                    .ok()
                    .and_then(|v| self.workflows.resolve_handler_exact(&name, &v));
                let h = match resolved {
                    Some(h) => h,
                    None => {
                        let reason =
                            format!("pinned version {version} of workflow '{name}' is not registered");
                        if last_terminal {
                            // Closed run; answer the waiting requests instead
                            // of parking the workflow.
                            self.fail_requests(&turn_messages, &reason).await;
                            let _ = self
                                .ack_with_retry(&lock_token, run_id, vec![], vec![], vec![], vec![])
                                .await;
                        } else {
                            self.suspend_batch(&workflow_id, reason, &lock_token).await;
                        }
                        return;
                    }
                };
                handler = h;
                run_name = name;
                exec_run_id = run_id;
                turn = WorkflowTurn::new(workflow_id.clone(), exec_run_id, history);
            }
        }

        turn.prep_completions(turn_messages);
        let result = turn.execute(handler);

        if let TurnResult::Suspended(reason) = &result {
            self.suspend_batch(&workflow_id, reason.clone(), &lock_token).await;
            return;
        }
        self.clear_suspension(&workflow_id);

        let delta = turn.history_delta();
        let (worker_items, timer_items) =
            commands_to_items(&workflow_id, exec_run_id, turn.take_commands());
        let mut workflow_items = Vec::new();
        if let TurnResult::ContinuedAsNew { input } = &result {
            // The successor resolves its version afresh, so a policy change
            // or new registration takes effect at the continue boundary.
            workflow_items.push(WorkItem::ContinueAsNew {
                workflow_id: workflow_id.clone(),
                name: run_name.clone(),
                version: None,
                input: input.clone(),
            });
        }

        // Deferred updates and the execution timeout enqueue outside the
        // ack; value deduplication absorbs the crash window between them.
        for deferred in turn.take_deferred_updates() {
            if let Err(e) = self
                .store
                .enqueue_workflow_work(
                    deferred,
                    Some(Duration::from_millis(self.options.deferred_update_delay_ms)),
                )
                .await
            {
                warn!(
                    target: "workloom::runtime",
                    workflow_id = %workflow_id,
                    error = %e,
                    "failed to requeue deferred update"
                );
            }
        }
        if let Some(timeout_ms) = pending_timeout {
            if let Err(e) = self
                .store
                .enqueue_workflow_work(
                    WorkItem::ExecutionTimeout {
                        workflow_id: workflow_id.clone(),
                        run_id: exec_run_id,
                    },
                    Some(Duration::from_millis(timeout_ms)),
                )
                .await
            {
                warn!(
                    target: "workloom::runtime",
                    workflow_id = %workflow_id,
                    error = %e,
                    "failed to schedule execution timeout"
                );
            }
        }

        if self
            .ack_with_retry(
                &lock_token,
                exec_run_id,
                delta,
                worker_items,
                timer_items,
                workflow_items,
            )
            .await
            .is_err()
        {
            return;
        }
        self.deliver_responses(turn.take_responses()).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            TurnResult::Completed(_) => {
                debug!(
                    target: "workloom::runtime",
                    workflow_id = %workflow_id,
                    run_id = exec_run_id,
                    elapsed_ms,
                    "workflow completed"
                );
            }
            TurnResult::Failed(err) => {
                if matches!(err, WorkflowError::Configuration { .. }) {
                    error!(
                        target: "workloom::runtime",
                        workflow_id = %workflow_id,
                        run_id = exec_run_id,
                        error = %err,
                        "workflow failed"
                    );
                } else {
                    warn!(
                        target: "workloom::runtime",
                        workflow_id = %workflow_id,
                        run_id = exec_run_id,
                        elapsed_ms,
                        error = %err,
                        "workflow failed"
                    );
                }
            }
            TurnResult::ContinuedAsNew { .. } => {
                debug!(
                    target: "workloom::runtime",
                    workflow_id = %workflow_id,
                    run_id = exec_run_id,
                    "workflow continued as new"
                );
            }
            TurnResult::Continue => {
                debug!(
                    target: "workloom::runtime",
                    workflow_id = %workflow_id,
                    run_id = exec_run_id,
                    elapsed_ms,
                    "turn committed"
                );
            }
            TurnResult::Suspended(_) => {}
        }
    }

    /// Commit a turn, retrying transient provider failures with backoff.
    /// On exhaustion or a permanent failure the batch is abandoned for a
    /// delayed redelivery.
    async fn ack_with_retry(
        &self,
        lock_token: &str,
        run_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        workflow_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut attempts: u32 = 0;
        loop {
            match self
                .store
                .ack_workflow_item(
                    lock_token,
                    run_id,
                    history_delta.clone(),
                    worker_items.clone(),
                    timer_items.clone(),
                    workflow_items.clone(),
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempts < ACK_MAX_ATTEMPTS => {
                    let backoff_ms = 10 * 2u64.pow(attempts);
                    warn!(
                        target: "workloom::runtime",
                        run_id,
                        attempts,
                        backoff_ms,
                        error = %e,
                        "retrying turn commit"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(
                        target: "workloom::runtime",
                        run_id,
                        attempts,
                        error = %e,
                        "turn commit failed, abandoning batch for redelivery"
                    );
                    let _ = self
                        .store
                        .abandon_workflow_item(
                            lock_token,
                            Some(Duration::from_millis(self.options.abandon_delay_ms)),
                        )
                        .await;
                    return Err(e);
                }
            }
        }
    }

    /// Record a start that can never execute: an unregistered name or an
    /// unsatisfiable version request.
    async fn fail_start(
        &self,
        lock_token: &str,
        workflow_id: &str,
        run_id: u64,
        name: &str,
        input: String,
        message: String,
        messages: &[WorkItem],
    ) {
        error!(
            target: "workloom::runtime",
            workflow_id = %workflow_id,
            name,
            %message,
            "failing workflow start"
        );
        let delta = vec![
            Event::new(
                INITIAL_EVENT_ID,
                EventKind::WorkflowStarted {
                    name: name.to_string(),
                    version: "0.0.0".to_string(),
                    input,
                    started_at_ms: now_ms(),
                    timeout_ms: None,
                },
            ),
            Event::new(
                INITIAL_EVENT_ID + 1,
                EventKind::WorkflowFailed {
                    error: WorkflowError::configuration(message.clone()),
                },
            ),
        ];
        if self
            .ack_with_retry(lock_token, run_id, delta, vec![], vec![], vec![])
            .await
            .is_ok()
        {
            self.fail_requests(messages, &message).await;
        }
    }

    /// Fail a run whose batch exhausted its delivery attempts.
    async fn fail_as_poison(
        &self,
        workflow_id: &str,
        run_id: u64,
        history: &[Event],
        messages: &[WorkItem],
        lock_token: &str,
        attempt_count: u32,
    ) {
        error!(
            target: "workloom::runtime",
            workflow_id = %workflow_id,
            run_id,
            attempt_count,
            "delivery attempts exhausted, failing workflow"
        );
        let error = WorkflowError::configuration(format!(
            "batch delivery attempts exhausted after {attempt_count} deliveries"
        ));
        let (ack_run, delta) = if history_is_terminal(history) {
            (run_id, Vec::new())
        } else if history.is_empty() {
            // The poison batch is the start itself; synthesize enough
            // history to record the failure.
            let (name, input) = messages
                .iter()
                .find_map(|m| match m {
                    WorkItem::StartWorkflow { name, input, .. }
                    | WorkItem::ContinueAsNew { name, input, .. } => {
                        Some((name.clone(), input.clone()))
                    }
                    _ => None,
                })
                .unwrap_or_else(|| ("unknown".to_string(), String::new()));
            let delta = vec![
                Event::new(
                    INITIAL_EVENT_ID,
                    EventKind::WorkflowStarted {
                        name,
                        version: "0.0.0".to_string(),
                        input,
                        started_at_ms: now_ms(),
                        timeout_ms: None,
                    },
                ),
                Event::new(
                    INITIAL_EVENT_ID + 1,
                    EventKind::WorkflowFailed { error },
                ),
            ];
            (run_id + 1, delta)
        } else {
            let delta = vec![Event::new(
                next_event_id(history),
                EventKind::WorkflowFailed { error },
            )];
            (run_id, delta)
        };
        self.clear_suspension(workflow_id);
        if self
            .ack_with_retry(lock_token, ack_run, delta, vec![], vec![], vec![])
            .await
            .is_ok()
        {
            self.fail_requests(messages, "delivery attempts exhausted").await;
        }
    }

    /// Park the batch: record the reason and release the lock with a delay
    /// so redelivery retries against (eventually) fixed code.
    async fn suspend_batch(&self, workflow_id: &str, reason: String, lock_token: &str) {
        warn!(
            target: "workloom::runtime",
            workflow_id = %workflow_id,
            %reason,
            "suspending workflow"
        );
        self.suspended
            .lock()
            .expect("suspended map mutex poisoned")
            .insert(workflow_id.to_string(), reason);
        let _ = self
            .store
            .abandon_workflow_item(
                lock_token,
                Some(Duration::from_millis(self.options.suspended_retry_delay_ms)),
            )
            .await;
    }

    fn is_suspended(&self, workflow_id: &str) -> bool {
        self.suspended
            .lock()
            .expect("suspended map mutex poisoned")
            .contains_key(workflow_id)
    }

    fn clear_suspension(&self, workflow_id: &str) {
        self.suspended
            .lock()
            .expect("suspended map mutex poisoned")
            .remove(workflow_id);
    }

    /// Answer query and update requests in a batch that cannot reach a
    /// live run, so callers do not poll forever.
    async fn fail_requests(&self, messages: &[WorkItem], reason: &str) {
        for msg in messages {
            let (request_id, payload) = match msg {
                WorkItem::QueryRequest { query_id, .. } => {
                    let payload =
                        serde_json::to_string(&Err::<String, String>(reason.to_string()))
                            .unwrap_or_default();
                    (query_id, payload)
                }
                WorkItem::UpdateRequest { update_id, .. } => {
                    let payload =
                        serde_json::to_string(&UpdateOutcome::Rejected(reason.to_string()))
                            .unwrap_or_default();
                    (update_id, payload)
                }
                _ => continue,
            };
            if let Err(e) = self.store.put_response(request_id, payload).await {
                warn!(
                    target: "workloom::runtime",
                    request_id = %request_id,
                    error = %e,
                    "failed to store response"
                );
            }
        }
    }

    async fn deliver_responses(&self, responses: Vec<(String, String)>) {
        for (request_id, payload) in responses {
            if let Err(e) = self.store.put_response(&request_id, payload).await {
                warn!(
                    target: "workloom::runtime",
                    request_id = %request_id,
                    error = %e,
                    "failed to store response"
                );
            }
        }
    }
}

/// Convert a turn's commands into worker and timer queue items.
fn commands_to_items(
    workflow_id: &str,
    run_id: u64,
    commands: Vec<Command>,
) -> (Vec<WorkItem>, Vec<WorkItem>) {
    let mut worker_items = Vec::new();
    let mut timer_items = Vec::new();
    for cmd in commands {
        match cmd {
            Command::ScheduleActivity {
                event_id,
                name,
                input,
                attempt,
            } => worker_items.push(WorkItem::ActivityExecute {
                workflow_id: workflow_id.to_string(),
                run_id,
                event_id,
                name,
                input,
                attempt,
            }),
            Command::StartTimer { event_id, delay_ms } => {
                timer_items.push(WorkItem::TimerSchedule {
                    workflow_id: workflow_id.to_string(),
                    run_id,
                    event_id,
                    fire_at_ms: now_ms() + delay_ms,
                })
            }
        }
    }
    (worker_items, timer_items)
}

fn history_is_terminal(history: &[Event]) -> bool {
    history.last().map(|e| e.is_terminal()).unwrap_or(false)
}

fn next_event_id(history: &[Event]) -> u64 {
    history.last().map(|e| e.event_id + 1).unwrap_or(INITIAL_EVENT_ID)
}

/// Start-to-close bound recorded by the run's first event, if any.
fn run_timeout(history: &[Event]) -> Option<u64> {
    history.first().and_then(|e| match &e.kind {
        EventKind::WorkflowStarted { timeout_ms, .. } => *timeout_ms,
        _ => None,
    })
}

/// Name and pinned version recorded by the run's first event.
fn pinned_start(history: &[Event]) -> Option<(String, String)> {
    history.first().and_then(|e| match &e.kind {
        EventKind::WorkflowStarted { name, version, .. } => Some((name.clone(), version.clone())),
        _ => None,
    })
}
