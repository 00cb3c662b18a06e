//! One workflow turn: stage queued messages as history events, drive the
//! session to quiescence, and classify the outcome.
//!
//! A turn never touches the provider. The execution layer feeds it the
//! locked message batch, then commits the delta, commands, and responses
//! it extracts afterwards. Suspension discards the turn wholesale, so a
//! nondeterministic batch leaves no trace in storage.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::Poll;

use tracing::{debug, warn};

use crate::providers::WorkItem;
use crate::workflow::{WorkflowHandler, WorkflowSession};
use crate::{Command, Event, EventKind, UpdateOutcome, WorkflowContext, WorkflowError};

/// Outcome of executing one turn.
#[derive(Debug)]
pub enum TurnResult {
    /// Run stays open; delta and commands commit as usual.
    Continue,
    /// Main body finished and all updates drained; `WorkflowCompleted` is in
    /// the delta.
    Completed(String),
    /// Main body failed (including cancellation); `WorkflowFailed` is in the
    /// delta.
    Failed(WorkflowError),
    /// Run closed with `WorkflowContinuedAsNew`; a successor must be queued.
    ContinuedAsNew { input: String },
    /// Replay diverged from recorded history. Nothing commits; the batch is
    /// abandoned for redelivery once the code is fixed.
    Suspended(String),
}

/// Early exit from a drive loop; quiescence is the absence of one.
enum Drive {
    Nondet(String),
    Panicked(String),
}

/// Single hydration of one run, from message prep through outcome.
pub struct WorkflowTurn {
    workflow_id: String,
    run_id: u64,
    ctx: WorkflowContext,
    /// Whether the persisted history was already closed when the turn began.
    /// Judged before any staging: a staged event must never reopen a run.
    baseline_terminal: bool,
    /// Update requests held back for two-phase handling at quiescence.
    update_requests: Vec<(String, String, String)>,
    /// Query requests answered against the turn's final state.
    query_requests: Vec<(String, String, String)>,
    /// (request id, payload) pairs delivered after the turn commits.
    responses: Vec<(String, String)>,
    /// Update requests re-enqueued because another update was in flight.
    deferred_updates: Vec<WorkItem>,
    /// Main-future outcome observed by this execution, kept for offline
    /// verification against a recorded terminal event.
    replayed_main: Option<Result<String, WorkflowError>>,
}

impl WorkflowTurn {
    pub fn new(workflow_id: impl Into<String>, run_id: u64, baseline_history: Vec<Event>) -> Self {
        let workflow_id = workflow_id.into();
        let baseline_terminal = baseline_history.last().map(|e| e.is_terminal()).unwrap_or(false);
        let ctx = WorkflowContext::new(workflow_id.clone(), run_id, baseline_history);
        ctx.mark_persisted_here();
        Self {
            workflow_id,
            run_id,
            ctx,
            baseline_terminal,
            update_requests: Vec::new(),
            query_requests: Vec::new(),
            responses: Vec::new(),
            deferred_updates: Vec::new(),
            replayed_main: None,
        }
    }

    /// Stage the first event of a fresh run so it lands in this turn's delta.
    pub fn stage_started(
        &mut self,
        name: &str,
        version: &str,
        input: String,
        started_at_ms: u64,
        timeout_ms: Option<u64>,
    ) {
        self.ctx.stage_event(EventKind::WorkflowStarted {
            name: name.to_string(),
            version: version.to_string(),
            input,
            started_at_ms,
            timeout_ms,
        });
    }

    /// Stage 1: convert the locked message batch into staged history events.
    /// Stale-run and duplicate completions are dropped; a completion with no
    /// matching schedule (or the wrong kind) marks the turn nondeterministic.
    /// Update and query requests are held aside for the execution stages.
    pub fn prep_completions(&mut self, messages: Vec<WorkItem>) {
        debug!(
            target: "workloom::runtime",
            workflow_id = %self.workflow_id,
            run_id = self.run_id,
            message_count = messages.len(),
            "staging queued messages"
        );
        for item in messages {
            match item {
                WorkItem::ActivityCompleted {
                    run_id,
                    event_id,
                    result,
                    ..
                } => {
                    if self.admit_completion(run_id, event_id, "activity") {
                        self.ctx.stage_event(EventKind::ActivityCompleted {
                            source_event_id: event_id,
                            result,
                        });
                    }
                }
                WorkItem::ActivityFailed {
                    run_id,
                    event_id,
                    error,
                    ..
                } => {
                    if self.admit_completion(run_id, event_id, "activity") {
                        self.ctx.stage_event(EventKind::ActivityFailed {
                            source_event_id: event_id,
                            error,
                        });
                    }
                }
                WorkItem::TimerFired {
                    run_id,
                    event_id,
                    fire_at_ms,
                    ..
                } => {
                    if self.admit_completion(run_id, event_id, "timer") {
                        self.ctx.stage_event(EventKind::TimerFired {
                            source_event_id: event_id,
                            fire_at_ms,
                        });
                    }
                }
                WorkItem::SignalWorkflow { name, input, .. } => {
                    if self.baseline_terminal {
                        warn!(
                            target: "workloom::runtime",
                            workflow_id = %self.workflow_id,
                            signal = %name,
                            "dropping signal for a closed run"
                        );
                    } else {
                        self.ctx.stage_event(EventKind::SignalReceived { name, input });
                    }
                }
                WorkItem::CancelWorkflow { reason, .. } => {
                    let already_requested = self.ctx.with_history(|h| {
                        h.iter().any(|e| {
                            matches!(e.kind, EventKind::CancelRequested { .. }) || e.is_terminal()
                        })
                    });
                    if already_requested {
                        debug!(
                            target: "workloom::runtime",
                            workflow_id = %self.workflow_id,
                            "dropping repeated cancellation request"
                        );
                    } else {
                        self.ctx.stage_event(EventKind::CancelRequested { reason });
                    }
                }
                WorkItem::UpdateRequest {
                    update_id,
                    name,
                    input,
                    ..
                } => {
                    // Value-level duplicate within one batch (redelivery).
                    if !self.update_requests.iter().any(|(id, _, _)| id == &update_id) {
                        self.update_requests.push((update_id, name, input));
                    }
                }
                WorkItem::QueryRequest {
                    query_id,
                    name,
                    input,
                    ..
                } => {
                    self.query_requests.push((query_id, name, input));
                }
                other => {
                    // Start-class items are consumed by the execution layer
                    // before the turn is built.
                    warn!(
                        target: "workloom::runtime",
                        workflow_id = %self.workflow_id,
                        item = ?other,
                        "unexpected item reached turn prep, dropping"
                    );
                }
            }
        }
    }

    /// Whether a completion message may be staged. Filters stale runs,
    /// duplicates, and completions for a closed run; flags missing or
    /// mismatched schedules as nondeterminism.
    fn admit_completion(&self, run_id: u64, source_event_id: u64, want_kind: &str) -> bool {
        if run_id != self.run_id {
            warn!(
                target: "workloom::runtime",
                workflow_id = %self.workflow_id,
                message_run_id = run_id,
                current_run_id = self.run_id,
                "dropping completion from a different run"
            );
            return false;
        }
        if self.baseline_terminal {
            warn!(
                target: "workloom::runtime",
                workflow_id = %self.workflow_id,
                source_event_id,
                "dropping late completion for a closed run"
            );
            return false;
        }
        let duplicate = self.ctx.with_history(|h| {
            h.iter().any(|e| e.kind.source_event_id() == Some(source_event_id))
        });
        if duplicate {
            warn!(
                target: "workloom::runtime",
                workflow_id = %self.workflow_id,
                source_event_id,
                "dropping duplicate completion"
            );
            return false;
        }
        let scheduled_kind = self.ctx.with_history(|h| {
            h.iter()
                .find(|e| e.event_id == source_event_id)
                .and_then(|e| match &e.kind {
                    EventKind::ActivityScheduled { .. } => Some("activity"),
                    EventKind::TimerStarted { .. } => Some("timer"),
                    _ => None,
                })
        });
        match scheduled_kind {
            Some(kind) if kind == want_kind => true,
            Some(kind) => {
                self.ctx.set_nondet(format!(
                    "completion kind mismatch for event {source_event_id}: history scheduled a {kind}, queue delivered a {want_kind} completion"
                ));
                false
            }
            None => {
                self.ctx.set_nondet(format!(
                    "no matching schedule in history for {want_kind} completion of event {source_event_id}"
                ));
                false
            }
        }
    }

    /// Stage 2: drive the session to quiescence, admit update requests one
    /// at a time, answer queries against the final state, and classify.
    pub fn execute(&mut self, handler: Arc<dyn WorkflowHandler>) -> TurnResult {
        let input = match self.start_input() {
            Ok(input) => input,
            Err(err) => {
                self.ctx.stage_event(EventKind::WorkflowFailed { error: err.clone() });
                return TurnResult::Failed(err);
            }
        };
        let already_terminal = self.baseline_terminal;

        let mut session = handler.create_session(self.ctx.clone(), input);
        let mut main_done: Option<Result<String, WorkflowError>> = None;

        if let Some(result) = self.drive(session.as_mut(), &mut main_done) {
            let outcome = self.fault_outcome(result, already_terminal);
            self.finish(session);
            return outcome;
        }

        for (update_id, name, update_input) in std::mem::take(&mut self.update_requests) {
            if let Some(outcome) = self.recorded_update_outcome(&update_id) {
                // Redelivered request for a settled update: answer from history.
                self.push_update_response(&update_id, &outcome);
                continue;
            }
            if session.update_in_flight(&update_id) {
                // Still running from an earlier acceptance; its completion
                // will respond.
                continue;
            }
            if already_terminal || main_done.is_some() {
                let outcome = UpdateOutcome::Rejected("workflow already completed".to_string());
                self.push_update_response(&update_id, &outcome);
                continue;
            }
            if session.active_updates() > 0 {
                // One update at a time; redeliver this one shortly.
                self.deferred_updates.push(WorkItem::UpdateRequest {
                    workflow_id: self.workflow_id.clone(),
                    update_id,
                    name,
                    input: update_input,
                });
                continue;
            }
            let verdict = catch_unwind(AssertUnwindSafe(|| session.validate_update(&name, &update_input)))
                .unwrap_or_else(|payload| Err(panic_message(payload)));
            match verdict {
                Err(reason) => {
                    // Rejection before acceptance leaves no history.
                    let outcome = UpdateOutcome::Rejected(reason);
                    self.push_update_response(&update_id, &outcome);
                }
                Ok(()) => {
                    self.ctx.stage_event(EventKind::UpdateAccepted {
                        update_id,
                        name,
                        input: update_input,
                    });
                    if let Some(result) = self.drive(session.as_mut(), &mut main_done) {
                        let outcome = self.fault_outcome(result, already_terminal);
                        self.finish(session);
                        return outcome;
                    }
                }
            }
        }

        self.replayed_main = main_done.clone();
        let outcome = self.settle(session.as_ref(), &main_done, already_terminal);
        self.answer_queries(session.as_ref());
        self.finish(session);
        outcome
    }

    /// Poll main and update futures, routing executor-owned events between
    /// polls, until nothing moves. Returns early on nondeterminism or panic.
    fn drive(
        &mut self,
        session: &mut dyn WorkflowSession,
        main_done: &mut Option<Result<String, WorkflowError>>,
    ) -> Option<Drive> {
        loop {
            if let Some(reason) = self.ctx.nondet_reason() {
                return Some(Drive::Nondet(reason));
            }
            let before = self.ctx.progress_marker();
            let mut progressed = false;

            let polled = catch_unwind(AssertUnwindSafe(|| {
                let main = session.poll_main();
                let finished = session.poll_updates();
                (main, finished)
            }));
            let (main_poll, finished) = match polled {
                Ok(pair) => pair,
                Err(payload) => return Some(Drive::Panicked(panic_message(payload))),
            };
            if main_done.is_none() {
                if let Poll::Ready(result) = main_poll {
                    *main_done = Some(result);
                    progressed = true;
                }
            }
            for (update_id, result) in finished {
                self.record_update_outcome(&update_id, result);
                progressed = true;
            }
            if let Some(reason) = self.ctx.nondet_reason() {
                return Some(Drive::Nondet(reason));
            }

            // Route at most one state-changing event, then re-poll so waits
            // over state observe each change in history order.
            while let Some(ev) = self.ctx.next_routable() {
                match ev.kind {
                    EventKind::SignalReceived { name, input } => {
                        self.ctx.mark_consumed(ev.event_id);
                        let applied =
                            catch_unwind(AssertUnwindSafe(|| session.apply_signal(&name, &input)));
                        if let Err(payload) = applied {
                            return Some(Drive::Panicked(panic_message(payload)));
                        }
                        progressed = true;
                        break;
                    }
                    EventKind::UpdateAccepted {
                        update_id,
                        name,
                        input,
                    } => {
                        self.ctx.mark_consumed(ev.event_id);
                        session.start_update(&update_id, &name, &input);
                        progressed = true;
                        break;
                    }
                    EventKind::CancelRequested { reason } => {
                        self.ctx.mark_consumed(ev.event_id);
                        self.ctx.set_cancel(ev.event_id, reason);
                        progressed = true;
                        break;
                    }
                    ref kind => {
                        let source = kind.source_event_id().unwrap_or(0);
                        if self.ctx.is_cancelled_schedule(source) {
                            // Late completion for a dropped wait; skip so the
                            // cursor keeps moving.
                            self.ctx.mark_consumed(ev.event_id);
                            progressed = true;
                            continue;
                        }
                        // Owned by a live future; consumed inside a poll.
                        break;
                    }
                }
            }

            if !progressed && self.ctx.progress_marker() == before {
                return None;
            }
        }
    }

    /// Stage the finished (or rejected) update's event and queue its
    /// response, unless replay already recorded it.
    fn record_update_outcome(&mut self, update_id: &str, result: Result<String, WorkflowError>) {
        if self.recorded_update_outcome(update_id).is_some() {
            return;
        }
        let outcome = match result {
            Ok(value) => {
                self.ctx.stage_event(EventKind::UpdateCompleted {
                    update_id: update_id.to_string(),
                    result: value.clone(),
                });
                UpdateOutcome::Accepted(value)
            }
            Err(err) => {
                self.ctx.stage_event(EventKind::UpdateRejected {
                    update_id: update_id.to_string(),
                    reason: err.to_string(),
                });
                UpdateOutcome::Rejected(err.to_string())
            }
        };
        self.push_update_response(update_id, &outcome);
    }

    fn recorded_update_outcome(&self, update_id: &str) -> Option<UpdateOutcome> {
        self.ctx.with_history(|h| {
            h.iter().rev().find_map(|e| match &e.kind {
                EventKind::UpdateCompleted { update_id: id, result } if id == update_id => {
                    Some(UpdateOutcome::Accepted(result.clone()))
                }
                EventKind::UpdateRejected { update_id: id, reason } if id == update_id => {
                    Some(UpdateOutcome::Rejected(reason.clone()))
                }
                _ => None,
            })
        })
    }

    fn push_update_response(&mut self, update_id: &str, outcome: &UpdateOutcome) {
        let payload = serde_json::to_string(outcome).unwrap_or_default();
        self.responses.push((update_id.to_string(), payload));
    }

    /// Classify a drive fault. Nondeterminism suspends without staging;
    /// panics fail the run unless history already closed it.
    fn fault_outcome(&mut self, fault: Drive, already_terminal: bool) -> TurnResult {
        match fault {
            Drive::Nondet(reason) => {
                warn!(
                    target: "workloom::runtime",
                    workflow_id = %self.workflow_id,
                    run_id = self.run_id,
                    reason = %reason,
                    "replay diverged from history, suspending"
                );
                TurnResult::Suspended(reason)
            }
            Drive::Panicked(message) => {
                if already_terminal {
                    return self.terminal_from_history();
                }
                let error = WorkflowError::non_retryable(
                    "panic",
                    format!("workflow code panicked: {message}"),
                );
                self.ctx.stage_event(EventKind::WorkflowFailed { error: error.clone() });
                TurnResult::Failed(error)
            }
        }
    }

    /// Final classification once the session is quiescent and all update
    /// requests are admitted, deferred, or answered.
    fn settle(
        &mut self,
        session: &dyn WorkflowSession,
        main_done: &Option<Result<String, WorkflowError>>,
        already_terminal: bool,
    ) -> TurnResult {
        if already_terminal {
            return self.terminal_from_history();
        }
        let updates_active = session.active_updates() > 0;
        if let Some(input) = self.ctx.take_continue_as_new() {
            if !updates_active {
                self.ctx
                    .stage_event(EventKind::WorkflowContinuedAsNew { input: input.clone() });
                return TurnResult::ContinuedAsNew { input };
            }
            // Requested while updates are still running; the main body will
            // re-request it once they drain.
        }
        match main_done {
            Some(_) if updates_active => TurnResult::Continue,
            Some(Ok(output)) => {
                self.ctx.stage_event(EventKind::WorkflowCompleted {
                    output: output.clone(),
                });
                TurnResult::Completed(output.clone())
            }
            Some(Err(err)) => {
                self.ctx.stage_event(EventKind::WorkflowFailed { error: err.clone() });
                TurnResult::Failed(err.clone())
            }
            None => TurnResult::Continue,
        }
    }

    fn answer_queries(&mut self, session: &dyn WorkflowSession) {
        for (query_id, name, input) in std::mem::take(&mut self.query_requests) {
            let result: Result<String, String> =
                catch_unwind(AssertUnwindSafe(|| session.run_query(&name, &input)))
                    .unwrap_or_else(|payload| Err(panic_message(payload)));
            let payload = serde_json::to_string(&result).unwrap_or_default();
            self.responses.push((query_id, payload));
        }
    }

    /// Tear the session down without cancel bookkeeping from its drops.
    fn finish(&self, session: Box<dyn WorkflowSession>) {
        self.ctx.set_dehydrating();
        drop(session);
    }

    fn start_input(&self) -> Result<String, WorkflowError> {
        self.ctx.with_history(|h| match h.first().map(|e| &e.kind) {
            Some(EventKind::WorkflowStarted { input, .. }) => Ok(input.clone()),
            _ => Err(WorkflowError::configuration(
                "history does not begin with WorkflowStarted",
            )),
        })
    }

    fn terminal_from_history(&self) -> TurnResult {
        self.ctx.with_history(|h| match h.last().map(|e| &e.kind) {
            Some(EventKind::WorkflowCompleted { output }) => TurnResult::Completed(output.clone()),
            Some(EventKind::WorkflowFailed { error }) => TurnResult::Failed(error.clone()),
            Some(EventKind::WorkflowContinuedAsNew { input }) => TurnResult::ContinuedAsNew {
                input: input.clone(),
            },
            _ => TurnResult::Continue,
        })
    }

    // Extraction surface for the execution layer.

    pub fn history_delta(&self) -> Vec<Event> {
        self.ctx.delta()
    }

    pub fn take_commands(&self) -> Vec<Command> {
        self.ctx.take_commands()
    }

    pub fn take_responses(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.responses)
    }

    pub fn take_deferred_updates(&mut self) -> Vec<WorkItem> {
        std::mem::take(&mut self.deferred_updates)
    }

    pub fn replayed_main(&self) -> Option<&Result<String, WorkflowError>> {
        self.replayed_main.as_ref()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "workflow code panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowDefinition;
    use crate::AppError;

    fn started(name: &str, input: &str) -> Event {
        Event::new(
            1,
            EventKind::WorkflowStarted {
                name: name.to_string(),
                version: "1.0.0".to_string(),
                input: input.to_string(),
                started_at_ms: 1_000,
                timeout_ms: None,
            },
        )
    }

    fn scheduled(event_id: u64, name: &str, input: &str) -> Event {
        Event::new(
            event_id,
            EventKind::ActivityScheduled {
                name: name.to_string(),
                input: input.to_string(),
                attempt: 1,
            },
        )
    }

    fn one_shot() -> Arc<dyn WorkflowHandler> {
        Arc::new(WorkflowDefinition::function("one-shot", |ctx, input| async move {
            ctx.activity("format", input).await
        }))
    }

    fn counter() -> Arc<dyn WorkflowHandler> {
        Arc::new(
            WorkflowDefinition::new("counter", |_input: &str| 0_i64)
                .run(|ctx, state, _input| async move {
                    ctx.wait_condition(&state, |n| *n >= 3, None).await?;
                    Ok(state.read(|n| n.to_string()))
                })
                .on_signal("add", |n, input| {
                    *n += input
                        .parse::<i64>()
                        .map_err(|e| AppError::non_retryable("bad_input", e.to_string()))?;
                    Ok(())
                })
                .on_query("total", |n, _| Ok(n.to_string()))
                .on_update_validated(
                    "set",
                    |_, input| input.parse::<i64>().map(|_| ()).map_err(|_| "not a number".to_string()),
                    |_ctx, state, input| async move {
                        let n = input.parse::<i64>().unwrap_or(0);
                        state.mutate(|s| *s = n);
                        Ok(n.to_string())
                    },
                ),
        )
    }

    fn slow_charge() -> Arc<dyn WorkflowHandler> {
        Arc::new(
            WorkflowDefinition::new("slow-charge", |_input: &str| 0_i64)
                .run(|ctx, _state, input| async move { ctx.activity("charge", input).await })
                .on_signal("bump", |n, _| {
                    *n += 1;
                    Ok(())
                })
                .on_query("level", |n, _| Ok(n.to_string())),
        )
    }

    #[test]
    fn completion_message_drives_run_to_completion() {
        let baseline = vec![started("one-shot", "in"), scheduled(2, "format", "in")];
        let mut turn = WorkflowTurn::new("wf-1", 1, baseline);
        turn.prep_completions(vec![WorkItem::ActivityCompleted {
            workflow_id: "wf-1".to_string(),
            run_id: 1,
            event_id: 2,
            result: "done".to_string(),
        }]);

        let result = turn.execute(one_shot());

        assert!(matches!(result, TurnResult::Completed(ref out) if out == "done"));
        let delta = turn.history_delta();
        assert_eq!(delta.len(), 2);
        assert!(matches!(
            delta[0].kind,
            EventKind::ActivityCompleted { source_event_id: 2, .. }
        ));
        assert!(matches!(delta[1].kind, EventKind::WorkflowCompleted { .. }));
    }

    #[test]
    fn stale_and_duplicate_completions_are_dropped() {
        let baseline = vec![
            started("one-shot", "in"),
            scheduled(2, "format", "in"),
            Event::new(
                3,
                EventKind::ActivityCompleted {
                    source_event_id: 2,
                    result: "done".to_string(),
                },
            ),
        ];
        let mut turn = WorkflowTurn::new("wf-1", 1, baseline);
        turn.prep_completions(vec![
            WorkItem::ActivityCompleted {
                workflow_id: "wf-1".to_string(),
                run_id: 1,
                event_id: 2,
                result: "again".to_string(),
            },
            WorkItem::ActivityCompleted {
                workflow_id: "wf-1".to_string(),
                run_id: 9,
                event_id: 2,
                result: "other run".to_string(),
            },
        ]);

        let result = turn.execute(one_shot());

        // Replay finishes off the recorded completion; the messages added
        // nothing.
        assert!(matches!(result, TurnResult::Completed(ref out) if out == "done"));
        let delta = turn.history_delta();
        assert_eq!(delta.len(), 1);
        assert!(matches!(delta[0].kind, EventKind::WorkflowCompleted { .. }));
    }

    #[test]
    fn unmatched_completion_suspends_without_staging() {
        let baseline = vec![started("one-shot", "in")];
        let mut turn = WorkflowTurn::new("wf-1", 1, baseline);
        turn.prep_completions(vec![WorkItem::ActivityCompleted {
            workflow_id: "wf-1".to_string(),
            run_id: 1,
            event_id: 7,
            result: "orphan".to_string(),
        }]);

        let result = turn.execute(one_shot());

        match result {
            TurnResult::Suspended(reason) => assert!(reason.contains("no matching schedule"), "{reason}"),
            other => panic!("expected suspension, got {other:?}"),
        }
        assert!(turn.history_delta().is_empty());
    }

    #[test]
    fn signal_unblocks_condition_wait() {
        let baseline = vec![started("counter", "")];
        let mut turn = WorkflowTurn::new("wf-1", 1, baseline);
        turn.prep_completions(vec![WorkItem::SignalWorkflow {
            workflow_id: "wf-1".to_string(),
            name: "add".to_string(),
            input: "3".to_string(),
        }]);

        let result = turn.execute(counter());

        assert!(matches!(result, TurnResult::Completed(ref out) if out == "3"));
        let delta = turn.history_delta();
        assert!(matches!(delta[0].kind, EventKind::SignalReceived { .. }));
        assert!(matches!(delta[1].kind, EventKind::WorkflowCompleted { .. }));
    }

    #[test]
    fn accepted_update_records_two_events_and_responds() {
        let baseline = vec![started("counter", "")];
        let mut turn = WorkflowTurn::new("wf-1", 1, baseline);
        turn.prep_completions(vec![WorkItem::UpdateRequest {
            workflow_id: "wf-1".to_string(),
            update_id: "u-1".to_string(),
            name: "set".to_string(),
            input: "2".to_string(),
        }]);

        let result = turn.execute(counter());

        // 2 < 3, so the condition wait keeps the run open.
        assert!(matches!(result, TurnResult::Continue));
        let delta = turn.history_delta();
        assert_eq!(delta.len(), 2);
        assert!(matches!(
            &delta[0].kind,
            EventKind::UpdateAccepted { update_id, .. } if update_id == "u-1"
        ));
        assert!(matches!(
            &delta[1].kind,
            EventKind::UpdateCompleted { update_id, result } if update_id == "u-1" && result == "2"
        ));
        let responses = turn.take_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, "u-1");
        let outcome: UpdateOutcome = serde_json::from_str(&responses[0].1).unwrap();
        assert_eq!(outcome, UpdateOutcome::Accepted("2".to_string()));
    }

    #[test]
    fn rejected_update_leaves_no_history() {
        let baseline = vec![started("counter", "")];
        let mut turn = WorkflowTurn::new("wf-1", 1, baseline);
        turn.prep_completions(vec![WorkItem::UpdateRequest {
            workflow_id: "wf-1".to_string(),
            update_id: "u-bad".to_string(),
            name: "set".to_string(),
            input: "abc".to_string(),
        }]);

        let result = turn.execute(counter());

        assert!(matches!(result, TurnResult::Continue));
        assert!(turn.history_delta().is_empty());
        let responses = turn.take_responses();
        let outcome: UpdateOutcome = serde_json::from_str(&responses[0].1).unwrap();
        assert_eq!(outcome, UpdateOutcome::Rejected("not a number".to_string()));
    }

    #[test]
    fn redelivered_update_answers_from_history() {
        let baseline = vec![
            started("counter", ""),
            Event::new(
                2,
                EventKind::UpdateAccepted {
                    update_id: "u-1".to_string(),
                    name: "set".to_string(),
                    input: "2".to_string(),
                },
            ),
            Event::new(
                3,
                EventKind::UpdateCompleted {
                    update_id: "u-1".to_string(),
                    result: "2".to_string(),
                },
            ),
        ];
        let mut turn = WorkflowTurn::new("wf-1", 1, baseline);
        turn.prep_completions(vec![WorkItem::UpdateRequest {
            workflow_id: "wf-1".to_string(),
            update_id: "u-1".to_string(),
            name: "set".to_string(),
            input: "2".to_string(),
        }]);

        let result = turn.execute(counter());

        assert!(matches!(result, TurnResult::Continue));
        assert!(turn.history_delta().is_empty());
        let responses = turn.take_responses();
        assert_eq!(responses.len(), 1);
        let outcome: UpdateOutcome = serde_json::from_str(&responses[0].1).unwrap();
        assert_eq!(outcome, UpdateOutcome::Accepted("2".to_string()));
    }

    #[test]
    fn query_answers_without_touching_history() {
        let baseline = vec![started("counter", "")];
        let mut turn = WorkflowTurn::new("wf-1", 1, baseline);
        turn.prep_completions(vec![WorkItem::QueryRequest {
            workflow_id: "wf-1".to_string(),
            query_id: "q-1".to_string(),
            name: "total".to_string(),
            input: String::new(),
        }]);

        let result = turn.execute(counter());

        assert!(matches!(result, TurnResult::Continue));
        assert!(turn.history_delta().is_empty());
        let responses = turn.take_responses();
        assert_eq!(responses[0].0, "q-1");
        let payload: Result<String, String> = serde_json::from_str(&responses[0].1).unwrap();
        assert_eq!(payload, Ok("0".to_string()));
    }

    #[test]
    fn cancellation_preempts_pending_activity() {
        let baseline = vec![started("one-shot", "in"), scheduled(2, "format", "in")];
        let mut turn = WorkflowTurn::new("wf-1", 1, baseline);
        turn.prep_completions(vec![WorkItem::CancelWorkflow {
            workflow_id: "wf-1".to_string(),
            reason: "operator".to_string(),
        }]);

        let result = turn.execute(one_shot());

        match result {
            TurnResult::Failed(WorkflowError::Cancelled { reason }) => assert_eq!(reason, "operator"),
            other => panic!("expected cancellation, got {other:?}"),
        }
        let delta = turn.history_delta();
        assert!(matches!(delta[0].kind, EventKind::CancelRequested { .. }));
        assert!(matches!(
            &delta[1].kind,
            EventKind::WorkflowFailed { error: WorkflowError::Cancelled { .. } }
        ));
    }

    #[test]
    fn closed_run_ignores_late_messages_but_answers_requests() {
        // A timed-out run pairs a late activity completion with live
        // requests in one batch. Nothing may land in history, the recorded
        // outcome stands, and the query is still answered from replayed
        // state.
        let baseline = vec![
            started("slow-charge", "card-4"),
            scheduled(2, "charge", "card-4"),
            Event::new(
                3,
                EventKind::WorkflowFailed {
                    error: WorkflowError::Timeout {
                        what: "workflow run".to_string(),
                        after_ms: 10,
                    },
                },
            ),
        ];
        let mut turn = WorkflowTurn::new("wf-1", 1, baseline);
        turn.prep_completions(vec![
            WorkItem::ActivityCompleted {
                workflow_id: "wf-1".to_string(),
                run_id: 1,
                event_id: 2,
                result: "ok".to_string(),
            },
            WorkItem::SignalWorkflow {
                workflow_id: "wf-1".to_string(),
                name: "bump".to_string(),
                input: String::new(),
            },
            WorkItem::UpdateRequest {
                workflow_id: "wf-1".to_string(),
                update_id: "u-late".to_string(),
                name: "adjust".to_string(),
                input: "5".to_string(),
            },
            WorkItem::QueryRequest {
                workflow_id: "wf-1".to_string(),
                query_id: "q-1".to_string(),
                name: "level".to_string(),
                input: String::new(),
            },
        ]);

        let result = turn.execute(slow_charge());

        assert!(matches!(
            result,
            TurnResult::Failed(WorkflowError::Timeout { .. })
        ));
        assert!(turn.history_delta().is_empty());
        let responses = turn.take_responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].0, "u-late");
        let outcome: UpdateOutcome = serde_json::from_str(&responses[0].1).unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Rejected("workflow already completed".to_string())
        );
        assert_eq!(responses[1].0, "q-1");
        let payload: Result<String, String> = serde_json::from_str(&responses[1].1).unwrap();
        assert_eq!(payload, Ok("0".to_string()));
    }
}
