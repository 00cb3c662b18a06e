//! Durable workflow engine: event-sourced histories, deterministic replay,
//! signal/query/update handlers, and retrying activities.
//!
//! Each workflow run owns an append-only history of events. Workflow code is
//! re-executed from the start of that history on every delivery of new work
//! (an activity completion, a fired timer, a signal) and must therefore be
//! deterministic: all interaction with the outside world goes through the
//! [`WorkflowContext`] primitives, which either adopt the recorded event at
//! the current history position or, at the live frontier, record a new one
//! and emit the corresponding command.
//!
//! The runtime ([`runtime::Runtime`]) drives executions by consuming
//! peek-locked work queues from a [`providers::Provider`] and committing each
//! turn's history delta and downstream work atomically. The
//! [`client::WorkflowClient`] starts runs, raises signals, executes queries
//! and updates, and waits for outcomes through the same provider.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod client;
mod error;
pub mod futures;
mod logging;
pub mod providers;
pub mod replay;
pub mod retry;
pub mod runtime;
pub mod saga;
pub mod workflow;

pub use client::{ClientError, StartOptions, WorkflowClient};
pub use error::{AppError, WorkflowError};
pub use retry::RetryPolicy;
pub use runtime::{Runtime, RuntimeOptions};
pub use saga::Compensations;
pub use workflow::{StateHandle, WorkflowDefinition};

/// First event id of every run.
pub const INITIAL_EVENT_ID: u64 = 1;

/// One record in a run's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing sequence number within the run, starting at 1.
    pub event_id: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn new(event_id: u64, kind: EventKind) -> Self {
        Self { event_id, kind }
    }

    /// Whether this event closes the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::WorkflowCompleted { .. }
                | EventKind::WorkflowFailed { .. }
                | EventKind::WorkflowContinuedAsNew { .. }
        )
    }
}

/// Payload of a history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// First event of every run.
    WorkflowStarted {
        name: String,
        version: String,
        input: String,
        started_at_ms: u64,
        /// Start-to-close bound on the whole run, if any.
        timeout_ms: Option<u64>,
    },
    /// An activity attempt was dispatched to the worker queue.
    ActivityScheduled {
        name: String,
        input: String,
        /// 1-based attempt number under the owning retry loop.
        attempt: u32,
    },
    ActivityCompleted {
        source_event_id: u64,
        result: String,
    },
    ActivityFailed {
        source_event_id: u64,
        error: WorkflowError,
    },
    TimerStarted {
        delay_ms: u64,
    },
    TimerFired {
        source_event_id: u64,
        fire_at_ms: u64,
    },
    /// A signal was delivered; applied to state at this history position.
    SignalReceived {
        name: String,
        input: String,
    },
    /// An update passed its validator; its handler runs from this position.
    UpdateAccepted {
        update_id: String,
        name: String,
        input: String,
    },
    UpdateCompleted {
        update_id: String,
        result: String,
    },
    /// An accepted update whose handler body failed. Validator rejections
    /// leave no trace in history.
    UpdateRejected {
        update_id: String,
        reason: String,
    },
    /// Versioning gate marker recorded by `patched`/`deprecate_patch`.
    PatchMarker {
        patch_id: String,
    },
    /// Cooperative cancellation was requested. Pending waits scheduled before
    /// this position resolve with a cancellation error.
    CancelRequested {
        reason: String,
    },
    WorkflowCompleted {
        output: String,
    },
    WorkflowFailed {
        error: WorkflowError,
    },
    /// The run ended by handing its successor run a fresh input.
    WorkflowContinuedAsNew {
        input: String,
    },
}

impl EventKind {
    /// Events that are consumed in strict history order, either by the
    /// correlation future that owns them or by the executor itself.
    pub(crate) fn is_consumable(&self) -> bool {
        matches!(
            self,
            EventKind::ActivityCompleted { .. }
                | EventKind::ActivityFailed { .. }
                | EventKind::TimerFired { .. }
                | EventKind::SignalReceived { .. }
                | EventKind::UpdateAccepted { .. }
                | EventKind::CancelRequested { .. }
        )
    }

    /// Events claimed positionally by scheduling primitives during replay.
    pub(crate) fn is_schedule(&self) -> bool {
        matches!(
            self,
            EventKind::ActivityScheduled { .. } | EventKind::TimerStarted { .. }
        )
    }

    /// Scheduling event id a completion refers to, if any.
    pub(crate) fn source_event_id(&self) -> Option<u64> {
        match self {
            EventKind::ActivityCompleted { source_event_id, .. }
            | EventKind::ActivityFailed { source_event_id, .. }
            | EventKind::TimerFired { source_event_id, .. } => Some(*source_event_id),
            _ => None,
        }
    }
}

/// Side effect emitted by a turn, translated into work-queue items when the
/// turn commits. Never persisted as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ScheduleActivity {
        event_id: u64,
        name: String,
        input: String,
        attempt: u32,
    },
    StartTimer {
        event_id: u64,
        delay_ms: u64,
    },
}

/// Caller-visible status of a workflow, derived from its latest run's history.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: WorkflowError },
    Cancelled { reason: String },
    TimedOut,
    ContinuedAsNew,
}

impl WorkflowStatus {
    pub fn from_history(events: &[Event]) -> Self {
        let Some(last) = events.last() else {
            return WorkflowStatus::NotFound;
        };
        match &last.kind {
            EventKind::WorkflowCompleted { output } => WorkflowStatus::Completed {
                output: output.clone(),
            },
            EventKind::WorkflowFailed { error } => match error {
                WorkflowError::Cancelled { reason } => WorkflowStatus::Cancelled {
                    reason: reason.clone(),
                },
                WorkflowError::Timeout { .. } => WorkflowStatus::TimedOut,
                other => WorkflowStatus::Failed {
                    error: other.clone(),
                },
            },
            EventKind::WorkflowContinuedAsNew { .. } => WorkflowStatus::ContinuedAsNew,
            _ => WorkflowStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            WorkflowStatus::Running | WorkflowStatus::NotFound | WorkflowStatus::ContinuedAsNew
        )
    }
}

/// Outcome of an update request as seen by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateOutcome {
    /// Validator passed and the handler completed with this value.
    Accepted(String),
    /// Validator rejected the request, or the accepted handler's body failed.
    Rejected(String),
}

/// Per-attempt context passed to activity functions.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub workflow_id: String,
    pub run_id: u64,
    pub activity_name: String,
    /// Scheduling event id in the owning run's history.
    pub event_id: u64,
    /// 1-based attempt number; lets activities distinguish retries.
    pub attempt: u32,
}

pub(crate) enum ScheduleRequest<'a> {
    Activity {
        name: &'a str,
        input: &'a str,
        attempt: u32,
    },
    Timer {
        delay_ms: u64,
    },
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) workflow_id: String,
    pub(crate) run_id: u64,
    /// Working history for the turn: persisted events plus everything staged
    /// since, in order. Events past `persisted_len` form the turn's delta.
    pub(crate) history: Vec<Event>,
    pub(crate) persisted_len: usize,
    pub(crate) next_event_id: u64,
    /// Schedule event ids already bound to a live future this hydration.
    pub(crate) claimed_schedules: HashSet<u64>,
    /// Consumable event ids already applied, in FIFO discipline.
    pub(crate) consumed: HashSet<u64>,
    /// Schedule ids whose futures were dropped or cancel-resolved; their
    /// late completions are skipped instead of blocking the cursor.
    pub(crate) cancelled: HashSet<u64>,
    pub(crate) commands: Vec<Command>,
    /// Set when the cursor applies CancelRequested: (event id, reason).
    pub(crate) cancel: Option<(u64, String)>,
    pub(crate) started_at_ms: u64,
    pub(crate) logical_now_ms: u64,
    pub(crate) guid_counter: u64,
    pub(crate) patch_decisions: HashMap<String, bool>,
    pub(crate) nondet: Option<String>,
    pub(crate) continue_as_new: Option<String>,
    /// True while the turn tears futures down at suspension; suppresses
    /// drop-based cancellation bookkeeping.
    pub(crate) dehydrating: bool,
}

impl CtxInner {
    fn new(workflow_id: String, run_id: u64, history: Vec<Event>) -> Self {
        let next_event_id = history.last().map(|e| e.event_id + 1).unwrap_or(INITIAL_EVENT_ID);
        let started_at_ms = history
            .first()
            .and_then(|e| match &e.kind {
                EventKind::WorkflowStarted { started_at_ms, .. } => Some(*started_at_ms),
                _ => None,
            })
            .unwrap_or(0);
        Self {
            workflow_id,
            run_id,
            history,
            persisted_len: 0,
            next_event_id,
            claimed_schedules: HashSet::new(),
            consumed: HashSet::new(),
            cancelled: HashSet::new(),
            commands: Vec::new(),
            cancel: None,
            started_at_ms,
            logical_now_ms: started_at_ms,
            guid_counter: 0,
            patch_decisions: HashMap::new(),
            nondet: None,
            continue_as_new: None,
            dehydrating: false,
        }
    }

    fn alloc_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    fn stage(&mut self, kind: EventKind) -> u64 {
        if let EventKind::WorkflowStarted { started_at_ms, .. } = &kind {
            self.started_at_ms = *started_at_ms;
            self.logical_now_ms = *started_at_ms;
        }
        let id = self.alloc_event_id();
        self.history.push(Event::new(id, kind));
        id
    }

    fn first_unclaimed_schedule(&self) -> Option<usize> {
        self.history
            .iter()
            .position(|e| e.kind.is_schedule() && !self.claimed_schedules.contains(&e.event_id))
    }

    pub(crate) fn find_completion(&self, schedule_id: u64) -> Option<&Event> {
        self.history
            .iter()
            .find(|e| e.kind.source_event_id() == Some(schedule_id))
    }

    fn next_unconsumed_index(&self) -> Option<usize> {
        self.history
            .iter()
            .position(|e| e.kind.is_consumable() && !self.consumed.contains(&e.event_id))
    }

    pub(crate) fn can_consume(&self, event_id: u64) -> bool {
        self.next_unconsumed_index()
            .map(|i| self.history[i].event_id == event_id)
            .unwrap_or(false)
    }

    pub(crate) fn mark_consumed(&mut self, event_id: u64) {
        if let Some(ev) = self.history.iter().find(|e| e.event_id == event_id) {
            if let EventKind::TimerFired { fire_at_ms, .. } = ev.kind {
                self.logical_now_ms = self.logical_now_ms.max(fire_at_ms);
            }
        }
        self.consumed.insert(event_id);
    }

    /// Replaying while the earliest unconsumed consumable still lies in the
    /// persisted region; live once the frontier is past it.
    fn is_replaying(&self) -> bool {
        self.next_unconsumed_index()
            .map(|i| i < self.persisted_len)
            .unwrap_or(false)
    }

    /// Whether cancellation preempts a wait on the given schedule. True when
    /// the schedule predates the cancel event and its completion is absent or
    /// recorded after the cancel. Replay-stable by construction.
    pub(crate) fn cancel_preempts(&self, schedule_id: u64) -> Option<String> {
        let (cancel_id, reason) = self.cancel.as_ref()?;
        if schedule_id >= *cancel_id {
            return None;
        }
        let completed_before_cancel = self
            .find_completion(schedule_id)
            .map(|e| e.event_id < *cancel_id)
            .unwrap_or(false);
        if completed_before_cancel {
            None
        } else {
            Some(reason.clone())
        }
    }

    /// Adopt the next recorded scheduling event or stage a fresh one. A
    /// recorded event that does not match what the code produced is
    /// nondeterminism and poisons the turn.
    fn claim_or_stage(&mut self, want: ScheduleRequest<'_>) -> Option<u64> {
        if self.nondet.is_some() {
            return None;
        }
        if let Some(idx) = self.first_unclaimed_schedule() {
            let ev = &self.history[idx];
            let matches = match (&ev.kind, &want) {
                (
                    EventKind::ActivityScheduled {
                        name,
                        input,
                        attempt,
                    },
                    ScheduleRequest::Activity {
                        name: want_name,
                        input: want_input,
                        attempt: want_attempt,
                    },
                ) => name == want_name && input == want_input && attempt == want_attempt,
                (
                    EventKind::TimerStarted { delay_ms },
                    ScheduleRequest::Timer {
                        delay_ms: want_delay,
                    },
                ) => delay_ms == want_delay,
                _ => false,
            };
            if matches {
                let id = ev.event_id;
                self.claimed_schedules.insert(id);
                return Some(id);
            }
            let produced = match &want {
                ScheduleRequest::Activity {
                    name,
                    input,
                    attempt,
                } => format!("ActivityScheduled({name}, {input}, attempt {attempt})"),
                ScheduleRequest::Timer { delay_ms } => format!("TimerStarted({delay_ms}ms)"),
            };
            self.nondet = Some(format!(
                "history event {} is {:?} but replayed code produced {}",
                ev.event_id, ev.kind, produced
            ));
            return None;
        }
        // Live frontier: record the schedule and emit its command.
        match want {
            ScheduleRequest::Activity {
                name,
                input,
                attempt,
            } => {
                let id = self.stage(EventKind::ActivityScheduled {
                    name: name.to_string(),
                    input: input.to_string(),
                    attempt,
                });
                self.claimed_schedules.insert(id);
                self.commands.push(Command::ScheduleActivity {
                    event_id: id,
                    name: name.to_string(),
                    input: input.to_string(),
                    attempt,
                });
                Some(id)
            }
            ScheduleRequest::Timer { delay_ms } => {
                let id = self.stage(EventKind::TimerStarted { delay_ms });
                self.claimed_schedules.insert(id);
                self.commands.push(Command::StartTimer {
                    event_id: id,
                    delay_ms,
                });
                Some(id)
            }
        }
    }
}

/// Deterministic handle workflow code uses to interact with the engine.
///
/// Cloneable; all clones share the turn's working history. Every method is
/// safe to call during replay: recorded events are adopted instead of
/// re-executed.
#[derive(Clone)]
pub struct WorkflowContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl WorkflowContext {
    pub(crate) fn new(workflow_id: impl Into<String>, run_id: u64, history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(workflow_id.into(), run_id, history))),
        }
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, CtxInner> {
        // The context mutex is only held for short, non-awaiting sections;
        // poisoning indicates an engine bug.
        self.inner.lock().expect("workflow context mutex poisoned")
    }

    pub fn workflow_id(&self) -> String {
        self.lock().workflow_id.clone()
    }

    pub fn run_id(&self) -> u64 {
        self.lock().run_id
    }

    /// Logical time: the run's start time advanced by fired timers. Stable
    /// under replay, unlike wall-clock reads.
    pub fn now_ms(&self) -> u64 {
        self.lock().logical_now_ms
    }

    /// Deterministic unique id; replays to the same value.
    pub fn new_guid(&self) -> String {
        let mut inner = self.lock();
        inner.guid_counter += 1;
        format!("{:#034x}", inner.guid_counter)
    }

    /// True while replaying recorded history. Used by the `wf_info!` family
    /// to suppress duplicate log output.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying()
    }

    /// Reason of the cancellation request once the executor has reached it.
    pub fn cancel_requested(&self) -> Option<String> {
        self.lock().cancel.as_ref().map(|(_, r)| r.clone())
    }

    /// Schedule a single activity attempt. Most code wants
    /// [`activity_with_retry`](Self::activity_with_retry) instead.
    pub fn activity(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> futures::ActivityFuture {
        self.activity_attempt(name.into(), input.into(), 1)
    }

    fn activity_attempt(&self, name: String, input: String, attempt: u32) -> futures::ActivityFuture {
        let schedule_id = self.lock().claim_or_stage(ScheduleRequest::Activity {
            name: &name,
            input: &input,
            attempt,
        });
        futures::ActivityFuture::new(self.clone(), schedule_id)
    }

    /// Durable timer; resolves when the fire event is applied, or with a
    /// cancellation error if the run is cancelled first.
    pub fn timer(&self, delay: Duration) -> futures::TimerFuture {
        let delay_ms = delay.as_millis() as u64;
        let schedule_id = self.lock().claim_or_stage(ScheduleRequest::Timer { delay_ms });
        futures::TimerFuture::new(self.clone(), schedule_id)
    }

    /// Invoke an activity under a retry policy. Each attempt is recorded in
    /// history with its attempt number; delays between attempts are durable
    /// timers; a per-attempt timeout races the attempt against a timer.
    /// Returns the final attempt's error on exhaustion.
    pub async fn activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: &RetryPolicy,
    ) -> Result<String, WorkflowError> {
        let name = name.into();
        let input = input.into();
        let mut attempt: u32 = 1;
        loop {
            let outcome = match policy.start_to_close_timeout_ms {
                None => self.activity_attempt(name.clone(), input.clone(), attempt).await,
                Some(timeout_ms) => {
                    let act = self.activity_attempt(name.clone(), input.clone(), attempt);
                    let deadline = self.timer(Duration::from_millis(timeout_ms));
                    match ::futures::future::select(act, deadline).await {
                        ::futures::future::Either::Left((result, _deadline)) => result,
                        ::futures::future::Either::Right((fired, _act)) => match fired {
                            Ok(()) => Err(WorkflowError::Timeout {
                                what: format!("activity {name} attempt {attempt}"),
                                after_ms: timeout_ms,
                            }),
                            Err(cancelled) => Err(cancelled),
                        },
                    }
                }
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !policy.permits_retry(&error, attempt) {
                        return Err(error);
                    }
                    crate::wf_warn!(
                        self,
                        activity = %name,
                        attempt,
                        error = %error,
                        "activity attempt failed; backing off before retry"
                    );
                    self.timer(policy.delay_for_attempt(attempt)).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Typed single-attempt activity call through the JSON codec.
    pub async fn activity_typed<In, Out>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<Out, WorkflowError>
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned,
    {
        use crate::_typed_codec::{Codec, Json};
        let payload = Json::encode(input).map_err(|e| WorkflowError::non_retryable("codec", e))?;
        let out = self.activity(name, payload).await?;
        Json::decode(&out).map_err(|e| WorkflowError::non_retryable("codec", e))
    }

    /// Suspend until the predicate over handler-visible state holds. The
    /// predicate is re-evaluated as each event is applied. With a deadline,
    /// a durable timer races the wait and a `Timeout` error reports the
    /// losing branch; the history order of the enabling event versus the
    /// timer fire decides the branch identically on replay.
    pub async fn wait_condition<S: Send + 'static>(
        &self,
        state: &StateHandle<S>,
        predicate: impl Fn(&S) -> bool + Send,
        deadline: Option<Duration>,
    ) -> Result<(), WorkflowError> {
        use std::future::Future as _;
        use std::pin::Pin;
        use std::task::Poll;
        let mut timer = deadline.map(|d| (self.timer(d), d.as_millis() as u64));
        ::futures::future::poll_fn(move |cx| {
            if state.read(|s| predicate(s)) {
                return Poll::Ready(Ok(()));
            }
            if let Some((t, after_ms)) = timer.as_mut() {
                match Pin::new(t).poll(cx) {
                    Poll::Ready(Ok(())) => {
                        return Poll::Ready(Err(WorkflowError::Timeout {
                            what: "condition wait".into(),
                            after_ms: *after_ms,
                        }))
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Pending => {}
                }
            }
            Poll::Pending
        })
        .await
    }

    /// Versioning gate. Returns whether the workflow may take the patched
    /// code path; pinned per run so the answer never flips within one run.
    pub fn patched(&self, patch_id: &str) -> bool {
        let mut inner = self.lock();
        if let Some(decision) = inner.patch_decisions.get(patch_id) {
            return *decision;
        }
        let marker_recorded = inner.history.iter().any(|e| {
            matches!(&e.kind, EventKind::PatchMarker { patch_id: p } if p == patch_id)
        });
        let decision = if marker_recorded {
            true
        } else if inner.is_replaying() {
            // Recorded by unpatched code; stay on the old path for this run.
            false
        } else {
            inner.stage(EventKind::PatchMarker {
                patch_id: patch_id.to_string(),
            });
            true
        };
        inner.patch_decisions.insert(patch_id.to_string(), decision);
        decision
    }

    /// Record the marker unconditionally on fresh executions without
    /// branching. Used once all histories predating the patch have drained.
    pub fn deprecate_patch(&self, patch_id: &str) {
        let mut inner = self.lock();
        if inner.patch_decisions.contains_key(patch_id) {
            return;
        }
        let marker_recorded = inner.history.iter().any(|e| {
            matches!(&e.kind, EventKind::PatchMarker { patch_id: p } if p == patch_id)
        });
        if !marker_recorded && !inner.is_replaying() {
            inner.stage(EventKind::PatchMarker {
                patch_id: patch_id.to_string(),
            });
        }
        inner.patch_decisions.insert(patch_id.to_string(), true);
    }

    /// End this run and start a successor with the given input. The returned
    /// future never resolves; the turn terminates once the request is seen.
    pub fn continue_as_new(&self, input: impl Into<String>) -> futures::ContinueAsNewFuture {
        self.lock().continue_as_new = Some(input.into());
        futures::ContinueAsNewFuture::default()
    }

    // Turn-side surface below: staging, cursor, and extraction.

    pub(crate) fn mark_persisted_here(&self) {
        let mut inner = self.lock();
        inner.persisted_len = inner.history.len();
    }

    pub(crate) fn stage_event(&self, kind: EventKind) -> u64 {
        self.lock().stage(kind)
    }

    pub(crate) fn with_history<R>(&self, f: impl FnOnce(&[Event]) -> R) -> R {
        f(&self.lock().history)
    }

    /// Earliest unconsumed consumable event, if any.
    pub(crate) fn next_routable(&self) -> Option<Event> {
        let inner = self.lock();
        inner.next_unconsumed_index().map(|i| inner.history[i].clone())
    }

    pub(crate) fn mark_consumed(&self, event_id: u64) {
        self.lock().mark_consumed(event_id);
    }

    pub(crate) fn is_cancelled_schedule(&self, schedule_id: u64) -> bool {
        self.lock().cancelled.contains(&schedule_id)
    }

    pub(crate) fn set_cancel(&self, event_id: u64, reason: String) {
        let mut inner = self.lock();
        if inner.cancel.is_none() {
            inner.cancel = Some((event_id, reason));
        }
    }

    pub(crate) fn take_commands(&self) -> Vec<Command> {
        std::mem::take(&mut self.lock().commands)
    }

    pub(crate) fn take_continue_as_new(&self) -> Option<String> {
        self.lock().continue_as_new.take()
    }

    pub(crate) fn nondet_reason(&self) -> Option<String> {
        self.lock().nondet.clone()
    }

    pub(crate) fn set_nondet(&self, reason: String) {
        let mut inner = self.lock();
        if inner.nondet.is_none() {
            inner.nondet = Some(reason);
        }
    }

    /// Events staged since the persisted watermark, in order.
    pub(crate) fn delta(&self) -> Vec<Event> {
        let inner = self.lock();
        inner.history[inner.persisted_len..].to_vec()
    }

    pub(crate) fn set_dehydrating(&self) {
        self.lock().dehydrating = true;
    }

    /// Snapshot of (history length, consumed count); the executor compares
    /// successive snapshots to detect quiescence.
    pub(crate) fn progress_marker(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.history.len(), inner.consumed.len())
    }
}

/// JSON codec used by the `_typed` API variants.
pub mod _typed_codec {
    use serde::{de::DeserializeOwned, Serialize};

    pub trait Codec {
        fn encode<T: Serialize>(value: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(value: &T) -> Result<String, String> {
            serde_json::to_string(value).map_err(|e| format!("encode: {e}"))
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            serde_json::from_str(s).map_err(|e| format!("decode: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(event_id: u64) -> Event {
        Event::new(
            event_id,
            EventKind::WorkflowStarted {
                name: "Demo".into(),
                version: "1.0.0".into(),
                input: "{}".into(),
                started_at_ms: 1_000,
                timeout_ms: None,
            },
        )
    }

    #[test]
    fn status_derivation() {
        assert_eq!(WorkflowStatus::from_history(&[]), WorkflowStatus::NotFound);
        let mut h = vec![started(1)];
        assert_eq!(WorkflowStatus::from_history(&h), WorkflowStatus::Running);
        h.push(Event::new(2, EventKind::WorkflowCompleted { output: "ok".into() }));
        assert_eq!(
            WorkflowStatus::from_history(&h),
            WorkflowStatus::Completed { output: "ok".into() }
        );

        let cancelled = vec![
            started(1),
            Event::new(
                2,
                EventKind::WorkflowFailed {
                    error: WorkflowError::Cancelled { reason: "op".into() },
                },
            ),
        ];
        assert_eq!(
            WorkflowStatus::from_history(&cancelled),
            WorkflowStatus::Cancelled { reason: "op".into() }
        );

        let timed_out = vec![
            started(1),
            Event::new(
                2,
                EventKind::WorkflowFailed {
                    error: WorkflowError::Timeout {
                        what: "workflow run".into(),
                        after_ms: 60_000,
                    },
                },
            ),
        ];
        assert_eq!(WorkflowStatus::from_history(&timed_out), WorkflowStatus::TimedOut);
    }

    #[test]
    fn fresh_schedule_stages_event_and_command() {
        let ctx = WorkflowContext::new("wf-1", 1, vec![started(1)]);
        ctx.mark_persisted_here();
        let fut = ctx.activity("Charge", "card-4");
        assert!(fut.schedule_id().is_some());
        let delta = ctx.delta();
        assert_eq!(delta.len(), 1);
        assert!(matches!(
            &delta[0].kind,
            EventKind::ActivityScheduled { name, attempt: 1, .. } if name == "Charge"
        ));
        let commands = ctx.take_commands();
        assert_eq!(commands.len(), 1);
        assert!(matches!(&commands[0], Command::ScheduleActivity { event_id: 2, .. }));
    }

    #[test]
    fn replay_claims_recorded_schedule_without_new_command() {
        let history = vec![
            started(1),
            Event::new(
                2,
                EventKind::ActivityScheduled {
                    name: "Charge".into(),
                    input: "card-4".into(),
                    attempt: 1,
                },
            ),
        ];
        let ctx = WorkflowContext::new("wf-1", 1, history);
        ctx.mark_persisted_here();
        let fut = ctx.activity("Charge", "card-4");
        assert_eq!(fut.schedule_id(), Some(2));
        assert!(ctx.delta().is_empty());
        assert!(ctx.take_commands().is_empty());
    }

    #[test]
    fn typed_activity_round_trips_through_json_codec() {
        use std::task::Poll;

        let history = vec![
            started(1),
            Event::new(
                2,
                EventKind::ActivityScheduled {
                    name: "Multiply".into(),
                    input: "[6,7]".into(),
                    attempt: 1,
                },
            ),
            Event::new(
                3,
                EventKind::ActivityCompleted {
                    source_event_id: 2,
                    result: "42".into(),
                },
            ),
        ];
        let ctx = WorkflowContext::new("wf-1", 1, history);
        ctx.mark_persisted_here();
        let input = (6_u32, 7_u32);
        let mut fut = Box::pin(ctx.activity_typed("Multiply", &input));
        assert_eq!(crate::futures::poll_once(&mut fut), Poll::Ready(Ok(42_u64)));
        assert!(ctx.delta().is_empty());
    }

    #[test]
    fn mismatched_replay_flags_nondeterminism() {
        let history = vec![
            started(1),
            Event::new(
                2,
                EventKind::ActivityScheduled {
                    name: "Charge".into(),
                    input: "card-4".into(),
                    attempt: 1,
                },
            ),
        ];
        let ctx = WorkflowContext::new("wf-1", 1, history);
        ctx.mark_persisted_here();
        let fut = ctx.activity("Refund", "card-4");
        assert!(fut.schedule_id().is_none());
        let reason = ctx.nondet_reason().unwrap();
        assert!(reason.contains("Refund"));
    }

    #[test]
    fn patched_pins_false_during_replay_and_true_at_frontier() {
        // Replaying history recorded without the marker: gate stays closed.
        let history = vec![
            started(1),
            Event::new(
                2,
                EventKind::ActivityScheduled {
                    name: "Step".into(),
                    input: String::new(),
                    attempt: 1,
                },
            ),
            Event::new(
                3,
                EventKind::ActivityCompleted {
                    source_event_id: 2,
                    result: "done".into(),
                },
            ),
        ];
        let ctx = WorkflowContext::new("wf-1", 1, history);
        ctx.mark_persisted_here();
        assert!(!ctx.patched("fix-rounding"));
        // Memoized even after the run goes live.
        ctx.mark_consumed(3);
        assert!(!ctx.patched("fix-rounding"));
        assert!(ctx.delta().is_empty());

        // Fresh execution at the frontier: marker recorded, gate open.
        let ctx = WorkflowContext::new("wf-2", 1, vec![started(1)]);
        ctx.mark_persisted_here();
        assert!(ctx.patched("fix-rounding"));
        assert!(ctx.patched("fix-rounding"));
        let delta = ctx.delta();
        assert_eq!(delta.len(), 1);
        assert!(matches!(
            &delta[0].kind,
            EventKind::PatchMarker { patch_id } if patch_id == "fix-rounding"
        ));
    }

    #[test]
    fn patched_adopts_recorded_marker() {
        let history = vec![
            started(1),
            Event::new(
                2,
                EventKind::PatchMarker {
                    patch_id: "fix-rounding".into(),
                },
            ),
        ];
        let ctx = WorkflowContext::new("wf-1", 1, history);
        ctx.mark_persisted_here();
        assert!(ctx.patched("fix-rounding"));
        assert!(ctx.delta().is_empty());
    }

    #[test]
    fn logical_clock_advances_on_timer_consumption() {
        let history = vec![
            started(1),
            Event::new(2, EventKind::TimerStarted { delay_ms: 5_000 }),
            Event::new(
                3,
                EventKind::TimerFired {
                    source_event_id: 2,
                    fire_at_ms: 6_000,
                },
            ),
        ];
        let ctx = WorkflowContext::new("wf-1", 1, history);
        ctx.mark_persisted_here();
        assert_eq!(ctx.now_ms(), 1_000);
        ctx.mark_consumed(3);
        assert_eq!(ctx.now_ms(), 6_000);
    }

    #[test]
    fn guid_sequence_is_deterministic() {
        let ctx = WorkflowContext::new("wf-1", 1, vec![started(1)]);
        let a1 = ctx.new_guid();
        let a2 = ctx.new_guid();
        let ctx2 = WorkflowContext::new("wf-1", 1, vec![started(1)]);
        assert_eq!(a1, ctx2.new_guid());
        assert_eq!(a2, ctx2.new_guid());
    }
}
