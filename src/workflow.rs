//! Typed workflow definitions.
//!
//! A workflow couples a deterministic main body with named handlers over
//! shared typed state: signals mutate state, queries read it, updates run
//! as durable child futures with an optional synchronous validator.
//! [`WorkflowDefinition`] is the builder surface; the executor drives the
//! type-erased [`WorkflowSession`] one poll at a time, so handler
//! execution is interleaved deterministically with history consumption.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Poll;

use futures::future::BoxFuture;

use crate::{AppError, WorkflowContext, WorkflowError};

type InitFn<S> = Arc<dyn Fn(&str) -> S + Send + Sync>;
type BodyFn<S> = Arc<
    dyn Fn(WorkflowContext, StateHandle<S>, String) -> BoxFuture<'static, Result<String, WorkflowError>>
        + Send
        + Sync,
>;
type SignalFn<S> = Arc<dyn Fn(&mut S, &str) -> Result<(), AppError> + Send + Sync>;
type QueryFn<S> = Arc<dyn Fn(&S, &str) -> Result<String, AppError> + Send + Sync>;
type ValidatorFn<S> = Arc<dyn Fn(&S, &str) -> Result<(), String> + Send + Sync>;

/// Shared handle to a workflow's typed state.
///
/// The main body and every handler see the same state. Access goes through
/// short closures so the lock is released before any await point; holding
/// it across awaits is impossible through this API.
pub struct StateHandle<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for StateHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> StateHandle<S> {
    pub(crate) fn new(state: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Read the state through a closure.
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.lock())
    }

    /// Mutate the state through a closure.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock().expect("workflow state mutex poisoned")
    }
}

impl<S: Clone> StateHandle<S> {
    /// Clone the current state out of the handle.
    pub fn snapshot(&self) -> S {
        self.read(|s| s.clone())
    }
}

pub(crate) struct UpdateDef<S> {
    pub(crate) validator: Option<ValidatorFn<S>>,
    pub(crate) handler: BodyFn<S>,
}

impl<S> Clone for UpdateDef<S> {
    fn clone(&self) -> Self {
        Self {
            validator: self.validator.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// Builder for a workflow: a name, a state initializer, a main body, and
/// handler sets keyed by name.
///
/// ```ignore
/// let def = WorkflowDefinition::new("order", |_| OrderState::default())
///     .run(|ctx, state, input| async move { /* deterministic body */ })
///     .on_signal("add_item", |s: &mut OrderState, input| { /* mutate */ Ok(()) })
///     .on_query("get_total", |s, _| Ok(s.total.to_string()));
/// ```
pub struct WorkflowDefinition<S> {
    name: String,
    init: InitFn<S>,
    run: Option<BodyFn<S>>,
    signals: HashMap<String, SignalFn<S>>,
    queries: HashMap<String, QueryFn<S>>,
    updates: HashMap<String, UpdateDef<S>>,
}

impl<S: Send + 'static> WorkflowDefinition<S> {
    /// Start a definition. `init` derives the initial state from the start
    /// input and runs once per run, before the main body is first polled.
    pub fn new<I>(name: impl Into<String>, init: I) -> Self
    where
        I: Fn(&str) -> S + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            init: Arc::new(init),
            run: None,
            signals: HashMap::new(),
            queries: HashMap::new(),
            updates: HashMap::new(),
        }
    }

    /// The main body. Must be deterministic: all I/O through the context.
    pub fn run<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WorkflowContext, StateHandle<S>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, WorkflowError>> + Send + 'static,
    {
        self.run = Some(Arc::new(move |ctx, state, input| Box::pin(f(ctx, state, input))));
        self
    }

    /// Register a signal handler: fire-and-forget state mutation. Handler
    /// errors are logged and dropped; a signal can never fail the run.
    pub fn on_signal<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut S, &str) -> Result<(), AppError> + Send + Sync + 'static,
    {
        self.signals.insert(name.into(), Arc::new(f));
        self
    }

    /// Register a query handler: synchronous read over current state. Must
    /// not mutate state or touch the context.
    pub fn on_query<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&S, &str) -> Result<String, AppError> + Send + Sync + 'static,
    {
        self.queries.insert(name.into(), Arc::new(f));
        self
    }

    /// Register an update handler with no validator: every request is
    /// accepted and the handler runs as a durable child future.
    pub fn on_update<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext, StateHandle<S>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, WorkflowError>> + Send + 'static,
    {
        self.updates.insert(
            name.into(),
            UpdateDef {
                validator: None,
                handler: Arc::new(move |ctx, state, input| Box::pin(f(ctx, state, input))),
            },
        );
        self
    }

    /// Register an update handler behind a validator. The validator is a
    /// pure read over current state; rejection leaves no trace in history.
    pub fn on_update_validated<V, F, Fut>(mut self, name: impl Into<String>, validator: V, f: F) -> Self
    where
        V: Fn(&S, &str) -> Result<(), String> + Send + Sync + 'static,
        F: Fn(WorkflowContext, StateHandle<S>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, WorkflowError>> + Send + 'static,
    {
        self.updates.insert(
            name.into(),
            UpdateDef {
                validator: Some(Arc::new(validator)),
                handler: Arc::new(move |ctx, state, input| Box::pin(f(ctx, state, input))),
            },
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn has_run_body(&self) -> bool {
        self.run.is_some()
    }
}

impl WorkflowDefinition<()> {
    /// A workflow that is just a main body, with no state or handlers.
    pub fn function<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, WorkflowError>> + Send + 'static,
    {
        Self::new(name, |_| ()).run(move |ctx, _state, input| f(ctx, input))
    }
}

/// Type-erased workflow factory held by the registry.
pub trait WorkflowHandler: Send + Sync {
    /// Name as registered and as recorded in `WorkflowStarted`.
    fn name(&self) -> &str;

    /// Build a fresh session for one hydration of a run. The session owns
    /// the main future, the live update futures, and the typed state.
    fn create_session(&self, ctx: WorkflowContext, input: String) -> Box<dyn WorkflowSession>;
}

/// One hydration of a running workflow, driven by the executor.
///
/// Sessions are rebuilt from scratch on every hydration; replay restores
/// their position by re-applying history through the context cursor.
pub trait WorkflowSession: Send {
    /// Poll the main body once with a noop waker.
    fn poll_main(&mut self) -> Poll<Result<String, WorkflowError>>;

    /// Apply a signal to state. Unknown names and handler errors are
    /// logged and dropped.
    fn apply_signal(&mut self, name: &str, input: &str);

    /// Run a query against current state. `Err` carries the reason string
    /// returned to the caller.
    fn run_query(&self, name: &str, input: &str) -> Result<String, String>;

    /// Run an update validator against current state. `Err` is the
    /// rejection reason; unknown update names reject.
    fn validate_update(&self, name: &str, input: &str) -> Result<(), String>;

    /// Instantiate an accepted update's handler future. Called both for
    /// fresh acceptances and when replay re-applies `UpdateAccepted`.
    fn start_update(&mut self, update_id: &str, name: &str, input: &str);

    /// Poll live update futures once each, in acceptance order, and return
    /// the ones that finished.
    fn poll_updates(&mut self) -> Vec<(String, Result<String, WorkflowError>)>;

    /// Number of update futures still running.
    fn active_updates(&self) -> usize;

    fn update_in_flight(&self, update_id: &str) -> bool;
}

struct UpdateTask {
    update_id: String,
    fut: BoxFuture<'static, Result<String, WorkflowError>>,
}

struct TypedSession<S> {
    ctx: WorkflowContext,
    state: StateHandle<S>,
    signals: HashMap<String, SignalFn<S>>,
    queries: HashMap<String, QueryFn<S>>,
    update_defs: HashMap<String, UpdateDef<S>>,
    main: BoxFuture<'static, Result<String, WorkflowError>>,
    main_result: Option<Result<String, WorkflowError>>,
    in_flight: Vec<UpdateTask>,
}

impl<S: Send + 'static> WorkflowHandler for WorkflowDefinition<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_session(&self, ctx: WorkflowContext, input: String) -> Box<dyn WorkflowSession> {
        let state = StateHandle::new((self.init)(&input));
        let main: BoxFuture<'static, Result<String, WorkflowError>> = match &self.run {
            Some(body) => body(ctx.clone(), state.clone(), input),
            None => {
                let name = self.name.clone();
                Box::pin(async move {
                    Err(WorkflowError::configuration(format!(
                        "workflow '{name}' has no run body"
                    )))
                })
            }
        };
        Box::new(TypedSession {
            ctx,
            state,
            signals: self.signals.clone(),
            queries: self.queries.clone(),
            update_defs: self.updates.clone(),
            main,
            main_result: None,
            in_flight: Vec::new(),
        })
    }
}

impl<S: Send + 'static> WorkflowSession for TypedSession<S> {
    fn poll_main(&mut self) -> Poll<Result<String, WorkflowError>> {
        if let Some(result) = &self.main_result {
            return Poll::Ready(result.clone());
        }
        match crate::futures::poll_once(&mut self.main) {
            Poll::Ready(result) => {
                self.main_result = Some(result.clone());
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn apply_signal(&mut self, name: &str, input: &str) {
        match self.signals.get(name) {
            Some(handler) => {
                if let Err(err) = self.state.mutate(|s| handler(s, input)) {
                    crate::wf_warn!(self.ctx, signal = name, error = %err, "signal handler failed, dropping signal");
                }
            }
            None => {
                crate::wf_warn!(self.ctx, signal = name, "no signal handler registered, dropping signal");
            }
        }
    }

    fn run_query(&self, name: &str, input: &str) -> Result<String, String> {
        let handler = self
            .queries
            .get(name)
            .ok_or_else(|| format!("no query handler named '{name}'"))?;
        self.state.read(|s| handler(s, input)).map_err(|e| e.to_string())
    }

    fn validate_update(&self, name: &str, input: &str) -> Result<(), String> {
        let def = self
            .update_defs
            .get(name)
            .ok_or_else(|| format!("no update handler named '{name}'"))?;
        match &def.validator {
            Some(validator) => self.state.read(|s| validator(s, input)),
            None => Ok(()),
        }
    }

    fn start_update(&mut self, update_id: &str, name: &str, input: &str) {
        let fut: BoxFuture<'static, Result<String, WorkflowError>> = match self.update_defs.get(name) {
            Some(def) => (def.handler)(self.ctx.clone(), self.state.clone(), input.to_string()),
            None => {
                // Accepted in a prior deployment, handler gone in this one.
                let missing = format!("no update handler named '{name}'");
                Box::pin(async move { Err(WorkflowError::configuration(missing)) })
            }
        };
        self.in_flight.push(UpdateTask {
            update_id: update_id.to_string(),
            fut,
        });
    }

    fn poll_updates(&mut self) -> Vec<(String, Result<String, WorkflowError>)> {
        let mut finished = Vec::new();
        let mut still_running = Vec::with_capacity(self.in_flight.len());
        for mut task in std::mem::take(&mut self.in_flight) {
            match crate::futures::poll_once(&mut task.fut) {
                Poll::Ready(result) => finished.push((task.update_id, result)),
                Poll::Pending => still_running.push(task),
            }
        }
        self.in_flight = still_running;
        finished
    }

    fn active_updates(&self) -> usize {
        self.in_flight.len()
    }

    fn update_in_flight(&self, update_id: &str) -> bool {
        self.in_flight.iter().any(|t| t.update_id == update_id)
    }
}
