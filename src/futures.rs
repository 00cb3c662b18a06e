//! Correlation futures connecting workflow code to recorded history.
//!
//! Each future is bound to a scheduling event and resolves by consuming the
//! matching completion event, but only once that completion is the earliest
//! unconsumed one (FIFO discipline). The single total order this enforces is
//! what makes live execution and replay indistinguishable, and it is also why
//! standard combinators like `futures::future::select` arbitrate
//! deterministically: whichever branch's completion is earlier in history
//! wins regardless of poll order.
//!
//! Dropping an unresolved future records its schedule as cancelled so late
//! completions are skipped instead of blocking the cursor. Teardown at the
//! end of a turn sets the dehydrating flag first, which suppresses that
//! bookkeeping.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use futures::future::FusedFuture;

use crate::{EventKind, WorkflowContext, WorkflowError};

/// Resolves to the result of one recorded activity attempt.
#[must_use = "futures do nothing unless awaited"]
pub struct ActivityFuture {
    /// None when scheduling was refused because the turn is already poisoned
    /// by nondeterminism; the future then stays pending forever.
    schedule_id: Option<u64>,
    ctx: WorkflowContext,
    consumed: Cell<bool>,
}

impl ActivityFuture {
    pub(crate) fn new(ctx: WorkflowContext, schedule_id: Option<u64>) -> Self {
        Self {
            schedule_id,
            ctx,
            consumed: Cell::new(false),
        }
    }

    pub(crate) fn schedule_id(&self) -> Option<u64> {
        self.schedule_id
    }
}

impl Future for ActivityFuture {
    type Output = Result<String, WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.consumed.get() {
            return Poll::Pending;
        }
        let Some(schedule_id) = self.schedule_id else {
            return Poll::Pending;
        };
        let mut inner = self.ctx.lock();
        if inner.nondet.is_some() {
            return Poll::Pending;
        }
        if let Some(reason) = inner.cancel_preempts(schedule_id) {
            inner.cancelled.insert(schedule_id);
            drop(inner);
            self.consumed.set(true);
            return Poll::Ready(Err(WorkflowError::Cancelled { reason }));
        }
        let completion = inner.find_completion(schedule_id).cloned();
        if let Some(ev) = completion {
            if inner.can_consume(ev.event_id) {
                inner.mark_consumed(ev.event_id);
                drop(inner);
                self.consumed.set(true);
                return Poll::Ready(match ev.kind {
                    EventKind::ActivityCompleted { result, .. } => Ok(result),
                    EventKind::ActivityFailed { error, .. } => Err(error),
                    other => {
                        self.ctx.set_nondet(format!(
                            "event {} completes an activity schedule but is {:?}",
                            ev.event_id, other
                        ));
                        return Poll::Pending;
                    }
                });
            }
        }
        Poll::Pending
    }
}

impl FusedFuture for ActivityFuture {
    fn is_terminated(&self) -> bool {
        self.consumed.get()
    }
}

impl Drop for ActivityFuture {
    fn drop(&mut self) {
        if self.consumed.get() {
            return;
        }
        let Some(schedule_id) = self.schedule_id else {
            return;
        };
        let Ok(mut inner) = self.ctx.inner.try_lock() else {
            return;
        };
        // Dehydrating teardown is suspension, not cancellation.
        if inner.dehydrating {
            return;
        }
        inner.cancelled.insert(schedule_id);
    }
}

/// Resolves when the timer's fire event is applied, or with a cancellation
/// error if the run was cancelled while the timer was pending.
#[must_use = "futures do nothing unless awaited"]
pub struct TimerFuture {
    schedule_id: Option<u64>,
    ctx: WorkflowContext,
    consumed: Cell<bool>,
}

impl TimerFuture {
    pub(crate) fn new(ctx: WorkflowContext, schedule_id: Option<u64>) -> Self {
        Self {
            schedule_id,
            ctx,
            consumed: Cell::new(false),
        }
    }

    pub(crate) fn schedule_id(&self) -> Option<u64> {
        self.schedule_id
    }
}

impl Future for TimerFuture {
    type Output = Result<(), WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.consumed.get() {
            return Poll::Pending;
        }
        let Some(schedule_id) = self.schedule_id else {
            return Poll::Pending;
        };
        let mut inner = self.ctx.lock();
        if inner.nondet.is_some() {
            return Poll::Pending;
        }
        if let Some(reason) = inner.cancel_preempts(schedule_id) {
            inner.cancelled.insert(schedule_id);
            drop(inner);
            self.consumed.set(true);
            return Poll::Ready(Err(WorkflowError::Cancelled { reason }));
        }
        let completion = inner.find_completion(schedule_id).cloned();
        if let Some(ev) = completion {
            if inner.can_consume(ev.event_id) {
                inner.mark_consumed(ev.event_id);
                drop(inner);
                self.consumed.set(true);
                return Poll::Ready(match ev.kind {
                    EventKind::TimerFired { .. } => Ok(()),
                    other => {
                        self.ctx.set_nondet(format!(
                            "event {} completes a timer schedule but is {:?}",
                            ev.event_id, other
                        ));
                        return Poll::Pending;
                    }
                });
            }
        }
        Poll::Pending
    }
}

impl FusedFuture for TimerFuture {
    fn is_terminated(&self) -> bool {
        self.consumed.get()
    }
}

impl Drop for TimerFuture {
    fn drop(&mut self) {
        if self.consumed.get() {
            return;
        }
        let Some(schedule_id) = self.schedule_id else {
            return;
        };
        let Ok(mut inner) = self.ctx.inner.try_lock() else {
            return;
        };
        if inner.dehydrating {
            return;
        }
        inner.cancelled.insert(schedule_id);
    }
}

/// Returned by `WorkflowContext::continue_as_new`; never resolves. The turn
/// terminates once the staged request is observed.
#[must_use = "futures do nothing unless awaited"]
#[derive(Default)]
pub struct ContinueAsNewFuture {
    _private: (),
}

impl Future for ContinueAsNewFuture {
    type Output = Result<String, WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Pending
    }
}

pub(crate) fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

/// Single manual poll with a no-op waker. The turn executor re-polls after
/// every event application, so wakers carry no information here.
pub(crate) fn poll_once<F: Future + Unpin + ?Sized>(fut: &mut F) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    Pin::new(fut).poll(&mut cx)
}
