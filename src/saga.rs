//! Compensation accumulator for saga-style workflows.
//!
//! As forward steps succeed, the workflow registers the activity that
//! undoes each one. On failure it runs the registered compensations in
//! reverse order. Compensations are ordinary activities: scheduled,
//! recorded, and retried like any other, so a run that is compensating
//! replays exactly like a run that is progressing.

use crate::{RetryPolicy, WorkflowContext};

struct Step {
    activity: String,
    input: String,
    policy: RetryPolicy,
}

/// LIFO list of compensating activities.
///
/// ```ignore
/// let mut comp = Compensations::new();
/// let car = ctx.activity("reserve_car", &req).await?;
/// comp.add("release_car", &car);
/// let hotel = ctx.activity("reserve_hotel", &req).await?;
/// comp.add("release_hotel", &hotel);
/// if let Err(err) = ctx.activity("book_flight", &req).await {
///     comp.run(&ctx).await;
///     return Err(err);
/// }
/// ```
#[derive(Default)]
pub struct Compensations {
    steps: Vec<Step>,
}

impl Compensations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compensating activity with the default policy: up to
    /// three attempts per step.
    pub fn add(&mut self, activity: impl Into<String>, input: impl Into<String>) {
        self.add_with_policy(activity, input, RetryPolicy::default().with_maximum_attempts(3));
    }

    pub fn add_with_policy(
        &mut self,
        activity: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) {
        self.steps.push(Step {
            activity: activity.into(),
            input: input.into(),
            policy,
        });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run all registered compensations, newest first. A failed step is
    /// logged and the remainder still runs; returns how many steps failed
    /// after their retries were exhausted.
    pub async fn run(&self, ctx: &WorkflowContext) -> usize {
        let mut failed = 0;
        for step in self.steps.iter().rev() {
            match ctx
                .activity_with_retry(&step.activity, &step.input, &step.policy)
                .await
            {
                Ok(_) => {}
                Err(err) => {
                    failed += 1;
                    crate::wf_warn!(
                        ctx,
                        compensation = %step.activity,
                        error = %err,
                        "compensation failed, continuing with remaining steps"
                    );
                }
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Command, EventKind, WorkflowError};
    use std::task::Poll;

    fn poll<F: std::future::Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        crate::futures::poll_once(fut)
    }

    #[test]
    fn compensations_run_newest_first() {
        let ctx = WorkflowContext::new("saga-test", 1, Vec::new());
        let mut comp = Compensations::new();
        comp.add("release_car", "car-9");
        comp.add("release_hotel", "hotel-2");

        let mut fut = Box::pin(comp.run(&ctx));

        assert!(poll(&mut fut).is_pending());
        let commands = ctx.take_commands();
        match &commands[..] {
            [Command::ScheduleActivity { event_id, name, .. }] => {
                assert_eq!(name, "release_hotel");
                ctx.stage_event(EventKind::ActivityCompleted {
                    source_event_id: *event_id,
                    result: "ok".to_string(),
                });
            }
            other => panic!("expected one schedule command, got {other:?}"),
        }

        assert!(poll(&mut fut).is_pending());
        let commands = ctx.take_commands();
        match &commands[..] {
            [Command::ScheduleActivity { event_id, name, .. }] => {
                assert_eq!(name, "release_car");
                ctx.stage_event(EventKind::ActivityCompleted {
                    source_event_id: *event_id,
                    result: "ok".to_string(),
                });
            }
            other => panic!("expected one schedule command, got {other:?}"),
        }

        assert_eq!(poll(&mut fut), Poll::Ready(0));
    }

    #[test]
    fn failed_step_does_not_block_the_rest() {
        let ctx = WorkflowContext::new("saga-test", 1, Vec::new());
        let mut comp = Compensations::new();
        comp.add_with_policy("release_car", "car-9", RetryPolicy::no_retry());
        comp.add_with_policy("release_hotel", "hotel-2", RetryPolicy::no_retry());

        let mut fut = Box::pin(comp.run(&ctx));

        assert!(poll(&mut fut).is_pending());
        let commands = ctx.take_commands();
        match &commands[..] {
            [Command::ScheduleActivity { event_id, name, .. }] => {
                assert_eq!(name, "release_hotel");
                ctx.stage_event(EventKind::ActivityFailed {
                    source_event_id: *event_id,
                    error: WorkflowError::non_retryable("gone", "already released"),
                });
            }
            other => panic!("expected one schedule command, got {other:?}"),
        }

        assert!(poll(&mut fut).is_pending());
        let commands = ctx.take_commands();
        match &commands[..] {
            [Command::ScheduleActivity { event_id, name, .. }] => {
                assert_eq!(name, "release_car");
                ctx.stage_event(EventKind::ActivityCompleted {
                    source_event_id: *event_id,
                    result: "ok".to_string(),
                });
            }
            other => panic!("expected one schedule command, got {other:?}"),
        }

        assert_eq!(poll(&mut fut), Poll::Ready(1));
    }
}
