//! Repeat the body of an already-bracketed run.
//!
//! `repeat_as_stub_wrapper` expects a plan with one open/close pair and at
//! most one staging pass. The messages between open and close (except
//! `stage`/`unstage`) are recorded as they pass through the first time. When
//! the close message arrives it is held back, the recorded actions are
//! replayed `num_repeats - 1` more times, and only then is the close message
//! released. Staging and the run bracket therefore happen once while the
//! actions execute `num_repeats` times.
//!
//! ```text
//! open(num_repeats=N) stage A... close unstage
//!                           └─ A replayed N-1 times before close
//! ```
//!
//! Replayed messages are submitted exactly as first produced. Their responses
//! are not fed back to the wrapped plan, which stays suspended at the close
//! message until the replay ends. A second or nested bracket is rejected by
//! throwing `InvalidPlan` into the wrapped plan.
//!
//! If a replayed action fails, the held close message is released with the
//! failure's `exit_status`/`reason`, and the error is thrown into the wrapped
//! plan once the close has been answered. The run is closed exactly once.

use super::run::{close_status, RunTags};
use crate::error::{PlanError, PlanResult};
use crate::experiment::generator::{BoxedGenerator, MsgGenerator, Resume, Step};
use crate::experiment::msg::{commands, Msg};
use serde_json::Value;
use tracing::debug;

/// Kwarg added to the open message.
pub const NUM_REPEATS_KEY: &str = "num_repeats";

/// Replay the actions inside `plan`'s run bracket `num_repeats` times in
/// total, under the single run.
pub fn repeat_as_stub_wrapper(plan: BoxedGenerator, num_repeats: usize) -> PlanResult<BoxedGenerator> {
    repeat_as_stub_with_tags(plan, num_repeats, &RunTags::default())
}

/// [`repeat_as_stub_wrapper`] with custom command tags.
pub fn repeat_as_stub_with_tags(
    plan: BoxedGenerator,
    num_repeats: usize,
    tags: &RunTags,
) -> PlanResult<BoxedGenerator> {
    if num_repeats == 0 {
        return Err(PlanError::InvalidPlan(
            "num_repeats must be at least 1".to_string(),
        ));
    }
    Ok(Box::new(RepeatAsStub {
        plan,
        num_repeats,
        tags: tags.clone(),
        phase: Phase::BeforeOpen,
        actions: Vec::new(),
        held_close: None,
        replay_error: None,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    BeforeOpen,
    InRun,
    /// `pass` counts completed executions of the actions, the original one
    /// included; `index` is the action currently in flight.
    Replaying { pass: usize, index: usize },
    /// A replayed action failed; the annotated close message is in flight.
    ClosingAfterError,
    AfterClose,
}

struct RepeatAsStub {
    plan: BoxedGenerator,
    num_repeats: usize,
    tags: RunTags,
    phase: Phase,
    actions: Vec<Msg>,
    held_close: Option<Msg>,
    replay_error: Option<PlanError>,
}

impl RepeatAsStub {
    fn observe(&mut self, step: Step) -> Step {
        let Step::Yield(mut msg) = step else {
            return step;
        };
        let is_open = msg.is(&self.tags.open);
        match self.phase {
            Phase::BeforeOpen if is_open => {
                msg.kwargs
                    .insert(NUM_REPEATS_KEY.to_string(), Value::from(self.num_repeats));
                self.phase = Phase::InRun;
                Step::Yield(msg)
            }
            Phase::InRun | Phase::AfterClose if is_open => {
                self.reject("repeat_as_stub supports exactly one run bracket")
            }
            Phase::InRun if msg.is(&self.tags.close) => {
                if self.num_repeats > 1 && !self.actions.is_empty() {
                    debug!(
                        actions = self.actions.len(),
                        replays = self.num_repeats - 1,
                        "replaying run actions"
                    );
                    self.held_close = Some(msg);
                    self.phase = Phase::Replaying { pass: 1, index: 0 };
                    Step::Yield(self.actions[0].clone())
                } else {
                    self.phase = Phase::AfterClose;
                    Step::Yield(msg)
                }
            }
            Phase::InRun => {
                if !msg.is(commands::STAGE) && !msg.is(commands::UNSTAGE) {
                    self.actions.push(msg.clone());
                }
                Step::Yield(msg)
            }
            Phase::BeforeOpen
            | Phase::AfterClose
            | Phase::Replaying { .. }
            | Phase::ClosingAfterError => Step::Yield(msg),
        }
    }

    /// Advance the replay after the in-flight action completed.
    fn next_replayed(&mut self, mut pass: usize, mut index: usize) -> Step {
        index += 1;
        if index == self.actions.len() {
            index = 0;
            pass += 1;
        }
        if pass < self.num_repeats {
            self.phase = Phase::Replaying { pass, index };
            return Step::Yield(self.actions[index].clone());
        }
        self.phase = Phase::AfterClose;
        match self.held_close.take() {
            Some(close) => Step::Yield(close),
            None => self.plan.resume(Resume::Next),
        }
    }

    /// Close the run for a failed replay, or hand the error straight to the
    /// plan if there is no held close.
    fn close_after_replay_error(&mut self, err: PlanError) -> Step {
        let Some(mut close) = self.held_close.take() else {
            self.phase = Phase::AfterClose;
            let step = self.plan.resume(Resume::Throw(err));
            return self.observe(step);
        };
        let (status, reason) = close_status(&err);
        debug!(status, error = %err, "replay failed, closing run");
        close
            .kwargs
            .insert("exit_status".to_string(), Value::from(status));
        if let Some(reason) = reason {
            close.kwargs.insert("reason".to_string(), Value::from(reason));
        }
        self.replay_error = Some(err);
        self.phase = Phase::ClosingAfterError;
        Step::Yield(close)
    }

    fn reject(&mut self, reason: &str) -> Step {
        debug!(reason, "rejecting plan");
        let step = self.plan.resume(Resume::Throw(PlanError::InvalidPlan(reason.to_string())));
        self.observe(step)
    }
}

impl MsgGenerator for RepeatAsStub {
    fn resume(&mut self, input: Resume) -> Step {
        let input = match self.phase {
            Phase::Replaying { pass, index } => match input {
                Resume::Throw(err) => return self.close_after_replay_error(err),
                Resume::Next | Resume::Send(_) => return self.next_replayed(pass, index),
            },
            Phase::ClosingAfterError => {
                // The wrapped plan is still suspended at its own close message.
                self.phase = Phase::AfterClose;
                match (self.replay_error.take(), input) {
                    (Some(err), _) => Resume::Throw(err),
                    (None, input) => input,
                }
            }
            _ => input,
        };
        let step = self.plan.resume(input);
        self.observe(step)
    }
}
