//! Structured recovery around a plan.
//!
//! A contingency drives the wrapped plan and, depending on how it ends,
//! continues with one of three optional follow-up plans:
//!
//! ```text
//!           ┌── Return ──▶ else_plan ──┐
//!  plan ────┤                          ├──▶ final_plan ──▶ outcome
//!           └── Raise(e) ─▶ except_plan(e) ┘
//! ```
//!
//! Outcome rules:
//!
//! - the plan returns: the wrapper returns the plan's result
//! - the plan raises `e` and `except_plan` returns `v`: `e` is re-raised when
//!   `auto_raise` is set, otherwise the wrapper returns `v`
//! - `except_plan` (or `else_plan`) raises `e2`: `e2` propagates
//! - `final_plan` raises: its error replaces any previous outcome
//!
//! Errors thrown in by the driver are forwarded to whichever plan is active.
//! They only reach `except_plan` if the wrapped plan lets them propagate.

use crate::error::PlanError;
use crate::experiment::generator::{BoxedGenerator, MsgGenerator, Resume, Step};
use serde_json::Value;
use tracing::{debug, warn};

/// Builds the recovery plan from the error.
pub type RecoveryFn = Box<dyn FnOnce(PlanError) -> BoxedGenerator + Send>;
/// Builds a follow-up plan.
pub type FollowUpFn = Box<dyn FnOnce() -> BoxedGenerator + Send>;

/// Follow-up plans and error policy for one contingency.
pub struct Contingency {
    except_plan: Option<RecoveryFn>,
    else_plan: Option<FollowUpFn>,
    final_plan: Option<FollowUpFn>,
    auto_raise: bool,
}

impl Default for Contingency {
    fn default() -> Self {
        Self {
            except_plan: None,
            else_plan: None,
            final_plan: None,
            auto_raise: true,
        }
    }
}

impl Contingency {
    /// No follow-ups, `auto_raise` on.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan to run with the error when the wrapped plan raises.
    pub fn on_error<F>(mut self, except_plan: F) -> Self
    where
        F: FnOnce(PlanError) -> BoxedGenerator + Send + 'static,
    {
        self.except_plan = Some(Box::new(except_plan));
        self
    }

    /// Plan to run only when the wrapped plan returns normally.
    pub fn on_success<F>(mut self, else_plan: F) -> Self
    where
        F: FnOnce() -> BoxedGenerator + Send + 'static,
    {
        self.else_plan = Some(Box::new(else_plan));
        self
    }

    /// Plan to run last, whatever happened before.
    pub fn finally<F>(mut self, final_plan: F) -> Self
    where
        F: FnOnce() -> BoxedGenerator + Send + 'static,
    {
        self.final_plan = Some(Box::new(final_plan));
        self
    }

    /// Re-raise the wrapped plan's error after recovery. Defaults to `true`.
    pub fn auto_raise(mut self, auto_raise: bool) -> Self {
        self.auto_raise = auto_raise;
        self
    }

    /// Apply to `plan`.
    pub fn wrap(self, plan: BoxedGenerator) -> BoxedGenerator {
        Box::new(ContingencyWrapper {
            plan: Some(plan),
            active: None,
            phase: Phase::Fresh,
            options: self,
            result: Value::Null,
            error: None,
        })
    }
}

/// Run `except_plan` if `plan` raises.
pub fn contingency_wrapper<F>(plan: BoxedGenerator, except_plan: F, auto_raise: bool) -> BoxedGenerator
where
    F: FnOnce(PlanError) -> BoxedGenerator + Send + 'static,
{
    Contingency::new()
        .on_error(except_plan)
        .auto_raise(auto_raise)
        .wrap(plan)
}

/// Run `final_plan` after `plan` however it ends.
pub fn finalize_wrapper<F>(plan: BoxedGenerator, final_plan: F) -> BoxedGenerator
where
    F: FnOnce() -> BoxedGenerator + Send + 'static,
{
    Contingency::new().finally(final_plan).wrap(plan)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fresh,
    Body,
    Except,
    Else,
    Final,
    Done,
}

struct ContingencyWrapper {
    plan: Option<BoxedGenerator>,
    active: Option<BoxedGenerator>,
    phase: Phase,
    options: Contingency,
    result: Value,
    error: Option<PlanError>,
}

impl ContingencyWrapper {
    /// Decide what to drive next after the active producer finished.
    fn advance(&mut self, outcome: Result<Value, PlanError>) -> Option<BoxedGenerator> {
        match (self.phase, outcome) {
            (Phase::Body, Ok(value)) => {
                self.result = value;
                match self.options.else_plan.take() {
                    Some(else_plan) => {
                        self.phase = Phase::Else;
                        Some(else_plan())
                    }
                    None => self.enter_final(),
                }
            }
            (Phase::Body, Err(err)) => match self.options.except_plan.take() {
                Some(except_plan) => {
                    debug!(error = %err, "plan raised, running except plan");
                    self.phase = Phase::Except;
                    self.error = Some(err.clone());
                    Some(except_plan(err))
                }
                None => {
                    self.error = Some(err);
                    self.enter_final()
                }
            },
            (Phase::Except, Ok(value)) => {
                if !self.options.auto_raise {
                    if let Some(err) = self.error.take() {
                        warn!(error = %err, "plan error suppressed by except plan");
                    }
                    self.result = value;
                }
                self.enter_final()
            }
            (Phase::Except | Phase::Else, Err(err)) => {
                debug!(error = %err, "recovery plan raised");
                self.error = Some(err);
                self.enter_final()
            }
            (Phase::Else, Ok(_)) => self.enter_final(),
            (Phase::Final, Ok(_)) => None,
            (Phase::Final, Err(err)) => {
                self.error = Some(err);
                None
            }
            (Phase::Fresh | Phase::Done, _) => None,
        }
    }

    fn enter_final(&mut self) -> Option<BoxedGenerator> {
        let final_plan = self.options.final_plan.take()?;
        self.phase = Phase::Final;
        Some(final_plan())
    }

    fn finish(&mut self) -> Step {
        self.phase = Phase::Done;
        match self.error.take() {
            Some(err) => Step::Raise(err),
            None => Step::Return(std::mem::take(&mut self.result)),
        }
    }
}

impl MsgGenerator for ContingencyWrapper {
    fn resume(&mut self, mut input: Resume) -> Step {
        if self.phase == Phase::Fresh {
            if let Resume::Throw(err) = input {
                self.phase = Phase::Done;
                self.plan = None;
                return Step::Raise(err);
            }
            self.phase = Phase::Body;
            self.active = self.plan.take();
        }
        loop {
            let Some(active) = self.active.as_mut() else {
                return input.finished();
            };
            let outcome = match active.resume(input) {
                Step::Yield(msg) => return Step::Yield(msg),
                Step::Return(value) => Ok(value),
                Step::Raise(err) => Err(err),
            };
            self.active = self.advance(outcome);
            if self.active.is_none() {
                return self.finish();
            }
            input = Resume::Next;
        }
    }
}
