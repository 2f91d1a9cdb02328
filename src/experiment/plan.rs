//! Restartable plans.
//!
//! A `Plan` is a named factory: every call to [`Plan::generate`] returns a
//! fresh producer, so the same plan can be executed, inspected and wrapped
//! any number of times. Builder methods return a new plan that applies one
//! preprocessor to every generated producer.
//!
//! ```rust,ignore
//! let plan = Plan::new("scan", move || mv(&motor, 1.0))
//!     .with_run(md)
//!     .with_lazy_staging()
//!     .repeat_as_stub(3)?;
//! ```
//!
//! Reading order is application order: the run bracket wraps the scan,
//! staging wraps the bracketed scan, and repetition wraps everything. With
//! staging outside the bracket, `unstage` lands after `close_run` and is not
//! replayed.

use super::device::DeviceRef;
use super::generator::{drain, from_msgs, raise, then, BoxedGenerator, MsgGenerator};
use super::msg::Msg;
use super::preprocessors::{
    inject_md_wrapper, lazily_stage_wrapper, msg_mutator, repeat_as_stub_with_tags,
    run_wrapper_with_tags, stage_wrapper, stub_wrapper, Contingency, RunTags,
};
use crate::error::{PlanError, PlanResult};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

type Factory = Arc<dyn Fn() -> BoxedGenerator + Send + Sync>;

/// A named, restartable plan.
///
/// Holds a factory rather than a producer, so every [`Plan::generate`] call
/// starts from the top. Builder methods wrap the factory.
#[derive(Clone)]
pub struct Plan {
    name: String,
    factory: Factory,
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan").field("name", &self.name).finish()
    }
}

impl Plan {
    /// Plan whose executions are built by `factory`.
    pub fn new<F, G>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> G + Send + Sync + 'static,
        G: MsgGenerator + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(move || Box::new(factory()) as BoxedGenerator),
        }
    }

    /// A plan that yields the same fixed messages every time.
    pub fn from_msgs(name: impl Into<String>, msgs: Vec<Msg>) -> Self {
        Self::new(name, move || from_msgs(msgs.clone()))
    }

    /// Name used in logs and start documents.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start a fresh execution of this plan.
    pub fn generate(&self) -> BoxedGenerator {
        (self.factory)()
    }

    /// Run a fresh execution without an interpreter, answering every message
    /// with `Null`.
    pub fn messages(&self) -> (Vec<Msg>, PlanResult<Value>) {
        drain(self.generate().as_mut())
    }

    fn wrap<W>(self, wrapper: W) -> Self
    where
        W: Fn(BoxedGenerator) -> BoxedGenerator + Send + Sync + 'static,
    {
        let inner = self.factory;
        Self {
            name: self.name,
            factory: Arc::new(move || wrapper(inner())),
        }
    }

    /// Rewrite every message with `mutate`.
    pub fn map_msgs<F>(self, mutate: F) -> Self
    where
        F: Fn(Msg) -> Msg + Send + Sync + 'static,
    {
        let mutate = Arc::new(mutate);
        self.wrap(move |gen| {
            let mutate = mutate.clone();
            msg_mutator(gen, move |msg| mutate(msg))
        })
    }

    /// Run `except_plan` when this plan raises; see [`Contingency`].
    pub fn with_contingency<F, G>(self, except_plan: F, auto_raise: bool) -> Self
    where
        F: Fn(PlanError) -> G + Send + Sync + 'static,
        G: MsgGenerator + 'static,
    {
        let except_plan = Arc::new(except_plan);
        self.wrap(move |gen| {
            let except_plan = except_plan.clone();
            Contingency::new()
                .on_error(move |err| Box::new(except_plan(err)) as BoxedGenerator)
                .auto_raise(auto_raise)
                .wrap(gen)
        })
    }

    /// Run `final_plan` after this plan on every exit path.
    pub fn finalize_with(self, final_plan: Plan) -> Self {
        self.wrap(move |gen| {
            let final_plan = final_plan.clone();
            Contingency::new()
                .finally(move || final_plan.generate())
                .wrap(gen)
        })
    }

    /// Stage `devices` up front and unstage them at the end.
    pub fn with_staging(self, devices: Vec<DeviceRef>) -> Self {
        self.wrap(move |gen| stage_wrapper(gen, &devices))
    }

    /// Stage devices on first use and unstage them at the end.
    pub fn with_lazy_staging(self) -> Self {
        self.wrap(lazily_stage_wrapper)
    }

    /// Bracket with `open_run(md)` / `close_run`.
    pub fn with_run(self, md: Map<String, Value>) -> Self {
        self.with_run_tags(md, RunTags::default())
    }

    /// [`Plan::with_run`] with custom command tags.
    pub fn with_run_tags(self, md: Map<String, Value>, tags: RunTags) -> Self {
        self.wrap(move |gen| run_wrapper_with_tags(gen, md.clone(), &tags))
    }

    /// Merge `md` into every `open_run` message.
    pub fn with_md(self, md: Map<String, Value>) -> Self {
        self.wrap(move |gen| inject_md_wrapper(gen, md.clone()))
    }

    /// Neutralize run control so the plan can be embedded in another run.
    pub fn as_stub(self) -> Self {
        self.wrap(stub_wrapper)
    }

    /// Replay the actions inside this plan's run bracket `num_repeats` times.
    ///
    /// Apply staging outside the bracket (`.with_run(md).with_lazy_staging()`)
    /// so `unstage` follows `close_run`. With staging inside the bracket the
    /// devices are unstaged before the held close, and the replayed actions
    /// then run against unstaged devices.
    pub fn repeat_as_stub(self, num_repeats: usize) -> PlanResult<Self> {
        self.repeat_as_stub_tags(num_repeats, RunTags::default())
    }

    /// [`Plan::repeat_as_stub`] with custom command tags.
    pub fn repeat_as_stub_tags(self, num_repeats: usize, tags: RunTags) -> PlanResult<Self> {
        if num_repeats == 0 {
            return Err(PlanError::InvalidPlan(
                "num_repeats must be at least 1".to_string(),
            ));
        }
        Ok(self.wrap(move |gen| {
            match repeat_as_stub_with_tags(gen, num_repeats, &tags) {
                Ok(wrapped) => wrapped,
                Err(err) => raise(err),
            }
        }))
    }

    /// Run `next` after this plan; the result is `next`'s.
    pub fn then(self, next: Plan) -> Self {
        self.wrap(move |gen| then(gen, next.generate()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::generator::pure;
    use serde_json::json;

    fn commands(plan: &Plan) -> Vec<String> {
        plan.messages().0.into_iter().map(|m| m.command).collect()
    }

    #[test]
    fn test_plan_is_restartable() {
        let plan = Plan::from_msgs("two", vec![Msg::new("a"), Msg::new("b")]);
        assert_eq!(commands(&plan), vec!["a", "b"]);
        assert_eq!(commands(&plan), vec!["a", "b"]);
        assert_eq!(plan.name(), "two");
    }

    #[test]
    fn test_builders_apply_in_order() {
        let plan = Plan::from_msgs("body", vec![Msg::new("x")])
            .map_msgs(|mut m| {
                m.command.push('1');
                m
            })
            .with_run(Map::new());
        assert_eq!(commands(&plan), vec!["open_run", "x1", "close_run"]);
    }

    #[test]
    fn test_contingency_builder() {
        let plan = Plan::new("fails", || raise(PlanError::failed("x")))
            .with_contingency(|_| pure("handled"), false);
        assert_eq!(plan.messages().1, Ok(json!("handled")));
    }

    #[test]
    fn test_finalize_and_then() {
        let cleanup = Plan::from_msgs("cleanup", vec![Msg::new("cleanup")]);
        let plan = Plan::from_msgs("body", vec![Msg::new("a")])
            .finalize_with(cleanup)
            .then(Plan::from_msgs("next", vec![Msg::new("b")]));
        assert_eq!(commands(&plan), vec!["a", "cleanup", "b"]);
    }

    #[test]
    fn test_repeat_as_stub_rejects_zero() {
        let result = Plan::from_msgs("p", vec![]).repeat_as_stub(0);
        assert!(result.is_err());
    }
}
