//! Message rewriting.
//!
//! `msg_mutator` rewrites every message a plan yields while passing responses
//! and thrown errors straight through to the wrapped plan. It never drops,
//! reorders or duplicates a message, so it is the building block for the
//! simpler rewriting wrappers below.

use crate::experiment::generator::{BoxedGenerator, MsgGenerator, Resume, Step};
use crate::experiment::msg::{commands, Msg};
use serde_json::{Map, Value};

struct MsgMutator<F> {
    plan: BoxedGenerator,
    mutate: F,
}

impl<F> MsgGenerator for MsgMutator<F>
where
    F: FnMut(Msg) -> Msg + Send,
{
    fn resume(&mut self, input: Resume) -> Step {
        match self.plan.resume(input) {
            Step::Yield(msg) => Step::Yield((self.mutate)(msg)),
            finished => finished,
        }
    }
}

/// Apply `mutate` to every message `plan` yields.
pub fn msg_mutator<F>(plan: BoxedGenerator, mutate: F) -> BoxedGenerator
where
    F: FnMut(Msg) -> Msg + Send + 'static,
{
    Box::new(MsgMutator { plan, mutate })
}

/// Merge `md` into every `open_run` message. Keys the message already carries
/// take precedence.
pub fn inject_md_wrapper(plan: BoxedGenerator, md: Map<String, Value>) -> BoxedGenerator {
    inject_md_with_tag(plan, md, commands::OPEN_RUN.to_string())
}

pub(crate) fn inject_md_with_tag(
    plan: BoxedGenerator,
    md: Map<String, Value>,
    open_tag: String,
) -> BoxedGenerator {
    msg_mutator(plan, move |mut msg| {
        if msg.is(&open_tag) {
            merge_missing(&mut msg.kwargs, &md);
        }
        msg
    })
}

pub(crate) fn merge_missing(kwargs: &mut Map<String, Value>, md: &Map<String, Value>) {
    for (key, value) in md {
        kwargs.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

/// Replace run-control messages (`open_run`, `close_run`, `stage`,
/// `unstage`) with `null` so the plan can run inside another plan's run.
pub fn stub_wrapper(plan: BoxedGenerator) -> BoxedGenerator {
    msg_mutator(plan, |msg| {
        let run_control = [
            commands::OPEN_RUN,
            commands::CLOSE_RUN,
            commands::STAGE,
            commands::UNSTAGE,
        ];
        if run_control.contains(&msg.command.as_str()) {
            Msg::new(commands::NULL)
        } else {
            msg
        }
    })
}
