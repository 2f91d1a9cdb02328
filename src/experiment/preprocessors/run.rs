//! Run bracketing.
//!
//! `run_wrapper` surrounds a plan with an open/close message pair. The close
//! message is emitted on every exit path and records how the run ended:
//!
//! | plan outcome        | `exit_status` | `reason`          |
//! |---------------------|---------------|-------------------|
//! | returned            | `success`     | -                 |
//! | `RequestStop`       | `success`     | -                 |
//! | `RequestAbort`      | `abort`       | abort reason      |
//! | any other error     | `fail`        | error message     |
//!
//! Errors are re-raised after the close message. The composed plan returns
//! the run uid, i.e. the interpreter's response to the open message.

use super::contingency::Contingency;
use crate::error::PlanError;
use crate::experiment::generator::{and_then, pure, raise, single, then, BoxedGenerator};
use crate::experiment::msg::{commands, Msg};
use crate::experiment::plan_stubs::close_run_msg;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Command tags of the open/close pair. Fixed for one composed pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTags {
    /// Opening tag, `open_run` by default
    pub open: String,
    /// Closing tag, `close_run` by default
    pub close: String,
}

impl Default for RunTags {
    fn default() -> Self {
        Self {
            open: commands::OPEN_RUN.to_string(),
            close: commands::CLOSE_RUN.to_string(),
        }
    }
}

/// Bracket `plan` with `open_run(md)` / `close_run`.
pub fn run_wrapper(plan: BoxedGenerator, md: Map<String, Value>) -> BoxedGenerator {
    run_wrapper_with_tags(plan, md, &RunTags::default())
}

/// [`run_wrapper`] with custom command tags.
pub fn run_wrapper_with_tags(
    plan: BoxedGenerator,
    md: Map<String, Value>,
    tags: &RunTags,
) -> BoxedGenerator {
    let open = Msg::new(&tags.open).with_kwargs(md);
    let close_tag = tags.close.clone();

    and_then(single(open), move |run_uid| {
        let on_error_tag = close_tag.clone();
        let body = Contingency::new()
            .on_error(move |err| close_after_error(&on_error_tag, err))
            .on_success(move || single(close_run_msg(&close_tag, Some("success"), None)))
            .wrap(plan);
        and_then(body, move |_| pure(run_uid))
    })
}

/// `exit_status` and `reason` kwargs for a run closed because of `err`.
pub(crate) fn close_status(err: &PlanError) -> (&'static str, Option<String>) {
    match err {
        PlanError::RequestStop => ("success", None),
        PlanError::RequestAbort { reason } => ("abort", Some(reason.clone())),
        other => ("fail", Some(other.to_string())),
    }
}

fn close_after_error(close_tag: &str, err: PlanError) -> BoxedGenerator {
    let (status, reason) = close_status(&err);
    debug!(status, error = %err, "closing run after error");
    then(
        single(close_run_msg(close_tag, Some(status), reason.as_deref())),
        raise(err),
    )
}
