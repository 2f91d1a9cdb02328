//! Plan preprocessors.
//!
//! Each preprocessor takes a running plan and returns a new one that drives
//! it, adding behavior the wrapped plan does not know about. Wrappers are
//! transparent in both directions: responses and thrown errors reach the
//! wrapped plan unchanged, and errors it raises come back out after any
//! cleanup the wrapper owns.
//!
//! | wrapper                  | adds                                        |
//! |--------------------------|---------------------------------------------|
//! | `msg_mutator`            | per-message rewrite                         |
//! | `contingency_wrapper`    | recovery plan on error                      |
//! | `finalize_wrapper`       | cleanup plan on every exit path             |
//! | `stage_wrapper`          | stage listed devices up front               |
//! | `lazily_stage_wrapper`   | stage devices on first use                  |
//! | `run_wrapper`            | open/close run bracket                      |
//! | `repeat_as_stub_wrapper` | replay run actions N times                  |
//! | `inject_md_wrapper`      | merge metadata into `open_run`              |
//! | `stub_wrapper`           | neutralize run control                      |
//!
//! Wrappers do not commute. The `Plan` builder methods apply them in call
//! order, innermost first.

pub mod contingency;
pub mod mutator;
pub mod repeat;
pub mod run;
pub mod staging;

pub use contingency::{contingency_wrapper, finalize_wrapper, Contingency};
pub use mutator::{inject_md_wrapper, msg_mutator, stub_wrapper};
pub use repeat::{repeat_as_stub_wrapper, repeat_as_stub_with_tags, NUM_REPEATS_KEY};
pub use run::{run_wrapper, run_wrapper_with_tags, RunTags};
pub use staging::{lazily_stage_wrapper, stage_wrapper, StagedSet, LAZY_STAGE_COMMANDS};
