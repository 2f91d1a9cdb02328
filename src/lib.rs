//! Composable experiment plans for the rust_daq acquisition stack.
//!
//! A plan is a producer of [`experiment::Msg`] commands. Preprocessors wrap
//! plans to stage devices, bracket runs, recover from errors or replay
//! actions, and the [`experiment::RunEngine`] drives the result against real
//! devices.

pub mod config;
pub mod error;
pub mod experiment;
pub mod logging;

pub use error::{PlanError, PlanResult};
