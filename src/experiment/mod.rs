//! Experiment orchestration
//!
//! Plans are producers of [`Msg`] that run under the producer protocol in
//! [`generator`]: the driver resumes the plan, the plan yields a message, the
//! driver performs it and resumes the plan with the response (or throws the
//! failure back in).
//!
//! # Architecture
//!
//! - **Plans**: Restartable factories of message producers
//! - **Preprocessors**: Wrappers that rewrite, insert or replay messages
//! - **RunEngine**: Async driver that performs messages and emits documents
//! - **Documents**: Start/Stop records of each run
//!
//! # Example
//!
//! ```rust,ignore
//! use rust_daq_plans::experiment::{plan_stubs::mv, Plan, RunEngine};
//!
//! let plan = Plan::new("move", move || mv(&motor, 1.0))
//!     .with_lazy_staging()
//!     .with_run(Default::default());
//!
//! let engine = RunEngine::default();
//! let uids = engine.run(&plan).await?;
//! ```

pub mod device;
pub mod document;
pub mod generator;
pub mod msg;
pub mod plan;
pub mod plan_stubs;
pub mod preprocessors;
pub mod run_engine;

pub use device::{Device, DeviceRef, HasHints, Movable, Readable, Stageable, Triggerable};
pub use document::{Document, ExitStatus, StartDoc, StopDoc};
pub use generator::{BoxedGenerator, MsgGenerator, Resume, Step};
pub use msg::Msg;
pub use plan::Plan;
pub use run_engine::{EngineState, RunEngine, RunOutput, RunResult};
