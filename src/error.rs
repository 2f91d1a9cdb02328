//! Error types for plan composition and execution.
//!
//! `PlanError` is the single error type that flows through the producer
//! protocol. It is what a plan raises, what a driver throws into a suspended
//! plan, and what the `RunEngine` returns to its caller.
//!
//! ## Error Kinds
//!
//! - **Interruptions** (`RequestStop`, `RequestAbort`): signals injected by the
//!   driver at the current suspension point. Wrappers forward them inward and
//!   only treat them as failures when the wrapped plan lets them propagate.
//! - **Plan failures** (`Failed`, `Device`, `UnknownCommand`,
//!   `IllegalMessageSequence`): raised by a plan, or by the engine while
//!   processing a message and thrown back into the plan.
//! - **Composition errors** (`InvalidPlan`, `Config`): a wrapper was used in a
//!   way it does not support, or the engine configuration is invalid.
//!
//! The type is `Clone + PartialEq` because the same error value is handed to a
//! recovery plan and may later be re-raised unchanged.

use thiserror::Error;

/// Convenience alias for results using the plan error type.
pub type PlanResult<T> = std::result::Result<T, PlanError>;

/// Errors raised by plans, wrappers and the `RunEngine`.
///
/// The type doubles as the signal the driver throws into a suspended plan,
/// so it is cheap to clone and comparable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    /// Driver asked the plan to stop; runs close with `success`.
    #[error("Stop requested")]
    RequestStop,

    /// Driver asked the plan to abort.
    #[error("Abort requested: {reason}")]
    RequestAbort {
        /// Operator-supplied reason, recorded on the stop document
        reason: String,
    },

    /// Raised by the plan itself
    #[error("Plan failed: {0}")]
    Failed(String),

    /// A device capability call failed
    #[error("Device '{device}' error: {message}")]
    Device {
        /// Name of the device
        device: String,
        /// Error chain from the device
        message: String,
    },

    /// No built-in or registered handler for the command
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    /// Message not valid in the current state (e.g. `close_run` with no run)
    #[error("Illegal message sequence: {0}")]
    IllegalMessageSequence(String),

    /// Wrappers composed in a way they do not support
    #[error("Invalid plan composition: {0}")]
    InvalidPlan(String),

    /// Invalid configuration or logging setup
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PlanError {
    /// Shorthand for a plan-raised failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Wrap an error returned by a device capability call.
    pub fn device(device: &str, err: &anyhow::Error) -> Self {
        Self::Device {
            device: device.to_string(),
            message: format!("{err:#}"),
        }
    }

    /// True for signals a driver injects (stop/abort) rather than failures a
    /// plan raises on its own.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::RequestStop | Self::RequestAbort { .. })
    }
}
