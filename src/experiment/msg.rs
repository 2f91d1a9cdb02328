//! Message records exchanged between plans and the interpreter.
//!
//! A `Msg` is an immutable instruction: a command tag, an optional target
//! device, positional and keyword arguments, and an optional run key used to
//! correlate messages with a run. Messages are cheap to clone; the target is
//! shared, never owned.

use super::device::DeviceRef;
use serde_json::{Map, Value};
use std::fmt;

/// Command tags understood by the preprocessors and the `RunEngine`.
#[allow(missing_docs)]
pub mod commands {
    pub const STAGE: &str = "stage";
    pub const UNSTAGE: &str = "unstage";
    pub const SET: &str = "set";
    pub const WAIT: &str = "wait";
    pub const READ: &str = "read";
    pub const TRIGGER: &str = "trigger";
    pub const KICKOFF: &str = "kickoff";
    pub const NULL: &str = "null";
    pub const SLEEP: &str = "sleep";
    pub const CHECKPOINT: &str = "checkpoint";
    pub const PAUSE: &str = "pause";
    pub const OPEN_RUN: &str = "open_run";
    pub const CLOSE_RUN: &str = "close_run";
}

/// One instruction produced by a plan.
#[derive(Clone)]
pub struct Msg {
    /// Command tag, see [`commands`]
    pub command: String,
    /// Target device
    pub obj: Option<DeviceRef>,
    /// Positional arguments
    pub args: Vec<Value>,
    /// Keyword arguments
    pub kwargs: Map<String, Value>,
    /// Run key, for plans that keep several runs apart
    pub run: Option<String>,
}

impl Msg {
    /// Bare message with no target or arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            obj: None,
            args: Vec::new(),
            kwargs: Map::new(),
            run: None,
        }
    }

    /// Set the target device.
    pub fn with_target(mut self, obj: &DeviceRef) -> Self {
        self.obj = Some(obj.clone());
        self
    }

    /// Append a positional argument.
    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Insert one keyword argument, replacing any existing value.
    pub fn with_kwarg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    /// Merge keyword arguments, later keys win.
    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs.extend(kwargs);
        self
    }

    /// Set the run key.
    pub fn with_run(mut self, run: impl Into<String>) -> Self {
        self.run = Some(run.into());
        self
    }

    /// True if this message carries `command`.
    pub fn is(&self, command: &str) -> bool {
        self.command == command
    }

    /// Name of the target device, if any.
    pub fn target_name(&self) -> Option<&str> {
        self.obj.as_ref().map(DeviceRef::name)
    }
}

impl PartialEq for Msg {
    fn eq(&self, other: &Self) -> bool {
        self.command == other.command
            && self.obj == other.obj
            && self.args == other.args
            && self.kwargs == other.kwargs
            && self.run == other.run
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Msg");
        s.field("command", &self.command);
        if let Some(obj) = &self.obj {
            s.field("obj", &obj.name());
        }
        if !self.args.is_empty() {
            s.field("args", &self.args);
        }
        if !self.kwargs.is_empty() {
            s.field("kwargs", &self.kwargs);
        }
        if let Some(run) = &self.run {
            s.field("run", run);
        }
        s.finish()
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target_name() {
            Some(name) => write!(f, "{}({})", self.command, name),
            None => write!(f, "{}", self.command),
        }
    }
}
