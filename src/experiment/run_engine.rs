//! RunEngine - drives plans and dispatches their messages
//!
//! The engine is the outermost driver of the producer protocol. For every
//! message a plan yields it performs the command and sends the result back
//! as the plan's response. Failures while performing a command are thrown
//! back into the plan at the message that caused them, so contingency
//! wrappers inside the plan can react.
//!
//! # State Machine
//!
//! ```text
//!     ┌─────────┐  run()   ┌─────────┐  request_pause() / pause msg  ┌────────┐
//!     │  Idle   │ ───────▶ │ Running │ ────────────────────────────▶ │ Paused │
//!     └─────────┘          └─────────┘ ◀──────────────────────────── └────────┘
//!          ▲                    │                resume()
//!          └──── plan done ─────┘
//! ```
//!
//! `request_stop` / `request_abort` inject `RequestStop` / `RequestAbort` at
//! the plan's current suspension point. They also release a paused engine.
//!
//! # Documents
//!
//! Opening and closing a run publish `Start` / `Stop` documents on a
//! broadcast channel (see [`RunEngine::subscribe`]).

use super::device::DeviceRef;
use super::document::{Document, ExitStatus, StartDoc, StopDoc};
use super::generator::{BoxedGenerator, Resume, Step};
use super::msg::{commands, Msg};
use super::plan::Plan;
use crate::config::EngineConfig;
use crate::error::{PlanError, PlanResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};

/// Handler for a custom command. Errors are thrown back into the plan.
pub type CommandHandler = Arc<dyn Fn(&Msg) -> anyhow::Result<Value> + Send + Sync>;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No plan executing
    Idle,
    /// Processing messages
    Running,
    /// Waiting for `resume` or an interrupt
    Paused,
}

/// Outcome of a plan execution, returned when `call_returns_result` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    /// The plan's return value (`Null` if it failed)
    pub plan_result: Value,
    /// Exit status derived from how the plan ended
    pub exit_status: ExitStatus,
    /// Error text, empty on success
    pub reason: String,
    /// Uids of every run opened during the execution
    pub run_start_uids: Vec<String>,
    /// The error that ended the plan, when it was not re-raised
    pub error: Option<PlanError>,
}

impl RunResult {
    /// True if the plan ended because of a stop or abort request.
    pub fn interrupted(&self) -> bool {
        self.error.as_ref().is_some_and(PlanError::is_interruption)
    }
}

/// What `RunEngine::run` hands back on completion.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutput {
    /// Default mode: the uids of the runs the plan opened
    RunUids(Vec<String>),
    /// `call_returns_result` mode
    Result(RunResult),
}

impl RunOutput {
    /// The plan's return value, in `call_returns_result` mode.
    pub fn plan_result(&self) -> Option<&Value> {
        match self {
            RunOutput::RunUids(_) => None,
            RunOutput::Result(result) => Some(&result.plan_result),
        }
    }

    /// Uids of the runs the plan opened, in either mode.
    pub fn run_start_uids(&self) -> &[String] {
        match self {
            RunOutput::RunUids(uids) => uids,
            RunOutput::Result(result) => &result.run_start_uids,
        }
    }

    /// The full result, in `call_returns_result` mode.
    pub fn into_result(self) -> Option<RunResult> {
        match self {
            RunOutput::RunUids(_) => None,
            RunOutput::Result(result) => Some(result),
        }
    }
}

/// The run currently open.
struct OpenRun {
    uid: String,
    num_messages: u32,
}

/// Per-execution bookkeeping.
struct RunContext {
    plan_name: String,
    open_run: Option<OpenRun>,
    run_uids: Vec<String>,
}

/// Marks the engine busy for one execution and resets it on every exit
/// path, including a dropped `run` future.
struct ActiveRun<'a> {
    engine: &'a RunEngine,
    ctx: RunContext,
}

impl ActiveRun<'_> {
    fn close_dangling(&mut self, reason: &str) {
        if let Some(run) = self.ctx.open_run.take() {
            self.engine.publish_stop(run, reason);
        }
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.close_dangling("run cancelled");
        let engine = self.engine;
        engine.pause_requested.store(false, Ordering::SeqCst);
        *engine.interrupt.lock() = None;
        engine.state_tx.send_replace(EngineState::Idle);
        engine.busy.store(false, Ordering::SeqCst);
    }
}

/// Single-plan interpreter.
///
/// Executes one plan at a time, answering each message and publishing run
/// documents. Control methods (`request_pause`, `resume`, `request_stop`,
/// `request_abort`) may be called from other tasks while a plan runs.
pub struct RunEngine {
    config: EngineConfig,
    state_tx: watch::Sender<EngineState>,
    busy: AtomicBool,
    pause_requested: AtomicBool,
    interrupt: Mutex<Option<PlanError>>,
    wake: Notify,
    doc_tx: broadcast::Sender<Document>,
    handlers: RwLock<HashMap<String, CommandHandler>>,
}

impl fmt::Debug for RunEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunEngine")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("handlers", &self.handlers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for RunEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl RunEngine {
    /// Idle engine with no custom handlers.
    pub fn new(config: EngineConfig) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Idle);
        let (doc_tx, _) = broadcast::channel(config.document_capacity.max(1));
        Self {
            config,
            state_tx,
            busy: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            interrupt: Mutex::new(None),
            wake: Notify::new(),
            doc_tx,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Watch engine state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    /// Receive the documents of every subsequent run.
    pub fn subscribe(&self) -> broadcast::Receiver<Document> {
        self.doc_tx.subscribe()
    }

    /// Register (or replace) the handler for `command`. Custom handlers take
    /// precedence over built-in commands.
    pub fn register_command<F>(&self, command: &str, handler: F)
    where
        F: Fn(&Msg) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert(command.to_string(), Arc::new(handler));
    }

    /// Ask the running plan to stop at its next suspension point.
    pub fn request_stop(&self) {
        self.interrupt_with(PlanError::RequestStop);
    }

    /// Ask the running plan to abort at its next suspension point.
    pub fn request_abort(&self, reason: &str) {
        self.interrupt_with(PlanError::RequestAbort {
            reason: reason.to_string(),
        });
    }

    /// Pause before the next message is processed.
    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    /// Release a pause.
    pub fn resume(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn interrupt_with(&self, signal: PlanError) {
        if self.state() == EngineState::Idle {
            debug!(%signal, "ignoring interrupt, engine is idle");
            return;
        }
        *self.interrupt.lock() = Some(signal);
        self.pause_requested.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn take_interrupt(&self) -> Option<PlanError> {
        self.interrupt.lock().take()
    }

    /// Execute a fresh instance of `plan` to completion.
    pub async fn run(&self, plan: &Plan) -> PlanResult<RunOutput> {
        self.run_generator(plan.name(), plan.generate()).await
    }

    /// Execute an already-created producer to completion.
    pub async fn run_generator(&self, plan_name: &str, mut gen: BoxedGenerator) -> PlanResult<RunOutput> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(PlanError::IllegalMessageSequence(
                "RunEngine is already running a plan".to_string(),
            ));
        }
        *self.interrupt.lock() = None;
        self.state_tx.send_replace(EngineState::Running);
        info!(plan = plan_name, "starting plan");

        let mut active = ActiveRun {
            engine: self,
            ctx: RunContext {
                plan_name: plan_name.to_string(),
                open_run: None,
                run_uids: Vec::new(),
            },
        };

        let mut input = Resume::Next;
        let outcome = loop {
            if !matches!(input, Resume::Throw(_)) {
                if let Some(signal) = self.take_interrupt() {
                    debug!(%signal, "injecting interrupt");
                    input = Resume::Throw(signal);
                }
            }
            match gen.resume(input) {
                Step::Yield(msg) => {
                    self.wait_while_paused().await;
                    if let Some(signal) = self.take_interrupt() {
                        debug!(%signal, "injecting interrupt");
                        input = Resume::Throw(signal);
                        continue;
                    }
                    input = match self.dispatch(&msg, &mut active.ctx).await {
                        Ok(response) => Resume::Send(response),
                        Err(err) => {
                            debug!(msg = %msg, error = %err, "message failed, throwing into plan");
                            Resume::Throw(err)
                        }
                    };
                }
                Step::Return(value) => break Ok(value),
                Step::Raise(err) => break Err(err),
            }
        };

        let reason = match &outcome {
            Ok(_) => "run was not closed by the plan".to_string(),
            Err(err) => err.to_string(),
        };
        active.close_dangling(&reason);
        let run_uids = std::mem::take(&mut active.ctx.run_uids);
        drop(active);

        self.finish(plan_name, outcome, run_uids)
    }

    fn finish(
        &self,
        plan_name: &str,
        outcome: PlanResult<Value>,
        run_uids: Vec<String>,
    ) -> PlanResult<RunOutput> {
        let (plan_result, error) = match outcome {
            Ok(value) => {
                info!(plan = plan_name, "plan completed");
                (value, None)
            }
            Err(err) if self.config.auto_raise => {
                info!(plan = plan_name, error = %err, "plan failed");
                return Err(err);
            }
            Err(err) => {
                warn!(plan = plan_name, error = %err, "plan failed, auto_raise disabled");
                (Value::Null, Some(err))
            }
        };

        if !self.config.call_returns_result {
            return Ok(RunOutput::RunUids(run_uids));
        }
        let (exit_status, reason) = match &error {
            Some(err) => exit_status_for(err),
            None => (ExitStatus::Success, String::new()),
        };
        Ok(RunOutput::Result(RunResult {
            plan_result,
            exit_status,
            reason,
            run_start_uids: run_uids,
            error,
        }))
    }

    fn should_pause(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst) && self.interrupt.lock().is_none()
    }

    async fn wait_while_paused(&self) {
        while self.should_pause() {
            let notified = self.wake.notified();
            if self.state() != EngineState::Paused {
                info!("engine paused");
                self.state_tx.send_replace(EngineState::Paused);
            }
            notified.await;
        }
        if self.state() == EngineState::Paused {
            info!("engine resumed");
            self.state_tx.send_replace(EngineState::Running);
        }
    }

    fn publish_stop(&self, run: OpenRun, reason: &str) {
        warn!(run_uid = %run.uid, reason, "plan ended with an open run, closing it");
        self.publish(Document::Stop(StopDoc::new(
            &run.uid,
            ExitStatus::Fail,
            reason,
            run.num_messages,
        )));
    }

    fn publish(&self, doc: Document) {
        // No subscribers is fine
        let _ = self.doc_tx.send(doc);
    }

    async fn dispatch(&self, msg: &Msg, ctx: &mut RunContext) -> PlanResult<Value> {
        let tags = &self.config.run_tags;
        if !msg.is(&tags.close) {
            if let Some(run) = ctx.open_run.as_mut() {
                run.num_messages += 1;
            }
        }

        let custom = self.handlers.read().get(&msg.command).cloned();
        if let Some(handler) = custom {
            return handler(msg).map_err(|e| match &msg.obj {
                Some(obj) => PlanError::device(obj.name(), &e),
                None => PlanError::Failed(format!("{}: {e:#}", msg.command)),
            });
        }

        if msg.is(&tags.open) {
            return self.open_run(msg, ctx);
        }
        if msg.is(&tags.close) {
            return self.close_run(msg, ctx);
        }

        match msg.command.as_str() {
            commands::STAGE => stage_device(msg, true),
            commands::UNSTAGE => stage_device(msg, false),
            commands::SET => {
                let device = require_target(msg)?;
                let movable = device.device().as_movable().ok_or_else(|| PlanError::Device {
                    device: device.name().to_string(),
                    message: "device is not movable".to_string(),
                })?;
                let value = msg.args.first().cloned().unwrap_or(Value::Null);
                movable
                    .set(&value)
                    .map_err(|e| PlanError::device(device.name(), &e))?;
                Ok(Value::Null)
            }
            commands::SLEEP => {
                let seconds = msg.args.first().and_then(Value::as_f64).unwrap_or(0.0);
                tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
                Ok(Value::Null)
            }
            commands::PAUSE => {
                self.request_pause();
                self.wait_while_paused().await;
                Ok(Value::Null)
            }
            commands::READ => {
                let device = require_target(msg)?;
                let readable = device.device().as_readable().ok_or_else(|| PlanError::Device {
                    device: device.name().to_string(),
                    message: "device is not readable".to_string(),
                })?;
                readable.read().map_err(|e| PlanError::device(device.name(), &e))
            }
            commands::TRIGGER => {
                let device = require_target(msg)?;
                if let Some(triggerable) = device.device().as_triggerable() {
                    triggerable
                        .trigger()
                        .map_err(|e| PlanError::device(device.name(), &e))?;
                }
                Ok(Value::Null)
            }
            commands::KICKOFF => {
                require_target(msg)?;
                Ok(Value::Null)
            }
            commands::WAIT | commands::NULL | commands::CHECKPOINT => Ok(Value::Null),
            other => Err(PlanError::UnknownCommand(other.to_string())),
        }
    }

    fn open_run(&self, msg: &Msg, ctx: &mut RunContext) -> PlanResult<Value> {
        if let Some(run) = &ctx.open_run {
            return Err(PlanError::IllegalMessageSequence(format!(
                "cannot open a run while run {} is open",
                run.uid
            )));
        }
        let start = StartDoc::new(&ctx.plan_name).with_metadata(msg.kwargs.clone());
        let uid = start.uid.clone();
        info!(run_uid = %uid, plan = %ctx.plan_name, "run opened");
        self.publish(Document::Start(start));
        ctx.run_uids.push(uid.clone());
        ctx.open_run = Some(OpenRun {
            uid: uid.clone(),
            num_messages: 0,
        });
        Ok(Value::String(uid))
    }

    fn close_run(&self, msg: &Msg, ctx: &mut RunContext) -> PlanResult<Value> {
        let run = ctx.open_run.take().ok_or_else(|| {
            PlanError::IllegalMessageSequence("close_run without an open run".to_string())
        })?;
        let status = ExitStatus::from_kwarg(msg.kwargs.get("exit_status"));
        let reason = msg
            .kwargs
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default();
        info!(run_uid = %run.uid, status = status.as_str(), "run closed");
        self.publish(Document::Stop(StopDoc::new(
            &run.uid,
            status,
            reason,
            run.num_messages,
        )));
        Ok(Value::String(run.uid))
    }
}

fn exit_status_for(err: &PlanError) -> (ExitStatus, String) {
    match err {
        PlanError::RequestStop => (ExitStatus::Success, String::new()),
        PlanError::RequestAbort { reason } => (ExitStatus::Abort, reason.clone()),
        other => (ExitStatus::Fail, other.to_string()),
    }
}

fn require_target(msg: &Msg) -> PlanResult<&DeviceRef> {
    msg.obj.as_ref().ok_or_else(|| {
        PlanError::IllegalMessageSequence(format!("'{}' requires a target device", msg.command))
    })
}

/// Stage or unstage the target. Devices without the capability are a no-op.
fn stage_device(msg: &Msg, stage: bool) -> PlanResult<Value> {
    let device = require_target(msg)?;
    let Some(stageable) = device.device().as_stageable() else {
        return Ok(Value::Null);
    };
    let result = if stage {
        stageable.stage()
    } else {
        stageable.unstage()
    };
    result.map_err(|e| PlanError::device(device.name(), &e))?;
    Ok(Value::Null)
}
