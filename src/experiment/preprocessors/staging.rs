//! Stage/unstage bookkeeping.
//!
//! Both staging wrappers share one rule: staging a device actually stages the
//! outermost stageable device in its ancestor chain, and a device counts as
//! staged when it or any ancestor already is. Siblings under a common parent
//! therefore cause a single `stage`/`unstage` pair for that parent.
//!
//! - `stage_wrapper` stages an explicit device list before the plan starts
//! - `lazily_stage_wrapper` stages a device right before its first use
//!
//! Everything an invocation staged is unstaged in reverse order once the plan
//! finishes, whether it returns, raises, or is interrupted.
//!
//! A device is recorded when its `stage` message is emitted. The interpreter
//! answers `stage` with `Null`, so the response carries nothing to record.

use super::contingency::finalize_wrapper;
use crate::experiment::device::DeviceRef;
use crate::experiment::generator::{from_msgs, then, BoxedGenerator, MsgGenerator, Resume, Step};
use crate::experiment::msg::{commands, Msg};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Commands that count as a use of their target for lazy staging.
pub const LAZY_STAGE_COMMANDS: [&str; 4] = [
    commands::SET,
    commands::READ,
    commands::TRIGGER,
    commands::KICKOFF,
];

/// Devices staged by one wrapper invocation, in staging order.
#[derive(Clone, Default)]
pub struct StagedSet {
    devices: Arc<Mutex<Vec<DeviceRef>>>,
}

impl StagedSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `device` or one of its ancestors is staged.
    pub fn covers(&self, device: &DeviceRef) -> bool {
        let staged = self.devices.lock();
        device.ancestors().any(|ancestor| staged.contains(&ancestor))
    }

    /// The device to stage so that `device` becomes covered, or `None` when
    /// it already is (or nothing in its chain is stageable).
    pub fn stage_target(&self, device: &DeviceRef) -> Option<DeviceRef> {
        if self.covers(device) {
            return None;
        }
        device.ancestors().filter(DeviceRef::is_stageable).last()
    }

    /// Remember `device` as staged.
    pub fn record(&self, device: DeviceRef) {
        self.devices.lock().push(device);
    }

    /// Staged devices in staging order.
    pub fn staged(&self) -> Vec<DeviceRef> {
        self.devices.lock().clone()
    }

    /// Number of staged devices.
    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    /// True if nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    /// Empty the set and return `unstage` messages in reverse staging order.
    pub fn unstage_all(&self) -> BoxedGenerator {
        let staged = std::mem::take(&mut *self.devices.lock());
        debug!(count = staged.len(), "unstaging devices");
        from_msgs(
            staged
                .iter()
                .rev()
                .map(|device| Msg::new(commands::UNSTAGE).with_target(device))
                .collect::<Vec<_>>(),
        )
    }
}

/// Yields a `stage` message for each requested device not yet covered.
struct StageDevices {
    devices: VecDeque<DeviceRef>,
    staged: StagedSet,
}

impl MsgGenerator for StageDevices {
    fn resume(&mut self, input: Resume) -> Step {
        if let Resume::Throw(err) = input {
            self.devices.clear();
            return Step::Raise(err);
        }
        while let Some(device) = self.devices.pop_front() {
            if let Some(target) = self.staged.stage_target(&device) {
                debug!(device = device.name(), target = target.name(), "staging");
                self.staged.record(target.clone());
                return Step::Yield(Msg::new(commands::STAGE).with_target(&target));
            }
        }
        Step::Return(serde_json::Value::Null)
    }
}

/// Stage `devices` before `plan` starts and unstage them after it ends.
pub fn stage_wrapper(plan: BoxedGenerator, devices: &[DeviceRef]) -> BoxedGenerator {
    let staged = StagedSet::new();
    let stage_all = Box::new(StageDevices {
        devices: devices.iter().cloned().collect(),
        staged: staged.clone(),
    });
    finalize_wrapper(then(stage_all, plan), move || staged.unstage_all())
}

/// Inserts a `stage` message ahead of the first use of each device.
struct LazyStager {
    plan: BoxedGenerator,
    staged: StagedSet,
    held: Option<Msg>,
}

impl LazyStager {
    fn inspect(&mut self, step: Step) -> Step {
        let Step::Yield(msg) = step else {
            return step;
        };
        if !LAZY_STAGE_COMMANDS.contains(&msg.command.as_str()) {
            return Step::Yield(msg);
        }
        let Some(target) = msg.obj.as_ref().and_then(|obj| self.staged.stage_target(obj)) else {
            return Step::Yield(msg);
        };
        debug!(device = ?msg.target_name(), target = target.name(), "lazily staging");
        self.staged.record(target.clone());
        self.held = Some(msg);
        Step::Yield(Msg::new(commands::STAGE).with_target(&target))
    }
}

impl MsgGenerator for LazyStager {
    fn resume(&mut self, input: Resume) -> Step {
        let step = match (self.held.take(), input) {
            // An error raised at the inserted stage message lands where the
            // plan is suspended: at the message we held back.
            (Some(_), Resume::Throw(err)) => self.plan.resume(Resume::Throw(err)),
            (Some(held), _) => return Step::Yield(held),
            (None, input) => self.plan.resume(input),
        };
        self.inspect(step)
    }
}

/// Stage devices on first use and unstage them after `plan` ends.
pub fn lazily_stage_wrapper(plan: BoxedGenerator) -> BoxedGenerator {
    let staged = StagedSet::new();
    let stager = Box::new(LazyStager {
        plan,
        staged: staged.clone(),
        held: None,
    });
    finalize_wrapper(stager, move || staged.unstage_all())
}
