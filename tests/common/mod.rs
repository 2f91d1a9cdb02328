//! Shared test fixtures: a recording mock device.

#![allow(dead_code)]

use parking_lot::Mutex;
use rust_daq_plans::experiment::{
    Device, DeviceRef, HasHints, Movable, Readable, Stageable, Triggerable,
};
use serde_json::{Map, Value};
use std::sync::{Arc, Weak};

/// Ordered record of every device call, shared between devices.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Mock device that records stage/unstage/set calls into a shared log.
pub struct MockDevice {
    name: String,
    parent: Option<Weak<MockDevice>>,
    stageable: bool,
    fail_set: bool,
    position: Mutex<Value>,
    log: CallLog,
}

impl MockDevice {
    pub fn new(name: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            parent: None,
            stageable: true,
            fail_set: false,
            position: Mutex::new(Value::Null),
            log: log.clone(),
        }
    }

    pub fn child_of(mut self, parent: &Arc<MockDevice>) -> Self {
        self.parent = Some(Arc::downgrade(parent));
        self
    }

    pub fn not_stageable(mut self) -> Self {
        self.stageable = false;
        self
    }

    pub fn failing_set(mut self) -> Self {
        self.fail_set = true;
        self
    }

    pub fn build(self) -> Arc<MockDevice> {
        Arc::new(self)
    }
}

/// Handle for a mock device.
pub fn handle(device: &Arc<MockDevice>) -> DeviceRef {
    DeviceRef::from(device.clone())
}

impl Stageable for MockDevice {
    fn stage(&self) -> anyhow::Result<()> {
        self.log.lock().push(format!("stage:{}", self.name));
        Ok(())
    }

    fn unstage(&self) -> anyhow::Result<()> {
        self.log.lock().push(format!("unstage:{}", self.name));
        Ok(())
    }
}

impl Movable for MockDevice {
    fn set(&self, value: &Value) -> anyhow::Result<()> {
        if self.fail_set {
            anyhow::bail!("{} refused setpoint {value}", self.name);
        }
        self.log.lock().push(format!("set:{}={value}", self.name));
        *self.position.lock() = value.clone();
        Ok(())
    }
}

impl Readable for MockDevice {
    fn read(&self) -> anyhow::Result<Value> {
        self.log.lock().push(format!("read:{}", self.name));
        let mut reading = Map::new();
        reading.insert(self.name.clone(), self.position.lock().clone());
        Ok(Value::Object(reading))
    }
}

impl Triggerable for MockDevice {
    fn trigger(&self) -> anyhow::Result<()> {
        self.log.lock().push(format!("trigger:{}", self.name));
        Ok(())
    }
}

impl HasHints for MockDevice {
    fn hints(&self) -> Vec<String> {
        vec![self.name.clone()]
    }
}

impl Device for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn parent(&self) -> Option<DeviceRef> {
        self.parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(DeviceRef::from)
    }

    fn as_stageable(&self) -> Option<&dyn Stageable> {
        self.stageable.then_some(self as &dyn Stageable)
    }

    fn as_movable(&self) -> Option<&dyn Movable> {
        Some(self)
    }

    fn as_readable(&self) -> Option<&dyn Readable> {
        Some(self)
    }

    fn as_triggerable(&self) -> Option<&dyn Triggerable> {
        Some(self)
    }

    fn as_hinted(&self) -> Option<&dyn HasHints> {
        Some(self)
    }
}

/// Commands of a message list, for compact assertions.
pub fn commands(msgs: &[rust_daq_plans::experiment::Msg]) -> Vec<String> {
    msgs.iter().map(|m| m.command.clone()).collect()
}
