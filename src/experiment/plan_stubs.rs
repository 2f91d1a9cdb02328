//! Small plans that emit one or two messages.
//!
//! These are the vocabulary larger plans are written in. Each returns a fresh
//! producer; results are the interpreter's responses.

use super::device::DeviceRef;
use super::document::new_uid;
use super::generator::{from_msgs, single, then, BoxedGenerator};
use super::msg::{commands, Msg};
use serde_json::{Map, Value};

/// A message the interpreter acknowledges and otherwise ignores.
pub fn null() -> BoxedGenerator {
    single(Msg::new(commands::NULL))
}

/// Set `device` to `value` without waiting for completion.
pub fn abs_set(device: &DeviceRef, value: impl Into<Value>, group: Option<&str>) -> BoxedGenerator {
    let mut msg = Msg::new(commands::SET).with_target(device).with_arg(value);
    if let Some(group) = group {
        msg = msg.with_kwarg("group", group);
    }
    single(msg)
}

/// Wait for every operation started in `group`.
pub fn wait(group: Option<&str>) -> BoxedGenerator {
    let mut msg = Msg::new(commands::WAIT);
    if let Some(group) = group {
        msg = msg.with_kwarg("group", group);
    }
    single(msg)
}

/// Move `device` to `value` and wait for it to arrive.
pub fn mv(device: &DeviceRef, value: impl Into<Value>) -> BoxedGenerator {
    let group = new_uid();
    then(abs_set(device, value, Some(&group)), wait(Some(&group)))
}

/// Move several devices together, then wait once for all of them.
pub fn mv_many(moves: &[(DeviceRef, Value)]) -> BoxedGenerator {
    let group = new_uid();
    let sets = moves.iter().map(|(device, value)| {
        Msg::new(commands::SET)
            .with_target(device)
            .with_arg(value.clone())
            .with_kwarg("group", group.as_str())
    });
    then(from_msgs(sets.collect::<Vec<_>>()), wait(Some(&group)))
}

/// Stage `device`.
pub fn stage(device: &DeviceRef) -> BoxedGenerator {
    single(Msg::new(commands::STAGE).with_target(device))
}

/// Unstage `device`.
pub fn unstage(device: &DeviceRef) -> BoxedGenerator {
    single(Msg::new(commands::UNSTAGE).with_target(device))
}

/// Read `device` and return the reading.
pub fn read(device: &DeviceRef) -> BoxedGenerator {
    single(Msg::new(commands::READ).with_target(device))
}

/// Trigger one acquisition on `device`.
pub fn trigger(device: &DeviceRef) -> BoxedGenerator {
    single(Msg::new(commands::TRIGGER).with_target(device))
}

/// Suspend the plan for `seconds` of wall-clock time.
pub fn sleep(seconds: f64) -> BoxedGenerator {
    single(Msg::new(commands::SLEEP).with_arg(seconds))
}

/// Mark a point where a pause may take effect.
pub fn checkpoint() -> BoxedGenerator {
    single(Msg::new(commands::CHECKPOINT))
}

/// Ask the interpreter to pause until resumed.
pub fn pause() -> BoxedGenerator {
    single(Msg::new(commands::PAUSE))
}

/// Open a run; the result is the run uid.
pub fn open_run(md: Map<String, Value>) -> BoxedGenerator {
    single(Msg::new(commands::OPEN_RUN).with_kwargs(md))
}

/// Close the current run.
pub fn close_run(exit_status: Option<&str>, reason: Option<&str>) -> BoxedGenerator {
    single(close_run_msg(commands::CLOSE_RUN, exit_status, reason))
}

pub(crate) fn close_run_msg(tag: &str, exit_status: Option<&str>, reason: Option<&str>) -> Msg {
    let mut msg = Msg::new(tag);
    if let Some(status) = exit_status {
        msg = msg.with_kwarg("exit_status", status);
    }
    if let Some(reason) = reason {
        msg = msg.with_kwarg("reason", reason);
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::device::Device;
    use crate::experiment::generator::drain;
    use serde_json::json;

    struct Motor;

    impl Device for Motor {
        fn name(&self) -> &str {
            "motor"
        }
    }

    #[test]
    fn test_mv_shares_group() {
        let motor = DeviceRef::new(Motor);
        let (msgs, _) = drain(mv(&motor, 1.0).as_mut());
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].command, commands::SET);
        assert_eq!(msgs[0].args, vec![json!(1.0)]);
        assert_eq!(msgs[1].command, commands::WAIT);
        assert_eq!(msgs[0].kwargs.get("group"), msgs[1].kwargs.get("group"));
    }

    #[test]
    fn test_mv_many_waits_once() {
        let a = DeviceRef::new(Motor);
        let b = DeviceRef::new(Motor);
        let (msgs, _) = drain(mv_many(&[(a, json!(1)), (b, json!(2))]).as_mut());
        let cmds: Vec<_> = msgs.iter().map(|m| m.command.as_str()).collect();
        assert_eq!(cmds, vec!["set", "set", "wait"]);
    }

    #[test]
    fn test_close_run_kwargs() {
        let (msgs, _) = drain(close_run(Some("fail"), Some("limit hit")).as_mut());
        assert_eq!(msgs[0].kwargs.get("exit_status"), Some(&json!("fail")));
        assert_eq!(msgs[0].kwargs.get("reason"), Some(&json!("limit hit")));
    }
}
