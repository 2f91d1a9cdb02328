//! Preprocessor behavior observed through the message stream.

mod common;

use common::{call_log, commands, handle, MockDevice};
use proptest::prelude::*;
use rust_daq_plans::experiment::generator::{drain, from_msgs, pchain, raise, then, BoxedGenerator};
use rust_daq_plans::experiment::plan_stubs::{mv, null};
use rust_daq_plans::experiment::preprocessors::{
    contingency_wrapper, lazily_stage_wrapper, msg_mutator, repeat_as_stub_wrapper, run_wrapper,
    stage_wrapper, NUM_REPEATS_KEY,
};
use rust_daq_plans::experiment::{DeviceRef, Msg, Plan, Resume, Step};
use rust_daq_plans::PlanError;
use serde_json::{json, Map};

fn drain_boxed(mut gen: BoxedGenerator) -> (Vec<Msg>, Result<serde_json::Value, PlanError>) {
    drain(gen.as_mut())
}

fn targets(msgs: &[Msg]) -> Vec<&str> {
    msgs.iter().filter_map(Msg::target_name).collect()
}

#[test]
fn test_exceptions_through_msg_mutator() {
    let outer = from_msgs((0..50).map(|j| Msg::new(format!("step {j}"))));
    let handled = contingency_wrapper(outer, |_| from_msgs(vec![Msg::new("handle it")]), true);
    let mut gen = msg_mutator(handled, |mut msg| {
        msg.command.push('+');
        msg
    });

    let mut msgs = Vec::new();
    for _ in 0..4 {
        match gen.resume(Resume::Next) {
            Step::Yield(msg) => msgs.push(msg),
            other => panic!("expected a message, got {other:?}"),
        }
    }
    let mut input = Resume::Throw(PlanError::RequestStop);
    let outcome = loop {
        match gen.resume(input) {
            Step::Yield(msg) => msgs.push(msg),
            Step::Return(value) => break Ok(value),
            Step::Raise(err) => break Err(err),
        }
        input = Resume::Next;
    };

    assert_eq!(outcome, Err(PlanError::RequestStop));
    assert_eq!(
        commands(&msgs),
        vec!["step 0+", "step 1+", "step 2+", "step 3+", "handle it+"]
    );
}

#[test]
fn test_lazily_stage_independent_devices() {
    let log = call_log();
    let device1 = handle(&MockDevice::new("device1", &log).build());
    let device2 = handle(&MockDevice::new("device2", &log).build());

    let (msgs, result) = drain_boxed(lazily_stage_wrapper(then(
        mv(&device1, 1),
        mv(&device2, 2),
    )));
    assert!(result.is_ok());
    assert_eq!(
        commands(&msgs),
        vec!["stage", "set", "wait", "stage", "set", "wait", "unstage", "unstage"]
    );
    assert_eq!(
        targets(&msgs),
        vec!["device1", "device1", "device2", "device2", "device2", "device1"]
    );
}

#[test]
fn test_lazily_stage_nested_devices() {
    let log = call_log();
    let root = MockDevice::new("root_device", &log).build();
    let child1 = MockDevice::new("child1", &log).child_of(&root).build();
    let child2 = MockDevice::new("child2", &log).child_of(&root).build();

    let plan = pchain(vec![
        mv(&handle(&child1), 1),
        mv(&handle(&child2), 2),
        mv(&handle(&root), 3),
    ]);
    let (msgs, result) = drain_boxed(lazily_stage_wrapper(plan));
    assert!(result.is_ok());
    assert_eq!(
        commands(&msgs),
        vec!["stage", "set", "wait", "set", "wait", "set", "wait", "unstage"]
    );
    assert_eq!(msgs[0].target_name(), Some("root_device"));
    assert_eq!(msgs[7].target_name(), Some("root_device"));
}

#[test]
fn test_lazy_staging_skips_non_stageable_ancestor() {
    let log = call_log();
    let rack = MockDevice::new("rack", &log).not_stageable().build();
    let motor = MockDevice::new("motor", &log).child_of(&rack).build();

    let (msgs, _) = drain_boxed(lazily_stage_wrapper(mv(&handle(&motor), 1)));
    assert_eq!(commands(&msgs), vec!["stage", "set", "wait", "unstage"]);
    assert_eq!(msgs[0].target_name(), Some("motor"));
}

#[test]
fn test_eager_staging_stages_up_front() {
    let log = call_log();
    let a = handle(&MockDevice::new("a", &log).build());
    let b = handle(&MockDevice::new("b", &log).build());

    let plan = stage_wrapper(then(mv(&a, 1), mv(&b, 2)), &[a.clone(), b.clone()]);
    let (msgs, result) = drain_boxed(plan);
    assert!(result.is_ok());
    assert_eq!(
        commands(&msgs),
        vec!["stage", "stage", "set", "wait", "set", "wait", "unstage", "unstage"]
    );
    assert_eq!(targets(&msgs), vec!["a", "b", "a", "b", "b", "a"]);
}

#[test]
fn test_eager_staging_dedups_through_ancestry() {
    let log = call_log();
    let root = MockDevice::new("root", &log).build();
    let x = handle(&MockDevice::new("x", &log).child_of(&root).build());
    let y = handle(&MockDevice::new("y", &log).child_of(&root).build());

    let plan = stage_wrapper(null(), &[x, y, handle(&root)]);
    let (msgs, _) = drain_boxed(plan);
    assert_eq!(commands(&msgs), vec!["stage", "null", "unstage"]);
    assert_eq!(targets(&msgs), vec!["root", "root"]);
}

#[test]
fn test_unstage_runs_after_failure() {
    let log = call_log();
    let motor = handle(&MockDevice::new("motor", &log).build());
    let failing = then(mv(&motor, 1), raise(PlanError::failed("boom")));

    let (msgs, result) = drain_boxed(lazily_stage_wrapper(failing));
    assert_eq!(result, Err(PlanError::failed("boom")));
    assert_eq!(commands(&msgs).last().map(String::as_str), Some("unstage"));
}

#[test]
fn test_run_wrapper_closes_before_propagating() {
    let failing = then(null(), raise(PlanError::failed("boom")));
    let (msgs, result) = drain_boxed(run_wrapper(failing, Map::new()));
    assert_eq!(result, Err(PlanError::failed("boom")));
    assert_eq!(commands(&msgs), vec!["open_run", "null", "close_run"]);
    assert_eq!(msgs[2].kwargs.get("exit_status"), Some(&json!("fail")));
}

fn bracketed_two_device_plan(a: &DeviceRef, b: &DeviceRef) -> Plan {
    let (a, b) = (a.clone(), b.clone());
    Plan::from_msgs(
        "two_devices",
        vec![
            Msg::new("open_run"),
            Msg::new("stage").with_target(&a),
            Msg::new("set").with_target(&a).with_arg(1),
            Msg::new("wait"),
            Msg::new("stage").with_target(&b),
            Msg::new("set").with_target(&b).with_arg(2),
            Msg::new("wait"),
            Msg::new("close_run"),
            Msg::new("unstage").with_target(&b),
            Msg::new("unstage").with_target(&a),
        ],
    )
}

#[test]
fn test_repeat_as_stub_replays_actions() {
    let log = call_log();
    let a = handle(&MockDevice::new("a", &log).build());
    let b = handle(&MockDevice::new("b", &log).build());

    let plan = bracketed_two_device_plan(&a, &b).repeat_as_stub(2).unwrap();
    let (msgs, result) = plan.messages();
    assert!(result.is_ok());
    assert_eq!(
        commands(&msgs),
        vec![
            "open_run", "stage", "set", "wait", "stage", "set", "wait", "set", "wait", "set",
            "wait", "close_run", "unstage", "unstage",
        ]
    );
    assert_eq!(msgs[0].kwargs.get(NUM_REPEATS_KEY), Some(&json!(2)));
    assert_eq!(
        targets(&msgs),
        vec!["a", "a", "b", "b", "a", "b", "b", "a"]
    );
}

#[test]
fn test_repeat_as_stub_wrapper_rejects_zero() {
    let result = repeat_as_stub_wrapper(null(), 0);
    assert!(matches!(result, Err(PlanError::InvalidPlan(_))));
}

#[test]
fn test_wrapped_plans_are_idempotent() {
    let log = call_log();
    let root = MockDevice::new("root", &log).build();
    let motor = handle(&MockDevice::new("motor", &log).child_of(&root).build());
    let other = handle(&MockDevice::new("other", &log).build());

    let plan = Plan::new("scan", move || then(mv(&motor, 1), mv(&other, 2)))
        .with_run(Map::new())
        .with_lazy_staging()
        .repeat_as_stub(3)
        .unwrap();

    let first = plan.messages().0;
    let second = plan.messages().0;
    assert_eq!(commands(&first), commands(&second));
    assert_eq!(targets(&first), targets(&second));
}

proptest! {
    #[test]
    fn prop_mutator_preserves_count_and_order(names in proptest::collection::vec("[a-z]{1,8}", 0..32)) {
        let msgs: Vec<Msg> = names.iter().map(Msg::new).collect();
        let (out, result) = drain_boxed(msg_mutator(from_msgs(msgs), |mut m| {
            m.command = m.command.to_uppercase();
            m
        }));
        prop_assert!(result.is_ok());
        let expected: Vec<String> = names.iter().map(|n| n.to_uppercase()).collect();
        prop_assert_eq!(commands(&out), expected);
    }
}

/// Drive `gen` from its current suspension point, answering `Null`.
fn finish(gen: &mut BoxedGenerator, mut input: Resume) -> (Vec<Msg>, Result<serde_json::Value, PlanError>) {
    let mut msgs = Vec::new();
    loop {
        match gen.resume(input) {
            Step::Yield(msg) => msgs.push(msg),
            Step::Return(value) => return (msgs, Ok(value)),
            Step::Raise(err) => return (msgs, Err(err)),
        }
        input = Resume::Next;
    }
}

#[test]
fn test_eager_staging_unstages_after_plan_raises() {
    let log = call_log();
    let a = handle(&MockDevice::new("a", &log).build());
    let failing = then(mv(&a, 1), raise(PlanError::failed("boom")));

    let (msgs, result) = drain_boxed(stage_wrapper(failing, &[a]));
    assert_eq!(result, Err(PlanError::failed("boom")));
    assert_eq!(commands(&msgs), vec!["stage", "set", "wait", "unstage"]);
    assert_eq!(msgs[3].target_name(), Some("a"));
}

#[test]
fn test_stop_thrown_through_eager_staging_unstages() {
    let log = call_log();
    let a = handle(&MockDevice::new("a", &log).build());
    let body = from_msgs(vec![Msg::new("step 0"), Msg::new("step 1"), Msg::new("step 2")]);
    let mut gen = stage_wrapper(body, &[a]);

    assert!(matches!(gen.resume(Resume::Next), Step::Yield(m) if m.is("stage")));
    assert!(matches!(gen.resume(Resume::Send(json!(null))), Step::Yield(m) if m.is("step 0")));

    let (msgs, result) = finish(&mut gen, Resume::Throw(PlanError::RequestStop));
    assert_eq!(result, Err(PlanError::RequestStop));
    assert_eq!(commands(&msgs), vec!["unstage"]);
    assert_eq!(msgs[0].target_name(), Some("a"));
}

#[test]
fn test_error_at_lazy_stage_reaches_held_message() {
    let log = call_log();
    let a = handle(&MockDevice::new("a", &log).build());
    let plan = contingency_wrapper(
        mv(&a, 1),
        |err| {
            assert_eq!(err, PlanError::failed("stage jam"));
            from_msgs(vec![Msg::new("recover")])
        },
        false,
    );
    let mut gen = lazily_stage_wrapper(plan);

    match gen.resume(Resume::Next) {
        Step::Yield(msg) => {
            assert!(msg.is("stage"));
            assert_eq!(msg.target_name(), Some("a"));
        }
        other => panic!("expected the inserted stage, got {other:?}"),
    }

    let (msgs, result) = finish(&mut gen, Resume::Throw(PlanError::failed("stage jam")));
    assert!(result.is_ok());
    // the held "set" is never released; the device is still unstaged
    assert_eq!(commands(&msgs), vec!["recover", "unstage"]);
    assert_eq!(msgs[1].target_name(), Some("a"));
}
