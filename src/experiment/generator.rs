//! Suspendable message producers.
//!
//! A plan is driven one message at a time. At each suspension point the
//! driver either advances the producer, sends it a response value, or throws
//! an error into it. The producer answers with the next message, a final
//! result, or an error of its own.
//!
//! ```text
//!   driver                    producer
//!     │ ── Resume::Next ───────▶ │
//!     │ ◀──────── Step::Yield ── │   (suspended at msg 1)
//!     │ ── Resume::Send(v) ────▶ │
//!     │ ◀──────── Step::Yield ── │   (suspended at msg 2)
//!     │ ── Resume::Throw(e) ───▶ │
//!     │ ◀─ Step::Return/Raise ── │   (finished)
//! ```
//!
//! Lifecycle rules every producer in this crate follows:
//!
//! - a `Throw` delivered before the first advance raises immediately
//! - after finishing, advancing returns `Return(Null)` and throwing re-raises
//!
//! The combinators here are the building blocks that plans and wrappers are
//! assembled from.

use super::msg::Msg;
use crate::error::{PlanError, PlanResult};
use serde_json::Value;
use std::collections::VecDeque;

/// Input delivered to a suspended producer.
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// Advance without a value.
    Next,
    /// Deliver the response to the message last yielded.
    Send(Value),
    /// Raise an error at the current suspension point.
    Throw(PlanError),
}

impl Resume {
    /// Answer for a producer that has already finished.
    pub fn finished(self) -> Step {
        match self {
            Resume::Throw(err) => Step::Raise(err),
            Resume::Next | Resume::Send(_) => Step::Return(Value::Null),
        }
    }
}

/// Outcome of resuming a producer.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Suspended on a message; the next resume carries its response
    Yield(Msg),
    /// Finished with a value
    Return(Value),
    /// Finished with an error
    Raise(PlanError),
}

/// A message producer driven through the three-operation protocol.
pub trait MsgGenerator: Send {
    /// Advance to the next suspension point or to completion.
    ///
    /// Once `Return` or `Raise` has been produced, further calls keep
    /// reporting completion.
    fn resume(&mut self, input: Resume) -> Step;
}

/// Owned, type-erased producer.
pub type BoxedGenerator = Box<dyn MsgGenerator>;

impl<G: MsgGenerator + ?Sized> MsgGenerator for Box<G> {
    fn resume(&mut self, input: Resume) -> Step {
        (**self).resume(input)
    }
}

/// Drive a producer to completion, answering every message with `Null`.
///
/// Returns the messages in order together with the producer's outcome. This
/// is how a plan is inspected without an interpreter.
pub fn drain(gen: &mut dyn MsgGenerator) -> (Vec<Msg>, PlanResult<Value>) {
    let mut msgs = Vec::new();
    let mut input = Resume::Next;
    loop {
        match gen.resume(input) {
            Step::Yield(msg) => {
                msgs.push(msg);
                input = Resume::Send(Value::Null);
            }
            Step::Return(value) => return (msgs, Ok(value)),
            Step::Raise(err) => return (msgs, Err(err)),
        }
    }
}

// =============================================================================
// Leaf producers
// =============================================================================

/// Yields a fixed list of messages and returns `Null`.
struct MsgList {
    msgs: VecDeque<Msg>,
    done: bool,
}

impl MsgGenerator for MsgList {
    fn resume(&mut self, input: Resume) -> Step {
        if self.done {
            return input.finished();
        }
        if let Resume::Throw(err) = input {
            self.done = true;
            return Step::Raise(err);
        }
        match self.msgs.pop_front() {
            Some(msg) => Step::Yield(msg),
            None => {
                self.done = true;
                Step::Return(Value::Null)
            }
        }
    }
}

/// Yield `msgs` in order, ignoring responses. Errors thrown in propagate.
pub fn from_msgs(msgs: impl IntoIterator<Item = Msg>) -> BoxedGenerator {
    Box::new(MsgList {
        msgs: msgs.into_iter().collect(),
        done: false,
    })
}

enum SingleState {
    Fresh(Msg),
    Suspended,
    Done,
}

/// Yields one message and returns the response it receives.
struct Single {
    state: SingleState,
}

impl MsgGenerator for Single {
    fn resume(&mut self, input: Resume) -> Step {
        match std::mem::replace(&mut self.state, SingleState::Done) {
            SingleState::Fresh(msg) => match input {
                Resume::Throw(err) => Step::Raise(err),
                Resume::Next | Resume::Send(_) => {
                    self.state = SingleState::Suspended;
                    Step::Yield(msg)
                }
            },
            SingleState::Suspended => match input {
                Resume::Next => Step::Return(Value::Null),
                Resume::Send(value) => Step::Return(value),
                Resume::Throw(err) => Step::Raise(err),
            },
            SingleState::Done => input.finished(),
        }
    }
}

/// Yield `msg` once and return its response.
pub fn single(msg: Msg) -> BoxedGenerator {
    Box::new(Single {
        state: SingleState::Fresh(msg),
    })
}

/// Finishes immediately with either a value or an error.
struct Immediate {
    outcome: Option<PlanResult<Value>>,
}

impl MsgGenerator for Immediate {
    fn resume(&mut self, input: Resume) -> Step {
        let Some(outcome) = self.outcome.take() else {
            return input.finished();
        };
        match (input, outcome) {
            (Resume::Throw(err), _) => Step::Raise(err),
            (_, Ok(value)) => Step::Return(value),
            (_, Err(err)) => Step::Raise(err),
        }
    }
}

/// A plan that yields nothing and returns `value`.
pub fn pure(value: impl Into<Value>) -> BoxedGenerator {
    Box::new(Immediate {
        outcome: Some(Ok(value.into())),
    })
}

/// A plan that yields nothing and raises `err`.
pub fn raise(err: PlanError) -> BoxedGenerator {
    Box::new(Immediate {
        outcome: Some(Err(err)),
    })
}

/// Producer backed by a hand-written state machine.
struct FromFn<F> {
    step: F,
    done: bool,
}

impl<F> MsgGenerator for FromFn<F>
where
    F: FnMut(Resume) -> Step + Send,
{
    fn resume(&mut self, input: Resume) -> Step {
        if self.done {
            return input.finished();
        }
        let step = (self.step)(input);
        if !matches!(step, Step::Yield(_)) {
            self.done = true;
        }
        step
    }
}

/// Build a producer from a closure called once per resume.
///
/// The closure sees every input, including thrown errors, and can choose to
/// handle them. Once it returns `Return` or `Raise` it is never called again.
pub fn from_fn<F>(step: F) -> BoxedGenerator
where
    F: FnMut(Resume) -> Step + Send + 'static,
{
    Box::new(FromFn { step, done: false })
}

// =============================================================================
// Sequencing
// =============================================================================

/// Runs `first`, then the producer built from its result.
struct AndThen<F> {
    first: Option<BoxedGenerator>,
    next: Option<F>,
    second: Option<BoxedGenerator>,
}

impl<F> MsgGenerator for AndThen<F>
where
    F: FnOnce(Value) -> BoxedGenerator + Send,
{
    fn resume(&mut self, input: Resume) -> Step {
        if let Some(second) = self.second.as_mut() {
            return second.resume(input);
        }
        let Some(first) = self.first.as_mut() else {
            return input.finished();
        };
        match first.resume(input) {
            Step::Yield(msg) => Step::Yield(msg),
            Step::Return(value) => {
                self.first = None;
                let Some(next) = self.next.take() else {
                    return Step::Return(value);
                };
                let second = self.second.insert(next(value));
                second.resume(Resume::Next)
            }
            Step::Raise(err) => {
                self.first = None;
                self.next = None;
                Step::Raise(err)
            }
        }
    }
}

/// Yield from `first`, then from the producer `next` builds out of
/// `first`'s result. The composed result is the second producer's result.
pub fn and_then<F>(first: BoxedGenerator, next: F) -> BoxedGenerator
where
    F: FnOnce(Value) -> BoxedGenerator + Send + 'static,
{
    Box::new(AndThen {
        first: Some(first),
        next: Some(next),
        second: None,
    })
}

/// Yield from `first`, then from `second`, returning `second`'s result.
pub fn then(first: BoxedGenerator, second: BoxedGenerator) -> BoxedGenerator {
    and_then(first, move |_| second)
}

/// Chains producers back to back and returns the array of their results.
struct Chain {
    pending: VecDeque<BoxedGenerator>,
    results: Vec<Value>,
    done: bool,
}

impl MsgGenerator for Chain {
    fn resume(&mut self, mut input: Resume) -> Step {
        if self.done {
            return input.finished();
        }
        while let Some(current) = self.pending.front_mut() {
            match current.resume(input) {
                Step::Yield(msg) => return Step::Yield(msg),
                Step::Return(value) => {
                    self.results.push(value);
                    self.pending.pop_front();
                    input = Resume::Next;
                }
                Step::Raise(err) => {
                    self.pending.clear();
                    self.done = true;
                    return Step::Raise(err);
                }
            }
        }
        self.done = true;
        match input {
            Resume::Throw(err) => Step::Raise(err),
            Resume::Next | Resume::Send(_) => {
                Step::Return(Value::Array(std::mem::take(&mut self.results)))
            }
        }
    }
}

/// Run `gens` in sequence and return the list of their return values.
pub fn pchain(gens: impl IntoIterator<Item = BoxedGenerator>) -> BoxedGenerator {
    Box::new(Chain {
        pending: gens.into_iter().collect(),
        results: Vec::new(),
        done: false,
    })
}
