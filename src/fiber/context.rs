// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The interpreter: one evaluation loop per scheduled fiber slice.
//!
//! [`evaluate`] walks an effect tree, doing at most `yield_op_count`
//! reductions before resubmitting itself to the current executor. Suspension
//! happens in exactly one way — parking the owned [`EvalState`] in the
//! fiber's shared half and transitioning the state word to `Suspended` — so
//! that resumption from async callbacks, interrupters and synchronous
//! shortcuts can race through a single CAS and exactly one of them wins
//! ownership of the parked state.

use crate::cause::{Cause, Defect, ErasedCause};
use crate::effect::repr::{AnyEnv, AnyValue, Erased, Frame, RaceWith};
use crate::executor::Executor;
use crate::exit::Exit;
use crate::fiber::{FiberDescriptor, RawExit, RawFiber, Supervision, ValueSlot};
use crate::platform::Platform;
use crate::util::LockExt;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::{Arc, Mutex};

/// The owned half of a fiber: everything the evaluation loop mutates without
/// synchronization. Exactly one thread owns an `EvalState` at any time.
pub(crate) struct EvalState {
    /// The continuation stack.
    frames: Vec<Frame>,
    /// Interruptibility regions; the top is the current status.
    interrupt_status: Vec<bool>,
    /// Executor overrides from `Shift`; empty means the platform default.
    executors: Vec<Arc<dyn Executor>>,
    /// The environment stack; the top is the current environment.
    environments: Vec<AnyEnv>,
}

// === impl EvalState ===

impl EvalState {
    pub(crate) fn new(environment: AnyEnv) -> Self {
        Self {
            frames: Vec::new(),
            interrupt_status: vec![true],
            executors: Vec::new(),
            environments: vec![environment],
        }
    }

    fn interruptible(&self) -> bool {
        *self
            .interrupt_status
            .last()
            .expect("interrupt status stack underflow, this is a bug")
    }

    fn environment(&self) -> AnyEnv {
        self.environments
            .last()
            .expect("environment stack underflow, this is a bug")
            .clone()
    }

    fn executor(&self, platform: &Platform) -> Arc<dyn Executor> {
        self.executors
            .last()
            .cloned()
            .unwrap_or_else(|| Arc::clone(platform.executor_async()))
    }
}

/// A one-shot capability to resume a suspended fiber, handed to async
/// registrations.
///
/// Cloning is allowed (registrations often hand the callback to several
/// places); the suspension epoch in the fiber's state word guarantees at
/// most one resume per suspension wins.
pub(crate) struct ResumeHandle {
    fiber: RawFiber,
    epoch: usize,
}

impl ResumeHandle {
    /// Resumes the fiber with `effect`. Returns `false` if someone else
    /// (another callback, an interrupter, or a synchronous shortcut) already
    /// resumed this suspension.
    pub(crate) fn resume(&self, effect: Erased) -> bool {
        if self.fiber.state().try_resume(self.epoch) {
            let eval = self
                .fiber
                .take_parked()
                .expect("resumed fiber has no parked state, this is a bug");
            schedule(self.fiber.clone(), eval, effect);
            true
        } else {
            tracing::trace!(fiber = %self.fiber.id(), "stale resume discarded");
            false
        }
    }
}

impl Clone for ResumeHandle {
    fn clone(&self) -> Self {
        Self {
            fiber: self.fiber.clone(),
            epoch: self.epoch,
        }
    }
}

/// Submits a fresh evaluation slice for `fiber` to its current executor.
pub(crate) fn schedule(fiber: RawFiber, eval: EvalState, effect: Erased) {
    let executor = eval.executor(fiber.platform());
    submit_slice(fiber, eval, effect, &executor);
}

fn submit_slice(fiber: RawFiber, eval: EvalState, effect: Erased, executor: &Arc<dyn Executor>) {
    let task_fiber = fiber.clone();
    let accepted = executor.submit(Box::new(move || evaluate(task_fiber, eval, effect)));
    if !accepted {
        // the slice is gone; all we can do is terminate the fiber so its
        // observers learn about it, and tell the platform
        let cause: ErasedCause = Cause::die(Defect::from("executor rejected a fiber slice"));
        fiber.platform().report_failure(&cause);
        fiber.complete(Exit::Failure(cause));
    }
}

/// What a single reduction decided.
enum StepResult {
    /// Keep looping with this effect.
    Continue(Erased),
    /// The slice is over: the fiber suspended, yielded, shifted executors or
    /// completed. The evaluation state has moved wherever it needed to go.
    Stop,
}

/// Evaluates `effect` on the current thread until the fiber suspends,
/// yields, or completes.
pub(crate) fn evaluate(fiber: RawFiber, eval: EvalState, effect: Erased) {
    let span = fiber.span().clone();
    let _entered = span.enter();

    let mut slot = Some(eval);
    let mut cur = effect;
    let mut budget = fiber.platform().yield_op_count();

    loop {
        // Interruption gating: at every reduction boundary, a pending
        // interrupt in an interruptible region replaces the current effect,
        // unless the fiber is already unwinding towards its interruption
        // exit.
        {
            let state = fiber.state();
            let interruptible = slot
                .as_ref()
                .expect("evaluation state missing at loop boundary, this is a bug")
                .interruptible();
            if interruptible && state.is_interrupted() && !state.is_terminating() {
                state.set_terminating();
                cur = Erased::from_cause(fiber.interrupt_cause());
            }
        }

        if budget == 0 {
            tracing::trace!(fiber = %fiber.id(), "reduction budget spent, yielding");
            let eval = slot.take().expect("evaluation state missing, this is a bug");
            schedule(fiber, eval, cur);
            return;
        }
        budget -= 1;

        let result = catch_unwind(AssertUnwindSafe(|| step(&fiber, &mut slot, cur)));
        match result {
            Ok(StepResult::Continue(next)) => cur = next,
            Ok(StepResult::Stop) => return,
            Err(payload) => {
                if fiber.platform().is_fatal(&*payload) {
                    resume_unwind(payload);
                }
                let defect = Defect::from_panic(&*payload);
                if slot.is_none() {
                    // the evaluation state moved before the panic; this
                    // slice no longer owns the fiber
                    tracing::error!(fiber = %fiber.id(), %defect, "panic after the slice released the fiber");
                    return;
                }
                tracing::trace!(fiber = %fiber.id(), %defect, "caught panic, converting to defect");
                cur = Erased::from_cause(Cause::Die(defect));
            }
        }
    }
}

/// Performs one reduction. `slot` holds the owned evaluation state; the
/// suspending and yielding arms take it out, every other arm borrows it.
fn step(fiber: &RawFiber, slot: &mut Option<EvalState>, cur: Erased) -> StepResult {
    match cur {
        Erased::Succeed(value) => next_value(fiber, slot, value),

        Erased::Total(thunk) => next_value(fiber, slot, thunk()),

        Erased::Partial(thunk) => match thunk() {
            Ok(value) => next_value(fiber, slot, value),
            Err(cause) => unwind(fiber, slot, cause),
        },

        Erased::SuspendTotal(make) => StepResult::Continue(make()),

        Erased::SuspendPartial(make) => match make() {
            Ok(effect) => StepResult::Continue(effect),
            Err(cause) => unwind(fiber, slot, cause),
        },

        Erased::FlatMap(inner, k) => match *inner {
            // the common constructors continue without a stack frame
            Erased::Succeed(value) => StepResult::Continue(k(value)),
            Erased::Total(thunk) => StepResult::Continue(k(thunk())),
            Erased::Descriptor(make) => {
                let descriptor = make_descriptor(fiber, eval(slot));
                StepResult::Continue(Erased::FlatMap(Box::new(make(descriptor)), k))
            }
            inner => {
                eval(slot).frames.push(Frame::Continue(k));
                StepResult::Continue(inner)
            }
        },

        Erased::Fold(inner, on_failure, on_success) => {
            eval(slot).frames.push(Frame::Fold {
                on_failure,
                on_success,
            });
            StepResult::Continue(*inner)
        }

        Erased::Fail(make) => {
            let cause = make();
            unwind(fiber, slot, cause)
        }

        Erased::Async(register) => suspend(fiber, slot, register),

        Erased::Fork(inner, mode) => {
            let child = spawn_child(fiber, eval(slot), *inner, mode);
            next_value(fiber, slot, Box::new(child))
        }

        Erased::InterruptStatus(inner, interruptible) => {
            let eval = eval(slot);
            eval.interrupt_status.push(interruptible);
            eval.frames.push(Frame::InterruptExit);
            StepResult::Continue(*inner)
        }

        Erased::CheckInterrupt(make) => {
            let interruptible = eval(slot).interruptible();
            StepResult::Continue(make(interruptible))
        }

        Erased::Descriptor(make) => {
            let descriptor = make_descriptor(fiber, eval(slot));
            StepResult::Continue(make(descriptor))
        }

        Erased::Shift(executor, inner) => {
            let eval_ref = eval(slot);
            eval_ref.executors.push(Arc::clone(&executor));
            eval_ref.frames.push(Frame::ExecExit);
            // resubmit so the inner effect actually begins on the target
            let eval = slot.take().expect("evaluation state missing, this is a bug");
            submit_slice(fiber.clone(), eval, *inner, &executor);
            StepResult::Stop
        }

        Erased::Yield => {
            tracing::trace!(fiber = %fiber.id(), "cooperative yield");
            let eval = slot.take().expect("evaluation state missing, this is a bug");
            schedule(fiber.clone(), eval, Erased::unit());
            StepResult::Stop
        }

        Erased::Access(make) => {
            let environment = eval(slot).environment();
            StepResult::Continue(make(environment))
        }

        Erased::Provide(environment, inner) => {
            let eval = eval(slot);
            eval.environments.push(environment);
            eval.frames.push(Frame::EnvExit);
            StepResult::Continue(*inner)
        }

        Erased::RaceWith(race) => race_with(fiber, slot, *race),

        Erased::Disown(child) => {
            let owned = fiber.remove_child(child.id());
            if owned {
                child.clear_parent();
                tracing::trace!(fiber = %fiber.id(), child = %child.id(), "child disowned");
            }
            next_value(fiber, slot, Box::new(owned))
        }
    }
}

fn eval<'a>(slot: &'a mut Option<EvalState>) -> &'a mut EvalState {
    slot.as_mut()
        .expect("evaluation state missing mid-step, this is a bug")
}

/// Feeds `value` to the next continuation on the stack, processing sentinel
/// frames on the way; completes the fiber when the stack is empty.
fn next_value(fiber: &RawFiber, slot: &mut Option<EvalState>, value: AnyValue) -> StepResult {
    loop {
        let frame = match eval(slot).frames.pop() {
            Some(frame) => frame,
            None => return finalize(fiber, slot, Ok(value)),
        };
        match frame {
            Frame::Continue(k) => return StepResult::Continue(k(value)),
            Frame::Fold { on_success, .. } => return StepResult::Continue(on_success(value)),
            Frame::InterruptExit => {
                eval(slot).interrupt_status.pop();
            }
            Frame::EnvExit => {
                eval(slot).environments.pop();
            }
            Frame::ExecExit => {
                let eval_ref = eval(slot);
                let popped = eval_ref
                    .executors
                    .pop()
                    .expect("executor stack underflow, this is a bug");
                let restored = eval_ref.executor(fiber.platform());
                if Arc::ptr_eq(&popped, &restored) {
                    continue;
                }
                // return to the restored executor before continuing
                let eval = slot.take().expect("evaluation state missing, this is a bug");
                submit_slice(fiber.clone(), eval, Erased::Succeed(value), &restored);
                return StepResult::Stop;
            }
        }
    }
}

/// Unwinds the continuation stack with `cause`, honoring fold frames subject
/// to the recovery gate: an interrupt may not be caught from a region that
/// is still interruptible.
fn unwind(fiber: &RawFiber, slot: &mut Option<EvalState>, cause: ErasedCause) -> StepResult {
    loop {
        let frame = match eval(slot).frames.pop() {
            Some(frame) => frame,
            None => return finalize(fiber, slot, Err(cause)),
        };
        match frame {
            Frame::Continue(_) => {}
            Frame::InterruptExit => {
                eval(slot).interrupt_status.pop();
            }
            Frame::EnvExit => {
                eval(slot).environments.pop();
            }
            Frame::ExecExit => {
                eval(slot)
                    .executors
                    .pop()
                    .expect("executor stack underflow, this is a bug");
            }
            Frame::Fold { on_failure, .. } => {
                let recoverable =
                    !(fiber.state().is_interrupted() && eval(slot).interruptible());
                if recoverable {
                    // a handler taking over ends the termination sweep; a
                    // still-pending interrupt re-fires at the next
                    // interruptible reduction boundary
                    fiber.state().clear_terminating();
                    return StepResult::Continue(on_failure(cause));
                }
            }
        }
    }
}

/// Completes the fiber, first interrupting and (per supervision mode)
/// awaiting every still-registered child. Children forked while the drain
/// runs are drained by the next round.
fn finalize(
    fiber: &RawFiber,
    slot: &mut Option<EvalState>,
    result: Result<AnyValue, ErasedCause>,
) -> StepResult {
    let children = fiber.drain_children();
    if children.is_empty() {
        let exit = match result {
            Ok(value) => Exit::Success(ValueSlot::new(value)),
            Err(cause) => Exit::Failure(cause),
        };
        fiber.complete(exit);
        return StepResult::Stop;
    }

    tracing::trace!(fiber = %fiber.id(), children = children.len(), "interrupting supervised children");
    fiber.state().set_terminating();
    let my_id = fiber.id();

    let mut drain = Erased::unit();
    for (child, mode) in children {
        child.interrupt_as(my_id);
        if mode == Supervision::Interrupt {
            drain = drain.flat_map(move |_| await_child(child));
        }
    }

    // re-surface the original result once the drain completes; the stack is
    // empty, so it finalizes again
    let resume = match result {
        Ok(value) => Erased::Succeed(value),
        Err(cause) => Erased::from_cause(cause),
    };
    StepResult::Continue(Erased::InterruptStatus(
        Box::new(drain.flat_map(move |_| resume)),
        false,
    ))
}

fn await_child(child: RawFiber) -> Erased {
    Erased::Async(Box::new(move |handle| {
        if child.state().is_done() {
            return Some(Erased::unit());
        }
        child.on_done(Box::new(move |_exit| {
            handle.resume(Erased::unit());
        }));
        None
    }))
}

/// The `EffectAsync` reduction: park, transition to `Suspended`, register.
fn suspend(
    fiber: &RawFiber,
    slot: &mut Option<EvalState>,
    register: Box<dyn FnOnce(ResumeHandle) -> Option<Erased> + Send>,
) -> StepResult {
    let interruptible = eval(slot).interruptible();

    // park first: whoever wins the resume CAS owns the parked state
    let eval = slot.take().expect("evaluation state missing, this is a bug");
    fiber.park(eval);

    let epoch = match fiber.state().try_suspend(interruptible) {
        Ok(epoch) => epoch,
        Err(()) => {
            // interrupted before we could suspend; back out (the phase never
            // left Running, so nobody else can have taken the state)
            let eval = fiber
                .take_parked()
                .expect("parked state vanished before suspension, this is a bug");
            *slot = Some(eval);
            return StepResult::Continue(Erased::from_cause(fiber.interrupt_cause()));
        }
    };
    tracing::trace!(fiber = %fiber.id(), interruptible, "suspended");

    let handle = ResumeHandle {
        fiber: fiber.clone(),
        epoch,
    };
    // the registration is user code; a panic here must be resolved against
    // the suspension we just entered, not rethrown past it
    let registered = catch_unwind(AssertUnwindSafe(|| register(handle)));
    let registered = match registered {
        Ok(registered) => registered,
        Err(payload) => {
            if fiber.platform().is_fatal(&*payload) {
                resume_unwind(payload);
            }
            let defect = Defect::from_panic(&*payload);
            if fiber.state().try_resume(epoch) {
                let eval = fiber
                    .take_parked()
                    .expect("resumed fiber has no parked state, this is a bug");
                *slot = Some(eval);
                return StepResult::Continue(Erased::from_cause(Cause::Die(defect)));
            }
            // a callback fired before the panic; the fiber lives on elsewhere
            tracing::error!(fiber = %fiber.id(), %defect, "async registration panicked after resuming");
            return StepResult::Stop;
        }
    };
    match registered {
        Some(shortcut) => {
            // the registration produced a synchronous result; take the
            // suspension back, unless a concurrent resume beat us to it
            if fiber.state().try_resume(epoch) {
                let eval = fiber
                    .take_parked()
                    .expect("resumed fiber has no parked state, this is a bug");
                *slot = Some(eval);
                StepResult::Continue(shortcut)
            } else {
                tracing::trace!(fiber = %fiber.id(), "synchronous shortcut lost the resume race");
                StepResult::Stop
            }
        }
        None => StepResult::Stop,
    }
}

fn spawn_child(
    fiber: &RawFiber,
    eval: &mut EvalState,
    effect: Erased,
    mode: Supervision,
) -> RawFiber {
    let child = RawFiber::new(Arc::clone(fiber.platform()));
    if mode != Supervision::Disown {
        fiber.register_child(&child, mode);
    }
    tracing::trace!(fiber = %fiber.id(), child = %child.id(), ?mode, "forked");

    let mut child_eval = EvalState::new(eval.environment());
    // the child begins on (and stays pinned to) the parent's current
    // executor overrides
    child_eval.executors = eval.executors.clone();
    schedule(child.clone(), child_eval, effect);
    child
}

struct RaceArm {
    on_left: Box<dyn FnOnce(RawExit, RawFiber) -> Erased + Send>,
    on_right: Box<dyn FnOnce(RawExit, RawFiber) -> Erased + Send>,
    left: RawFiber,
    right: RawFiber,
}

/// The `RaceWith` reduction: fork both sides, then suspend until the first
/// completion resumes the parent through the matching done-handler. The
/// loser is *not* interrupted here; that policy belongs to the handlers.
fn race_with(fiber: &RawFiber, slot: &mut Option<EvalState>, race: RaceWith) -> StepResult {
    let RaceWith {
        left,
        right,
        left_mode,
        right_mode,
        on_left,
        on_right,
    } = race;

    let left_fiber = spawn_child(fiber, eval(slot), left, left_mode);
    let right_fiber = spawn_child(fiber, eval(slot), right, right_mode);

    let interruptible = eval(slot).interruptible();
    let eval = slot.take().expect("evaluation state missing, this is a bug");
    fiber.park(eval);

    let epoch = match fiber.state().try_suspend(interruptible) {
        Ok(epoch) => epoch,
        Err(()) => {
            let eval = fiber
                .take_parked()
                .expect("parked state vanished before suspension, this is a bug");
            *slot = Some(eval);
            // the freshly forked children stay supervised; the unwind ahead
            // interrupts them
            return StepResult::Continue(Erased::from_cause(fiber.interrupt_cause()));
        }
    };

    let handle = ResumeHandle {
        fiber: fiber.clone(),
        epoch,
    };
    let arm = Arc::new(Mutex::new(Some(RaceArm {
        on_left,
        on_right,
        left: left_fiber.clone(),
        right: right_fiber.clone(),
    })));

    // the left observer registers first: a tie inside one CAS window goes to
    // the left side
    {
        let arm = Arc::clone(&arm);
        let handle = handle.clone();
        left_fiber.on_done(Box::new(move |exit| {
            if let Some(arm) = arm.locked().take() {
                handle.resume(run_race_handler(arm.on_left, exit, arm.right));
            }
        }));
    }
    {
        let arm = Arc::clone(&arm);
        right_fiber.on_done(Box::new(move |exit| {
            if let Some(arm) = arm.locked().take() {
                handle.resume(run_race_handler(arm.on_right, exit, arm.left));
            }
        }));
    }

    StepResult::Stop
}

/// Runs a race done-handler on the notifying thread; a panicking handler
/// resumes the parent with a defect instead of stranding it.
fn run_race_handler(
    handler: Box<dyn FnOnce(RawExit, RawFiber) -> Erased + Send>,
    exit: RawExit,
    loser: RawFiber,
) -> Erased {
    match catch_unwind(AssertUnwindSafe(|| handler(exit, loser))) {
        Ok(effect) => effect,
        Err(payload) => Erased::from_cause(Cause::Die(Defect::from_panic(&*payload))),
    }
}

fn make_descriptor(fiber: &RawFiber, eval: &mut EvalState) -> FiberDescriptor {
    FiberDescriptor {
        id: fiber.id(),
        interrupted: fiber.state().is_interrupted(),
        interruptible: eval.interruptible(),
        executor: eval.executor(fiber.platform()),
        children: fiber.children_ids(),
        platform: Arc::clone(fiber.platform()),
    }
}
