// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fibers: user-space tasks interpreting effect trees.
//!
//! A fiber splits into two halves. The *shared* half ([`Inner`], reached
//! through reference-counted [`RawFiber`] handles) carries the atomic
//! lifecycle state, the exit slot, observers, supervised children and the
//! parked continuation of a suspended fiber. The *owned* half (the
//! continuation stack and friends, [`context::EvalState`]) moves with
//! whichever executor thread currently evaluates the fiber; exactly one
//! thread owns it at a time, and ownership migrates only through
//! [`Executor::submit`] or the suspension protocol on [`state::State`].
//!
//! [`Executor::submit`]: crate::executor::Executor::submit

pub(crate) mod context;
mod id;
mod state;

pub use id::FiberId;

use crate::cause::{Cause, Defect, ErasedCause, ErasedFailure, Failure};
use crate::effect::repr::{AnyValue, Erased, unbox};
use crate::effect::Effect;
use crate::executor::Executor;
use crate::exit::Exit;
use crate::fiber::context::EvalState;
use crate::fiber::state::{InterruptAction, State};
use crate::platform::Platform;
use crate::util::LockExt;
use core::fmt;
use core::marker::PhantomData;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

/// Parent-to-child policy applied when the parent fiber exits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Supervision {
    /// Interrupt the child and await its completion (finalizers included)
    /// before the parent finishes.
    Interrupt,
    /// Interrupt the child but do not await it (fork-and-forget
    /// interruption).
    InterruptFork,
    /// The child is a root from birth; the parent's exit does not affect it.
    Disown,
}

/// The exit of a fiber as stored in its shared state.
///
/// The success value sits in a take-once [`ValueSlot`] so that causes can be
/// broadcast to every observer while the value itself is moved out exactly
/// once (by `join`, or by a race winner's done-handler).
pub(crate) type RawExit = Exit<ValueSlot, ErasedFailure>;

/// A completion callback. Observers are notified through executor
/// submission, never inline.
pub(crate) type Observer = Box<dyn FnOnce(RawExit) + Send>;

/// A take-once slot holding a completed fiber's success value.
pub(crate) struct ValueSlot(Arc<Mutex<Option<AnyValue>>>);

pub(crate) struct Inner {
    id: FiberId,
    state: State,
    platform: Arc<Platform>,
    span: tracing::Span,
    exit: Mutex<Option<RawExit>>,
    observers: Mutex<Vec<Observer>>,
    children: Mutex<BTreeMap<FiberId, (RawFiber, Supervision)>>,
    parent: Mutex<Option<Weak<Inner>>>,
    /// The owned evaluation state, parked here for the duration of an async
    /// suspension. Whoever wins the resume CAS on `state` takes it.
    parked: Mutex<Option<EvalState>>,
    /// Everyone who asked this fiber to stop, in arrival order.
    interrupters: Mutex<Vec<FiberId>>,
}

/// A type-erased, reference-counted handle to a fiber.
pub(crate) struct RawFiber(pub(crate) Arc<Inner>);

// === impl ValueSlot ===

impl ValueSlot {
    pub(crate) fn new(value: AnyValue) -> Self {
        Self(Arc::new(Mutex::new(Some(value))))
    }

    pub(crate) fn take(&self) -> Option<AnyValue> {
        self.0.locked().take()
    }
}

impl Clone for ValueSlot {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl fmt::Debug for ValueSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.locked().is_some() {
            f.write_str("ValueSlot(..)")
        } else {
            f.write_str("ValueSlot(<taken>)")
        }
    }
}

// === impl RawFiber ===

impl RawFiber {
    pub(crate) fn new(platform: Arc<Platform>) -> Self {
        let id = platform.next_fiber_id();
        let span = tracing::trace_span!("fiber", fiber.id = id.as_u64());
        Self(Arc::new(Inner {
            id,
            state: State::new(),
            platform,
            span,
            exit: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
            children: Mutex::new(BTreeMap::new()),
            parent: Mutex::new(None),
            parked: Mutex::new(None),
            interrupters: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn id(&self) -> FiberId {
        self.0.id
    }

    pub(crate) fn state(&self) -> &State {
        &self.0.state
    }

    pub(crate) fn platform(&self) -> &Arc<Platform> {
        &self.0.platform
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.0.span
    }

    /// Parks the owned evaluation state ahead of an async suspension.
    pub(crate) fn park(&self, eval: EvalState) {
        let prev = self.0.parked.locked().replace(eval);
        debug_assert!(prev.is_none(), "fiber parked twice, this is a bug");
    }

    /// Takes the parked evaluation state. Only legal for the winner of a
    /// resume transition (or for the owner backing out of a refused
    /// suspension).
    pub(crate) fn take_parked(&self) -> Option<EvalState> {
        self.0.parked.locked().take()
    }

    /// Asks this fiber to stop on behalf of fiber `by`.
    ///
    /// Idempotent. If the fiber is suspended in an interruptible region this
    /// caller may win the takeover, in which case it reschedules the fiber
    /// with an interrupt failure itself.
    pub(crate) fn interrupt_as(&self, by: FiberId) {
        {
            let mut interrupters = self.0.interrupters.locked();
            if !interrupters.contains(&by) {
                interrupters.push(by);
            }
        }

        match self.state().interrupt() {
            InterruptAction::Resume => {
                tracing::trace!(fiber = %self.id(), by = %by, "interrupt resumes suspended fiber");
                let eval = self
                    .take_parked()
                    .expect("suspended fiber has no parked state, this is a bug");
                let cause = self.interrupt_cause();
                context::schedule(self.clone(), eval, Erased::from_cause(cause));
            }
            InterruptAction::Noted => {
                tracing::trace!(fiber = %self.id(), by = %by, "interrupt noted");
            }
            InterruptAction::AlreadyDone => {}
        }
    }

    /// The cause this fiber fails with when its interruption is observed:
    /// every interrupter, composed in parallel.
    pub(crate) fn interrupt_cause(&self) -> ErasedCause {
        let interrupters = self.0.interrupters.locked();
        let mut cause = ErasedCause::Empty;
        for id in interrupters.iter() {
            cause = cause.and(Cause::Interrupt(*id));
        }
        if cause.is_empty() {
            cause = Cause::Interrupt(self.id());
        }
        cause
    }

    /// Registers `observer` to run (via executor submission) once this fiber
    /// completes; fires immediately if it already has.
    pub(crate) fn on_done(&self, observer: Observer) {
        let mut observers = self.0.observers.locked();
        if self.state().is_done() {
            drop(observers);
            let exit = self
                .poll_exit()
                .expect("done fiber has no exit, this is a bug");
            self.submit_observer(observer, exit);
        } else {
            observers.push(observer);
        }
    }

    pub(crate) fn poll_exit(&self) -> Option<RawExit> {
        if self.state().is_done() {
            self.0.exit.locked().clone()
        } else {
            None
        }
    }

    /// Writes the final exit and notifies observers, in FIFO order, each via
    /// its own executor submission.
    ///
    /// Returns `false` if the fiber had already completed.
    pub(crate) fn complete(&self, exit: RawExit) -> bool {
        {
            // holding the exit slot across the phase transition means anyone
            // who observes `Done` also observes the written exit
            let mut slot = self.0.exit.locked();
            if !self.state().try_complete() {
                return false;
            }
            *slot = Some(exit.clone());
        }
        tracing::trace!(fiber = %self.id(), done = ?exit, "fiber completed");

        // a completed child no longer needs supervising
        self.remove_from_parent();

        let observers = {
            let mut observers = self.0.observers.locked();
            core::mem::take(&mut *observers)
        };

        if observers.is_empty() {
            if let Exit::Failure(cause) = &exit {
                // interrupts the program itself produced are not failures
                // worth reporting; everything else is
                if !cause.is_interrupted_only() {
                    self.platform().report_failure(cause);
                }
            }
            return true;
        }

        for observer in observers {
            self.submit_observer(observer, exit.clone());
        }
        true
    }

    fn submit_observer(&self, observer: Observer, exit: RawExit) {
        fn run(observer: Observer, exit: RawExit) {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| observer(exit))) {
                let defect = Defect::from_panic(&*payload);
                tracing::error!(%defect, "fiber observer panicked");
            }
        }

        // the cell lets us reclaim the notification if the pool rejects it
        let cell = Arc::new(Mutex::new(Some((observer, exit))));
        let submitted = Arc::clone(&cell);
        let accepted = self.platform().executor_async().submit(Box::new(move || {
            if let Some((observer, exit)) = submitted.locked().take() {
                run(observer, exit);
            }
        }));
        if !accepted {
            // the pool is shutting down; run the notification inline rather
            // than strand whoever is waiting on it
            if let Some((observer, exit)) = cell.locked().take() {
                run(observer, exit);
            }
        }
    }

    pub(crate) fn register_child(&self, child: &RawFiber, mode: Supervision) {
        *child.0.parent.locked() = Some(Arc::downgrade(&self.0));
        self.0
            .children
            .locked()
            .insert(child.id(), (child.clone(), mode));
    }

    pub(crate) fn remove_child(&self, id: FiberId) -> bool {
        self.0.children.locked().remove(&id).is_some()
    }

    pub(crate) fn clear_parent(&self) {
        *self.0.parent.locked() = None;
    }

    fn remove_from_parent(&self) {
        let parent = self.0.parent.locked().take();
        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            RawFiber(parent).remove_child(self.id());
        }
    }

    /// Removes and returns every supervised child, for the supervision drain
    /// at fiber exit.
    pub(crate) fn drain_children(&self) -> Vec<(RawFiber, Supervision)> {
        let mut children = self.0.children.locked();
        let drained: Vec<_> = core::mem::take(&mut *children).into_values().collect();
        drained
    }

    pub(crate) fn children_ids(&self) -> Vec<FiberId> {
        self.0.children.locked().keys().copied().collect()
    }
}

impl Clone for RawFiber {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl fmt::Debug for RawFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFiber")
            .field("id", &self.id())
            .field("state", self.state())
            .finish()
    }
}

// === impl FiberDescriptor ===

/// An immutable snapshot of a fiber's identity and surroundings, produced by
/// [`Effect::descriptor`].
///
/// [`Effect::descriptor`]: crate::effect::Effect::descriptor
#[derive(Clone)]
pub struct FiberDescriptor {
    pub(crate) id: FiberId,
    pub(crate) interrupted: bool,
    pub(crate) interruptible: bool,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) children: Vec<FiberId>,
    pub(crate) platform: Arc<Platform>,
}

impl FiberDescriptor {
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Whether someone has asked this fiber to stop.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Whether the fiber would currently observe an interrupt.
    pub fn is_interruptible(&self) -> bool {
        self.interruptible
    }

    /// The executor the fiber is currently running on.
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// The ids of the currently supervised children.
    pub fn children(&self) -> &[FiberId] {
        &self.children
    }
}

impl fmt::Debug for FiberDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberDescriptor")
            .field("id", &self.id)
            .field("interrupted", &self.interrupted)
            .field("interruptible", &self.interruptible)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

// === impl Fiber ===

/// A typed handle to a running fiber, produced by [`Effect::fork`].
///
/// Operations that consume the fiber's result value ([`Fiber::join`],
/// [`Fiber::await_`]) take the handle by value: the value lives in a
/// take-once slot and has exactly one consumer. Interruption and polling
/// work through a shared reference.
///
/// [`Effect::fork`]: crate::effect::Effect::fork
pub struct Fiber<A, E = core::convert::Infallible> {
    raw: RawFiber,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Fiber<A, E>
where
    A: Send + 'static,
    E: Failure,
{
    pub(crate) fn from_raw(raw: RawFiber) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> &RawFiber {
        &self.raw
    }

    pub fn id(&self) -> FiberId {
        self.raw.id()
    }

    /// Waits for the fiber to complete and produces its full [`Exit`].
    ///
    /// Never fails: an interrupted or failed fiber surfaces through the exit
    /// value, not through the caller's error channel.
    pub fn await_(self) -> Effect<Exit<A, E>, core::convert::Infallible> {
        let raw = self.raw;
        Effect::from_erased(Erased::Async(Box::new(move |handle| {
            if let Some(exit) = raw.poll_exit() {
                return Some(Erased::Succeed(Box::new(typed_exit::<A, E>(exit))));
            }
            raw.on_done(Box::new(move |exit| {
                handle.resume(Erased::Succeed(Box::new(typed_exit::<A, E>(exit))));
            }));
            None
        })))
    }

    /// Waits for the fiber and adopts its result: its success value, or its
    /// failure cause (interruption included) re-raised on this fiber.
    pub fn join(self) -> Effect<A, E> {
        self.await_()
            .widen_err::<E>()
            .flat_map(|exit| Effect::done(exit))
    }

    /// Interrupts the fiber on behalf of the calling fiber and awaits its
    /// completion, finalizers included.
    pub fn interrupt(&self) -> Effect<(), core::convert::Infallible> {
        let raw = self.raw.clone();
        Effect::descriptor_with(move |descriptor| {
            raw.interrupt_as(descriptor.id());
            await_termination(raw)
        })
    }

    /// Interrupts the fiber on behalf of fiber `by` and awaits its
    /// completion, finalizers included. The fiber's interrupt cause is
    /// attributed to `by` rather than the caller.
    pub fn interrupt_as(&self, by: FiberId) -> Effect<(), core::convert::Infallible> {
        let raw = self.raw.clone();
        Effect::suspend(move || {
            raw.interrupt_as(by);
            await_termination(raw)
        })
    }

    /// Interrupts the fiber on behalf of the calling fiber without waiting
    /// for it to wind down.
    pub fn interrupt_fork(&self) -> Effect<(), core::convert::Infallible> {
        let raw = self.raw.clone();
        Effect::descriptor_with(move |descriptor| {
            raw.interrupt_as(descriptor.id());
            Effect::unit()
        })
    }

    /// Observes whether the fiber has completed, without consuming its
    /// value: a completed fiber reports its exit with the success value
    /// replaced by `()`.
    pub fn poll(&self) -> Effect<Option<Exit<(), E>>, core::convert::Infallible> {
        let raw = self.raw.clone();
        Effect::sync(move || {
            raw.poll_exit().map(|exit| match exit {
                Exit::Success(_) => Exit::Success(()),
                Exit::Failure(cause) => Exit::Failure(cause.into_typed::<E>()),
            })
        })
    }
}

/// Waits for a fiber to reach `Done`, ignoring its result.
fn await_termination(raw: RawFiber) -> Effect<(), core::convert::Infallible> {
    Effect::from_erased(Erased::Async(Box::new(move |handle| {
        if raw.state().is_done() {
            return Some(Erased::unit());
        }
        raw.on_done(Box::new(move |_exit| {
            handle.resume(Erased::unit());
        }));
        None
    })))
}

/// Converts a raw exit into the typed exit a handle's consumer sees.
pub(crate) fn typed_exit<A: Send + 'static, E: Failure>(exit: RawExit) -> Exit<A, E> {
    match exit {
        Exit::Success(slot) => match slot.take() {
            Some(value) => Exit::Success(unbox::<A>(value)),
            None => Exit::Failure(Cause::die(Defect::from(
                "fiber result was already consumed by another observer",
            ))),
        },
        Exit::Failure(cause) => Exit::Failure(cause.into_typed::<E>()),
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber").field("id", &self.raw.id()).finish()
    }
}
