// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The erased effect algebra.
//!
//! The public [`Effect`] type is a phantom-typed wrapper around [`Erased`];
//! the interpreter dispatches on this enum alone. Concrete value types are
//! erased to `Box<dyn Any + Send>` so that one interpreter (and one fiber
//! representation) serves every effect in the program, the same reason the
//! teacher runtime erases spawned futures behind a single task shape.
//!
//! [`Effect`]: crate::effect::Effect

use crate::cause::ErasedCause;
use crate::executor::Executor;
use crate::fiber::context::ResumeHandle;
use crate::fiber::{RawExit, RawFiber, Supervision};
use core::any::Any;
use core::fmt;
use std::sync::Arc;

/// A value travelling through continuations within a single fiber.
pub(crate) type AnyValue = Box<dyn Any + Send>;

/// The ambient environment, shared by reference along the environment stack.
pub(crate) type AnyEnv = Arc<dyn Any + Send + Sync>;

/// A value continuation, as stored in [`Frame::Continue`].
pub(crate) type Cont = Box<dyn FnOnce(AnyValue) -> Erased + Send>;

/// A failure continuation, as stored in [`Frame::Fold`].
pub(crate) type ErrCont = Box<dyn FnOnce(ErasedCause) -> Erased + Send>;

/// One node of an effect tree.
///
/// Every variant corresponds to one reduction rule of the interpreter; the
/// `match` in the evaluation loop is the switch dispatch over these tags.
pub(crate) enum Erased {
    /// Produce the value immediately.
    Succeed(AnyValue),
    /// Run an infallible side effect, produce its value.
    Total(Box<dyn FnOnce() -> AnyValue + Send>),
    /// Run a fallible side effect; `Err` feeds the typed error channel.
    Partial(Box<dyn FnOnce() -> Result<AnyValue, ErasedCause> + Send>),
    /// Lazily construct an effect.
    SuspendTotal(Box<dyn FnOnce() -> Erased + Send>),
    /// Lazily construct an effect; `Err` feeds the typed error channel.
    SuspendPartial(Box<dyn FnOnce() -> Result<Erased, ErasedCause> + Send>),
    /// Sequential composition.
    FlatMap(Box<Erased>, Cont),
    /// Recover from any failure cause; doubles as a map on success.
    Fold(Box<Erased>, ErrCont, Cont),
    /// Fail with the produced cause.
    Fail(Box<dyn FnOnce() -> ErasedCause + Send>),
    /// Asynchronous suspension. The registration function may return an
    /// effect to continue with synchronously instead of suspending.
    Async(Box<dyn FnOnce(ResumeHandle) -> Option<Erased> + Send>),
    /// Spawn the inner effect on a fresh fiber; produce its raw handle.
    Fork(Box<Erased>, Supervision),
    /// Evaluate the inner effect with the given interruptibility.
    InterruptStatus(Box<Erased>, bool),
    /// Observe the current interruptibility.
    CheckInterrupt(Box<dyn FnOnce(bool) -> Erased + Send>),
    /// Observe the current fiber's identity, executor and children.
    Descriptor(Box<dyn FnOnce(crate::fiber::FiberDescriptor) -> Erased + Send>),
    /// Evaluate the inner effect on the given executor.
    Shift(Arc<dyn Executor>, Box<Erased>),
    /// Cooperatively reschedule.
    Yield,
    /// Read the ambient environment.
    Access(Box<dyn FnOnce(AnyEnv) -> Erased + Send>),
    /// Supply the environment to the inner effect.
    Provide(AnyEnv, Box<Erased>),
    /// Structured race of two child fibers.
    RaceWith(Box<RaceWith>),
    /// Promote the child to a root fiber; produce whether the current fiber
    /// was its supervisor.
    Disown(RawFiber),
}

pub(crate) struct RaceWith {
    pub(crate) left: Erased,
    pub(crate) right: Erased,
    pub(crate) left_mode: Supervision,
    pub(crate) right_mode: Supervision,
    /// Invoked if the left fiber completes first, with the loser's handle.
    pub(crate) on_left: Box<dyn FnOnce(RawExit, RawFiber) -> Erased + Send>,
    /// Invoked if the right fiber completes first, with the loser's handle.
    pub(crate) on_right: Box<dyn FnOnce(RawExit, RawFiber) -> Erased + Send>,
}

/// A frame on a fiber's continuation stack.
pub(crate) enum Frame {
    /// Apply the continuation to the current value; discarded during
    /// unwinding.
    Continue(Cont),
    /// A fold: the success side continues normal evaluation, the failure
    /// side is found by the unwinder (subject to the recovery gate).
    Fold {
        on_failure: ErrCont,
        on_success: Cont,
    },
    /// Restore the previous interruptibility when crossed, in either
    /// direction.
    InterruptExit,
    /// Restore the previous environment when crossed.
    EnvExit,
    /// Restore the previous executor when crossed.
    ExecExit,
}

// === impl Erased ===

impl Erased {
    pub(crate) fn unit() -> Self {
        Self::Succeed(Box::new(()))
    }

    pub(crate) fn from_cause(cause: ErasedCause) -> Self {
        Self::Fail(Box::new(move || cause))
    }

    pub(crate) fn flat_map(self, k: impl FnOnce(AnyValue) -> Erased + Send + 'static) -> Self {
        Self::FlatMap(Box::new(self), Box::new(k))
    }
}

impl fmt::Debug for Erased {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeed(_) => "Succeed",
            Self::Total(_) => "Total",
            Self::Partial(_) => "Partial",
            Self::SuspendTotal(_) => "SuspendTotal",
            Self::SuspendPartial(_) => "SuspendPartial",
            Self::FlatMap(..) => "FlatMap",
            Self::Fold(..) => "Fold",
            Self::Fail(_) => "Fail",
            Self::Async(_) => "Async",
            Self::Fork(..) => "Fork",
            Self::InterruptStatus(..) => "InterruptStatus",
            Self::CheckInterrupt(_) => "CheckInterrupt",
            Self::Descriptor(_) => "Descriptor",
            Self::Shift(..) => "Shift",
            Self::Yield => "Yield",
            Self::Access(_) => "Access",
            Self::Provide(..) => "Provide",
            Self::RaceWith(_) => "RaceWith",
            Self::Disown(_) => "Disown",
        })
    }
}

/// Moves a typed value out of the erased representation.
///
/// The typed surface guarantees the payload type; a mismatch is unreachable
/// without a bug in the wrappers.
pub(crate) fn unbox<A: 'static>(value: AnyValue) -> A {
    *value
        .downcast::<A>()
        .expect("effect produced a value of an unexpected type, this is a bug")
}
