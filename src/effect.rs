// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The typed effect surface.
//!
//! An [`Effect<A, E>`] is an immutable description of a computation that,
//! when run by a [`Runtime`], either succeeds with an `A`, fails with a
//! [`Cause<E>`], or never completes. Effects are inert values: constructing
//! one performs no work, and the only way to make one happen is to hand it
//! to a runtime (or fork it from a running effect).
//!
//! Effects are one-shot: combinators take `self` by value and running
//! consumes the tree. Build a fresh effect (usually from a closure) when you
//! need to run the same logic twice.
//!
//! [`Runtime`]: crate::runtime::Runtime

pub(crate) mod repr;

use crate::cause::{Cause, Defect, Failure};
use crate::exit::Exit;
use crate::fiber::context::ResumeHandle;
use crate::fiber::{Fiber, FiberDescriptor, Supervision, typed_exit};
use crate::executor::Executor;
use crate::util::LockExt;
use core::convert::Infallible;
use core::marker::PhantomData;
use repr::{AnyValue, Erased, unbox};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An immutable, composable description of an effectful computation.
///
/// `A` is the success type; `E` the typed, recoverable error type (defaulted
/// to [`Infallible`] for effects that can only die or be interrupted).
#[must_use = "effects describe computations and do nothing until run"]
pub struct Effect<A, E = Infallible> {
    repr: Erased,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Failure,
{
    pub(crate) fn from_erased(repr: Erased) -> Self {
        Self {
            repr,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_erased(self) -> Erased {
        self.repr
    }

    // === constructors ===

    /// Produces `value` immediately.
    pub fn succeed(value: A) -> Self {
        Self::from_erased(Erased::Succeed(Box::new(value)))
    }

    /// Runs an infallible side effect when evaluated.
    pub fn sync(f: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::from_erased(Erased::Total(Box::new(move || Box::new(f()) as AnyValue)))
    }

    /// Runs a fallible side effect when evaluated; the `Err` feeds the typed
    /// error channel. Panics become defects either way.
    pub fn attempt(f: impl FnOnce() -> Result<A, E> + Send + 'static) -> Self {
        Self::from_erased(Erased::Partial(Box::new(move || {
            f().map(|a| Box::new(a) as AnyValue)
                .map_err(|e| Cause::fail(e).into_erased())
        })))
    }

    /// Defers construction of an effect until it is evaluated.
    pub fn suspend(f: impl FnOnce() -> Effect<A, E> + Send + 'static) -> Self {
        Self::from_erased(Erased::SuspendTotal(Box::new(move || f().into_erased())))
    }

    /// Defers construction; the `Err` feeds the typed error channel.
    pub fn suspend_attempt(f: impl FnOnce() -> Result<Effect<A, E>, E> + Send + 'static) -> Self {
        Self::from_erased(Erased::SuspendPartial(Box::new(move || {
            f().map(Effect::into_erased)
                .map_err(|e| Cause::fail(e).into_erased())
        })))
    }

    /// Fails with the given error.
    pub fn fail(error: E) -> Self {
        Self::fail_cause(Cause::fail(error))
    }

    /// Fails with the given cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_erased(Erased::Fail(Box::new(move || cause.into_erased())))
    }

    /// Dies with a defect, bypassing the typed error channel.
    pub fn die(defect: impl Into<Defect>) -> Self {
        let defect = defect.into();
        Self::from_erased(Erased::Fail(Box::new(move || Cause::Die(defect))))
    }

    /// Unwraps a completed [`Exit`] back into an effect.
    pub fn done(exit: Exit<A, E>) -> Self {
        match exit {
            Exit::Success(a) => Self::succeed(a),
            Exit::Failure(cause) => Self::fail_cause(cause),
        }
    }

    /// Lifts a result.
    pub fn from_result(result: Result<A, E>) -> Self {
        Self::done(Exit::from_result(result))
    }

    /// An effect that never completes (but remains interruptible).
    pub fn never() -> Self {
        Self::from_erased(Erased::Async(Box::new(|_| None)))
    }

    /// Suspends until the given registration resumes the fiber.
    ///
    /// `register` receives a [`Callback`] that may be completed exactly once
    /// from any thread; calling it again (or after the fiber was interrupted
    /// while suspended) is a no-op returning `false`. Returning
    /// `Some(effect)` from `register` is a synchronous shortcut: if no
    /// concurrent completion raced it, the fiber continues with that effect
    /// without suspending.
    pub fn async_(
        register: impl FnOnce(Callback<A, E>) -> Option<Effect<A, E>> + Send + 'static,
    ) -> Self {
        Self::from_erased(Erased::Async(Box::new(move |handle| {
            register(Callback {
                handle,
                _marker: PhantomData,
            })
            .map(Effect::into_erased)
        })))
    }

    /// Reads the ambient environment, then continues with the effect `f`
    /// builds from it. Dies if the ambient environment is not an `R`.
    pub fn access<R: Send + Sync + 'static>(
        f: impl FnOnce(Arc<R>) -> Effect<A, E> + Send + 'static,
    ) -> Self {
        Self::from_erased(Erased::Access(Box::new(move |env| {
            match env.downcast::<R>() {
                Ok(r) => f(r).into_erased(),
                Err(_) => Erased::from_cause(Cause::die(Defect::from(
                    "ambient environment has an unexpected type",
                ))),
            }
        })))
    }

    /// Continues with the effect `f` builds from the current fiber's
    /// descriptor.
    pub fn descriptor_with(
        f: impl FnOnce(FiberDescriptor) -> Effect<A, E> + Send + 'static,
    ) -> Self {
        Self::from_erased(Erased::Descriptor(Box::new(move |descriptor| {
            f(descriptor).into_erased()
        })))
    }

    /// Continues with the effect `f` builds from the current
    /// interruptibility.
    pub fn check_interruptible(f: impl FnOnce(bool) -> Effect<A, E> + Send + 'static) -> Self {
        Self::from_erased(Erased::CheckInterrupt(Box::new(move |interruptible| {
            f(interruptible).into_erased()
        })))
    }

    // === combinators ===

    /// Applies `f` to the success value.
    pub fn map<B: Send + 'static>(self, f: impl FnOnce(A) -> B + Send + 'static) -> Effect<B, E> {
        self.flat_map(move |a| Effect::succeed(f(a)))
    }

    /// Sequences `f` after this effect. Failure short-circuits.
    pub fn flat_map<B: Send + 'static>(
        self,
        f: impl FnOnce(A) -> Effect<B, E> + Send + 'static,
    ) -> Effect<B, E> {
        Effect::from_erased(Erased::FlatMap(
            Box::new(self.repr),
            Box::new(move |value| f(unbox::<A>(value)).into_erased()),
        ))
    }

    /// Sequences `that` after this effect, keeping `that`'s value.
    pub fn zip_right<B: Send + 'static>(self, that: Effect<B, E>) -> Effect<B, E> {
        self.flat_map(move |_| that)
    }

    /// Sequences `that` after this effect, keeping this effect's value.
    pub fn zip_left<B: Send + 'static>(self, that: Effect<B, E>) -> Effect<A, E> {
        self.flat_map(move |a| that.map(move |_| a))
    }

    /// Handles any failure cause, and maps the success value; the one
    /// primitive all recovery is built from.
    ///
    /// Interrupts can only be observed by a fold inside an uninterruptible
    /// region; elsewhere the frame is skipped during unwinding.
    pub fn fold_cause<B, E2>(
        self,
        on_failure: impl FnOnce(Cause<E>) -> Effect<B, E2> + Send + 'static,
        on_success: impl FnOnce(A) -> Effect<B, E2> + Send + 'static,
    ) -> Effect<B, E2>
    where
        B: Send + 'static,
        E2: Failure,
    {
        Effect::from_erased(Erased::Fold(
            Box::new(self.repr),
            Box::new(move |cause| on_failure(cause.into_typed::<E>()).into_erased()),
            Box::new(move |value| on_success(unbox::<A>(value)).into_erased()),
        ))
    }

    /// Handles typed failures and maps success; defects and interrupts keep
    /// propagating.
    pub fn fold<B: Send + 'static>(
        self,
        on_failure: impl FnOnce(Arc<E>) -> B + Send + 'static,
        on_success: impl FnOnce(A) -> B + Send + 'static,
    ) -> Effect<B, E> {
        self.fold_cause(
            move |cause| match cause.failure_or_cause() {
                Ok(error) => Effect::succeed(on_failure(error)),
                Err(other) => Effect::fail_cause(other),
            },
            move |a| Effect::succeed(on_success(a)),
        )
    }

    /// Recovers from typed failures; defects and interrupts keep
    /// propagating.
    pub fn catch_all<E2: Failure>(
        self,
        f: impl FnOnce(Arc<E>) -> Effect<A, E2> + Send + 'static,
    ) -> Effect<A, E2> {
        self.fold_cause(
            move |cause| match cause.failure_or_cause() {
                Ok(error) => f(error),
                Err(other) => Effect::fail_cause(other.map_failures(&mut |e| {
                    unreachable!("cause without failures held a failure {e:?}")
                })),
            },
            |a| Effect::succeed(a),
        )
    }

    /// Maps every typed failure in the cause.
    pub fn map_err<E2: Failure>(self, f: impl Fn(&E) -> E2 + Send + 'static) -> Effect<A, E2> {
        self.fold_cause(
            move |cause| Effect::fail_cause(cause.map_failures(&mut |e| Arc::new(f(e.as_ref())))),
            |a| Effect::succeed(a),
        )
    }

    /// Exposes the full cause on the error channel, making defects and
    /// (inside uninterruptible regions) interrupts recoverable.
    pub fn sandbox(self) -> Effect<A, Cause<E>> {
        self.fold_cause(
            |cause| Effect::fail(cause),
            |a| Effect::succeed(a),
        )
    }

    /// Marks the region interruptible.
    pub fn interruptible(self) -> Self {
        self.with_interrupt_status(true)
    }

    /// Marks the region uninterruptible: a pending interrupt is latched and
    /// observed when the region is left.
    pub fn uninterruptible(self) -> Self {
        self.with_interrupt_status(false)
    }

    /// Evaluates this effect with the given interruptibility.
    pub fn with_interrupt_status(self, interruptible: bool) -> Self {
        Self::from_erased(Erased::InterruptStatus(Box::new(self.repr), interruptible))
    }

    /// Runs `finalizer` exactly once when this effect exits, on every path:
    /// success, failure, defect or interruption. The finalizer is
    /// uninterruptible; if it fails, its cause is appended sequentially to
    /// the original one.
    pub fn ensuring<B: Send + 'static>(self, finalizer: Effect<B, Infallible>) -> Effect<A, E> {
        let (fin_ok, fin_err) = shared_once(finalizer);
        Effect::check_interruptible(move |status| {
            self.with_interrupt_status(status)
                .fold_cause(
                    move |cause| {
                        let after = cause.clone();
                        fin_err.take().fold_cause(
                            move |fin_cause| Effect::fail_cause(cause.then(fin_cause.widen())),
                            move |_| Effect::fail_cause(after),
                        )
                    },
                    move |a| {
                        fin_ok.take().fold_cause(
                            move |fin_cause| Effect::fail_cause(fin_cause.widen()),
                            move |_| Effect::succeed(a),
                        )
                    },
                )
                .uninterruptible()
        })
    }

    /// Runs `cleanup` exactly once iff this effect's failure cause contains
    /// an interruption.
    pub fn on_interrupt<B: Send + 'static>(self, cleanup: Effect<B, Infallible>) -> Effect<A, E> {
        Effect::check_interruptible(move |status| {
            self.with_interrupt_status(status)
                .fold_cause(
                    move |cause| {
                        if cause.is_interrupted() {
                            let after = cause.clone();
                            cleanup.fold_cause(
                                move |cleanup_cause| {
                                    Effect::fail_cause(cause.then(cleanup_cause.widen()))
                                },
                                move |_| Effect::fail_cause(after),
                            )
                        } else {
                            Effect::fail_cause(cause)
                        }
                    },
                    |a| Effect::succeed(a),
                )
                .uninterruptible()
        })
    }

    /// Resource-safe acquisition: acquires with this effect
    /// (uninterruptibly), hands the resource to `use_` (with the caller's
    /// interruptibility restored), and runs `release` exactly once iff the
    /// acquisition succeeded, whatever `use_` does.
    pub fn bracket<B>(
        self,
        release: impl FnOnce(Arc<A>) -> Effect<(), Infallible> + Send + 'static,
        use_: impl FnOnce(Arc<A>) -> Effect<B, E> + Send + 'static,
    ) -> Effect<B, E>
    where
        A: Sync,
        B: Send + 'static,
    {
        Effect::check_interruptible(move |status| {
            self.flat_map(move |a| {
                let resource = Arc::new(a);
                let (rel_ok, rel_err) = shared_once(release);
                let used = resource.clone();
                let released_ok = resource.clone();
                use_(used)
                    .with_interrupt_status(status)
                    .fold_cause(
                        move |cause| {
                            let after = cause.clone();
                            rel_err.take()(resource).fold_cause(
                                move |rel_cause| Effect::fail_cause(cause.then(rel_cause.widen())),
                                move |_| Effect::fail_cause(after),
                            )
                        },
                        move |b| {
                            rel_ok.take()(released_ok).fold_cause(
                                move |rel_cause| Effect::fail_cause(rel_cause.widen()),
                                move |_| Effect::succeed(b),
                            )
                        },
                    )
            })
            .uninterruptible()
        })
    }

    // === concurrency ===

    /// Spawns this effect on a new fiber supervised by the current one: if
    /// the parent exits first, the child is interrupted and awaited.
    pub fn fork(self) -> Effect<Fiber<A, E>, E> {
        self.fork_with(Supervision::Interrupt)
    }

    /// Spawns this effect on a new fiber with the given supervision mode.
    pub fn fork_with(self, mode: Supervision) -> Effect<Fiber<A, E>, E> {
        Effect::from_erased(
            Erased::Fork(Box::new(self.repr), mode).flat_map(|value| {
                let raw = unbox::<crate::fiber::RawFiber>(value);
                Erased::Succeed(Box::new(Fiber::<A, E>::from_raw(raw)))
            }),
        )
    }

    /// Spawns this effect as a root fiber, unsupervised from birth: the
    /// calling fiber's exit does not affect it.
    pub fn fork_daemon(self) -> Effect<Fiber<A, E>, E> {
        self.fork_with(Supervision::Disown)
    }

    /// Runs this effect on a forked fiber and adopts its result, so that
    /// interrupting the caller signals the fork but does not wait for its
    /// finalization.
    pub fn disconnect(self) -> Effect<A, E> {
        self.fork_with(Supervision::InterruptFork)
            .flat_map(Fiber::join)
    }

    /// The structured-race primitive: forks both sides and continues with
    /// the done-handler of whichever completes *first*, handing it the
    /// loser's handle. The loser is not interrupted by the race machinery;
    /// the handlers decide its fate. Ties go to the left side.
    pub fn race_with<B, C>(
        self,
        that: Effect<B, E>,
        on_self: impl FnOnce(Exit<A, E>, Fiber<B, E>) -> Effect<C, E> + Send + 'static,
        on_that: impl FnOnce(Exit<B, E>, Fiber<A, E>) -> Effect<C, E> + Send + 'static,
        self_mode: Supervision,
        that_mode: Supervision,
    ) -> Effect<C, E>
    where
        B: Send + 'static,
        C: Send + 'static,
    {
        Effect::from_erased(Erased::RaceWith(Box::new(repr::RaceWith {
            left: self.repr,
            right: that.repr,
            left_mode: self_mode,
            right_mode: that_mode,
            on_left: Box::new(move |exit, loser| {
                on_self(typed_exit::<A, E>(exit), Fiber::from_raw(loser)).into_erased()
            }),
            on_right: Box::new(move |exit, loser| {
                on_that(typed_exit::<B, E>(exit), Fiber::from_raw(loser)).into_erased()
            }),
        })))
    }

    /// Races two effects: the first *success* wins and the loser is
    /// interrupted. If the first completion is a failure, the other side's
    /// result decides, and a failure of both combines the causes in
    /// parallel.
    pub fn race(self, that: Effect<A, E>) -> Effect<A, E> {
        fn arbiter<A, E>(exit: Exit<A, E>, other: Fiber<A, E>) -> Effect<A, E>
        where
            A: Send + 'static,
            E: Failure,
        {
            match exit {
                Exit::Success(a) => other.interrupt().widen_err::<E>().map(move |_| a),
                Exit::Failure(cause) => other.join().fold_cause(
                    move |other_cause| Effect::fail_cause(cause.and(other_cause)),
                    |a| Effect::succeed(a),
                ),
            }
        }
        self.race_with(
            that,
            arbiter,
            arbiter,
            Supervision::Interrupt,
            Supervision::Interrupt,
        )
    }

    /// Races two effects: the first *completion* wins, success or not, and
    /// the loser is interrupted.
    pub fn race_first(self, that: Effect<A, E>) -> Effect<A, E> {
        fn arbiter<A, E>(exit: Exit<A, E>, other: Fiber<A, E>) -> Effect<A, E>
        where
            A: Send + 'static,
            E: Failure,
        {
            other
                .interrupt()
                .widen_err::<E>()
                .flat_map(move |_| Effect::done(exit))
        }
        self.race_with(
            that,
            arbiter,
            arbiter,
            Supervision::Interrupt,
            Supervision::Interrupt,
        )
    }

    /// Produces `None` (and interrupts this effect) if it has not completed
    /// within `duration` on the platform clock.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.race_with(
            crate::time::sleep(duration),
            |exit, sleeper| {
                sleeper
                    .interrupt()
                    .widen_err::<E>()
                    .flat_map(move |_| Effect::done(exit).map(Some))
            },
            |_expired, worker| worker.interrupt().widen_err::<E>().map(|_| None),
            Supervision::Interrupt,
            Supervision::Interrupt,
        )
    }

    /// Supplies the ambient environment to this effect.
    pub fn provide<R: Send + Sync + 'static>(self, environment: R) -> Effect<A, E> {
        Effect::from_erased(Erased::Provide(Arc::new(environment), Box::new(self.repr)))
    }

    /// Evaluates this effect on the given executor, returning to the
    /// previous one afterwards. Route blocking work to the platform's
    /// blocking executor this way.
    pub fn on_executor(self, executor: Arc<dyn Executor>) -> Effect<A, E> {
        Effect::from_erased(Erased::Shift(executor, Box::new(self.repr)))
    }
}

impl<E: Failure> Effect<(), E> {
    /// Succeeds with `()`.
    pub fn unit() -> Self {
        Self::succeed(())
    }

    /// Cooperatively reschedules the fiber to the back of its executor's
    /// queue.
    pub fn yield_now() -> Self {
        Self::from_erased(Erased::Yield)
    }
}

impl<E: Failure> Effect<bool, E> {
    /// Promotes `child` to a root fiber. Produces `true` iff the current
    /// fiber was its supervisor.
    pub fn disown<B, E2>(child: &Fiber<B, E2>) -> Self
    where
        B: Send + 'static,
        E2: Failure,
    {
        Effect::from_erased(Erased::Disown(child.raw().clone()))
    }
}

impl<E: Failure> Effect<FiberDescriptor, E> {
    /// Produces the current fiber's descriptor.
    pub fn descriptor() -> Self {
        Self::from_erased(Erased::Descriptor(Box::new(|descriptor| {
            Erased::Succeed(Box::new(descriptor))
        })))
    }
}

impl<R: Send + Sync + 'static, E: Failure> Effect<Arc<R>, E> {
    /// Produces the ambient environment. Dies if it is not an `R`.
    pub fn environment() -> Self {
        Effect::access(|r| Effect::succeed(r))
    }
}

impl<A: Send + 'static> Effect<A, Infallible> {
    /// Re-types an infallible effect at any error type; sound because no
    /// `Infallible` failure can ever be produced.
    pub fn widen_err<E: Failure>(self) -> Effect<A, E> {
        Effect {
            repr: self.repr,
            _marker: PhantomData,
        }
    }
}

// === impl Callback ===

/// The completion capability handed to [`Effect::async_`] registrations.
///
/// May be cloned and sent anywhere; the first completion wins, every later
/// one reports `false`.
pub struct Callback<A, E = Infallible> {
    handle: ResumeHandle,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> Callback<A, E>
where
    A: Send + 'static,
    E: Failure,
{
    /// Resumes the suspended fiber with `effect`.
    pub fn resume(&self, effect: Effect<A, E>) -> bool {
        self.handle.resume(effect.into_erased())
    }

    pub fn complete(&self, result: Result<A, E>) -> bool {
        self.resume(Effect::from_result(result))
    }

    pub fn succeed(&self, value: A) -> bool {
        self.resume(Effect::succeed(value))
    }

    pub fn fail(&self, error: E) -> bool {
        self.resume(Effect::fail(error))
    }

    pub fn halt(&self, cause: Cause<E>) -> bool {
        self.resume(Effect::fail_cause(cause))
    }
}

impl<A, E> Clone for Callback<A, E> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> core::fmt::Debug for Callback<A, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Callback(..)")
    }
}

/// Splits a one-shot value between two mutually exclusive continuations.
///
/// Exactly one of the two halves may ever be taken; the fold frame that
/// shares them guarantees only one of its sides runs.
pub(crate) fn shared_once<T: Send>(value: T) -> (SharedOnce<T>, SharedOnce<T>) {
    let cell = Arc::new(Mutex::new(Some(value)));
    (SharedOnce(cell.clone()), SharedOnce(cell))
}

pub(crate) struct SharedOnce<T>(Arc<Mutex<Option<T>>>);

impl<T> SharedOnce<T> {
    pub(crate) fn take(self) -> T {
        self.0
            .locked()
            .take()
            .expect("both sides of a fold frame ran, this is a bug")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn run<A: Send + 'static>(effect: Effect<A, String>) -> Exit<A, String> {
        Runtime::new().block_on(effect)
    }

    #[test]
    fn flat_map_left_identity() {
        let k = |x: i32| Effect::<i32, String>::succeed(x * 3);
        let left = run(Effect::succeed(14).flat_map(k));
        let right = run(k(14));
        assert_eq!(left.success(), right.success());
    }

    #[test]
    fn flat_map_right_identity() {
        let left = run(Effect::<i32, String>::succeed(5).flat_map(Effect::succeed));
        let right = run(Effect::<i32, String>::succeed(5));
        assert_eq!(left.success(), right.success());
    }

    #[test]
    fn flat_map_associativity() {
        let make = || Effect::<i32, String>::succeed(2);
        let k = |x: i32| Effect::<i32, String>::succeed(x + 10);
        let h = |x: i32| Effect::<i32, String>::succeed(x * 10);

        let left = run(make().flat_map(k).flat_map(h));
        let right = run(make().flat_map(move |x| k(x).flat_map(h)));
        let left_success = left.success();
        assert_eq!(left_success, Some(120));
        assert_eq!(left_success, right.success());
    }

    #[test]
    fn fold_fuses_on_success_and_failure() {
        let exit = run(Effect::<i32, String>::succeed(1).fold_cause(
            |_cause| Effect::succeed(-1),
            |x| Effect::succeed(x + 1),
        ));
        assert_eq!(exit.success(), Some(2));

        let exit = run(Effect::<i32, String>::fail("boom".to_owned()).fold_cause(
            |cause| Effect::succeed(cause.failures().len() as i32),
            |x| Effect::succeed(x),
        ));
        assert_eq!(exit.success(), Some(1));
    }

    #[test]
    fn uninterruptible_then_interruptible_is_identity() {
        let exit = run(
            Effect::<i32, String>::succeed(3)
                .interruptible()
                .uninterruptible(),
        );
        assert_eq!(exit.success(), Some(3));

        // interruptibility is restored on exit from the region
        let exit = run(
            Effect::<bool, String>::check_interruptible(|outer| {
                Effect::unit()
                    .uninterruptible()
                    .flat_map(move |()| {
                        Effect::check_interruptible(move |after| {
                            Effect::succeed(outer && after)
                        })
                    })
            }),
        );
        assert_eq!(exit.success(), Some(true));
    }

    #[test]
    fn map_err_rewrites_every_failure() {
        let exit = run(
            Effect::<i32, i32>::fail(7).map_err(|n| format!("error {n}")),
        );
        assert_eq!(*exit.failure().unwrap(), "error 7");
    }

    #[test]
    fn catch_all_recovers_typed_failures_only() {
        let exit = run(
            Effect::<i32, String>::fail("caught".to_owned()).catch_all(|e| {
                Effect::succeed(e.len() as i32)
            }),
        );
        assert_eq!(exit.success(), Some(6));

        // defects pass a catch_all untouched
        let exit = run(
            Effect::<i32, String>::die("bug").catch_all(|_| Effect::succeed(0)),
        );
        assert!(exit.cause().unwrap().is_die());
    }

    #[test]
    fn sandbox_exposes_the_cause() {
        let exit = Runtime::new().block_on(
            Effect::<i32, String>::die("bug")
                .sandbox()
                .fold_cause(
                    |outer| match outer.failure_or_cause() {
                        Ok(inner) => Effect::succeed(inner.defects().len()),
                        Err(_) => Effect::succeed(0),
                    },
                    |_| Effect::succeed(99),
                ),
        );
        let exit: Exit<usize, String> = exit;
        assert_eq!(exit.success(), Some(1));
    }

    #[test]
    fn suspend_defers_construction() {
        use core::sync::atomic::{AtomicBool, Ordering};
        let built = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&built);
        let effect = Effect::<i32, String>::suspend(move || {
            observed.store(true, Ordering::SeqCst);
            Effect::succeed(1)
        });
        assert!(!built.load(Ordering::SeqCst));
        assert_eq!(run(effect).success(), Some(1));
        assert!(built.load(Ordering::SeqCst));
    }

    #[test]
    fn async_synchronous_shortcut_completes_inline() {
        let exit = run(Effect::<i32, String>::async_(|_callback| {
            Some(Effect::succeed(123))
        }));
        assert_eq!(exit.success(), Some(123));
    }

    #[test]
    fn async_callback_resumes_from_another_thread() {
        let exit = run(Effect::<i32, String>::async_(|callback| {
            std::thread::spawn(move || {
                callback.succeed(321);
            });
            None
        }));
        assert_eq!(exit.success(), Some(321));
    }
}
