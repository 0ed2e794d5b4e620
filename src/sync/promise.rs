// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::cause::{Cause, Failure};
use crate::effect::Effect;
use crate::exit::Exit;
use crate::util::LockExt;
use core::convert::Infallible;
use core::fmt;
use std::sync::{Arc, Mutex};

/// A one-shot cell synchronizing producers and consumers across fibers.
///
/// Completion is monotonic: the first completer wins and every later
/// completion attempt reports `false`. Waiters registered before completion
/// are notified in registration order; waiters arriving after completion
/// resume immediately. Every waiter receives the completed [`Exit`], which
/// is why `A: Clone`.
pub struct Promise<A, E = Infallible> {
    inner: Arc<Mutex<PromiseState<A, E>>>,
}

enum PromiseState<A, E> {
    Pending(Vec<Waiter<A, E>>),
    Done(Exit<A, E>),
}

type Waiter<A, E> = Box<dyn FnOnce(Exit<A, E>) + Send>;

// === impl Promise ===

impl<A, E> Promise<A, E>
where
    A: Clone + Send + 'static,
    E: Failure,
{
    /// Creates a promise outside any effect.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PromiseState::Pending(Vec::new()))),
        }
    }

    /// Creates a promise as an effect.
    pub fn make<E2: Failure>() -> Effect<Promise<A, E>, E2> {
        Effect::sync(Self::new)
    }

    /// Completes the promise right now, from any thread. The first
    /// completion wins.
    pub(crate) fn complete_now(&self, exit: Exit<A, E>) -> bool {
        let waiters = {
            let mut state = self.inner.locked();
            match &mut *state {
                PromiseState::Done(_) => return false,
                PromiseState::Pending(waiters) => {
                    let waiters = core::mem::take(waiters);
                    *state = PromiseState::Done(exit.clone());
                    waiters
                }
            }
        };
        // notify outside the lock, in registration order
        for waiter in waiters {
            waiter(exit.clone());
        }
        true
    }

    /// Completes with the given exit. Produces `false` if the promise was
    /// already completed.
    pub fn done<E2: Failure>(&self, exit: Exit<A, E>) -> Effect<bool, E2> {
        let this = self.clone();
        Effect::sync(move || this.complete_now(exit))
    }

    pub fn succeed<E2: Failure>(&self, value: A) -> Effect<bool, E2> {
        self.done(Exit::Success(value))
    }

    pub fn fail<E2: Failure>(&self, error: E) -> Effect<bool, E2> {
        self.done(Exit::Failure(Cause::fail(error)))
    }

    pub fn halt<E2: Failure>(&self, cause: Cause<E>) -> Effect<bool, E2> {
        self.done(Exit::Failure(cause))
    }

    /// Completes the promise with an interruption attributed to the calling
    /// fiber.
    pub fn interrupt<E2: Failure>(&self) -> Effect<bool, E2> {
        let this = self.clone();
        Effect::descriptor_with(move |descriptor| {
            this.done(Exit::Failure(Cause::interrupt(descriptor.id())))
        })
    }

    /// Suspends until the promise completes, then adopts its exit: the
    /// success value, or the failure cause re-raised on the caller.
    pub fn await_(&self) -> Effect<A, E> {
        let this = self.clone();
        Effect::async_(move |callback| {
            let mut state = this.inner.locked();
            match &mut *state {
                PromiseState::Done(exit) => {
                    let exit = exit.clone();
                    drop(state);
                    Some(Effect::done(exit))
                }
                PromiseState::Pending(waiters) => {
                    waiters.push(Box::new(move |exit| {
                        callback.resume(Effect::done(exit));
                    }));
                    None
                }
            }
        })
    }

    /// The completed exit, if any. Never suspends.
    pub fn poll<E2: Failure>(&self) -> Effect<Option<Exit<A, E>>, E2> {
        let this = self.clone();
        Effect::sync(move || match &*this.inner.locked() {
            PromiseState::Done(exit) => Some(exit.clone()),
            PromiseState::Pending(_) => None,
        })
    }

    pub fn is_done<E2: Failure>(&self) -> Effect<bool, E2> {
        let this = self.clone();
        Effect::sync(move || matches!(&*this.inner.locked(), PromiseState::Done(_)))
    }
}

impl<A, E> Default for Promise<A, E>
where
    A: Clone + Send + 'static,
    E: Failure,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A, E> Clone for Promise<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, E> fmt::Debug for Promise<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.locked() {
            PromiseState::Pending(waiters) => format!("Pending({} waiters)", waiters.len()),
            PromiseState::Done(_) => "Done".to_owned(),
        };
        f.debug_tuple("Promise").field(&state).finish()
    }
}
