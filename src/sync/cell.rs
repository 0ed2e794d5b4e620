// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::cause::Failure;
use crate::effect::Effect;
use crate::util::LockExt;
use core::fmt;
use std::sync::{Arc, Mutex};

/// A mutable cell whose operations are effects.
///
/// Every operation on one `Ref` is linearizable (a short critical section
/// per operation); operations across two refs are not. Values are `Clone`
/// because reads hand out an owned copy while the cell keeps its own.
pub struct Ref<A> {
    value: Arc<Mutex<A>>,
}

// === impl Ref ===

impl<A> Ref<A>
where
    A: Clone + Send + 'static,
{
    /// Creates a cell outside any effect.
    pub fn new(initial: A) -> Self {
        Self {
            value: Arc::new(Mutex::new(initial)),
        }
    }

    /// Creates a cell as an effect.
    pub fn make<E: Failure>(initial: A) -> Effect<Ref<A>, E> {
        Effect::sync(move || Ref::new(initial))
    }

    /// Reads the current value.
    pub fn get<E: Failure>(&self) -> Effect<A, E> {
        let value = Arc::clone(&self.value);
        Effect::sync(move || value.locked().clone())
    }

    /// Writes `next`, discarding the current value.
    pub fn set<E: Failure>(&self, next: A) -> Effect<(), E> {
        let value = Arc::clone(&self.value);
        Effect::sync(move || {
            *value.locked() = next;
        })
    }

    /// Writes `next` with no ordering guarantees relative to other refs.
    ///
    /// With the standard library's mutex there is no weaker store to reach
    /// for; this is `set` under a name that keeps call sites honest about
    /// not relying on cross-ref ordering.
    pub fn set_async<E: Failure>(&self, next: A) -> Effect<(), E> {
        self.set(next)
    }

    /// Atomically computes a result and a replacement value from the current
    /// one; the primitive `update` and friends derive from.
    pub fn modify<B, E>(&self, f: impl FnOnce(A) -> (B, A) + Send + 'static) -> Effect<B, E>
    where
        B: Send + 'static,
        E: Failure,
    {
        let value = Arc::clone(&self.value);
        Effect::sync(move || {
            let mut guard = value.locked();
            let (result, next) = f(guard.clone());
            *guard = next;
            result
        })
    }

    /// Atomically replaces the value with `f` of it.
    pub fn update<E: Failure>(&self, f: impl FnOnce(A) -> A + Send + 'static) -> Effect<(), E> {
        self.modify(move |a| ((), f(a)))
    }

    /// Atomically replaces the value, producing the old one.
    pub fn get_and_set<E: Failure>(&self, next: A) -> Effect<A, E> {
        self.modify(move |a| (a, next))
    }

    /// Atomically replaces the value with `f` of it, producing the new one.
    pub fn update_and_get<E: Failure>(&self, f: impl FnOnce(A) -> A + Send + 'static) -> Effect<A, E>
    where
        A: Clone,
    {
        self.modify(move |a| {
            let next = f(a);
            (next.clone(), next)
        })
    }
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&*self.value.locked()).finish()
    }
}
