// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::cause::Failure;
use crate::stm::{Stm, StmResult};
use crate::util::LockExt;
use core::any::Any;
use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A transactional variable: a versioned cell readable and writable only
/// inside [`atomically`] blocks.
///
/// The version increments by exactly one on each commit that wrote the
/// variable; readers always observe a consistent `(version, value)` pair.
///
/// [`atomically`]: crate::stm::atomically
pub struct TVar<A> {
    inner: Arc<TVarInner<A>>,
}

pub(crate) struct TVarInner<A> {
    id: u64,
    cell: Mutex<Versioned<A>>,
}

struct Versioned<A> {
    version: u64,
    value: A,
}

/// TVar ids key journal entries. A process-wide counter keeps ids unique
/// even when vars cross between independent runtimes.
static NEXT_TVAR_ID: AtomicU64 = AtomicU64::new(0);

/// The type-erased view of a [`TVar`] a journal entry holds.
pub(crate) trait AnyTVar: Send + Sync {
    fn id(&self) -> u64;
    fn current_version(&self) -> u64;
    /// Writes a staged value. Only called while holding the platform's
    /// commit lock, after validation.
    fn commit(&self, value: &(dyn Any + Send + Sync), next_version: u64);
}

// === impl TVar ===

impl<A> TVar<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Creates a variable outside any transaction.
    pub fn new(initial: A) -> Self {
        Self {
            inner: Arc::new(TVarInner {
                id: NEXT_TVAR_ID.fetch_add(1, Ordering::Relaxed),
                cell: Mutex::new(Versioned {
                    version: 0,
                    value: initial,
                }),
            }),
        }
    }

    /// Allocates a fresh variable inside a transaction, recording the
    /// initialization in the journal. A retried transaction allocates a
    /// fresh variable on every attempt; abandoned ones are simply dropped.
    pub fn make<E: Failure>(initial: A) -> Stm<TVar<A>, E> {
        Stm::from_fn(move |journal| {
            let tvar = TVar::new(initial.clone());
            journal.write::<A>(&tvar, initial.clone());
            StmResult::Done(tvar)
        })
    }

    /// Reads the variable through the transaction's journal.
    pub fn get<E: Failure>(&self) -> Stm<A, E> {
        let tvar = self.clone();
        Stm::from_fn(move |journal| StmResult::Done(journal.read(&tvar)))
    }

    /// Stages a write in the transaction's journal.
    pub fn set<E: Failure>(&self, value: A) -> Stm<(), E> {
        let tvar = self.clone();
        Stm::from_fn(move |journal| {
            journal.write(&tvar, value.clone());
            StmResult::Done(())
        })
    }

    /// Stages a replacement of the value with `f` of it.
    pub fn update<E: Failure>(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Stm<(), E> {
        let tvar = self.clone();
        Stm::from_fn(move |journal| {
            let current = journal.read(&tvar);
            journal.write(&tvar, f(current));
            StmResult::Done(())
        })
    }

    /// Stages an update that also computes a result.
    pub fn modify<B, E>(&self, f: impl Fn(A) -> (B, A) + Send + Sync + 'static) -> Stm<B, E>
    where
        B: Send + 'static,
        E: Failure,
    {
        let tvar = self.clone();
        Stm::from_fn(move |journal| {
            let (result, next) = f(journal.read(&tvar));
            journal.write(&tvar, next);
            StmResult::Done(result)
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn erased(&self) -> Arc<dyn AnyTVar> {
        self.inner.clone()
    }

    /// The committed `(version, value)` pair, read consistently.
    pub(crate) fn read_committed(&self) -> (u64, A) {
        let cell = self.inner.cell.locked();
        (cell.version, cell.value.clone())
    }

    #[cfg(test)]
    pub(crate) fn version(&self) -> u64 {
        self.inner.cell.locked().version
    }
}

impl<A> Clone for TVar<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for TVar<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.inner.cell.locked();
        f.debug_struct("TVar")
            .field("id", &self.inner.id)
            .field("version", &cell.version)
            .field("value", &cell.value)
            .finish()
    }
}

impl<A> AnyTVar for TVarInner<A>
where
    A: Clone + Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.id
    }

    fn current_version(&self) -> u64 {
        self.cell.locked().version
    }

    fn commit(&self, value: &(dyn Any + Send + Sync), next_version: u64) {
        let value = value
            .downcast_ref::<A>()
            .expect("journal staged a value of an unexpected type, this is a bug")
            .clone();
        let mut cell = self.cell.locked();
        cell.version = next_version;
        cell.value = value;
    }
}
