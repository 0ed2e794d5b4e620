// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Software transactional memory: optimistic transactions over versioned
//! cells with a serializing commit lock.
//!
//! A [`Stm`] value is a *re-runnable* description of a transaction; running
//! it stages reads and writes in a [`Journal`] that is validated and
//! committed atomically by [`atomically`]. A transaction that observes a
//! stale world (or calls [`Stm::retry`]) is re-run from scratch: the commit
//! loop yields through the runtime with randomized exponential backoff
//! rather than blocking an executor thread, so conflicting transactions
//! stay cooperative. Non-conflicting transactions commit in bounded
//! retries; heavily conflicting ones may starve, which the backoff makes
//! unlikely but not impossible.
//!
//! [`Journal`]: journal::Journal

pub(crate) mod journal;
mod tvar;

pub use tvar::TVar;

use crate::cause::Failure;
use crate::effect::Effect;
use crate::platform::Platform;
use crate::util::LockExt;
use core::convert::Infallible;
use core::fmt;
use journal::Journal;
use std::sync::Arc;

/// A composable, re-runnable transaction producing an `A` or failing with
/// an `E`. Failure aborts without committing.
pub struct Stm<A, E = Infallible> {
    run: Arc<dyn Fn(&mut Journal) -> StmResult<A, E> + Send + Sync>,
}

/// One attempt's outcome, before validation.
pub(crate) enum StmResult<A, E> {
    Done(A),
    Fail(E),
    Retry,
}

// === impl Stm ===

impl<A, E> Stm<A, E>
where
    A: Send + 'static,
    E: Failure,
{
    pub(crate) fn from_fn(
        run: impl Fn(&mut Journal) -> StmResult<A, E> + Send + Sync + 'static,
    ) -> Self {
        Self { run: Arc::new(run) }
    }

    /// A transaction producing `value`.
    pub fn succeed(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_fn(move |_| StmResult::Done(value.clone()))
    }

    /// A transaction failing with `error`; nothing commits.
    pub fn fail(error: E) -> Self
    where
        E: Clone,
    {
        Self::from_fn(move |_| StmResult::Fail(error.clone()))
    }

    /// Abandons the journal and re-runs the transaction from scratch.
    pub fn retry() -> Self {
        Self::from_fn(|_| StmResult::Retry)
    }

    pub fn map<B: Send + 'static>(
        self,
        f: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Stm<B, E> {
        let run = self.run;
        Stm::from_fn(move |journal| match run(journal) {
            StmResult::Done(a) => StmResult::Done(f(a)),
            StmResult::Fail(e) => StmResult::Fail(e),
            StmResult::Retry => StmResult::Retry,
        })
    }

    pub fn flat_map<B: Send + 'static>(
        self,
        f: impl Fn(A) -> Stm<B, E> + Send + Sync + 'static,
    ) -> Stm<B, E> {
        let run = self.run;
        Stm::from_fn(move |journal| match run(journal) {
            StmResult::Done(a) => (f(a).run)(journal),
            StmResult::Fail(e) => StmResult::Fail(e),
            StmResult::Retry => StmResult::Retry,
        })
    }

    pub fn zip_right<B: Send + 'static>(self, that: Stm<B, E>) -> Stm<B, E> {
        self.flat_map(move |_| that.clone())
    }

    /// Falls back to `that` if this transaction fails *or* retries. The
    /// journal is rolled back to its state before this transaction ran, so
    /// the fallback sees an untouched world.
    pub fn or_else(self, that: Stm<A, E>) -> Stm<A, E> {
        let run = self.run;
        Stm::from_fn(move |journal| {
            let snapshot = journal.snapshot();
            match run(journal) {
                StmResult::Done(a) => StmResult::Done(a),
                StmResult::Fail(_) | StmResult::Retry => {
                    journal.restore(snapshot);
                    (that.run)(journal)
                }
            }
        })
    }

    /// Surfaces the typed failure as a value, committing either way.
    pub fn either(self) -> Stm<Result<A, E>, E> {
        let run = self.run;
        Stm::from_fn(move |journal| match run(journal) {
            StmResult::Done(a) => StmResult::Done(Ok(a)),
            StmResult::Fail(e) => StmResult::Done(Err(e)),
            StmResult::Retry => StmResult::Retry,
        })
    }

    /// Commits this transaction as an effect; alias for [`atomically`].
    pub fn commit(self) -> Effect<A, E> {
        atomically(self)
    }
}

impl<E: Failure> Stm<(), E> {
    /// Retries until `condition` holds.
    pub fn check(condition: bool) -> Self {
        Self::from_fn(move |_| {
            if condition {
                StmResult::Done(())
            } else {
                StmResult::Retry
            }
        })
    }
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
        }
    }
}

impl<A, E> fmt::Debug for Stm<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Stm(..)")
    }
}

/// Runs a transaction atomically: either every staged write becomes
/// visible, or none does.
///
/// The commit loop: run the transaction against a fresh journal, take the
/// platform's commit lock, validate every entry's observed version, and
/// commit if valid. An invalid journal or an explicit [`Stm::retry`]
/// re-runs the transaction after a cooperative yield with randomized
/// backoff.
pub fn atomically<A, E>(transaction: Stm<A, E>) -> Effect<A, E>
where
    A: Send + 'static,
    E: Failure,
{
    Effect::descriptor_with(move |descriptor| {
        attempt(transaction, Arc::clone(&descriptor.platform), 0)
    })
}

fn attempt<A, E>(transaction: Stm<A, E>, platform: Arc<Platform>, retries: u32) -> Effect<A, E>
where
    A: Send + 'static,
    E: Failure,
{
    Effect::suspend(move || {
        let mut journal = Journal::new();
        let result = (transaction.run)(&mut journal);

        let outcome = {
            let _commit = platform.stm_commit_lock().locked();
            if journal.is_valid() {
                match result {
                    StmResult::Done(a) => {
                        journal.commit();
                        Some(Ok(a))
                    }
                    StmResult::Fail(e) => Some(Err(e)),
                    StmResult::Retry => None,
                }
            } else {
                None
            }
        };

        match outcome {
            Some(Ok(a)) => Effect::succeed(a),
            Some(Err(e)) => Effect::fail(e),
            None => {
                tracing::trace!(retries, "transaction retries");
                backoff(retries);
                Effect::yield_now()
                    .flat_map(move |()| attempt(transaction, platform, retries.saturating_add(1)))
            }
        }
    })
}

/// Spins briefly with randomized, exponentially growing jitter so that
/// conflicting transactions de-synchronize.
fn backoff(retries: u32) {
    let ceiling = 1_u32 << retries.min(10);
    for _ in 0..fastrand::u32(..ceiling) {
        core::hint::spin_loop();
    }
}
