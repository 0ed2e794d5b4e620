// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::stm::tvar::{AnyTVar, TVar};
use core::any::Any;
use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The per-transaction staged log of variable reads and writes.
///
/// Every touched variable gets one entry recording the version the
/// transaction observed and the value it intends to leave behind. An entry
/// is valid while its expected version still matches the variable; the
/// commit loop validates all entries under the platform's commit lock
/// before writing any of them, which is what makes transactions opaque —
/// a journal built against a world that has since moved on can never
/// commit.
pub struct Journal {
    entries: BTreeMap<u64, Entry>,
}

#[derive(Clone)]
struct Entry {
    tvar: Arc<dyn AnyTVar>,
    expected_version: u64,
    value: Arc<dyn Any + Send + Sync>,
    written: bool,
}

/// A saved journal state for [`Stm::or_else`] rollback.
///
/// [`Stm::or_else`]: crate::stm::Stm::or_else
pub(crate) struct Snapshot {
    entries: BTreeMap<u64, Entry>,
}

// === impl Journal ===

impl Journal {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Reads a variable: the staged value if this transaction already
    /// touched it, otherwise the committed value, recording the observed
    /// version.
    pub(crate) fn read<A>(&mut self, tvar: &TVar<A>) -> A
    where
        A: Clone + Send + Sync + 'static,
    {
        let entry = self.entries.entry(tvar.id()).or_insert_with(|| {
            let (version, value) = tvar.read_committed();
            Entry {
                tvar: tvar.erased(),
                expected_version: version,
                value: Arc::new(value),
                written: false,
            }
        });
        entry
            .value
            .downcast_ref::<A>()
            .expect("journal entry holds a value of an unexpected type, this is a bug")
            .clone()
    }

    /// Stages a write. The observed version is still recorded on first
    /// touch so blind writes validate like reads.
    pub(crate) fn write<A>(&mut self, tvar: &TVar<A>, value: A)
    where
        A: Clone + Send + Sync + 'static,
    {
        let entry = self.entries.entry(tvar.id()).or_insert_with(|| {
            let (version, committed) = tvar.read_committed();
            Entry {
                tvar: tvar.erased(),
                expected_version: version,
                value: Arc::new(committed),
                written: false,
            }
        });
        entry.value = Arc::new(value);
        entry.written = true;
    }

    /// `true` while every touched variable still has the version this
    /// transaction observed.
    pub(crate) fn is_valid(&self) -> bool {
        self.entries
            .values()
            .all(|entry| entry.tvar.current_version() == entry.expected_version)
    }

    /// Writes every staged value, bumping written variables' versions by
    /// exactly one. Read-only entries are left untouched so read-only
    /// transactions do not invalidate each other.
    ///
    /// Only called under the platform's commit lock, after [`is_valid`].
    ///
    /// [`is_valid`]: Journal::is_valid
    pub(crate) fn commit(self) {
        for entry in self.entries.into_values() {
            if entry.written {
                entry
                    .tvar
                    .commit(&*entry.value, entry.expected_version + 1);
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            entries: self.entries.clone(),
        }
    }

    pub(crate) fn restore(&mut self, snapshot: Snapshot) {
        self.entries = snapshot.entries;
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("entries", &self.entries.len())
            .finish()
    }
}
