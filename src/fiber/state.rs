// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use core::fmt;
use static_assertions::const_assert;

/// Fiber lifecycle state. The fiber stores its state in an atomic `usize`
/// with various bitfields for the necessary information. The state has the
/// following layout:
///
/// ```text
/// | 63  5 | 4                   | 3           | 2           | 1     0 |
/// | epoch | async interruptible | terminating | interrupted | phase   |
/// ```
///
/// The rest of the bits hold the suspension epoch: a counter bumped on every
/// resume so that stale async callbacks (and stale synchronous-shortcut
/// returns) lose the race to resume the fiber.
pub(crate) struct State {
    val: AtomicUsize,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of a fiber's current state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Snapshot<usize> {
        /// Whether the fiber is running, suspended at an async boundary, or done.
        pub(crate) const PHASE: Phase;
        /// If set, someone asked this fiber to stop.
        ///
        /// The flag is permanent: interruption is latched and re-checked every
        /// time the fiber becomes interruptible again.
        pub(crate) const INTERRUPTED: bool;
        /// If set, the fiber is unwinding towards its interruption exit and
        /// the evaluation loop must not convert the interrupt flag into a
        /// failure a second time.
        pub(crate) const TERMINATING: bool;
        /// Valid while `PHASE` is `Suspended`: whether the suspension happened
        /// in an interruptible region, i.e. whether an interrupter may resume
        /// the fiber itself.
        pub(crate) const ASYNC_INTERRUPTIBLE: bool;
        /// The suspension epoch.
        const EPOCH = ..;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum Phase {
    Running = 0b00,
    Suspended = 0b01,
    Done = 0b10,
}

/// What the caller of [`State::interrupt`] must do next.
#[must_use]
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum InterruptAction {
    /// The fiber was suspended in an interruptible region and this caller won
    /// the transition back to `Running`: it now owns the parked evaluation
    /// state and must reschedule the fiber with an interrupt failure.
    Resume,
    /// The interrupt flag is set; the fiber will observe it at its next
    /// reduction boundary (or when it leaves its uninterruptible region).
    Noted,
    /// The fiber already completed, there is nothing to interrupt.
    AlreadyDone,
}

const EPOCH_ONE: usize = Snapshot::EPOCH.first_bit();
const EPOCH_MAX: usize =
    Snapshot::EPOCH.raw_mask() >> Snapshot::EPOCH.least_significant_index();

// A 64-bit word leaves 59 bits of epoch; even a 32-bit platform gets 27,
// plenty to make stale-resume collisions unobservable in practice.
const_assert!(EPOCH_MAX >= (1 << 27) - 1);

// === impl State ===

impl State {
    /// Returns a fiber's initial state: running, interruptible, epoch zero.
    pub(crate) const fn new() -> State {
        State {
            val: AtomicUsize::new(0),
        }
    }

    pub(crate) fn load(&self, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.load(ordering))
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.load(Ordering::Acquire).get(Snapshot::INTERRUPTED)
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.load(Ordering::Acquire).get(Snapshot::TERMINATING)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.load(Ordering::Acquire).phase() == Phase::Done
    }

    /// Marks the fiber interrupted.
    ///
    /// This is idempotent; repeated calls only ever set the same flag. The
    /// returned action tells the caller whether it also won the right to
    /// resume a suspended fiber.
    pub(crate) fn interrupt(&self) -> InterruptAction {
        self.transition(|s| {
            match s.phase() {
                Phase::Done => InterruptAction::AlreadyDone,
                Phase::Suspended if s.get(Snapshot::ASYNC_INTERRUPTIBLE) => {
                    *s = s
                        .with(Snapshot::INTERRUPTED, true)
                        .with(Snapshot::PHASE, Phase::Running)
                        .bump_epoch();
                    InterruptAction::Resume
                }
                Phase::Suspended | Phase::Running => {
                    s.set(Snapshot::INTERRUPTED, true);
                    InterruptAction::Noted
                }
            }
        })
    }

    /// Attempts the `Running -> Suspended` transition around an async
    /// registration.
    ///
    /// Fails iff the fiber is interruptible and already interrupted; in that
    /// case the caller must not suspend but continue with an interrupt
    /// failure instead. On success the returned epoch identifies this
    /// suspension window for [`State::try_resume`].
    pub(crate) fn try_suspend(&self, interruptible: bool) -> Result<usize, ()> {
        self.transition(|s| {
            debug_assert_eq!(s.phase(), Phase::Running, "only the owner suspends a fiber");
            if interruptible && s.get(Snapshot::INTERRUPTED) {
                return Err(());
            }
            let epoch = s.get(Snapshot::EPOCH);
            *s = s
                .with(Snapshot::PHASE, Phase::Suspended)
                .with(Snapshot::ASYNC_INTERRUPTIBLE, interruptible);
            Ok(epoch)
        })
    }

    /// Attempts the `Suspended -> Running` transition for the suspension
    /// window identified by `epoch`.
    ///
    /// Exactly one caller per window succeeds and thereby takes ownership of
    /// the parked evaluation state; stale resumes (a late async callback, or
    /// a synchronous shortcut that lost to a concurrent callback) fail.
    pub(crate) fn try_resume(&self, epoch: usize) -> bool {
        self.transition(|s| {
            if s.phase() == Phase::Suspended && s.get(Snapshot::EPOCH) == epoch {
                *s = s.with(Snapshot::PHASE, Phase::Running).bump_epoch();
                true
            } else {
                false
            }
        })
    }

    /// Attempts the final transition into `Done`.
    pub(crate) fn try_complete(&self) -> bool {
        self.transition(|s| {
            if s.phase() == Phase::Done {
                false
            } else {
                s.set(Snapshot::PHASE, Phase::Done);
                true
            }
        })
    }

    pub(crate) fn set_terminating(&self) {
        let mask = Snapshot::TERMINATING.raw_mask();
        self.val.fetch_or(mask, Ordering::AcqRel);
    }

    pub(crate) fn clear_terminating(&self) {
        let mask = !Snapshot::TERMINATING.raw_mask();
        self.val.fetch_and(mask, Ordering::AcqRel);
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load(Ordering::Acquire);
        loop {
            let mut next = current;
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

// === impl Snapshot ===

impl Snapshot {
    pub(crate) fn phase(self) -> Phase {
        self.get(Snapshot::PHASE)
    }

    fn bump_epoch(self) -> Self {
        Self(self.0.wrapping_add(EPOCH_ONE))
    }
}

impl mycelium_bitfield::FromBits<usize> for Phase {
    type Error = core::convert::Infallible;

    const BITS: u32 = 2;

    #[inline]
    fn try_from_bits(bits: usize) -> Result<Self, Self::Error> {
        match bits {
            b if b == Self::Running as usize => Ok(Self::Running),
            b if b == Self::Suspended as usize => Ok(Self::Suspended),
            b if b == Self::Done as usize => Ok(Self::Done),
            _ => {
                // this should never happen unless the bitpacking code is broken
                unreachable!("invalid fiber phase {bits:#b}")
            }
        }
    }

    #[inline]
    fn into_bits(self) -> usize {
        self as u8 as usize
    }
}
