// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::time::Clock;
use crate::util::LockExt;
use core::cmp::Reverse;
use core::fmt;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// The platform's timer: a deadline heap drained by one driver thread.
///
/// The driver pops every entry whose deadline is at or before `clock.now()`
/// and fires it, then sleeps until the next deadline (monotonic clock) or
/// until the clock is advanced (virtual clock). Firing means invoking the
/// entry's wake callback, which resumes the sleeping fiber through its
/// executor; the driver thread itself never runs fiber code.
///
/// Entries for fibers that were interrupted while sleeping are not removed
/// eagerly; they fire into a stale suspension epoch and the resume CAS
/// discards them.
pub struct Timer {
    shared: Arc<TimerShared>,
}

struct TimerShared {
    clock: Clock,
    core: Mutex<Core>,
    /// Signalled when a new earliest deadline is registered, the clock is
    /// advanced, or the timer shuts down.
    changed: Condvar,
}

struct Core {
    entries: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    stopped: bool,
}

struct Entry {
    deadline: Duration,
    /// Keeps the heap order total; ties in `deadline` fire in registration
    /// order.
    seq: u64,
    wake: Box<dyn FnOnce() + Send>,
}

// === impl Timer ===

impl Timer {
    /// Starts the driver thread for `clock`.
    pub(crate) fn start(clock: Clock) -> Self {
        let shared = Arc::new(TimerShared {
            clock: clock.clone(),
            core: Mutex::new(Core {
                entries: BinaryHeap::new(),
                next_seq: 0,
                stopped: false,
            }),
            changed: Condvar::new(),
        });

        {
            let shared = Arc::downgrade(&shared);
            clock.on_advance(Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.changed.notify_all();
                }
            }));
        }

        {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("efx-timer".into())
                .spawn(move || shared.run_driver())
                .expect("failed to spawn the timer driver thread");
        }

        Self { shared }
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.shared.clock
    }

    /// Registers `wake` to fire once `duration` has elapsed on the timer's
    /// clock. A zero (or negative-equivalent) duration fires on the driver's
    /// next turn, never inline.
    pub(crate) fn schedule(&self, duration: Duration, wake: Box<dyn FnOnce() + Send>) {
        let deadline = self.shared.clock.now() + duration;
        let mut core = self.shared.core.locked();
        let seq = core.next_seq;
        core.next_seq += 1;
        let is_next = core
            .entries
            .peek()
            .is_none_or(|Reverse(head)| deadline < head.deadline);
        core.entries.push(Reverse(Entry {
            deadline,
            seq,
            wake,
        }));
        drop(core);

        tracing::trace!(?deadline, seq, "timer entry registered");
        if is_next {
            self.shared.changed.notify_all();
        }
    }

    /// Stops the driver thread. Pending entries never fire.
    pub(crate) fn stop(&self) {
        self.shared.core.locked().stopped = true;
        self.shared.changed.notify_all();
    }
}

impl TimerShared {
    fn run_driver(&self) {
        let _span = tracing::debug_span!("timer driver").entered();

        let mut core = self.core.locked();
        loop {
            if core.stopped {
                tracing::debug!("stop signal received, shutting down");
                return;
            }

            let now = self.clock.now();
            let mut expired = 0_usize;
            while core
                .entries
                .peek()
                .is_some_and(|Reverse(head)| head.deadline <= now)
            {
                let Reverse(entry) = core.entries.pop().expect("peeked entry vanished");
                expired += 1;
                // fire outside the lock so a wake that re-registers a timer
                // (e.g. a retry loop) cannot deadlock.
                drop(core);
                tracing::trace!(deadline = ?entry.deadline, seq = entry.seq, "timer fired");
                (entry.wake)();
                core = self.core.locked();
            }

            if expired > 0 {
                // firing may have taken time (or advanced the virtual clock
                // from a watcher), re-check before sleeping.
                continue;
            }

            core = match core.entries.peek() {
                Some(Reverse(head)) if !self.clock.is_virtual() => {
                    let wait = head.deadline.saturating_sub(now);
                    self.changed
                        .wait_timeout(core, wait)
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .0
                }
                // virtual clocks only move via `advance`, which notifies us;
                // with no entries there is nothing to wait for either way.
                _ => self
                    .changed
                    .wait(core)
                    .unwrap_or_else(std::sync::PoisonError::into_inner),
            };
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.core.locked();
        f.debug_struct("Timer")
            .field("clock", &self.shared.clock)
            .field("pending", &core.entries.len())
            .field("stopped", &core.stopped)
            .finish()
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn monotonic_entries_fire_in_deadline_order() {
        let timer = Timer::start(Clock::monotonic());
        let (tx, rx) = mpsc::channel();

        for (label, ms) in [("slow", 50_u64), ("fast", 5)] {
            let tx = tx.clone();
            timer.schedule(
                Duration::from_millis(ms),
                Box::new(move || tx.send(label).unwrap()),
            );
        }

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fast");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "slow");
    }

    #[test]
    fn virtual_entries_fire_only_when_advanced() {
        let clock = Clock::virtual_();
        let timer = Timer::start(clock.clone());
        let (tx, rx) = mpsc::channel();

        timer.schedule(
            Duration::from_millis(10),
            Box::new(move || tx.send(()).unwrap()),
        );

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        clock.advance(Duration::from_millis(10));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn stopped_timer_drops_pending_entries() {
        let timer = Timer::start(Clock::monotonic());
        let (tx, rx) = mpsc::channel::<()>();
        timer.schedule(
            Duration::from_millis(20),
            Box::new(move || tx.send(()).unwrap()),
        );
        timer.stop();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
