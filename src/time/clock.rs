// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::util::LockExt;
use core::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A monotonic time source for the platform's timer.
///
/// Time is reported as a [`Duration`] since an arbitrary origin fixed at
/// construction. Two sources exist: the host's monotonic clock, and a
/// virtual clock that only moves when [`Clock::advance`] is called — the
/// latter makes timed scenarios deterministic under test.
#[derive(Clone)]
pub struct Clock {
    source: Source,
}

#[derive(Clone)]
enum Source {
    Monotonic { origin: Instant },
    Virtual(Arc<VirtualClock>),
}

struct VirtualClock {
    now: Mutex<Duration>,
    /// Wakers poked whenever the clock moves, so the timer driver re-checks
    /// its deadlines.
    watchers: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

// === impl Clock ===

impl Clock {
    /// The host's monotonic clock.
    pub fn monotonic() -> Self {
        Self {
            source: Source::Monotonic {
                origin: Instant::now(),
            },
        }
    }

    /// A clock that stands still until advanced.
    pub fn virtual_() -> Self {
        Self {
            source: Source::Virtual(Arc::new(VirtualClock {
                now: Mutex::new(Duration::ZERO),
                watchers: Mutex::new(Vec::new()),
            })),
        }
    }

    /// The time elapsed since this clock's origin.
    pub fn now(&self) -> Duration {
        match &self.source {
            Source::Monotonic { origin } => origin.elapsed(),
            Source::Virtual(v) => *v.now.locked(),
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.source, Source::Virtual(_))
    }

    /// Moves a virtual clock forward by `duration` and wakes the timer.
    ///
    /// # Panics
    ///
    /// Panics if this clock is the host's monotonic clock; only virtual
    /// clocks can be driven by hand.
    pub fn advance(&self, duration: Duration) {
        let Source::Virtual(v) = &self.source else {
            panic!("Clock::advance called on a monotonic clock");
        };
        {
            let mut now = v.now.locked();
            *now += duration;
            tracing::trace!(now = ?*now, "virtual clock advanced");
        }
        for watcher in v.watchers.locked().iter() {
            watcher();
        }
    }

    /// Registers a callback poked whenever a virtual clock moves. No-op for
    /// the monotonic clock, whose consumers wait with real timeouts instead.
    pub(crate) fn on_advance(&self, watcher: Box<dyn Fn() + Send + Sync>) {
        if let Source::Virtual(v) = &self.source {
            v.watchers.locked().push(watcher);
        }
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Source::Monotonic { .. } => write!(f, "Clock::Monotonic({:?})", self.now()),
            Source::Virtual(_) => write!(f, "Clock::Virtual({:?})", self.now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = Clock::monotonic();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn virtual_clock_only_moves_when_advanced() {
        let clock = Clock::virtual_();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.advance(Duration::from_millis(10));
        assert_eq!(clock.now(), Duration::from_millis(10));
    }

    #[test]
    fn virtual_clock_pokes_watchers() {
        let clock = Clock::virtual_();
        let poked = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let p = Arc::clone(&poked);
        clock.on_advance(Box::new(move || {
            p.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        clock.advance(Duration::from_millis(1));
        clock.advance(Duration::from_millis(1));
        assert_eq!(poked.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
