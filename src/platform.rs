// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Platform configuration: the executors, clock, failure sink and fatal
//! policy a [`Runtime`] evaluates fibers against.
//!
//! Process-wide mutable state (the fiber-id counter and the STM commit lock)
//! lives behind the platform handle so that independent runtimes can coexist
//! in one process.
//!
//! [`Runtime`]: crate::runtime::Runtime

use crate::cause::ErasedCause;
use crate::executor::{BlockingPool, Executor, ThreadPool};
use crate::fiber::FiberId;
use crate::time::{Clock, Timer};
use core::any::Any;
use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Classifies caught panic payloads; `true` re-propagates the panic to the
/// host thread instead of converting it into a defect.
pub type FatalPredicate = dyn Fn(&(dyn Any + Send)) -> bool + Send + Sync;

/// Receives causes that completed a fiber nobody was observing.
pub type FailureSink = dyn Fn(&ErasedCause) + Send + Sync;

/// Everything the interpreter needs from its environment.
pub struct Platform {
    executor_async: Arc<dyn Executor>,
    executor_sync: Arc<dyn Executor>,
    yield_op_count: usize,
    fatal: Arc<FatalPredicate>,
    failure_sink: Arc<FailureSink>,
    timer: Timer,
    clock: Clock,
    fiber_ids: AtomicU64,
    stm_commit_lock: Mutex<()>,
}

// === impl Platform ===

impl Platform {
    /// The default reduction budget between cooperative yields.
    ///
    /// Lower values trade throughput for latency; 2048 keeps a CPU-bound
    /// fiber from starving its peers without measurably hurting sequential
    /// code.
    pub const DEFAULT_YIELD_OP_COUNT: usize = 2048;

    /// A platform with the default pools (a fixed pool of `2 × cores`
    /// yielding workers, a cached blocking pool), the monotonic clock, no
    /// fatal panics, and a `tracing`-based failure sink.
    pub fn new() -> Self {
        Self::with_clock(Clock::monotonic())
    }

    /// Like [`Platform::new`] with a caller-provided clock; pass a virtual
    /// clock to make timed effects deterministic.
    pub fn with_clock(clock: Clock) -> Self {
        let workers = std::thread::available_parallelism().map_or(4, |n| n.get() * 2);
        Self {
            executor_async: Arc::new(ThreadPool::new("efx-async", workers)),
            executor_sync: Arc::new(BlockingPool::new("efx-blocking")),
            yield_op_count: Self::DEFAULT_YIELD_OP_COUNT,
            fatal: Arc::new(|_| false),
            failure_sink: Arc::new(|cause: &ErasedCause| {
                tracing::error!(?cause, "unhandled fiber failure");
            }),
            timer: Timer::start(clock.clone()),
            clock,
            fiber_ids: AtomicU64::new(1),
            stm_commit_lock: Mutex::new(()),
        }
    }

    /// Replaces the default yielding executor.
    #[must_use]
    pub fn with_executor_async(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor_async = executor;
        self
    }

    /// Replaces the default blocking executor.
    #[must_use]
    pub fn with_executor_sync(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor_sync = executor;
        self
    }

    /// Overrides the reduction budget between cooperative yields.
    #[must_use]
    pub fn with_yield_op_count(mut self, ops: usize) -> Self {
        self.yield_op_count = ops.max(1);
        self
    }

    /// Overrides which panic payloads terminate the host thread rather than
    /// becoming defects.
    #[must_use]
    pub fn with_fatal(mut self, fatal: impl Fn(&(dyn Any + Send)) -> bool + Send + Sync + 'static) -> Self {
        self.fatal = Arc::new(fatal);
        self
    }

    /// Overrides where unobserved failure causes are reported.
    #[must_use]
    pub fn with_failure_sink(mut self, sink: impl Fn(&ErasedCause) + Send + Sync + 'static) -> Self {
        self.failure_sink = Arc::new(sink);
        self
    }

    pub fn executor_async(&self) -> &Arc<dyn Executor> {
        &self.executor_async
    }

    pub fn executor_sync(&self) -> &Arc<dyn Executor> {
        &self.executor_sync
    }

    pub fn yield_op_count(&self) -> usize {
        self.yield_op_count
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub(crate) fn timer(&self) -> &Timer {
        &self.timer
    }

    pub(crate) fn is_fatal(&self, payload: &(dyn Any + Send)) -> bool {
        (self.fatal)(payload)
    }

    pub(crate) fn report_failure(&self, cause: &ErasedCause) {
        (self.failure_sink)(cause);
    }

    pub(crate) fn next_fiber_id(&self) -> FiberId {
        FiberId::from_u64(self.fiber_ids.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn stm_commit_lock(&self) -> &Mutex<()> {
        &self.stm_commit_lock
    }

    /// Stops both pools and the timer driver. Queued slices still drain;
    /// fibers suspended at async boundaries will never resume.
    pub fn shutdown(&self) {
        self.timer.stop();
        self.executor_async.shutdown();
        self.executor_sync.shutdown();
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        // live fibers hold the platform alive through their handles; by the
        // time the last reference drops there is nothing left to run
        self.shutdown();
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("yield_op_count", &self.yield_op_count)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
