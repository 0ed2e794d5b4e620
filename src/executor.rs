// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread pools that run fiber slices.
//!
//! Two default executors back every [`Platform`]: a fixed-size pool for
//! ordinary, yielding fiber slices and a cached, unbounded pool for work that
//! is expected to block its thread. Fibers move between them through
//! [`Effect::on_executor`].
//!
//! [`Platform`]: crate::platform::Platform
//! [`Effect::on_executor`]: crate::effect::Effect::on_executor

use crate::util::LockExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A unit of work submitted to an executor: one fiber slice, one observer
/// notification, or one timer wakeup.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A thread pool accepting task submissions.
///
/// Implementations must run each submitted task exactly once (in submission
/// order per submitting thread) or reject it up front by returning `false`
/// from [`Executor::submit`]; a rejected fiber slice surfaces as a defect.
pub trait Executor: Send + Sync {
    /// The number of threads concurrently draining this executor's queue.
    fn concurrency(&self) -> usize;

    /// Submits a task. Returns `false` if the executor cannot accept it
    /// (shut down, or its queue is at capacity).
    fn submit(&self, task: Task) -> bool;

    /// Stops accepting tasks and wakes idle workers so they can exit. Tasks
    /// already queued are still drained.
    fn shutdown(&self);
}

/// A fixed-size pool with a bounded queue; the default executor for fiber
/// slices.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: &'static str,
    workers: usize,
    queue_capacity: usize,
    queue: Mutex<PoolQueue>,
    available: Condvar,
}

struct PoolQueue {
    tasks: VecDeque<Task>,
    shutdown: bool,
}

// === impl ThreadPool ===

impl ThreadPool {
    pub const DEFAULT_QUEUE_CAPACITY: usize = 65_536;

    /// Spawns `workers` threads draining a queue bounded at
    /// [`Self::DEFAULT_QUEUE_CAPACITY`] tasks.
    pub fn new(name: &'static str, workers: usize) -> Self {
        Self::with_queue_capacity(name, workers, Self::DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(name: &'static str, workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let inner = Arc::new(PoolInner {
            name,
            workers,
            queue_capacity,
            queue: Mutex::new(PoolQueue {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        for id in 0..workers {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || inner.run_worker(id))
                .expect("failed to spawn an executor worker thread");
        }

        Self { inner }
    }
}

impl Executor for ThreadPool {
    fn concurrency(&self) -> usize {
        self.inner.workers
    }

    fn submit(&self, task: Task) -> bool {
        let mut queue = self.inner.queue.locked();
        if queue.shutdown || queue.tasks.len() >= self.inner.queue_capacity {
            return false;
        }
        queue.tasks.push_back(task);
        drop(queue);
        self.inner.available.notify_one();
        true
    }

    fn shutdown(&self) {
        self.inner.queue.locked().shutdown = true;
        self.inner.available.notify_all();
    }
}

impl PoolInner {
    fn run_worker(&self, id: usize) {
        let _span = tracing::debug_span!("worker", pool = self.name, worker = id).entered();

        loop {
            let task = {
                let mut queue = self.queue.locked();
                loop {
                    if let Some(task) = queue.tasks.pop_front() {
                        break task;
                    }
                    if queue.shutdown {
                        tracing::debug!("stop signal received, shutting down");
                        return;
                    }
                    queue = self
                        .available
                        .wait(queue)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
            };

            task();
        }
    }
}

impl core::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.inner.name)
            .field("workers", &self.inner.workers)
            .finish_non_exhaustive()
    }
}

/// A cached pool with an unbounded queue; the default executor for blocking
/// work.
///
/// Threads are spawned on demand whenever a task is submitted and no worker
/// is idle, and exit after sitting idle for [`BlockingPool::KEEP_ALIVE`].
pub struct BlockingPool {
    inner: Arc<BlockingInner>,
}

struct BlockingInner {
    name: &'static str,
    queue: Mutex<BlockingQueue>,
    available: Condvar,
    next_thread: AtomicUsize,
}

struct BlockingQueue {
    tasks: VecDeque<Task>,
    idle: usize,
    live: usize,
    shutdown: bool,
}

// === impl BlockingPool ===

impl BlockingPool {
    pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(BlockingInner {
                name,
                queue: Mutex::new(BlockingQueue {
                    tasks: VecDeque::new(),
                    idle: 0,
                    live: 0,
                    shutdown: false,
                }),
                available: Condvar::new(),
                next_thread: AtomicUsize::new(0),
            }),
        }
    }
}

impl Executor for BlockingPool {
    fn concurrency(&self) -> usize {
        self.inner.queue.locked().live
    }

    fn submit(&self, task: Task) -> bool {
        let spawn = {
            let mut queue = self.inner.queue.locked();
            if queue.shutdown {
                return false;
            }
            queue.tasks.push_back(task);
            if queue.idle == 0 {
                queue.live += 1;
                true
            } else {
                false
            }
        };

        if spawn {
            let id = self.inner.next_thread.fetch_add(1, Ordering::Relaxed);
            let inner = Arc::clone(&self.inner);
            std::thread::Builder::new()
                .name(format!("{}-{id}", self.inner.name))
                .spawn(move || inner.run_worker(id))
                .expect("failed to spawn a blocking worker thread");
        } else {
            self.inner.available.notify_one();
        }
        true
    }

    fn shutdown(&self) {
        self.inner.queue.locked().shutdown = true;
        self.inner.available.notify_all();
    }
}

impl BlockingInner {
    fn run_worker(&self, id: usize) {
        let _span = tracing::debug_span!("worker", pool = self.name, worker = id).entered();

        loop {
            let task = {
                let mut queue = self.queue.locked();
                loop {
                    if let Some(task) = queue.tasks.pop_front() {
                        break task;
                    }
                    if queue.shutdown {
                        queue.live -= 1;
                        tracing::debug!("stop signal received, shutting down");
                        return;
                    }

                    queue.idle += 1;
                    let (lock, timeout) = self
                        .available
                        .wait_timeout(queue, BlockingPool::KEEP_ALIVE)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    queue = lock;
                    queue.idle -= 1;

                    if timeout.timed_out() && queue.tasks.is_empty() {
                        queue.live -= 1;
                        tracing::debug!("idle timeout, retiring");
                        return;
                    }
                }
            };

            task();
        }
    }
}

impl core::fmt::Debug for BlockingPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockingPool")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn thread_pool_runs_submitted_tasks() {
        let pool = ThreadPool::new("test-pool", 2);
        let (tx, rx) = mpsc::channel();

        for i in 0..8 {
            let tx = tx.clone();
            assert!(pool.submit(Box::new(move || tx.send(i).unwrap())));
        }

        let mut got: Vec<i32> = (0..8).map(|_| rx.recv().unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, (0..8).collect::<Vec<_>>());

        pool.shutdown();
    }

    #[test]
    fn thread_pool_rejects_after_shutdown() {
        let pool = ThreadPool::new("test-pool", 1);
        pool.shutdown();
        assert!(!pool.submit(Box::new(|| {})));
    }

    #[test]
    fn blocking_pool_grows_on_demand() {
        let pool = BlockingPool::new("test-blocking");
        let (tx, rx) = mpsc::channel();

        // two tasks that each hold a thread until both have started can only
        // finish if the pool spawned two workers.
        let barrier = Arc::new(std::sync::Barrier::new(2));
        for _ in 0..2 {
            let tx = tx.clone();
            let barrier = Arc::clone(&barrier);
            assert!(pool.submit(Box::new(move || {
                barrier.wait();
                tx.send(()).unwrap();
            })));
        }

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pool.shutdown();
    }
}
