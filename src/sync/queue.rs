// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The asynchronous bounded queue.
//!
//! One short mutex guards a three-state machine: `Surplus` (items queued,
//! and, under back-pressure only, parked putters), `Deficit` (parked
//! takers), and the terminal `Shutdown`. A parked waiter is its fiber's
//! resume callback, registered in the same critical section that decided to
//! park; wakeups always fire *outside* the lock, and an interrupted waiter
//! removes its entry so neither the queue nor its peers observe a leak.

use crate::cause::Cause;
use crate::effect::{Callback, Effect};
use crate::exit::Exit;
use crate::fiber::FiberId;
use crate::sync::Promise;
use crate::util::LockExt;
use core::convert::Infallible;
use core::fmt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// An asynchronous FIFO queue with a capacity and a surplus strategy.
///
/// Construct with [`Queue::bounded`] (back-pressure), [`Queue::sliding`],
/// [`Queue::dropping`] or [`Queue::unbounded`].
pub struct Queue<A> {
    inner: Arc<QueueInner<A>>,
}

struct QueueInner<A> {
    capacity: usize,
    strategy: Strategy,
    state: Mutex<State<A>>,
    shutdown_hook: Promise<(), Infallible>,
    waiter_ids: AtomicU64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Strategy {
    /// Excess offers park until space frees up.
    BackPressure,
    /// Excess offers evict the oldest queued values.
    Sliding,
    /// Excess offers are discarded.
    Dropping,
}

enum State<A> {
    Surplus {
        items: VecDeque<A>,
        putters: VecDeque<Putter<A>>,
    },
    Deficit {
        takers: VecDeque<Taker<A>>,
    },
    Shutdown {
        cause: Cause<Infallible>,
    },
}

/// A parked offer: the unconsumed tail of its batch plus the resume
/// capability of the suspended fiber.
struct Putter<A> {
    id: u64,
    rest: VecDeque<A>,
    callback: Callback<bool, Infallible>,
}

/// A parked take: the resume capability of the suspended fiber.
struct Taker<A> {
    id: u64,
    callback: Callback<A, Infallible>,
}

/// Wakeups collected under the lock, performed after it is released.
enum Wake<A> {
    Taker(Callback<A, Infallible>, A),
    Putter(Callback<bool, Infallible>),
}

/// Shutdown notifications, likewise performed outside the lock.
enum Halt<A> {
    Taker(Callback<A, Infallible>, Cause<Infallible>),
    Putter(Callback<bool, Infallible>, Cause<Infallible>),
}

// === impl Queue ===

impl<A> Queue<A>
where
    A: Send + 'static,
{
    /// A queue of capacity `n` that back-pressures producers: offers beyond
    /// capacity suspend until space frees up.
    ///
    /// `bounded(0)` is a rendezvous queue: every offer suspends until a
    /// taker arrives to receive the value directly, and vice versa; the
    /// buffer is never used.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_strategy(capacity, Strategy::BackPressure)
    }

    /// A queue of capacity `n` that keeps the most recent values, evicting
    /// the oldest on overflow.
    pub fn sliding(capacity: usize) -> Self {
        Self::with_strategy(capacity, Strategy::Sliding)
    }

    /// A queue of capacity `n` that discards offers made while full.
    pub fn dropping(capacity: usize) -> Self {
        Self::with_strategy(capacity, Strategy::Dropping)
    }

    /// A queue with no capacity bound.
    pub fn unbounded() -> Self {
        Self::with_strategy(usize::MAX, Strategy::Dropping)
    }

    fn with_strategy(capacity: usize, strategy: Strategy) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                capacity,
                strategy,
                state: Mutex::new(State::Surplus {
                    items: VecDeque::new(),
                    putters: VecDeque::new(),
                }),
                shutdown_hook: Promise::new(),
                waiter_ids: AtomicU64::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Offers one value. Under back-pressure the effect suspends while the
    /// queue is full and produces `true` upon eventual enqueue; sliding and
    /// dropping queues produce `false` iff any value was discarded.
    pub fn offer(&self, value: A) -> Effect<bool, Infallible> {
        self.offer_all(vec![value])
    }

    /// Offers a batch, preserving order. Pending takers are satisfied first,
    /// then the queue fills, then the strategy decides the remainder.
    ///
    /// The state transition happens inside the async registration, under one
    /// lock, *after* the cancellation handler is on the stack — so an
    /// interrupt can never separate a parked putter from its cleanup.
    pub fn offer_all(&self, values: Vec<A>) -> Effect<bool, Infallible> {
        let inner = Arc::clone(&self.inner);
        Effect::suspend(move || {
            let id = inner.next_waiter_id();
            let registered = Arc::clone(&inner);
            Effect::async_(move |callback| {
                let mut wakes = Vec::new();
                let plan = {
                    let mut state = registered.state.locked();
                    registered.offer_locked(&mut state, id, values.into(), callback, &mut wakes)
                };
                perform_wakes(wakes);
                match plan {
                    OfferPlan::Complete(accepted_all) => Some(Effect::succeed(accepted_all)),
                    OfferPlan::Parked => None,
                    OfferPlan::Refuse(cause) => Some(Effect::fail_cause(cause)),
                }
            })
            .on_interrupt(Effect::sync(move || inner.remove_putter(id)))
        })
    }

    /// Takes the next value, suspending while the queue is empty.
    pub fn take(&self) -> Effect<A, Infallible> {
        let inner = Arc::clone(&self.inner);
        Effect::suspend(move || {
            let id = inner.next_waiter_id();
            let registered = Arc::clone(&inner);
            Effect::async_(move |callback| {
                let mut wakes = Vec::new();
                let plan = {
                    let mut state = registered.state.locked();
                    registered.take_locked(&mut state, id, callback, &mut wakes)
                };
                perform_wakes(wakes);
                match plan {
                    TakePlan::Value(value) => Some(Effect::succeed(value)),
                    TakePlan::Parked => None,
                    TakePlan::Refuse(cause) => Some(Effect::fail_cause(cause)),
                }
            })
            .on_interrupt(Effect::sync(move || inner.remove_taker(id)))
        })
    }

    /// Takes the next value if one is queued. Never suspends.
    pub fn poll(&self) -> Effect<Option<A>, Infallible> {
        let inner = Arc::clone(&self.inner);
        Effect::suspend(move || {
            let mut wakes = Vec::new();
            let result = {
                let mut state = inner.state.locked();
                match &mut *state {
                    State::Shutdown { cause } => Err(cause.clone()),
                    State::Deficit { .. } => Ok(None),
                    State::Surplus { items, putters } => {
                        let head = items.pop_front();
                        if head.is_some() {
                            QueueInner::promote_putters(
                                inner.capacity,
                                items,
                                putters,
                                &mut wakes,
                            );
                        }
                        Ok(head)
                    }
                }
            };
            perform_wakes(wakes);
            match result {
                Ok(value) => Effect::succeed(value),
                Err(cause) => Effect::fail_cause(cause),
            }
        })
    }

    /// Drains every queued value, then lets parked putters move in.
    pub fn take_all(&self) -> Effect<Vec<A>, Infallible> {
        self.take_up_to(usize::MAX)
    }

    /// Takes at most `n` queued values (never suspends), then lets parked
    /// putters move in.
    pub fn take_up_to(&self, n: usize) -> Effect<Vec<A>, Infallible> {
        let inner = Arc::clone(&self.inner);
        Effect::suspend(move || {
            let mut wakes = Vec::new();
            let result = {
                let mut state = inner.state.locked();
                match &mut *state {
                    State::Shutdown { cause } => Err(cause.clone()),
                    State::Deficit { .. } => Ok(Vec::new()),
                    State::Surplus { items, putters } => {
                        let count = n.min(items.len());
                        let taken: Vec<A> = items.drain(..count).collect();
                        QueueInner::promote_putters(inner.capacity, items, putters, &mut wakes);
                        Ok(taken)
                    }
                }
            };
            perform_wakes(wakes);
            match result {
                Ok(values) => Effect::succeed(values),
                Err(cause) => Effect::fail_cause(cause),
            }
        })
    }

    /// The number of queued values, plus values held by parked putters,
    /// minus parked takers. Fails with the recorded cause after shutdown.
    pub fn size(&self) -> Effect<isize, Infallible> {
        let inner = Arc::clone(&self.inner);
        Effect::suspend(move || {
            let result = match &*inner.state.locked() {
                State::Shutdown { cause } => Err(cause.clone()),
                State::Deficit { takers } => Ok(-(takers.len() as isize)),
                State::Surplus { items, putters } => {
                    let parked: usize = putters.iter().map(|p| p.rest.len()).sum();
                    Ok((items.len() + parked) as isize)
                }
            };
            match result {
                Ok(size) => Effect::succeed(size),
                Err(cause) => Effect::fail_cause(cause),
            }
        })
    }

    /// Shuts the queue down: parked putters and takers are interrupted with
    /// the caller's fiber id, the shutdown hook fires exactly once, and
    /// every future operation fails with the recorded cause. Idempotent.
    pub fn shutdown(&self) -> Effect<(), Infallible> {
        let inner = Arc::clone(&self.inner);
        Effect::descriptor_with(move |descriptor| {
            Effect::sync(move || inner.shutdown_now(descriptor.id()))
        })
    }

    /// Suspends until the queue is shut down.
    pub fn await_shutdown(&self) -> Effect<(), Infallible> {
        self.inner.shutdown_hook.await_()
    }

    pub fn is_shutdown(&self) -> Effect<bool, Infallible> {
        let inner = Arc::clone(&self.inner);
        Effect::sync(move || matches!(&*inner.state.locked(), State::Shutdown { .. }))
    }
}

enum OfferPlan {
    Complete(bool),
    Parked,
    Refuse(Cause<Infallible>),
}

enum TakePlan<A> {
    Value(A),
    Parked,
    Refuse(Cause<Infallible>),
}

// === impl QueueInner ===

impl<A: Send + 'static> QueueInner<A> {
    fn next_waiter_id(&self) -> u64 {
        self.waiter_ids.fetch_add(1, Ordering::Relaxed)
    }

    fn offer_locked(
        &self,
        state: &mut State<A>,
        id: u64,
        mut values: VecDeque<A>,
        callback: Callback<bool, Infallible>,
        wakes: &mut Vec<Wake<A>>,
    ) -> OfferPlan {
        if values.is_empty() {
            if let State::Shutdown { cause } = state {
                return OfferPlan::Refuse(cause.clone());
            }
            return OfferPlan::Complete(true);
        }
        match state {
            State::Shutdown { cause } => OfferPlan::Refuse(cause.clone()),
            State::Deficit { takers } => {
                // satisfy takers in FIFO order before anything is queued
                while let (Some(_), true) = (values.front(), !takers.is_empty()) {
                    let taker = takers.pop_front().expect("non-empty taker queue");
                    let value = values.pop_front().expect("non-empty value batch");
                    wakes.push(Wake::Taker(taker.callback, value));
                }
                if values.is_empty() {
                    return OfferPlan::Complete(true);
                }
                *state = State::Surplus {
                    items: VecDeque::new(),
                    putters: VecDeque::new(),
                };
                self.offer_locked(state, id, values, callback, wakes)
            }
            State::Surplus { items, putters } => {
                while items.len() < self.capacity && !values.is_empty() {
                    items.push_back(values.pop_front().expect("non-empty value batch"));
                }
                if values.is_empty() && putters.is_empty() {
                    return OfferPlan::Complete(true);
                }
                match self.strategy {
                    Strategy::BackPressure => {
                        putters.push_back(Putter {
                            id,
                            rest: values,
                            callback,
                        });
                        OfferPlan::Parked
                    }
                    Strategy::Sliding => {
                        // the most recent `capacity` of everything offered
                        // survive; older queued values are evicted
                        let mut dropped = false;
                        for value in values {
                            items.push_back(value);
                            while items.len() > self.capacity {
                                items.pop_front();
                                dropped = true;
                            }
                        }
                        OfferPlan::Complete(!dropped)
                    }
                    Strategy::Dropping => OfferPlan::Complete(false),
                }
            }
        }
    }

    fn take_locked(
        &self,
        state: &mut State<A>,
        id: u64,
        callback: Callback<A, Infallible>,
        wakes: &mut Vec<Wake<A>>,
    ) -> TakePlan<A> {
        match state {
            State::Shutdown { cause } => TakePlan::Refuse(cause.clone()),
            State::Deficit { takers } => {
                takers.push_back(Taker { id, callback });
                TakePlan::Parked
            }
            State::Surplus { items, putters } => match items.pop_front() {
                Some(value) => {
                    Self::promote_putters(self.capacity, items, putters, wakes);
                    TakePlan::Value(value)
                }
                None => {
                    // only a zero-capacity queue parks putters while `items`
                    // is empty; hand their values straight to the taker
                    // (rendezvous), never through the buffer
                    if let Some(putter) = putters.front_mut() {
                        let value = putter
                            .rest
                            .pop_front()
                            .expect("parked putter with no values, this is a bug");
                        if putter.rest.is_empty() {
                            let putter =
                                putters.pop_front().expect("non-empty putter queue");
                            wakes.push(Wake::Putter(putter.callback));
                        }
                        return TakePlan::Value(value);
                    }
                    *state = State::Deficit {
                        takers: VecDeque::from([Taker { id, callback }]),
                    };
                    TakePlan::Parked
                }
            },
        }
    }

    /// Moves parked putters' values into freed capacity, FIFO, completing
    /// each fully-drained putter with `true`. A putter whose values do not
    /// all fit keeps its place at the front with the unconsumed tail.
    fn promote_putters(
        capacity: usize,
        items: &mut VecDeque<A>,
        putters: &mut VecDeque<Putter<A>>,
        wakes: &mut Vec<Wake<A>>,
    ) {
        while items.len() < capacity {
            let Some(putter) = putters.front_mut() else {
                return;
            };
            while items.len() < capacity && !putter.rest.is_empty() {
                items.push_back(putter.rest.pop_front().expect("non-empty putter tail"));
            }
            if putter.rest.is_empty() {
                let putter = putters.pop_front().expect("non-empty putter queue");
                wakes.push(Wake::Putter(putter.callback));
            } else {
                return;
            }
        }
    }

    fn remove_putter(&self, id: u64) {
        if let State::Surplus { putters, .. } = &mut *self.state.locked() {
            putters.retain(|p| p.id != id);
        }
    }

    fn remove_taker(&self, id: u64) {
        if let State::Deficit { takers } = &mut *self.state.locked() {
            takers.retain(|t| t.id != id);
        }
    }

    fn shutdown_now(&self, by: FiberId) {
        let mut halts = Vec::new();
        {
            let mut state = self.state.locked();
            let cause = Cause::interrupt(by);
            match &mut *state {
                State::Shutdown { .. } => return,
                State::Deficit { takers } => {
                    for taker in core::mem::take(takers) {
                        halts.push(Halt::Taker(taker.callback, cause.clone()));
                    }
                }
                State::Surplus { putters, .. } => {
                    for putter in core::mem::take(putters) {
                        halts.push(Halt::Putter(putter.callback, cause.clone()));
                    }
                }
            }
            *state = State::Shutdown { cause };
        }
        tracing::debug!(by = %by, waiters = halts.len(), "queue shut down");
        for halt in halts {
            match halt {
                Halt::Taker(callback, cause) => {
                    callback.halt(cause);
                }
                Halt::Putter(callback, cause) => {
                    callback.halt(cause);
                }
            }
        }
        self.shutdown_hook.complete_now(Exit::Success(()));
    }
}

fn perform_wakes<A: Send + 'static>(wakes: Vec<Wake<A>>) {
    for wake in wakes {
        match wake {
            Wake::Taker(callback, value) => {
                callback.succeed(value);
            }
            Wake::Putter(callback) => {
                callback.succeed(true);
            }
        }
    }
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.locked() {
            State::Surplus { items, putters } => {
                format!("Surplus({} items, {} putters)", items.len(), putters.len())
            }
            State::Deficit { takers } => format!("Deficit({} takers)", takers.len()),
            State::Shutdown { .. } => "Shutdown".to_owned(),
        };
        f.debug_struct("Queue")
            .field("capacity", &self.inner.capacity)
            .field("strategy", &self.inner.strategy)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use core::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new()
    }

    /// Re-runs `probe` (with a yield in between) until it produces `true`.
    fn until<F>(probe: F) -> Effect<(), Infallible>
    where
        F: Fn() -> Effect<bool, Infallible> + Send + Sync + 'static,
    {
        fn go<F>(probe: Arc<F>) -> Effect<(), Infallible>
        where
            F: Fn() -> Effect<bool, Infallible> + Send + Sync + 'static,
        {
            probe().flat_map(move |done| {
                if done {
                    Effect::unit()
                } else {
                    Effect::yield_now().flat_map(move |()| go(probe))
                }
            })
        }
        go(Arc::new(probe))
    }

    #[test]
    fn offer_then_take_round_trips() {
        let queue: Queue<i32> = Queue::bounded(4);
        let exit = runtime().block_on(queue.offer(11).zip_right(queue.take()));
        assert_eq!(exit.success(), Some(11));
    }

    #[test]
    fn back_pressure_parks_the_third_offer() {
        let queue: Queue<i32> = Queue::bounded(2);
        let runtime = runtime();

        let q = queue.clone();
        let exit = runtime.block_on(
            queue
                .offer(1)
                .flat_map({
                    let q = q.clone();
                    move |first| q.offer(2).map(move |second| (first, second))
                })
                .flat_map({
                    let q = q.clone();
                    move |(first, second)| {
                        q.offer(3)
                            .fork()
                            .map(move |putter| (first, second, putter))
                    }
                })
                .flat_map({
                    let q = q.clone();
                    move |(first, second, putter)| {
                        // the third offer parks: its value shows up in the
                        // size but not yet in the queue
                        until({
                            let q = q.clone();
                            move || q.size().map(|s| s == 3)
                        })
                        .map(move |()| (first, second, putter))
                    }
                })
                .flat_map({
                    let q = q.clone();
                    move |(first, second, putter)| {
                        q.take().map(move |head| (first, second, putter, head))
                    }
                })
                .flat_map({
                    let q = q.clone();
                    move |(first, second, putter, head)| {
                        putter.join().flat_map(move |third| {
                            q.take_all().map(move |rest| {
                                (first, second, third, head, rest)
                            })
                        })
                    }
                }),
        );

        let (first, second, third, head, rest) = exit.success().unwrap();
        assert!(first && second && third);
        assert_eq!(head, 1);
        assert_eq!(rest, vec![2, 3]);
    }

    #[test]
    fn zero_capacity_queue_is_a_rendezvous() {
        let queue: Queue<i32> = Queue::bounded(0);
        let runtime = runtime();

        let q = queue.clone();
        let exit = runtime.block_on(
            queue
                .offer(9)
                .fork()
                .flat_map({
                    let q = q.clone();
                    move |putter| {
                        until({
                            let q = q.clone();
                            move || q.size().map(|s| s == 1)
                        })
                        .map(move |()| putter)
                    }
                })
                .flat_map({
                    let q = q.clone();
                    move |putter| {
                        q.take().flat_map(move |head| {
                            putter.join().map(move |accepted| (head, accepted))
                        })
                    }
                }),
        );

        assert_eq!(exit.success(), Some((9, true)));
    }

    #[test]
    fn zero_capacity_queue_hands_offers_to_parked_takers() {
        let queue: Queue<i32> = Queue::bounded(0);
        let runtime = runtime();

        let q = queue.clone();
        let exit = runtime.block_on(
            queue
                .take()
                .fork()
                .flat_map({
                    let q = q.clone();
                    move |taker| {
                        until({
                            let q = q.clone();
                            move || q.size().map(|s| s == -1)
                        })
                        .map(move |()| taker)
                    }
                })
                .flat_map({
                    let q = q.clone();
                    move |taker| q.offer(4).flat_map(move |_| taker.join())
                }),
        );

        assert_eq!(exit.success(), Some(4));
    }

    #[test]
    fn sliding_keeps_the_most_recent_values() {
        let queue: Queue<i32> = Queue::sliding(2);
        let exit = runtime().block_on(
            queue
                .offer_all(vec![1, 2, 3, 4])
                .flat_map({
                    let q = queue.clone();
                    move |accepted| q.take_all().map(move |rest| (accepted, rest))
                }),
        );
        let (accepted, rest) = exit.success().unwrap();
        assert!(!accepted);
        assert_eq!(rest, vec![3, 4]);
    }

    #[test]
    fn dropping_discards_the_excess() {
        let queue: Queue<i32> = Queue::dropping(2);
        let exit = runtime().block_on(
            queue
                .offer_all(vec![1, 2, 3])
                .flat_map({
                    let q = queue.clone();
                    move |accepted| q.take_all().map(move |rest| (accepted, rest))
                }),
        );
        let (accepted, rest) = exit.success().unwrap();
        assert!(!accepted);
        assert_eq!(rest, vec![1, 2]);
    }

    #[test]
    fn unbounded_accepts_everything() {
        let queue: Queue<i32> = Queue::unbounded();
        let exit = runtime().block_on(
            queue
                .offer_all((0..1000).collect())
                .flat_map({
                    let q = queue.clone();
                    move |accepted| q.take_all().map(move |rest| (accepted, rest))
                }),
        );
        let (accepted, rest) = exit.success().unwrap();
        assert!(accepted);
        assert_eq!(rest.len(), 1000);
    }

    #[test]
    fn parked_takers_receive_offers_in_fifo_order() {
        let queue: Queue<i32> = Queue::bounded(4);
        let runtime = runtime();

        let q = queue.clone();
        let exit = runtime.block_on(
            queue
                .take()
                .fork()
                .flat_map({
                    let q = q.clone();
                    move |taker| {
                        until({
                            let q = q.clone();
                            move || q.size().map(|s| s == -1)
                        })
                        .map(move |()| taker)
                    }
                })
                .flat_map({
                    let q = q.clone();
                    move |taker| q.offer(42).flat_map(move |_| taker.join())
                }),
        );
        assert_eq!(exit.success(), Some(42));
    }

    #[test]
    fn take_up_to_takes_at_most_n() {
        let queue: Queue<i32> = Queue::bounded(8);
        let exit = runtime().block_on(
            queue
                .offer_all(vec![1, 2, 3, 4, 5])
                .flat_map({
                    let q = queue.clone();
                    move |_| q.take_up_to(3)
                })
                .flat_map({
                    let q = queue.clone();
                    move |first| q.take_all().map(move |rest| (first, rest))
                }),
        );
        let (first, rest) = exit.success().unwrap();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(rest, vec![4, 5]);
    }

    #[test]
    fn shutdown_interrupts_parked_takers() {
        let queue: Queue<i32> = Queue::bounded(2);
        let runtime = runtime();

        let q = queue.clone();
        let exit = runtime.block_on(
            queue
                .take()
                .fork()
                .flat_map({
                    let q = q.clone();
                    move |taker| {
                        until({
                            let q = q.clone();
                            move || q.size().map(|s| s == -1)
                        })
                        .map(move |()| taker)
                    }
                })
                .flat_map({
                    let q = q.clone();
                    move |taker| q.shutdown().flat_map(move |()| taker.await_())
                }),
        );

        let taker_exit = exit.success().unwrap();
        assert!(taker_exit.is_interrupted());
    }

    #[test]
    fn operations_after_shutdown_fail_with_the_recorded_cause() {
        let queue: Queue<i32> = Queue::bounded(2);
        let exit: Exit<bool, Infallible> = runtime().block_on(
            queue
                .shutdown()
                .zip_right(queue.await_shutdown())
                .zip_right(queue.offer(1)),
        );
        assert!(exit.is_interrupted());

        let exit: Exit<isize, Infallible> = runtime().block_on(queue.size());
        assert!(exit.is_interrupted());
    }

    #[test]
    fn interrupted_takers_are_removed_from_the_queue() {
        let queue: Queue<i32> = Queue::bounded(2);
        let runtime = runtime();

        let q = queue.clone();
        let exit = runtime.block_on(
            queue
                .take()
                .fork()
                .flat_map({
                    let q = q.clone();
                    move |taker| {
                        until({
                            let q = q.clone();
                            move || q.size().map(|s| s == -1)
                        })
                        .flat_map(move |()| taker.interrupt())
                    }
                })
                .flat_map({
                    let q = q.clone();
                    move |()| q.size()
                }),
        );

        // the cancelled taker's cell is gone; nothing leaks
        assert_eq!(exit.success(), Some(0));
    }

    #[test]
    fn shutdown_hook_fires_exactly_once() {
        let queue: Queue<i32> = Queue::bounded(2);
        let exit = runtime().block_on(
            queue
                .shutdown()
                .zip_right(queue.shutdown())
                .zip_right(queue.await_shutdown())
                .zip_right(queue.is_shutdown()),
        );
        assert_eq!(exit.success(), Some(true));
    }

    #[test]
    fn size_counts_parked_putter_values() {
        let queue: Queue<i32> = Queue::bounded(1);
        let runtime = runtime();

        let q = queue.clone();
        let exit = runtime.block_on(
            queue
                .offer(1)
                .flat_map({
                    let q = q.clone();
                    move |_| q.offer_all(vec![2, 3]).fork()
                })
                .flat_map({
                    let q = q.clone();
                    move |putter| {
                        until({
                            let q = q.clone();
                            move || q.size().map(|s| s == 3)
                        })
                        .map(move |()| putter)
                    }
                })
                .flat_map({
                    let q = q.clone();
                    move |putter| {
                        q.take().flat_map({
                            let q = q.clone();
                            move |first| {
                                q.take().flat_map({
                                    let q = q.clone();
                                    move |second| {
                                        q.take().flat_map(move |third| {
                                            putter.join().map(move |accepted| {
                                                (first, second, third, accepted)
                                            })
                                        })
                                    }
                                })
                            }
                        })
                    }
                }),
        );

        assert_eq!(exit.success(), Some((1, 2, 3, true)));
    }

    #[test]
    fn take_parks_until_capacity_frees_up() {
        // a tiny end-to-end producer/consumer hand-off
        let queue: Queue<i32> = Queue::bounded(1);
        let runtime = runtime();

        let producer = {
            let q = queue.clone();
            (0..10).fold(Effect::<(), Infallible>::unit(), move |acc, i| {
                let q = q.clone();
                acc.flat_map(move |()| q.offer(i).map(|_| ()))
            })
        };
        let consumer = {
            let q = queue.clone();
            (0..10).fold(Effect::<Vec<i32>, Infallible>::succeed(Vec::new()), move |acc, _| {
                let q = q.clone();
                acc.flat_map(move |mut seen| {
                    q.take().map(move |v| {
                        seen.push(v);
                        seen
                    })
                })
            })
        };

        let exit = runtime.block_on(
            producer
                .fork()
                .flat_map(move |_producer| consumer)
                .timeout(Duration::from_secs(30)),
        );
        assert_eq!(exit.success(), Some(Some((0..10).collect())));
    }
}
