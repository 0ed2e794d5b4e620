// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Running effects: a [`Runtime`] binds a [`Platform`] and an initial
//! environment, spawns a root fiber per run, and hands back the [`Exit`].

use crate::cause::Failure;
use crate::effect::Effect;
use crate::effect::repr::AnyEnv;
use crate::exit::Exit;
use crate::fiber::context::{self, EvalState};
use crate::fiber::{RawFiber, typed_exit};
use crate::platform::Platform;
use std::sync::Arc;
use std::sync::mpsc;

/// Runs effects against a platform configuration.
///
/// Cheap to construct once the platform exists; each run spawns a fresh root
/// fiber. Dropping the last handle to the platform shuts its pools and timer
/// down, so keep the runtime alive as long as daemon fibers matter.
#[derive(Debug)]
pub struct Runtime {
    platform: Arc<Platform>,
    environment: AnyEnv,
}

// === impl Runtime ===

impl Runtime {
    /// A runtime on a fresh default [`Platform`], with `()` as the ambient
    /// environment.
    pub fn new() -> Self {
        Self::with_platform(Arc::new(Platform::new()))
    }

    pub fn with_platform(platform: Arc<Platform>) -> Self {
        Self {
            platform,
            environment: Arc::new(()),
        }
    }

    /// Replaces the ambient environment handed to root fibers.
    #[must_use]
    pub fn with_environment<R: Send + Sync + 'static>(mut self, environment: R) -> Self {
        self.environment = Arc::new(environment);
        self
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    /// Runs `effect` to completion on the platform's executors, blocking the
    /// calling thread until the root fiber is done.
    pub fn block_on<A, E>(&self, effect: Effect<A, E>) -> Exit<A, E>
    where
        A: Send + 'static,
        E: Failure,
    {
        let (tx, rx) = mpsc::channel();
        self.run_callback(effect, move |exit| {
            let _ = tx.send(exit);
        });
        rx.recv()
            .expect("root fiber was dropped without completing, this is a bug")
    }

    /// Runs `effect` on the platform's executors, invoking `f` with the exit
    /// once the root fiber completes. Never blocks the calling thread.
    pub fn run_callback<A, E>(&self, effect: Effect<A, E>, f: impl FnOnce(Exit<A, E>) + Send + 'static)
    where
        A: Send + 'static,
        E: Failure,
    {
        let fiber = RawFiber::new(Arc::clone(&self.platform));
        // register before scheduling so the root's failures always count as
        // observed
        fiber.on_done(Box::new(move |exit| f(typed_exit::<A, E>(exit))));
        let eval = EvalState::new(self.environment.clone());
        context::schedule(fiber, eval, effect.into_erased());
    }

    /// Stops the platform's pools and timer. Queued slices still drain;
    /// suspended fibers never resume.
    pub fn shutdown(&self) {
        self.platform.shutdown();
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadPool;
    use crate::fiber::FiberId;
    use crate::time::{Clock, sleep};
    use core::convert::Infallible;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use core::time::Duration;
    use std::sync::Mutex;

    fn runtime() -> Runtime {
        Runtime::new()
    }

    /// Yields until `flag` becomes true; used to know a forked fiber has
    /// started evaluating (and so has its finalizer frames in place) before
    /// poking it.
    fn await_flag(flag: Arc<AtomicBool>) -> Effect<(), Infallible> {
        Effect::suspend(move || {
            if flag.load(Ordering::SeqCst) {
                Effect::unit()
            } else {
                Effect::yield_now().flat_map(move |()| await_flag(flag))
            }
        })
    }

    /// `never`, with `started` raised once the fiber is actually parked
    /// behind its wrappers.
    fn never_signalling(started: Arc<AtomicBool>) -> Effect<(), Infallible> {
        Effect::sync(move || started.store(true, Ordering::SeqCst))
            .zip_right(Effect::never())
    }

    #[test]
    fn sequential_composition() {
        let exit: Exit<i32, Infallible> = runtime().block_on(
            Effect::succeed(1)
                .flat_map(|x| Effect::succeed(x + 1))
                .flat_map(|x| Effect::succeed(x * 10)),
        );
        assert_eq!(exit.success(), Some(20));
    }

    #[test]
    fn callback_run_mode() {
        let (tx, rx) = mpsc::channel();
        runtime().run_callback(Effect::<_, Infallible>::succeed(7), move |exit| {
            tx.send(exit.success()).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(7));
    }

    #[test]
    fn typed_failures_surface_in_the_exit() {
        let exit: Exit<i32, String> = runtime().block_on(
            Effect::attempt(|| Err("boom".to_owned())),
        );
        assert_eq!(*exit.failure().unwrap(), "boom");
    }

    #[test]
    fn panics_become_defects() {
        let exit: Exit<i32, Infallible> =
            runtime().block_on(Effect::sync(|| panic!("kaboom")));
        let cause = exit.cause().unwrap();
        assert_eq!(cause.defects().len(), 1);
        assert!(cause.defects()[0].is_panic());
    }

    #[test]
    fn finalizer_runs_on_interrupt() {
        let flag = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&flag);
        let started = Arc::new(AtomicBool::new(false));
        let signal = Arc::clone(&started);

        let exit: Exit<(), Infallible> = runtime().block_on(
            never_signalling(signal)
                .ensuring(Effect::sync(move || observed.store(true, Ordering::SeqCst)))
                .fork()
                .flat_map(move |child| {
                    await_flag(started).flat_map(move |()| child.interrupt())
                }),
        );

        assert!(exit.is_success());
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn interrupted_child_exits_with_an_interrupt_cause() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&cleaned);
        let started = Arc::new(AtomicBool::new(false));
        let signal = Arc::clone(&started);

        let exit: Exit<Exit<(), Infallible>, Infallible> = runtime().block_on(
            never_signalling(signal)
                .ensuring(Effect::sync(move || observed.store(true, Ordering::SeqCst)))
                .fork()
                .flat_map(move |child| {
                    await_flag(started)
                        .flat_map(move |()| {
                            child.interrupt_fork().flat_map(move |()| child.await_())
                        })
                }),
        );

        let child_exit = exit.success().unwrap();
        assert!(child_exit.is_interrupted());
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn interrupt_as_attributes_the_given_fiber() {
        let started = Arc::new(AtomicBool::new(false));
        let signal = Arc::clone(&started);

        let exit: Exit<(FiberId, Exit<(), Infallible>), Infallible> = runtime().block_on(
            never_signalling(signal).fork().flat_map(move |child| {
                await_flag(started).flat_map(move |()| {
                    Effect::unit().fork().flat_map(move |bystander| {
                        let by = bystander.id();
                        child
                            .interrupt_as(by)
                            .flat_map(move |()| child.await_().map(move |exit| (by, exit)))
                    })
                })
            }),
        );

        let (by, child_exit) = exit.success().unwrap();
        assert!(child_exit.is_interrupted());
        assert_eq!(child_exit.cause().unwrap().interruptors(), vec![by]);
    }

    #[test]
    fn ensuring_runs_exactly_once_on_success_and_failure() {
        for fails in [false, true] {
            let runs = Arc::new(AtomicUsize::new(0));
            let counted = Arc::clone(&runs);
            let effect: Effect<i32, String> = if fails {
                Effect::fail("boom".to_owned())
            } else {
                Effect::succeed(3)
            };
            let exit = runtime().block_on(
                effect.ensuring(Effect::sync(move || {
                    counted.fetch_add(1, Ordering::SeqCst);
                })),
            );
            assert_eq!(exit.is_failure(), fails);
            assert_eq!(runs.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn interrupt_is_not_catchable_from_an_interruptible_region() {
        let caught = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&caught);

        let exit: Exit<Exit<(), String>, String> = runtime().block_on(
            Effect::<(), String>::never()
                .fold_cause(
                    move |_cause| {
                        observed.store(true, Ordering::SeqCst);
                        Effect::unit()
                    },
                    |()| Effect::unit(),
                )
                .fork()
                .flat_map(|child| {
                    child
                        .interrupt_fork()
                        .widen_err::<String>()
                        .flat_map(move |()| child.await_().widen_err::<String>())
                }),
        );

        let child_exit = exit.success().unwrap();
        assert!(child_exit.is_interrupted());
        assert!(!caught.load(Ordering::SeqCst));
    }

    #[test]
    fn uninterruptible_fold_observes_the_interrupt() {
        let started = Arc::new(AtomicBool::new(false));
        let signal = Arc::clone(&started);

        let exit: Exit<Exit<&'static str, Infallible>, Infallible> = runtime().block_on(
            never_signalling(signal)
                .map(|()| "unreachable")
                .interruptible()
                .fold_cause(
                    |cause| {
                        Effect::succeed(if cause.is_interrupted() {
                            "interrupted"
                        } else {
                            "other"
                        })
                    },
                    Effect::succeed,
                )
                .uninterruptible()
                .fork()
                .flat_map(move |child| {
                    await_flag(started).flat_map(move |()| {
                        child.interrupt_fork().flat_map(move |()| child.await_())
                    })
                }),
        );

        let child_exit = exit.success().unwrap();
        assert_eq!(child_exit.success(), Some("interrupted"));
    }

    #[test]
    fn bracket_releases_iff_acquire_succeeded() {
        // successful acquire: release must run exactly once
        let released = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&released);
        let exit: Exit<i32, String> = runtime().block_on(Effect::succeed(21).bracket(
            move |_r| {
                Effect::sync(move || {
                    counted.fetch_add(1, Ordering::SeqCst);
                })
            },
            |r| Effect::succeed(*r * 2),
        ));
        assert_eq!(exit.success(), Some(42));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        // failed use: release still runs exactly once
        let released = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&released);
        let exit: Exit<i32, String> = runtime().block_on(Effect::succeed(21).bracket(
            move |_r| {
                Effect::sync(move || {
                    counted.fetch_add(1, Ordering::SeqCst);
                })
            },
            |_r| Effect::fail("use failed".to_owned()),
        ));
        assert!(exit.is_failure());
        assert_eq!(released.load(Ordering::SeqCst), 1);

        // failed acquire: release must not run
        let released = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&released);
        let exit: Exit<i32, String> =
            runtime().block_on(Effect::<i32, String>::fail("no resource".to_owned()).bracket(
                move |_r| {
                    Effect::sync(move || {
                        counted.fetch_add(1, Ordering::SeqCst);
                    })
                },
                |r| Effect::succeed(*r),
            ));
        assert!(exit.is_failure());
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn race_on_a_virtual_clock_picks_the_fast_side() {
        let clock = Clock::virtual_();
        let platform = crate::platform::Platform::with_clock(clock.clone());
        let runtime = Runtime::with_platform(Arc::new(platform));

        let slow_finalized = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&slow_finalized);

        let fast = sleep::<Infallible>(Duration::from_millis(10)).map(|()| "fast");
        let slow = sleep::<Infallible>(Duration::from_secs(1))
            .map(|()| "slow")
            .ensuring(Effect::sync(move || observed.store(true, Ordering::SeqCst)));

        let (tx, rx) = mpsc::channel();
        runtime.run_callback(fast.race(slow), move |exit| {
            tx.send(exit).unwrap();
        });

        // wait for both sleepers to arm, then advance only past the fast
        // deadline
        std::thread::sleep(Duration::from_millis(200));
        clock.advance(Duration::from_millis(10));

        let exit: Exit<&str, Infallible> = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(exit.success(), Some("fast"));
        assert!(slow_finalized.load(Ordering::SeqCst));
    }

    #[test]
    fn timeout_interrupts_the_slow_side() {
        let exit: Exit<Option<i32>, Infallible> = runtime().block_on(
            Effect::<i32, Infallible>::never().timeout(Duration::from_millis(20)),
        );
        assert_eq!(exit.success(), Some(None));

        let exit: Exit<Option<i32>, Infallible> =
            runtime().block_on(Effect::succeed(5).timeout(Duration::from_secs(30)));
        assert_eq!(exit.success(), Some(Some(5)));
    }

    #[test]
    fn supervised_children_are_interrupted_at_parent_exit() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&cleaned);
        let started = Arc::new(AtomicBool::new(false));
        let signal = Arc::clone(&started);

        let exit: Exit<(), Infallible> = runtime().block_on(
            never_signalling(signal)
                .ensuring(Effect::sync(move || observed.store(true, Ordering::SeqCst)))
                .fork()
                .flat_map(move |_child| await_flag(started)),
        );

        assert!(exit.is_success());
        // the parent's exit awaited the child's finalizer
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn daemon_fibers_outlive_their_parent() {
        let runtime = runtime();
        let ran = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&ran);

        let exit: Exit<(), Infallible> = runtime.block_on(
            Effect::<(), Infallible>::yield_now()
                .zip_right(Effect::sync(move || observed.store(true, Ordering::SeqCst)))
                .fork_daemon()
                .flat_map(|_daemon| Effect::unit()),
        );
        assert!(exit.is_success());

        // the parent did not interrupt the daemon; it finishes on its own
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !ran.load(Ordering::SeqCst) {
            assert!(std::time::Instant::now() < deadline, "daemon never ran");
            std::thread::yield_now();
        }
    }

    #[test]
    fn disown_detaches_a_supervised_child() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&cleaned);

        let exit: Exit<bool, Infallible> = runtime().block_on(
            Effect::<(), Infallible>::never()
                .ensuring(Effect::sync(move || observed.store(true, Ordering::SeqCst)))
                .fork()
                .flat_map(|child| Effect::disown(&child)),
        );

        // the fiber owned its child, and exiting did not interrupt it
        assert_eq!(exit.success(), Some(true));
        assert!(!cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn environment_is_ambient() {
        #[derive(Debug)]
        struct Config {
            greeting: &'static str,
        }

        let runtime = runtime().with_environment(Config { greeting: "hello" });
        let exit: Exit<&'static str, Infallible> =
            runtime.block_on(Effect::access(|config: Arc<Config>| {
                Effect::succeed(config.greeting)
            }));
        assert_eq!(exit.success(), Some("hello"));

        // provide overrides the ambient environment for the inner region
        let exit: Exit<&'static str, Infallible> = runtime.block_on(
            Effect::access(|config: Arc<Config>| Effect::succeed(config.greeting))
                .provide(Config { greeting: "inner" }),
        );
        assert_eq!(exit.success(), Some("inner"));
    }

    #[test]
    fn on_executor_moves_the_region_to_the_blocking_pool() {
        let runtime = runtime();
        let blocking = Arc::clone(runtime.platform().executor_sync());

        let thread_names = |_: ()| {
            Effect::<_, Infallible>::sync(|| {
                std::thread::current()
                    .name()
                    .unwrap_or_default()
                    .to_owned()
            })
        };

        let exit: Exit<(String, String), Infallible> = runtime.block_on(
            thread_names(())
                .on_executor(blocking)
                .flat_map(move |inside| thread_names(()).map(move |after| (inside, after))),
        );

        let (inside, after) = exit.success().unwrap();
        assert!(inside.starts_with("efx-blocking"), "ran on {inside}");
        assert!(after.starts_with("efx-async"), "returned to {after}");
    }

    #[test]
    fn unobserved_failures_reach_the_failure_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let platform = crate::platform::Platform::new().with_failure_sink(move |cause| {
            sink.lock().unwrap().push(format!("{cause:?}"));
        });
        let runtime = Runtime::with_platform(Arc::new(platform));

        let exit: Exit<(), String> = runtime.block_on(
            Effect::<(), String>::fail("lost".to_owned())
                .fork_daemon()
                .flat_map(|_daemon| Effect::unit()),
        );
        assert!(exit.is_success());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "failure sink never saw the daemon's failure"
            );
            std::thread::yield_now();
        }
        assert!(seen.lock().unwrap()[0].contains("lost"));
    }

    #[test]
    fn yield_op_count_lets_fibers_share_one_worker() {
        // one worker, tiny budget: a long spinning fiber must still let a
        // second fiber run between its slices
        let platform = crate::platform::Platform::new()
            .with_executor_async(Arc::new(ThreadPool::new("efx-async", 1)))
            .with_yield_op_count(16);
        let runtime = Runtime::with_platform(Arc::new(platform));

        fn spin(n: u32) -> Effect<(), Infallible> {
            if n == 0 {
                Effect::unit()
            } else {
                Effect::suspend(move || spin(n - 1))
            }
        }

        let (tx, rx) = mpsc::channel();
        runtime.run_callback(spin(10_000), move |_| {});
        runtime.run_callback(Effect::<_, Infallible>::succeed(1), move |exit| {
            tx.send(exit.success()).unwrap();
        });

        // without cooperative yielding the single worker would be pinned by
        // the spinner for its whole run
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(1));
    }

    #[test]
    fn race_ties_prefer_the_left_side() {
        // one worker makes the tie exact: both sides complete before either
        // observer runs, and the left observer was queued first
        let platform = crate::platform::Platform::new()
            .with_executor_async(Arc::new(ThreadPool::new("efx-async", 1)));
        let runtime = Runtime::with_platform(Arc::new(platform));

        let exit: Exit<&'static str, Infallible> = runtime.block_on(
            Effect::succeed("left").race(Effect::succeed("right")),
        );
        assert_eq!(exit.success(), Some("left"));
    }

    #[test]
    fn race_failure_defers_to_the_other_side() {
        let exit: Exit<&'static str, String> = runtime().block_on(
            Effect::fail("fast failure".to_owned()).race(
                sleep::<String>(Duration::from_millis(10)).map(|()| "slow success"),
            ),
        );
        assert_eq!(exit.success(), Some("slow success"));

        let exit: Exit<&'static str, String> = runtime().block_on(
            Effect::<&'static str, String>::fail("left".to_owned())
                .race(Effect::fail("right".to_owned())),
        );
        let cause = exit.cause().unwrap();
        assert_eq!(cause.failures().len(), 2);
    }

    #[test]
    fn disconnected_interruption_does_not_wait_for_finalization() {
        let runtime = runtime();
        let exit: Exit<(), Infallible> = runtime.block_on(
            Effect::<(), Infallible>::never()
                .disconnect()
                .timeout(Duration::from_millis(20))
                .map(|_| ()),
        );
        assert!(exit.is_success());
    }

    #[test]
    fn descriptor_reports_identity_and_interruptibility() {
        let exit: Exit<(bool, bool), Infallible> = runtime().block_on(
            Effect::descriptor_with(|outer| {
                Effect::descriptor_with(move |inner| {
                    Effect::succeed((outer.is_interruptible(), inner.is_interruptible()))
                })
                .uninterruptible()
            }),
        );
        assert_eq!(exit.success(), Some((true, false)));
    }
}
