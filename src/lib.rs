// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lightweight effect runtime.
//!
//! `efx` executes composable, pure descriptions of effectful programs
//! ([`Effect`] values) over a pool of user-space tasks ([`Fiber`]s)
//! multiplexed onto a small set of operating-system threads. Effects encode
//! success values, typed failures, asynchronous suspension, forking,
//! resource-safe acquisition and release, cooperative interruption, and
//! access to an ambient environment; the interpreter evaluates them with
//! structured concurrency, fine-grained interruption and deterministic
//! finalization.
//!
//! ```
//! use efx::{Effect, Runtime};
//!
//! let runtime = Runtime::new();
//! let exit = runtime.block_on(
//!     Effect::<i32>::succeed(1)
//!         .flat_map(|x| Effect::succeed(x + 1))
//!         .map(|x| x * 10),
//! );
//! assert_eq!(exit.success(), Some(20));
//! ```
//!
//! The building blocks, leaves first:
//!
//! - [`executor`]: the thread pools fiber slices run on.
//! - [`cause`] / [`exit`]: composable failure trees and terminal results.
//! - [`effect`]: the effect algebra and its typed surface.
//! - [`fiber`]: the interpreter, fiber handles, supervision.
//! - [`sync`]: [`Ref`], [`Promise`], and the bounded [`Queue`].
//! - [`stm`]: transactional variables with an atomic commit loop.
//! - [`time`]: clocks (monotonic and virtual) and [`sleep`].
//! - [`platform`] / [`runtime`]: configuration and the two run modes.

mod loom;
mod util;

pub mod cause;
pub mod effect;
pub mod executor;
pub mod exit;
pub mod fiber;
pub mod platform;
pub mod runtime;
pub mod stm;
pub mod sync;
pub mod time;

pub use cause::{Cause, Defect, Failure, Squashed};
pub use effect::{Callback, Effect};
pub use executor::{BlockingPool, Executor, Task, ThreadPool};
pub use exit::Exit;
pub use fiber::{Fiber, FiberDescriptor, FiberId, Supervision};
pub use platform::Platform;
pub use runtime::Runtime;
pub use stm::{Stm, TVar, atomically};
pub use sync::{Promise, Queue, Ref};
pub use time::{Clock, sleep};
