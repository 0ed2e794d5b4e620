// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Concurrency structures built on the runtime: atomic cells, one-shot
//! promises, and the asynchronous bounded queue.

mod cell;
mod promise;
mod queue;

pub use cell::Ref;
pub use promise::Promise;
pub use queue::Queue;
