// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::cause::Failure;
use crate::effect::{Callback, Effect};
use std::time::Duration;

/// Suspends the current fiber until `duration` has elapsed on the platform
/// clock.
///
/// Two sleeps started at the same instant resume in deadline order as
/// observed by the platform's monotonic clock, ties in registration order.
/// An interrupted sleeper resumes immediately with its interrupt cause; its
/// timer entry later fires into a stale suspension epoch and is discarded.
pub fn sleep<E: Failure>(duration: Duration) -> Effect<(), E> {
    Effect::descriptor_with(move |descriptor| {
        Effect::async_(move |callback: Callback<(), E>| {
            descriptor.platform.timer().schedule(
                duration,
                Box::new(move || {
                    callback.succeed(());
                }),
            );
            None
        })
    })
}
