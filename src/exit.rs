// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Terminal results of evaluating an effect.

use crate::cause::Cause;
use std::sync::Arc;

/// The terminal value of a fiber: a success or a full [`Cause`] tree.
pub enum Exit<A, E: ?Sized> {
    Success(A),
    Failure(Cause<E>),
}

// === impl Exit ===

impl<A, E: ?Sized> Exit<A, E> {
    /// Builds an exit from a plain result.
    pub fn from_result(result: Result<A, E>) -> Self
    where
        E: Sized,
    {
        match result {
            Ok(a) => Self::Success(a),
            Err(e) => Self::Failure(Cause::fail(e)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// `true` if the exit is a failure containing at least one interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Success(_) => false,
            Self::Failure(cause) => cause.is_interrupted(),
        }
    }

    pub fn success(self) -> Option<A> {
        match self {
            Self::Success(a) => Some(a),
            Self::Failure(_) => None,
        }
    }

    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Self::Success(_) => None,
            Self::Failure(cause) => Some(cause),
        }
    }

    /// The first typed failure, if the exit failed with one.
    pub fn failure(&self) -> Option<Arc<E>> {
        match self {
            Self::Success(_) => None,
            Self::Failure(cause) => cause.clone().failure_or_cause().ok(),
        }
    }

    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Self::Success(a) => Exit::Success(f(a)),
            Self::Failure(cause) => Exit::Failure(cause),
        }
    }

    pub fn map_cause<E2: ?Sized>(self, f: impl FnOnce(Cause<E>) -> Cause<E2>) -> Exit<A, E2> {
        match self {
            Self::Success(a) => Exit::Success(a),
            Self::Failure(cause) => Exit::Failure(f(cause)),
        }
    }

    /// Collapses a nested exit. A success of a success is a success; any
    /// failure layer propagates outward.
    pub fn flatten(nested: Exit<Exit<A, E>, E>) -> Exit<A, E> {
        match nested {
            Exit::Success(inner) => inner,
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Converts into a result, losing everything but the first typed failure.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Self::Success(a) => Ok(a),
            Self::Failure(cause) => Err(cause),
        }
    }
}

impl<A: Clone, E: ?Sized> Clone for Exit<A, E> {
    fn clone(&self) -> Self {
        match self {
            Self::Success(a) => Self::Success(a.clone()),
            Self::Failure(cause) => Self::Failure(cause.clone()),
        }
    }
}

impl<A: core::fmt::Debug, E: core::fmt::Debug + ?Sized> core::fmt::Debug for Exit<A, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Success(a) => f.debug_tuple("Success").field(a).finish(),
            Self::Failure(cause) => f.debug_tuple("Failure").field(cause).finish(),
        }
    }
}

impl<A: PartialEq, E: PartialEq + ?Sized> PartialEq for Exit<A, E> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Success(l), Self::Success(r)) => l == r,
            (Self::Failure(l), Self::Failure(r)) => l == r,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_collapses_success_layers() {
        let nested: Exit<Exit<u32, &str>, &str> = Exit::Success(Exit::Success(1));
        assert_eq!(Exit::flatten(nested), Exit::Success(1));

        let nested: Exit<Exit<u32, &str>, &str> = Exit::Success(Exit::Failure(Cause::fail("in")));
        assert!(Exit::flatten(nested).is_failure());

        let nested: Exit<Exit<u32, &str>, &str> = Exit::Failure(Cause::fail("out"));
        let flat = Exit::flatten(nested);
        assert_eq!(*flat.failure().unwrap(), "out");
    }

    #[test]
    fn from_result_round_trips() {
        let ok: Exit<u32, &str> = Exit::from_result(Ok(2));
        assert_eq!(ok.success(), Some(2));

        let err: Exit<u32, &str> = Exit::from_result(Err("boom"));
        assert_eq!(*err.failure().unwrap(), "boom");
    }
}
