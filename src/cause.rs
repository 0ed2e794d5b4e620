// Copyright 2025 The efx authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Composable failure trees.
//!
//! A [`Cause`] describes *everything* that went wrong while evaluating an
//! effect: typed failures from the error channel, defects (bugs surfaced as
//! panics or explicit [`die`]s), and interruptions, composed in parallel
//! ([`Cause::and`]) or in sequence ([`Cause::then`]).
//!
//! [`die`]: crate::effect::Effect::die

use crate::fiber::FiberId;
use core::any::Any;
use core::fmt;
use std::sync::Arc;

/// Marker for values that may travel on an effect's error channel.
///
/// Blanket-implemented for every `'static` type that is [`Debug`], [`Send`]
/// and [`Sync`]; you never implement this yourself.
///
/// [`Debug`]: fmt::Debug
pub trait Failure: Any + fmt::Debug + Send + Sync {
    #[doc(hidden)]
    fn as_any(&self) -> &(dyn Any + Send + Sync);
    #[doc(hidden)]
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + fmt::Debug + Send + Sync> Failure for T {
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// The erased failure payload the interpreter threads through fold frames.
pub(crate) type ErasedFailure = dyn Failure;

/// A [`Cause`] whose failure payloads are type-erased.
pub(crate) type ErasedCause = Cause<ErasedFailure>;

/// A composable tree describing why an effect stopped.
///
/// `Empty` is the identity for both composers; [`Cause::and`] and
/// [`Cause::then`] are associative. Failure payloads are stored behind [`Arc`]
/// so causes clone in O(tree) regardless of the payload type.
pub enum Cause<E: ?Sized> {
    /// Nothing went wrong. Identity element for both composers.
    Empty,
    /// A typed, recoverable failure from the error channel.
    Fail(Arc<E>),
    /// A defect: an unexpected panic or an explicit `die`.
    Die(Defect),
    /// Cooperative interruption, attributed to the interrupting fiber.
    Interrupt(FiberId),
    /// Two causes produced concurrently.
    Both(Box<Cause<E>>, Box<Cause<E>>),
    /// Two causes produced in sequence; the right one is a consequence of the
    /// left (e.g. a finalizer that itself failed).
    Then(Box<Cause<E>>, Box<Cause<E>>),
}

/// Outcome of [`Cause::squash_with`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Squashed<T> {
    /// The first defect in the tree.
    Defect(Defect),
    /// The first typed failure, mapped by the caller's function.
    Failure(T),
    /// The tree held nothing but interruptions (or was empty).
    Interrupted(Option<FiberId>),
}

// === impl Cause ===

impl<E: ?Sized> Cause<E> {
    /// Builds the cause for a typed failure.
    pub fn fail(error: E) -> Self
    where
        E: Sized,
    {
        Self::Fail(Arc::new(error))
    }

    /// Builds the cause for a defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Self::Die(defect.into())
    }

    /// Builds the cause for an interruption by `id`.
    pub fn interrupt(id: FiberId) -> Self {
        Self::Interrupt(id)
    }

    /// Parallel composition (`&&`). `Empty` operands are pruned.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::Empty, c) | (c, Self::Empty) => c,
            (l, r) => Self::Both(Box::new(l), Box::new(r)),
        }
    }

    /// Sequential composition (`++`). `Empty` operands are pruned.
    #[must_use]
    pub fn then(self, other: Self) -> Self {
        match (self, other) {
            (Self::Empty, c) | (c, Self::Empty) => c,
            (l, r) => Self::Then(Box::new(l), Box::new(r)),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// `true` if the tree contains at least one [`Cause::Interrupt`].
    pub fn is_interrupted(&self) -> bool {
        self.fold(false, &mut |acc, leaf| {
            acc || matches!(leaf, Leaf::Interrupt(_))
        })
    }

    /// `true` if the tree contains at least one interrupt and no typed
    /// failure or defect; this is the "cancelled, nothing else happened"
    /// predicate the failure sink uses.
    pub fn is_interrupted_only(&self) -> bool {
        let mut interrupted = false;
        let mut dirty = false;
        self.fold((), &mut |(), leaf| match leaf {
            Leaf::Interrupt(_) => interrupted = true,
            Leaf::Fail(_) | Leaf::Die(_) => dirty = true,
        });
        interrupted && !dirty
    }

    /// `true` if the tree contains at least one typed failure.
    pub fn is_failure(&self) -> bool {
        self.fold(false, &mut |acc, leaf| acc || matches!(leaf, Leaf::Fail(_)))
    }

    /// `true` if the tree contains at least one defect.
    pub fn is_die(&self) -> bool {
        self.fold(false, &mut |acc, leaf| acc || matches!(leaf, Leaf::Die(_)))
    }

    /// All typed failures in tree order.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.fold((), &mut |(), leaf| {
            if let Leaf::Fail(e) = leaf {
                out.push(&**e);
            }
        });
        out
    }

    /// All defects in tree order.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.fold((), &mut |(), leaf| {
            if let Leaf::Die(d) = leaf {
                out.push(d);
            }
        });
        out
    }

    /// The ids of every interrupting fiber, in tree order, deduplicated.
    pub fn interruptors(&self) -> Vec<FiberId> {
        let mut out = Vec::new();
        self.fold((), &mut |(), leaf| {
            if let Leaf::Interrupt(id) = leaf {
                if !out.contains(id) {
                    out.push(*id);
                }
            }
        });
        out
    }

    /// Removes every interruption from the tree.
    ///
    /// Returns `Some` iff the tree contains at least one typed failure or
    /// defect; a tree of pure interruptions strips to `None`.
    #[must_use]
    pub fn stripped(self) -> Option<Self> {
        match self {
            Self::Empty | Self::Interrupt(_) => None,
            c @ (Self::Fail(_) | Self::Die(_)) => Some(c),
            Self::Both(l, r) => match (l.stripped(), r.stripped()) {
                (Some(l), Some(r)) => Some(l.and(r)),
                (Some(c), None) | (None, Some(c)) => Some(c),
                (None, None) => None,
            },
            Self::Then(l, r) => match (l.stripped(), r.stripped()) {
                (Some(l), Some(r)) => Some(l.then(r)),
                (Some(c), None) | (None, Some(c)) => Some(c),
                (None, None) => None,
            },
        }
    }

    /// Returns the first typed failure, or the whole cause if there is none.
    pub fn failure_or_cause(self) -> Result<Arc<E>, Self> {
        fn first<E: ?Sized>(cause: &Cause<E>) -> Option<Arc<E>> {
            match cause {
                Cause::Fail(e) => Some(e.clone()),
                Cause::Both(l, r) | Cause::Then(l, r) => first(l).or_else(|| first(r)),
                _ => None,
            }
        }
        match first(&self) {
            Some(e) => Ok(e),
            None => Err(self),
        }
    }

    /// Collapses the tree into a single error-ish value: the first defect if
    /// any, else the first typed failure mapped through `f`, else the fact
    /// that the effect was (only) interrupted.
    pub fn squash_with<T>(&self, f: impl FnOnce(&E) -> T) -> Squashed<T> {
        let mut defect = None;
        let mut failure = None;
        let mut interruptor = None;
        self.fold((), &mut |(), leaf| match leaf {
            Leaf::Die(d) => {
                if defect.is_none() {
                    defect = Some(d.clone());
                }
            }
            Leaf::Fail(e) => {
                if failure.is_none() {
                    failure = Some(e.clone());
                }
            }
            Leaf::Interrupt(id) => {
                if interruptor.is_none() {
                    interruptor = Some(*id);
                }
            }
        });
        if let Some(d) = defect {
            Squashed::Defect(d)
        } else if let Some(e) = failure {
            Squashed::Failure(f(e.as_ref()))
        } else {
            Squashed::Interrupted(interruptor)
        }
    }

    /// Maps every failure payload, preserving the tree shape.
    #[must_use]
    pub fn map_failures<E2: ?Sized>(self, f: &mut impl FnMut(Arc<E>) -> Arc<E2>) -> Cause<E2> {
        match self {
            Self::Empty => Cause::Empty,
            Self::Fail(e) => Cause::Fail(f(e)),
            Self::Die(d) => Cause::Die(d),
            Self::Interrupt(id) => Cause::Interrupt(id),
            Self::Both(l, r) => Cause::Both(
                Box::new(l.map_failures(f)),
                Box::new(r.map_failures(f)),
            ),
            Self::Then(l, r) => Cause::Then(
                Box::new(l.map_failures(f)),
                Box::new(r.map_failures(f)),
            ),
        }
    }

    fn fold<'a, T>(&'a self, init: T, step: &mut impl FnMut(T, Leaf<'a, E>) -> T) -> T
    where
        T: Copy,
    {
        let mut acc = init;
        self.visit(&mut |leaf| acc = step(acc, leaf));
        acc
    }

    fn visit<'a>(&'a self, visit: &mut impl FnMut(Leaf<'a, E>)) {
        match self {
            Self::Empty => {}
            Self::Fail(e) => visit(Leaf::Fail(e)),
            Self::Die(d) => visit(Leaf::Die(d)),
            Self::Interrupt(id) => visit(Leaf::Interrupt(id)),
            Self::Both(l, r) | Self::Then(l, r) => {
                l.visit(visit);
                r.visit(visit);
            }
        }
    }
}

impl Cause<ErasedFailure> {
    /// Recovers the typed view of an erased cause.
    ///
    /// A payload of an unexpected type is converted into a defect instead of
    /// being dropped; the interpreter's typed boundary guarantees this path
    /// stays dead.
    pub(crate) fn into_typed<E: Failure>(self) -> Cause<E> {
        self.map_failures(&mut |payload| match payload.into_any_arc().downcast::<E>() {
            Ok(e) => e,
            Err(other) => {
                return_mismatch(other);
            }
        })
    }
}

fn return_mismatch(payload: Arc<dyn Any + Send + Sync>) -> ! {
    unreachable!(
        "error channel payload has an unexpected type (type id {:?}), this is a bug",
        (*payload).type_id()
    )
}

impl<E: Failure> Cause<E> {
    /// Erases the failure payload type.
    pub(crate) fn into_erased(self) -> ErasedCause {
        self.map_failures(&mut |e| e as Arc<ErasedFailure>)
    }
}

impl Cause<core::convert::Infallible> {
    /// Re-types a cause that, by construction, cannot contain typed
    /// failures.
    pub fn widen<E: ?Sized>(self) -> Cause<E> {
        self.map_failures(&mut |never| {
            let never: &core::convert::Infallible = &never;
            match *never {}
        })
    }
}

impl<E: ?Sized> Clone for Cause<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Empty => Self::Empty,
            Self::Fail(e) => Self::Fail(e.clone()),
            Self::Die(d) => Self::Die(d.clone()),
            Self::Interrupt(id) => Self::Interrupt(*id),
            Self::Both(l, r) => Self::Both(l.clone(), r.clone()),
            Self::Then(l, r) => Self::Then(l.clone(), r.clone()),
        }
    }
}

impl<E: fmt::Debug + ?Sized> fmt::Debug for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Fail(e) => f.debug_tuple("Fail").field(e).finish(),
            Self::Die(d) => f.debug_tuple("Die").field(d).finish(),
            Self::Interrupt(id) => f.debug_tuple("Interrupt").field(id).finish(),
            Self::Both(l, r) => f.debug_tuple("Both").field(l).field(r).finish(),
            Self::Then(l, r) => f.debug_tuple("Then").field(l).field(r).finish(),
        }
    }
}

impl<E: PartialEq + ?Sized> PartialEq for Cause<E> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Empty, Self::Empty) => true,
            (Self::Fail(l), Self::Fail(r)) => l == r,
            (Self::Die(l), Self::Die(r)) => l == r,
            (Self::Interrupt(l), Self::Interrupt(r)) => l == r,
            (Self::Both(ll, lr), Self::Both(rl, rr))
            | (Self::Then(ll, lr), Self::Then(rl, rr)) => ll == rl && lr == rr,
            _ => false,
        }
    }
}

enum Leaf<'a, E: ?Sized> {
    Fail(&'a Arc<E>),
    Die(&'a Defect),
    Interrupt(&'a FiberId),
}

// === impl Defect ===

/// An unexpected error: a caught panic, or a value passed to `die`.
///
/// Defects are not part of any effect's typed error channel; they propagate
/// until observed through a whole-cause handler.
#[derive(Clone)]
pub struct Defect(Arc<DefectRepr>);

enum DefectRepr {
    /// A panic payload, rendered at the catch site (panic payloads are not
    /// `Sync` and cannot be retained as-is).
    Panic(String),
    /// An explicit `die` value.
    Value(Arc<ErasedFailure>),
}

impl Defect {
    pub fn new(value: impl Failure) -> Self {
        Self(Arc::new(DefectRepr::Value(Arc::new(value))))
    }

    /// Renders a caught panic payload into a defect.
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panicked with a non-string payload".to_owned()
        };
        Self(Arc::new(DefectRepr::Panic(message)))
    }

    /// `true` if this defect was produced by a caught panic.
    pub fn is_panic(&self) -> bool {
        matches!(&*self.0, DefectRepr::Panic(_))
    }

    /// Downcasts an explicit `die` payload.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match &*self.0 {
            DefectRepr::Value(v) => v.as_any().downcast_ref::<T>(),
            DefectRepr::Panic(_) => None,
        }
    }
}

impl From<&str> for Defect {
    fn from(message: &str) -> Self {
        Self::new(message.to_owned())
    }
}

impl From<String> for Defect {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            DefectRepr::Panic(msg) => f.debug_tuple("Panic").field(msg).finish(),
            DefectRepr::Value(v) => fmt::Debug::fmt(v, f),
        }
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            DefectRepr::Panic(msg) => write!(f, "panic: {msg}"),
            DefectRepr::Value(v) => write!(f, "{v:?}"),
        }
    }
}

impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Defect {}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> FiberId {
        FiberId::from_u64(n)
    }

    #[test]
    fn empty_is_identity_for_both_composers() {
        let c: Cause<&str> = Cause::fail("boom");
        assert_eq!(c.clone().and(Cause::Empty), c);
        assert_eq!(Cause::Empty.and(c.clone()), c);
        assert_eq!(c.clone().then(Cause::Empty), c);
        assert_eq!(Cause::Empty.then(c.clone()), c);
    }

    #[test]
    fn composers_are_associative() {
        let a = || Cause::<&str>::fail("a");
        let b = || Cause::<&str>::fail("b");
        let c = || Cause::<&str>::fail("c");

        let left = a().and(b()).and(c());
        let right = a().and(b().and(c()));
        assert_eq!(left.failures(), right.failures());

        let left = a().then(b()).then(c());
        let right = a().then(b().then(c()));
        assert_eq!(left.failures(), right.failures());
    }

    #[test]
    fn collections_are_in_tree_order() {
        let cause = Cause::<&str>::fail("first")
            .and(Cause::die("bug"))
            .then(Cause::fail("second").and(Cause::interrupt(id(7))));

        assert_eq!(cause.failures(), vec![&"first", &"second"]);
        assert_eq!(cause.defects().len(), 1);
        assert_eq!(cause.interruptors(), vec![id(7)]);
    }

    #[test]
    fn interrupted_only_requires_a_clean_tree() {
        let pure = Cause::<&str>::interrupt(id(1)).and(Cause::interrupt(id(2)));
        assert!(pure.is_interrupted());
        assert!(pure.is_interrupted_only());

        let dirty = Cause::<&str>::interrupt(id(1)).and(Cause::fail("boom"));
        assert!(dirty.is_interrupted());
        assert!(!dirty.is_interrupted_only());

        assert!(!Cause::<&str>::Empty.is_interrupted_only());
    }

    #[test]
    fn stripped_keeps_failures_and_defects() {
        let cause = Cause::<&str>::interrupt(id(1))
            .and(Cause::fail("boom"))
            .then(Cause::interrupt(id(2)));

        let stripped = cause.stripped().unwrap();
        assert_eq!(stripped.failures(), vec![&"boom"]);
        assert!(stripped.interruptors().is_empty());

        assert!(Cause::<&str>::interrupt(id(1)).stripped().is_none());
        assert!(Cause::<&str>::Empty.stripped().is_none());
    }

    #[test]
    fn failure_or_cause_picks_the_first_failure() {
        let cause = Cause::<&str>::die("bug").and(Cause::fail("boom"));
        assert_eq!(*cause.failure_or_cause().unwrap(), "boom");

        let cause = Cause::<&str>::die("bug").and(Cause::interrupt(id(1)));
        assert!(cause.failure_or_cause().is_err());
    }

    #[test]
    fn squash_prefers_defects() {
        let cause = Cause::<&str>::fail("boom").and(Cause::die("bug"));
        assert!(matches!(cause.squash_with(|e| *e), Squashed::Defect(_)));

        let cause = Cause::<&str>::interrupt(id(1)).and(Cause::fail("boom"));
        assert_eq!(cause.squash_with(|e| *e), Squashed::Failure("boom"));

        let cause = Cause::<&str>::interrupt(id(1));
        assert_eq!(
            cause.squash_with(|e| *e),
            Squashed::Interrupted(Some(id(1)))
        );
    }

    #[test]
    fn erase_then_type_round_trips() {
        let cause: Cause<String> = Cause::fail("boom".to_owned()).and(Cause::interrupt(id(3)));
        let round: Cause<String> = cause.clone().into_erased().into_typed();
        assert_eq!(round.failures(), cause.failures());
        assert_eq!(round.interruptors(), cause.interruptors());
    }

    #[test]
    fn panic_defects_render_their_message() {
        let payload: Box<dyn Any + Send> = Box::new("kaboom");
        let defect = Defect::from_panic(&*payload);
        assert!(defect.is_panic());
        assert_eq!(defect.to_string(), "panic: kaboom");
    }
}
