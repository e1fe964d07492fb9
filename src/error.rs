//! Error types and the failure-aggregation policy.
//!
//! The whole runtime reports failures through one [`Error`] enum:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Cancellation is the runtime's own signal and is never shown to user
//!   error callbacks; it wraps the originating cause and is stripped when a
//!   failure escapes the scope that was cancelled
//! - Independent failures are preserved with [`Error::Multiple`], which is
//!   flattened at construction and therefore never nested
//!
//! Cause identity matters: stripping `Cancelled` must hand back *the*
//! original failure, not a lookalike. User payloads are stored behind `Rc`
//! so clones of an error share identity, and [`Error::same`] compares by
//! pointer rather than by message.

use std::fmt::Write as _;
use std::rc::Rc;
use thiserror::Error as ThisError;

/// A specialized `Result` for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

fn format_list(errors: &[Error]) -> String {
    let mut out = String::new();
    for (i, e) in errors.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        let _ = write!(out, "{e}");
    }
    out
}

/// The failure value raised by fibres, switches, and combinators.
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// A cancellation context containing the fibre was cancelled; the payload
    /// is the originating failure.
    #[error("cancelled: {0}")]
    Cancelled(Rc<Error>),

    /// Operation attempted on a switch (or context) whose scope is over.
    #[error("switch finished")]
    SwitchFinished,

    /// Two or more independent failures. Never nested: the constructor
    /// flattens aggregates of aggregates.
    #[error("multiple failures: [{}]", format_list(.0))]
    Multiple(Vec<Error>),

    /// Sentinel used to cancel the losers of a race. Does not escape the
    /// combinator that created it.
    #[error("not first")]
    NotFirst,

    /// The event loop found no runnable fibre while the main fibre had not
    /// returned.
    #[error("deadlock detected: no runnable fibre and the main fibre has not returned")]
    Deadlocked,

    /// A user failure carrying only a message.
    #[error("{0}")]
    Msg(Rc<str>),

    /// A user failure wrapping an arbitrary error value.
    #[error("{0}")]
    Other(Rc<dyn std::error::Error + 'static>),
}

impl Error {
    /// Creates a user failure from a message.
    #[must_use]
    pub fn msg(text: impl Into<String>) -> Self {
        Self::Msg(Rc::from(text.into().into_boxed_str()))
    }

    /// Wraps an arbitrary error value as a user failure.
    #[must_use]
    pub fn other(source: impl std::error::Error + 'static) -> Self {
        Self::Other(Rc::new(source))
    }

    /// Wraps `cause` as a cancellation signal. A cause that is already a
    /// cancellation is not wrapped again.
    #[must_use]
    pub fn cancelled(cause: &Self) -> Self {
        match cause {
            Self::Cancelled(_) => cause.clone(),
            other => Self::Cancelled(Rc::new(other.clone())),
        }
    }

    /// Aggregates independent failures, flattening any nested aggregates.
    ///
    /// # Panics
    ///
    /// Panics on an empty list; callers always have at least one failure in
    /// hand when they aggregate.
    #[must_use]
    pub fn multiple(errors: Vec<Self>) -> Self {
        let mut flat = Vec::with_capacity(errors.len());
        for e in errors {
            match e {
                Self::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => unreachable!("aggregated zero failures"),
            1 => flat.pop().expect("len checked"),
            _ => Self::Multiple(flat),
        }
    }

    /// True if this is a cancellation signal.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// True if this is the race-loser sentinel.
    #[must_use]
    pub const fn is_not_first(&self) -> bool {
        matches!(self, Self::NotFirst)
    }

    /// True if this reports an operation on a finished switch.
    #[must_use]
    pub const fn is_switch_finished(&self) -> bool {
        matches!(self, Self::SwitchFinished)
    }

    /// The originating cause when this is a cancellation signal.
    #[must_use]
    pub fn cancel_cause(&self) -> Option<&Self> {
        match self {
            Self::Cancelled(cause) => Some(cause),
            _ => None,
        }
    }

    /// Removes one layer of cancellation wrapping, if present.
    ///
    /// Used when a failure escapes the context that was cancelled: handlers
    /// outside that context observe the cause directly.
    #[must_use]
    pub fn strip_cancelled(self) -> Self {
        match self {
            Self::Cancelled(cause) => (*cause).clone(),
            other => other,
        }
    }

    /// Borrowing variant of [`Error::strip_cancelled`].
    #[must_use]
    pub fn unwrapped(&self) -> &Self {
        match self {
            Self::Cancelled(cause) => cause,
            other => other,
        }
    }

    /// Identity comparison: true when both values denote the *same* failure,
    /// not merely equal-looking ones. User payloads compare by pointer;
    /// aggregates are never the same failure.
    #[must_use]
    pub fn same(a: &Self, b: &Self) -> bool {
        match (a, b) {
            (Self::Cancelled(x), Self::Cancelled(y)) => Rc::ptr_eq(x, y) || Self::same(x, y),
            (Self::SwitchFinished, Self::SwitchFinished)
            | (Self::NotFirst, Self::NotFirst)
            | (Self::Deadlocked, Self::Deadlocked) => true,
            (Self::Msg(x), Self::Msg(y)) => Rc::ptr_eq(x, y),
            (Self::Other(x), Self::Other(y)) => Rc::ptr_eq(x, y),
            _ => false,
        }
    }

    /// Combines a newly observed failure into an already stored one.
    ///
    /// Policy: a real failure beats a cancellation signal; among
    /// cancellation signals the most recent wins; two distinct real failures
    /// become an aggregate (flattened).
    #[must_use]
    pub fn combine(self, new: Self) -> Self {
        match (self.is_cancelled(), new.is_cancelled()) {
            (false, true) => self,
            (true, _) => new,
            (false, false) => {
                if Self::same(&self, &new) {
                    self
                } else {
                    Self::multiple(vec![self, new])
                }
            }
        }
    }
}
