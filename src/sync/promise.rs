//! Write-once broadcast promises.
//!
//! A promise is a slot that is eventually fulfilled with a value or broken
//! with a failure. Any number of fibres may await it; resolving resumes all
//! of them in the order they started waiting. Values are `Clone` because
//! every awaiter receives one.
//!
//! Awaiting respects the waiting fibre's cancellation context; use
//! [`Promise::wait_result`] to wait out the resolution even under
//! cancellation (used for draining work that is already in flight).

use crate::error::{Error, Result};
use crate::fibre::{suspend, FibreCtx};
use crate::waiters::Waiters;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

enum State<T> {
    Waiting(Waiters<Result<T>>),
    Resolved(Result<T>),
}

struct Inner<T> {
    state: RefCell<State<T>>,
}

/// The reading half: await the eventual value.
pub struct Promise<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// The writing half: resolves the promise exactly once.
///
/// Consumed by [`Resolver::fulfill`] or [`Resolver::break_with`], so a
/// promise cannot be resolved twice.
pub struct Resolver<T> {
    inner: Rc<Inner<T>>,
}

impl<T: Clone + 'static> Promise<T> {
    /// Creates an unresolved promise and its resolver.
    #[must_use]
    pub fn create() -> (Self, Resolver<T>) {
        let inner = Rc::new(Inner {
            state: RefCell::new(State::Waiting(Waiters::new())),
        });
        (
            Self {
                inner: inner.clone(),
            },
            Resolver { inner },
        )
    }

    /// The resolution, if any, without waiting.
    #[must_use]
    pub fn try_get(&self) -> Option<Result<T>> {
        match &*self.inner.state.borrow() {
            State::Resolved(result) => Some(result.clone()),
            State::Waiting(_) => None,
        }
    }

    /// True once the promise has been fulfilled or broken.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(&*self.inner.state.borrow(), State::Resolved(_))
    }

    /// Waits for the resolution.
    ///
    /// # Errors
    ///
    /// The failure the promise was broken with, or the cancellation of the
    /// waiting fibre's context.
    pub async fn wait(&self) -> Result<T> {
        let fibre = FibreCtx::current().expect("promise awaited outside a fibre");
        fibre.check()?;
        if let Some(result) = self.try_get() {
            return result;
        }
        let inner = self.inner.clone();
        suspend::enter(move |fibre, resume| {
            let handle = {
                let mut state = inner.state.borrow_mut();
                match &mut *state {
                    State::Waiting(waiters) => {
                        let on_resolve = resume.clone();
                        waiters.add(move |result: &Result<T>| on_resolve.resume(result.clone()))
                    }
                    State::Resolved(result) => {
                        resume.resume(result.clone());
                        return;
                    }
                }
            };
            let inner = inner.clone();
            fibre.install_cancel_fn(move |cancelled| {
                if let State::Waiting(waiters) = &mut *inner.state.borrow_mut() {
                    waiters.remove(handle);
                }
                resume.resume(Err(cancelled));
            });
        })
        .await
    }

    /// Waits for the resolution, ignoring cancellation of the waiting fibre.
    ///
    /// # Errors
    ///
    /// Only the failure the promise was broken with.
    pub async fn wait_result(&self) -> Result<T> {
        let fibre = FibreCtx::current().expect("promise awaited outside a fibre");
        let _mask = fibre.mask();
        self.wait().await
    }
}

impl<T: Clone + 'static> Resolver<T> {
    /// Fulfils the promise with a value, resuming all awaiters in FIFO
    /// order.
    pub fn fulfill(self, value: T) {
        self.resolve(Ok(value));
    }

    /// Breaks the promise with a failure, resuming all awaiters in FIFO
    /// order.
    pub fn break_with(self, error: Error) {
        self.resolve(Err(error));
    }

    pub(crate) fn resolve(self, result: Result<T>) {
        let callbacks = {
            let mut state = self.inner.state.borrow_mut();
            match &mut *state {
                State::Waiting(waiters) => {
                    let callbacks = waiters.drain_oldest_first();
                    *state = State::Resolved(result.clone());
                    callbacks
                }
                State::Resolved(_) => unreachable!("promise resolved twice"),
            }
        };
        for callback in callbacks {
            callback(&result);
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.borrow() {
            State::Waiting(w) => format!("waiting({} awaiters)", w.len()),
            State::Resolved(Ok(_)) => "fulfilled".to_string(),
            State::Resolved(Err(e)) => format!("broken: {e}"),
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}
