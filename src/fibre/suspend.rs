//! The suspend bridge.
//!
//! [`enter`] is the one place a fibre parks: the closure runs synchronously
//! in the suspending fibre's frame, receives the fibre handle plus a
//! [`Resume`] token, and typically installs a cancel callback or registers
//! the token in a waiter list. The fibre then stays parked until some
//! producer calls [`Resume::resume`]; the first call wins and later calls
//! are ignored.
//!
//! Resuming goes through the run queue even when the closure resumes
//! immediately, so a resumed fibre always runs behind the runnables that
//! were already queued.

use crate::error::Result;
use crate::fibre::FibreCtx;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

struct Shared<T> {
    fired: Cell<bool>,
    result: RefCell<Option<Result<T>>>,
    waker: RefCell<Option<Waker>>,
}

/// One-shot token that resumes a suspended fibre.
///
/// Clones share the shot: whichever clone fires first delivers its value,
/// the rest are no-ops.
pub struct Resume<T> {
    shared: Rc<Shared<T>>,
}

impl<T> Clone for Resume<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Resume<T> {
    /// Delivers `result` and re-enqueues the fibre. Ignored if the fibre was
    /// already resumed.
    pub fn resume(&self, result: Result<T>) {
        if self.shared.fired.replace(true) {
            return;
        }
        *self.shared.result.borrow_mut() = Some(result);
        if let Some(waker) = self.shared.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

enum EnterState<T, F> {
    /// Not yet suspended; holds the closure to run on first poll.
    Ready(F),
    /// Parked; waiting for the resume token to fire.
    Suspended(Rc<Shared<T>>),
    Done,
}

/// Future returned by [`enter`].
pub struct Enter<T, F> {
    state: EnterState<T, F>,
}

// No field is structurally pinned; state is moved only through &mut.
impl<T, F> Unpin for Enter<T, F> {}

/// Suspends the current fibre, handing `f` the means to resume it.
///
/// `f` runs synchronously before the fibre parks. When the fibre resumes,
/// its cancel-callback slot is cleared and the delivered result is returned
/// (value, failure, or the cancellation that interrupted the wait).
///
/// # Panics
///
/// Panics if polled outside a fibre.
pub fn enter<T, F>(f: F) -> Enter<T, F>
where
    F: FnOnce(&FibreCtx, Resume<T>),
{
    Enter {
        state: EnterState::Ready(f),
    }
}

impl<T, F> Future for Enter<T, F>
where
    F: FnOnce(&FibreCtx, Resume<T>),
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, EnterState::Done) {
            EnterState::Ready(f) => {
                let fibre = FibreCtx::current().expect("suspended outside a fibre");
                let shared = Rc::new(Shared {
                    fired: Cell::new(false),
                    result: RefCell::new(None),
                    waker: RefCell::new(Some(cx.waker().clone())),
                });
                f(
                    &fibre,
                    Resume {
                        shared: shared.clone(),
                    },
                );
                this.state = EnterState::Suspended(shared);
                // Park even when resumed synchronously: the wake-up travels
                // through the run queue, preserving FIFO dispatch.
                Poll::Pending
            }
            EnterState::Suspended(shared) => {
                let taken = shared.result.borrow_mut().take();
                match taken {
                    Some(result) => {
                        let fibre = FibreCtx::current().expect("resumed outside a fibre");
                        drop(fibre.take_cancel_fn());
                        Poll::Ready(result)
                    }
                    None => {
                        *shared.waker.borrow_mut() = Some(cx.waker().clone());
                        this.state = EnterState::Suspended(shared);
                        Poll::Pending
                    }
                }
            }
            EnterState::Done => unreachable!("suspend future polled after completion"),
        }
    }
}
