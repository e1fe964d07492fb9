//! Per-fibre state and the cooperative primitives built on it.
//!
//! A [`FibreCtx`] binds a fibre to the cancellation context it currently
//! runs under and holds the one cancel-callback slot a suspended fibre may
//! install. The event loop publishes the fibre being polled through a
//! thread-local, so combinators reach their own fibre without threading a
//! handle through every call.

pub mod suspend;

use crate::cancel::CancelCtx;
use crate::error::{Error, Result};
use crate::runtime::Handle;
use crate::types::FibreId;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

pub(crate) type CancelFn = Box<dyn FnOnce(Error)>;

pub(crate) struct FibreInner {
    id: FibreId,
    ctx: RefCell<CancelCtx>,
    cancel_fn: RefCell<Option<CancelFn>>,
    /// While non-zero, checks pass and suspensions stay uncancellable.
    mask_depth: Cell<u32>,
    handle: Handle,
}

impl FibreInner {
    /// Takes the installed cancel callback, leaving the slot empty.
    pub(crate) fn take_cancel_fn(&self) -> Option<CancelFn> {
        self.cancel_fn.borrow_mut().take()
    }
}

/// Handle to a fibre's runtime state. Cheap to clone.
#[derive(Clone)]
pub struct FibreCtx {
    inner: Rc<FibreInner>,
}

thread_local! {
    static CURRENT_FIBRE: RefCell<Option<FibreCtx>> = const { RefCell::new(None) };
}

/// Restores the previously current fibre on drop.
pub(crate) struct CurrentFibreGuard {
    prev: Option<FibreCtx>,
}

impl Drop for CurrentFibreGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_FIBRE.with(|slot| *slot.borrow_mut() = prev);
    }
}

impl FibreCtx {
    /// Creates a fibre bound to `ctx` (internal use).
    pub(crate) fn new(id: FibreId, ctx: &CancelCtx, handle: Handle) -> Self {
        let inner = Rc::new(FibreInner {
            id,
            ctx: RefCell::new(ctx.clone()),
            cancel_fn: RefCell::new(None),
            mask_depth: Cell::new(0),
            handle,
        });
        ctx.attach_fibre(id, &inner);
        Self { inner }
    }

    /// The fibre currently being polled by the event loop, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT_FIBRE.with(|slot| slot.borrow().clone())
    }

    /// Sets the current fibre for the duration of the guard.
    #[must_use]
    pub(crate) fn set_current(fibre: Option<Self>) -> CurrentFibreGuard {
        let prev = CURRENT_FIBRE.with(|slot| {
            let mut guard = slot.borrow_mut();
            let prev = guard.take();
            *guard = fibre;
            prev
        });
        CurrentFibreGuard { prev }
    }

    /// The fibre's identifier.
    #[must_use]
    pub fn id(&self) -> FibreId {
        self.inner.id
    }

    /// The cancellation context this fibre currently runs under.
    #[must_use]
    pub fn cancel_ctx(&self) -> CancelCtx {
        self.inner.ctx.borrow().clone()
    }

    /// Fails if the fibre's context has been cancelled.
    ///
    /// Masked fibres (inside a protected region) always pass.
    ///
    /// # Errors
    ///
    /// The wrapped cancellation cause.
    pub fn check(&self) -> Result<()> {
        if self.inner.mask_depth.get() > 0 {
            return Ok(());
        }
        self.inner.ctx.borrow().check()
    }

    /// Moves this fibre under another cancellation context.
    pub(crate) fn move_to(&self, ctx: &CancelCtx) {
        let old = self.inner.ctx.borrow().clone();
        if CancelCtx::ptr_eq(&old, ctx) {
            return;
        }
        old.detach_fibre(self.inner.id);
        ctx.attach_fibre(self.inner.id, &self.inner);
        *self.inner.ctx.borrow_mut() = ctx.clone();
    }

    /// Installs the callback a cancellation will fire while this fibre is
    /// suspended. No-op while masked: protected regions are uncancellable.
    ///
    /// At most one callback may be installed; the slot is cleared before the
    /// fibre resumes.
    pub(crate) fn install_cancel_fn(&self, f: impl FnOnce(Error) + 'static) {
        if self.inner.mask_depth.get() > 0 {
            return;
        }
        let mut slot = self.inner.cancel_fn.borrow_mut();
        debug_assert!(
            slot.is_none(),
            "fibre {} already has a cancel callback installed",
            self.inner.id
        );
        *slot = Some(Box::new(f));
    }

    pub(crate) fn take_cancel_fn(&self) -> Option<CancelFn> {
        self.inner.take_cancel_fn()
    }

    /// Enters a masked (uncancellable) region until the guard drops.
    #[must_use]
    pub(crate) fn mask(&self) -> MaskGuard {
        self.inner.mask_depth.set(self.inner.mask_depth.get() + 1);
        MaskGuard {
            inner: self.inner.clone(),
        }
    }

    /// Detaches the fibre from its context when it completes.
    pub(crate) fn detach(&self) {
        self.inner.ctx.borrow().detach_fibre(self.inner.id);
    }

    pub(crate) fn handle(&self) -> Handle {
        self.inner.handle.clone()
    }
}

impl fmt::Debug for FibreCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FibreCtx")
            .field("id", &self.inner.id)
            .field("ctx", &*self.inner.ctx.borrow())
            .field("mask_depth", &self.inner.mask_depth.get())
            .finish()
    }
}

/// Guard that re-enables cancellation on drop.
pub(crate) struct MaskGuard {
    inner: Rc<FibreInner>,
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        let depth = self.inner.mask_depth.get();
        debug_assert!(depth > 0, "mask depth underflow");
        self.inner.mask_depth.set(depth.saturating_sub(1));
    }
}

/// Suspends the current fibre and re-enqueues it behind every runnable
/// already queued, making each yield a cancellation point.
///
/// # Errors
///
/// The cancellation cause if the fibre's context was cancelled by the time
/// it resumes.
pub async fn yield_now() -> Result<()> {
    reschedule().await;
    let fibre = FibreCtx::current().expect("yield_now outside a fibre");
    fibre.check()
}

/// Suspends and re-enqueues without the cancellation check on resume.
///
/// Used where the caller must regain control even under a cancelled context
/// (e.g. right after handing a new fibre the front of the queue).
pub(crate) async fn reschedule() {
    let result = suspend::enter::<(), _>(|_fibre, resume| resume.resume(Ok(()))).await;
    debug_assert!(result.is_ok(), "bare reschedule cannot fail");
}

/// Suspends the current fibre until its context is cancelled.
///
/// # Errors
///
/// Always fails with the cancellation cause; that is the only way back.
pub async fn await_cancel() -> Result<()> {
    let fibre = FibreCtx::current().expect("await_cancel outside a fibre");
    fibre.check()?;
    suspend::enter::<(), _>(|fibre, resume| {
        fibre.install_cancel_fn(move |cancelled| resume.resume(Err(cancelled)));
    })
    .await
}
