//! Cancellation contexts.
//!
//! Cancellation is signalled on a tree of contexts. Cancelling a context
//! marks it and every descendant with the same cause before returning, and
//! fires the cancel callback of every fibre currently suspended under the
//! subtree. A running fibre is never interrupted; it observes the
//! cancellation at its next suspension or explicit check.
//!
//! A context is a scope: it is created under a parent, lives while its scope
//! runs, and is finished (and detached from the parent) when the scope ends.
//! A cancelled context never becomes active again.

use crate::error::{Error, Result};
use crate::fibre::{FibreCtx, FibreInner};
use crate::tracing_compat::trace;
use crate::types::FibreId;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

thread_local! {
    static NEXT_CTX_ID: Cell<u64> = const { Cell::new(0) };
}

fn next_ctx_id() -> u64 {
    NEXT_CTX_ID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        id
    })
}

/// Lifecycle of a cancellation context.
#[derive(Debug, Clone)]
pub enum CtxState {
    /// The scope is live and has not been cancelled.
    Active,
    /// The scope was cancelled with the contained cause.
    Cancelling(Error),
    /// The scope is over; the context accepts no further work.
    Finished,
}

pub(crate) struct CtxNode {
    id: u64,
    state: RefCell<CtxState>,
    parent: Weak<CtxNode>,
    children: RefCell<HashMap<u64, Rc<CtxNode>>>,
    /// Fibres currently running or suspended under this context. Weak: the
    /// fibre table owns fibres, the context only signals them.
    fibres: RefCell<HashMap<FibreId, Weak<FibreInner>>>,
}

impl CtxNode {
    fn cancel(&self, cause: &Error) {
        {
            let mut state = self.state.borrow_mut();
            match &*state {
                CtxState::Active => *state = CtxState::Cancelling(cause.clone()),
                // Idempotent: the first cause sticks, later causes are
                // aggregated at the switch layer instead.
                CtxState::Cancelling(_) | CtxState::Finished => return,
            }
        }
        trace!(ctx = self.id, cause = %cause, "cancelling context");

        let children: SmallVec<[Rc<Self>; 4]> =
            self.children.borrow().values().cloned().collect();
        for child in children {
            child.cancel(cause);
        }

        let fibres: SmallVec<[Rc<FibreInner>; 4]> = self
            .fibres
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for fibre in fibres {
            if let Some(cancel_fn) = fibre.take_cancel_fn() {
                cancel_fn(Error::cancelled(cause));
            }
        }
    }
}

/// Handle to a node in the cancellation tree.
///
/// Cheap to clone; clones share the underlying node.
#[derive(Clone)]
pub struct CancelCtx {
    node: Rc<CtxNode>,
}

impl CancelCtx {
    /// Creates a root context, owned by the event loop's main fibre.
    #[must_use]
    pub(crate) fn root() -> Self {
        Self {
            node: Rc::new(CtxNode {
                id: next_ctx_id(),
                state: RefCell::new(CtxState::Active),
                parent: Weak::new(),
                children: RefCell::new(HashMap::new()),
                fibres: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Creates an active child of `parent`.
    ///
    /// # Errors
    ///
    /// Propagates the parent's cause when the parent is no longer active.
    pub(crate) fn child_of(parent: &Self) -> Result<Self> {
        match &*parent.node.state.borrow() {
            CtxState::Active => {}
            CtxState::Cancelling(cause) => return Err(Error::cancelled(cause)),
            CtxState::Finished => return Err(Error::SwitchFinished),
        }
        let node = Rc::new(CtxNode {
            id: next_ctx_id(),
            state: RefCell::new(CtxState::Active),
            parent: Rc::downgrade(&parent.node),
            children: RefCell::new(HashMap::new()),
            fibres: RefCell::new(HashMap::new()),
        });
        parent
            .node
            .children
            .borrow_mut()
            .insert(node.id, node.clone());
        Ok(Self { node })
    }

    /// Cancels this context and every descendant with `cause`.
    ///
    /// Idempotent: once a context is cancelling, further calls are no-ops.
    /// The stored cause is always the unwrapped failure, never a
    /// cancellation signal itself.
    pub fn cancel(&self, cause: &Error) {
        self.node.cancel(cause.unwrapped());
    }

    /// Fails if this context is no longer active.
    ///
    /// # Errors
    ///
    /// `Cancelled(cause)` while cancelling; `SwitchFinished` once the scope
    /// is over.
    pub fn check(&self) -> Result<()> {
        match &*self.node.state.borrow() {
            CtxState::Active => Ok(()),
            CtxState::Cancelling(cause) => Err(Error::cancelled(cause)),
            CtxState::Finished => Err(Error::SwitchFinished),
        }
    }

    /// The stored cause while cancelling, else `None`.
    #[must_use]
    pub fn get_error(&self) -> Option<Error> {
        match &*self.node.state.borrow() {
            CtxState::Cancelling(cause) => Some(cause.clone()),
            _ => None,
        }
    }

    /// True if the context has not been cancelled or finished.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(&*self.node.state.borrow(), CtxState::Active)
    }

    /// True if the context was cancelled and its scope is not yet over.
    #[must_use]
    pub fn is_cancelling(&self) -> bool {
        matches!(&*self.node.state.borrow(), CtxState::Cancelling(_))
    }

    /// Ends the scope: detaches from the parent and refuses further work.
    pub(crate) fn finish(&self) {
        if let Some(parent) = self.node.parent.upgrade() {
            parent.children.borrow_mut().remove(&self.node.id);
        }
        *self.node.state.borrow_mut() = CtxState::Finished;
        trace!(ctx = self.node.id, "context finished");
    }

    /// Registers a fibre as running under this context.
    pub(crate) fn attach_fibre(&self, id: FibreId, fibre: &Rc<FibreInner>) {
        self.node
            .fibres
            .borrow_mut()
            .insert(id, Rc::downgrade(fibre));
    }

    /// Removes a fibre from this context.
    pub(crate) fn detach_fibre(&self, id: FibreId) {
        self.node.fibres.borrow_mut().remove(&id);
    }

    /// Maps a failure escaping a scope directly under this context:
    /// cancellation wrapping is stripped unless this context is itself still
    /// cancelling (handlers inside a cancelling scope see the wrapped form).
    pub(crate) fn escape(&self, error: Error) -> Error {
        if self.is_cancelling() {
            error
        } else {
            error.strip_cancelled()
        }
    }

    pub(crate) fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.node, &b.node)
    }
}

impl fmt::Debug for CancelCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelCtx")
            .field("id", &self.node.id)
            .field("state", &*self.node.state.borrow())
            .finish()
    }
}

/// Runs `f` with the current fibre's cancellation deferred.
///
/// While `f` runs, suspensions do not install cancel callbacks and checks
/// pass, so a cancellation arriving mid-flight cannot interrupt it. After
/// `f` returns successfully the context is re-checked and any deferred
/// cancellation surfaces there.
///
/// # Errors
///
/// Whatever `f` returns, or the deferred cancellation.
pub async fn protect<T, Fut>(f: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let fibre = FibreCtx::current().expect("protect called outside a fibre");
    let guard = fibre.mask();
    let result = f.await;
    drop(guard);
    if result.is_ok() {
        fibre.check()?;
    }
    result
}

/// Runs `body` in a child context of the current fibre's context.
///
/// The child is finished when `body` returns — cancelled first if `body`
/// failed while the child was still active — and the fibre is moved back
/// under its previous context. A cancellation escaping the child is
/// unwrapped to its cause unless the surrounding context is itself still
/// cancelling.
///
/// # Errors
///
/// The parent's cause when it is no longer active, or `body`'s failure.
pub async fn sub<T, F, Fut>(body: F) -> Result<T>
where
    F: FnOnce(CancelCtx) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let fibre = FibreCtx::current().expect("sub called outside a fibre");
    let parent = fibre.cancel_ctx();
    let (result, _child_error) = sub_unchecked(body).await?;
    result.map_err(|e| parent.escape(e))
}

/// Like [`sub`], but returns normally even when the child was cancelled,
/// handing the caller `body`'s outcome together with the child's stored
/// cause for inspection.
///
/// # Errors
///
/// Only the parent's cause when the child cannot be created.
pub async fn sub_unchecked<T, F, Fut>(body: F) -> Result<(Result<T>, Option<Error>)>
where
    F: FnOnce(CancelCtx) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let fibre = FibreCtx::current().expect("sub called outside a fibre");
    let parent = fibre.cancel_ctx();
    let child = CancelCtx::child_of(&parent)?;
    fibre.move_to(&child);
    let result = body(child.clone()).await;
    if let Err(e) = &result {
        if child.is_active() {
            child.cancel(e);
        }
    }
    let child_error = child.get_error();
    child.finish();
    fibre.move_to(&parent);
    Ok((result, child_error))
}
