//! Switches: scoped supervisors for fibres and resources.
//!
//! A switch tracks every fibre forked under it, collects release actions,
//! and does not let [`Switch::run`] return until all of that work is done.
//! The first failure turns the switch off: the stored failure accumulates
//! further independent failures, cancel hooks fire once, and the switch's
//! cancellation context cancels everything still running underneath.
//!
//! ```text
//! On ──turn_off(ex)──► TurningOff(ex) ──finish──► Off
//! On ──────────finish (clean)────────────────► Off
//! ```
//!
//! Once `Off`, a switch rejects every operation: a handle that escapes its
//! scope is unusable.

use crate::cancel::CancelCtx;
use crate::error::{Error, Result};
use crate::fibre::{self, suspend, FibreCtx};
use crate::sync::promise::Promise;
use crate::tracing_compat::{debug, trace, warn};
use crate::waiters::{WaiterHandle, Waiters};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;

/// A release action registered with [`Switch::on_release`].
pub type ReleaseFn = Box<dyn FnOnce() -> Result<()>>;

/// Lifecycle of a switch.
#[derive(Debug, Clone)]
pub enum SwitchState {
    /// Accepting new fibres and operations.
    On,
    /// A failure was recorded; draining children, accepting no new fibres.
    TurningOff(Error),
    /// The scope is over.
    Off,
}

struct SwitchInner {
    state: RefCell<SwitchState>,
    /// In-flight operations (forked fibres and explicit `with_op` scopes).
    ops: Cell<usize>,
    releases: RefCell<Vec<ReleaseFn>>,
    hooks: RefCell<Waiters<Error>>,
    /// Wakes the finishing fibre when `ops` hits zero.
    drained: RefCell<Option<suspend::Resume<()>>>,
    ctx: CancelCtx,
}

/// Handle to a scoped supervisor. Cheap to clone; clones share the scope.
#[derive(Clone)]
pub struct Switch {
    inner: Rc<SwitchInner>,
}

/// Decrements the op counter on drop, waking the finisher at zero.
struct OpGuard {
    inner: Rc<SwitchInner>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        let ops = self.inner.ops.get();
        debug_assert!(ops > 0, "op counter underflow");
        self.inner.ops.set(ops - 1);
        if ops == 1 {
            if let Some(resume) = self.inner.drained.borrow_mut().take() {
                resume.resume(Ok(()));
            }
        }
    }
}

impl Switch {
    /// Runs `body` under a new switch and waits for the scope to close:
    /// every forked fibre completed, every release handler run (LIFO), and
    /// the first stored failure (with everything combined into it)
    /// propagated.
    ///
    /// # Errors
    ///
    /// The surrounding context's cause when it is no longer active, `body`'s
    /// failure, or any failure recorded while the scope was open.
    pub async fn run<T, F, Fut>(body: F) -> Result<T>
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let fibre = FibreCtx::current().expect("Switch::run outside a fibre");
        let parent = fibre.cancel_ctx();
        Self::run_under(&parent, body).await
    }

    pub(crate) async fn run_under<T, F, Fut>(parent: &CancelCtx, body: F) -> Result<T>
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let fibre = FibreCtx::current().expect("Switch::run outside a fibre");
        let prev = fibre.cancel_ctx();
        let ctx = CancelCtx::child_of(parent).map_err(|e| prev.escape(e))?;
        fibre.move_to(&ctx);

        let sw = Self {
            inner: Rc::new(SwitchInner {
                state: RefCell::new(SwitchState::On),
                ops: Cell::new(0),
                releases: RefCell::new(Vec::new()),
                hooks: RefCell::new(Waiters::new()),
                drained: RefCell::new(None),
                ctx: ctx.clone(),
            }),
        };
        trace!(ctx = ?ctx, "switch opened");

        let body_result = body(sw.clone()).await;
        let result = sw.finish(body_result).await;

        ctx.finish();
        fibre.move_to(&prev);
        result.map_err(|e| prev.escape(e))
    }

    /// Drains children, runs release handlers, transitions to `Off`.
    async fn finish<T>(&self, body_result: Result<T>) -> Result<T> {
        let value = match body_result {
            Ok(v) => Some(v),
            Err(e) => {
                self.turn_off(e);
                None
            }
        };

        let fibre = FibreCtx::current().expect("switch finished outside a fibre");

        // Children may fork more children while the scope stays on, so wait
        // in a loop. The wait itself is uncancellable: cancelled children
        // still have to drain through here.
        {
            let _mask = fibre.mask();
            while self.inner.ops.get() > 0 {
                trace!(ops = self.inner.ops.get(), "waiting for fibres to finish");
                let inner = self.inner.clone();
                let waited = suspend::enter::<(), _>(move |_fibre, resume| {
                    *inner.drained.borrow_mut() = Some(resume);
                })
                .await;
                debug_assert!(waited.is_ok(), "drain wake-up cannot fail");
            }
        }

        // Release handlers in reverse registration order, shielded from
        // cancellation. Their failures fold into the stored one.
        loop {
            let handler = self.inner.releases.borrow_mut().pop();
            let Some(handler) = handler else { break };
            let _mask = fibre.mask();
            if let Err(e) = handler() {
                debug!(error = %e, "release handler failed");
                self.turn_off(e);
            }
        }

        let stored = {
            let mut state = self.inner.state.borrow_mut();
            match std::mem::replace(&mut *state, SwitchState::Off) {
                SwitchState::TurningOff(e) => Some(e),
                SwitchState::On => None,
                SwitchState::Off => unreachable!("switch finished twice"),
            }
        };
        debug_assert_eq!(self.inner.ops.get(), 0);
        trace!(failed = stored.is_some(), "switch closed");

        match stored {
            Some(e) => Err(e),
            None => Ok(value.expect("clean finish implies a body value")),
        }
    }

    /// Records a failure and starts turning the switch off.
    ///
    /// The first call transitions `On → TurningOff`, fires the cancel hooks
    /// once, and cancels the switch's context with the unwrapped failure.
    /// Later calls fold their failure into the stored one: a real failure
    /// displaces cancellation signals, distinct real failures aggregate.
    pub fn turn_off(&self, failure: Error) {
        let fire_with = {
            let mut state = self.inner.state.borrow_mut();
            match &mut *state {
                SwitchState::On => {
                    let cause = failure.unwrapped().clone();
                    debug!(failure = %failure, "switch turning off");
                    *state = SwitchState::TurningOff(failure);
                    Some(cause)
                }
                SwitchState::TurningOff(stored) => {
                    let prev = std::mem::replace(stored, Error::SwitchFinished);
                    *stored = prev.combine(failure);
                    None
                }
                SwitchState::Off => {
                    warn!(failure = %failure, "failure reported to a finished switch");
                    None
                }
            }
        };
        if let Some(cause) = fire_with {
            let hooks = self.inner.hooks.borrow_mut().drain_newest_first();
            for hook in hooks {
                hook(&cause);
            }
            self.inner.ctx.cancel(&cause);
        }
    }

    /// Fails if the switch can no longer host work.
    ///
    /// # Errors
    ///
    /// `SwitchFinished` once `Off`; the stored failure (unwrapped) while
    /// turning off; the context's cause if the context was cancelled from
    /// outside while the switch is still on.
    pub fn check(&self) -> Result<()> {
        match &*self.inner.state.borrow() {
            SwitchState::On => {}
            SwitchState::TurningOff(stored) => return Err(stored.clone().strip_cancelled()),
            SwitchState::Off => return Err(Error::SwitchFinished),
        }
        self.inner.ctx.check()
    }

    /// The stored failure while turning off, else `None`.
    #[must_use]
    pub fn get_error(&self) -> Option<Error> {
        match &*self.inner.state.borrow() {
            SwitchState::TurningOff(stored) => Some(stored.clone()),
            _ => None,
        }
    }

    /// Number of operations currently in flight.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.inner.ops.get()
    }

    /// True until `run` has closed the scope.
    #[must_use]
    pub fn is_on(&self) -> bool {
        matches!(&*self.inner.state.borrow(), SwitchState::On)
    }

    /// The cancellation context owned by this switch.
    #[must_use]
    pub fn cancel_ctx(&self) -> CancelCtx {
        self.inner.ctx.clone()
    }

    fn begin_op(&self) -> Result<()> {
        match &*self.inner.state.borrow() {
            SwitchState::On => {}
            SwitchState::TurningOff(_) | SwitchState::Off => return Err(Error::SwitchFinished),
        }
        self.inner.ops.set(self.inner.ops.get() + 1);
        Ok(())
    }

    /// Counts `f` as an operation of this switch: the scope cannot close
    /// while `f` runs. The count is given back on every exit path.
    ///
    /// # Errors
    ///
    /// `SwitchFinished` when the switch is no longer on, or `f`'s failure.
    pub async fn with_op<T, Fut>(&self, f: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.begin_op()?;
        let _guard = OpGuard {
            inner: self.inner.clone(),
        };
        f.await
    }

    /// Registers a release action, run when the scope closes, after every
    /// fibre has finished, in reverse registration order, shielded from
    /// cancellation. While the switch is turning off registration still
    /// succeeds — the handler runs during the ongoing close.
    ///
    /// # Errors
    ///
    /// `SwitchFinished` once the switch is `Off`.
    pub fn on_release(&self, handler: impl FnOnce() -> Result<()> + 'static) -> Result<()> {
        match &*self.inner.state.borrow() {
            SwitchState::Off => return Err(Error::SwitchFinished),
            SwitchState::On | SwitchState::TurningOff(_) => {}
        }
        self.inner.releases.borrow_mut().push(Box::new(handler));
        Ok(())
    }

    /// Registers a one-shot hook fired when the switch starts turning off.
    /// Hooks fire most-recently-added first. If the switch is already
    /// turning off the hook fires immediately and the returned handle is
    /// inert.
    ///
    /// # Errors
    ///
    /// `SwitchFinished` once the switch is `Off`.
    pub fn add_cancel_hook(&self, hook: impl FnOnce(&Error) + 'static) -> Result<WaiterHandle> {
        let stored = match &*self.inner.state.borrow() {
            SwitchState::On => None,
            SwitchState::TurningOff(stored) => Some(stored.unwrapped().clone()),
            SwitchState::Off => return Err(Error::SwitchFinished),
        };
        if let Some(cause) = stored {
            hook(&cause);
            return Ok(WaiterHandle::NULL);
        }
        Ok(self.inner.hooks.borrow_mut().add(hook))
    }

    /// Deregisters a cancel hook. Returns `false` if it already fired or was
    /// removed.
    pub fn remove_cancel_hook(&self, handle: WaiterHandle) -> bool {
        self.inner.hooks.borrow_mut().remove(handle)
    }

    /// Forks `f` as a new fibre of this switch and returns the promise of
    /// its result. The new fibre runs before this one resumes.
    ///
    /// On a switch that is turning off the fibre never starts and the
    /// promise is already broken with the cancellation.
    ///
    /// # Errors
    ///
    /// `SwitchFinished` once the switch is `Off`.
    pub async fn fork<T, Fut>(&self, f: Fut) -> Result<Promise<T>>
    where
        T: Clone + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        match &*self.inner.state.borrow() {
            SwitchState::On => {}
            SwitchState::TurningOff(stored) => {
                let (promise, resolver) = Promise::create();
                resolver.break_with(Error::cancelled(stored.unwrapped()));
                return Ok(promise);
            }
            SwitchState::Off => return Err(Error::SwitchFinished),
        }
        self.begin_op()?;

        let (promise, resolver) = Promise::create();
        let guard = OpGuard {
            inner: self.inner.clone(),
        };
        let fibre = FibreCtx::current().expect("fork outside a fibre");
        let handle = fibre.handle();
        let id = handle.spawn(&self.inner.ctx, async move {
            let result = f.await;
            resolver.resolve(result);
            drop(guard);
        });
        handle.enqueue_front(id);
        fibre::reschedule().await;
        Ok(promise)
    }

    /// Forks `f` without keeping its result. A failure other than
    /// cancellation turns the switch off; cancellation is swallowed because
    /// its cause is already recorded here.
    ///
    /// # Errors
    ///
    /// `SwitchFinished` once the switch is `Off`.
    pub async fn fork_ignore<Fut>(&self, f: Fut) -> Result<()>
    where
        Fut: Future<Output = Result<()>> + 'static,
    {
        match &*self.inner.state.borrow() {
            SwitchState::On => {}
            // The cause is already recorded; the fibre never starts.
            SwitchState::TurningOff(_) => return Ok(()),
            SwitchState::Off => return Err(Error::SwitchFinished),
        }
        self.begin_op()?;

        let guard = OpGuard {
            inner: self.inner.clone(),
        };
        let sw = self.clone();
        let fibre = FibreCtx::current().expect("fork outside a fibre");
        let handle = fibre.handle();
        let id = handle.spawn(&self.inner.ctx, async move {
            match f.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    trace!(error = %e, "forked fibre cancelled");
                }
                Err(e) => sw.turn_off(e),
            }
            drop(guard);
        });
        handle.enqueue_front(id);
        fibre::reschedule().await;
        Ok(())
    }

    /// Runs `body` under a child switch whose context is a child of this
    /// switch's context. A failure that is not a cancellation is handed to
    /// `on_error`; cancellation propagates untouched.
    ///
    /// # Errors
    ///
    /// The cancellation passing through, `on_error`'s own failure, or the
    /// context's cause when this switch can no longer host the child.
    pub async fn sub<F, Fut>(
        &self,
        on_error: impl FnOnce(Error) -> Result<()>,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match Self::run_under(&self.inner.ctx, body).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => on_error(e),
        }
    }

    /// Forks an ignored child fibre that runs `body` under its own child
    /// switch, with an optional release action tied to the child scope.
    ///
    /// This is the scoped-resource primitive: `on_release` runs exactly once
    /// in every outcome — attached to the child switch when the child
    /// starts, or directly (shielded from cancellation) when the child could
    /// not start because this switch was already off, turning off, or its
    /// context cancelled. In the could-not-start case the reason is
    /// propagated to the caller.
    ///
    /// Failures of the running child go to `on_error`, except cancellation,
    /// which is reported through this switch. If `on_error` itself fails,
    /// this switch turns off with both failures.
    ///
    /// # Errors
    ///
    /// The reason the child could not start.
    pub async fn fork_sub_ignore<F, Fut>(
        &self,
        on_error: impl FnOnce(Error) -> Result<()> + 'static,
        on_release: Option<ReleaseFn>,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce(Self) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        let attached = Rc::new(Cell::new(false));
        let release_slot = Rc::new(RefCell::new(on_release));

        let starting = matches!(&*self.inner.state.borrow(), SwitchState::On);
        if starting {
            self.begin_op()?;
            let guard = OpGuard {
                inner: self.inner.clone(),
            };
            let sw = self.clone();
            let attached_by_child = attached.clone();
            let release_for_child = release_slot.clone();
            let fibre = FibreCtx::current().expect("fork outside a fibre");
            let handle = fibre.handle();
            let id = handle.spawn(&self.inner.ctx, async move {
                let run = Self::run(move |child_sw| async move {
                    if let Some(handler) = release_for_child.borrow_mut().take() {
                        child_sw.on_release(handler)?;
                    }
                    attached_by_child.set(true);
                    body(child_sw).await
                })
                .await;
                match run {
                    Ok(()) => {}
                    // Cancellation is reported through the parent switch,
                    // never to on_error.
                    Err(e) if e.is_cancelled() => sw.turn_off(e),
                    Err(e) => {
                        if let Err(e2) = on_error(e.clone()) {
                            sw.turn_off(e);
                            sw.turn_off(e2);
                        }
                    }
                }
                drop(guard);
            });
            handle.enqueue_front(id);
            fibre::reschedule().await;
        }

        if attached.get() {
            return Ok(());
        }

        // The child did not start. The resource still has to be freed, then
        // the reason surfaces through check.
        let mut release_failure = None;
        if let Some(handler) = release_slot.borrow_mut().take() {
            let fibre = FibreCtx::current().expect("fork outside a fibre");
            let _mask = fibre.mask();
            if let Err(e) = handler() {
                debug!(error = %e, "release handler failed for unstarted fibre");
                release_failure = Some(e);
            }
        }
        match (self.check(), release_failure) {
            (Err(reason), None) => Err(reason),
            (Err(reason), Some(e)) => Err(reason.combine(e)),
            (Ok(()), Some(e)) => Err(e),
            (Ok(()), None) => {
                unreachable!("switch refused to start a fibre but reports no failure")
            }
        }
    }
}

impl fmt::Debug for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Switch")
            .field("state", &*self.inner.state.borrow())
            .field("ops", &self.inner.ops.get())
            .field("releases", &self.inner.releases.borrow().len())
            .finish()
    }
}
