//! The single-threaded event loop.
//!
//! The loop owns the fibre table and an ordered run queue. The fibre at the
//! front runs until it completes or suspends through the bridge; wakes are
//! appended in the order they happen, so dispatch is FIFO. There is no
//! preemption and no parallelism: switch counters, waiter lists, and cancel
//! contexts are mutated only from here.
//!
//! When no fibre is runnable and the main fibre has not returned, the loop
//! reports a deadlock instead of spinning.

mod queue;

use crate::cancel::CancelCtx;
use crate::error::{Error, Result};
use crate::fibre::FibreCtx;
use crate::tracing_compat::{debug, error, trace};
use crate::types::FibreId;
use crate::util::Arena;
use queue::RunQueue;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::Context;

type FibreFuture = Pin<Box<dyn Future<Output = ()>>>;

struct FibreSlot {
    /// Taken out while the fibre is being polled.
    future: Option<FibreFuture>,
    fibre: FibreCtx,
}

struct LoopState {
    fibres: RefCell<Arena<FibreSlot>>,
    queue: RefCell<RunQueue>,
}

/// Loop configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    max_steps: Option<u64>,
}

impl RuntimeConfig {
    /// Default configuration: unbounded steps.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Aborts the loop after `limit` dispatches. A guard against runaway
    /// fibre loops in tests.
    #[must_use]
    pub fn max_steps(mut self, limit: u64) -> Self {
        self.max_steps = Some(limit);
        self
    }
}

/// Capability to reach the loop from inside a fibre: spawn and enqueue.
#[derive(Clone)]
pub(crate) struct Handle {
    state: Weak<LoopState>,
}

impl Handle {
    fn state(&self) -> Rc<LoopState> {
        self.state.upgrade().expect("event loop is gone")
    }

    /// Adds a fibre running `future` under `ctx`. The fibre is not queued;
    /// the caller decides where it enters the queue.
    pub(crate) fn spawn(
        &self,
        ctx: &CancelCtx,
        future: impl Future<Output = ()> + 'static,
    ) -> FibreId {
        let state = self.state();
        let handle = self.clone();
        let index = state.fibres.borrow_mut().insert_with(|index| {
            let id = FibreId::from_arena(index);
            FibreSlot {
                future: Some(Box::pin(future)),
                fibre: FibreCtx::new(id, ctx, handle),
            }
        });
        let id = FibreId::from_arena(index);
        trace!(fibre = %id, "fibre spawned");
        id
    }

    /// Queues a fibre ahead of every other runnable. Forked fibres run
    /// before their forker resumes.
    pub(crate) fn enqueue_front(&self, fibre: FibreId) {
        self.state().queue.borrow_mut().push_front(fibre);
    }

    /// Appends a fibre to the run queue.
    pub(crate) fn enqueue_back(&self, fibre: FibreId) {
        self.state().queue.borrow_mut().push_back(fibre);
    }
}

/// The event loop.
pub struct Runtime {
    state: Rc<LoopState>,
    config: RuntimeConfig,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Creates a loop with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::new())
    }

    /// Creates a loop with an explicit configuration.
    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            state: Rc::new(LoopState {
                fibres: RefCell::new(Arena::new()),
                queue: RefCell::new(RunQueue::new()),
            }),
            config,
        }
    }

    /// Runs `main` as the main fibre under a fresh root cancellation
    /// context, dispatching fibres until it completes.
    ///
    /// # Errors
    ///
    /// `main`'s failure; [`Error::Deadlocked`] when no fibre is runnable
    /// while `main` is still pending; a step-limit failure when the
    /// configured guard trips.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a fibre: the loop does not nest.
    pub fn run<T: 'static>(&self, main: impl Future<Output = Result<T>> + 'static) -> Result<T> {
        assert!(
            FibreCtx::current().is_none(),
            "Runtime::run called from inside a fibre"
        );

        let root = CancelCtx::root();
        let outcome: Rc<RefCell<Option<Result<T>>>> = Rc::default();
        let outcome_slot = outcome.clone();
        let handle = Handle {
            state: Rc::downgrade(&self.state),
        };
        let main_id = handle.spawn(&root, async move {
            let result = main.await;
            *outcome_slot.borrow_mut() = Some(result);
        });
        handle.enqueue_back(main_id);

        let mut steps: u64 = 0;
        loop {
            let Some(next) = self.state.queue.borrow_mut().pop() else {
                error!(
                    live_fibres = self.state.fibres.borrow().len(),
                    "deadlock: no runnable fibre and the main fibre has not returned"
                );
                return Err(Error::Deadlocked);
            };

            if let Some(limit) = self.config.max_steps {
                if steps >= limit {
                    error!(limit, "dispatch step limit exceeded");
                    return Err(Error::msg("fibre dispatch step limit exceeded"));
                }
            }
            steps += 1;

            self.dispatch(next);

            if let Some(result) = outcome.borrow_mut().take() {
                debug!(steps, "main fibre returned");
                root.finish();
                return result;
            }
        }
    }

    fn dispatch(&self, id: FibreId) {
        let (mut future, fibre) = {
            let mut fibres = self.state.fibres.borrow_mut();
            let Some(slot) = fibres.get_mut(id.arena_index()) else {
                // Stale wake for a completed fibre.
                return;
            };
            let Some(future) = slot.future.take() else {
                return;
            };
            (future, slot.fibre.clone())
        };

        let waker = self.state.queue.borrow().waker_for(id);
        let mut cx = Context::from_waker(&waker);
        let poll = {
            let _current = FibreCtx::set_current(Some(fibre.clone()));
            future.as_mut().poll(&mut cx)
        };

        if poll.is_ready() {
            fibre.detach();
            self.state.fibres.borrow_mut().remove(id.arena_index());
            trace!(fibre = %id, "fibre completed");
        } else if let Some(slot) = self.state.fibres.borrow_mut().get_mut(id.arena_index()) {
            slot.future = Some(future);
        }
    }

    /// Number of fibres currently alive (for diagnostics and tests).
    #[must_use]
    pub fn live_fibres(&self) -> usize {
        self.state.fibres.borrow().len()
    }
}
