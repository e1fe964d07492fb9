//! The run queue.
//!
//! One structure owns both halves of scheduling: the FIFO order the loop
//! dispatches in, and the inbox that std `Waker`s deliver wake-ups into.
//! The inbox is the only part of the runtime reachable from the `Waker`
//! contract's `Send + Sync` world, hence the mutex on an otherwise
//! single-threaded loop.
//!
//! Newly forked fibres jump the queue (the forker parks itself right
//! after); everything else enters at the back. Wake-ups are folded into the
//! queue when it is next popped, so a fibre woken during a dispatch runs
//! behind everything that was already runnable.

use crate::types::FibreId;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::task::{Wake, Waker};

/// Wake-ups in delivery order. Duplicates are not filtered here; the queue
/// drops them when it drains the inbox.
#[derive(Debug, Default)]
struct WakeInbox {
    delivered: Mutex<Vec<FibreId>>,
}

struct FibreWaker {
    inbox: Arc<WakeInbox>,
    fibre: FibreId,
}

impl Wake for FibreWaker {
    fn wake(self: Arc<Self>) {
        self.inbox
            .delivered
            .lock()
            .expect("wake inbox poisoned")
            .push(self.fibre);
    }
}

#[derive(Debug, Default)]
pub(crate) struct RunQueue {
    order: VecDeque<FibreId>,
    queued: HashSet<FibreId>,
    inbox: Arc<WakeInbox>,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates a waker that re-enqueues `fibre` at the back of this queue.
    pub(crate) fn waker_for(&self, fibre: FibreId) -> Waker {
        Waker::from(Arc::new(FibreWaker {
            inbox: self.inbox.clone(),
            fibre,
        }))
    }

    /// Appends a fibre. No-op if it is already queued.
    pub(crate) fn push_back(&mut self, fibre: FibreId) {
        if self.queued.insert(fibre) {
            self.order.push_back(fibre);
        }
    }

    /// Queues a fibre ahead of everything else. No-op if already queued.
    pub(crate) fn push_front(&mut self, fibre: FibreId) {
        if self.queued.insert(fibre) {
            self.order.push_front(fibre);
        }
    }

    /// Folds delivered wake-ups into the queue, then pops the next fibre.
    ///
    /// `None` means no fibre is runnable at all: nothing queued and no
    /// wake-up pending — the loop's deadlock signal.
    pub(crate) fn pop(&mut self) -> Option<FibreId> {
        let delivered = std::mem::take(
            &mut *self.inbox.delivered.lock().expect("wake inbox poisoned"),
        );
        for fibre in delivered {
            self.push_back(fibre);
        }
        let fibre = self.order.pop_front()?;
        self.queued.remove(&fibre);
        Some(fibre)
    }
}
