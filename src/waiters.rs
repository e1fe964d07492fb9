//! Intrusive lists of suspended waiters.
//!
//! A [`Waiters`] list holds callbacks registered by suspended fibres (cancel
//! hooks, promise awaiters). Registration returns a [`WaiterHandle`] that can
//! deregister the callback in O(1), and deregistering after the list already
//! fired is a harmless no-op — the arena's generation check turns the stale
//! handle into a miss.
//!
//! Nodes link through arena indices, so the list needs no interior
//! unsafety and no allocation beyond the node slots themselves.

use crate::util::{Arena, ArenaIndex};
use core::fmt;

type Callback<T> = Box<dyn FnOnce(&T)>;

struct Node<T> {
    callback: Callback<T>,
    prev: Option<ArenaIndex>,
    next: Option<ArenaIndex>,
}

/// Opaque registration token returned by [`Waiters::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterHandle(ArenaIndex);

impl WaiterHandle {
    /// A handle that deregisters nothing. Returned when the event a callback
    /// would wait for has already happened.
    pub const NULL: Self = Self(ArenaIndex::DANGLING);
}

/// A doubly-linked list of one-shot callbacks.
pub struct Waiters<T> {
    nodes: Arena<Node<T>>,
    head: Option<ArenaIndex>,
    tail: Option<ArenaIndex>,
}

impl<T> Default for Waiters<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Waiters<T> {
    /// Creates an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: Arena::new(),
            head: None,
            tail: None,
        }
    }

    /// Number of registered waiters.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if no waiter is registered.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Registers a callback at the front of the list.
    pub fn add(&mut self, callback: impl FnOnce(&T) + 'static) -> WaiterHandle {
        let old_head = self.head;
        let index = self.nodes.insert(Node {
            callback: Box::new(callback),
            prev: None,
            next: old_head,
        });
        if let Some(h) = old_head {
            if let Some(node) = self.nodes.get_mut(h) {
                node.prev = Some(index);
            }
        } else {
            self.tail = Some(index);
        }
        self.head = Some(index);
        WaiterHandle(index)
    }

    /// Deregisters a callback. Returns `false` if the handle is stale (the
    /// waiter already fired or was removed).
    pub fn remove(&mut self, handle: WaiterHandle) -> bool {
        let Some(node) = self.nodes.remove(handle.0) else {
            return false;
        };
        match node.prev {
            Some(p) => {
                if let Some(prev) = self.nodes.get_mut(p) {
                    prev.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => {
                if let Some(next) = self.nodes.get_mut(n) {
                    next.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        true
    }

    /// Detaches every callback, most recently added first.
    ///
    /// The callbacks are returned rather than invoked so the caller can drop
    /// the list borrow first; a callback that registers new waiters then
    /// lands in the emptied list.
    pub fn drain_newest_first(&mut self) -> Vec<Callback<T>> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut cursor = self.head.take();
        self.tail = None;
        while let Some(index) = cursor {
            let node = self.nodes.remove(index).expect("linked node missing");
            cursor = node.next;
            out.push(node.callback);
        }
        out
    }

    /// Detaches every callback in registration order.
    pub fn drain_oldest_first(&mut self) -> Vec<Callback<T>> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut cursor = self.tail.take();
        self.head = None;
        while let Some(index) = cursor {
            let node = self.nodes.remove(index).expect("linked node missing");
            cursor = node.prev;
            out.push(node.callback);
        }
        out
    }
}

impl<T> fmt::Debug for Waiters<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiters").field("len", &self.len()).finish()
    }
}
