//! Combinators over fibres: run several bodies, aggregate their outcomes.
//!
//! Every combinator runs its bodies in a child cancellation context, joins
//! all of them before returning (losers included — nothing is abandoned
//! mid-flight), and raises exactly one failure, aggregating independent ones
//! with [`Error::Multiple`](crate::error::Error::Multiple).

mod join;
mod race;

pub use join::{all, both, pair};
pub use race::{any, first};

use crate::cancel::CancelCtx;
use crate::error::Result;
use crate::fibre::{self, FibreCtx};
use crate::sync::promise::Promise;
use std::future::Future;
use std::pin::Pin;

/// A boxed fibre body, for the list-taking combinators.
pub type FibreBody<T> = Pin<Box<dyn Future<Output = Result<T>>>>;

/// Boxes a fibre body for the list-taking combinators.
pub fn boxed<T>(f: impl Future<Output = Result<T>> + 'static) -> FibreBody<T> {
    Box::pin(f)
}

/// Spawns `f` as a fibre under `ctx` and returns the promise of its result.
/// The new fibre runs before the caller resumes.
pub(crate) async fn fork_promise<T, Fut>(ctx: &CancelCtx, f: Fut) -> Promise<T>
where
    T: Clone + 'static,
    Fut: Future<Output = Result<T>> + 'static,
{
    let fibre = FibreCtx::current().expect("fork outside a fibre");
    let handle = fibre.handle();
    let (promise, resolver) = Promise::create();
    let id = handle.spawn(ctx, async move {
        resolver.resolve(f.await);
    });
    handle.enqueue_front(id);
    fibre::reschedule().await;
    promise
}
