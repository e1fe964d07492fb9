//! Race combinators: the first success wins, losers are cancelled and
//! drained.

use super::{boxed, fork_promise, FibreBody};
use crate::cancel::{self, CancelCtx};
use crate::error::{Error, Result};
use crate::fibre::FibreCtx;
use crate::tracing_compat::trace;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

enum Race<T> {
    Pending,
    Won(T),
    Failed(Error),
}

async fn contend<T>(f: FibreBody<T>, outcome: Rc<RefCell<Race<T>>>, cc: CancelCtx) -> Result<()> {
    match f.await {
        Ok(value) => {
            let mut slot = outcome.borrow_mut();
            if matches!(*slot, Race::Pending) {
                *slot = Race::Won(value);
                drop(slot);
                cc.cancel(&Error::NotFirst);
            }
            // A second success arrives after the winner already cancelled
            // the scope; it is dropped.
        }
        Err(e) if e.is_cancelled() && cc.is_cancelling() => {
            trace!(error = %e, "losing fibre cancelled");
        }
        Err(e) => {
            let mut slot = outcome.borrow_mut();
            *slot = match std::mem::replace(&mut *slot, Race::Pending) {
                // A failure displaces a stored success: the scope cannot
                // claim a clean win once something failed independently.
                Race::Pending | Race::Won(_) => Race::Failed(e),
                Race::Failed(old) => Race::Failed(Error::multiple(vec![old, e])),
            };
        }
    }
    Ok(())
}

/// Runs every body in a child cancellation context and returns the first
/// success; the rest are cancelled and drained before this returns.
///
/// All bodies but the last run as new fibres; the last runs on the calling
/// fibre, so a one-element race pays no fork.
///
/// # Errors
///
/// If no body succeeds, the failures of every failing body (aggregated); if
/// the scope was cancelled from outside, that cancellation.
///
/// # Panics
///
/// Panics on an empty list.
pub async fn any<T: 'static>(fs: Vec<FibreBody<T>>) -> Result<T> {
    assert!(!fs.is_empty(), "any requires at least one fibre");
    let caller = FibreCtx::current().expect("any outside a fibre");
    let parent = caller.cancel_ctx();

    let (body_result, child_error) = cancel::sub_unchecked(move |cc| async move {
        let outcome: Rc<RefCell<Race<T>>> = Rc::new(RefCell::new(Race::Pending));
        let mut fs = fs;
        let last = fs.pop().expect("list checked non-empty");

        let mut pending = Vec::with_capacity(fs.len());
        for f in fs {
            let entrant = contend(f, outcome.clone(), cc.clone());
            pending.push(fork_promise(&cc, entrant).await);
        }
        contend(last, outcome.clone(), cc.clone()).await?;

        // Drain the forked entrants; their bookkeeping already ran, this
        // only waits out stragglers, so it must not be interruptible.
        for p in &pending {
            let _ = p.wait_result().await;
        }
        Ok(outcome)
    })
    .await?;

    let outcome = body_result.expect("race bookkeeping is infallible");
    let winner = std::mem::replace(&mut *outcome.borrow_mut(), Race::Pending);
    let cancel_cause = child_error.filter(|e| !e.is_not_first());

    match (winner, cancel_cause) {
        (Race::Won(value), None) => Ok(value),
        (Race::Won(_) | Race::Pending, Some(cause)) => {
            Err(parent.escape(Error::cancelled(&cause)))
        }
        (Race::Failed(e), None) => Err(parent.escape(e)),
        (Race::Failed(e), Some(cause)) => Err(parent.escape(Error::multiple(vec![e, cause]))),
        (Race::Pending, None) => unreachable!("race finished without any outcome"),
    }
}

/// Races two bodies; the first success wins and the loser is cancelled and
/// drained.
///
/// # Errors
///
/// As for [`any`].
pub async fn first<T, FA, FB>(fa: FA, fb: FB) -> Result<T>
where
    T: 'static,
    FA: Future<Output = Result<T>> + 'static,
    FB: Future<Output = Result<T>> + 'static,
{
    any(vec![boxed(fa), boxed(fb)]).await
}
