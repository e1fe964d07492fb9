//! Join combinators: run bodies together, keep every result or every
//! failure.

use super::{fork_promise, FibreBody};
use crate::cancel;
use crate::error::{Error, Result};
use std::future::Future;

/// Runs `fa` in a new fibre and `fb` on the calling fibre, both in a child
/// cancellation context, and returns both results.
///
/// If `fb` fails, the context is cancelled with its failure and `fa` is
/// drained (uncancellably) before the verdict:
///
/// - `fa` succeeded or was cancelled → `fb`'s failure alone;
/// - both failed independently → `Multiple[fa's, fb's]`;
/// - `fb`'s failure was itself a cancellation → `fa`'s failure, unwrapped.
///
/// # Errors
///
/// As above; or `fa`'s failure alone when only `fa` fails.
pub async fn pair<A, B, FA, FB>(fa: FA, fb: FB) -> Result<(A, B)>
where
    A: Clone + 'static,
    FA: Future<Output = Result<A>> + 'static,
    FB: Future<Output = Result<B>>,
{
    cancel::sub(move |cc| async move {
        let promise = fork_promise(&cc, fa).await;
        match fb.await {
            Ok(b) => promise.wait().await.map(|a| (a, b)),
            Err(g_failure) => {
                cc.cancel(&g_failure);
                Err(match promise.wait_result().await {
                    Ok(_) => g_failure,
                    Err(f_failure) if f_failure.is_cancelled() => g_failure,
                    Err(f_failure) => {
                        if g_failure.is_cancelled() {
                            f_failure
                        } else {
                            Error::multiple(vec![f_failure, g_failure])
                        }
                    }
                })
            }
        }
    })
    .await
}

/// Runs two unit bodies together; both complete before this returns.
///
/// # Errors
///
/// Either body's failure; independent failures aggregate in argument order.
pub async fn both<FA, FB>(fa: FA, fb: FB) -> Result<()>
where
    FA: Future<Output = Result<()>> + 'static,
    FB: Future<Output = Result<()>>,
{
    pair(fa, fb).await.map(|((), ())| ())
}

/// Runs every body together; all complete before this returns.
///
/// # Errors
///
/// The failures of every failing body, in list order, aggregated when there
/// is more than one.
pub async fn all(fs: Vec<FibreBody<()>>) -> Result<()> {
    let mut chain: Option<FibreBody<()>> = None;
    for f in fs.into_iter().rev() {
        chain = Some(match chain {
            None => f,
            Some(rest) => Box::pin(async move { pair(f, rest).await.map(|((), ())| ()) }),
        });
    }
    match chain {
        Some(chain) => chain.await,
        None => Ok(()),
    }
}
