//! Weft: a structured-concurrency runtime for single-threaded cooperative
//! fibres.
//!
//! # Overview
//!
//! Fibres are lightweight cooperative tasks driven by one event loop. The
//! crate makes their lifetimes structural: every fibre is forked under a
//! [`Switch`], every switch waits for its fibres and runs its release
//! actions before its scope returns, and cancellation travels down a tree of
//! contexts that fibres observe at their suspension points.
//!
//! # Core guarantees
//!
//! - **No orphan fibres**: a switch's scope does not return while a fibre
//!   forked under it is still running
//! - **Release exactly once**: release handlers run once, in reverse
//!   registration order, shielded from cancellation
//! - **Cancellation is cooperative**: a running fibre is never interrupted;
//!   it observes cancellation at its next suspension or check
//! - **One failure out**: every operation raises a single failure;
//!   independent failures are aggregated, never silently dropped
//!
//! # Module structure
//!
//! - [`runtime`]: the event loop (run queue, fibre table, deadlock report)
//! - [`cancel`]: the cancellation-context tree, `protect` and `sub` scopes
//! - [`switch`]: scoped supervisors owning fibres and release actions
//! - [`fibre`]: per-fibre state, `yield_now`, `await_cancel`, the suspend
//!   bridge
//! - [`combinator`]: `pair`, `both`, `all`, `any`, `first`
//! - [`sync`]: the promise primitive
//! - [`waiters`]: intrusive waiter lists with O(1) deregistration
//! - [`error`]: the failure taxonomy and aggregation policy
//!
//! # Example
//!
//! ```
//! use weft::{Runtime, Switch};
//!
//! let runtime = Runtime::new();
//! let total = runtime
//!     .run(async {
//!         Switch::run(|sw| async move {
//!             let doubled = sw.fork(async { Ok(2 * 21) }).await?;
//!             doubled.wait().await
//!         })
//!         .await
//!     })
//!     .expect("runs to completion");
//! assert_eq!(total, 42);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod cancel;
pub mod combinator;
pub mod error;
pub mod fibre;
pub mod runtime;
pub mod switch;
pub mod sync;
pub mod tracing_compat;
pub mod types;
pub mod util;
pub mod waiters;

pub use cancel::{protect, sub, sub_unchecked, CancelCtx, CtxState};
pub use combinator::{all, any, both, boxed, first, pair, FibreBody};
pub use error::{Error, Result};
pub use fibre::{await_cancel, yield_now, FibreCtx};
pub use runtime::{Runtime, RuntimeConfig};
pub use switch::{ReleaseFn, Switch, SwitchState};
pub use sync::promise::{Promise, Resolver};
pub use types::FibreId;
pub use waiters::WaiterHandle;
