//! Shared helpers for the behavioural test suite.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Once;
use weft::{Result, Runtime};

static INIT_LOGGING: Once = Once::new();

/// Initialize tracing output for tests. Safe to call repeatedly.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Runs `main` on a fresh event loop with logging initialised.
pub fn run<T: 'static>(main: impl Future<Output = Result<T>> + 'static) -> Result<T> {
    init_test_logging();
    Runtime::new().run(main)
}

/// An in-memory event log for asserting execution order.
pub type Log = Rc<RefCell<Vec<String>>>;

/// Creates an empty event log.
pub fn log() -> Log {
    Rc::default()
}

/// Appends an entry to the log.
pub fn push(log: &Log, entry: impl Into<String>) {
    log.borrow_mut().push(entry.into());
}

/// Snapshot of the log as plain strings.
pub fn entries(log: &Log) -> Vec<String> {
    log.borrow().clone()
}
