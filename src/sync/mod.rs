//! Synchronisation primitives built on the suspend bridge.

pub mod promise;

pub use promise::{Promise, Resolver};
