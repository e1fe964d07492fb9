//! Core identifier types.

mod id;

pub use id::FibreId;
