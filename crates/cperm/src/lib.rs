#![forbid(unsafe_code)]
//! CrashPerm public API facade.
//!
//! Re-exports the data model, the permuter core, and the reference
//! strategies through a single crate for downstream harnesses.

pub use cperm_permute::*;
pub use cperm_strategies::*;
pub use cperm_types::*;
