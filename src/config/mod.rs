//! # Configuration Constants
//!
//! Central home for the tuning constants of the adaptive hash index.
//! Constants that depend on each other are co-located and guarded by
//! compile-time assertions.

mod constants;

pub use constants::*;
