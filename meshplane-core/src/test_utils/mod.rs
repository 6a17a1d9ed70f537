//! Test utilities for meshplane
//!
//! Builders for account aggregates shared by unit tests, the integration
//! tests under `tests/` and the benchmarks.

pub mod fixtures;

pub use fixtures::*;
