//! Sluice integration test harness.
//!
//! End-to-end scenarios across sinks, sources, transform stages and
//! pipelines, driven by the in-memory transports in `infra.rs`:
//!
//!   cargo test --test integration
//!
//! Every wait is bounded by `within`, so a lost wakeup fails the test
//! instead of hanging it.

mod pipe;
mod sink;
mod transform;

pub use infra::*;
