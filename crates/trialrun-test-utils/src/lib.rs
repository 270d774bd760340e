//! Shared test utilities for trialrun integration tests.
//!
//! This crate provides:
//! - [`TracingMemoryBackend`]: In-memory blob storage with operation recording
//!   and failure injection
//! - [`TestHarness`]: A coordinator wired to inspectable in-memory collaborators
//! - [`RequestFactory`]: Factory functions for run requests
//! - Custom assertion helpers for status paths and timelines
//!
//! # Example
//!
//! ```rust,ignore
//! use trialrun_test_utils::{RequestFactory, TestHarness};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestHarness::new();
//!     let run_id = harness.start_run(RequestFactory::checkout("P1")).await;
//!     // ... report steps ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod storage;

pub use assertions::*;
pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("trialrun=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
