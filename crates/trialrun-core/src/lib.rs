//! # trialrun-core
//!
//! Core abstractions shared by the trialrun crates.
//!
//! This crate provides the foundational types and traits used across components:
//!
//! - **Identifiers**: Strongly-typed IDs for runs and timeline events
//! - **Storage Traits**: The blob storage contract consumed by the IR store
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization
//!
//! ## Example
//!
//! ```rust
//! use trialrun_core::prelude::*;
//!
//! let run_id = RunId::generate();
//! let backend = MemoryBackend::new();
//! # let _ = (run_id, backend);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{EventId, RunId};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

pub use error::{Error, Result};
pub use id::{EventId, RunId};
pub use observability::{LogFormat, init_logging};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
