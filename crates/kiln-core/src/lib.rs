//! # kiln-core
//!
//! Core types, traits, and abstractions for the kiln job worker.
//!
//! This crate provides the job and host-record data model, the storage
//! traits the worker is written against, the shared error type and the
//! central defaults.

pub mod defaults;
pub mod error;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
