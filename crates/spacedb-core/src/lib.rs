//! spacedb-core
//!
//! Shared domain types, the error taxonomy, the `Embedder` capability, the
//! chunker, and configuration/logging bootstrap for the spacedb crates.

pub mod chunker;
pub mod config;
pub mod error;
pub mod logging;
pub mod traits;
pub mod types;

pub use error::{Error, ErrorKind, Result, ResultExt};
