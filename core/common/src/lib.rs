//! Common utilities and types shared across the cloud save crates.
//!
//! This module provides the error taxonomy and the small value types
//! (target identity, sync mode, conflict winner, log level) that every
//! other crate speaks in.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{LogLevel, SyncMode, SyncWinner, TargetId, TargetKind};
