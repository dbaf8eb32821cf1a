//! Kiln Common - Shared types and utilities
//!
//! This crate provides the identifier types, error definitions, and
//! configuration structures used across the Kiln object store.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ConfigUpdate, StoreConfig};
pub use error::{Error, Result};
pub use types::*;
