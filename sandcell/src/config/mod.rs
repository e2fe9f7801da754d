//! Configuration for the execution engine
//!
//! Loaded from TOML; every field has a default, so an empty file is valid.

pub mod types;

pub use types::*;
