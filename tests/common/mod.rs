//! Common test utilities and fixtures
//!
//! - Ledger and pipeline setup over `MemoryLedger`
//! - Chunk generators with deterministic content
//! - Assertions over decoded channels and frontier shape

#![allow(dead_code)]

pub mod assertions;
pub mod fixtures;

pub use assertions::*;
pub use fixtures::*;

pub use std::sync::Arc;
