//! Ledger client implementations and adapters
//!
//! - `RetryingLedger`: backoff wrapper around any [`LedgerClient`](crate::traits::LedgerClient)
//! - `MemoryLedger`: in-process ledger with fault injection
//! - `LocalLedger`: journal-backed ledger in a local directory

pub mod local;
pub mod memory;
pub mod retry;
pub mod state;

pub use local::LocalLedger;
pub use memory::MemoryLedger;
pub use retry::{put_idempotent, RetryConfig, RetryingLedger};
pub use state::{record_id, ChainShape};
