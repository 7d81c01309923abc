//! Execution cache
//!
//! Fingerprints node instances and remembers the outputs of successful
//! executions so unchanged work is skipped on the next run.

// SHA-256 fingerprints over resolved inputs, parameters and command line
pub mod fingerprint;

// SQLite-backed entry store
pub mod storage;

pub use fingerprint::{FingerprintInput, HashMode};
pub use storage::{CacheEntry, CacheStore};
