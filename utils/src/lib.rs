//! Shared infrastructure utilities for Strand.
//!
//! - **`atomic_write`**: Crash-safe file persistence (temp + rename)
//! - **`redact`**: Secret redaction for logs and error messages

pub mod atomic_write;
pub mod redact;

pub use atomic_write::{
    AtomicWriteOptions, FileSyncPolicy, PersistMode, atomic_write, atomic_write_with_options,
    recover_bak_file,
};
pub use redact::{redact_json, redact_secrets};
