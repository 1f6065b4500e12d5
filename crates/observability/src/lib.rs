//! Process-wide structured logging for stockledger binaries.

/// Initialize logging with the `info` default level.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber setup (filters, formatting).
pub mod tracing;

pub use crate::tracing::{LogFormat, init_with};
