//! Process-wide tracing setup.

/// Initialize process-wide tracing from the process environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&concord_core::ProcessEnv);
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use tracing::LogFormat;
