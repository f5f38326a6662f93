//! Tracing and logging setup shared by every cropwatch process.

/// Initialize process-wide tracing/logging.
///
/// The output format comes from `CROPWATCH_LOG_FORMAT` (`json` or `pretty`),
/// the filter from `RUST_LOG`. Safe to call multiple times; subsequent calls
/// become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use self::tracing::LogFormat;
