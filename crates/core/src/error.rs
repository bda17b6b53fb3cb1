use thiserror::Error;

use crate::kv_cache::CacheError;

/// Errors raised by the attention coordinator.
///
/// All variants are programming or capacity errors; nothing here is
/// transient, so callers should not retry.
#[derive(Error, Debug)]
pub enum AttentionError {
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },

    #[error("capacity overflow: {what} {requested} exceeds capacity {capacity}")]
    CapacityOverflow {
        what: &'static str,
        requested: usize,
        capacity: usize,
    },

    #[error("inconsistent batch: {0}")]
    InconsistentBatch(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("forward metadata not initialized")]
    MetadataMissing,

    #[error("forward metadata mode mismatch: expected {expected}, found {found}")]
    MetadataModeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("capture state not initialized")]
    CaptureStateUninitialized,

    #[error("capture state already initialized")]
    CaptureStateAlreadyInitialized,

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(
        what: &'static str,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AttentionError>;
