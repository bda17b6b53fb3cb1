//! Batched attention execution coordinator.
//!
//! Sits between a batch scheduler and the attention kernels: computes the
//! per-batch offset metadata for decode and extend steps, writes new
//! keys/values into the cache pool, and keeps fixed-identity scratch buffers
//! so recurring decode batch shapes can replay a captured plan.

pub mod attention;
pub mod capture;
pub mod config;
pub mod error;
pub mod forward_batch;
pub mod kv_cache;
pub mod logging;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use attention::{
    AttentionKernels, AttentionLayer, BatchedAttentionBackend, ForwardMetadata, NaiveKernels,
};
pub use capture::{CaptureConfig, CaptureState};
pub use config::AttentionConfig;
pub use error::{AttentionError, Result};
pub use forward_batch::{ForwardBatch, ForwardMode, LocalSeqView};
pub use kv_cache::{CacheError, KvPool, ReqToTokenPool, TokenToKvPool};
