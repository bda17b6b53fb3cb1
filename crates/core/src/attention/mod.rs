//! Batched attention: metadata, kernel seam, and the mode dispatcher.

pub mod backend;
pub mod kernel;
pub mod layer;
pub mod metadata;
pub mod naive;

pub use backend::BatchedAttentionBackend;
pub use kernel::{AttentionKernels, DecodeArgs, ExtendArgs};
pub use layer::AttentionLayer;
pub use metadata::{
    exclusive_cumsum, DecodeMetadata, ExtendMetadata, ForwardMetadata, MetadataBuilder,
};
pub use naive::NaiveKernels;
