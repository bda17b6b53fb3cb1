//! Shared test utilities for batch-attn-core.
//!
//! Kernel doubles that record launches, plus small fixtures for wiring a
//! backend to a cache pool and routing table on the CPU.

mod fixtures;
mod recording;

pub use fixtures::{tiny_attention_config, CacheFixture};
pub use recording::{KernelCall, RecordingKernels};
