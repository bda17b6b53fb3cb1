//! Attention backend configuration.
//!
//! Loaded from TOML; every field has a default so partial files work:
//!
//! ```toml
//! num_attention_heads = 32
//! tp_size = 2
//! context_len = 8192
//! reduce_in_fp32 = true
//!
//! [capture]
//! enabled = true
//! capture_sizes = [1, 2, 4, 8]
//! ```

use std::fs;
use std::path::Path;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::capture::CaptureConfig;
use crate::error::{AttentionError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Query heads of the full (unsharded) model.
    pub num_attention_heads: usize,
    /// Tensor-parallel degree; heads are split evenly across ranks.
    pub tp_size: usize,
    /// Model context length, the worst case a captured plan must cover.
    pub context_len: usize,
    /// Accumulate decode scratch in F32 instead of F16.
    pub reduce_in_fp32: bool,
    /// Data-parallel attention: every rank keeps all heads.
    pub enable_dp_attention: bool,
    pub capture: CaptureConfig,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            num_attention_heads: 32,
            tp_size: 1,
            context_len: 4096,
            reduce_in_fp32: false,
            enable_dp_attention: false,
            capture: CaptureConfig::default(),
        }
    }
}

impl AttentionConfig {
    /// Heads handled by this rank.
    pub fn num_heads(&self) -> usize {
        if self.enable_dp_attention {
            self.num_attention_heads
        } else {
            self.num_attention_heads / self.tp_size.max(1)
        }
    }

    /// Precision of the decode scratch accumulator.
    pub fn reduce_dtype(&self) -> DType {
        if self.reduce_in_fp32 {
            DType::F32
        } else {
            DType::F16
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 {
            return Err(AttentionError::InvalidConfig(
                "num_attention_heads must be positive".to_string(),
            ));
        }
        if self.tp_size == 0 {
            return Err(AttentionError::InvalidConfig(
                "tp_size must be positive".to_string(),
            ));
        }
        if !self.enable_dp_attention && self.num_attention_heads % self.tp_size != 0 {
            return Err(AttentionError::InvalidConfig(format!(
                "num_attention_heads {} not divisible by tp_size {}",
                self.num_attention_heads, self.tp_size
            )));
        }
        if self.context_len == 0 {
            return Err(AttentionError::InvalidConfig(
                "context_len must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| AttentionError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            AttentionError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }
}
