//! Per-batch offset metadata for the attention kernels.
//!
//! Decode needs a start offset per request into the concatenated token axis
//! plus a scratch accumulator spanning that axis. Extend only needs the
//! longest new span; the kernel derives its own offsets from the per-request
//! lengths passed alongside.

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::error::{AttentionError, Result};
use crate::forward_batch::ForwardMode;

/// Decode-mode metadata.
#[derive(Debug, Clone)]
pub struct DecodeMetadata {
    /// `[batch_size]` U32, exclusive prefix sum of sequence lengths.
    pub start_loc: Tensor,
    /// `[num_heads, total_tokens]` scratch in reduction precision.
    pub attn_logits: Tensor,
    pub max_seq_len: usize,
}

impl DecodeMetadata {
    /// Width of the scratch accumulator.
    pub fn total_tokens(&self) -> usize {
        self.attn_logits.dims().get(1).copied().unwrap_or(0)
    }
}

/// Extend-mode metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendMetadata {
    /// Longest new-token span in the batch, 0 when empty.
    pub max_extend_len: usize,
}

#[derive(Debug, Clone)]
pub enum ForwardMetadata {
    Decode(DecodeMetadata),
    Extend(ExtendMetadata),
}

impl ForwardMetadata {
    pub fn mode(&self) -> ForwardMode {
        match self {
            Self::Decode(_) => ForwardMode::Decode,
            Self::Extend(_) => ForwardMode::Extend,
        }
    }

    pub fn as_decode(&self) -> Result<&DecodeMetadata> {
        match self {
            Self::Decode(m) => Ok(m),
            Self::Extend(_) => Err(AttentionError::MetadataModeMismatch {
                expected: ForwardMode::Decode.as_str(),
                found: ForwardMode::Extend.as_str(),
            }),
        }
    }

    pub fn as_extend(&self) -> Result<&ExtendMetadata> {
        match self {
            Self::Extend(m) => Ok(m),
            Self::Decode(_) => Err(AttentionError::MetadataModeMismatch {
                expected: ForwardMode::Extend.as_str(),
                found: ForwardMode::Decode.as_str(),
            }),
        }
    }
}

/// `out[0] = 0`, `out[i] = out[i-1] + lens[i-1]`.
///
/// Offsets are U32 on the device; one that does not fit is
/// `CapacityOverflow`.
pub fn exclusive_cumsum(lens: &[usize]) -> Result<Vec<u32>> {
    let mut out = Vec::with_capacity(lens.len());
    let mut acc = 0usize;
    for &len in lens {
        let offset = u32::try_from(acc).map_err(|_| AttentionError::CapacityOverflow {
            what: "token offset",
            requested: acc,
            capacity: u32::MAX as usize,
        })?;
        out.push(offset);
        acc = acc.saturating_add(len);
    }
    Ok(out)
}

/// Builds fresh metadata for batches that do not go through capture/replay.
#[derive(Debug, Clone)]
pub struct MetadataBuilder {
    num_heads: usize,
    reduce_dtype: DType,
    device: Device,
}

impl MetadataBuilder {
    pub fn new(num_heads: usize, reduce_dtype: DType, device: Device) -> Self {
        Self {
            num_heads,
            reduce_dtype,
            device,
        }
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn reduce_dtype(&self) -> DType {
        self.reduce_dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn build_decode(&self, seq_lens: &[usize]) -> Result<DecodeMetadata> {
        let start_loc = exclusive_cumsum(seq_lens)?;
        let total_tokens: usize = seq_lens.iter().sum();
        let max_seq_len = seq_lens.iter().copied().max().unwrap_or(0);

        let start_loc = Tensor::from_vec(start_loc, (seq_lens.len(),), &self.device)?;
        let attn_logits =
            Tensor::zeros((self.num_heads, total_tokens), self.reduce_dtype, &self.device)?;

        debug!(
            batch_size = seq_lens.len(),
            total_tokens, max_seq_len, "built decode metadata"
        );
        Ok(DecodeMetadata {
            start_loc,
            attn_logits,
            max_seq_len,
        })
    }

    /// Requests whose whole sequence is already cached contribute a span of 0.
    pub fn build_extend(&self, seq_lens: &[usize], prefix_lens: &[usize]) -> Result<ExtendMetadata> {
        if seq_lens.len() != prefix_lens.len() {
            return Err(AttentionError::InconsistentBatch(format!(
                "{} sequence lengths but {} prefix lengths",
                seq_lens.len(),
                prefix_lens.len()
            )));
        }
        let mut max_extend_len = 0;
        for (i, (&seq_len, &prefix_len)) in seq_lens.iter().zip(prefix_lens).enumerate() {
            let extend_len = seq_len.checked_sub(prefix_len).ok_or_else(|| {
                AttentionError::InconsistentBatch(format!(
                    "request {i}: prefix length {prefix_len} exceeds sequence length {seq_len}"
                ))
            })?;
            max_extend_len = max_extend_len.max(extend_len);
        }

        debug!(batch_size = seq_lens.len(), max_extend_len, "built extend metadata");
        Ok(ExtendMetadata { max_extend_len })
    }

    pub fn build(
        &self,
        mode: ForwardMode,
        seq_lens: &[usize],
        prefix_lens: Option<&[usize]>,
    ) -> Result<ForwardMetadata> {
        match mode {
            ForwardMode::Decode => Ok(ForwardMetadata::Decode(self.build_decode(seq_lens)?)),
            ForwardMode::Extend => {
                let prefix_lens = prefix_lens.ok_or_else(|| {
                    AttentionError::InconsistentBatch(
                        "extend metadata requires prefix lengths".to_string(),
                    )
                })?;
                Ok(ForwardMetadata::Extend(
                    self.build_extend(seq_lens, prefix_lens)?,
                ))
            }
        }
    }
}
