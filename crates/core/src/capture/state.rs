//! Fixed-identity buffers for captured decode plans.
//!
//! A captured plan records the addresses of the offset table and scratch
//! accumulator, so both are allocated once at their worst-case size and only
//! their contents change afterwards. Replay rewrites the offset table for
//! the live batch; nothing is reallocated or reshaped.

use std::collections::BTreeSet;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, trace, warn};

use crate::attention::metadata::{exclusive_cumsum, DecodeMetadata};
use crate::error::{AttentionError, Result};

/// Copy `src` into `dst` without changing `dst`'s storage.
///
/// Both tensors must agree on dtype, element count, and device. `dst` must be
/// contiguous.
pub fn copy_inplace(dst: &Tensor, src: &Tensor) -> Result<()> {
    if dst.dtype() != src.dtype() {
        return Err(AttentionError::shape(
            "in-place copy dtype",
            format!("{:?}", dst.dtype()),
            format!("{:?}", src.dtype()),
        ));
    }
    if dst.elem_count() != src.elem_count() {
        return Err(AttentionError::shape(
            "in-place copy elements",
            dst.elem_count(),
            src.elem_count(),
        ));
    }
    if dst.device().location() != src.device().location() {
        return Err(AttentionError::shape(
            "in-place copy device",
            format!("{:?}", dst.device().location()),
            format!("{:?}", src.device().location()),
        ));
    }
    if dst.elem_count() == 0 {
        return Ok(());
    }
    let src = src.reshape(dst.shape())?;
    dst.slice_set(&src, 0, 0)?;
    Ok(())
}

/// Offset table and scratch accumulator shared by every captured decode plan.
///
/// Single writer: the owner must not replay a new batch while a kernel
/// launched against the previous contents is still logically in flight.
#[derive(Debug)]
pub struct CaptureState {
    /// `[max_batch_size]` U32.
    start_loc: Tensor,
    /// `[num_heads, max_batch_size * max_context_len]`.
    attn_logits: Tensor,
    max_batch_size: usize,
    max_context_len: usize,
    captured: BTreeSet<usize>,
}

impl CaptureState {
    pub fn new(
        max_batch_size: usize,
        max_context_len: usize,
        num_heads: usize,
        reduce_dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let start_loc = Tensor::zeros((max_batch_size,), DType::U32, device)?;
        let attn_logits = Tensor::zeros(
            (num_heads, max_batch_size * max_context_len),
            reduce_dtype,
            device,
        )?;
        info!(
            max_batch_size,
            max_context_len,
            num_heads,
            dtype = ?reduce_dtype,
            "allocated capture state"
        );
        Ok(Self {
            start_loc,
            attn_logits,
            max_batch_size,
            max_context_len,
            captured: BTreeSet::new(),
        })
    }

    pub fn start_loc(&self) -> &Tensor {
        &self.start_loc
    }

    pub fn attn_logits(&self) -> &Tensor {
        &self.attn_logits
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_context_len(&self) -> usize {
        self.max_context_len
    }

    pub fn is_captured(&self, batch_size: usize) -> bool {
        self.captured.contains(&batch_size)
    }

    /// Captured batch sizes, ascending.
    pub fn captured_sizes(&self) -> Vec<usize> {
        self.captured.iter().copied().collect()
    }

    fn check_capacity(&self, batch_size: usize, seq_lens: &[usize]) -> Result<()> {
        if batch_size > self.max_batch_size {
            return Err(AttentionError::CapacityOverflow {
                what: "batch size",
                requested: batch_size,
                capacity: self.max_batch_size,
            });
        }
        if seq_lens.len() < batch_size {
            return Err(AttentionError::InconsistentBatch(format!(
                "{} sequence lengths for batch size {batch_size}",
                seq_lens.len()
            )));
        }
        if let Some(&len) = seq_lens[..batch_size]
            .iter()
            .find(|&&l| l > self.max_context_len)
        {
            return Err(AttentionError::CapacityOverflow {
                what: "sequence length",
                requested: len,
                capacity: self.max_context_len,
            });
        }
        Ok(())
    }

    /// Metadata for recording a plan at `batch_size`.
    ///
    /// The returned tensors alias the capture buffers, so later replays are
    /// visible through them. `max_seq_len` is pinned to the context length
    /// because the plan must cover any batch replayed into it.
    pub fn begin_capture(
        &mut self,
        batch_size: usize,
        req_pool_indices: &[usize],
        seq_lens: &[usize],
    ) -> Result<DecodeMetadata> {
        self.check_capacity(batch_size, seq_lens)?;
        if req_pool_indices.len() < batch_size {
            return Err(AttentionError::InconsistentBatch(format!(
                "{} request indices for batch size {batch_size}",
                req_pool_indices.len()
            )));
        }

        let metadata = self.metadata(batch_size)?;
        self.captured.insert(batch_size);
        debug!(batch_size, "captured decode metadata");
        Ok(metadata)
    }

    /// Views of the capture buffers for a plan at `batch_size`.
    pub fn metadata(&self, batch_size: usize) -> Result<DecodeMetadata> {
        if batch_size > self.max_batch_size {
            return Err(AttentionError::CapacityOverflow {
                what: "batch size",
                requested: batch_size,
                capacity: self.max_batch_size,
            });
        }
        Ok(DecodeMetadata {
            start_loc: self.start_loc.narrow(0, 0, batch_size)?,
            attn_logits: self.attn_logits.clone(),
            max_seq_len: self.max_context_len,
        })
    }

    /// Rewrite the offset table for a live batch of `batch_size` requests.
    ///
    /// Entries `>= batch_size` are zeroed and never read by the kernel.
    /// Capacity is checked before any write, so a rejected replay leaves the
    /// table as it was.
    pub fn replay(&mut self, batch_size: usize, seq_lens: &[usize]) -> Result<()> {
        self.check_capacity(batch_size, seq_lens)?;
        if batch_size > 0 && !self.is_captured(batch_size) {
            warn!(batch_size, "replaying batch size that was never captured");
        }

        let mut table = vec![0u32; self.max_batch_size];
        table[..batch_size].copy_from_slice(&exclusive_cumsum(&seq_lens[..batch_size])?);
        let src = Tensor::from_vec(table, (self.max_batch_size,), self.start_loc.device())?;
        copy_inplace(&self.start_loc, &src)?;

        trace!(batch_size, "replayed capture state");
        Ok(())
    }
}
