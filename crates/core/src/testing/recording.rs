use std::sync::{Arc, Mutex};

use candle_core::Result;

use crate::attention::kernel::{AttentionKernels, DecodeArgs, ExtendArgs};
use crate::forward_batch::ForwardMode;

/// One kernel launch as seen by [`RecordingKernels`].
#[derive(Debug, Clone, PartialEq)]
pub struct KernelCall {
    pub mode: ForwardMode,
    /// Query rows passed to the kernel.
    pub rows: usize,
    pub req_pool_indices: Vec<u32>,
    pub seq_lens: Vec<u32>,
    /// `start_loc` for decode, `extend_start_loc` for extend.
    pub start_loc: Vec<u32>,
    /// `max_seq_len` for decode, `max_extend_len` for extend.
    pub max_len: usize,
    /// Decode only.
    pub attn_logits_dims: Option<Vec<usize>>,
}

/// Kernels that record every launch and optionally forward to real ones.
///
/// Without an inner kernel the output view is left untouched (zeros).
#[derive(Default)]
pub struct RecordingKernels {
    inner: Option<Arc<dyn AttentionKernels>>,
    calls: Mutex<Vec<KernelCall>>,
}

impl RecordingKernels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrapping(inner: Arc<dyn AttentionKernels>) -> Self {
        Self {
            inner: Some(inner),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<KernelCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn num_calls(&self) -> usize {
        self.calls().len()
    }

    pub fn last_call(&self) -> Option<KernelCall> {
        self.calls().last().cloned()
    }

    fn record(&self, call: KernelCall) -> Result<()> {
        self.calls
            .lock()
            .map_err(|_| candle_core::Error::Msg("recording kernel lock poisoned".to_string()))?
            .push(call);
        Ok(())
    }
}

impl AttentionKernels for RecordingKernels {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn decode_attention_fwd(&self, args: &DecodeArgs<'_>) -> Result<()> {
        self.record(KernelCall {
            mode: ForwardMode::Decode,
            rows: args.q.dim(0)?,
            req_pool_indices: args.req_pool_indices.to_vec1()?,
            seq_lens: args.seq_lens.to_vec1()?,
            start_loc: args.start_loc.to_vec1()?,
            max_len: args.max_seq_len,
            attn_logits_dims: Some(args.attn_logits.dims().to_vec()),
        })?;
        match &self.inner {
            Some(inner) => inner.decode_attention_fwd(args),
            None => Ok(()),
        }
    }

    fn extend_attention_fwd(&self, args: &ExtendArgs<'_>) -> Result<()> {
        self.record(KernelCall {
            mode: ForwardMode::Extend,
            rows: args.q.dim(0)?,
            req_pool_indices: args.req_pool_indices.to_vec1()?,
            seq_lens: args.seq_lens.to_vec1()?,
            start_loc: args.extend_start_loc.to_vec1()?,
            max_len: args.max_extend_len,
            attn_logits_dims: None,
        })?;
        match &self.inner {
            Some(inner) => inner.extend_attention_fwd(args),
            None => Ok(()),
        }
    }
}
