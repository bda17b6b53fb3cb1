//! Kernel seam for batched attention.
//!
//! The backend computes offsets and scratch buffers, writes the step's keys
//! and values into the cache, then hands everything to an [`AttentionKernels`]
//! implementation supplied at construction. Kernels write their result into
//! the caller-allocated output view `o` and return nothing.

use candle_core::{Result, Tensor};

/// Inputs to a decode launch. One query row per request.
#[derive(Debug, Clone, Copy)]
pub struct DecodeArgs<'a> {
    /// `[batch, num_q_heads, qk_head_dim]`
    pub q: &'a Tensor,
    /// `[pool_size, num_kv_heads, qk_head_dim]`
    pub k_buffer: &'a Tensor,
    /// `[pool_size, num_kv_heads, v_head_dim]`
    pub v_buffer: &'a Tensor,
    /// `[batch, num_q_heads, v_head_dim]`, written in place.
    pub o: &'a Tensor,
    /// `[num_requests, max_context_len]` U32 routing table.
    pub req_to_token: &'a Tensor,
    /// `[batch]` U32
    pub req_pool_indices: &'a Tensor,
    /// `[batch]` U32, offset of each request into `attn_logits`.
    pub start_loc: &'a Tensor,
    /// `[batch]` U32
    pub seq_lens: &'a Tensor,
    /// `[num_q_heads, total_tokens]` scratch; contents on entry are ignored.
    pub attn_logits: &'a Tensor,
    pub max_seq_len: usize,
    pub scaling: f64,
    pub logit_cap: f64,
}

/// Inputs to an extend launch. Token rows of all requests are concatenated.
#[derive(Debug, Clone, Copy)]
pub struct ExtendArgs<'a> {
    /// `[tokens, num_q_heads, qk_head_dim]`
    pub q: &'a Tensor,
    /// `[tokens, num_kv_heads, qk_head_dim]`, keys of the new tokens.
    pub k: &'a Tensor,
    /// `[tokens, num_kv_heads, v_head_dim]`
    pub v: &'a Tensor,
    /// `[tokens, num_q_heads, v_head_dim]`, written in place.
    pub o: &'a Tensor,
    pub k_buffer: &'a Tensor,
    pub v_buffer: &'a Tensor,
    pub req_to_token: &'a Tensor,
    /// `[batch]` U32
    pub req_pool_indices: &'a Tensor,
    /// `[batch]` U32, prefix plus new tokens.
    pub seq_lens: &'a Tensor,
    /// `[batch]` U32, new tokens per request.
    pub extend_seq_lens: &'a Tensor,
    /// `[batch]` U32, first row of each request in `q`/`k`/`v`/`o`.
    pub extend_start_loc: &'a Tensor,
    pub max_extend_len: usize,
    pub scaling: f64,
    pub logit_cap: f64,
}

/// Attention compute primitives.
///
/// Implementations must only read the first `batch` entries of the per-request
/// tensors and must not assume `attn_logits` is zeroed.
pub trait AttentionKernels: Send + Sync {
    /// Returns the name of this kernel set.
    fn name(&self) -> &'static str;

    fn decode_attention_fwd(&self, args: &DecodeArgs<'_>) -> Result<()>;

    fn extend_attention_fwd(&self, args: &ExtendArgs<'_>) -> Result<()>;
}
