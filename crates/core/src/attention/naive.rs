//! Reference attention kernels built from plain tensor ops.
//!
//! Works on any candle device. Computes in F32 one request at a time and
//! writes each request's rows into the output view. Useful for correctness
//! testing and as a CPU fallback; not meant to be fast.

use candle_core::{bail, DType, Result, Tensor};

use super::kernel::{AttentionKernels, DecodeArgs, ExtendArgs};

pub struct NaiveKernels;

impl NaiveKernels {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NaiveKernels {
    fn default() -> Self {
        Self::new()
    }
}

impl AttentionKernels for NaiveKernels {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn decode_attention_fwd(&self, args: &DecodeArgs<'_>) -> Result<()> {
        let (batch, num_q_heads, _) = args.q.dims3()?;
        let groups = kv_groups(num_q_heads, args.k_buffer)?;
        let req_pool_indices = args.req_pool_indices.to_vec1::<u32>()?;
        let start_loc = args.start_loc.to_vec1::<u32>()?;
        let seq_lens = args.seq_lens.to_vec1::<u32>()?;
        if req_pool_indices.len() < batch || start_loc.len() < batch || seq_lens.len() < batch {
            bail!("decode kernel: per-request tensors shorter than batch {batch}");
        }
        let q = args.q.to_dtype(DType::F32)?;

        for i in 0..batch {
            let len = seq_lens[i] as usize;
            if len == 0 {
                continue;
            }
            let slots = request_slots(args.req_to_token, req_pool_indices[i], len)?;
            let k = gather_heads(args.k_buffer, &slots, groups)?;
            let v = gather_heads(args.v_buffer, &slots, groups)?;

            // [heads, 1, d] x [heads, d, len] -> [heads, len]
            let q_i = q.get(i)?.unsqueeze(1)?;
            let scores = (q_i.matmul(&k.t()?.contiguous()?)? * args.scaling)?.squeeze(1)?;
            let scores = soft_cap(scores, args.logit_cap)?;

            // Stage scores in the scratch accumulator, then reduce from it
            let start = start_loc[i] as usize;
            args.attn_logits.slice_set(
                &scores.to_dtype(args.attn_logits.dtype())?.contiguous()?,
                1,
                start,
            )?;
            let scores = args
                .attn_logits
                .narrow(1, start, len)?
                .to_dtype(DType::F32)?
                .contiguous()?;
            let probs = candle_nn::ops::softmax_last_dim(&scores)?;

            let out = probs.unsqueeze(1)?.matmul(&v)?.squeeze(1)?;
            args.o.slice_set(
                &out.unsqueeze(0)?.to_dtype(args.o.dtype())?.contiguous()?,
                0,
                i,
            )?;
        }
        Ok(())
    }

    fn extend_attention_fwd(&self, args: &ExtendArgs<'_>) -> Result<()> {
        let (_, num_q_heads, _) = args.q.dims3()?;
        let groups = kv_groups(num_q_heads, args.k_buffer)?;
        let req_pool_indices = args.req_pool_indices.to_vec1::<u32>()?;
        let seq_lens = args.seq_lens.to_vec1::<u32>()?;
        let extend_seq_lens = args.extend_seq_lens.to_vec1::<u32>()?;
        let extend_start_loc = args.extend_start_loc.to_vec1::<u32>()?;
        let batch = seq_lens.len();
        if req_pool_indices.len() < batch
            || extend_seq_lens.len() < batch
            || extend_start_loc.len() < batch
        {
            bail!("extend kernel: per-request tensors shorter than batch {batch}");
        }

        for i in 0..batch {
            let new_len = extend_seq_lens[i] as usize;
            if new_len == 0 {
                continue;
            }
            let len = seq_lens[i] as usize;
            let Some(prefix_len) = len.checked_sub(new_len) else {
                bail!("extend kernel: request {i} has {new_len} new tokens but length {len}");
            };
            let start = extend_start_loc[i] as usize;

            let k_new = args.k.narrow(0, start, new_len)?.to_dtype(DType::F32)?;
            let v_new = args.v.narrow(0, start, new_len)?.to_dtype(DType::F32)?;
            let (k_seq, v_seq) = if prefix_len > 0 {
                let slots = request_slots(args.req_to_token, req_pool_indices[i], prefix_len)?;
                let k_prefix = args.k_buffer.index_select(&slots, 0)?.to_dtype(DType::F32)?;
                let v_prefix = args.v_buffer.index_select(&slots, 0)?.to_dtype(DType::F32)?;
                (
                    Tensor::cat(&[&k_prefix, &k_new], 0)?,
                    Tensor::cat(&[&v_prefix, &v_new], 0)?,
                )
            } else {
                (k_new, v_new)
            };
            let k = repeat_heads(k_seq.transpose(0, 1)?, groups)?;
            let v = repeat_heads(v_seq.transpose(0, 1)?, groups)?;

            // [heads, new, d] x [heads, d, len] -> [heads, new, len]
            let q_i = args
                .q
                .narrow(0, start, new_len)?
                .to_dtype(DType::F32)?
                .transpose(0, 1)?
                .contiguous()?;
            let scores = (q_i.matmul(&k.t()?.contiguous()?)? * args.scaling)?;
            let scores = soft_cap(scores, args.logit_cap)?;
            let mask = causal_mask(prefix_len, new_len, args.q.device())?;
            let scores = scores.broadcast_add(&mask)?;
            let probs = candle_nn::ops::softmax_last_dim(&scores)?;

            // [heads, new, dv] -> [new, heads, dv]
            let out = probs.matmul(&v)?.transpose(0, 1)?;
            args.o
                .slice_set(&out.to_dtype(args.o.dtype())?.contiguous()?, 0, start)?;
        }
        Ok(())
    }
}

fn kv_groups(num_q_heads: usize, k_buffer: &Tensor) -> Result<usize> {
    let num_kv_heads = k_buffer.dim(1)?;
    if num_kv_heads == 0 || num_q_heads % num_kv_heads != 0 {
        bail!("query heads {num_q_heads} not a multiple of kv heads {num_kv_heads}");
    }
    Ok(num_q_heads / num_kv_heads)
}

/// First `len` cache slots of a request, as U32 indices.
fn request_slots(req_to_token: &Tensor, req_idx: u32, len: usize) -> Result<Tensor> {
    req_to_token
        .get(req_idx as usize)?
        .narrow(0, 0, len)?
        .contiguous()
}

/// Gather `[len, kv_heads, d]` rows and lay them out as `[q_heads, len, d]`.
fn gather_heads(buffer: &Tensor, slots: &Tensor, groups: usize) -> Result<Tensor> {
    let rows = buffer.index_select(slots, 0)?.to_dtype(DType::F32)?;
    repeat_heads(rows.transpose(0, 1)?, groups)
}

/// GQA: `[kv_heads, len, d]` -> `[kv_heads * groups, len, d]`.
fn repeat_heads(x: Tensor, groups: usize) -> Result<Tensor> {
    if groups == 1 {
        return x.contiguous();
    }
    let (kv_heads, len, d) = x.dims3()?;
    x.unsqueeze(1)?
        .expand((kv_heads, groups, len, d))?
        .reshape((kv_heads * groups, len, d))?
        .contiguous()
}

fn soft_cap(scores: Tensor, cap: f64) -> Result<Tensor> {
    if cap > 0.0 {
        (scores / cap)?.tanh()? * cap
    } else {
        Ok(scores)
    }
}

/// `[new, prefix + new]` additive mask: new token `j` sees positions `0..=prefix + j`.
fn causal_mask(prefix_len: usize, new_len: usize, device: &candle_core::Device) -> Result<Tensor> {
    let len = prefix_len + new_len;
    let mask: Vec<f32> = (0..new_len)
        .flat_map(|j| {
            (0..len).map(move |t| {
                if t <= prefix_len + j {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    Tensor::from_vec(mask, (new_len, len), device)
}
