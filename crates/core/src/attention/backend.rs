//! Batched attention dispatcher.
//!
//! Owns the per-step forward metadata and the capture state, writes each
//! step's keys/values into the cache pool, and launches the injected kernels
//! in decode or extend mode as directed by the batch.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::capture::{CaptureState, SEQ_LEN_FILL_VALUE};
use crate::config::AttentionConfig;
use crate::error::{AttentionError, Result};
use crate::forward_batch::{ForwardBatch, ForwardMode};
use crate::kv_cache::{KvPool, ReqToTokenPool};

use super::kernel::{AttentionKernels, DecodeArgs, ExtendArgs};
use super::layer::AttentionLayer;
use super::metadata::{exclusive_cumsum, DecodeMetadata, ForwardMetadata, MetadataBuilder};

/// Coordinates metadata, cache writes, and kernel launches for one
/// attention stack.
///
/// Metadata is set once per step (`init_forward_metadata*`) and shared by
/// every layer's `forward` call in that step.
pub struct BatchedAttentionBackend {
    config: AttentionConfig,
    num_heads: usize,
    device: Device,
    builder: MetadataBuilder,
    kernels: Arc<dyn AttentionKernels>,
    forward_metadata: Option<ForwardMetadata>,
    capture_state: Option<CaptureState>,
}

impl BatchedAttentionBackend {
    pub fn new(
        config: &AttentionConfig,
        device: Device,
        kernels: Arc<dyn AttentionKernels>,
    ) -> Result<Self> {
        config.validate()?;
        let num_heads = config.num_heads();
        let builder = MetadataBuilder::new(num_heads, config.reduce_dtype(), device.clone());
        debug!(
            num_heads,
            kernels = kernels.name(),
            reduce_dtype = ?config.reduce_dtype(),
            "created attention backend"
        );
        Ok(Self {
            config: config.clone(),
            num_heads,
            device,
            builder,
            kernels,
            forward_metadata: None,
            capture_state: None,
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Query heads handled on this rank.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn kernels_name(&self) -> &'static str {
        self.kernels.name()
    }

    pub fn forward_metadata(&self) -> Option<&ForwardMetadata> {
        self.forward_metadata.as_ref()
    }

    pub fn capture_state(&self) -> Option<&CaptureState> {
        self.capture_state.as_ref()
    }

    /// Fresh metadata for `batch`, computed over its local requests.
    pub fn build_metadata(&self, batch: &ForwardBatch) -> Result<ForwardMetadata> {
        let view = batch.local_view()?;
        self.builder
            .build(batch.mode, &view.seq_lens, Some(&view.extend_prefix_lens))
    }

    /// Build and store metadata for the next step.
    pub fn init_forward_metadata(&mut self, batch: &ForwardBatch) -> Result<()> {
        self.forward_metadata = Some(self.build_metadata(batch)?);
        Ok(())
    }

    /// Allocate the capture buffers. Allowed once per backend.
    pub fn init_capture_state(&mut self, max_batch_size: usize) -> Result<()> {
        if self.capture_state.is_some() {
            return Err(AttentionError::CaptureStateAlreadyInitialized);
        }
        self.capture_state = Some(CaptureState::new(
            max_batch_size,
            self.config.context_len,
            self.num_heads,
            self.config.reduce_dtype(),
            &self.device,
        )?);
        Ok(())
    }

    fn capture_state_mut(&mut self) -> Result<&mut CaptureState> {
        self.capture_state
            .as_mut()
            .ok_or(AttentionError::CaptureStateUninitialized)
    }

    /// Point the forward metadata at the capture buffers for `batch_size`.
    pub fn init_forward_metadata_capture(
        &mut self,
        batch_size: usize,
        req_pool_indices: &[usize],
        seq_lens: &[usize],
    ) -> Result<()> {
        let metadata = self
            .capture_state_mut()?
            .begin_capture(batch_size, req_pool_indices, seq_lens)?;
        self.forward_metadata = Some(ForwardMetadata::Decode(metadata));
        Ok(())
    }

    /// Rewrite the capture offsets for a live batch and point the forward
    /// metadata at them. `seq_lens` should already be padded to `batch_size`.
    pub fn init_forward_metadata_replay(
        &mut self,
        batch_size: usize,
        seq_lens: &[usize],
    ) -> Result<()> {
        let state = self.capture_state_mut()?;
        state.replay(batch_size, seq_lens)?;
        let metadata = state.metadata(batch_size)?;
        self.forward_metadata = Some(ForwardMetadata::Decode(metadata));
        Ok(())
    }

    /// Sequence length used for padded rows of a replayed batch.
    pub fn padding_fill_value(&self) -> usize {
        SEQ_LEN_FILL_VALUE
    }

    /// Captured batch size to use for `actual` live requests, if any.
    pub fn capture_batch_size(&self, actual: usize) -> Option<usize> {
        let state = self.capture_state.as_ref()?;
        self.config
            .capture
            .padded_batch_size(actual)
            .filter(|&bs| bs <= state.max_batch_size())
    }

    /// Run attention for one layer, dispatching on `batch.mode`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        layer: &AttentionLayer,
        batch: &ForwardBatch,
        kv_pool: &mut dyn KvPool,
        req_to_token: &ReqToTokenPool,
    ) -> Result<Tensor> {
        match batch.mode {
            ForwardMode::Decode => {
                self.forward_decode(q, k, v, layer, batch, kv_pool, req_to_token)
            }
            ForwardMode::Extend => {
                self.forward_extend(q, k, v, layer, batch, kv_pool, req_to_token)
            }
        }
    }

    /// Extend attention. Returns `[tokens, num_q_heads * v_head_dim]`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_extend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        layer: &AttentionLayer,
        batch: &ForwardBatch,
        kv_pool: &mut dyn KvPool,
        req_to_token: &ReqToTokenPool,
    ) -> Result<Tensor> {
        let metadata = self.stored_metadata()?.as_extend()?;
        self.check_layer(layer)?;
        let view = batch.local_view()?;
        let tokens = view.num_extend_tokens();

        let q = rows(q, tokens, layer.num_q_heads, layer.qk_head_dim, "query")?;
        if batch.out_cache_loc.len() != tokens {
            return Err(AttentionError::shape(
                "new token slots",
                tokens,
                batch.out_cache_loc.len(),
            ));
        }
        let (k, v) = write_kv(layer, batch, k, v, kv_pool)?;

        let o = Tensor::zeros(
            (tokens, layer.num_q_heads * layer.v_head_dim),
            q.dtype(),
            q.device(),
        )?;
        if tokens == 0 {
            return Ok(o);
        }
        let o_view = o.reshape((tokens, layer.num_q_heads, layer.v_head_dim))?;

        let extend_start_loc = exclusive_cumsum(&view.extend_seq_lens)?;
        let device = q.device();
        self.kernels.extend_attention_fwd(&ExtendArgs {
            q: &q,
            k: &k,
            v: &v,
            o: &o_view,
            k_buffer: kv_pool.key_buffer(layer.layer_id)?,
            v_buffer: kv_pool.value_buffer(layer.layer_id)?,
            req_to_token: req_to_token.req_to_token(),
            req_pool_indices: &u32_tensor(&view.req_pool_indices, device)?,
            seq_lens: &u32_tensor(&view.seq_lens, device)?,
            extend_seq_lens: &u32_tensor(&view.extend_seq_lens, device)?,
            extend_start_loc: &Tensor::from_vec(extend_start_loc, (view.batch_size(),), device)?,
            max_extend_len: metadata.max_extend_len,
            scaling: layer.scaling,
            logit_cap: layer.logit_cap,
        })?;
        Ok(o)
    }

    /// Decode attention. Returns `[batch, num_q_heads * v_head_dim]`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_decode(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        layer: &AttentionLayer,
        batch: &ForwardBatch,
        kv_pool: &mut dyn KvPool,
        req_to_token: &ReqToTokenPool,
    ) -> Result<Tensor> {
        let metadata = self.stored_metadata()?.as_decode()?;
        self.check_layer(layer)?;
        let view = batch.local_view()?;
        let batch_size = view.batch_size();

        // Some upstream compiled paths hand over a query with an extra
        // leading axis; flatten to one row per request before anything else.
        let q = rows(q, batch_size, layer.num_q_heads, layer.qk_head_dim, "query")?;
        check_decode_metadata(metadata, &view.seq_lens)?;
        if batch.out_cache_loc.len() != batch_size {
            return Err(AttentionError::shape(
                "new token slots",
                batch_size,
                batch.out_cache_loc.len(),
            ));
        }
        write_kv(layer, batch, k, v, kv_pool)?;

        let o = Tensor::zeros(
            (batch_size, layer.num_q_heads * layer.v_head_dim),
            q.dtype(),
            q.device(),
        )?;
        if batch_size == 0 {
            return Ok(o);
        }
        let o_view = o.reshape((batch_size, layer.num_q_heads, layer.v_head_dim))?;

        let device = q.device();
        self.kernels.decode_attention_fwd(&DecodeArgs {
            q: &q,
            k_buffer: kv_pool.key_buffer(layer.layer_id)?,
            v_buffer: kv_pool.value_buffer(layer.layer_id)?,
            o: &o_view,
            req_to_token: req_to_token.req_to_token(),
            req_pool_indices: &u32_tensor(&view.req_pool_indices, device)?,
            start_loc: &metadata.start_loc,
            seq_lens: &u32_tensor(&view.seq_lens, device)?,
            attn_logits: &metadata.attn_logits,
            max_seq_len: metadata.max_seq_len,
            scaling: layer.scaling,
            logit_cap: layer.logit_cap,
        })?;
        Ok(o)
    }

    fn stored_metadata(&self) -> Result<&ForwardMetadata> {
        self.forward_metadata
            .as_ref()
            .ok_or(AttentionError::MetadataMissing)
    }

    fn check_layer(&self, layer: &AttentionLayer) -> Result<()> {
        if layer.num_q_heads != self.num_heads {
            return Err(AttentionError::shape(
                "layer query heads",
                self.num_heads,
                layer.num_q_heads,
            ));
        }
        if layer.num_kv_heads == 0 || layer.num_q_heads % layer.num_kv_heads != 0 {
            return Err(AttentionError::shape(
                "layer kv heads",
                format!("a divisor of {}", layer.num_q_heads),
                layer.num_kv_heads,
            ));
        }
        Ok(())
    }
}

/// Normalize `t` to `[expected_rows, heads, head_dim]`.
fn rows(
    t: &Tensor,
    expected_rows: usize,
    heads: usize,
    head_dim: usize,
    what: &'static str,
) -> Result<Tensor> {
    let width = heads * head_dim;
    if t.elem_count() != expected_rows * width {
        return Err(AttentionError::shape(
            what,
            format!("{expected_rows} rows of {width}"),
            format!("{:?}", t.dims()),
        ));
    }
    Ok(t.reshape((expected_rows, heads, head_dim))?)
}

/// Write the step's new keys/values at `batch.out_cache_loc` and return them
/// as `[tokens, kv_heads, dim]`.
fn write_kv(
    layer: &AttentionLayer,
    batch: &ForwardBatch,
    k: &Tensor,
    v: &Tensor,
    kv_pool: &mut dyn KvPool,
) -> Result<(Tensor, Tensor)> {
    let tokens = batch.out_cache_loc.len();
    let k = rows(k, tokens, layer.num_kv_heads, layer.qk_head_dim, "key")?;
    let v = rows(v, tokens, layer.num_kv_heads, layer.v_head_dim, "value")?;
    kv_pool.set_kv_buffer(layer.layer_id, &batch.out_cache_loc, &k, &v)?;
    Ok((k, v))
}

/// The stored decode metadata must cover the batch the kernel is about to
/// see: one offset per request, a scratch buffer at least `sum(seq_lens)`
/// wide, and a `max_seq_len` no shorter than the longest request.
fn check_decode_metadata(metadata: &DecodeMetadata, seq_lens: &[usize]) -> Result<()> {
    let start_rows = metadata.start_loc.dim(0)?;
    if start_rows != seq_lens.len() {
        return Err(AttentionError::shape(
            "decode start_loc entries",
            seq_lens.len(),
            start_rows,
        ));
    }
    let total: usize = seq_lens.iter().sum();
    let width = metadata.total_tokens();
    if width < total {
        return Err(AttentionError::shape(
            "decode attn_logits width",
            format!("at least {total}"),
            width,
        ));
    }
    let longest = seq_lens.iter().copied().max().unwrap_or(0);
    if metadata.max_seq_len < longest {
        return Err(AttentionError::shape(
            "decode max_seq_len",
            format!("at least {longest}"),
            metadata.max_seq_len,
        ));
    }
    Ok(())
}

fn u32_tensor(values: &[usize], device: &Device) -> Result<Tensor> {
    let data = values
        .iter()
        .map(|&x| {
            u32::try_from(x).map_err(|_| AttentionError::CapacityOverflow {
                what: "u32 index",
                requested: x,
                capacity: u32::MAX as usize,
            })
        })
        .collect::<Result<Vec<u32>>>()?;
    Ok(Tensor::from_vec(data, (values.len(),), device)?)
}
