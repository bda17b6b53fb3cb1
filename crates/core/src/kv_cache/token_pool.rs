use candle_core::{DType, Tensor};

use super::config::KvPoolConfig;
use super::error::CacheError;

/// Cache-pool interface consumed by the attention backend.
///
/// The backend only writes the current batch's keys/values and hands the
/// per-layer buffers to the kernel; it never owns the memory.
pub trait KvPool {
    /// Write `k`/`v` (one row per token) into `loc` slots of `layer_id`.
    fn set_kv_buffer(
        &mut self,
        layer_id: usize,
        loc: &[usize],
        k: &Tensor,
        v: &Tensor,
    ) -> Result<(), CacheError>;

    /// Full key buffer for a layer: `[size, num_kv_heads, qk_head_dim]`.
    fn key_buffer(&self, layer_id: usize) -> Result<&Tensor, CacheError>;

    /// Full value buffer for a layer: `[size, num_kv_heads, v_head_dim]`.
    fn value_buffer(&self, layer_id: usize) -> Result<&Tensor, CacheError>;
}

/// Token-granular KV pool: one slot per cached token, per layer.
///
/// Buffers are allocated once at construction and written in place by
/// scattering along the slot axis.
pub struct TokenToKvPool {
    k_buffers: Vec<Tensor>,
    v_buffers: Vec<Tensor>,
    size: usize,
    num_kv_heads: usize,
    qk_head_dim: usize,
    v_head_dim: usize,
    dtype: DType,
}

impl TokenToKvPool {
    pub fn new(config: &KvPoolConfig) -> Result<Self, CacheError> {
        let mut k_buffers = Vec::with_capacity(config.num_layers);
        let mut v_buffers = Vec::with_capacity(config.num_layers);
        for _ in 0..config.num_layers {
            k_buffers.push(Tensor::zeros(
                (config.size, config.num_kv_heads, config.qk_head_dim),
                config.dtype,
                &config.device,
            )?);
            v_buffers.push(Tensor::zeros(
                (config.size, config.num_kv_heads, config.v_head_dim),
                config.dtype,
                &config.device,
            )?);
        }
        Ok(Self {
            k_buffers,
            v_buffers,
            size: config.size,
            num_kv_heads: config.num_kv_heads,
            qk_head_dim: config.qk_head_dim,
            v_head_dim: config.v_head_dim,
            dtype: config.dtype,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn num_layers(&self) -> usize {
        self.k_buffers.len()
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn check_layer(&self, layer_id: usize) -> Result<(), CacheError> {
        if layer_id >= self.k_buffers.len() {
            return Err(CacheError::LayerOutOfRange {
                layer_id,
                num_layers: self.k_buffers.len(),
            });
        }
        Ok(())
    }

    /// Normalize `t` to `[tokens, num_kv_heads, head_dim]` in pool dtype.
    fn to_token_rows(
        &self,
        t: &Tensor,
        what: &'static str,
        tokens: usize,
        head_dim: usize,
    ) -> Result<Tensor, CacheError> {
        let width = self.num_kv_heads * head_dim;
        if t.elem_count() != tokens * width {
            return Err(CacheError::TokenWidthMismatch {
                what,
                expected: width,
                actual: t.elem_count() / tokens.max(1),
            });
        }
        Ok(t
            .reshape((tokens, self.num_kv_heads, head_dim))?
            .to_dtype(self.dtype)?
            .contiguous()?)
    }
}

/// Scatter `src` rows `[n, heads, dim]` into `buffer` at slot indices `loc`.
fn scatter_rows(buffer: &Tensor, loc: &[usize], src: &Tensor) -> Result<(), CacheError> {
    let (n, heads, dim) = src.dims3()?;
    let indices = Tensor::from_vec(
        loc.iter().map(|&s| s as u32).collect::<Vec<_>>(),
        (n,),
        buffer.device(),
    )?;
    let indices = indices
        .reshape((n, 1, 1))?
        .expand((n, heads, dim))?
        .contiguous()?;
    buffer.scatter_set(&indices, src, 0)?;
    Ok(())
}

impl KvPool for TokenToKvPool {
    fn set_kv_buffer(
        &mut self,
        layer_id: usize,
        loc: &[usize],
        k: &Tensor,
        v: &Tensor,
    ) -> Result<(), CacheError> {
        self.check_layer(layer_id)?;
        let tokens = loc.len();
        let k_tokens = k.dims().first().copied().unwrap_or(0);
        if k_tokens != tokens {
            return Err(CacheError::SlotCountMismatch {
                slots: tokens,
                tokens: k_tokens,
            });
        }
        if tokens == 0 {
            return Ok(());
        }
        if let Some(&slot) = loc.iter().find(|&&s| s >= self.size) {
            return Err(CacheError::SlotOutOfRange {
                slot,
                size: self.size,
            });
        }

        let k_rows = self.to_token_rows(k, "keys", tokens, self.qk_head_dim)?;
        let v_rows = self.to_token_rows(v, "values", tokens, self.v_head_dim)?;
        scatter_rows(&self.k_buffers[layer_id], loc, &k_rows)?;
        scatter_rows(&self.v_buffers[layer_id], loc, &v_rows)?;
        Ok(())
    }

    fn key_buffer(&self, layer_id: usize) -> Result<&Tensor, CacheError> {
        self.check_layer(layer_id)?;
        Ok(&self.k_buffers[layer_id])
    }

    fn value_buffer(&self, layer_id: usize) -> Result<&Tensor, CacheError> {
        self.check_layer(layer_id)?;
        Ok(&self.v_buffers[layer_id])
    }
}
