use candle_core::{DType, Device};

use crate::capture::CaptureConfig;
use crate::config::AttentionConfig;
use crate::kv_cache::{CacheError, KvPoolConfig, ReqToTokenPool, TokenToKvPool};

/// Single-rank config with F32 reduction and capture sizes `[1, 2, 4, 8]`.
pub fn tiny_attention_config(num_heads: usize, context_len: usize) -> AttentionConfig {
    AttentionConfig {
        num_attention_heads: num_heads,
        tp_size: 1,
        context_len,
        reduce_in_fp32: true,
        enable_dp_attention: false,
        capture: CaptureConfig {
            enabled: true,
            capture_sizes: vec![1, 2, 4, 8],
            max_capture_size: 8,
        },
    }
}

/// F32 CPU cache pool plus routing table with a bump allocator for slots.
pub struct CacheFixture {
    pub pool: TokenToKvPool,
    pub req_to_token: ReqToTokenPool,
    next_slot: usize,
}

impl CacheFixture {
    pub fn new(
        num_layers: usize,
        num_kv_heads: usize,
        qk_head_dim: usize,
        v_head_dim: usize,
        pool_size: usize,
        max_requests: usize,
        max_context_len: usize,
    ) -> Result<Self, CacheError> {
        let config = KvPoolConfig {
            size: pool_size,
            num_layers,
            num_kv_heads,
            qk_head_dim,
            v_head_dim,
            dtype: DType::F32,
            device: Device::Cpu,
        };
        Self::with_pool_config(&config, max_requests, max_context_len)
    }

    /// Size the pool from a byte budget instead of a slot count.
    #[allow(clippy::too_many_arguments)]
    pub fn with_memory_budget(
        budget_bytes: usize,
        num_layers: usize,
        num_kv_heads: usize,
        qk_head_dim: usize,
        v_head_dim: usize,
        max_requests: usize,
        max_context_len: usize,
    ) -> Result<Self, CacheError> {
        let config = KvPoolConfig::from_memory_budget(
            budget_bytes,
            num_layers,
            num_kv_heads,
            qk_head_dim,
            v_head_dim,
            DType::F32,
            Device::Cpu,
        );
        Self::with_pool_config(&config, max_requests, max_context_len)
    }

    fn with_pool_config(
        config: &KvPoolConfig,
        max_requests: usize,
        max_context_len: usize,
    ) -> Result<Self, CacheError> {
        let pool = TokenToKvPool::new(config)?;
        let req_to_token = ReqToTokenPool::new(max_requests, max_context_len, &config.device)?;
        Ok(Self {
            pool,
            req_to_token,
            next_slot: 0,
        })
    }

    /// Reserve a request row, or `None` if the routing table is full.
    pub fn alloc_request(&mut self) -> Option<usize> {
        self.req_to_token.alloc(1).and_then(|v| v.first().copied())
    }

    /// Reserve `n` fresh cache slots for request `req_idx` at token
    /// positions `start..start + n` and record them in the routing table.
    pub fn append_tokens(
        &mut self,
        req_idx: usize,
        start: usize,
        n: usize,
    ) -> Result<Vec<usize>, CacheError> {
        let end = self.next_slot + n;
        if end > self.pool.size() {
            return Err(CacheError::SlotOutOfRange {
                slot: end - 1,
                size: self.pool.size(),
            });
        }
        let slots: Vec<usize> = (self.next_slot..end).collect();
        self.req_to_token.write(req_idx, start, &slots)?;
        self.next_slot = end;
        Ok(slots)
    }
}
