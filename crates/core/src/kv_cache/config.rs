use candle_core::{DType, Device};

/// Shape of the token-level KV pool: one slot holds one token's keys and
/// values for every layer.
#[derive(Debug, Clone)]
pub struct KvPoolConfig {
    pub size: usize,
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub qk_head_dim: usize,
    pub v_head_dim: usize,
    pub dtype: DType,
    pub device: Device,
}

impl KvPoolConfig {
    /// Compute the slot count from a memory budget.
    ///
    /// bytes_per_slot_per_layer = num_kv_heads * (qk_head_dim + v_head_dim) * dtype_size
    /// size = budget_bytes / (num_layers * bytes_per_slot_per_layer)
    pub fn from_memory_budget(
        budget_bytes: usize,
        num_layers: usize,
        num_kv_heads: usize,
        qk_head_dim: usize,
        v_head_dim: usize,
        dtype: DType,
        device: Device,
    ) -> Self {
        let elem_size = dtype.size_in_bytes();
        let bytes_per_slot_per_layer = num_kv_heads * (qk_head_dim + v_head_dim) * elem_size;
        let total_per_slot = num_layers * bytes_per_slot_per_layer;
        let size = if total_per_slot > 0 {
            budget_bytes / total_per_slot
        } else {
            0
        };

        Self {
            size,
            num_layers,
            num_kv_heads,
            qk_head_dim,
            v_head_dim,
            dtype,
            device,
        }
    }
}
