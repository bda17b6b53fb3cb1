/// Per-layer attention constants passed through to the kernels.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionLayer {
    pub layer_id: usize,
    /// Query heads on this rank.
    pub num_q_heads: usize,
    pub num_kv_heads: usize,
    pub qk_head_dim: usize,
    /// May differ from `qk_head_dim` (e.g. latent attention variants).
    pub v_head_dim: usize,
    pub scaling: f64,
    /// Soft cap on attention logits; 0 disables.
    pub logit_cap: f64,
}

impl AttentionLayer {
    /// Layer with equal q/k/v head dims and `1/sqrt(head_dim)` scaling.
    pub fn new(layer_id: usize, num_q_heads: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            layer_id,
            num_q_heads,
            num_kv_heads,
            qk_head_dim: head_dim,
            v_head_dim: head_dim,
            scaling: 1.0 / (head_dim as f64).sqrt(),
            logit_cap: 0.0,
        }
    }

    pub fn with_v_head_dim(mut self, v_head_dim: usize) -> Self {
        self.v_head_dim = v_head_dim;
        self
    }

    pub fn with_scaling(mut self, scaling: f64) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn with_logit_cap(mut self, logit_cap: f64) -> Self {
        self.logit_cap = logit_cap;
        self
    }

    /// Query heads sharing each kv head.
    pub fn num_kv_groups(&self) -> usize {
        self.num_q_heads / self.num_kv_heads.max(1)
    }
}
