use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("layer {layer_id} out of range for pool with {num_layers} layers")]
    LayerOutOfRange { layer_id: usize, num_layers: usize },

    #[error("slot {slot} out of range for pool of size {size}")]
    SlotOutOfRange { slot: usize, size: usize },

    #[error("slot count {slots} does not match token count {tokens}")]
    SlotCountMismatch { slots: usize, tokens: usize },

    #[error("request index {req_idx} out of range for pool of size {size}")]
    RequestOutOfRange { req_idx: usize, size: usize },

    #[error("row write [{start}, {end}) exceeds context length {max_context_len}")]
    ContextOverflow {
        start: usize,
        end: usize,
        max_context_len: usize,
    },

    #[error("{what} has {actual} elements per token, expected {expected}")]
    TokenWidthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
