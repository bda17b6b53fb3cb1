use candle_core::{DType, Device, Tensor};

use super::error::CacheError;

/// Routing table from request pool index to the ordered cache slots holding
/// that request's tokens.
///
/// Layout: `[size, max_context_len]` U32, allocated once. Row `r` column `t`
/// is the KV slot of token `t` of the request occupying index `r`.
pub struct ReqToTokenPool {
    req_to_token: Tensor,
    size: usize,
    max_context_len: usize,
    free_slots: Vec<usize>,
}

impl ReqToTokenPool {
    pub fn new(size: usize, max_context_len: usize, device: &Device) -> Result<Self, CacheError> {
        let req_to_token = Tensor::zeros((size, max_context_len), DType::U32, device)?;
        Ok(Self {
            req_to_token,
            size,
            max_context_len,
            // Pop from the back so indices are handed out in ascending order
            free_slots: (0..size).rev().collect(),
        })
    }

    /// The table tensor handed to kernels.
    pub fn req_to_token(&self) -> &Tensor {
        &self.req_to_token
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_context_len(&self) -> usize {
        self.max_context_len
    }

    pub fn available_size(&self) -> usize {
        self.free_slots.len()
    }

    /// Reserve `need` request indices, or `None` if not enough are free.
    pub fn alloc(&mut self, need: usize) -> Option<Vec<usize>> {
        if need > self.free_slots.len() {
            return None;
        }
        let at = self.free_slots.len() - need;
        let mut taken = self.free_slots.split_off(at);
        taken.reverse();
        Some(taken)
    }

    pub fn free(&mut self, indices: &[usize]) {
        self.free_slots.extend(indices.iter().rev().copied());
    }

    /// Write `slots` into row `req_idx` starting at token position `start`.
    pub fn write(&self, req_idx: usize, start: usize, slots: &[usize]) -> Result<(), CacheError> {
        if req_idx >= self.size {
            return Err(CacheError::RequestOutOfRange {
                req_idx,
                size: self.size,
            });
        }
        let end = start + slots.len();
        if end > self.max_context_len {
            return Err(CacheError::ContextOverflow {
                start,
                end,
                max_context_len: self.max_context_len,
            });
        }
        if slots.is_empty() {
            return Ok(());
        }
        let row = Tensor::from_vec(
            slots.iter().map(|&s| s as u32).collect::<Vec<_>>(),
            (1, slots.len()),
            self.req_to_token.device(),
        )?;
        self.req_to_token
            .narrow(0, req_idx, 1)?
            .slice_set(&row, 1, start)?;
        Ok(())
    }
}
