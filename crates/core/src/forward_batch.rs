//! Per-step batch descriptor produced by the scheduler.

use crate::error::{AttentionError, Result};

/// Execution mode of a batch, decided by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardMode {
    /// One new token per request against its cached history.
    Decode,
    /// A variable-length span of new tokens per request on top of a cached prefix.
    Extend,
}

impl ForwardMode {
    pub fn is_decode(self) -> bool {
        matches!(self, Self::Decode)
    }

    pub fn is_extend(self) -> bool {
        matches!(self, Self::Extend)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Extend => "extend",
        }
    }
}

/// Requests co-executed in one step.
///
/// All per-request vectors have length `batch_size()`. `seq_lens` counts every
/// token of the request including the ones added this step, so
/// `seq_lens[i] = extend_prefix_lens[i] + extend_seq_lens[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardBatch {
    pub mode: ForwardMode,
    /// Rows of the routing table owned by each request.
    pub req_pool_indices: Vec<usize>,
    pub seq_lens: Vec<usize>,
    /// Tokens already cached before this step.
    pub extend_prefix_lens: Vec<usize>,
    /// Tokens added this step (always 1 in decode).
    pub extend_seq_lens: Vec<usize>,
    /// Cache slot receiving each new token's key/value.
    pub out_cache_loc: Vec<usize>,
    /// Restrict the batch to these requests (partial tensor-parallel participation).
    pub local_seq_indices: Option<Vec<usize>>,
}

impl ForwardBatch {
    pub fn decode(
        req_pool_indices: Vec<usize>,
        seq_lens: Vec<usize>,
        out_cache_loc: Vec<usize>,
    ) -> Result<Self> {
        check_len("req_pool_indices", seq_lens.len(), req_pool_indices.len())?;
        if let Some(i) = seq_lens.iter().position(|&l| l == 0) {
            return Err(AttentionError::InconsistentBatch(format!(
                "decode request {i} has zero sequence length"
            )));
        }
        let extend_prefix_lens = seq_lens.iter().map(|&l| l - 1).collect();
        let extend_seq_lens = vec![1; seq_lens.len()];
        Ok(Self {
            mode: ForwardMode::Decode,
            req_pool_indices,
            seq_lens,
            extend_prefix_lens,
            extend_seq_lens,
            out_cache_loc,
            local_seq_indices: None,
        })
    }

    pub fn extend(
        req_pool_indices: Vec<usize>,
        seq_lens: Vec<usize>,
        extend_prefix_lens: Vec<usize>,
        out_cache_loc: Vec<usize>,
    ) -> Result<Self> {
        check_len("req_pool_indices", seq_lens.len(), req_pool_indices.len())?;
        check_len("extend_prefix_lens", seq_lens.len(), extend_prefix_lens.len())?;
        let mut extend_seq_lens = Vec::with_capacity(seq_lens.len());
        for (i, (&seq_len, &prefix_len)) in seq_lens.iter().zip(&extend_prefix_lens).enumerate() {
            if prefix_len >= seq_len {
                return Err(AttentionError::InconsistentBatch(format!(
                    "extend request {i}: prefix length {prefix_len} leaves no new tokens in sequence of {seq_len}"
                )));
            }
            extend_seq_lens.push(seq_len - prefix_len);
        }
        Ok(Self {
            mode: ForwardMode::Extend,
            req_pool_indices,
            seq_lens,
            extend_prefix_lens,
            extend_seq_lens,
            out_cache_loc,
            local_seq_indices: None,
        })
    }

    /// Restrict kernel execution to the requests at `indices`.
    pub fn with_local_seq_indices(mut self, indices: Vec<usize>) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.batch_size()) {
            return Err(AttentionError::InconsistentBatch(format!(
                "local sequence index {bad} out of range for batch of {}",
                self.batch_size()
            )));
        }
        self.local_seq_indices = Some(indices);
        Ok(self)
    }

    pub fn batch_size(&self) -> usize {
        self.seq_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq_lens.is_empty()
    }

    /// New tokens in this step across the whole batch.
    pub fn num_tokens(&self) -> usize {
        self.extend_seq_lens.iter().sum()
    }

    /// Per-request arrays after applying `local_seq_indices`.
    ///
    /// Every array is sliced by the same index list so offsets computed from
    /// the view stay aligned with the requests they describe.
    pub fn local_view(&self) -> Result<LocalSeqView> {
        let n = self.batch_size();
        check_len("req_pool_indices", n, self.req_pool_indices.len())?;
        check_len("extend_prefix_lens", n, self.extend_prefix_lens.len())?;
        check_len("extend_seq_lens", n, self.extend_seq_lens.len())?;

        let view = match &self.local_seq_indices {
            None => LocalSeqView {
                req_pool_indices: self.req_pool_indices.clone(),
                seq_lens: self.seq_lens.clone(),
                extend_prefix_lens: self.extend_prefix_lens.clone(),
                extend_seq_lens: self.extend_seq_lens.clone(),
            },
            Some(indices) => LocalSeqView {
                req_pool_indices: select(&self.req_pool_indices, indices, "req_pool_indices")?,
                seq_lens: select(&self.seq_lens, indices, "seq_lens")?,
                extend_prefix_lens: select(
                    &self.extend_prefix_lens,
                    indices,
                    "extend_prefix_lens",
                )?,
                extend_seq_lens: select(&self.extend_seq_lens, indices, "extend_seq_lens")?,
            },
        };
        view.check_consistent()?;
        Ok(view)
    }
}

/// Per-request arrays restricted to the requests this rank executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSeqView {
    pub req_pool_indices: Vec<usize>,
    pub seq_lens: Vec<usize>,
    pub extend_prefix_lens: Vec<usize>,
    pub extend_seq_lens: Vec<usize>,
}

impl LocalSeqView {
    pub fn batch_size(&self) -> usize {
        self.seq_lens.len()
    }

    pub fn num_extend_tokens(&self) -> usize {
        self.extend_seq_lens.iter().sum()
    }

    fn check_consistent(&self) -> Result<()> {
        let n = self.seq_lens.len();
        check_len("local req_pool_indices", n, self.req_pool_indices.len())?;
        check_len("local extend_prefix_lens", n, self.extend_prefix_lens.len())?;
        check_len("local extend_seq_lens", n, self.extend_seq_lens.len())?;
        for i in 0..n {
            let total = self.extend_prefix_lens[i].checked_add(self.extend_seq_lens[i]);
            if total != Some(self.seq_lens[i]) {
                return Err(AttentionError::InconsistentBatch(format!(
                    "request {i}: prefix {} + new {} != sequence length {}",
                    self.extend_prefix_lens[i], self.extend_seq_lens[i], self.seq_lens[i]
                )));
            }
        }
        Ok(())
    }
}

fn check_len(what: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(AttentionError::InconsistentBatch(format!(
            "{what} has {actual} entries, expected {expected}"
        )));
    }
    Ok(())
}

fn select(values: &[usize], indices: &[usize], what: &str) -> Result<Vec<usize>> {
    indices
        .iter()
        .map(|&i| {
            values.get(i).copied().ok_or_else(|| {
                AttentionError::InconsistentBatch(format!(
                    "{what}: local index {i} out of range for {} entries",
                    values.len()
                ))
            })
        })
        .collect()
}
