use serde::{Deserialize, Serialize};

/// Sequence length written into padded rows when a captured batch shape is
/// replayed with fewer live requests. A length of 1 (not 0) keeps every
/// per-request reduction over a non-empty range.
pub const SEQ_LEN_FILL_VALUE: usize = 1;

/// Which batch sizes get a captured decode plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Enable capture/replay for decode batches
    pub enabled: bool,
    /// Batch sizes to capture during warmup
    pub capture_sizes: Vec<usize>,
    /// Largest batch size eligible for capture (larger batches run eagerly)
    pub max_capture_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capture_sizes: vec![1, 2, 4, 8, 16, 32],
            max_capture_size: 256,
        }
    }
}

impl CaptureConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Capture sizes within `(0, max_capture_size]`, ascending, deduplicated.
    fn valid_sizes(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = self
            .capture_sizes
            .iter()
            .copied()
            .filter(|&s| s > 0 && s <= self.max_capture_size)
            .collect();
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }

    /// Capacity to commit at capture-state initialization.
    pub fn max_batch_size(&self) -> usize {
        self.valid_sizes().last().copied().unwrap_or(0)
    }

    /// Smallest captured size that fits `actual` requests.
    ///
    /// Returns `None` when capture is disabled or no captured size is large
    /// enough; such batches run with freshly built metadata.
    pub fn padded_batch_size(&self, actual: usize) -> Option<usize> {
        if !self.enabled || actual == 0 {
            return None;
        }
        self.valid_sizes().into_iter().find(|&s| s >= actual)
    }

    /// Sizes to capture, largest first.
    pub fn warmup_sizes(&self) -> Vec<usize> {
        let mut sizes = self.valid_sizes();
        sizes.reverse();
        sizes
    }
}

/// Extend `seq_lens` to `padded_batch_size` entries with [`SEQ_LEN_FILL_VALUE`].
pub fn pad_seq_lens(seq_lens: &[usize], padded_batch_size: usize) -> Vec<usize> {
    let mut padded = seq_lens.to_vec();
    if padded.len() < padded_batch_size {
        padded.resize(padded_batch_size, SEQ_LEN_FILL_VALUE);
    }
    padded
}
