//! Capture/replay support for recurring decode batch shapes.

mod config;
mod state;

pub use config::{pad_seq_lens, CaptureConfig, SEQ_LEN_FILL_VALUE};
pub use state::{copy_inplace, CaptureState};
