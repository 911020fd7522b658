//! Per-call information a sampler hands to the attention patch.
use serde::{Deserialize, Serialize};

/// Which half of a classifier-free-guidance batch a chunk of rows belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CondOrUncond {
    Cond,
    Uncond,
}

impl CondOrUncond {
    /// Map the host's integer encoding (0 = cond, anything else = uncond).
    pub fn from_index(index: usize) -> Self {
        if index == 0 {
            CondOrUncond::Cond
        } else {
            CondOrUncond::Uncond
        }
    }
}

/// Sliding context window used when a long frame sequence is denoised in
/// overlapping chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextWindow {
    /// Number of frames in the whole sequence.
    pub full_length: usize,
    /// Frames of the full sequence processed by the current call.
    pub sub_idxs: Vec<usize>,
}

impl ContextWindow {
    pub fn new(full_length: usize, sub_idxs: Vec<usize>) -> Self {
        Self {
            full_length,
            sub_idxs,
        }
    }
}
