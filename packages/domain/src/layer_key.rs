//! Identity of a cross-attention block inside a UNet.
//!
//! A [`LayerKey`] pins down one cross-attention layer: the encoder stage it
//! lives in, the block index inside that stage and, for architectures that
//! stack several transformer blocks per UNet block, the transformer depth.
//! [`UnetLayout`] enumerates every cross-attention layer of a supported
//! architecture in the order the adapter checkpoints number them.
use serde::{Deserialize, Serialize};
use std::fmt;

/// UNet stage holding a cross-attention block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockStage {
    /// Down-sampling path.
    Input,
    /// Bottleneck.
    Middle,
    /// Up-sampling path.
    Output,
}

impl BlockStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStage::Input => "input",
            BlockStage::Middle => "middle",
            BlockStage::Output => "output",
        }
    }
}

/// Position of one cross-attention layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerKey {
    pub stage: BlockStage,
    pub block: usize,
    /// Transformer sub-index, present only for multi-depth blocks.
    pub depth: Option<usize>,
}

impl LayerKey {
    pub fn new(stage: BlockStage, block: usize) -> Self {
        Self {
            stage,
            block,
            depth: None,
        }
    }

    pub fn with_depth(stage: BlockStage, block: usize, depth: usize) -> Self {
        Self {
            stage,
            block,
            depth: Some(depth),
        }
    }
}

impl fmt::Display for LayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.depth {
            Some(depth) => write!(f, "{}.{}.{}", self.stage.as_str(), self.block, depth),
            None => write!(f, "{}.{}", self.stage.as_str(), self.block),
        }
    }
}

/// Width of the XL text encoder's cross-attention context.
pub const SDXL_CROSS_ATTENTION_DIM: usize = 2048;

/// Supported host UNet architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnetLayout {
    /// SD 1.x / 2.x: one transformer per attention block.
    Sd15,
    /// SDXL: multi-depth transformer blocks.
    Sdxl,
}

impl UnetLayout {
    /// Infer the layout from the adapter's output cross-attention width.
    pub fn from_cross_attention_dim(dim: usize) -> Self {
        if dim == SDXL_CROSS_ATTENTION_DIM {
            UnetLayout::Sdxl
        } else {
            UnetLayout::Sd15
        }
    }

    pub fn is_xl(&self) -> bool {
        matches!(self, UnetLayout::Sdxl)
    }

    /// Every cross-attention layer, ordered as adapter checkpoints number them.
    ///
    /// The position of a key in this list is its layer number `n`; the
    /// checkpoint stores that layer's projections under index `2n + 1`.
    pub fn cross_attention_layers(&self) -> Vec<LayerKey> {
        match self {
            UnetLayout::Sd15 => {
                let mut keys = Vec::with_capacity(16);
                for block in [1, 2, 4, 5, 7, 8] {
                    keys.push(LayerKey::new(BlockStage::Input, block));
                }
                for block in 3..=11 {
                    keys.push(LayerKey::new(BlockStage::Output, block));
                }
                keys.push(LayerKey::new(BlockStage::Middle, 0));
                keys
            }
            UnetLayout::Sdxl => {
                let mut keys = Vec::with_capacity(70);
                for block in [4, 5, 7, 8] {
                    let depth = if matches!(block, 4 | 5) { 2 } else { 10 };
                    for index in 0..depth {
                        keys.push(LayerKey::with_depth(BlockStage::Input, block, index));
                    }
                }
                for block in 0..6 {
                    let depth = if matches!(block, 3..=5) { 2 } else { 10 };
                    for index in 0..depth {
                        keys.push(LayerKey::with_depth(BlockStage::Output, block, index));
                    }
                }
                for index in 0..10 {
                    keys.push(LayerKey::with_depth(BlockStage::Middle, 0, index));
                }
                keys
            }
        }
    }
}
