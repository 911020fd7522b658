use crate::nn::{layer_norm, linear};
use candle_core::{Module, Result, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

/// Pooled embedding -> `num_tokens` tokens through one linear map.
#[derive(Debug, Clone)]
pub struct LinearProjection {
    proj: Linear,
    norm: LayerNorm,
    num_tokens: usize,
    cross_attention_dim: usize,
}

impl LinearProjection {
    pub fn new(
        clip_embeddings_dim: usize,
        cross_attention_dim: usize,
        num_tokens: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let proj = linear(
            clip_embeddings_dim,
            num_tokens * cross_attention_dim,
            vb.pp("proj"),
        )?;
        let norm = layer_norm(cross_attention_dim, vb.pp("norm"))?;
        Ok(Self {
            proj,
            norm,
            num_tokens,
            cross_attention_dim,
        })
    }
}

impl Module for LinearProjection {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.proj)?
            .reshape(((), self.num_tokens, self.cross_attention_dim))?
            .apply(&self.norm)
    }
}
