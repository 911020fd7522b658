use crate::nn::{GeluMlp, layer_norm};
use candle_core::{Module, Result, Tensor};
use candle_nn::{LayerNorm, VarBuilder};

/// Token-wise `Linear -> GELU -> Linear -> LayerNorm` over hidden states.
#[derive(Debug, Clone)]
pub struct DenseMlpProjection {
    mlp: GeluMlp,
    norm: LayerNorm,
}

impl DenseMlpProjection {
    /// `vb` points at the sequential block (`proj.0`, `proj.2`, `proj.3`).
    pub fn new(clip_embeddings_dim: usize, cross_attention_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            mlp: GeluMlp::new(
                clip_embeddings_dim,
                clip_embeddings_dim,
                cross_attention_dim,
                vb.clone(),
            )?,
            norm: layer_norm(cross_attention_dim, vb.pp(3))?,
        })
    }
}

impl Module for DenseMlpProjection {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.mlp)?.apply(&self.norm)
    }
}

/// Identity embedding -> `num_tokens` tokens through a two layer MLP.
#[derive(Debug, Clone)]
pub struct FaceMlpProjection {
    mlp: GeluMlp,
    norm: LayerNorm,
    num_tokens: usize,
    cross_attention_dim: usize,
}

impl FaceMlpProjection {
    pub fn new(
        id_embeddings_dim: usize,
        cross_attention_dim: usize,
        num_tokens: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            mlp: GeluMlp::new(
                id_embeddings_dim,
                id_embeddings_dim * 2,
                cross_attention_dim * num_tokens,
                vb.pp("proj"),
            )?,
            norm: layer_norm(cross_attention_dim, vb.pp("norm"))?,
            num_tokens,
            cross_attention_dim,
        })
    }
}

impl Module for FaceMlpProjection {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.mlp)?
            .reshape(((), self.num_tokens, self.cross_attention_dim))?
            .apply(&self.norm)
    }
}
