//! Projections from vision embeddings to conditioning tokens.

mod linear;
mod mlp;
mod resampler;

pub use linear::LinearProjection;
pub use mlp::{DenseMlpProjection, FaceMlpProjection};
pub use resampler::{PerceiverAttention, Resampler, ResamplerConfig};

use crate::checkpoint::CheckpointProfile;
use crate::error::{IpAdapterError, Result};
use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

/// One of the supported image projection modules.
#[derive(Debug, Clone)]
pub enum ImageProjection {
    Linear(LinearProjection),
    Resampler(Resampler),
    DenseMlp(DenseMlpProjection),
    FaceMlp(FaceMlpProjection),
}

impl ImageProjection {
    /// Build the projection a profile describes from the `image_proj`
    /// namespace. Every weight is shape-checked here.
    pub fn new(profile: &CheckpointProfile, vb: VarBuilder) -> Result<Self> {
        Self::build(profile, vb).map_err(IpAdapterError::from_weight_error)
    }

    fn build(profile: &CheckpointProfile, vb: VarBuilder) -> candle_core::Result<Self> {
        let projection = match *profile {
            CheckpointProfile::Linear {
                clip_embeddings_dim,
                cross_attention_dim,
                num_tokens,
            } => ImageProjection::Linear(LinearProjection::new(
                clip_embeddings_dim,
                cross_attention_dim,
                num_tokens,
                vb,
            )?),
            CheckpointProfile::Resampler {
                embedding_dim,
                dim,
                output_dim,
                depth,
                heads,
                dim_head,
                num_queries,
                ff_mult,
            } => ImageProjection::Resampler(Resampler::new(
                ResamplerConfig {
                    dim,
                    depth,
                    dim_head,
                    heads,
                    num_queries,
                    embedding_dim,
                    output_dim,
                    ff_mult,
                },
                vb,
            )?),
            CheckpointProfile::DenseMlp {
                clip_embeddings_dim,
                cross_attention_dim,
            } => ImageProjection::DenseMlp(DenseMlpProjection::new(
                clip_embeddings_dim,
                cross_attention_dim,
                vb.pp("proj"),
            )?),
            CheckpointProfile::FaceMlp {
                id_embeddings_dim,
                cross_attention_dim,
                num_tokens,
            } => ImageProjection::FaceMlp(FaceMlpProjection::new(
                id_embeddings_dim,
                cross_attention_dim,
                num_tokens,
                vb,
            )?),
        };
        Ok(projection)
    }

    /// Project a raw embedding into a `(batch, tokens, dim)` sequence.
    pub fn project(&self, embeds: &Tensor) -> Result<Tensor> {
        Ok(self.forward(embeds)?)
    }
}

impl Module for ImageProjection {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            ImageProjection::Linear(p) => p.forward(xs),
            ImageProjection::Resampler(p) => p.forward(xs),
            ImageProjection::DenseMlp(p) => p.forward(xs),
            ImageProjection::FaceMlp(p) => p.forward(xs),
        }
    }
}
