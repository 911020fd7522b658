//! Perceiver resampler used by "plus" adapters.
//!
//! A fixed set of learned latent queries repeatedly cross-attends into the
//! encoder's hidden states (concatenated with the latents themselves), so a
//! variable-length patch sequence is compressed to `num_queries` tokens.

use crate::nn::{layer_norm, linear, linear_no_bias};
use candle_core::{D, DType, Module, Result, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResamplerConfig {
    pub dim: usize,
    pub depth: usize,
    pub dim_head: usize,
    pub heads: usize,
    pub num_queries: usize,
    pub embedding_dim: usize,
    pub output_dim: usize,
    pub ff_mult: usize,
}

/// Latents attend over `cat(x, latents)`; projections carry no bias.
#[derive(Debug, Clone)]
pub struct PerceiverAttention {
    norm1: LayerNorm,
    norm2: LayerNorm,
    to_q: Linear,
    to_kv: Linear,
    to_out: Linear,
    heads: usize,
    dim_head: usize,
}

impl PerceiverAttention {
    pub fn new(dim: usize, dim_head: usize, heads: usize, vb: VarBuilder) -> Result<Self> {
        let inner_dim = dim_head * heads;
        Ok(Self {
            norm1: layer_norm(dim, vb.pp("norm1"))?,
            norm2: layer_norm(dim, vb.pp("norm2"))?,
            to_q: linear_no_bias(dim, inner_dim, vb.pp("to_q"))?,
            to_kv: linear_no_bias(dim, inner_dim * 2, vb.pp("to_kv"))?,
            to_out: linear_no_bias(inner_dim, dim, vb.pp("to_out"))?,
            heads,
            dim_head,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b_size, seq_len, _) = xs.dims3()?;
        xs.reshape((b_size, seq_len, self.heads, self.dim_head))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn forward(&self, xs: &Tensor, latents: &Tensor) -> Result<Tensor> {
        let xs = xs.apply(&self.norm1)?;
        let latents = latents.apply(&self.norm2)?;
        let (b_size, n_latents, _) = latents.dims3()?;
        let inner_dim = self.heads * self.dim_head;

        let q = latents.apply(&self.to_q)?;
        let kv_input = Tensor::cat(&[&xs, &latents], 1)?;
        let kv = kv_input.apply(&self.to_kv)?;
        let k = kv.narrow(D::Minus1, 0, inner_dim)?;
        let v = kv.narrow(D::Minus1, inner_dim, inner_dim)?;

        let q = self.split_heads(&q)?;
        let k = self.split_heads(&k)?;
        let v = self.split_heads(&v)?;

        // 1/sqrt(sqrt(dim_head)) on both sides of the product.
        let scale = 1.0 / (self.dim_head as f64).sqrt().sqrt();
        let q = q.affine(scale, 0.0)?;
        let k = k.affine(scale, 0.0)?;
        let weight = q.matmul(&k.t()?.contiguous()?)?;
        let in_dtype = weight.dtype();
        let weight = candle_nn::ops::softmax_last_dim(&weight.to_dtype(DType::F32)?)?
            .to_dtype(in_dtype)?;
        let out = weight.matmul(&v)?;

        out.transpose(1, 2)?
            .reshape((b_size, n_latents, inner_dim))?
            .apply(&self.to_out)
    }
}

/// `LayerNorm -> Linear -> GELU -> Linear`, stored as `.0`, `.1`, `.3`.
#[derive(Debug, Clone)]
struct FeedForward {
    norm: LayerNorm,
    w1: Linear,
    w2: Linear,
}

impl FeedForward {
    fn new(dim: usize, mult: usize, vb: VarBuilder) -> Result<Self> {
        let inner_dim = dim * mult;
        Ok(Self {
            norm: layer_norm(dim, vb.pp(0))?,
            w1: linear_no_bias(dim, inner_dim, vb.pp(1))?,
            w2: linear_no_bias(inner_dim, dim, vb.pp(3))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.norm)?
            .apply(&self.w1)?
            .gelu_erf()?
            .apply(&self.w2)
    }
}

#[derive(Debug, Clone)]
pub struct Resampler {
    latents: Tensor,
    proj_in: Linear,
    layers: Vec<(PerceiverAttention, FeedForward)>,
    proj_out: Linear,
    norm_out: LayerNorm,
    span: tracing::Span,
}

impl Resampler {
    pub fn new(cfg: ResamplerConfig, vb: VarBuilder) -> Result<Self> {
        let latents = vb.get((1, cfg.num_queries, cfg.dim), "latents")?;
        let proj_in = linear(cfg.embedding_dim, cfg.dim, vb.pp("proj_in"))?;
        let proj_out = linear(cfg.dim, cfg.output_dim, vb.pp("proj_out"))?;
        let norm_out = layer_norm(cfg.output_dim, vb.pp("norm_out"))?;

        let vb_layers = vb.pp("layers");
        let mut layers = Vec::with_capacity(cfg.depth);
        for i in 0..cfg.depth {
            let vb_layer = vb_layers.pp(i);
            let attn = PerceiverAttention::new(cfg.dim, cfg.dim_head, cfg.heads, vb_layer.pp(0))?;
            let ff = FeedForward::new(cfg.dim, cfg.ff_mult, vb_layer.pp(1))?;
            layers.push((attn, ff));
        }

        Ok(Self {
            latents,
            proj_in,
            layers,
            proj_out,
            norm_out,
            span: tracing::span!(tracing::Level::TRACE, "resampler"),
        })
    }
}

impl Module for Resampler {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        // Pooled embeddings are treated as a one-token sequence.
        let xs = match xs.rank() {
            2 => xs.unsqueeze(1)?,
            _ => xs.clone(),
        };
        let b_size = xs.dim(0)?;
        let mut latents = self.latents.repeat((b_size, 1, 1))?;
        let xs = xs.apply(&self.proj_in)?;
        for (attn, ff) in &self.layers {
            latents = (attn.forward(&xs, &latents)? + &latents)?;
            latents = (latents.apply(ff)? + &latents)?;
        }
        latents.apply(&self.proj_out)?.apply(&self.norm_out)
    }
}
