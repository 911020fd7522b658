//! The host's attention primitive.

use candle_core::{DType, Result, Tensor};

/// Multi-head attention over `(batch, seq, heads * head_dim)` tensors.
///
/// Hosts plug in their optimized kernel here; the patch never scores
/// attention itself.
pub trait AttentionBackend {
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, num_heads: usize) -> Result<Tensor>;
}

impl<F> AttentionBackend for F
where
    F: Fn(&Tensor, &Tensor, &Tensor, usize) -> Result<Tensor>,
{
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, num_heads: usize) -> Result<Tensor> {
        self(q, k, v, num_heads)
    }
}

/// Plain softmax attention, computed in f32.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScaledDotProductAttention;

impl ScaledDotProductAttention {
    fn split_heads(xs: &Tensor, num_heads: usize) -> Result<Tensor> {
        let (b_size, seq_len, inner_dim) = xs.dims3()?;
        xs.reshape((b_size, seq_len, num_heads, inner_dim / num_heads))?
            .transpose(1, 2)?
            .contiguous()
    }
}

impl AttentionBackend for ScaledDotProductAttention {
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, num_heads: usize) -> Result<Tensor> {
        let (b_size, seq_len, inner_dim) = q.dims3()?;
        if num_heads == 0 || inner_dim % num_heads != 0 {
            candle_core::bail!(
                "inner dim {} is not divisible into {} heads",
                inner_dim,
                num_heads
            );
        }
        let head_dim = inner_dim / num_heads;
        let in_dtype = q.dtype();

        let q = Self::split_heads(&q.to_dtype(DType::F32)?, num_heads)?;
        let k = Self::split_heads(&k.to_dtype(DType::F32)?, num_heads)?;
        let v = Self::split_heads(&v.to_dtype(DType::F32)?, num_heads)?;

        let scale = (head_dim as f64).powf(-0.5);
        let attn = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let attn = attn.matmul(&v)?;
        attn.transpose(1, 2)?
            .reshape((b_size, seq_len, inner_dim))?
            .to_dtype(in_dtype)
    }
}
