// src/nn.rs

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

/// Epsilon used by every layer norm in the adapter checkpoints.
pub const LAYER_NORM_EPS: f64 = 1e-5;

pub fn linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    candle_nn::linear(in_dim, out_dim, vb)
}

pub fn linear_no_bias(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    candle_nn::linear_no_bias(in_dim, out_dim, vb)
}

pub fn layer_norm(dim: usize, vb: VarBuilder) -> Result<LayerNorm> {
    candle_nn::layer_norm(dim, LAYER_NORM_EPS, vb)
}

/// `Linear -> GELU -> Linear`, stored as `.0` / `.2` of a sequential block.
#[derive(Debug, Clone)]
pub struct GeluMlp {
    fc1: Linear,
    fc2: Linear,
}

impl GeluMlp {
    pub fn new(in_dim: usize, hidden_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(in_dim, hidden_dim, vb.pp(0))?,
            fc2: linear(hidden_dim, out_dim, vb.pp(2))?,
        })
    }
}

impl Module for GeluMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.fc1)?.gelu_erf()?.apply(&self.fc2)
    }
}

/// Move a linear layer's parameters to a device and dtype.
pub fn linear_to(linear: &Linear, device: &Device, dtype: DType) -> Result<Linear> {
    let weight = linear.weight().to_device(device)?.to_dtype(dtype)?;
    let bias = match linear.bias() {
        Some(b) => Some(b.to_device(device)?.to_dtype(dtype)?),
        None => None,
    };
    Ok(Linear::new(weight, bias))
}
