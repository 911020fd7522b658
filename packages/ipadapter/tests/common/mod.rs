//! Small synthetic adapter checkpoints for integration tests.
#![allow(dead_code)]

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use ipadapter::AdapterCheckpoint;
use ipadapter::kv_projector::{KvProjector, checkpoint_index};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

pub const CLIP_DIM: usize = 16;
pub const CROSS_DIM: usize = 8;
pub const HIDDEN_DIM: usize = 8;
pub const NUM_HEADS: usize = 2;
pub const SD15_LAYERS: usize = 16;

/// Seeded source of uniform tensors in `[-scale / 2, scale / 2)`.
pub struct TensorRng(StdRng);

impl TensorRng {
    pub fn new(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }

    pub fn tensor(&mut self, shape: &[usize], scale: f32) -> Result<Tensor> {
        let n: usize = shape.iter().product();
        let values: Vec<f32> = (0..n)
            .map(|_| self.0.random_range(-0.5f32..0.5) * scale)
            .collect();
        Ok(Tensor::from_vec(values, shape, &Device::Cpu)?)
    }

    /// Mask values in `[0, 1)`.
    pub fn mask(&mut self, shape: &[usize]) -> Result<Tensor> {
        let n: usize = shape.iter().product();
        let values: Vec<f32> = (0..n).map(|_| self.0.random_range(0f32..1.0)).collect();
        Ok(Tensor::from_vec(values, shape, &Device::Cpu)?)
    }
}

fn insert_linear(
    map: &mut HashMap<String, Tensor>,
    rng: &mut TensorRng,
    name: &str,
    in_dim: usize,
    out_dim: usize,
    bias: bool,
) -> Result<()> {
    let scale = 1.0 / (in_dim as f32).sqrt();
    map.insert(format!("{name}.weight"), rng.tensor(&[out_dim, in_dim], scale)?);
    if bias {
        map.insert(format!("{name}.bias"), rng.tensor(&[out_dim], 0.1)?);
    }
    Ok(())
}

fn insert_norm(map: &mut HashMap<String, Tensor>, name: &str, dim: usize) -> Result<()> {
    map.insert(
        format!("{name}.weight"),
        Tensor::ones(dim, DType::F32, &Device::Cpu)?,
    );
    map.insert(
        format!("{name}.bias"),
        Tensor::zeros(dim, DType::F32, &Device::Cpu)?,
    );
    Ok(())
}

/// Key/value projections for `layers` cross-attention layers.
pub fn kv_weights(
    rng: &mut TensorRng,
    layers: usize,
    cross_dim: usize,
    hidden_dim: usize,
) -> Result<HashMap<String, Tensor>> {
    let mut map = HashMap::new();
    for n in 0..layers {
        let index = checkpoint_index(n);
        insert_linear(&mut map, rng, &format!("{index}.to_k_ip"), cross_dim, hidden_dim, false)?;
        insert_linear(&mut map, rng, &format!("{index}.to_v_ip"), cross_dim, hidden_dim, false)?;
    }
    Ok(map)
}

pub fn kv_projector(seed: u64, layers: usize, hidden_dim: usize) -> Result<KvProjector> {
    let mut rng = TensorRng::new(seed);
    Ok(KvProjector::from_checkpoint(&kv_weights(
        &mut rng, layers, CROSS_DIM, hidden_dim,
    )?)?)
}

pub fn linear_checkpoint(seed: u64) -> Result<AdapterCheckpoint> {
    let mut rng = TensorRng::new(seed);
    let mut image_proj = HashMap::new();
    insert_linear(&mut image_proj, &mut rng, "proj", CLIP_DIM, 4 * CROSS_DIM, true)?;
    insert_norm(&mut image_proj, "norm", CROSS_DIM)?;
    let ip_adapter = kv_weights(&mut rng, SD15_LAYERS, CROSS_DIM, HIDDEN_DIM)?;
    Ok(AdapterCheckpoint::new(image_proj, ip_adapter)?)
}

pub fn resampler_checkpoint(seed: u64) -> Result<AdapterCheckpoint> {
    let mut rng = TensorRng::new(seed);
    let (dim, inner_dim) = (CROSS_DIM, 12 * 64);
    let mut image_proj = HashMap::new();
    image_proj.insert("latents".to_string(), rng.tensor(&[1, 16, dim], 1.0)?);
    insert_linear(&mut image_proj, &mut rng, "proj_in", CLIP_DIM, dim, true)?;
    insert_linear(&mut image_proj, &mut rng, "proj_out", dim, CROSS_DIM, true)?;
    insert_norm(&mut image_proj, "norm_out", CROSS_DIM)?;
    for i in 0..4 {
        let attn = format!("layers.{i}.0");
        insert_norm(&mut image_proj, &format!("{attn}.norm1"), dim)?;
        insert_norm(&mut image_proj, &format!("{attn}.norm2"), dim)?;
        insert_linear(&mut image_proj, &mut rng, &format!("{attn}.to_q"), dim, inner_dim, false)?;
        insert_linear(&mut image_proj, &mut rng, &format!("{attn}.to_kv"), dim, 2 * inner_dim, false)?;
        insert_linear(&mut image_proj, &mut rng, &format!("{attn}.to_out"), inner_dim, dim, false)?;
        let ff = format!("layers.{i}.1");
        insert_norm(&mut image_proj, &format!("{ff}.0"), dim)?;
        insert_linear(&mut image_proj, &mut rng, &format!("{ff}.1"), dim, 4 * dim, false)?;
        insert_linear(&mut image_proj, &mut rng, &format!("{ff}.3"), 4 * dim, dim, false)?;
    }
    let ip_adapter = kv_weights(&mut rng, SD15_LAYERS, CROSS_DIM, HIDDEN_DIM)?;
    Ok(AdapterCheckpoint::new(image_proj, ip_adapter)?)
}

pub fn dense_checkpoint(seed: u64) -> Result<AdapterCheckpoint> {
    let mut rng = TensorRng::new(seed);
    let mut image_proj = HashMap::new();
    insert_linear(&mut image_proj, &mut rng, "proj.0", CLIP_DIM, CLIP_DIM, true)?;
    insert_linear(&mut image_proj, &mut rng, "proj.2", CLIP_DIM, CROSS_DIM, true)?;
    insert_norm(&mut image_proj, "proj.3", CROSS_DIM)?;
    let ip_adapter = kv_weights(&mut rng, SD15_LAYERS, CROSS_DIM, HIDDEN_DIM)?;
    Ok(AdapterCheckpoint::new(image_proj, ip_adapter)?)
}

pub fn face_checkpoint(seed: u64) -> Result<AdapterCheckpoint> {
    let mut rng = TensorRng::new(seed);
    let mut image_proj = HashMap::new();
    insert_linear(&mut image_proj, &mut rng, "proj.0", 512, 1024, true)?;
    insert_linear(&mut image_proj, &mut rng, "proj.2", 1024, 4 * CROSS_DIM, true)?;
    insert_norm(&mut image_proj, "norm", CROSS_DIM)?;
    let mut ip_adapter = kv_weights(&mut rng, SD15_LAYERS, CROSS_DIM, HIDDEN_DIM)?;
    ip_adapter.insert(
        "0.to_q_lora.down.weight".to_string(),
        rng.tensor(&[128, HIDDEN_DIM], 0.1)?,
    );
    Ok(AdapterCheckpoint::new(image_proj, ip_adapter)?)
}

/// Maximum absolute elementwise difference.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_dtype(DType::F32)?
        .to_scalar::<f32>()?)
}
