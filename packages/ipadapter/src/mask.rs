//! Spatial attention masks.
//!
//! A mask is given at image resolution and has to be brought down to the
//! token grid of whichever attention layer is running, then lined up with
//! the diffusion batch the same way the conditioning tokens are.

use crate::batch::{align_batch, broadcast_batch, select_context_window};
use candle_core::{DType, Result, Tensor};
use ipadapter_domain::ContextWindow;

const CUBIC_A: f64 = -0.75;

/// Token grid `(height, width)` of an attention map with `seq_len` tokens
/// for a latent of `latent_h x latent_w`.
pub fn attention_grid(seq_len: usize, latent_h: usize, latent_w: usize) -> (usize, usize) {
    let seq_len = seq_len.max(1);
    let area = (latent_h * latent_w).max(1) as f64;
    let downscale = (area / seq_len as f64).sqrt();
    let mut mask_h = ((latent_h as f64 / downscale) as usize).max(1);
    if seq_len % mask_h != 0 {
        mask_h += 1;
    }
    let mask_w = (seq_len / mask_h).max(1);
    (mask_h, mask_w)
}

fn cubic_near(x: f64) -> f64 {
    ((CUBIC_A + 2.0) * x - (CUBIC_A + 3.0)) * x * x + 1.0
}

fn cubic_far(x: f64) -> f64 {
    ((CUBIC_A * x - 5.0 * CUBIC_A) * x + 8.0 * CUBIC_A) * x - 4.0 * CUBIC_A
}

fn cubic_weights(t: f64) -> [f64; 4] {
    [cubic_far(t + 1.0), cubic_near(t), cubic_near(1.0 - t), cubic_far(2.0 - t)]
}

fn source_coord(dst: usize, in_len: usize, out_len: usize) -> (isize, f64) {
    let scale = in_len as f64 / out_len as f64;
    let src = (dst as f64 + 0.5) * scale - 0.5;
    let base = src.floor();
    (base as isize, src - base)
}

fn resize_plane(plane: &[f32], in_h: usize, in_w: usize, out_h: usize, out_w: usize) -> Vec<f32> {
    let at = |y: isize, x: isize| -> f64 {
        let y = y.clamp(0, in_h as isize - 1) as usize;
        let x = x.clamp(0, in_w as isize - 1) as usize;
        plane[y * in_w + x] as f64
    };
    let mut out = Vec::with_capacity(out_h * out_w);
    for oy in 0..out_h {
        let (iy, ty) = source_coord(oy, in_h, out_h);
        let wy = cubic_weights(ty);
        for ox in 0..out_w {
            let (ix, tx) = source_coord(ox, in_w, out_w);
            let wx = cubic_weights(tx);
            let mut acc = 0.0;
            for (dy, wy) in wy.iter().enumerate() {
                let y = iy - 1 + dy as isize;
                let row: f64 = wx
                    .iter()
                    .enumerate()
                    .map(|(dx, wx)| wx * at(y, ix - 1 + dx as isize))
                    .sum();
                acc += wy * row;
            }
            out.push(if acc.is_nan() { 0.0 } else { acc as f32 });
        }
    }
    out
}

/// Replace NaN with 0 and clamp into `[0, 1]`.
pub fn sanitize(mask: &Tensor) -> Result<Tensor> {
    let dtype = mask.dtype();
    let values = mask.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let values: Vec<f32> = values
        .into_iter()
        .map(|v| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) })
        .collect();
    Tensor::from_vec(values, mask.dims(), mask.device())?.to_dtype(dtype)
}

/// Collapse a mask of rank 2 or more into `(n, h, w)` planes, then sanitize.
///
/// Leading dims are flattened into `n`. A mask with no elements becomes a
/// single zero plane, which masks the conditioning out entirely.
pub fn to_planes(mask: &Tensor) -> Result<Tensor> {
    let dims = mask.dims();
    if dims.len() < 2 {
        candle_core::bail!("mask must have at least 2 dims, got shape {:?}", dims)
    }
    let (h, w) = (dims[dims.len() - 2], dims[dims.len() - 1]);
    let n: usize = dims[..dims.len() - 2].iter().product();
    if n * h * w == 0 {
        return Tensor::zeros((1, 1, 1), mask.dtype(), mask.device());
    }
    sanitize(&mask.reshape((n, h, w))?)
}

/// Bicubic resize of `(n, h, w)` planes, matching `align_corners = false`.
///
/// Planes with no pixels resize to zeros.
pub fn bicubic_resize(mask: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (n, in_h, in_w) = mask.dims3()?;
    if (in_h, in_w) == (out_h, out_w) {
        return Ok(mask.clone());
    }
    if in_h == 0 || in_w == 0 {
        return Tensor::zeros((n, out_h, out_w), mask.dtype(), mask.device());
    }
    let dtype = mask.dtype();
    let planes = mask.to_dtype(DType::F32)?.to_vec3::<f32>()?;
    let mut out = Vec::with_capacity(n * out_h * out_w);
    for plane in planes {
        let flat: Vec<f32> = plane.into_iter().flatten().collect();
        out.extend(resize_plane(&flat, in_h, in_w, out_h, out_w));
    }
    Tensor::from_vec(out, (n, out_h, out_w), mask.device())?.to_dtype(dtype)
}

/// Turn a mask into a `(chunks * batch_prompt, seq_len, 1)` multiplier for
/// the output of one attention layer.
pub fn prepare_mask(
    mask: &Tensor,
    seq_len: usize,
    latent_hw: (usize, usize),
    window: Option<&ContextWindow>,
    batch_prompt: usize,
    chunks: usize,
) -> Result<Tensor> {
    let mask = match mask.rank() {
        2 => mask.unsqueeze(0)?,
        _ => mask.clone(),
    };
    let mask = if mask.dim(0)? == 0 {
        let (_, h, w) = mask.dims3()?;
        Tensor::zeros((1, h, w), mask.dtype(), mask.device())?
    } else {
        mask
    };
    let (mask_h, mask_w) = attention_grid(seq_len, latent_hw.0, latent_hw.1);

    let resized = match window {
        Some(window) if mask.dim(0)? > 1 => {
            if mask.dim(0)? >= window.full_length {
                bicubic_resize(&select_context_window(&mask, window)?, mask_h, mask_w)?
            } else {
                let resized = bicubic_resize(&mask, mask_h, mask_w)?;
                select_context_window(&resized, window)?
            }
        }
        _ => bicubic_resize(&mask, mask_h, mask_w)?,
    };

    let aligned = align_batch(&resized, batch_prompt)?;
    let tiled = broadcast_batch(&aligned, chunks.max(1))?;
    let rows = tiled.dim(0)?;
    let flat = tiled.reshape((rows, mask_h * mask_w))?;
    let flat = fit_tokens(&flat, seq_len)?;
    flat.unsqueeze(2)
}

/// Pad (repeat last column) or truncate dim 1 to `seq_len`.
fn fit_tokens(flat: &Tensor, seq_len: usize) -> Result<Tensor> {
    let len = flat.dim(1)?;
    if len == seq_len {
        return Ok(flat.clone());
    }
    let fitted = align_batch(&flat.t()?, seq_len)?;
    fitted.t()?.contiguous()
}
