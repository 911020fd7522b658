//! Reconciling conditioning batches with the diffusion batch.
//!
//! All helpers operate on dim 0 and leave the trailing dims untouched.

use candle_core::{Result, Tensor};
use ipadapter_domain::ContextWindow;

/// Pad by repeating the last row, or truncate, so that dim 0 equals `target`.
pub fn align_batch(xs: &Tensor, target: usize) -> Result<Tensor> {
    let len = xs.dim(0)?;
    if len == target {
        Ok(xs.clone())
    } else if len > target {
        xs.narrow(0, 0, target)
    } else if len == 0 {
        candle_core::bail!("cannot pad an empty batch to {} rows", target)
    } else {
        let last = xs.narrow(0, len - 1, 1)?;
        let padding = broadcast_batch(&last, target - len)?;
        Tensor::cat(&[xs, &padding], 0)
    }
}

/// Repeat the whole tensor `times` times along dim 0.
pub fn broadcast_batch(xs: &Tensor, times: usize) -> Result<Tensor> {
    let mut repeats = vec![1usize; xs.rank()];
    repeats[0] = times;
    xs.repeat(repeats)
}

/// Take the rows of the frames processed by the current context window.
///
/// A sequence shorter than the window's full length is first padded with its
/// last row. Indices past the end select the last row.
pub fn select_context_window(xs: &Tensor, window: &ContextWindow) -> Result<Tensor> {
    let full = if xs.dim(0)? >= window.full_length {
        xs.clone()
    } else {
        align_batch(xs, window.full_length)?
    };
    let last = full.dim(0)?.saturating_sub(1);
    let idxs: Vec<u32> = window
        .sub_idxs
        .iter()
        .map(|&i| i.min(last) as u32)
        .collect();
    let idxs = Tensor::from_vec(idxs, window.sub_idxs.len(), xs.device())?;
    full.index_select(&idxs, 0)
}

/// Concatenate `(n, tokens, dim)` into one `(1, n * tokens, dim)` sequence.
pub fn merge_images(xs: &Tensor) -> Result<Tensor> {
    let (n, tokens, dim) = xs.dims3()?;
    if n == 1 {
        return Ok(xs.clone());
    }
    xs.reshape((1, n * tokens, dim))
}
