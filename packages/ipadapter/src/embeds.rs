//! Vision embedding pairs: weighting, face fallback and persistence.

use crate::checkpoint::FACE_ID_EMBEDDING_DIM;
use crate::error::{IpAdapterError, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::Path;

/// Smallest per-image weight an encoder accepts.
pub const MIN_IMAGE_WEIGHT: f64 = 1.19e-5;

/// Key of the stacked pair inside a saved embeddings file.
const EMBEDS_KEY: &str = "embeds";

/// Clamp a per-image weight away from zero.
pub fn normalize_image_weight(weight: f64) -> f64 {
    if weight <= MIN_IMAGE_WEIGHT {
        MIN_IMAGE_WEIGHT
    } else {
        weight
    }
}

/// A vision embedding and its negative counterpart.
#[derive(Debug, Clone)]
pub struct EmbedPair {
    pub cond: Tensor,
    pub uncond: Tensor,
}

impl EmbedPair {
    pub fn new(cond: Tensor, uncond: Tensor) -> Result<Self> {
        if cond.dims() != uncond.dims() {
            return Err(IpAdapterError::ShapeMismatch {
                tensor: "uncond".to_string(),
                expected: cond.dims().to_vec(),
                actual: uncond.dims().to_vec(),
            });
        }
        Ok(Self { cond, uncond })
    }

    /// Pair an embedding with an all-zero negative.
    pub fn with_zeroed(cond: Tensor) -> Result<Self> {
        let uncond = cond.zeros_like()?;
        Ok(Self { cond, uncond })
    }

    /// Number of images in the pair.
    pub fn num_images(&self) -> Result<usize> {
        Ok(self.cond.dim(0)?)
    }

    /// `(2, ...)` tensor with the conditioned embedding first.
    pub fn stack(&self) -> Result<Tensor> {
        Ok(Tensor::stack(&[&self.cond, &self.uncond], 0)?)
    }

    pub fn unstack(stacked: &Tensor) -> Result<Self> {
        let dims = stacked.dims();
        if dims.first() != Some(&2) {
            let mut expected = dims.to_vec();
            if let Some(first) = expected.first_mut() {
                *first = 2;
            }
            return Err(IpAdapterError::ShapeMismatch {
                tensor: EMBEDS_KEY.to_string(),
                expected,
                actual: dims.to_vec(),
            });
        }
        Self::new(stacked.get(0)?, stacked.get(1)?)
    }

    /// Append another pair's images after this pair's images.
    pub fn batch(&self, other: &EmbedPair) -> Result<Self> {
        Self::new(
            Tensor::cat(&[&self.cond, &other.cond], 0)?,
            Tensor::cat(&[&self.uncond, &other.uncond], 0)?,
        )
    }

    pub fn to_device(&self, device: &Device, dtype: DType) -> Result<Self> {
        Ok(Self {
            cond: self.cond.to_device(device)?.to_dtype(dtype)?,
            uncond: self.uncond.to_device(device)?.to_dtype(dtype)?,
        })
    }

    /// Write the stacked pair to a safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut tensors = HashMap::new();
        tensors.insert(EMBEDS_KEY.to_string(), self.stack()?);
        candle_core::safetensors::save(&tensors, path)?;
        tracing::debug!("Saved embeddings to {}", path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, device)?;
        let stacked = tensors.get(EMBEDS_KEY).ok_or_else(|| {
            IpAdapterError::MissingTensor(format!("{} in {}", EMBEDS_KEY, path.display()))
        })?;
        Self::unstack(stacked)
    }
}

/// A group of images sharing one encoder weight.
#[derive(Debug, Clone)]
pub struct WeightedEmbeds {
    pub pair: EmbedPair,
    pub weight: f64,
}

impl WeightedEmbeds {
    pub fn new(pair: EmbedPair, weight: f64) -> Self {
        Self { pair, weight }
    }
}

/// Concatenate image groups and scale each conditioned row by its group's
/// weight. Negatives are left untouched.
pub fn combine_weighted(groups: &[WeightedEmbeds]) -> Result<EmbedPair> {
    let Some(first) = groups.first() else {
        return Err(IpAdapterError::MissingConditioning(
            "no images to encode".to_string(),
        ));
    };

    let mut weights = Vec::new();
    let mut conds = Vec::with_capacity(groups.len());
    let mut unconds = Vec::with_capacity(groups.len());
    for group in groups {
        let rows = group.pair.num_images()?;
        let weight = normalize_image_weight(group.weight);
        weights.extend(std::iter::repeat_n(weight as f32, rows));
        conds.push(&group.pair.cond);
        unconds.push(&group.pair.uncond);
    }
    let cond = Tensor::cat(&conds, 0)?;
    let uncond = Tensor::cat(&unconds, 0)?;

    let cond = if weights.iter().any(|w| *w != 1.0) {
        let mut shape = vec![1usize; cond.rank()];
        shape[0] = weights.len();
        let weights = Tensor::from_vec(weights, shape, first.pair.cond.device())?
            .to_dtype(cond.dtype())?;
        cond.broadcast_mul(&weights)?
    } else {
        cond
    };
    EmbedPair::new(cond, uncond)
}

/// Identity embeddings of the faces found in the reference images.
///
/// When no face was detected, a zeroed `(1, 1, 512)` embedding is returned
/// together with a [`IpAdapterError::MissingConditioning`] warning so the
/// sampling run can go on.
pub fn face_embed_pair(
    faces: &[Tensor],
    device: &Device,
) -> Result<(EmbedPair, Option<IpAdapterError>)> {
    if faces.is_empty() {
        let warning = IpAdapterError::MissingConditioning(
            "no face detected in the reference image".to_string(),
        );
        tracing::warn!("{}; falling back to a zeroed identity embedding", warning);
        let zeroed = Tensor::zeros((1, 1, FACE_ID_EMBEDDING_DIM), DType::F32, device)?;
        return Ok((EmbedPair::with_zeroed(zeroed)?, Some(warning)));
    }

    let mut rows = Vec::with_capacity(faces.len());
    for face in faces {
        let face = face.flatten_all()?;
        let dim = face.dim(0)?;
        if dim != FACE_ID_EMBEDDING_DIM {
            return Err(IpAdapterError::ShapeMismatch {
                tensor: "face embedding".to_string(),
                expected: vec![FACE_ID_EMBEDDING_DIM],
                actual: vec![dim],
            });
        }
        rows.push(face.reshape((1, FACE_ID_EMBEDDING_DIM))?.to_device(device)?);
    }
    let cond = Tensor::stack(&rows, 0)?;
    Ok((EmbedPair::with_zeroed(cond)?, None))
}
