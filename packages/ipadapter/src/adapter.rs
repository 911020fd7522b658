//! A loaded adapter: image projection plus per-layer key/value projections.

use crate::checkpoint::{AdapterCheckpoint, CheckpointProfile};
use crate::embeds::EmbedPair;
use crate::error::{IpAdapterError, Result};
use crate::kv_projector::{KvProjector, KvSide};
use crate::projection::ImageProjection;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use ipadapter_domain::UnetLayout;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct IpAdapter {
    profile: CheckpointProfile,
    layout: UnetLayout,
    projection: ImageProjection,
    kv: Arc<KvProjector>,
    device: Device,
    dtype: DType,
}

impl IpAdapter {
    /// Classify a checkpoint and build its modules.
    ///
    /// Fails with [`IpAdapterError::ShapeMismatch`] when a stored tensor does
    /// not fit the detected architecture.
    pub fn new(checkpoint: &AdapterCheckpoint, clip_embeddings_dim: usize) -> Result<Self> {
        let profile = CheckpointProfile::classify(checkpoint, clip_embeddings_dim)?;
        let layout = checkpoint.layout()?;
        let kv = KvProjector::from_checkpoint(checkpoint.ip_adapter())?;

        let first = kv
            .indices()
            .first()
            .and_then(|index| kv.get(*index, KvSide::Key))
            .map(|linear| linear.weight().clone())
            .ok_or_else(|| {
                IpAdapterError::InvalidAdapterFile("no key projection found".to_string())
            })?;
        let (device, dtype) = (first.device().clone(), first.dtype());

        let vb = VarBuilder::from_tensors(checkpoint.image_proj().clone(), dtype, &device);
        let projection = ImageProjection::new(&profile, vb)?;

        tracing::info!(
            "Loaded {} adapter for {:?} ({} key/value layers, {}-wide tokens)",
            profile.name(),
            layout,
            kv.indices().len(),
            profile.output_dim()
        );

        Ok(Self {
            profile,
            layout,
            projection,
            kv: Arc::new(kv),
            device,
            dtype,
        })
    }

    /// Project a vision embedding pair into conditioning tokens.
    ///
    /// Returns `(cond, uncond)`, each `(images, tokens, cross_attention_dim)`.
    pub fn image_embeds(&self, embeds: &EmbedPair) -> Result<(Tensor, Tensor)> {
        let actual = embeds.cond.dims();
        let expected = self.profile.input_dim();
        if actual.last() != Some(&expected) || actual.len() < 2 {
            let mut shape = actual.to_vec();
            match shape.last_mut() {
                Some(last) => *last = expected,
                None => shape.push(expected),
            }
            return Err(IpAdapterError::ShapeMismatch {
                tensor: "image embeddings".to_string(),
                expected: shape,
                actual: actual.to_vec(),
            });
        }

        let embeds = embeds.to_device(&self.device, self.dtype)?;
        let cond = self.projection.project(&embeds.cond)?;
        let uncond = self.projection.project(&embeds.uncond)?;
        Ok((cond, uncond))
    }

    pub fn profile(&self) -> &CheckpointProfile {
        &self.profile
    }

    pub fn layout(&self) -> UnetLayout {
        self.layout
    }

    pub fn kv_projector(&self) -> &Arc<KvProjector> {
        &self.kv
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}
