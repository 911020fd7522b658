//! Adapter checkpoints and their structural classification.
//!
//! An adapter checkpoint carries two namespaces: `image_proj` (the projection
//! that turns a vision embedding into conditioning tokens) and `ip_adapter`
//! (one key/value projection per cross-attention layer). Which projection a
//! checkpoint contains is decided once, here, from the tensors it stores.

use crate::error::{IpAdapterError, Result};
use candle_core::{Device, Tensor};
use ipadapter_domain::UnetLayout;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const IMAGE_PROJ_PREFIX: &str = "image_proj.";
const IP_ADAPTER_PREFIX: &str = "ip_adapter.";

/// First key-side projection; its input width is the adapter's output
/// cross-attention width.
const FIRST_KEY_PROJECTION: &str = "1.to_k_ip.weight";

/// Resampler width used by XL "plus" adapters.
const XL_RESAMPLER_DIM: usize = 1280;
/// Width of identity embeddings produced by face recognition models.
pub const FACE_ID_EMBEDDING_DIM: usize = 512;

/// An adapter checkpoint split into its two namespaces.
#[derive(Debug, Clone)]
pub struct AdapterCheckpoint {
    image_proj: HashMap<String, Tensor>,
    ip_adapter: HashMap<String, Tensor>,
}

impl AdapterCheckpoint {
    pub fn new(
        image_proj: HashMap<String, Tensor>,
        ip_adapter: HashMap<String, Tensor>,
    ) -> Result<Self> {
        if ip_adapter.is_empty() {
            return Err(IpAdapterError::InvalidAdapterFile(
                "checkpoint has no ip_adapter weights".to_string(),
            ));
        }
        Ok(Self {
            image_proj,
            ip_adapter,
        })
    }

    /// Split a flat `image_proj.*` / `ip_adapter.*` tensor map.
    ///
    /// Keys outside both namespaces are ignored.
    pub fn from_flat(tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut image_proj = HashMap::new();
        let mut ip_adapter = HashMap::new();
        for (name, tensor) in tensors {
            if let Some(rest) = name.strip_prefix(IMAGE_PROJ_PREFIX) {
                image_proj.insert(rest.to_string(), tensor);
            } else if let Some(rest) = name.strip_prefix(IP_ADAPTER_PREFIX) {
                ip_adapter.insert(rest.to_string(), tensor);
            }
        }
        Self::new(image_proj, ip_adapter)
    }

    /// Load a `.safetensors` adapter file.
    pub fn from_safetensors<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, device)?;
        tracing::debug!(
            "Loaded {} tensors from adapter file {}",
            tensors.len(),
            path.display()
        );
        Self::from_flat(tensors).map_err(|e| match e {
            IpAdapterError::InvalidAdapterFile(msg) => {
                IpAdapterError::InvalidAdapterFile(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn image_proj(&self) -> &HashMap<String, Tensor> {
        &self.image_proj
    }

    pub fn ip_adapter(&self) -> &HashMap<String, Tensor> {
        &self.ip_adapter
    }

    /// Width of the host's cross-attention context the adapter was trained for.
    pub fn output_cross_attention_dim(&self) -> Result<usize> {
        let weight = self.ip_adapter.get(FIRST_KEY_PROJECTION).ok_or_else(|| {
            IpAdapterError::InvalidAdapterFile(format!(
                "checkpoint has no '{}' tensor",
                FIRST_KEY_PROJECTION
            ))
        })?;
        match weight.dims() {
            [_, in_dim] => Ok(*in_dim),
            dims => Err(IpAdapterError::InvalidAdapterFile(format!(
                "'{}' must be a matrix, got shape {:?}",
                FIRST_KEY_PROJECTION, dims
            ))),
        }
    }

    pub fn layout(&self) -> Result<UnetLayout> {
        Ok(UnetLayout::from_cross_attention_dim(
            self.output_cross_attention_dim()?,
        ))
    }
}

/// Projection family stored in a checkpoint, with the dimensions needed to
/// build it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckpointProfile {
    /// Single linear map from a pooled embedding to a few tokens.
    Linear {
        clip_embeddings_dim: usize,
        cross_attention_dim: usize,
        num_tokens: usize,
    },
    /// Perceiver resampler over encoder hidden states ("plus").
    Resampler {
        embedding_dim: usize,
        dim: usize,
        output_dim: usize,
        depth: usize,
        heads: usize,
        dim_head: usize,
        num_queries: usize,
        ff_mult: usize,
    },
    /// Token-wise MLP over encoder hidden states ("full").
    DenseMlp {
        clip_embeddings_dim: usize,
        cross_attention_dim: usize,
    },
    /// MLP expanding an identity embedding to a few tokens.
    FaceMlp {
        id_embeddings_dim: usize,
        cross_attention_dim: usize,
        num_tokens: usize,
    },
}

impl CheckpointProfile {
    /// Decide the projection family from the checkpoint structure.
    ///
    /// `clip_embeddings_dim` is the feature width of the vision embeddings
    /// that will be fed to the projection.
    pub fn classify(checkpoint: &AdapterCheckpoint, clip_embeddings_dim: usize) -> Result<Self> {
        let image_proj = checkpoint.image_proj();
        let is_full = image_proj.contains_key("proj.0.weight");
        let is_faceid = checkpoint
            .ip_adapter()
            .contains_key("0.to_q_lora.down.weight");
        let is_plus = (is_full || image_proj.contains_key("latents")) && !is_faceid;

        let output_cross_attention_dim = checkpoint.output_cross_attention_dim()?;
        let is_xl = UnetLayout::from_cross_attention_dim(output_cross_attention_dim).is_xl();

        let profile = if is_faceid {
            CheckpointProfile::FaceMlp {
                id_embeddings_dim: FACE_ID_EMBEDDING_DIM,
                cross_attention_dim: output_cross_attention_dim,
                num_tokens: 4,
            }
        } else if is_full {
            CheckpointProfile::DenseMlp {
                clip_embeddings_dim,
                cross_attention_dim: output_cross_attention_dim,
            }
        } else if is_plus {
            CheckpointProfile::Resampler {
                embedding_dim: clip_embeddings_dim,
                dim: if is_xl {
                    XL_RESAMPLER_DIM
                } else {
                    output_cross_attention_dim
                },
                output_dim: output_cross_attention_dim,
                depth: 4,
                heads: if is_xl { 20 } else { 12 },
                dim_head: 64,
                num_queries: 16,
                ff_mult: 4,
            }
        } else {
            CheckpointProfile::Linear {
                clip_embeddings_dim,
                cross_attention_dim: output_cross_attention_dim,
                num_tokens: 4,
            }
        };
        Ok(profile)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CheckpointProfile::Linear { .. } => "linear",
            CheckpointProfile::Resampler { .. } => "resampler",
            CheckpointProfile::DenseMlp { .. } => "dense_mlp",
            CheckpointProfile::FaceMlp { .. } => "face_mlp",
        }
    }

    /// Width of the produced conditioning tokens.
    pub fn output_dim(&self) -> usize {
        match *self {
            CheckpointProfile::Linear {
                cross_attention_dim,
                ..
            }
            | CheckpointProfile::DenseMlp {
                cross_attention_dim,
                ..
            }
            | CheckpointProfile::FaceMlp {
                cross_attention_dim,
                ..
            } => cross_attention_dim,
            CheckpointProfile::Resampler { output_dim, .. } => output_dim,
        }
    }

    /// Number of tokens produced per image; `None` when the projection keeps
    /// the input's token count.
    pub fn num_tokens(&self) -> Option<usize> {
        match *self {
            CheckpointProfile::Linear { num_tokens, .. }
            | CheckpointProfile::FaceMlp { num_tokens, .. } => Some(num_tokens),
            CheckpointProfile::Resampler { num_queries, .. } => Some(num_queries),
            CheckpointProfile::DenseMlp { .. } => None,
        }
    }

    /// Feature width the projection expects on the last embedding axis.
    pub fn input_dim(&self) -> usize {
        match *self {
            CheckpointProfile::Linear {
                clip_embeddings_dim,
                ..
            }
            | CheckpointProfile::DenseMlp {
                clip_embeddings_dim,
                ..
            } => clip_embeddings_dim,
            CheckpointProfile::Resampler { embedding_dim, .. } => embedding_dim,
            CheckpointProfile::FaceMlp {
                id_embeddings_dim, ..
            } => id_embeddings_dim,
        }
    }

    /// Whether the projection consumes encoder hidden states rather than a
    /// pooled embedding.
    pub fn uses_hidden_states(&self) -> bool {
        matches!(
            self,
            CheckpointProfile::Resampler { .. } | CheckpointProfile::DenseMlp { .. }
        )
    }
}
