//! Image-prompt adapter conditioning for diffusion cross-attention
//!
//! This crate loads adapter checkpoints, projects vision embeddings into
//! conditioning tokens and installs per-layer attention patches that add
//! image-conditioned attention to a host UNet's text cross-attention.

#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod adapter;
pub mod attention;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod embeds;
pub mod error;
pub mod kv_projector;
pub mod mask;
pub mod nn;
pub mod patch;
pub mod projection;
pub mod registry;
pub mod schedule;

// Re-export essential types for ease of use
pub use self::adapter::IpAdapter;
pub use self::attention::{AttentionBackend, ScaledDotProductAttention};
pub use self::checkpoint::{AdapterCheckpoint, CheckpointProfile};
pub use self::config::{load_apply_params, parse_apply_params};
pub use self::embeds::{EmbedPair, WeightedEmbeds, combine_weighted, face_embed_pair};
pub use self::error::{IpAdapterError, Result};
pub use self::kv_projector::{KvProjector, KvSide};
pub use self::patch::{AttentionContext, AttentionPatch, ConditionSlot};
pub use self::projection::ImageProjection;
pub use self::registry::{ModelHandle, PatchTable};
pub use self::schedule::{DiscreteSchedule, MAX_SIGMA, NoiseSchedule};

pub use ipadapter_domain::{
    ApplyParams, BlockStage, CondOrUncond, ContextWindow, LayerKey, UnetLayout, WeightType,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
