//! # IP-Adapter Domain
//!
//! Shared domain objects and types for the ipadapter workspace.
//!
//! This crate holds the candle-free vocabulary that the engine and its hosts
//! agree on: which cross-attention layers exist in a UNet, how an adapter is
//! weighted and scheduled, and what a sampler tells the attention patch on
//! every call.

pub mod apply_params;
pub mod domain_error;
pub mod layer_key;
pub mod sampling_context;
pub mod weight_type;

// Re-export core types
pub use apply_params::ApplyParams;
pub use domain_error::DomainError;
pub use layer_key::{BlockStage, LayerKey, UnetLayout};
pub use sampling_context::{CondOrUncond, ContextWindow};
pub use weight_type::WeightType;
