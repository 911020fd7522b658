//! How an adapter's weight is folded into the attention contribution.
use crate::domain_error::DomainError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Weighting mode of a condition slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeightType {
    /// Scale the attention output by the weight.
    #[default]
    #[serde(rename = "original")]
    Original,
    /// Scale keys and values by the weight before attention.
    #[serde(rename = "linear")]
    Linear,
    /// Scale keys and the per-token value mean by a width-compensated weight.
    #[serde(rename = "channel penalty")]
    ChannelPenalty,
}

impl WeightType {
    /// Name used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightType::Original => "original",
            WeightType::Linear => "linear",
            WeightType::ChannelPenalty => "channel penalty",
        }
    }
}

impl FromStr for WeightType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "original" => Ok(WeightType::Original),
            "linear" => Ok(WeightType::Linear),
            "channel penalty" | "channel_penalty" => Ok(WeightType::ChannelPenalty),
            other => Err(DomainError::UnknownWeightType(other.to_string())),
        }
    }
}

impl std::fmt::Display for WeightType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
