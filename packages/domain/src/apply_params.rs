//! Caller-facing parameters of one "apply adapter" invocation.
use crate::domain_error::DomainError;
use crate::weight_type::WeightType;
use serde::{Deserialize, Serialize};

/// Lowest accepted adapter weight.
pub const MIN_WEIGHT: f64 = -1.0;
/// Highest accepted adapter weight.
pub const MAX_WEIGHT: f64 = 3.0;

/// Parameters controlling how strongly and when an adapter acts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyParams {
    pub weight: f64,
    pub weight_type: WeightType,
    /// Strength of the noise mixed into the negative image.
    ///
    /// Nothing in the attention path reads it. It is validated here and
    /// passed through to whichever image encoder builds the unconditioned
    /// embedding of an `EmbedPair`; at `0.0` that embedding comes from a
    /// zeroed image.
    pub noise: f64,
    /// Sampling progress fraction at which conditioning switches on.
    pub start_at: f64,
    /// Sampling progress fraction at which conditioning switches off.
    pub end_at: f64,
    /// Pair each conditioning image with one frame of the batch instead of
    /// broadcasting a single sequence over the whole batch.
    pub unfold_batch: bool,
}

impl Default for ApplyParams {
    fn default() -> Self {
        Self {
            weight: 1.0,
            weight_type: WeightType::Original,
            noise: 0.0,
            start_at: 0.0,
            end_at: 1.0,
            unfold_batch: false,
        }
    }
}

impl ApplyParams {
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_weight_type(mut self, weight_type: WeightType) -> Self {
        self.weight_type = weight_type;
        self
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_schedule(mut self, start_at: f64, end_at: f64) -> Self {
        self.start_at = start_at;
        self.end_at = end_at;
        self
    }

    pub fn with_unfold_batch(mut self, unfold_batch: bool) -> Self {
        self.unfold_batch = unfold_batch;
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        check_range("weight", self.weight, MIN_WEIGHT, MAX_WEIGHT)?;
        check_range("noise", self.noise, 0.0, 1.0)?;
        check_range("start_at", self.start_at, 0.0, 1.0)?;
        check_range("end_at", self.end_at, 0.0, 1.0)?;
        if self.start_at > self.end_at {
            return Err(DomainError::InvertedSchedule {
                start_at: self.start_at,
                end_at: self.end_at,
            });
        }
        Ok(())
    }
}

fn check_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), DomainError> {
    // NaN lies outside every range.
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(DomainError::OutOfRange {
            name,
            value,
            min,
            max,
        })
    }
}
