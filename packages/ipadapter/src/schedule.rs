//! Mapping sampling progress to noise levels.

/// Sigma reported for "before sampling starts"; every slot is active at it
/// unless its window explicitly ends earlier.
pub const MAX_SIGMA: f64 = 999_999_999.9;

/// Noise schedule of the host sampler.
pub trait NoiseSchedule {
    /// Absolute noise level reached after `percent` of sampling.
    fn percent_to_sigma(&self, percent: f64) -> f64;
}

impl<F> NoiseSchedule for F
where
    F: Fn(f64) -> f64,
{
    fn percent_to_sigma(&self, percent: f64) -> f64 {
        self(percent)
    }
}

/// Discrete-time epsilon schedule with scaled-linear betas.
#[derive(Debug, Clone)]
pub struct DiscreteSchedule {
    log_sigmas: Vec<f64>,
}

impl DiscreteSchedule {
    pub fn scaled_linear(linear_start: f64, linear_end: f64, timesteps: usize) -> Self {
        let timesteps = timesteps.max(2);
        let (start, end) = (linear_start.sqrt(), linear_end.sqrt());
        let mut alphas_cumprod = 1.0;
        let log_sigmas = (0..timesteps)
            .map(|i| {
                let beta = start + (end - start) * i as f64 / (timesteps - 1) as f64;
                alphas_cumprod *= 1.0 - beta * beta;
                (((1.0 - alphas_cumprod) / alphas_cumprod).sqrt()).ln()
            })
            .collect();
        Self { log_sigmas }
    }

    pub fn num_timesteps(&self) -> usize {
        self.log_sigmas.len()
    }

    /// Sigma at a fractional timestep, interpolated in log space.
    pub fn sigma(&self, timestep: f64) -> f64 {
        let last = (self.log_sigmas.len() - 1) as f64;
        let t = timestep.clamp(0.0, last);
        let low = t.floor() as usize;
        let high = t.ceil() as usize;
        let w = t - t.floor();
        ((1.0 - w) * self.log_sigmas[low] + w * self.log_sigmas[high]).exp()
    }

    pub fn sigma_min(&self) -> f64 {
        self.sigma(0.0)
    }

    pub fn sigma_max(&self) -> f64 {
        self.sigma((self.log_sigmas.len() - 1) as f64)
    }
}

impl Default for DiscreteSchedule {
    /// The SD 1.x / SDXL training schedule.
    fn default() -> Self {
        Self::scaled_linear(0.00085, 0.012, 1000)
    }
}

impl NoiseSchedule for DiscreteSchedule {
    fn percent_to_sigma(&self, percent: f64) -> f64 {
        if percent <= 0.0 {
            return MAX_SIGMA;
        }
        if percent >= 1.0 {
            return 0.0;
        }
        let percent = 1.0 - percent;
        self.sigma(percent * (self.log_sigmas.len() - 1) as f64)
    }
}
