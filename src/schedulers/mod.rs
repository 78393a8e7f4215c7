//! # Noise schedule
//!
//! Per-timestep scalars shared by the forward (noising) and reverse
//! (denoising) processes. Computed once, never mutated afterwards.
use tch::{Device, Kind, Tensor};

use crate::{config::ScheduleConfig, error::DiffusionError};

/// Linear beta schedule and every quantity derived from it, indexed by
/// timestep `t` in `[0, timesteps)`.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    pub timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub betas: Vec<f64>,
    pub alphas: Vec<f64>,
    pub alphas_cumprod: Vec<f64>,
    pub alphas_cumprod_prev: Vec<f64>,
    pub sqrt_recip_alphas: Vec<f64>,
    pub sqrt_alphas_cumprod: Vec<f64>,
    pub sqrt_one_minus_alphas_cumprod: Vec<f64>,
    /// Variance of q(x_{t-1} | x_t, x_0).
    pub posterior_variance: Vec<f64>,
}

impl NoiseSchedule {
    /// Betas linearly interpolated from `beta_start` to `beta_end`, both included.
    pub fn linear(timesteps: usize, beta_start: f64, beta_end: f64) -> anyhow::Result<Self> {
        if timesteps <= 1 {
            return Err(DiffusionError::TooFewTimesteps(timesteps).into());
        }
        // NaN 也会在这里被拒绝
        if !(0.0 < beta_start && beta_start < beta_end && beta_end < 1.0) {
            return Err(DiffusionError::InvalidBetaRange { start: beta_start, end: beta_end }.into());
        }
        let step = (beta_end - beta_start) / (timesteps - 1) as f64;
        let betas: Vec<f64> = (0..timesteps).map(|t| beta_start + t as f64 * step).collect();
        Ok(Self::from_betas(betas, beta_start, beta_end))
    }

    pub fn from_config(config: &ScheduleConfig) -> anyhow::Result<Self> {
        Self::linear(config.timesteps, config.beta_start, config.beta_end)
    }

    fn from_betas(betas: Vec<f64>, beta_start: f64, beta_end: f64) -> Self {
        let timesteps = betas.len();
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        let mut alphas_cumprod = Vec::with_capacity(timesteps);
        let mut prod = 1.0;
        for alpha in alphas.iter() {
            prod *= alpha;
            alphas_cumprod.push(prod);
        }

        let alphas_cumprod_prev: Vec<f64> = std::iter::once(1.0)
            .chain(alphas_cumprod[..timesteps - 1].iter().copied())
            .collect();
        let sqrt_recip_alphas = alphas.iter().map(|a| (1.0 / a).sqrt()).collect();
        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod =
            alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();
        let posterior_variance = (0..timesteps)
            .map(|t| betas[t] * (1.0 - alphas_cumprod_prev[t]) / (1.0 - alphas_cumprod[t]))
            .collect();

        Self {
            timesteps,
            beta_start,
            beta_end,
            betas,
            alphas,
            alphas_cumprod,
            alphas_cumprod_prev,
            sqrt_recip_alphas,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            posterior_variance,
        }
    }

    /// Copies the sequences the diffusion steps index into onto `device`.
    pub fn to_tensors(&self, device: Device) -> ScheduleTensors {
        let t = |values: &[f64]| Tensor::from_slice(values).to_kind(Kind::Float).to_device(device);
        ScheduleTensors {
            timesteps: self.timesteps,
            betas: t(&self.betas),
            sqrt_recip_alphas: t(&self.sqrt_recip_alphas),
            sqrt_alphas_cumprod: t(&self.sqrt_alphas_cumprod),
            sqrt_one_minus_alphas_cumprod: t(&self.sqrt_one_minus_alphas_cumprod),
            posterior_variance: t(&self.posterior_variance),
        }
    }
}

/// Device resident copy of the schedule.
#[derive(Debug)]
pub struct ScheduleTensors {
    pub timesteps: usize,
    pub betas: Tensor,
    pub sqrt_recip_alphas: Tensor,
    pub sqrt_alphas_cumprod: Tensor,
    pub sqrt_one_minus_alphas_cumprod: Tensor,
    pub posterior_variance: Tensor,
}

impl ScheduleTensors {
    /// Range check for a batch of timesteps, done once per diffusion step
    /// before any gather.
    pub fn check_timesteps(&self, t: &Tensor) -> anyhow::Result<()> {
        if t.dim() != 1 {
            anyhow::bail!("expected one timestep per sample, got shape {:?}", t.size())
        }
        if t.numel() == 0 {
            return Ok(());
        }
        let min = t.min().int64_value(&[]);
        let max = t.max().int64_value(&[]);
        for timestep in [min, max] {
            if timestep < 0 || timestep >= self.timesteps as i64 {
                return Err(DiffusionError::TimestepOutOfRange { timestep, timesteps: self.timesteps }.into());
            }
        }
        Ok(())
    }
}

/// Picks `values[t[i]]` for every sample `i` and reshapes the result to
/// `[batch, 1, 1, ..]` so that it broadcasts against a tensor of `x_shape`.
///
/// `t` must already be range checked, see [`ScheduleTensors::check_timesteps`].
pub fn extract(values: &Tensor, t: &Tensor, x_shape: &[i64]) -> Tensor {
    let batch_size = t.size()[0];
    let mut shape = vec![batch_size];
    shape.extend(std::iter::repeat(1).take(x_shape.len().saturating_sub(1)));
    let t = t.to_device(values.device()).to_kind(Kind::Int64);
    values.gather(-1, &t, false).reshape(shape)
}
