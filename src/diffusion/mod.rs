//! # Gaussian diffusion
//!
//! Forward noising, single reverse denoising steps and the full ancestral
//! sampling loop of a DDPM, on top of a [`NoiseSchedule`].
use tch::{Device, Kind, Tensor};
use tracing::debug;

use crate::schedulers::{extract, NoiseSchedule, ScheduleTensors};

pub mod types;

pub use types::{Denoiser, Frame, Sample, TrainingLoss};

#[derive(Debug)]
pub struct GaussianDiffusion {
    schedule: NoiseSchedule,
    tensors: ScheduleTensors,
    device: Device,
}

impl GaussianDiffusion {
    pub fn new(schedule: NoiseSchedule, device: Device) -> Self {
        let tensors = schedule.to_tensors(device);
        Self { schedule, tensors, device }
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn num_timesteps(&self) -> usize {
        self.schedule.timesteps
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// One timestep per sample, uniform over `[0, T)`.
    pub fn sample_timesteps(&self, batch_size: i64) -> Tensor {
        Tensor::randint(self.schedule.timesteps as i64, [batch_size], (Kind::Int64, self.device))
    }

    /// Noises `x0` up to timestep `t`, returns `(x_t, noise)`.
    pub fn forward_step(&self, x0: &Tensor, t: &Tensor) -> anyhow::Result<(Tensor, Tensor)> {
        let x0 = x0.to_device(self.device);
        let noise = Tensor::randn_like(&x0);
        let xt = self.forward_step_with_noise(&x0, t, &noise)?;
        Ok((xt, noise))
    }

    /// `sqrt(ᾱ_t)·x0 + sqrt(1 - ᾱ_t)·noise`
    pub fn forward_step_with_noise(&self, x0: &Tensor, t: &Tensor, noise: &Tensor) -> anyhow::Result<Tensor> {
        self.tensors.check_timesteps(t)?;
        let shape = x0.size();
        let sqrt_alphas_cumprod_t = extract(&self.tensors.sqrt_alphas_cumprod, t, &shape);
        let sqrt_one_minus_alphas_cumprod_t =
            extract(&self.tensors.sqrt_one_minus_alphas_cumprod, t, &shape);
        let x0 = x0.to_device(self.device);
        let noise = noise.to_device(self.device);
        Ok(sqrt_alphas_cumprod_t * x0 + sqrt_one_minus_alphas_cumprod_t * noise)
    }

    /// One ancestral denoising step from `x_t` to `x_{t-1}`.
    ///
    /// Samples at t = 0 get the posterior mean without any noise. When the
    /// whole batch is at t = 0 no noise is drawn at all.
    pub fn reverse_step<M: Denoiser + ?Sized>(&self, model: &M, x: &Tensor, t: &Tensor) -> anyhow::Result<Tensor> {
        self.tensors.check_timesteps(t)?;
        let _guard = tch::no_grad_guard();
        let x = x.to_device(self.device);
        let t = t.to_device(self.device);
        let shape = x.size();
        let betas_t = extract(&self.tensors.betas, &t, &shape);
        let sqrt_one_minus_alphas_cumprod_t =
            extract(&self.tensors.sqrt_one_minus_alphas_cumprod, &t, &shape);
        let sqrt_recip_alphas_t = extract(&self.tensors.sqrt_recip_alphas, &t, &shape);

        let noise_pred = model.forward_t(&x, &t, false);
        let model_mean =
            sqrt_recip_alphas_t * (&x - betas_t * noise_pred / sqrt_one_minus_alphas_cumprod_t);

        let nonzero = t.ne(0i64);
        if nonzero.any().int64_value(&[]) == 0 {
            return Ok(model_mean);
        }
        let posterior_variance_t = extract(&self.tensors.posterior_variance, &t, &shape);
        let mask = nonzero.to_kind(Kind::Float).reshape(posterior_variance_t.size());
        let noise = Tensor::randn_like(&x);
        Ok(model_mean + mask * posterior_variance_t.sqrt() * noise)
    }

    /// L1 distance between the injected noise and the model prediction at `t`.
    pub fn training_loss<M: Denoiser + ?Sized>(&self, model: &M, x0: &Tensor, t: &Tensor) -> anyhow::Result<TrainingLoss> {
        let (x_noisy, noise) = self.forward_step(x0, t)?;
        let noise_pred = model.forward_t(&x_noisy, &t.to_device(self.device), true);
        let loss = (&noise - &noise_pred).abs().mean(Kind::Float);
        Ok(TrainingLoss { loss, noise, noise_pred })
    }

    /// Runs the reverse process from pure noise of `shape` down to t = 0.
    ///
    /// With `frame_stride = Some(s)` the image is also recorded after every
    /// timestep that is a multiple of `s`.
    pub fn sample<M: Denoiser + ?Sized>(
        &self,
        model: &M,
        shape: &[i64],
        frame_stride: Option<usize>,
    ) -> anyhow::Result<Sample> {
        let Some(&batch_size) = shape.first() else {
            anyhow::bail!("cannot sample an image of empty shape")
        };
        let _guard = tch::no_grad_guard();
        let mut img = Tensor::randn(shape, (Kind::Float, self.device));
        let mut frames = vec![];
        let mut steps = 0;
        for i in (0..self.schedule.timesteps).rev() {
            let t = Tensor::full([batch_size], i as i64, (Kind::Int64, self.device));
            img = self.reverse_step(model, &img, &t)?;
            steps += 1;
            if let Some(stride) = frame_stride {
                if stride > 0 && i % stride == 0 {
                    frames.push(Frame { timestep: i, image: img.shallow_clone() });
                }
            }
        }
        debug!(steps, frames = frames.len(), "sampling finished");
        Ok(Sample { image: img, frames, steps })
    }
}
