use tch::{nn::{self, OptimizerConfig}, Device};

use crate::{
    config::DdpmConfig,
    data::TensorDataset,
    diffusion::GaussianDiffusion,
    schedulers::NoiseSchedule,
    unet::DenoiseModel,
};

use super::Trainer;

/// Wires a [`DdpmConfig`] into a model, its optimizer and a trainer.
pub struct DdpmBuilder {
    config: DdpmConfig,
    device: Device,
}

impl DdpmBuilder {
    pub fn new(config: DdpmConfig) -> Self {
        let device = config.device.device();
        Self { config, device }
    }

    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        Ok(Self::new(DdpmConfig::from_file(path)?))
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn config(&self) -> &DdpmConfig {
        &self.config
    }

    pub fn build_model(&self) -> anyhow::Result<DenoiseModel> {
        let multiple = self.config.model.size_multiple();
        if self.config.train.img_size % multiple != 0 {
            anyhow::bail!(
                "img_size {} is not a multiple of {} required by {} down blocks",
                self.config.train.img_size,
                multiple,
                self.config.model.down_channels.len() - 1
            )
        }
        DenoiseModel::new(self.device, self.config.model.clone())
    }

    /// Fails when the images of `data` do not have the channel count the
    /// model is configured for.
    pub fn check_dataset(&self, data: &TensorDataset) -> anyhow::Result<()> {
        let expected = self.config.model.image_channels;
        if data.channels() != expected {
            anyhow::bail!("dataset images have {} channels, the model expects {}", data.channels(), expected)
        }
        Ok(())
    }

    /// Adam over every variable of `model`.
    pub fn build_optimizer(&self, model: &DenoiseModel) -> anyhow::Result<nn::Optimizer> {
        let optimizer = nn::Adam::default().build(model.var_store(), self.config.train.learning_rate)?;
        Ok(optimizer)
    }

    /// Fails fast on an invalid schedule.
    pub fn build_trainer(&self, model: DenoiseModel) -> anyhow::Result<Trainer<DenoiseModel>> {
        let schedule = NoiseSchedule::from_config(&self.config.schedule)?;
        let diffusion = GaussianDiffusion::new(schedule, self.device);
        let image_channels = self.config.model.image_channels;
        Ok(Trainer::new(model, diffusion, self.config.train.clone()).with_image_channels(image_channels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Kind, Tensor};

    use crate::{config::{DeviceKind, ScheduleConfig}, error::DiffusionError, unet::UNetConfig};

    fn tiny_config() -> DdpmConfig {
        let mut cfg = DdpmConfig {
            device: DeviceKind::Cpu,
            schedule: ScheduleConfig { timesteps: 10, ..Default::default() },
            model: UNetConfig { image_channels: 3, down_channels: vec![4, 8], time_emb_dim: 8 },
            ..Default::default()
        };
        cfg.train.img_size = 8;
        cfg
    }

    #[test]
    fn test_build_trainer() {
        let builder = DdpmBuilder::new(tiny_config());
        assert_eq!(builder.device(), Device::Cpu);
        let model = builder.build_model().unwrap();
        let optimizer = builder.build_optimizer(&model);
        assert!(optimizer.is_ok());
        let trainer = builder.build_trainer(model).unwrap();
        assert_eq!(trainer.diffusion().num_timesteps(), 10);
        let sample = trainer.sample().unwrap();
        assert_eq!(sample.image.size(), vec![1, 3, 8, 8]);
    }

    #[test]
    fn test_invalid_schedule_fails_at_construction() {
        let mut cfg = tiny_config();
        cfg.schedule.timesteps = 1;
        let builder = DdpmBuilder::new(cfg);
        let model = builder.build_model().unwrap();
        let err = builder.build_trainer(model).err().unwrap();
        assert!(matches!(err.downcast_ref::<DiffusionError>(), Some(DiffusionError::TooFewTimesteps(1))));
    }

    #[test]
    fn test_img_size_must_fit_the_unet() {
        let mut cfg = tiny_config();
        cfg.train.img_size = 7;
        assert!(DdpmBuilder::new(cfg).build_model().is_err());
    }

    #[test]
    fn test_dataset_channels_must_match_the_model() {
        let builder = DdpmBuilder::new(tiny_config());
        let rgb = TensorDataset::new(Tensor::zeros([4, 3, 8, 8], (Kind::Float, Device::Cpu)), 2).unwrap();
        assert!(builder.check_dataset(&rgb).is_ok());
        let gray = TensorDataset::new(Tensor::zeros([4, 1, 8, 8], (Kind::Float, Device::Cpu)), 2).unwrap();
        assert!(builder.check_dataset(&gray).is_err());
    }
}
