//! # Training loop
//!
//! Fits a [`Denoiser`] to predict the noise injected by the forward process,
//! and writes sample images plus a checkpoint at the start of every epoch.
use std::path::Path;

use tch::Tensor;
use tracing::{debug, info, info_span, warn};

use crate::{
    diffusion::{Denoiser, GaussianDiffusion, Sample, TrainingLoss},
    error::DiffusionError,
    utils::{clear_dir, epoch_filename, has_non_finite, image_strip, save_image},
};

pub mod builder;
pub mod config;
pub mod types;

pub use builder::DdpmBuilder;
pub use config::TrainConfig;
pub use types::{Checkpoint, DataSource, EpochSummary, Optimizer};

pub struct Trainer<M> {
    model: M,
    diffusion: GaussianDiffusion,
    config: TrainConfig,
    image_channels: i64,
    // 当前 (epoch, step)，用于报错
    epoch: usize,
    step: usize,
}

impl<M: Denoiser + Checkpoint> Trainer<M> {
    pub fn new(model: M, diffusion: GaussianDiffusion, config: TrainConfig) -> Self {
        Self { model, diffusion, config, image_channels: 3, epoch: 0, step: 0 }
    }

    pub fn with_image_channels(mut self, image_channels: i64) -> Self {
        self.image_channels = image_channels;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn diffusion(&self) -> &GaussianDiffusion {
        &self.diffusion
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Trains for `config.epochs` full passes over `data`.
    ///
    /// The output directories are emptied first. A non-finite loss or a
    /// failed checkpoint write aborts the run, failed image writes are only
    /// logged.
    pub fn fit<D, O>(&mut self, data: &mut D, optimizer: &mut O) -> anyhow::Result<Vec<EpochSummary>>
    where
        D: DataSource + ?Sized,
        O: Optimizer + ?Sized,
    {
        clear_dir(&self.config.outputs_dir)?;
        clear_dir(&self.config.plots_dir)?;
        if let Some(seed) = self.config.seed {
            tch::manual_seed(seed);
        }
        info!(
            epochs = self.config.epochs,
            batch_size = data.batch_size(),
            timesteps = self.diffusion.num_timesteps(),
            device = ?self.diffusion.device(),
            "start training"
        );

        let mut summaries = Vec::with_capacity(self.config.epochs);
        for epoch in 0..self.config.epochs {
            let _span = info_span!("epoch", epoch).entered();
            self.epoch = epoch;
            self.step = 0;
            let mut first_loss = None;
            let mut total = 0.0;
            for batch in data.batches() {
                let loss = self.train_step(&batch, optimizer)?;
                total += loss;
                if first_loss.is_none() {
                    first_loss = Some(loss);
                    self.on_epoch_start(epoch, loss)?;
                }
            }
            let Some(first_loss) = first_loss else {
                anyhow::bail!("the data source yielded no batch in epoch {epoch}")
            };
            summaries.push(EpochSummary { epoch, first_loss, mean_loss: total / self.step as f64, steps: self.step });
        }
        info!("done");
        Ok(summaries)
    }

    /// One optimisation step on a batch of clean images, returns the loss.
    ///
    /// The loss is checked before any gradient is propagated, a NaN or
    /// infinite loss never reaches the parameters.
    pub fn train_step<O: Optimizer + ?Sized>(&mut self, batch: &Tensor, optimizer: &mut O) -> anyhow::Result<f64> {
        optimizer.zero_grad();
        let batch = batch.to_device(self.diffusion.device());
        let t = self.diffusion.sample_timesteps(batch.size()[0]);
        let TrainingLoss { loss, .. } = self.diffusion.training_loss(&self.model, &batch, &t)?;
        let value = loss.f_double_value(&[])?;
        if !value.is_finite() {
            return Err(DiffusionError::NonFiniteLoss { epoch: self.epoch, step: self.step, loss: value }.into());
        }
        // a model without trainable parameters gives a loss without graph
        if loss.requires_grad() {
            loss.f_backward()?;
        }
        optimizer.step();
        debug!(step = self.step, loss = value);
        self.step += 1;
        Ok(value)
    }

    fn on_epoch_start(&self, epoch: usize, loss: f64) -> anyhow::Result<()> {
        info!("epoch {epoch} loss: {loss}");

        let plot_path = epoch_filename(&self.config.plots_dir, "plot_epoch", epoch, "jpg");
        let plot = self.sample_with_frames(self.config.num_plot_images)?;
        if let Err(err) = save_plot(&plot, &plot_path) {
            warn!("failed to write denoising plot: {err:#}");
        }

        let image_path = epoch_filename(&self.config.outputs_dir, "diff_epoch", epoch, "jpg");
        let sample = self.sample()?;
        if let Err(err) = save_image(&sample.image, &image_path) {
            warn!("failed to write generated image: {err:#}");
        }

        self.save_model(&self.config.checkpoint_path)
    }

    fn sample_shape(&self) -> [i64; 4] {
        [1, self.image_channels, self.config.img_size, self.config.img_size]
    }

    /// Generates one image from pure noise.
    pub fn sample(&self) -> anyhow::Result<Sample> {
        self.diffusion.sample(&self.model, &self.sample_shape(), None)
    }

    /// Generates one image and keeps about `num_images` intermediate frames.
    pub fn sample_with_frames(&self, num_images: usize) -> anyhow::Result<Sample> {
        let stride = (self.diffusion.num_timesteps() / num_images.max(1)).max(1);
        self.diffusion.sample(&self.model, &self.sample_shape(), Some(stride))
    }

    /// Generates an image and saves it to `path`.
    pub fn generate_image<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<Tensor> {
        let sample = self.sample()?;
        if has_non_finite(&sample.image) {
            warn!("generated image contains non-finite values");
        }
        save_image(&sample.image, path)?;
        Ok(sample.image)
    }

    /// Saves `num_images` frames of one denoising run side by side, from the
    /// final image on the left to the noisiest frame on the right.
    pub fn generate_image_plot<P: AsRef<Path>>(&self, path: P, num_images: usize) -> anyhow::Result<()> {
        let sample = self.sample_with_frames(num_images)?;
        save_plot(&sample, path.as_ref())
    }

    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let result = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent).map_err(anyhow::Error::from)
            }
            _ => Ok(()),
        }
        .and_then(|_| self.model.save(path));
        if let Err(source) = result {
            return Err(DiffusionError::CheckpointWrite { path: path.to_path_buf(), source: source.into() }.into());
        }
        debug!(?path, "checkpoint saved");
        Ok(())
    }

    pub fn load_model<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<()> {
        self.model.load(path.as_ref())?;
        info!(path = ?path.as_ref(), "weights loaded");
        Ok(())
    }
}

fn save_plot(sample: &Sample, path: &Path) -> anyhow::Result<()> {
    let frames: Vec<Tensor> = sample.frames.iter().rev().map(|f| f.image.shallow_clone()).collect();
    let strip = image_strip(&frames)?;
    tch::vision::image::save(&strip, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tch::{Device, Kind};

    use super::*;
    use crate::schedulers::NoiseSchedule;

    struct ZeroDenoiser;

    impl Denoiser for ZeroDenoiser {
        fn forward_t(&self, xs: &Tensor, _timesteps: &Tensor, _train: bool) -> Tensor {
            xs.zeros_like()
        }
    }

    impl Checkpoint for ZeroDenoiser {
        fn save(&self, path: &Path) -> anyhow::Result<()> {
            std::fs::write(path, b"zero")?;
            Ok(())
        }

        fn load(&mut self, path: &Path) -> anyhow::Result<()> {
            std::fs::read(path)?;
            Ok(())
        }
    }

    struct NanDenoiser;

    impl Denoiser for NanDenoiser {
        fn forward_t(&self, xs: &Tensor, _timesteps: &Tensor, _train: bool) -> Tensor {
            xs.full_like(f64::NAN)
        }
    }

    impl Checkpoint for NanDenoiser {
        fn save(&self, _path: &Path) -> anyhow::Result<()> {
            Ok(())
        }

        fn load(&mut self, _path: &Path) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingOptimizer {
        zero_grads: usize,
        steps: usize,
    }

    impl Optimizer for CountingOptimizer {
        fn zero_grad(&mut self) {
            self.zero_grads += 1;
        }

        fn step(&mut self) {
            assert_eq!(self.zero_grads, self.steps + 1);
            self.steps += 1;
        }
    }

    /// The same batch, `len` times per pass.
    struct FixedBatches {
        batch: Tensor,
        len: usize,
    }

    impl DataSource for FixedBatches {
        fn batch_size(&self) -> i64 {
            self.batch.size()[0]
        }

        fn batches(&mut self) -> Box<dyn Iterator<Item = Tensor> + '_> {
            Box::new((0..self.len).map(|_| self.batch.shallow_clone()))
        }
    }

    fn config(root: &Path, epochs: usize) -> TrainConfig {
        TrainConfig {
            epochs,
            batch_size: 4,
            img_size: 8,
            num_plot_images: 4,
            outputs_dir: root.join("outputs"),
            plots_dir: root.join("plots"),
            checkpoint_path: root.join("ckpt").join("autosave.safetensors"),
            ..Default::default()
        }
    }

    fn trainer<M: Denoiser + Checkpoint>(model: M, config: TrainConfig) -> Trainer<M> {
        let schedule = NoiseSchedule::linear(20, 0.0001, 0.02).unwrap();
        Trainer::new(model, GaussianDiffusion::new(schedule, Device::Cpu), config)
    }

    fn batches(len: usize) -> FixedBatches {
        FixedBatches { batch: Tensor::rand([4, 3, 16, 16], (Kind::Float, Device::Cpu)) * 2. - 1., len }
    }

    #[test]
    fn test_train_step_with_zero_prediction() {
        let tmp = tempfile::tempdir().unwrap();
        let mut trainer = trainer(ZeroDenoiser, config(tmp.path(), 1));
        let mut optimizer = CountingOptimizer::default();
        let loss = trainer.train_step(&batches(1).batch, &mut optimizer).unwrap();
        // E|N(0, 1)| = sqrt(2 / pi)
        let expected = (2.0 / std::f64::consts::PI).sqrt();
        assert!((loss - expected).abs() < 0.05, "loss={loss}");
        assert_eq!(optimizer.steps, 1);
    }

    #[test]
    fn test_fit_runs_every_step_and_writes_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path(), 2);
        std::fs::create_dir_all(&cfg.outputs_dir).unwrap();
        std::fs::write(cfg.outputs_dir.join("stale.jpeg"), b"old").unwrap();

        let mut trainer = trainer(ZeroDenoiser, cfg.clone());
        let mut optimizer = CountingOptimizer::default();
        let summaries = trainer.fit(&mut batches(3), &mut optimizer).unwrap();

        assert_eq!(optimizer.zero_grads, 6);
        assert_eq!(optimizer.steps, 6);
        assert_eq!(summaries.len(), 2);
        for (epoch, summary) in summaries.iter().enumerate() {
            assert_eq!(summary.epoch, epoch);
            assert_eq!(summary.steps, 3);
            assert!(summary.first_loss.is_finite() && summary.mean_loss.is_finite());
        }
        assert!(!cfg.outputs_dir.join("stale.jpeg").exists());
        for epoch in 0..2 {
            assert!(cfg.outputs_dir.join(format!("diff_epoch{epoch}.jpg")).is_file());
            assert!(cfg.plots_dir.join(format!("plot_epoch{epoch}.jpg")).is_file());
        }
        assert!(cfg.checkpoint_path.is_file());
    }

    #[test]
    fn test_non_finite_loss_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut trainer = trainer(NanDenoiser, config(tmp.path(), 1));
        let mut optimizer = CountingOptimizer::default();
        let err = trainer.fit(&mut batches(2), &mut optimizer).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DiffusionError>(),
            Some(DiffusionError::NonFiniteLoss { epoch: 0, step: 0, .. })
        ));
        assert_eq!(optimizer.steps, 0);
    }

    #[test]
    fn test_checkpoint_failure_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not_a_dir");
        std::fs::write(&blocker, b"file").unwrap();
        let cfg = TrainConfig { checkpoint_path: blocker.join("autosave.safetensors"), ..config(tmp.path(), 1) };
        let mut trainer = trainer(ZeroDenoiser, cfg);
        let err = trainer.fit(&mut batches(1), &mut CountingOptimizer::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<DiffusionError>(), Some(DiffusionError::CheckpointWrite { .. })));
    }

    #[test]
    fn test_image_write_failure_is_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path(), 1);
        let mut trainer = trainer(ZeroDenoiser, cfg.clone());
        // the output directory disappears after it was prepared
        struct RemoveOutputs(FixedBatches, PathBuf);
        impl DataSource for RemoveOutputs {
            fn batch_size(&self) -> i64 {
                self.0.batch_size()
            }
            fn batches(&mut self) -> Box<dyn Iterator<Item = Tensor> + '_> {
                let _ = std::fs::remove_dir_all(&self.1);
                self.0.batches()
            }
        }
        let mut data = RemoveOutputs(batches(1), cfg.outputs_dir.clone());
        let summaries = trainer.fit(&mut data, &mut CountingOptimizer::default()).unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(cfg.checkpoint_path.is_file());
    }

    #[test]
    fn test_empty_data_source_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut trainer = trainer(ZeroDenoiser, config(tmp.path(), 1));
        assert!(trainer.fit(&mut batches(0), &mut CountingOptimizer::default()).is_err());
    }

    #[test]
    fn test_generate_image_and_plot() {
        let tmp = tempfile::tempdir().unwrap();
        let trainer = trainer(ZeroDenoiser, config(tmp.path(), 1));
        let image_path = tmp.path().join("sample.png");
        let image = trainer.generate_image(&image_path).unwrap();
        assert_eq!(image.size(), vec![1, 3, 8, 8]);
        assert!(image_path.is_file());

        let sample = trainer.sample_with_frames(4).unwrap();
        let timesteps: Vec<usize> = sample.frames.iter().map(|f| f.timestep).collect();
        assert_eq!(timesteps, vec![15, 10, 5, 0]);
        let plot_path = tmp.path().join("plot.png");
        trainer.generate_image_plot(&plot_path, 4).unwrap();
        let plot = tch::vision::image::load(&plot_path).unwrap();
        assert_eq!(plot.size(), vec![3, 8, 32]);
    }

    #[test]
    fn test_save_and_load_model() {
        let tmp = tempfile::tempdir().unwrap();
        let mut trainer = trainer(ZeroDenoiser, config(tmp.path(), 1));
        let path = tmp.path().join("nested").join("weights.bin");
        trainer.save_model(&path).unwrap();
        trainer.load_model(&path).unwrap();
        assert!(trainer.load_model(tmp.path().join("missing.bin")).is_err());
    }
}
