//! Small UNet noise predictor
//!
//! Takes a noisy image and its diffusion timesteps and predicts the noise
//! that was added. Down blocks halve the resolution, up blocks double it back
//! and consume the matching down block output as skip connection.
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tch::{nn, Device, Tensor};

use super::block::{Block, Sampling};
use crate::{diffusion::Denoiser, embeddings::SinusoidalPositionEmbeddings, trainer::types::Checkpoint};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UNetConfig {
    pub image_channels: i64,
    /// Channel widths of the down path, the up path mirrors it.
    pub down_channels: Vec<i64>,
    pub time_emb_dim: i64,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self { image_channels: 3, down_channels: vec![64, 128, 256, 512, 1024], time_emb_dim: 32 }
    }
}

impl UNetConfig {
    /// Image sides must be a multiple of this.
    pub fn size_multiple(&self) -> i64 {
        1 << self.down_channels.len().saturating_sub(1)
    }
}

#[derive(Debug)]
pub struct SimpleUNet {
    time_proj: SinusoidalPositionEmbeddings,
    time_linear: nn::Linear,
    conv0: nn::Conv2D,
    downs: Vec<Block>,
    ups: Vec<Block>,
    output: nn::Conv2D,
    pub config: UNetConfig,
}

impl SimpleUNet {
    pub fn new(vs: nn::Path, config: UNetConfig) -> anyhow::Result<Self> {
        if config.down_channels.len() < 2 {
            anyhow::bail!("expected at least two down channel widths, got {:?}", config.down_channels)
        }
        let time_emb_dim = config.time_emb_dim;
        let time_proj = SinusoidalPositionEmbeddings::new(time_emb_dim)?;
        let time_linear = nn::linear(&vs / "time_mlp", time_emb_dim, time_emb_dim, Default::default());

        let down_channels = &config.down_channels;
        let up_channels: Vec<i64> = down_channels.iter().rev().copied().collect();
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let conv0 = nn::conv2d(&vs / "conv0", config.image_channels, down_channels[0], 3, conv_cfg);

        let vs_downs = &vs / "downs";
        let downs = down_channels
            .windows(2)
            .enumerate()
            .map(|(i, w)| Block::new(&vs_downs / i, w[0], w[1], time_emb_dim, Sampling::Down))
            .collect();
        let vs_ups = &vs / "ups";
        let ups = up_channels
            .windows(2)
            .enumerate()
            .map(|(i, w)| Block::new(&vs_ups / i, w[0], w[1], time_emb_dim, Sampling::Up))
            .collect();

        let output = nn::conv2d(&vs / "output", up_channels[up_channels.len() - 1], config.image_channels, 1, Default::default());
        Ok(Self { time_proj, time_linear, conv0, downs, ups, output, config })
    }

    pub fn forward_t(&self, xs: &Tensor, timesteps: &Tensor, train: bool) -> Tensor {
        // 1. time
        let temb = timesteps.apply(&self.time_proj).apply(&self.time_linear).relu();
        // 2. pre-process
        let mut xs = xs.apply(&self.conv0);
        // 3. down
        let mut residuals = Vec::with_capacity(self.downs.len());
        for down in self.downs.iter() {
            xs = down.forward_t(&xs, &temb, train);
            residuals.push(xs.shallow_clone());
        }
        // 4. up, down 的输出倒序作为残差
        for (up, residual) in self.ups.iter().zip(residuals.iter().rev()) {
            xs = up.forward_t(&Tensor::cat(&[&xs, residual], 1), &temb, train);
        }
        xs.apply(&self.output)
    }
}

/// A [`SimpleUNet`] together with the variables it was built from.
pub struct DenoiseModel {
    vs: nn::VarStore,
    unet: SimpleUNet,
}

impl DenoiseModel {
    pub fn new(device: Device, config: UNetConfig) -> anyhow::Result<Self> {
        let vs = nn::VarStore::new(device);
        let unet = SimpleUNet::new(vs.root(), config)?;
        Ok(Self { vs, unet })
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn config(&self) -> &UNetConfig {
        &self.unet.config
    }
}

impl Denoiser for DenoiseModel {
    fn forward_t(&self, xs: &Tensor, timesteps: &Tensor, train: bool) -> Tensor {
        self.unet.forward_t(xs, timesteps, train)
    }
}

impl Checkpoint for DenoiseModel {
    fn save(&self, path: &Path) -> anyhow::Result<()> {
        self.vs.save(path).with_context(|| format!("error saving weights to {:?}", path))?;
        Ok(())
    }

    fn load(&mut self, path: &Path) -> anyhow::Result<()> {
        self.vs.load(path).with_context(|| format!("error loading weights from {:?}", path))?;
        Ok(())
    }
}
