use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tch::Device;

use crate::{trainer::config::TrainConfig, unet::UNetConfig};

/// Where the model and every tensor of a run live.
///
/// Carried explicitly through the trainer instead of being looked up globally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// MPS when available, then CUDA, then CPU.
    #[default]
    Auto,
    Cpu,
    Mps,
    Cuda(usize),
}

impl DeviceKind {
    pub fn device(&self) -> Device {
        match self {
            DeviceKind::Auto => {
                if tch::utils::has_mps() {
                    Device::Mps
                } else {
                    Device::cuda_if_available()
                }
            }
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Mps => Device::Mps,
            DeviceKind::Cuda(index) => Device::Cuda(*index),
        }
    }
}

/// Linear beta schedule parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self { timesteps: 300, beta_start: 0.0001, beta_end: 0.02 }
    }
}

/// Top level configuration of a training or sampling run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DdpmConfig {
    #[serde(default)]
    pub device: DeviceKind,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub model: UNetConfig,
    #[serde(default)]
    pub train: TrainConfig,
}

impl DdpmConfig {
    pub fn from_file<T: AsRef<Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: DdpmConfig = toml::from_str(&file)?;
        Ok(cfg)
    }
}
