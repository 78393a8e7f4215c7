use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: i64,
    pub learning_rate: f64,
    /// Side of the square images that are trained on and generated.
    pub img_size: i64,
    /// Frames in the per-epoch denoising plot.
    pub num_plot_images: usize,
    pub outputs_dir: PathBuf,
    pub plots_dir: PathBuf,
    /// Overwritten at the start of every epoch.
    pub checkpoint_path: PathBuf,
    pub seed: Option<i64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 32,
            learning_rate: 0.001,
            img_size: 64,
            num_plot_images: 10,
            outputs_dir: PathBuf::from("outputs"),
            plots_dir: PathBuf::from("plots"),
            checkpoint_path: PathBuf::from("autosave.safetensors"),
            seed: None,
        }
    }
}

