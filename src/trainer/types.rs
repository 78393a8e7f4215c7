use std::path::Path;

use tch::Tensor;

/// Gradient based parameter update, driven by the training loop.
pub trait Optimizer {
    fn zero_grad(&mut self);
    fn step(&mut self);
}

impl Optimizer for tch::nn::Optimizer {
    fn zero_grad(&mut self) {
        tch::nn::Optimizer::zero_grad(self)
    }

    fn step(&mut self) {
        tch::nn::Optimizer::step(self)
    }
}

/// Persists model parameters, the format is up to the implementation.
pub trait Checkpoint {
    fn save(&self, path: &Path) -> anyhow::Result<()>;
    fn load(&mut self, path: &Path) -> anyhow::Result<()>;
}

/// Yields batches of clean `[batch, channels, height, width]` images in `[-1, 1]`.
pub trait DataSource {
    fn batch_size(&self) -> i64;
    /// One full pass over the data.
    fn batches(&mut self) -> Box<dyn Iterator<Item = Tensor> + '_>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Loss of the first step, the one that is logged.
    pub first_loss: f64,
    pub mean_loss: f64,
    pub steps: usize,
}
