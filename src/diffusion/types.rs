use tch::Tensor;

/// Predicts the noise that was mixed into `xs` at `timesteps`.
///
/// `xs` is `[batch, channels, height, width]`, `timesteps` is an int64
/// `[batch]` tensor and the prediction has the shape of `xs`. `train` is
/// false while sampling, layers with running statistics must not update them.
pub trait Denoiser {
    fn forward_t(&self, xs: &Tensor, timesteps: &Tensor, train: bool) -> Tensor;
}

/// Image snapshot taken during sampling, right after the reverse step at `timestep`.
#[derive(Debug)]
pub struct Frame {
    pub timestep: usize,
    pub image: Tensor,
}

#[derive(Debug)]
pub struct Sample {
    /// Image after the reverse step at t = 0.
    pub image: Tensor,
    /// Snapshots in the order they were taken, noisiest first.
    pub frames: Vec<Frame>,
    /// Number of reverse steps that were run.
    pub steps: usize,
}

/// Output of one loss evaluation, keeps the tensors around for inspection.
#[derive(Debug)]
pub struct TrainingLoss {
    pub loss: Tensor,
    pub noise: Tensor,
    pub noise_pred: Tensor,
}
