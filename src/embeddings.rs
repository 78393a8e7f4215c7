use tch::{nn::Module, Kind, Tensor};

/// Sinusoidal embedding of integer timesteps, `[batch] -> [batch, dim]`.
#[derive(Debug, Clone, Copy)]
pub struct SinusoidalPositionEmbeddings {
    dim: i64,
}

impl SinusoidalPositionEmbeddings {
    /// `dim` must be even and at least 4.
    pub fn new(dim: i64) -> anyhow::Result<Self> {
        if dim < 4 || dim % 2 != 0 {
            anyhow::bail!("embedding dim must be even and >= 4, got {dim}")
        }
        Ok(Self { dim })
    }
}

impl Module for SinusoidalPositionEmbeddings {
    fn forward(&self, time: &Tensor) -> Tensor {
        let device = time.device();
        let half_dim = self.dim / 2;
        let exponent = (10000f64).ln() / (half_dim - 1) as f64;
        let freqs = (Tensor::arange(half_dim, (Kind::Float, device)) * -exponent).exp();
        let args = time.to_kind(Kind::Float).unsqueeze(-1) * freqs.unsqueeze(0);
        Tensor::cat(&[args.sin(), args.cos()], -1)
    }
}
