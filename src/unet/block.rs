use tch::{nn::{self, Module}, Tensor};

/// Whether a block halves or doubles the spatial resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    Down,
    /// Takes the skip connection concatenated on the channel axis.
    Up,
}

#[derive(Debug)]
enum Transform {
    Down(nn::Conv2D),
    Up(nn::ConvTranspose2D),
}

/// conv -> relu -> bn, + time embedding, conv -> relu -> bn, then resample.
#[derive(Debug)]
pub struct Block {
    time_mlp: nn::Linear,
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    bnorm1: nn::BatchNorm,
    bnorm2: nn::BatchNorm,
    transform: Transform,
}

impl Block {
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64, time_emb_dim: i64, sampling: Sampling) -> Self {
        let time_mlp = nn::linear(&vs / "time_mlp", time_emb_dim, out_channels, Default::default());
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let (conv1, transform) = match sampling {
            Sampling::Up => {
                let conv1 = nn::conv2d(&vs / "conv1", 2 * in_channels, out_channels, 3, conv_cfg);
                let cfg = nn::ConvTransposeConfig { stride: 2, padding: 1, ..Default::default() };
                let transform = nn::conv_transpose2d(&vs / "transform", out_channels, out_channels, 4, cfg);
                (conv1, Transform::Up(transform))
            }
            Sampling::Down => {
                let conv1 = nn::conv2d(&vs / "conv1", in_channels, out_channels, 3, conv_cfg);
                let cfg = nn::ConvConfig { stride: 2, padding: 1, ..Default::default() };
                let transform = nn::conv2d(&vs / "transform", out_channels, out_channels, 4, cfg);
                (conv1, Transform::Down(transform))
            }
        };
        let conv2 = nn::conv2d(&vs / "conv2", out_channels, out_channels, 3, conv_cfg);
        let bnorm1 = nn::batch_norm2d(&vs / "bnorm1", out_channels, Default::default());
        let bnorm2 = nn::batch_norm2d(&vs / "bnorm2", out_channels, Default::default());
        Self { time_mlp, conv1, conv2, bnorm1, bnorm2, transform }
    }

    pub fn forward_t(&self, xs: &Tensor, temb: &Tensor, train: bool) -> Tensor {
        let h = xs.apply(&self.conv1).relu().apply_t(&self.bnorm1, train);
        // [b, c] -> [b, c, 1, 1]
        let time_emb = self.time_mlp.forward(temb).relu().unsqueeze(-1).unsqueeze(-1);
        let h = h + time_emb;
        let h = h.apply(&self.conv2).relu().apply_t(&self.bnorm2, train);
        match &self.transform {
            Transform::Down(conv) => h.apply(conv),
            Transform::Up(conv) => h.apply(conv),
        }
    }
}
