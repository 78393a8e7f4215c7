use std::path::PathBuf;

/// Failures raised by the noise schedule and the training loop.
///
/// Library functions return `anyhow::Result`, callers that care about the
/// category can `downcast_ref::<DiffusionError>()`.
#[derive(Debug, thiserror::Error)]
pub enum DiffusionError {
    #[error("a noise schedule needs at least two timesteps, got {0}")]
    TooFewTimesteps(usize),

    #[error("invalid beta range, expected 0 < start < end < 1 but got start={start} end={end}")]
    InvalidBetaRange { start: f64, end: f64 },

    #[error("timestep {timestep} is outside of [0, {timesteps})")]
    TimestepOutOfRange { timestep: i64, timesteps: usize },

    #[error("non-finite loss {loss} at epoch {epoch}, step {step}")]
    NonFiniteLoss { epoch: usize, step: usize, loss: f64 },

    #[error("failed to write checkpoint {path:?}")]
    CheckpointWrite {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
