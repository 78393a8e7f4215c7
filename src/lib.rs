pub mod config;
pub mod data;
pub mod diffusion;
pub mod embeddings;
pub mod error;
pub mod schedulers;
pub mod trainer;
pub mod unet;
pub mod utils;
