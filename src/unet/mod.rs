pub mod block;
pub mod simple_unet;

pub use simple_unet::{DenoiseModel, SimpleUNet, UNetConfig};
