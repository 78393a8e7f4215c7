use std::{fs, path::Path};

use anyhow::Context;
use tch::{Device, Kind, Tensor};

/// Creates `dir` if needed, otherwise removes the files it holds.
///
/// Sub-directories are left alone.
pub fn clear_dir<P: AsRef<Path>>(dir: P) -> anyhow::Result<()> {
    let dir = dir.as_ref();
    if !dir.exists() {
        fs::create_dir_all(dir).with_context(|| format!("error creating {:?}", dir))?;
        return Ok(());
    }
    for entry in fs::read_dir(dir).with_context(|| format!("error listing {:?}", dir))? {
        let path = entry?.path();
        if path.is_file() {
            fs::remove_file(&path).with_context(|| format!("error removing {:?}", path))?;
        }
    }
    Ok(())
}

/// `outputs/diff_epoch3.jpg` style names for per-epoch artifacts.
pub fn epoch_filename<P: AsRef<Path>>(dir: P, prefix: &str, epoch: usize, extension: &str) -> std::path::PathBuf {
    dir.as_ref().join(format!("{prefix}{epoch}.{extension}"))
}

/// Maps the first image of a `[-1, 1]` batch to a `[C, H, W]` u8 cpu tensor.
pub fn to_image(xs: &Tensor) -> Tensor {
    let xs = if xs.dim() == 4 { xs.get(0) } else { xs.shallow_clone() };
    let xs = ((xs.to_kind(Kind::Float) + 1.) / 2.).clamp(0., 1.).to_device(Device::Cpu);
    (xs * 255.).to_kind(Kind::Uint8)
}

/// Saves the first image of a `[-1, 1]` batch, the format follows the extension.
pub fn save_image<P: AsRef<Path>>(xs: &Tensor, path: P) -> anyhow::Result<()> {
    tch::vision::image::save(&to_image(xs), path.as_ref())
        .with_context(|| format!("error saving image {:?}", path.as_ref()))?;
    Ok(())
}

/// Lays the first image of every batch out left to right.
pub fn image_strip(frames: &[Tensor]) -> anyhow::Result<Tensor> {
    if frames.is_empty() {
        anyhow::bail!("no frames to lay out")
    }
    let images: Vec<Tensor> = frames.iter().map(to_image).collect();
    // [C, H, W]，按宽度拼接
    Ok(Tensor::cat(&images, 2))
}

pub fn has_non_finite(xs: &Tensor) -> bool {
    xs.isfinite().logical_not().any().int64_value(&[]) != 0
}
