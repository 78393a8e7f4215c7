//! In-memory image batches for the training loop.
use std::path::Path;

use anyhow::Context;
use tch::{Device, Kind, Tensor};
use tracing::info;

use crate::trainer::DataSource;

/// A `[N, C, H, W]` float tensor of images in `[-1, 1]`, served in batches.
#[derive(Debug)]
pub struct TensorDataset {
    images: Tensor,
    batch_size: i64,
    shuffle: bool,
    drop_last: bool,
}

impl TensorDataset {
    pub fn new(images: Tensor, batch_size: i64) -> anyhow::Result<Self> {
        if images.dim() != 4 {
            anyhow::bail!("expected [N, C, H, W] images, got shape {:?}", images.size())
        }
        if batch_size <= 0 {
            anyhow::bail!("batch size must be positive, got {batch_size}")
        }
        Ok(Self { images, batch_size, shuffle: true, drop_last: true })
    }

    /// Loads every image of `dir`, resized to `img_size x img_size`.
    pub fn from_image_folder<P: AsRef<Path>>(dir: P, img_size: i64, batch_size: i64) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let images = tch::vision::image::load_dir(dir, img_size, img_size)
            .with_context(|| format!("error loading images from {:?}", dir))?;
        info!(?dir, count = images.size()[0], img_size, "images loaded");
        Self::new(pixels_to_unit_range(&images), batch_size)
    }

    /// Serve batches in storage order.
    pub fn without_shuffle(mut self) -> Self {
        self.shuffle = false;
        self
    }

    /// Also serve the trailing batch when it is smaller than `batch_size`.
    pub fn keep_last(mut self) -> Self {
        self.drop_last = false;
        self
    }

    pub fn len(&self) -> i64 {
        self.images.size()[0]
    }

    /// Channel count of every image, the `C` of `[N, C, H, W]`.
    pub fn channels(&self) -> i64 {
        self.images.size()[1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_device(self, device: Device) -> Self {
        Self { images: self.images.to_device(device), ..self }
    }
}

/// `[0, 255]` u8 pixels to `[-1, 1]` floats.
pub fn pixels_to_unit_range(images: &Tensor) -> Tensor {
    images.to_kind(Kind::Float) / 127.5 - 1.
}

impl DataSource for TensorDataset {
    fn batch_size(&self) -> i64 {
        self.batch_size
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Tensor> + '_> {
        let len = self.len();
        let order = if self.shuffle {
            Tensor::randperm(len, (Kind::Int64, self.images.device()))
        } else {
            Tensor::arange(len, (Kind::Int64, self.images.device()))
        };
        let n_batches = if self.drop_last { len / self.batch_size } else { (len + self.batch_size - 1) / self.batch_size };
        let batch_size = self.batch_size;
        let images = &self.images;
        Box::new((0..n_batches).map(move |i| {
            let start = i * batch_size;
            let size = i64::min(batch_size, len - start);
            images.index_select(0, &order.narrow(0, start, size))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: i64) -> Tensor {
        Tensor::arange(n, (Kind::Float, Device::Cpu)).view([n, 1, 1, 1]).expand([n, 3, 2, 2], false).contiguous()
    }

    fn first_values(batch: &Tensor) -> Vec<i64> {
        Vec::<i64>::try_from(&batch.select(1, 0).select(1, 0).select(1, 0).to_kind(Kind::Int64)).unwrap()
    }

    #[test]
    fn test_drop_last_keeps_batches_full() {
        let mut data = TensorDataset::new(numbered(10), 4).unwrap().without_shuffle();
        let batches: Vec<Tensor> = data.batches().collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(first_values(&batches[0]), vec![0, 1, 2, 3]);
        assert_eq!(first_values(&batches[1]), vec![4, 5, 6, 7]);
        for b in batches.iter() {
            assert_eq!(b.size(), vec![4, 3, 2, 2]);
        }
    }

    #[test]
    fn test_keep_last() {
        let mut data = TensorDataset::new(numbered(10), 4).unwrap().without_shuffle().keep_last();
        let sizes: Vec<i64> = data.batches().map(|b| b.size()[0]).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_shuffle_is_a_permutation() {
        let mut data = TensorDataset::new(numbered(12), 3).unwrap();
        let mut seen: Vec<i64> = data.batches().flat_map(|b| first_values(&b)).collect();
        seen.sort();
        assert_eq!(seen, (0..12).collect::<Vec<i64>>());
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(TensorDataset::new(Tensor::zeros([4, 3, 2], (Kind::Float, Device::Cpu)), 2).is_err());
        assert!(TensorDataset::new(numbered(4), 0).is_err());
    }

    #[test]
    fn test_pixels_to_unit_range() {
        let px = Tensor::from_slice(&[0u8, 255]);
        let out = pixels_to_unit_range(&px);
        assert_eq!(out.double_value(&[0]), -1.0);
        assert_eq!(out.double_value(&[1]), 1.0);
    }

    #[test]
    fn test_from_image_folder() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..3u8 {
            let img = Tensor::full([3, 12, 12], (i * 100) as i64, (Kind::Uint8, Device::Cpu));
            tch::vision::image::save(&img, tmp.path().join(format!("{i}.png"))).unwrap();
        }
        let mut data = TensorDataset::from_image_folder(tmp.path(), 8, 2).unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data.channels(), 3);
        let batches: Vec<Tensor> = data.batches().collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].size(), vec![2, 3, 8, 8]);
        assert!(batches[0].min().double_value(&[]) >= -1.0);
        assert!(batches[0].max().double_value(&[]) <= 1.0);
    }
}
