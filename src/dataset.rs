//! In-memory image classification datasets.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::cifar_data::load_cifar10;
use crate::error::DataError;
use crate::helpers::split_indices;
use crate::mnist_data::load_mnist;
use crate::tensor::Tensor;

/// Which file of a dataset to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

/// Images as one `[N, C, H, W]` tensor plus one label per image.
#[derive(Debug, Clone)]
pub struct Dataset {
    images: Tensor,
    labels: Vec<usize>,
    classes: Vec<String>,
}

impl Dataset {
    pub fn new(images: Tensor, labels: Vec<usize>, classes: Vec<String>) -> Result<Self, DataError> {
        if images.rank() != 4 {
            return Err(DataError::Invalid(format!(
                "images must be [N, C, H, W], got {:?}",
                images.shape()
            )));
        }
        if images.shape()[0] != labels.len() {
            return Err(DataError::Invalid(format!(
                "{} images but {} labels",
                images.shape()[0],
                labels.len()
            )));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= classes.len()) {
            return Err(DataError::Invalid(format!(
                "label {bad} out of range for {} classes",
                classes.len()
            )));
        }
        Ok(Dataset { images, labels, classes })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn images(&self) -> &Tensor {
        &self.images
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// `[channels, height, width]` of each image.
    pub fn image_shape(&self) -> [usize; 3] {
        let s = self.images.shape();
        [s[1], s[2], s[3]]
    }

    pub(crate) fn image_size(&self) -> usize {
        self.image_shape().iter().product()
    }

    /// The pixels of image `index`, flat in CHW order.
    pub(crate) fn pixels(&self, index: usize) -> &[f32] {
        let size = self.image_size();
        &self.images.data()[index * size..(index + 1) * size]
    }

    /// Image `index` as a `[C, H, W]` tensor with its label.
    pub fn get(&self, index: usize) -> Result<(Tensor, usize), DataError> {
        if index >= self.len() {
            return Err(DataError::Invalid(format!(
                "index {index} out of range for {} samples",
                self.len()
            )));
        }
        let image = Tensor::new(self.pixels(index).to_vec(), self.image_shape().to_vec())?;
        Ok((image, self.labels[index]))
    }

    pub fn subset(&self, indices: &[usize]) -> Result<Dataset, DataError> {
        let images = self.images.index_select(indices)?;
        let labels = indices.iter().map(|&i| self.labels[i]).collect();
        Ok(Dataset {
            images,
            labels,
            classes: self.classes.clone(),
        })
    }

    /// The first `n` samples, or all of them when there are fewer.
    pub fn take(&self, n: usize) -> Result<Dataset, DataError> {
        let indices: Vec<usize> = (0..n.min(self.len())).collect();
        self.subset(&indices)
    }

    /// Per-channel mean and standard deviation over every pixel.
    pub fn channel_stats(&self) -> (Vec<f32>, Vec<f32>) {
        let [channels, h, w] = self.image_shape();
        let plane = h * w;
        let count = (self.len() * plane).max(1) as f64;
        let mut sums = vec![0.0f64; channels];
        let mut squares = vec![0.0f64; channels];
        for (i, chunk) in self.images.data().chunks(plane.max(1)).enumerate() {
            let c = i % channels.max(1);
            for &x in chunk {
                sums[c] += x as f64;
                squares[c] += (x as f64) * (x as f64);
            }
        }
        let mean: Vec<f32> = sums.iter().map(|s| (s / count) as f32).collect();
        let std = squares
            .iter()
            .zip(&sums)
            .map(|(sq, s)| {
                let m = s / count;
                ((sq / count - m * m).max(0.0)).sqrt() as f32
            })
            .collect();
        (mean, std)
    }

    /// `x = (x - mean[c]) / std[c]` for every pixel of channel `c`.
    pub fn normalize(&mut self, mean: &[f32], std: &[f32]) -> Result<(), DataError> {
        let [channels, h, w] = self.image_shape();
        if mean.len() != channels || std.len() != channels {
            return Err(DataError::Invalid(format!(
                "normalization needs {channels} means and stds, got {} and {}",
                mean.len(),
                std.len()
            )));
        }
        if std.iter().any(|&s| s <= 0.0) {
            return Err(DataError::Invalid(format!("standard deviations must be positive, got {std:?}")));
        }
        let plane = (h * w).max(1);
        for (i, chunk) in self.images.data_mut().chunks_mut(plane).enumerate() {
            let c = i % channels;
            for x in chunk {
                *x = (*x - mean[c]) / std[c];
            }
        }
        Ok(())
    }

    /// Seeded random partition, one dataset per fraction.
    pub fn split(&self, fractions: &[f64], seed: u64) -> Result<Vec<Dataset>, DataError> {
        split_indices(self.len(), fractions, seed)?
            .iter()
            .map(|part| self.subset(part))
            .collect()
    }

    /// Holds out `dev_fraction` of the samples for validation.
    pub fn train_dev_split(&self, dev_fraction: f64, seed: u64) -> Result<(Dataset, Dataset), DataError> {
        let mut parts = self.split(&[1.0 - dev_fraction, dev_fraction], seed)?.into_iter();
        match (parts.next(), parts.next()) {
            (Some(train), Some(dev)) => Ok((train, dev)),
            _ => Err(DataError::Invalid("split produced fewer than two parts".to_string())),
        }
    }

    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.num_classes()];
        for &label in &self.labels {
            counts[label] += 1;
        }
        counts
    }
}

/// The datasets the training pipeline knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    #[default]
    Mnist,
    Cifar10,
}

pub const MNIST_MEAN: [f32; 1] = [0.1307];
pub const MNIST_STD: [f32; 1] = [0.3081];
pub const CIFAR10_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
pub const CIFAR10_STD: [f32; 3] = [0.2470, 0.2435, 0.2616];

impl DatasetKind {
    pub fn load(self, dir: &Path, split: Split, limit: Option<usize>) -> Result<Dataset, DataError> {
        match self {
            DatasetKind::Mnist => load_mnist(dir, split, limit),
            DatasetKind::Cifar10 => load_cifar10(dir, split, limit),
        }
    }

    /// The usual per-channel mean and std of the training images.
    pub fn normalization(self) -> (&'static [f32], &'static [f32]) {
        match self {
            DatasetKind::Mnist => (&MNIST_MEAN, &MNIST_STD),
            DatasetKind::Cifar10 => (&CIFAR10_MEAN, &CIFAR10_STD),
        }
    }

    pub fn image_shape(self) -> [usize; 3] {
        match self {
            DatasetKind::Mnist => [1, 28, 28],
            DatasetKind::Cifar10 => [3, 32, 32],
        }
    }

    /// The known dataset whose images have `channels` channels.
    pub fn for_channels(channels: usize) -> Option<DatasetKind> {
        [DatasetKind::Mnist, DatasetKind::Cifar10]
            .into_iter()
            .find(|kind| kind.image_shape()[0] == channels)
    }

    pub fn download_hint(self) -> &'static str {
        match self {
            DatasetKind::Mnist => {
                "download the four IDX files (optionally gzipped) from \
                 https://ossci-datasets.s3.amazonaws.com/mnist/ into the data directory"
            }
            DatasetKind::Cifar10 => {
                "download and extract the binary version from \
                 https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz into the data directory"
            }
        }
    }
}

impl std::str::FromStr for DatasetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mnist" => Ok(DatasetKind::Mnist),
            "cifar10" | "cifar-10" | "cifar" => Ok(DatasetKind::Cifar10),
            other => Err(format!("unknown dataset '{other}'; expected 'mnist' or 'cifar10'")),
        }
    }
}

impl std::fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DatasetKind::Mnist => "mnist",
            DatasetKind::Cifar10 => "cifar10",
        })
    }
}

/// First of `names` that exists in `dir`.
pub(crate) fn find_file(dir: &Path, names: &[String], hint: &str) -> Result<PathBuf, DataError> {
    names
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| DataError::Missing {
            path: dir.join(names.first().map(String::as_str).unwrap_or_default()),
            hint: hint.to_string(),
        })
}

/// Opens `path`, decompressing on the fly when it ends in `.gz`.
pub(crate) fn open_reader(path: &Path) -> Result<Box<dyn Read>, DataError> {
    let file = File::open(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// `read_exact` that reports a short file as a format error.
pub(crate) fn read_exact(reader: &mut dyn Read, buf: &mut [u8], path: &Path, what: &str) -> Result<(), DataError> {
    reader.read_exact(buf).map_err(|source| {
        if source.kind() == std::io::ErrorKind::UnexpectedEof {
            DataError::Format {
                path: path.to_path_buf(),
                detail: format!("file ends inside the {what}"),
            }
        } else {
            DataError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy(n: usize, channels: usize) -> Dataset {
        let size = n * channels * 2 * 2;
        let images = Tensor::new((0..size).map(|x| x as f32).collect(), vec![n, channels, 2, 2]).unwrap();
        let labels = (0..n).map(|i| i % 3).collect();
        Dataset::new(images, labels, vec!["a".into(), "b".into(), "c".into()]).unwrap()
    }

    #[test]
    fn rejects_mismatched_labels() {
        let images = Tensor::zeros(vec![2, 1, 2, 2]);
        assert!(Dataset::new(images.clone(), vec![0], vec!["x".into()]).is_err());
        assert!(Dataset::new(images, vec![0, 1], vec!["x".into()]).is_err());
    }

    #[test]
    fn get_and_subset() {
        let ds = toy(4, 1);
        let (image, label) = ds.get(2).unwrap();
        assert_eq!(image.shape(), &[1, 2, 2]);
        assert_eq!(image.data(), &[8.0, 9.0, 10.0, 11.0]);
        assert_eq!(label, 2);
        assert!(ds.get(4).is_err());

        let sub = ds.subset(&[3, 0]).unwrap();
        assert_eq!(sub.labels(), &[0, 0]);
        assert_eq!(sub.pixels(0), ds.pixels(3));
        assert_eq!(ds.take(10).unwrap().len(), 4);
    }

    #[test]
    fn normalize_makes_channels_standard() {
        let mut ds = toy(6, 3);
        let (mean, std) = ds.channel_stats();
        ds.normalize(&mean, &std).unwrap();
        let (mean, std) = ds.channel_stats();
        for c in 0..3 {
            assert!(mean[c].abs() < 1e-4);
            assert!((std[c] - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn normalize_checks_channel_count() {
        let mut ds = toy(2, 3);
        assert!(ds.normalize(&MNIST_MEAN, &MNIST_STD).is_err());
        assert!(ds.normalize(&[0.0; 3], &[1.0, 0.0, 1.0]).is_err());
    }

    #[test]
    fn train_dev_split_partitions() {
        let ds = toy(20, 1);
        let (train, dev) = ds.train_dev_split(0.25, 1).unwrap();
        assert_eq!((train.len(), dev.len()), (15, 5));
        assert_eq!(ds.class_counts().iter().sum::<usize>(), 20);
    }

    #[test]
    fn dataset_kind_parses() {
        assert_eq!("CIFAR-10".parse::<DatasetKind>().unwrap(), DatasetKind::Cifar10);
        assert_eq!(DatasetKind::Mnist.image_shape(), [1, 28, 28]);
        assert!("imagenet".parse::<DatasetKind>().is_err());
        assert_eq!(DatasetKind::for_channels(3), Some(DatasetKind::Cifar10));
        assert_eq!(DatasetKind::for_channels(1), Some(DatasetKind::Mnist));
        assert_eq!(DatasetKind::for_channels(2), None);
    }
}
