use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64;

use crate::dataset::Dataset;
use crate::error::DataError;
use crate::tensor::Tensor;

/// A mini-batch: `[B, C, H, W]` images and their `B` labels.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Cuts a dataset into mini-batches, optionally in a fresh random order
/// every epoch.
pub struct DataLoader<'a> {
    dataset: &'a Dataset,
    batch_size: usize,
    drop_last: bool,
    rng: Option<Pcg64>,
}

impl<'a> DataLoader<'a> {
    pub fn new(dataset: &'a Dataset, batch_size: usize) -> Result<Self, DataError> {
        if batch_size == 0 {
            return Err(DataError::Invalid("batch size must be at least 1".to_string()));
        }
        Ok(DataLoader {
            dataset,
            batch_size,
            drop_last: false,
            rng: None,
        })
    }

    /// Reshuffles before every epoch, starting from `seed`.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.rng = Some(Pcg64::seed_from_u64(seed));
        self
    }

    /// Skips the final batch when it would be short.
    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &Dataset {
        self.dataset
    }

    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    /// Number of samples one epoch visits.
    pub fn num_samples(&self) -> usize {
        if self.drop_last {
            self.num_batches() * self.batch_size
        } else {
            self.dataset.len()
        }
    }

    /// Starts an epoch. Each call draws a new order when shuffling.
    pub fn iter(&mut self) -> Batches<'a> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(rng) = self.rng.as_mut() {
            order.shuffle(rng);
        }
        order.truncate(self.num_samples());
        Batches {
            dataset: self.dataset,
            order,
            batch_size: self.batch_size,
            position: 0,
        }
    }
}

pub struct Batches<'a> {
    dataset: &'a Dataset,
    order: Vec<usize>,
    batch_size: usize,
    position: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let chosen = &self.order[self.position..end];
        self.position = end;

        let image_size = self.dataset.image_size();
        let mut data = Vec::with_capacity(chosen.len() * image_size);
        let mut labels = Vec::with_capacity(chosen.len());
        for &i in chosen {
            data.extend_from_slice(self.dataset.pixels(i));
            labels.push(self.dataset.labels()[i]);
        }
        let [c, h, w] = self.dataset.image_shape();
        Some(Batch {
            images: Tensor::from_raw(data, vec![chosen.len(), c, h, w]),
            labels,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.position).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches<'_> {}
