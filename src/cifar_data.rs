//! Reader for the binary version of CIFAR-10.
//!
//! Each batch file is a sequence of 3073-byte records: one label byte and
//! a 32x32 image stored as three 1024-byte planes (red, green, blue).

use std::fs;
use std::path::{Path, PathBuf};

use crate::dataset::{Dataset, DatasetKind, Split};
use crate::error::DataError;
use crate::tensor::Tensor;

pub const IMAGE_SIDE: usize = 32;
pub const IMAGE_BYTES: usize = 3 * IMAGE_SIDE * IMAGE_SIDE;
pub const RECORD_BYTES: usize = 1 + IMAGE_BYTES;
pub const TRAIN_BATCHES: usize = 5;

pub const CLASS_NAMES: [&str; 10] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

/// The archive extracts into this directory; both it and `dir` are searched.
const ARCHIVE_DIR: &str = "cifar-10-batches-bin";

fn resolve_dir(dir: &Path) -> PathBuf {
    let nested = dir.join(ARCHIVE_DIR);
    if nested.is_dir() {
        nested
    } else {
        dir.to_path_buf()
    }
}

/// Appends the records of one batch file, stopping once `limit` images
/// have been collected in total.
fn read_batch(
    path: &Path,
    pixels: &mut Vec<f32>,
    labels: &mut Vec<usize>,
    limit: usize,
) -> Result<(), DataError> {
    let bytes = fs::read(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.len() % RECORD_BYTES != 0 {
        return Err(DataError::Format {
            path: path.to_path_buf(),
            detail: format!(
                "{} bytes is not a whole number of {RECORD_BYTES}-byte records",
                bytes.len()
            ),
        });
    }
    for record in bytes.chunks_exact(RECORD_BYTES) {
        if labels.len() >= limit {
            break;
        }
        let label = record[0] as usize;
        if label >= CLASS_NAMES.len() {
            return Err(DataError::Format {
                path: path.to_path_buf(),
                detail: format!("label {label} is not in 0..10"),
            });
        }
        labels.push(label);
        pixels.extend(record[1..].iter().map(|&p| p as f32 / 255.0));
    }
    Ok(())
}

/// Class names from `batches.meta.txt` when present, else the standard ones.
fn class_names(dir: &Path) -> Vec<String> {
    let defaults = || CLASS_NAMES.iter().map(|s| s.to_string()).collect();
    let Ok(text) = fs::read_to_string(dir.join("batches.meta.txt")) else {
        return defaults();
    };
    let names: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if names.len() == CLASS_NAMES.len() {
        names
    } else {
        tracing::warn!(found = names.len(), "ignoring batches.meta.txt with the wrong number of classes");
        defaults()
    }
}

/// Loads one CIFAR-10 split from `dir` as `[N, 3, 32, 32]` images in `[0, 1]`.
///
/// The training split reads `data_batch_1.bin` through `data_batch_5.bin`;
/// missing later batches are skipped with a warning, a missing first
/// batch is an error.
pub fn load_cifar10(dir: &Path, split: Split, limit: Option<usize>) -> Result<Dataset, DataError> {
    let dir = resolve_dir(dir);
    let files: Vec<PathBuf> = match split {
        Split::Train => (1..=TRAIN_BATCHES)
            .map(|i| dir.join(format!("data_batch_{i}.bin")))
            .collect(),
        Split::Test => vec![dir.join("test_batch.bin")],
    };
    if !files[0].is_file() {
        return Err(DataError::Missing {
            path: files[0].clone(),
            hint: DatasetKind::Cifar10.download_hint().to_string(),
        });
    }

    let limit = limit.unwrap_or(usize::MAX);
    let mut pixels = Vec::new();
    let mut labels = Vec::new();
    for path in &files {
        if labels.len() >= limit {
            break;
        }
        if !path.is_file() {
            tracing::warn!(path = %path.display(), "CIFAR-10 batch missing, skipping");
            continue;
        }
        tracing::info!(path = %path.display(), "loading CIFAR-10 batch");
        read_batch(path, &mut pixels, &mut labels, limit)?;
    }

    let images = Tensor::new(pixels, vec![labels.len(), 3, IMAGE_SIDE, IMAGE_SIDE])?;
    Dataset::new(images, labels, class_names(&dir))
}
