//! Reader for the MNIST handwritten-digit files in IDX format.
//!
//! An IDX file starts with a big-endian `u32` magic number (2051 for
//! images, 2049 for labels) and the item count; image files add the row
//! and column counts before the raw `u8` pixels. Files may be gzipped.

use std::io::Read;
use std::path::Path;

use crate::dataset::{find_file, open_reader, read_exact, Dataset, DatasetKind, Split};
use crate::error::DataError;
use crate::tensor::Tensor;

pub const IMAGES_MAGIC: u32 = 2051;
pub const LABELS_MAGIC: u32 = 2049;

/// Raw pixels of an IDX image file.
#[derive(Debug)]
pub struct IdxImages {
    pub count: usize,
    pub rows: usize,
    pub cols: usize,
    pub pixels: Vec<u8>,
}

fn read_u32(reader: &mut dyn Read, path: &Path, what: &str) -> Result<u32, DataError> {
    let mut bytes = [0u8; 4];
    read_exact(reader, &mut bytes, path, what)?;
    Ok(u32::from_be_bytes(bytes))
}

fn check_magic(reader: &mut dyn Read, path: &Path, expected: u32) -> Result<(), DataError> {
    let magic = read_u32(reader, path, "magic number")?;
    if magic != expected {
        return Err(DataError::Format {
            path: path.to_path_buf(),
            detail: format!("magic number {magic}, expected {expected}"),
        });
    }
    Ok(())
}

/// Reads up to `limit` images from an IDX image file.
pub fn read_idx_images(path: &Path, limit: Option<usize>) -> Result<IdxImages, DataError> {
    let mut reader = open_reader(path)?;
    check_magic(&mut *reader, path, IMAGES_MAGIC)?;
    let total = read_u32(&mut *reader, path, "header")? as usize;
    let rows = read_u32(&mut *reader, path, "header")? as usize;
    let cols = read_u32(&mut *reader, path, "header")? as usize;

    if rows == 0 || cols == 0 {
        return Err(DataError::Format {
            path: path.to_path_buf(),
            detail: format!("image size {rows}x{cols} has no pixels"),
        });
    }

    let count = limit.map_or(total, |l| l.min(total));
    let len = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .ok_or_else(|| DataError::Format {
            path: path.to_path_buf(),
            detail: format!("{count} images of {rows}x{cols} pixels overflow the address space"),
        })?;
    let pixels = read_to_len(&mut *reader, len, path, "pixel data")?;
    tracing::debug!(path = %path.display(), count, rows, cols, "read IDX images");
    Ok(IdxImages {
        count,
        rows,
        cols,
        pixels,
    })
}

/// Reads up to `limit` labels from an IDX label file.
pub fn read_idx_labels(path: &Path, limit: Option<usize>) -> Result<Vec<u8>, DataError> {
    let mut reader = open_reader(path)?;
    check_magic(&mut *reader, path, LABELS_MAGIC)?;
    let total = read_u32(&mut *reader, path, "header")? as usize;

    let count = limit.map_or(total, |l| l.min(total));
    read_to_len(&mut *reader, count, path, "labels")
}

/// Reads exactly `len` bytes, growing the buffer only as data arrives so a
/// header that overstates the payload cannot force a huge allocation.
fn read_to_len(reader: &mut dyn Read, len: usize, path: &Path, what: &str) -> Result<Vec<u8>, DataError> {
    let mut buf = Vec::new();
    reader
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if buf.len() < len {
        return Err(DataError::Format {
            path: path.to_path_buf(),
            detail: format!("file ends inside the {what}: {} of {len} bytes", buf.len()),
        });
    }
    Ok(buf)
}

/// Accepted spellings of a file, with and without the `.gz` suffix.
fn candidates(prefix: &str, kind: &str, dims: u8) -> Vec<String> {
    let plain = [
        format!("{prefix}-{kind}-idx{dims}-ubyte"),
        format!("{prefix}-{kind}.idx{dims}-ubyte"),
    ];
    plain
        .iter()
        .flat_map(|name| [name.clone(), format!("{name}.gz")])
        .collect()
}

/// Loads one MNIST split from `dir` as `[N, 1, 28, 28]` images in `[0, 1]`.
pub fn load_mnist(dir: &Path, split: Split, limit: Option<usize>) -> Result<Dataset, DataError> {
    let prefix = match split {
        Split::Train => "train",
        Split::Test => "t10k",
    };
    let hint = DatasetKind::Mnist.download_hint();
    let images_path = find_file(dir, &candidates(prefix, "images", 3), hint)?;
    let labels_path = find_file(dir, &candidates(prefix, "labels", 1), hint)?;
    tracing::info!(images = %images_path.display(), labels = %labels_path.display(), "loading MNIST {split:?}");

    let images = read_idx_images(&images_path, limit)?;
    let labels = read_idx_labels(&labels_path, limit)?;
    if images.count != labels.len() {
        return Err(DataError::Format {
            path: labels_path,
            detail: format!("{} labels for {} images", labels.len(), images.count),
        });
    }
    if let Some(limit) = limit.filter(|&l| l > images.count) {
        tracing::warn!(limit, available = images.count, "MNIST split is smaller than the requested limit");
    }
    if let Some(&bad) = labels.iter().find(|&&l| l > 9) {
        return Err(DataError::Format {
            path: labels_path,
            detail: format!("digit label {bad} is not in 0..=9"),
        });
    }

    let data = images.pixels.iter().map(|&p| p as f32 / 255.0).collect();
    let tensor = Tensor::new(data, vec![images.count, 1, images.rows, images.cols])?;
    let classes = (0..10).map(|d| d.to_string()).collect();
    Dataset::new(tensor, labels.into_iter().map(usize::from).collect(), classes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_names_cover_both_spellings() {
        let names = candidates("t10k", "labels", 1);
        assert!(names.contains(&"t10k-labels-idx1-ubyte".to_string()));
        assert!(names.contains(&"t10k-labels.idx1-ubyte.gz".to_string()));
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn missing_directory_reports_hint() {
        let err = load_mnist(Path::new("/definitely/not/here"), Split::Train, None).unwrap_err();
        match err {
            DataError::Missing { hint, .. } => assert!(hint.contains("IDX")),
            other => panic!("unexpected error {other}"),
        }
    }
}
