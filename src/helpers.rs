use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64;

use crate::error::DataError;

/// `0..n` in a seeded random order.
pub fn shuffled_indices(n: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = Pcg64::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    indices
}

/// Partitions a seeded shuffle of `0..n` into consecutive parts, one per
/// fraction. Part sizes are rounded; when the fractions add up to one the
/// last part takes whatever rounding left over, so every index lands in
/// exactly one part.
pub fn split_indices(n: usize, fractions: &[f64], seed: u64) -> Result<Vec<Vec<usize>>, DataError> {
    if fractions.is_empty() {
        return Err(DataError::Invalid("split needs at least one fraction".to_string()));
    }
    if let Some(f) = fractions.iter().find(|f| !(0.0..=1.0).contains(*f)) {
        return Err(DataError::Invalid(format!("split fraction {f} is outside [0, 1]")));
    }
    let total: f64 = fractions.iter().sum();
    if total > 1.0 + 1e-9 {
        return Err(DataError::Invalid(format!("split fractions add up to {total}, more than 1")));
    }
    let covers_all = (total - 1.0).abs() < 1e-9;

    let indices = shuffled_indices(n, seed);
    let mut parts = Vec::with_capacity(fractions.len());
    let mut start = 0;
    for (i, &fraction) in fractions.iter().enumerate() {
        let end = if covers_all && i + 1 == fractions.len() {
            n
        } else {
            (start + (fraction * n as f64).round() as usize).min(n)
        };
        parts.push(indices[start..end].to_vec());
        start = end;
    }
    Ok(parts)
}

/// Fraction of positions where `predictions` and `labels` agree.
pub fn accuracy(predictions: &[usize], labels: &[usize]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = predictions.iter().zip(labels).filter(|(p, l)| p == l).count();
    correct as f64 / labels.len() as f64
}

/// `matrix[true][predicted]` counts. Out-of-range entries are ignored.
pub fn confusion_matrix(predictions: &[usize], labels: &[usize], classes: usize) -> Vec<Vec<usize>> {
    let mut matrix = vec![vec![0; classes]; classes];
    for (&p, &l) in predictions.iter().zip(labels) {
        if p < classes && l < classes {
            matrix[l][p] += 1;
        }
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffle_is_a_seeded_permutation() {
        let a = shuffled_indices(50, 3);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        assert_eq!(a, shuffled_indices(50, 3));
        assert_ne!(a, shuffled_indices(50, 4));
    }

    #[test]
    fn full_split_covers_every_index_once() {
        let parts = split_indices(101, &[0.8, 0.1, 0.1], 7).unwrap();
        assert_eq!(parts[0].len(), 81);
        assert_eq!(parts[1].len(), 10);
        let mut all: Vec<usize> = parts.concat();
        all.sort_unstable();
        assert_eq!(all, (0..101).collect::<Vec<_>>());
    }

    #[test]
    fn partial_split_leaves_the_rest_out() {
        let parts = split_indices(10, &[0.3], 0).unwrap();
        assert_eq!(parts[0].len(), 3);
    }

    #[test]
    fn bad_fractions_are_rejected() {
        assert!(split_indices(10, &[0.7, 0.5], 0).is_err());
        assert!(split_indices(10, &[-0.1], 0).is_err());
        assert!(split_indices(10, &[], 0).is_err());
    }

    #[test]
    fn confusion_rows_are_true_classes() {
        let m = confusion_matrix(&[0, 1, 1, 2], &[0, 0, 1, 2], 3);
        assert_eq!(m[0], vec![1, 1, 0]);
        assert_eq!(m[1], vec![0, 1, 0]);
        assert_eq!(m[2], vec![0, 0, 1]);
        assert_eq!(accuracy(&[0, 1, 1, 2], &[0, 0, 1, 2]), 0.75);
    }
}
