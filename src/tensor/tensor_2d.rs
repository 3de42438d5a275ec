use crate::error::TensorError;
use crate::tensor::Tensor;

impl Tensor {
    pub fn new_2d(data: Vec<f32>, rows: usize, cols: usize) -> Result<Tensor, TensorError> {
        Self::new(data, vec![rows, cols])
    }

    pub fn random_2d(rows: usize, cols: usize, seed: u64) -> Self {
        Self::random(vec![rows, cols], seed)
    }

    pub fn ones_2d(rows: usize, cols: usize) -> Tensor {
        Self::ones(vec![rows, cols])
    }

    pub fn zeros_2d(rows: usize, cols: usize) -> Tensor {
        Self::zeros(vec![rows, cols])
    }

    pub fn eye(n: usize) -> Tensor {
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Tensor::from_raw(data, vec![n, n])
    }

    /// Builds a matrix from nested rows, which must all have the same length.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Tensor, TensorError> {
        let cols = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().find(|r| r.len() != cols) {
            return Err(TensorError::ShapeMismatch {
                op: "from_rows",
                lhs: vec![cols],
                rhs: vec![bad.len()],
            });
        }
        Ok(Tensor::from_raw(rows.concat(), vec![rows.len(), cols]))
    }
}
