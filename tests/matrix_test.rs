use image_classifiers::{ExecutionMode, Tensor};
use std::time::Instant;

const EPSILON: f32 = 1e-4;

// Helper function to compare tensors with floating point tolerance
fn tensors_equal(a: &Tensor, b: &Tensor, tolerance: f32) -> bool {
    a.allclose(b, tolerance)
}

// Helper function to create a tensor with known values for testing
fn create_test_tensor(data: Vec<f32>, rows: usize, cols: usize) -> Tensor {
    Tensor::new_2d(data, rows, cols).unwrap()
}

// Textbook triple loop used as the reference result
fn naive_matmul(a: &Tensor, b: &Tensor) -> Tensor {
    let (m, k) = a.dims();
    let n = b.cols();
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            for p in 0..k {
                out[i * n + j] += a.data()[i * k + p] * b.data()[p * n + j];
            }
        }
    }
    create_test_tensor(out, m, n)
}

#[test]
fn test_basic_matrix_multiplication() {
    let a = create_test_tensor(vec![1.0, 2.0, 3.0, 4.0], 2, 2);
    let b = create_test_tensor(vec![5.0, 6.0, 7.0, 8.0], 2, 2);

    // Expected result: [[19, 22], [43, 50]]
    let expected = create_test_tensor(vec![19.0, 22.0, 43.0, 50.0], 2, 2);

    let result_seq = a.matmul_with(&b, ExecutionMode::Sequential).unwrap();
    let result_par = a.matmul_with(&b, ExecutionMode::Parallel).unwrap();
    let result_auto = a.matmul(&b).unwrap();

    assert!(tensors_equal(&result_seq, &expected, EPSILON));
    assert!(tensors_equal(&result_par, &expected, EPSILON));
    assert!(tensors_equal(&result_auto, &expected, EPSILON));
}

#[test]
fn test_identity_matrix_multiplication() {
    let a = create_test_tensor(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
    let identity = Tensor::eye(3);

    let result_seq = a.matmul_with(&identity, ExecutionMode::Sequential).unwrap();
    let result_par = a.matmul_with(&identity, ExecutionMode::Parallel).unwrap();

    assert!(tensors_equal(&result_seq, &a, EPSILON));
    assert!(tensors_equal(&result_par, &a, EPSILON));
}

#[test]
fn test_rectangular_matrix_multiplication() {
    // [2x3] * [3x4] -> [2x4]
    let a = create_test_tensor(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
    let b = create_test_tensor((1..=12).map(|x| x as f32).collect(), 3, 4);

    let result = a.matmul(&b).unwrap();
    assert_eq!(result.shape(), &[2, 4]);
    assert!(tensors_equal(&result, &naive_matmul(&a, &b), EPSILON));
}

#[test]
fn test_vector_products() {
    let row = create_test_tensor(vec![1.0, 2.0, 3.0], 1, 3);
    let col = create_test_tensor(vec![4.0, 5.0, 6.0], 3, 1);

    let inner = row.matmul(&col).unwrap();
    assert_eq!(inner.shape(), &[1, 1]);
    assert_eq!(inner.item().unwrap(), 32.0);

    let outer = col.matmul(&row).unwrap();
    assert_eq!(outer.shape(), &[3, 3]);
    assert_eq!(outer.get(&[2, 1]).unwrap(), 12.0);
}

#[test]
fn test_zero_matrix_multiplication() {
    let a = Tensor::random_2d(4, 5, 1);
    let zeros = Tensor::zeros_2d(5, 3);
    let result = a.matmul(&zeros).unwrap();
    assert!(tensors_equal(&result, &Tensor::zeros_2d(4, 3), EPSILON));
}

#[test]
fn test_dimension_mismatch_is_an_error() {
    let a = Tensor::ones_2d(2, 3);
    let b = Tensor::ones_2d(2, 3);
    assert!(a.matmul(&b).is_err());
    assert!(Tensor::ones(vec![3]).matmul(&b).is_err());
}

#[test]
fn test_sequential_and_parallel_agree_on_large_matrices() {
    let a = Tensor::random_2d(128, 96, 7);
    let b = Tensor::random_2d(96, 64, 8);

    let start = Instant::now();
    let seq = a.matmul_with(&b, ExecutionMode::Sequential).unwrap();
    let seq_time = start.elapsed();

    let start = Instant::now();
    let par = a.matmul_with(&b, ExecutionMode::Parallel).unwrap();
    let par_time = start.elapsed();

    println!("sequential: {seq_time:?}, parallel: {par_time:?}");
    assert!(tensors_equal(&seq, &par, EPSILON));
    assert!(tensors_equal(&seq, &naive_matmul(&a, &b), 1e-3));
}

#[test]
fn test_matmul_associativity() {
    let a = Tensor::random_2d(3, 4, 1);
    let b = Tensor::random_2d(4, 5, 2);
    let c = Tensor::random_2d(5, 2, 3);

    let left = a.matmul(&b).unwrap().matmul(&c).unwrap();
    let right = a.matmul(&b.matmul(&c).unwrap()).unwrap();
    assert!(tensors_equal(&left, &right, EPSILON));
}

#[test]
fn test_transpose_of_product() {
    // (AB)^T = B^T A^T
    let a = Tensor::random_2d(3, 4, 11);
    let b = Tensor::random_2d(4, 2, 12);

    let left = a.matmul(&b).unwrap().transpose().unwrap();
    let right = b
        .transpose()
        .unwrap()
        .matmul(&a.transpose().unwrap())
        .unwrap();
    assert!(tensors_equal(&left, &right, EPSILON));
}

#[test]
fn test_nan_propagates_through_zero_entries() {
    // 0 * NaN is NaN, so a zero on the left must not hide it.
    let a = create_test_tensor(vec![0.0, 1.0], 1, 2);
    let b = create_test_tensor(vec![f32::NAN, 2.0], 2, 1);
    for mode in [ExecutionMode::Sequential, ExecutionMode::Parallel] {
        let result = a.matmul_with(&b, mode).unwrap();
        assert!(result.data()[0].is_nan(), "{mode:?}");
    }
}

#[test]
fn test_auto_mode_follows_problem_size() {
    let small = Tensor::ones_2d(2, 3);
    assert_eq!(small.matmul_mode(&Tensor::ones_2d(3, 1)), ExecutionMode::Sequential);
    let big = Tensor::ones_2d(64, 64);
    assert_eq!(big.matmul_mode(&big), ExecutionMode::Parallel);
}
