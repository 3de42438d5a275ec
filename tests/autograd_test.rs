use image_classifiers::autograd::is_grad_enabled;
use image_classifiers::tensor::Conv2dSpec;
use image_classifiers::{no_grad, ExecutionMode, Tensor, TensorError, Var};

const EPS: f32 = 1e-2;

fn t(data: Vec<f32>, shape: &[usize]) -> Tensor {
    Tensor::new(data, shape.to_vec()).unwrap()
}

/// Random tensor in `[-1, 1)`.
fn signed_random(shape: &[usize], seed: u64) -> Tensor {
    Tensor::random(shape.to_vec(), seed).scale(2.0).add_scalar(-1.0)
}

/// Reduces `y` to a scalar with fixed random weights so every output
/// element gets a different upstream gradient.
fn weighted_sum(y: &Var, seed: u64) -> Var {
    let w = Var::new(signed_random(&y.shape(), seed));
    y.mul(&w).unwrap().sum()
}

/// Compares the gradient from `backward` with central differences.
fn check_gradient(x0: &Tensor, f: impl Fn(&Var) -> Var) {
    let x = Var::parameter(x0.clone());
    f(&x).backward().unwrap();
    let analytic = x.grad().expect("gradient should reach the input");
    assert_eq!(analytic.shape(), x0.shape());

    for i in 0..x0.size() {
        let mut plus = x0.clone();
        plus.data_mut()[i] += EPS;
        let mut minus = x0.clone();
        minus.data_mut()[i] -= EPS;
        let fp = f(&Var::new(plus)).value().item().unwrap();
        let fm = f(&Var::new(minus)).value().item().unwrap();
        let numeric = (fp - fm) / (2.0 * EPS);
        let a = analytic.data()[i];
        let tolerance = 1e-2 * numeric.abs().max(a.abs()).max(1.0);
        assert!(
            (numeric - a).abs() <= tolerance,
            "element {i}: analytic {a} vs numeric {numeric}"
        );
    }
}

/// Distinct values 0.1 apart in a shuffled order, so no max or ReLU kink
/// sits within `EPS` of an input.
fn well_separated(shape: &[usize], seed: u64) -> Tensor {
    let n: usize = shape.iter().product();
    let keys = Tensor::random(vec![n], seed);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| keys.data()[a].total_cmp(&keys.data()[b]));
    let data = order
        .iter()
        .map(|&rank| (rank as f32 - n as f32 / 2.0) * 0.1 + 0.05)
        .collect();
    t(data, shape)
}

#[test]
fn test_broadcast_arithmetic_gradients() {
    let a0 = signed_random(&[2, 3], 1);
    let b0 = signed_random(&[3], 2).add_scalar(3.0);

    let b = Var::new(b0.clone());
    check_gradient(&a0, |a| weighted_sum(&a.add(&b).unwrap(), 10));
    check_gradient(&a0, |a| weighted_sum(&a.sub(&b).unwrap(), 11));
    check_gradient(&a0, |a| weighted_sum(&a.mul(&b).unwrap(), 12));
    check_gradient(&a0, |a| weighted_sum(&a.div(&b).unwrap(), 13));

    let a = Var::new(a0.clone());
    check_gradient(&b0, |b| weighted_sum(&a.add(b).unwrap(), 14));
    check_gradient(&b0, |b| weighted_sum(&a.sub(b).unwrap(), 15));
    check_gradient(&b0, |b| weighted_sum(&a.mul(b).unwrap(), 16));
    check_gradient(&b0, |b| weighted_sum(&a.div(b).unwrap(), 17));
}

#[test]
fn test_matmul_gradients() {
    let a0 = signed_random(&[3, 4], 3);
    let b0 = signed_random(&[4, 2], 4);

    let b = Var::new(b0.clone());
    check_gradient(&a0, |a| weighted_sum(&a.matmul(&b).unwrap(), 20));
    let a = Var::new(a0.clone());
    check_gradient(&b0, |b| {
        weighted_sum(&a.matmul_with(b, ExecutionMode::Sequential).unwrap(), 21)
    });
}

#[test]
fn test_var_matmul_matches_tensor_matmul() {
    let a0 = signed_random(&[2, 3], 22);
    let b0 = signed_random(&[3, 2], 23);
    let product = Var::new(a0.clone()).matmul(&Var::new(b0.clone())).unwrap();
    assert!(product.value().allclose(&a0.matmul(&b0).unwrap(), 1e-6));
    assert_eq!(a0.matmul_mode(&b0), ExecutionMode::Sequential);
}

#[test]
fn test_unary_gradients() {
    let x0 = signed_random(&[2, 3], 5);
    check_gradient(&x0, |x| weighted_sum(&x.exp(), 30));
    check_gradient(&x0, |x| weighted_sum(&x.sigmoid(), 31));
    check_gradient(&x0, |x| weighted_sum(&x.tanh(), 32));
    check_gradient(&x0, |x| weighted_sum(&x.scale(-2.5).add_scalar(1.0), 33));
    check_gradient(&x0, |x| weighted_sum(&x.neg(), 34));
    check_gradient(&x0, |x| x.mean());

    let positive = Tensor::random(vec![2, 3], 6).add_scalar(0.5);
    check_gradient(&positive, |x| weighted_sum(&x.ln(), 35));
    check_gradient(&positive, |x| weighted_sum(&x.powf(3.0), 36));
    check_gradient(&positive, |x| weighted_sum(&x.powf(0.5), 37));

    check_gradient(&well_separated(&[2, 4], 7), |x| weighted_sum(&x.relu(), 38));
}

#[test]
fn test_shape_op_gradients() {
    let x0 = signed_random(&[2, 3, 2], 8);
    check_gradient(&x0, |x| weighted_sum(&x.reshape(vec![3, 4]).unwrap(), 40));
    check_gradient(&x0, |x| weighted_sum(&x.flatten(1).unwrap(), 41));
}

#[test]
fn test_log_softmax_and_class_selection_gradients() {
    let x0 = signed_random(&[3, 5], 9).scale(3.0);
    check_gradient(&x0, |x| weighted_sum(&x.log_softmax(1).unwrap(), 50));
    check_gradient(&x0, |x| {
        x.log_softmax(1)
            .unwrap()
            .select_classes(&[4, 0, 2])
            .unwrap()
            .mean()
            .neg()
    });
}

#[test]
fn test_conv2d_gradients() {
    let spec = Conv2dSpec {
        stride: 2,
        padding: 1,
        mode: ExecutionMode::Sequential,
    };
    let x0 = signed_random(&[2, 2, 5, 5], 60);
    let w0 = signed_random(&[3, 2, 3, 3], 61);
    let b0 = signed_random(&[3], 62);

    let (w, b) = (Var::new(w0.clone()), Var::new(b0.clone()));
    check_gradient(&x0, |x| weighted_sum(&x.conv2d(&w, Some(&b), spec).unwrap(), 63));

    let x = Var::new(x0.clone());
    check_gradient(&w0, |w| weighted_sum(&x.conv2d(w, Some(&b), spec).unwrap(), 64));
    check_gradient(&b0, |b| weighted_sum(&x.conv2d(&w, Some(b), spec).unwrap(), 65));
}

#[test]
fn test_conv2d_parallel_matches_sequential() {
    let x = Tensor::random(vec![3, 2, 6, 6], 1);
    let w = Tensor::random(vec![4, 2, 3, 3], 2);
    let seq = Conv2dSpec {
        stride: 1,
        padding: 1,
        mode: ExecutionMode::Sequential,
    };
    let par = Conv2dSpec {
        mode: ExecutionMode::Parallel,
        ..seq
    };
    let a = x.conv2d(&w, None, seq).unwrap();
    let b = x.conv2d(&w, None, par).unwrap();
    assert_eq!(a.shape(), &[3, 4, 6, 6]);
    assert!(a.allclose(&b, 1e-5));
}

#[test]
fn test_conv2d_known_value() {
    // 3x3 ones input, 2x2 ones kernel: every output sums four ones.
    let x = Tensor::ones(vec![1, 1, 3, 3]);
    let w = Tensor::ones(vec![1, 1, 2, 2]);
    let b = Tensor::full(vec![1], 0.5);
    let y = x.conv2d(&w, Some(&b), Conv2dSpec::default()).unwrap();
    assert_eq!(y.shape(), &[1, 1, 2, 2]);
    assert_eq!(y.data(), &[4.5, 4.5, 4.5, 4.5]);
}

#[test]
fn test_conv2d_backward_keeps_nan_behind_zero_gradients() {
    let mut x = Tensor::ones(vec![1, 1, 3, 3]);
    x.data_mut()[4] = f32::NAN;
    let w = Tensor::ones(vec![1, 1, 2, 2]);
    let grads = x
        .conv2d_backward(&w, &Tensor::zeros(vec![1, 1, 2, 2]), Conv2dSpec::default(), true, true)
        .unwrap();
    assert!(grads.weight.unwrap().data().iter().all(|v| v.is_nan()));

    let mut w = Tensor::ones(vec![1, 1, 2, 2]);
    w.data_mut()[0] = f32::NAN;
    let grads = Tensor::ones(vec![1, 1, 3, 3])
        .conv2d_backward(&w, &Tensor::zeros(vec![1, 1, 2, 2]), Conv2dSpec::default(), true, false)
        .unwrap();
    assert!(grads.input.unwrap().data().iter().any(|v| v.is_nan()));
}

#[test]
fn test_max_pool_gradients() {
    let x0 = well_separated(&[2, 2, 4, 4], 70);
    check_gradient(&x0, |x| weighted_sum(&x.max_pool2d(2, 2).unwrap(), 71));
}

#[test]
fn test_max_pool_picks_window_maximum() {
    let x = t((0..16).map(|v| v as f32).collect(), &[1, 1, 4, 4]);
    let (y, indices) = x.max_pool2d(2, 2).unwrap();
    assert_eq!(y.data(), &[5.0, 7.0, 13.0, 15.0]);
    assert_eq!(indices, vec![5, 7, 13, 15]);
}

#[test]
fn test_reused_variable_sums_contributions() {
    // y = sum(x * x + x) => dy/dx = 2x + 1
    let x = Var::parameter(t(vec![1.0, -2.0, 3.0], &[3]));
    let y = x.mul(&x).unwrap().add(&x).unwrap().sum();
    y.backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[3.0, -3.0, 7.0]);
}

#[test]
fn test_gradients_accumulate_until_zeroed() {
    let x = Var::parameter(t(vec![2.0, 4.0], &[2]));
    let loss = || x.powf(2.0).sum();

    loss().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[4.0, 8.0]);
    loss().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[8.0, 16.0]);

    x.zero_grad();
    assert!(x.grad().is_none());
    loss().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), &[4.0, 8.0]);
}

#[test]
fn test_intermediate_nodes_keep_no_gradient() {
    let x = Var::parameter(t(vec![1.0, 2.0], &[2]));
    let h = x.scale(3.0);
    h.sum().backward().unwrap();
    assert!(h.grad().is_none());
    assert!(!h.is_leaf() && x.is_leaf());
    assert_eq!(x.grad().unwrap().data(), &[3.0, 3.0]);
}

#[test]
fn test_constants_receive_no_gradient() {
    let x = Var::parameter(t(vec![1.0], &[1]));
    let c = Var::new(t(vec![5.0], &[1]));
    x.mul(&c).unwrap().sum().backward().unwrap();
    assert!(c.grad().is_none());
    assert_eq!(x.grad().unwrap().data(), &[5.0]);

    let d = x.detach();
    assert!(!d.requires_grad());
}

#[test]
fn test_no_grad_records_nothing() {
    let x = Var::parameter(t(vec![1.0, 2.0], &[2]));
    let y = no_grad(|| {
        assert!(!is_grad_enabled());
        x.scale(2.0).sum()
    });
    assert!(is_grad_enabled());
    assert!(!y.requires_grad());
    assert_eq!(y.value().item().unwrap(), 6.0);
    // Nothing to propagate, so this is a no-op.
    y.backward().unwrap();
    assert!(x.grad().is_none());
}

#[test]
fn test_backward_needs_single_element() {
    let x = Var::parameter(Tensor::ones(vec![2, 2]));
    let y = x.scale(2.0);
    assert_eq!(y.backward(), Err(TensorError::NotScalar(vec![2, 2])));
}

#[test]
fn test_shape_errors_propagate() {
    let a = Var::parameter(Tensor::ones(vec![2, 3]));
    let b = Var::parameter(Tensor::ones(vec![2, 3]));
    assert!(a.matmul(&b).is_err());
    assert!(a.add(&Var::new(Tensor::ones(vec![4]))).is_err());
    assert!(a.select_classes(&[0, 3]).is_err());
    assert!(a.set_value(Tensor::ones(vec![3, 2])).is_err());
}
