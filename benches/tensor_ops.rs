//! Benchmarks for the tensor kernels, sequential against parallel.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image_classifiers::tensor::Conv2dSpec;
use image_classifiers::{ExecutionMode, Tensor};

const MODES: [ExecutionMode; 2] = [ExecutionMode::Sequential, ExecutionMode::Parallel];

fn bench_matmul(c: &mut Criterion) {
    let mut group = c.benchmark_group("matmul");
    for size in [64, 256] {
        let a = Tensor::random_2d(size, size, 1);
        let b = Tensor::random_2d(size, size, 2);
        for mode in MODES {
            group.bench_with_input(BenchmarkId::new(format!("{mode:?}"), size), &size, |bench, _| {
                bench.iter(|| a.matmul_with(black_box(&b), mode))
            });
        }
    }
    group.finish();
}

fn bench_conv2d(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv2d");
    // One MNIST-sized batch through the first conv block
    let x = Tensor::random(vec![32, 1, 28, 28], 3);
    let w = Tensor::random(vec![16, 1, 3, 3], 4);
    for mode in MODES {
        let spec = Conv2dSpec {
            stride: 1,
            padding: 1,
            mode,
        };
        group.bench_function(format!("{mode:?}"), |bench| {
            bench.iter(|| x.conv2d(black_box(&w), None, spec))
        });
    }
    group.finish();
}

fn bench_softmax(c: &mut Criterion) {
    let logits = Tensor::random_2d(256, 10, 5);
    c.bench_function("log_softmax 256x10", |bench| bench.iter(|| black_box(&logits).log_softmax(1)));
}

criterion_group!(benches, bench_matmul, bench_conv2d, bench_softmax);
criterion_main!(benches);
