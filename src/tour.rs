//! A printed walkthrough of tensors and automatic differentiation, ending
//! with a line fitted by hand-written gradient descent.

use rand::SeedableRng;
use rand_pcg::Pcg64;

use crate::autograd::{no_grad, Var};
use crate::tensor::Tensor;
use crate::Result;

fn section(title: &str) {
    println!();
    println!("── {title} ──");
}

fn show(label: &str, t: &Tensor) {
    println!("{label}: shape {:?}", t.shape());
    t.print();
}

pub fn run() -> Result<()> {
    section("construction");
    let a = Tensor::new((1..=6).map(|x| x as f32).collect(), vec![2, 3])?;
    show("a", &a);
    show("zeros", &Tensor::zeros(vec![2, 2]));
    show("eye", &Tensor::eye(3));
    let mut rng = Pcg64::seed_from_u64(0);
    show("randn", &Tensor::randn(vec![2, 3], &mut rng));

    section("shapes and reshaping");
    println!("a has rank {} and {} elements", a.rank(), a.size());
    show("a reshaped to [3, 2]", &a.reshape(vec![3, 2])?);
    show("a transposed", &a.transpose()?);
    show("a flattened", &a.reshape(vec![6])?);

    section("indexing");
    println!("a[1, 2] = {}", a.get(&[1, 2])?);
    show("second row", &a.narrow(0, 1, 1)?);
    show("last two columns", &a.narrow(1, 1, 2)?);

    section("broadcasting");
    let row = Tensor::new(vec![10.0, 20.0, 30.0], vec![3])?;
    show("a + [10, 20, 30]", &a.add(&row)?);
    let column = Tensor::new(vec![1.0, -1.0], vec![2, 1])?;
    show("a * [[1], [-1]]", &a.mul(&column)?);

    section("matrix multiplication");
    let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2])?;
    show("a @ b", &a.matmul(&b)?);

    section("reductions");
    println!("sum {} mean {} max {} argmax {}", a.sum(), a.mean(), a.max(), a.argmax());
    show("column sums", &a.sum_dim(0, false)?);
    show("row means", &a.mean_dim(1, false)?);
    show("row softmax", &a.softmax(1)?);

    section("autograd on a scalar expression");
    // y = sum(x^2 + 3x), so dy/dx = 2x + 3.
    let x = Var::parameter(Tensor::new(vec![1.0, -2.0, 0.5], vec![3])?);
    let y = x.powf(2.0).add(&x.scale(3.0))?.sum();
    println!("y = {}", y.value().item()?);
    y.backward()?;
    if let Some(grad) = x.grad() {
        show("dy/dx", &grad);
    }

    section("gradients accumulate");
    let y = x.powf(2.0).add(&x.scale(3.0))?.sum();
    y.backward()?;
    if let Some(grad) = x.grad() {
        show("dy/dx after a second backward", &grad);
    }
    x.zero_grad();
    println!("after zero_grad the gradient is {:?}", x.grad().map(|g| g.data().to_vec()));

    section("fitting a line by gradient descent");
    // Noisy samples of y = 2x - 1.
    let xs = Tensor::new((0..20).map(|i| i as f32 / 10.0).collect(), vec![20, 1])?;
    let noise = Tensor::randn(vec![20, 1], &mut rng).scale(0.05);
    let ys = xs.scale(2.0).add_scalar(-1.0).add(&noise)?;
    let (inputs, targets) = (Var::new(xs), Var::new(ys));
    let w = Var::parameter(Tensor::zeros(vec![1, 1]));
    let c = Var::parameter(Tensor::zeros(vec![1]));
    let lr = 0.1;
    for step in 0..=200 {
        let prediction = inputs.matmul(&w)?.add(&c)?;
        let loss = prediction.sub(&targets)?.powf(2.0).mean();
        w.zero_grad();
        c.zero_grad();
        loss.backward()?;
        no_grad(|| {
            for p in [&w, &c] {
                p.update_with(|value, grad| {
                    for (v, g) in value.iter_mut().zip(grad) {
                        *v -= lr * g;
                    }
                });
            }
        });
        if step % 50 == 0 {
            println!("step {step:3}: loss {:.5}", loss.value().item()?);
        }
    }
    println!(
        "fitted w = {:.3}, c = {:.3} (true values 2 and -1)",
        w.value().item()?,
        c.value().item()?
    );
    Ok(())
}
