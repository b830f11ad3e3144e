//! Model evaluation and derivative benchmarks.
//!
//! Measures the steady-state cost of evaluating a compiled model, its
//! analytic Jacobian and its Hessian over a data array, plus the one-time
//! cost of building and compiling a model from source strings. Derivative
//! models are derived and compiled during setup so the evaluation groups
//! measure pure numeric work.
//!
//! Run with: `cargo bench --bench models`

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use fitmodel::prelude::*;

fn gaussian_model() -> Model {
    let params = parameters("amp, mu, sigma");
    let spec = ModelSpec::parse(
        &[("y", "amp * exp(0 - (x - mu)^2 / (2 * sigma^2))")],
        &params,
    )
    .unwrap();
    Model::new(spec).unwrap()
}

fn data_args() -> Args {
    let xs: Vec<f64> = (0..512).map(|i| i as f64 * 0.01).collect();
    Args::new()
        .pos(xs)
        .set("amp", 2.0)
        .set("mu", 2.5)
        .set("sigma", 0.8)
}

fn benchmark_evaluation(c: &mut Criterion) {
    let model = gaussian_model();
    let args = data_args();
    // compile outside the measurement loop
    model.eval(&args).unwrap();

    c.bench_function("eval_gaussian_512", |b| {
        b.iter(|| model.eval(black_box(&args)).unwrap())
    });
}

fn benchmark_jacobian(c: &mut Criterion) {
    let model = gaussian_model();
    let args = data_args();
    model.eval_jacobian(&args).unwrap();

    c.bench_function("jacobian_gaussian_512", |b| {
        b.iter(|| model.eval_jacobian(black_box(&args)).unwrap())
    });
}

fn benchmark_hessian(c: &mut Criterion) {
    let model = gaussian_model();
    let args = data_args();
    model.eval_hessian(&args).unwrap();

    c.bench_function("hessian_gaussian_512", |b| {
        b.iter(|| model.eval_hessian(black_box(&args)).unwrap())
    });
}

fn benchmark_model_build(c: &mut Criterion) {
    c.bench_function("build_and_compile_gaussian", |b| {
        b.iter(|| {
            let model = gaussian_model();
            model.eval(&data_args()).unwrap()
        })
    });
}

criterion_group!(
    benches,
    benchmark_evaluation,
    benchmark_jacobian,
    benchmark_hessian,
    benchmark_model_build
);
criterion_main!(benches);
