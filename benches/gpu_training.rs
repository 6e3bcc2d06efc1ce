//! GPU training benchmarks.
//!
//! Run with: cargo bench --bench gpu_training --features gpu -- --gpu
//!
//! # GPU Flag
//!
//! Without `--gpu` flag, benchmarks will be skipped gracefully (CI-safe default).
//! With the flag, each step includes its submit; downloads happen once per
//! iteration through `finish`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};

#[cfg(feature = "gpu")]
use somgrid::gpu::{WgpuBackend, WgpuOptions};
#[cfg(feature = "gpu")]
use somgrid::{SomConfig, SomTrainer, TrainingParams, TrainingSet};

const FEATURES: usize = 8;

/// Check if --gpu flag was passed to criterion.
fn gpu_flag_enabled() -> bool {
    std::env::args().any(|arg| arg == "--gpu")
}

fn make_vectors(count: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (0..FEATURES).map(|_| rng.gen_range(0.0..1.0)).collect())
        .collect()
}

#[cfg(feature = "gpu")]
fn bench_gpu_train(c: &mut Criterion) {
    if !gpu_flag_enabled() {
        eprintln!("GPU benchmarks skipped (--gpu flag not provided).");
        eprintln!("Run with: cargo bench --bench gpu_training --features gpu -- --gpu");
        return;
    }

    let backend = match WgpuBackend::init(WgpuOptions::default()) {
        Ok(b) => {
            println!("GPU: {} ({:?})", b.adapter_info().name, b.adapter_info().backend);
            b
        }
        Err(e) => {
            eprintln!("Failed to initialize GPU: {}. Skipping GPU benchmarks.", e);
            return;
        }
    };

    let vectors = make_vectors(64, 42);
    let set = match TrainingSet::new(FEATURES, &vectors, vec![TrainingParams::new(4.0, 0.2); 64]) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to build training set: {}. Skipping.", e);
            return;
        }
    };

    let mut group = c.benchmark_group("gpu_train_64_vectors");
    for side in [16_usize, 32, 64] {
        let mut trainer = match SomTrainer::new(SomConfig::cube(side, FEATURES), &backend) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("Failed to build {side}^3 trainer: {}. Skipping.", e);
                continue;
            }
        };
        group.throughput(Throughput::Elements((side * side * side * set.len()) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(side), &side, |b, _| {
            b.iter(|| {
                trainer.reset_radius();
                black_box(trainer.train(&set).unwrap())
            });
        });
    }
    group.finish();
}

#[cfg(not(feature = "gpu"))]
fn bench_gpu_train(_c: &mut Criterion) {
    eprintln!("GPU benchmarks require the `gpu` feature.");
    let _ = (gpu_flag_enabled(), make_vectors(0, 0));
}

criterion_group!(benches, bench_gpu_train);
criterion_main!(benches);
