//! Color cube example for somgrid
//!
//! Trains a 3-D map on random RGB colors with a decaying schedule, then
//! checks that primary colors land in different corners of the cube.
//!
//! # Features Demonstrated
//!
//! - Trainer construction on the GPU, with a CPU fallback
//! - Exponential parameter schedules and radius decay
//! - Per-kernel profiling
//! - Winner queries on the trained grid
//!
//! # Run
//!
//! ```bash
//! cargo run --release --example train_cube            # GPU if available
//! cargo run --release --example train_cube -- --cpu   # rayon backend
//! ```

use rand::{rngs::StdRng, Rng, SeedableRng};
use somgrid::{
    ComputeDevice, CpuDevice, ExponentialDecay, KernelStage, SomConfig, SomResult, SomTrainer,
    TrainingParams, TrainingSet,
};

const SIDE: usize = 12;
const SAMPLES: usize = 2000;

fn run<D: ComputeDevice>(device: &D) -> SomResult<()> {
    println!("Device: {}", device.info().name);

    let config = SomConfig {
        profiling: true,
        ..SomConfig::cube(SIDE, 3)
    };
    let mut trainer = SomTrainer::new(config, device)?;
    println!(
        "Grid: {0}x{0}x{0}, group size {1}, {2} reduction rounds",
        SIDE,
        trainer.plan().group_size,
        trainer.plan().rounds.len()
    );

    let mut rng = StdRng::seed_from_u64(2024);
    trainer.grid_mut().fill_with(|_, _, _, _| rng.gen_range(0.4..0.6));
    trainer.upload_grid()?;

    let colors: Vec<[f32; 3]> = (0..SAMPLES).map(|_| rng.gen()).collect();
    let schedule = ExponentialDecay::new(TrainingParams::new(4.0, 0.5), TrainingParams::new(0.4, 0.05));
    let set = TrainingSet::with_schedule(3, &colors, &schedule)?;

    let start = std::time::Instant::now();
    let report = trainer.train(&set)?;
    println!(
        "\nTrained {}/{} colors in {:.2?} (final radius {}, converged: {})",
        report.steps_completed,
        report.vectors_total,
        start.elapsed(),
        report.final_radius,
        report.converged
    );

    if let Some(profile) = trainer.profile_report() {
        for stage in KernelStage::ALL {
            if let Some(mean) = profile.mean(stage) {
                println!("  {:<24} {:>6} calls, mean {:.2?}", stage.to_string(), profile.count(stage), mean);
            }
        }
    }

    println!("\nBest matching neurons:");
    for (name, color) in [
        ("red", [1.0f32, 0.0, 0.0]),
        ("green", [0.0, 1.0, 0.0]),
        ("blue", [0.0, 0.0, 1.0]),
        ("white", [1.0, 1.0, 1.0]),
        ("black", [0.0, 0.0, 0.0]),
    ] {
        let winner = trainer.find_winner(&color)?;
        println!(
            "  {:<6} -> ({:>2}, {:>2}, {:>2})  distance {:.4}",
            name, winner.x, winner.y, winner.z, winner.distance
        );
    }
    Ok(())
}

/// Runs on the default GPU adapter. Returns false if there is none.
#[cfg(feature = "gpu")]
fn run_gpu() -> bool {
    match somgrid::gpu::WgpuBackend::init(somgrid::gpu::WgpuOptions::default()) {
        Ok(backend) => {
            if let Err(e) = run(&backend) {
                eprintln!("GPU run failed: {e}");
                std::process::exit(1);
            }
            true
        }
        Err(e) => {
            eprintln!("No GPU ({e}), falling back to the CPU backend.\n");
            false
        }
    }
}

#[cfg(not(feature = "gpu"))]
fn run_gpu() -> bool {
    false
}

fn main() {
    println!("=== somgrid Color Cube Example ===\n");
    let force_cpu = std::env::args().any(|arg| arg == "--cpu");
    if !force_cpu && run_gpu() {
        return;
    }

    if let Err(e) = run(&CpuDevice::default()) {
        eprintln!("CPU run failed: {e}");
        std::process::exit(1);
    }
}
