//! End-to-end training scenarios on the CPU backend.
//!
//! These tests verify:
//! - A single step moves every neuron by the Gaussian weight of its offset
//! - Radius decay stops training early and carries across calls
//! - Neurons outside the neighborhood are never touched
//! - Neighborhood metric variants change membership, not weights

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use somgrid::{
    CpuDevice, CpuOptions, DeviceClass, ExponentialDecay, GridMetric, SomConfig, SomTrainer,
    TrainingParams, TrainingSchedule, TrainingSet,
};

/// Tolerance for floating-point comparison.
const EPSILON: f32 = 1e-6;

fn chebyshev(a: (usize, usize, usize), b: (usize, usize, usize)) -> usize {
    a.0.abs_diff(b.0).max(a.1.abs_diff(b.1)).max(a.2.abs_diff(b.2))
}

// =============================================================================
// Single step
// =============================================================================

#[test]
fn test_single_step_gaussian_update() {
    let mut trainer = SomTrainer::new(SomConfig::planar(4, 4, 3), &CpuDevice::default()).unwrap();
    assert_eq!(trainer.radius(), 3);

    // every other neuron sits at distance 1 from the sample
    trainer.grid_mut().set_neuron(2, 2, 0, &[0.5, 0.0, 0.0]).unwrap();
    trainer.upload_grid().unwrap();

    let set = TrainingSet::new(3, &[[1.0f32, 0.0, 0.0]], vec![TrainingParams::new(1.0, 0.5)]).unwrap();
    let report = trainer.train(&set).unwrap();
    assert_eq!(report.steps_completed, 1);
    assert_eq!(report.final_radius, 3);
    assert!(!report.converged);

    trainer.download_grid().unwrap();
    let grid = trainer.grid();
    for ((x, y, _), neuron) in grid.iter_neurons() {
        let expected = if (x, y) == (2, 2) {
            0.75
        } else {
            let d_sq = (x as f32 - 2.0).powi(2) + (y as f32 - 2.0).powi(2);
            0.5 * (-d_sq / 2.0).exp()
        };
        assert!(
            (neuron[0] - expected).abs() < EPSILON,
            "neuron ({x}, {y}): got {}, expected {expected}",
            neuron[0]
        );
        assert_eq!(&neuron[1..], &[0.0, 0.0]);
    }
}

#[test]
fn test_matching_neuron_wins_and_neighbors_close_in() {
    let mut trainer = SomTrainer::new(SomConfig::planar(4, 4, 3), &CpuDevice::default()).unwrap();
    trainer.grid_mut().set_neuron(2, 2, 0, &[1.0, 0.0, 0.0]).unwrap();
    trainer.upload_grid().unwrap();

    let sample = [1.0f32, 0.0, 0.0];
    let winner = trainer.find_winner(&sample).unwrap();
    assert_eq!((winner.x, winner.y, winner.z), (2, 2, 0));
    assert_eq!(winner.distance, 0.0);

    let set = TrainingSet::new(3, &[sample], vec![TrainingParams::new(1.0, 0.5)]).unwrap();
    assert_eq!(trainer.train(&set).unwrap().steps_completed, 1);
    trainer.download_grid().unwrap();

    for ((x, y, z), neuron) in trainer.grid().iter_neurons() {
        let after = neuron
            .iter()
            .zip(&sample)
            .map(|(n, s)| (n - s).powi(2))
            .sum::<f32>()
            .sqrt();
        if (x, y, z) == (2, 2, 0) {
            assert_eq!(neuron, &sample);
            continue;
        }
        // every neighbor started at distance 1 from the sample
        assert!(after < 1.0, "neuron ({x}, {y}) did not move closer");
        let d_sq = (x as f32 - 2.0).powi(2) + (y as f32 - 2.0).powi(2);
        let shrink = 1.0 - after;
        assert!(
            (shrink / (-d_sq / 2.0).exp() - 0.5).abs() < 1e-4,
            "neuron ({x}, {y}): shrink {shrink} not proportional to exp(-d^2/2)"
        );
    }
}

#[test]
fn test_find_winner_exact_match() {
    let mut trainer = SomTrainer::new(SomConfig::cube(4, 3), &CpuDevice::default()).unwrap();
    trainer
        .grid_mut()
        .fill_with(|x, y, z, c| (x * 100 + y * 10 + z) as f32 + c as f32 * 0.25);
    trainer.upload_grid().unwrap();

    let winner = trainer.find_winner(&[312.0, 312.25, 312.5]).unwrap();
    assert_eq!((winner.x, winner.y, winner.z), (3, 1, 2));
    assert_eq!(winner.index, 3 + 4 * (1 + 4 * 2));
    assert_eq!(winner.distance, 0.0);

    let distances = trainer.distances().unwrap();
    assert_eq!(distances.len(), 64);
    assert_eq!(distances[winner.index], 0.0);
}

// =============================================================================
// Radius decay
// =============================================================================

#[test]
fn test_tiny_learn_rate_converges_without_steps() {
    let mut trainer = SomTrainer::new(SomConfig::planar(4, 4, 3), &CpuDevice::default()).unwrap();
    trainer.grid_mut().fill_with(|x, y, _, c| (x + y + c) as f32);
    trainer.upload_grid().unwrap();
    let before = trainer.grid().clone();

    let set = TrainingSet::new(3, &[[1.0f32, 0.0, 0.0]], vec![TrainingParams::new(1.0, 0.005)]).unwrap();
    let report = trainer.train(&set).unwrap();
    assert_eq!(report.steps_completed, 0);
    assert_eq!(report.final_radius, 0);
    assert!(report.converged);

    trainer.download_grid().unwrap();
    assert_eq!(trainer.grid(), &before);

    // the radius stays at zero until reset
    let set = TrainingSet::new(3, &[[1.0f32, 0.0, 0.0]], vec![TrainingParams::new(1.0, 0.5)]).unwrap();
    assert_eq!(trainer.train(&set).unwrap().steps_completed, 0);
    trainer.reset_radius();
    assert_eq!(trainer.radius(), 3);
    assert_eq!(trainer.train(&set).unwrap().steps_completed, 1);
}

#[test]
fn test_radius_never_grows() {
    let mut trainer = SomTrainer::new(SomConfig::cube(6, 3), &CpuDevice::default()).unwrap();
    let schedule = ExponentialDecay::new(TrainingParams::new(3.0, 0.5), TrainingParams::new(0.3, 0.05));
    let mut rng = StdRng::seed_from_u64(7);

    let start = trainer.radius();
    let mut previous = start;
    for i in 0..20 {
        let sample: [f32; 3] = [rng.gen(), rng.gen(), rng.gen()];
        let set = TrainingSet::new(3, &[sample], vec![schedule.params(i, 20)]).unwrap();
        let report = trainer.train(&set).unwrap();
        assert!(report.final_radius <= previous, "radius grew at vector {i}");
        previous = report.final_radius;
    }
    assert!(previous < start);
}

// =============================================================================
// Neighborhood
// =============================================================================

#[test]
fn test_update_is_local() {
    let mut trainer = SomTrainer::new(SomConfig::planar(8, 8, 3), &CpuDevice::default()).unwrap();
    trainer
        .grid_mut()
        .fill_with(|x, y, _, c| ((x * 7 + y * 3 + c * 2) % 11) as f32 / 11.0);
    trainer.upload_grid().unwrap();
    let before = trainer.grid().clone();

    let sample = [0.2f32, 0.9, 0.4];
    let winner = trainer.find_winner(&sample).unwrap();

    // 0.5 * exp(-r / 0.72) drops below 0.01 past r = 2
    let set = TrainingSet::new(3, &[sample], vec![TrainingParams::new(0.6, 0.5)]).unwrap();
    let report = trainer.train(&set).unwrap();
    assert_eq!(report.final_radius, 2);

    trainer.download_grid().unwrap();
    for ((x, y, z), neuron) in trainer.grid().iter_neurons() {
        let old = before.neuron(x, y, z);
        if chebyshev((x, y, z), (winner.x, winner.y, winner.z)) > 2 {
            assert_eq!(neuron, old, "neuron ({x}, {y}, {z}) outside the radius changed");
        } else {
            for ((n, o), s) in neuron.iter().zip(old).zip(&sample) {
                assert!((n - s).abs() <= (o - s).abs() + EPSILON);
            }
        }
    }
}

#[test]
fn test_euclidean_neighborhood_skips_diagonals() {
    let run = |metric: GridMetric| {
        let config = SomConfig {
            neighborhood_metric: metric,
            ..SomConfig::planar(5, 5, 2)
        };
        let mut trainer = SomTrainer::new(config, &CpuDevice::default()).unwrap();
        trainer.grid_mut().set_neuron(2, 2, 0, &[1.0, 1.0]).unwrap();
        trainer.upload_grid().unwrap();

        // sigma 0.5 decays the radius to 1
        let set = TrainingSet::new(2, &[[1.0f32, 1.0]], vec![TrainingParams::new(0.5, 0.5)]).unwrap();
        let report = trainer.train(&set).unwrap();
        assert_eq!(report.final_radius, 1);
        trainer.download_grid().unwrap();
        trainer.grid().clone()
    };

    let cube = run(GridMetric::Chebyshev);
    let ball = run(GridMetric::Euclidean);

    // direct neighbor: same weight under both
    let edge = 0.5 * (-1.0f32 / 0.5).exp();
    assert!((cube.neuron(3, 2, 0)[0] - edge).abs() < EPSILON);
    assert!((ball.neuron(3, 2, 0)[0] - edge).abs() < EPSILON);

    // diagonal: inside the Chebyshev ball only
    let corner = 0.5 * (-2.0f32 / 0.5).exp();
    assert!((cube.neuron(3, 3, 0)[0] - corner).abs() < EPSILON);
    assert_eq!(ball.neuron(3, 3, 0)[0], 0.0);

    // outside the window
    assert_eq!(cube.neuron(4, 2, 0)[0], 0.0);
    assert_eq!(ball.neuron(4, 2, 0)[0], 0.0);
}

// =============================================================================
// Backend variants
// =============================================================================

#[test]
fn test_tree_and_sequential_distances_agree() {
    let mut rng = StdRng::seed_from_u64(11);
    let initial: Vec<f32> = (0..36 * 5).map(|_| rng.gen()).collect();
    let samples: Vec<[f32; 5]> = (0..10).map(|_| rng.gen()).collect();
    let set = TrainingSet::new(5, &samples, vec![TrainingParams::new(1.5, 0.3); 10]).unwrap();

    let run = |class: DeviceClass| {
        let device = CpuDevice::new(CpuOptions {
            device_class: class,
            ..CpuOptions::default()
        });
        let mut trainer = SomTrainer::new(SomConfig::planar(6, 6, 5), &device).unwrap();
        trainer.grid_mut().fill_with(|x, y, _, c| initial[(x + 6 * y) * 5 + c]);
        trainer.upload_grid().unwrap();
        trainer.train(&set).unwrap();
        trainer.download_grid().unwrap();
        trainer.grid().clone()
    };

    let sequential = run(DeviceClass::Cpu);
    let tree = run(DeviceClass::Accelerator);
    for ((_, a), (_, b)) in sequential.iter_neurons().zip(tree.iter_neurons()) {
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-4);
        }
    }
}
