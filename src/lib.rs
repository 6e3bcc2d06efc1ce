//! # somgrid - GPU-accelerated 3-D Self-Organizing Maps
//!
//! Trains a width × height × depth grid of neurons, each a vector of
//! `neuron_size` features, with the classic competitive SOM rule: find the
//! nearest neuron to a sample, then pull its grid neighborhood towards the
//! sample with a Gaussian weight.
//!
//! ## Architecture
//! - Padded neuron layout: each neuron occupies a power-of-two stride so
//!   `X_DIM = stride / 2` lanes can sum a distance in one tree
//! - Two-level arg-min: per-group minima, then ping-pong rounds across
//!   groups until one candidate is left
//! - Backends behind [`ComputeDevice`]: wgpu compute shaders (`gpu`
//!   feature) or a rayon port reproducing the same work-group arithmetic
//!
//! ## Usage
//! ```rust
//! use somgrid::{CpuDevice, SomConfig, SomTrainer, TrainingParams, TrainingSet};
//!
//! let mut trainer = SomTrainer::new(SomConfig::cube(4, 2), &CpuDevice::default())?;
//! let set = TrainingSet::new(2, &[[0.5f32, 0.5]], vec![TrainingParams::new(1.5, 0.3)])?;
//! trainer.train(&set)?;
//!
//! let winner = trainer.find_winner(&[0.5, 0.5])?;
//! assert!(winner.distance < 0.5);
//! # Ok::<(), somgrid::SomError>(())
//! ```

pub mod buffer;
pub mod config;
pub mod cpu;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod grid;
pub mod profile;
pub mod schedule;
pub mod trainer;

#[cfg(feature = "gpu")]
pub mod gpu;

// Re-exports
pub use buffer::{AlignedBuffer, CACHE_LINE};
pub use config::{
    ConfigError, GridMetric, KernelVariant, SomConfig, DEFAULT_GROUP_SIZE, DEFAULT_WEIGHT_THRESHOLD,
};
pub use cpu::{CpuDevice, CpuKernels, CpuOptions};
pub use device::{ComputeDevice, DeviceClass, DeviceInfo, KernelDefines, SomKernels, StepParams};
pub use dispatch::{round_up, round_up_power2, DispatchPlan, Geometry, ReductionRound, UpdateGeometry};
pub use error::{DeviceErrorCode, SomError, SomResult};
pub use grid::{GridShape, SomGrid, Winner};
pub use profile::{KernelProfiler, KernelStage, ProfileReport};
pub use schedule::{
    decay_radius, ConstantSchedule, ExponentialDecay, LinearDecay, TrainingParams, TrainingSchedule,
    TrainingSet,
};
pub use trainer::{CpuTrainer, SomTrainer, TrainingReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
