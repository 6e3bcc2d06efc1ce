//! GPU backend for somgrid using wgpu.
//!
//! Only available when the `gpu` feature is enabled (the default).
//!
//! # Architecture
//!
//! Every training step records four kinds of compute pass into a single
//! command encoder:
//!
//! 1. `calculate_distances`: one work-group row per neuron, `X_DIM` lanes
//!    summing squared differences with a shared-memory tree
//! 2. `find_global_first_pass`: per-group minima over the distances
//! 3. `find_global_min`: zero or more rounds ping-ponging between two
//!    buffer pairs until one candidate is left
//! 4. `update_network`: Gaussian-weighted pull of the clipped
//!    neighborhood window toward the sample
//!
//! WGSL bakes the work-group size into the module, so [`PipelineCache`]
//! compiles one pipeline per size the [`DispatchPlan`](crate::DispatchPlan)
//! can request.
//!
//! # Example
//!
//! ```rust,no_run
//! use somgrid::gpu::{WgpuBackend, WgpuOptions};
//! use somgrid::{SomConfig, SomTrainer, TrainingParams, TrainingSet};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = WgpuBackend::init(WgpuOptions::default())?;
//! let mut trainer = SomTrainer::new(SomConfig::cube(16, 3), &backend)?;
//!
//! let samples = vec![[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0]];
//! let set = TrainingSet::new(3, &samples, vec![TrainingParams::new(2.0, 0.5); 2])?;
//! let report = trainer.train(&set)?;
//! println!("{} steps, radius {}", report.steps_completed, report.final_radius);
//! # Ok(())
//! # }
//! ```
//!
//! # Memory Management
//!
//! - Buffers are allocated once per trainer; only the training-vector
//!   buffer grows, and growing it rebuilds the cached bind groups
//! - Buffers above [`MAX_VRAM_ALLOC`] are rejected with
//!   [`ConfigError::GridTooLarge`](crate::ConfigError::GridTooLarge)

mod backend;
mod kernels;
mod pipeline;
pub mod shaders;
mod tensor;
mod uniforms;
mod workspace;

pub use backend::{PowerPreference, WgpuBackend, WgpuOptions};
pub use kernels::GpuSomKernels;
pub use pipeline::{PipelineCache, StageLayouts};
pub use tensor::GpuTensor;
pub use uniforms::{RoundUniforms, StepUniforms};
pub use workspace::{BindGroups, GpuBufferSet};

/// Trainer running on a wgpu device.
pub type GpuTrainer = crate::SomTrainer<GpuSomKernels>;

/// Maximum VRAM allocation per buffer (2GB).
///
/// This limit prevents excessive memory allocation on GPUs and ensures
/// compatibility with most hardware configurations.
pub const MAX_VRAM_ALLOC: u64 = 2 * 1024 * 1024 * 1024;

/// Alignment of dynamic uniform offsets (256 bytes).
///
/// The minimum `min_uniform_buffer_offset_alignment` wgpu guarantees.
pub const GPU_BUFFER_ALIGNMENT: u64 = 256;

/// Checks if a size in bytes exceeds the maximum VRAM allocation limit.
#[inline]
pub fn exceeds_vram_limit(size_bytes: u64) -> bool {
    size_bytes > MAX_VRAM_ALLOC
}
