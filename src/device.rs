//! Compute device abstraction.
//!
//! A [`ComputeDevice`] reports its limits and builds a [`SomKernels`]
//! instance: the four training kernels compiled for one grid, together
//! with the device buffers they run on. Two backends implement it:
//!
//! - [`CpuDevice`](crate::cpu::CpuDevice): rayon, always available
//! - `WgpuBackend` (feature `gpu`): WGSL compute shaders
//!
//! Kernel calls are ordered. A backend may queue them and only execute on
//! [`end_step`](SomKernels::end_step) or [`flush`](SomKernels::flush), but
//! every read waits for all earlier calls to complete.

use crate::config::{GridMetric, KernelVariant, SomConfig};
use crate::dispatch::{DispatchPlan, ReductionRound, UpdateGeometry};
use crate::error::SomResult;

/// Broad class of the selected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// Host processor, or a software rasterizer adapter.
    Cpu,
    /// Discrete or integrated GPU.
    Accelerator,
}

/// Limits the dispatch planner needs from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Device class, selects the sequential distance sum on CPUs.
    pub class: DeviceClass,
    /// Maximum work items per work group.
    pub max_group_size: usize,
    /// Maximum work-group extent per axis.
    pub max_workgroup_size: [usize; 3],
    /// Maximum work groups per dispatch axis.
    pub max_workgroups_per_dim: usize,
    /// Work-group shared memory in bytes, 0 if unlimited.
    pub max_shared_memory_bytes: usize,
}

/// Build parameters baked into the kernels.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelDefines {
    /// Half the padded feature length.
    pub x_dim: usize,
    /// Real feature count.
    pub neuron_size: usize,
    /// Padded feature stride (`2 * x_dim`).
    pub neuron_stride: usize,
    /// Grid extent per axis.
    pub som_size: [usize; 3],
    /// Sum distances sequentially instead of with the paired tree.
    pub cpu: bool,
    /// Metric variants and decay threshold.
    pub variant: KernelVariant,
}

impl KernelDefines {
    /// Resolves the defines for `config` on `device`.
    pub fn from_config(config: &SomConfig, info: &DeviceInfo, plan: &DispatchPlan) -> SomResult<Self> {
        let variant = config.variant()?;
        Ok(Self {
            x_dim: plan.half,
            neuron_size: config.neuron_size,
            neuron_stride: plan.neuron_size_rounded,
            som_size: [config.width, config.height, config.depth],
            cpu: variant.force_cpu || info.class == DeviceClass::Cpu,
            variant,
        })
    }

    /// Defines in compiler-flag form, for logs.
    pub fn compiler_flags(&self) -> String {
        let metric = |m: GridMetric| match m {
            GridMetric::Chebyshev => "CHEBYSHEV",
            GridMetric::Euclidean => "EUCLIDEAN",
        };
        let mut flags = format!(
            "-DX_DIM={} -DNEURON_SIZE={} -DSOM_SIZE_X={} -DSOM_SIZE_Y={} -DSOM_SIZE_Z={}",
            self.x_dim, self.neuron_size, self.som_size[0], self.som_size[1], self.som_size[2]
        );
        if self.cpu {
            flags.push_str(" -DCPU");
        }
        flags.push_str(" -DNEIGHBORHOOD=");
        flags.push_str(metric(self.variant.neighborhood));
        flags.push_str(" -DWEIGHTING=");
        flags.push_str(metric(self.variant.weighting));
        flags
    }

    /// Total neuron count.
    pub fn total_size(&self) -> usize {
        self.som_size.iter().product()
    }
}

/// Per-step kernel arguments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepParams {
    /// Which uploaded training vector to use.
    pub vector_index: usize,
    /// Current update radius.
    pub radius: usize,
    /// `sigma²`
    pub sigma_sq: f32,
    /// Learning rate.
    pub learn_rate: f32,
}

/// A device that can host the training kernels.
pub trait ComputeDevice {
    /// Kernel set this device builds.
    type Kernels: SomKernels;

    /// Device limits.
    fn info(&self) -> &DeviceInfo;

    /// Compiles the kernels and allocates their buffers.
    fn build_kernels(&self, defines: &KernelDefines, plan: &DispatchPlan) -> SomResult<Self::Kernels>;
}

/// Compiled training kernels bound to their buffers.
pub trait SomKernels {
    /// Copies the padded grid to the device. Blocking.
    fn upload_grid(&mut self, data: &[f32]) -> SomResult<()>;

    /// Copies the device grid into `out`. Blocking.
    fn download_grid(&mut self, out: &mut [f32]) -> SomResult<()>;

    /// Replaces the training vectors (padded layout, `count` vectors).
    fn upload_training_vectors(&mut self, data: &[f32], count: usize) -> SomResult<()>;

    /// Sets the arguments for the next step.
    fn begin_step(&mut self, params: &StepParams) -> SomResult<()>;

    /// Distance stage.
    fn calculate_distances(&mut self) -> SomResult<()>;

    /// Per-group minima, written to buffer pair 0.
    fn find_local_minima(&mut self) -> SomResult<()>;

    /// Reduction round `index`.
    fn find_global_min(&mut self, index: usize, round: &ReductionRound) -> SomResult<()>;

    /// Neighborhood update around the current winner.
    fn update_network(&mut self, update: &UpdateGeometry) -> SomResult<()>;

    /// Submits the queued work of one step.
    fn end_step(&mut self) -> SomResult<()>;

    /// Submits queued work and waits for it.
    fn flush(&mut self) -> SomResult<()>;

    /// Waits until the device is idle.
    fn finish(&mut self) -> SomResult<()>;

    /// Reads the winning `(flat index, squared distance)`.
    fn read_winner(&mut self) -> SomResult<(usize, f32)>;

    /// Reads the per-neuron distances of the last distance stage.
    fn read_distances(&mut self) -> SomResult<Vec<f32>>;
}
