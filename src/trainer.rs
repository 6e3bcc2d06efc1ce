//! Training loop.
//!
//! [`SomTrainer`] owns the host grid, the dispatch plan and the compiled
//! kernels of one device. Each training vector runs four stages, strictly
//! in order:
//!
//! 1. shrink the radius until the edge weight reaches the threshold
//! 2. compute the squared distance to every neuron
//! 3. reduce to the nearest neuron (per group, then across groups)
//! 4. pull the neurons around the winner towards the sample
//!
//! # Example
//!
//! ```rust
//! use somgrid::{CpuDevice, SomConfig, SomTrainer, TrainingParams, TrainingSet};
//!
//! let config = SomConfig::planar(4, 4, 3);
//! let mut trainer = SomTrainer::new(config, &CpuDevice::default())?;
//!
//! let set = TrainingSet::new(3, &[[1.0f32, 0.0, 0.0]], vec![TrainingParams::new(1.0, 0.5)])?;
//! let report = trainer.train(&set)?;
//! assert_eq!(report.steps_completed, 1);
//!
//! trainer.download_grid()?;
//! assert!(trainer.grid().neuron(0, 0, 0)[0] > 0.0);
//! # Ok::<(), somgrid::SomError>(())
//! ```

use std::time::Instant;

use log::{debug, error, info};

use crate::config::{ConfigError, KernelVariant, SomConfig};
use crate::cpu::CpuKernels;
use crate::device::{ComputeDevice, DeviceInfo, KernelDefines, SomKernels, StepParams};
use crate::dispatch::DispatchPlan;
use crate::error::{SomError, SomResult};
use crate::grid::{GridShape, SomGrid, Winner};
use crate::profile::{KernelProfiler, KernelStage, ProfileReport};
use crate::schedule::{decay_radius, TrainingParams, TrainingSet};

/// Outcome of one [`SomTrainer::train`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingReport {
    /// Vectors that went through a full step.
    pub steps_completed: usize,
    /// Vectors in the training set.
    pub vectors_total: usize,
    /// Radius after the run.
    pub final_radius: usize,
    /// The radius reached zero and the remaining vectors were skipped.
    pub converged: bool,
}

/// Self-Organizing Map trainer bound to one compute device.
pub struct SomTrainer<K: SomKernels> {
    config: SomConfig,
    variant: KernelVariant,
    device: DeviceInfo,
    plan: DispatchPlan,
    kernels: K,
    grid: SomGrid,
    radius: usize,
    profiler: Option<Box<dyn KernelProfiler>>,
}

/// Trainer on the rayon backend.
pub type CpuTrainer = SomTrainer<CpuKernels>;

impl<K: SomKernels> std::fmt::Debug for SomTrainer<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SomTrainer")
            .field("config", &self.config)
            .field("variant", &self.variant)
            .field("device", &self.device)
            .field("plan", &self.plan)
            .field("radius", &self.radius)
            .finish_non_exhaustive()
    }
}

impl<K: SomKernels> SomTrainer<K> {
    /// Validates `config`, plans dispatches for `device`, builds the kernels
    /// and uploads a zeroed grid.
    ///
    /// # Errors
    ///
    /// Configuration problems come back as [`SomError::Config`], kernel
    /// build failures as whatever the device reports.
    pub fn new<D>(config: SomConfig, device: &D) -> SomResult<Self>
    where
        D: ComputeDevice<Kernels = K>,
    {
        config.validate()?;
        let variant = config.variant()?;
        let shape = GridShape::of(&config);
        let info = device.info().clone();

        let plan = DispatchPlan::new(shape, config.neuron_size, &info, config.preferred_group_size)?;
        let defines = KernelDefines::from_config(&config, &info, &plan)?;
        debug!("Kernel build flags: {}", defines.compiler_flags());

        let mut kernels = device.build_kernels(&defines, &plan)?;
        let grid = SomGrid::new(shape, config.neuron_size)?;
        kernels.upload_grid(grid.as_padded_slice())?;

        let profiler: Option<Box<dyn KernelProfiler>> = if config.profiling {
            Some(Box::new(ProfileReport::new()))
        } else {
            None
        };

        info!(
            "SOM trainer ready: {}x{}x{} neurons x {} features on '{}' (group size {})",
            shape.width, shape.height, shape.depth, config.neuron_size, info.name, plan.group_size
        );

        Ok(Self {
            radius: shape.max_radius(),
            config,
            variant,
            device: info,
            plan,
            kernels,
            grid,
            profiler,
        })
    }

    /// Configuration the trainer was built with.
    pub fn config(&self) -> &SomConfig {
        &self.config
    }

    /// Device limits the plan was built against.
    pub fn device_info(&self) -> &DeviceInfo {
        &self.device
    }

    /// Dispatch plan.
    pub fn plan(&self) -> &DispatchPlan {
        &self.plan
    }

    /// Host copy of the grid. Call [`download_grid`](Self::download_grid)
    /// first to see the effect of training.
    pub fn grid(&self) -> &SomGrid {
        &self.grid
    }

    /// Mutable host grid. Changes reach the device on
    /// [`upload_grid`](Self::upload_grid).
    pub fn grid_mut(&mut self) -> &mut SomGrid {
        &mut self.grid
    }

    /// Copies the host grid to the device. Blocking.
    ///
    /// # Errors
    ///
    /// [`SomError::ShapeMismatch`] if the host grid was replaced by one with
    /// a different shape or feature length.
    pub fn upload_grid(&mut self) -> SomResult<()> {
        let expected = [
            self.plan.shape.width,
            self.plan.shape.height,
            self.plan.shape.depth,
            self.config.neuron_size,
        ];
        let shape = self.grid.shape();
        let got = [shape.width, shape.height, shape.depth, self.grid.neuron_size()];
        if got != expected {
            return Err(SomError::shape_mismatch(&expected, &got));
        }
        self.kernels.upload_grid(self.grid.as_padded_slice())
    }

    /// Copies the device grid to the host. Blocking.
    pub fn download_grid(&mut self) -> SomResult<()> {
        let mut data = vec![0.0f32; self.grid.as_padded_slice().len()];
        self.kernels.download_grid(&mut data)?;
        self.grid.copy_from_padded(&data)
    }

    /// Current update radius.
    pub fn radius(&self) -> usize {
        self.radius
    }

    /// Restores the radius to `max(width-1, height-1, depth-1)`.
    pub fn reset_radius(&mut self) {
        self.radius = self.plan.shape.max_radius();
    }

    /// Replaces the profiler. Every later stage is flushed and timed.
    pub fn set_profiler(&mut self, profiler: Box<dyn KernelProfiler>) {
        self.profiler = Some(profiler);
    }

    /// Removes and returns the profiler, turning timing off.
    pub fn take_profiler(&mut self) -> Option<Box<dyn KernelProfiler>> {
        self.profiler.take()
    }

    /// Totals of the active profiler, if it keeps any.
    pub fn profile_report(&self) -> Option<&ProfileReport> {
        self.profiler.as_ref().and_then(|p| p.report())
    }

    /// Trains on every vector of `set`, in order.
    ///
    /// Stops early, without error, once the radius decays to zero. The
    /// radius carries over to the next call.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::FeatureLengthMismatch`] if the set was built for a
    ///   different feature length (checked before any device work)
    /// - [`SomError::TrainingAborted`] if a device operation fails; updates
    ///   made by earlier steps stay in the device grid
    pub fn train(&mut self, set: &TrainingSet) -> SomResult<TrainingReport> {
        if set.neuron_size() != self.config.neuron_size {
            return Err(ConfigError::FeatureLengthMismatch {
                index: 0,
                expected: self.config.neuron_size,
                got: set.neuron_size(),
            }
            .into());
        }

        self.kernels
            .upload_training_vectors(set.padded_vectors(), set.len())
            .map_err(|e| self.abort(0, e))?;

        let threshold = self.variant.weight_threshold;
        let mut steps_completed = 0;
        let mut converged = false;
        for index in 0..set.len() {
            let params = set.params(index);
            self.radius = decay_radius(self.radius, &params, threshold);
            if self.radius == 0 {
                converged = true;
                break;
            }
            self.run_step(index, &params).map_err(|e| self.abort(index, e))?;
            steps_completed += 1;
        }

        self.kernels
            .finish()
            .map_err(|e| self.abort(steps_completed, e))?;
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.finish_run();
        }

        info!(
            "Trained {} of {} vectors, radius {}{}",
            steps_completed,
            set.len(),
            self.radius,
            if converged { " (converged)" } else { "" }
        );

        Ok(TrainingReport {
            steps_completed,
            vectors_total: set.len(),
            final_radius: self.radius,
            converged,
        })
    }

    /// Finds the nearest neuron to `sample` on the device grid.
    ///
    /// Runs only the distance and reduction stages. The grid is not
    /// modified, but the uploaded training vectors are replaced by
    /// `sample`; [`train`](Self::train) uploads its own set every call.
    pub fn find_winner(&mut self, sample: &[f32]) -> SomResult<Winner> {
        if sample.len() != self.config.neuron_size {
            return Err(SomError::shape_mismatch(&[self.config.neuron_size], &[sample.len()]));
        }
        let mut padded = vec![0.0f32; self.plan.neuron_size_rounded];
        padded[..sample.len()].copy_from_slice(sample);
        self.kernels.upload_training_vectors(&padded, 1)?;
        self.kernels.begin_step(&StepParams {
            vector_index: 0,
            radius: self.radius,
            sigma_sq: 1.0,
            learn_rate: 0.0,
        })?;
        self.find_minimum()?;
        self.kernels.end_step()?;

        let (index, distance) = self.kernels.read_winner()?;
        Ok(Winner::from_index(&self.plan.shape, index, distance))
    }

    /// Per-neuron squared distances from the last step or query.
    pub fn distances(&mut self) -> SomResult<Vec<f32>> {
        self.kernels.read_distances()
    }

    fn run_step(&mut self, index: usize, params: &TrainingParams) -> SomResult<()> {
        self.kernels.begin_step(&StepParams {
            vector_index: index,
            radius: self.radius,
            sigma_sq: params.sigma_sq() as f32,
            learn_rate: params.learn_rate as f32,
        })?;
        self.find_minimum()?;

        let update = self.plan.update_geometry(self.radius)?;
        timed(&mut self.kernels, &mut self.profiler, KernelStage::Update, |k| {
            k.update_network(&update)
        })?;
        self.kernels.end_step()
    }

    fn find_minimum(&mut self) -> SomResult<()> {
        timed(&mut self.kernels, &mut self.profiler, KernelStage::Distance, |k| {
            k.calculate_distances()
        })?;
        timed(&mut self.kernels, &mut self.profiler, KernelStage::LocalMin, |k| {
            k.find_local_minima()
        })?;
        for (i, round) in self.plan.rounds.iter().enumerate() {
            timed(&mut self.kernels, &mut self.profiler, KernelStage::GlobalMin, |k| {
                k.find_global_min(i, round)
            })?;
        }
        Ok(())
    }

    fn abort(&self, step: usize, source: SomError) -> SomError {
        error!("Training aborted at step {step}: {source}");
        SomError::aborted(step, source)
    }
}

/// Runs one stage, flushing and timing it when a profiler is attached.
fn timed<K, F>(
    kernels: &mut K,
    profiler: &mut Option<Box<dyn KernelProfiler>>,
    stage: KernelStage,
    run: F,
) -> SomResult<()>
where
    K: SomKernels,
    F: FnOnce(&mut K) -> SomResult<()>,
{
    match profiler {
        Some(profiler) => {
            let start = Instant::now();
            run(kernels)?;
            kernels.flush()?;
            profiler.record(stage, start.elapsed());
            Ok(())
        }
        None => run(kernels),
    }
}
