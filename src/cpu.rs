//! Host backend on the rayon thread pool.
//!
//! The kernels reproduce the work-group structure of the GPU shaders: the
//! distance stage sums lanes with the same paired tree, and both reduction
//! stages walk the same `(value, index)` tree over the same group sizes and
//! sentinels. Winner selection, tie-breaking included, is therefore identical
//! on both backends.
//!
//! Each call runs to completion before returning, so `end_step`, `flush`
//! and `finish` have nothing to do.

use log::debug;
use rayon::prelude::*;

use crate::device::{ComputeDevice, DeviceClass, DeviceInfo, KernelDefines, SomKernels, StepParams};
use crate::dispatch::{DispatchPlan, ReductionRound, UpdateGeometry};
use crate::error::{SomError, SomResult};
use crate::grid::GridShape;

/// Sentinel distance for lanes past the end of the grid.
pub const FLT_MAX: f32 = f32::MAX;

/// Sentinel index for lanes past the end of the grid.
pub const NO_INDEX: u32 = u32::MAX;

/// Options for [`CpuDevice`].
#[derive(Debug, Clone)]
pub struct CpuOptions {
    /// Emulated work-group size limit.
    pub max_group_size: usize,
    /// Reported device class. [`DeviceClass::Accelerator`] selects the
    /// paired-tree distance sum instead of the sequential one.
    pub device_class: DeviceClass,
}

impl Default for CpuOptions {
    fn default() -> Self {
        Self {
            max_group_size: 1024,
            device_class: DeviceClass::Cpu,
        }
    }
}

/// Rayon-backed compute device.
#[derive(Debug, Clone)]
pub struct CpuDevice {
    info: DeviceInfo,
}

impl CpuDevice {
    /// Creates a device with the given emulated limits.
    pub fn new(options: CpuOptions) -> Self {
        let max = options.max_group_size.max(1);
        Self {
            info: DeviceInfo {
                name: format!("rayon ({} threads)", rayon::current_num_threads()),
                class: options.device_class,
                max_group_size: max,
                max_workgroup_size: [max, max, 64],
                max_workgroups_per_dim: u32::MAX as usize,
                max_shared_memory_bytes: 0,
            },
        }
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new(CpuOptions::default())
    }
}

impl ComputeDevice for CpuDevice {
    type Kernels = CpuKernels;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn build_kernels(&self, defines: &KernelDefines, plan: &DispatchPlan) -> SomResult<CpuKernels> {
        debug!("Building CPU kernels with {}", defines.compiler_flags());
        CpuKernels::new(defines.clone(), plan.clone())
    }
}

/// Host mirrors of the device buffers plus the kernels that run on them.
#[derive(Debug)]
pub struct CpuKernels {
    defines: KernelDefines,
    plan: DispatchPlan,
    som: Vec<f32>,
    inputs: Vec<f32>,
    input_count: usize,
    distances: Vec<f32>,
    values: [Vec<f32>; 2],
    indexes: [Vec<u32>; 2],
    step: Option<StepParams>,
}

impl CpuKernels {
    fn new(defines: KernelDefines, plan: DispatchPlan) -> SomResult<Self> {
        let total = plan.shape.total();
        if defines.total_size() != total || defines.neuron_stride != plan.neuron_size_rounded {
            return Err(SomError::invariant("kernel defines do not match the dispatch plan"));
        }
        let pair_len = plan.reduced_elems.max(1);
        Ok(Self {
            som: vec![0.0; total * defines.neuron_stride],
            inputs: Vec::new(),
            input_count: 0,
            distances: vec![0.0; total],
            values: [vec![FLT_MAX; pair_len], vec![FLT_MAX; pair_len]],
            indexes: [vec![NO_INDEX; pair_len], vec![NO_INDEX; pair_len]],
            step: None,
            defines,
            plan,
        })
    }

    /// Overwrites the distance buffer.
    ///
    /// Lets the reduction stages run on hand-picked values.
    pub fn set_distances(&mut self, distances: &[f32]) -> SomResult<()> {
        if distances.len() != self.distances.len() {
            return Err(SomError::shape_mismatch(&[self.distances.len()], &[distances.len()]));
        }
        self.distances.copy_from_slice(distances);
        Ok(())
    }

    fn current_step(&self, operation: &str) -> SomResult<StepParams> {
        self.step
            .ok_or_else(|| SomError::validation(format!("{operation} called outside a step")))
    }

    fn sample(&self, step: &StepParams) -> &[f32] {
        let stride = self.defines.neuron_stride;
        &self.inputs[step.vector_index * stride..(step.vector_index + 1) * stride]
    }

    fn winner_index(&self) -> SomResult<usize> {
        let slot = self.plan.winner_slot();
        match self.indexes[slot][0] {
            NO_INDEX => Err(SomError::validation("reduction produced no winner")),
            index => Ok(index as usize),
        }
    }
}

/// `(value, index)` that wins a comparison: smaller value, then smaller index.
#[inline]
fn better(a: (f32, u32), b: (f32, u32)) -> (f32, u32) {
    if b.0 < a.0 || (b.0 == a.0 && b.1 < a.1) {
        b
    } else {
        a
    }
}

/// Tree-reduces the lanes of one work group; the result lands in lane 0.
fn reduce_group(values: &mut [f32], indexes: &mut [u32]) {
    let mut offset = values.len() / 2;
    while offset > 0 {
        for lane in 0..offset {
            let (v, i) = better((values[lane], indexes[lane]), (values[lane + offset], indexes[lane + offset]));
            values[lane] = v;
            indexes[lane] = i;
        }
        offset /= 2;
    }
}

/// Runs one min-reduction dispatch of `groups` groups of `local` lanes.
fn reduce_dispatch(
    src_values: &[f32],
    src_indexes: Option<&[u32]>,
    elements: usize,
    local: usize,
    dst_values: &mut [f32],
    dst_indexes: &mut [u32],
) {
    dst_values
        .par_iter_mut()
        .zip(dst_indexes.par_iter_mut())
        .enumerate()
        .for_each_init(
            || (vec![0.0f32; local], vec![0u32; local]),
            |(lane_values, lane_indexes), (group, (out_value, out_index))| {
                for lane in 0..local {
                    let gid = group * local + lane;
                    if gid < elements {
                        lane_values[lane] = src_values[gid];
                        lane_indexes[lane] = src_indexes.map_or(gid as u32, |idx| idx[gid]);
                    } else {
                        lane_values[lane] = FLT_MAX;
                        lane_indexes[lane] = NO_INDEX;
                    }
                }
                reduce_group(lane_values, lane_indexes);
                *out_value = lane_values[0];
                *out_index = lane_indexes[0];
            },
        );
}

impl SomKernels for CpuKernels {
    fn upload_grid(&mut self, data: &[f32]) -> SomResult<()> {
        if data.len() != self.som.len() {
            return Err(SomError::shape_mismatch(&[self.som.len()], &[data.len()]));
        }
        self.som.copy_from_slice(data);
        Ok(())
    }

    fn download_grid(&mut self, out: &mut [f32]) -> SomResult<()> {
        if out.len() != self.som.len() {
            return Err(SomError::shape_mismatch(&[self.som.len()], &[out.len()]));
        }
        out.copy_from_slice(&self.som);
        Ok(())
    }

    fn upload_training_vectors(&mut self, data: &[f32], count: usize) -> SomResult<()> {
        let expected = count * self.defines.neuron_stride;
        if data.len() != expected {
            return Err(SomError::shape_mismatch(&[expected], &[data.len()]));
        }
        self.inputs.clear();
        self.inputs.extend_from_slice(data);
        self.input_count = count;
        Ok(())
    }

    fn begin_step(&mut self, params: &StepParams) -> SomResult<()> {
        if params.vector_index >= self.input_count {
            return Err(SomError::validation(format!(
                "training vector {} not uploaded ({} available)",
                params.vector_index, self.input_count
            )));
        }
        self.step = Some(*params);
        Ok(())
    }

    fn calculate_distances(&mut self) -> SomResult<()> {
        let step = self.current_step("calculate_distances")?;
        let stride = self.defines.neuron_stride;
        let half = self.defines.x_dim;
        let sequential = self.defines.cpu;
        let sample = self.sample(&step).to_vec();

        self.distances
            .par_iter_mut()
            .zip(self.som.par_chunks_exact(stride))
            .for_each_init(
                || vec![0.0f32; half],
                |lanes, (out, neuron)| {
                    if sequential {
                        *out = neuron
                            .iter()
                            .zip(&sample)
                            .map(|(n, s)| (s - n) * (s - n))
                            .sum();
                        return;
                    }
                    for (lane, slot) in lanes.iter_mut().enumerate() {
                        let a = sample[lane] - neuron[lane];
                        let b = sample[lane + half] - neuron[lane + half];
                        *slot = a * a + b * b;
                    }
                    let mut offset = half / 2;
                    while offset > 0 {
                        for lane in 0..offset {
                            lanes[lane] += lanes[lane + offset];
                        }
                        offset /= 2;
                    }
                    *out = lanes[0];
                },
            );
        Ok(())
    }

    fn find_local_minima(&mut self) -> SomResult<()> {
        let local = self.plan.reduction.local[0];
        let groups = self.plan.reduced_elems;
        let [values, _] = &mut self.values;
        let [indexes, _] = &mut self.indexes;
        reduce_dispatch(
            &self.distances,
            None,
            self.distances.len(),
            local,
            &mut values[..groups],
            &mut indexes[..groups],
        );
        Ok(())
    }

    fn find_global_min(&mut self, index: usize, round: &ReductionRound) -> SomResult<()> {
        let source = ReductionRound::source_slot(index);
        let local = round.geometry.local[0];
        let groups = round.output_elements;

        let [values_0, values_1] = &mut self.values;
        let [indexes_0, indexes_1] = &mut self.indexes;
        let (src_v, src_i, dst_v, dst_i) = if source == 0 {
            (&*values_0, &*indexes_0, values_1, indexes_1)
        } else {
            (&*values_1, &*indexes_1, values_0, indexes_0)
        };
        if groups > dst_v.len() || round.elements > src_v.len() {
            return Err(SomError::invariant(format!(
                "round {index} needs {} inputs and {groups} outputs, buffers hold {}",
                round.elements,
                src_v.len()
            )));
        }
        reduce_dispatch(
            src_v,
            Some(src_i.as_slice()),
            round.elements,
            local,
            &mut dst_v[..groups],
            &mut dst_i[..groups],
        );
        Ok(())
    }

    fn update_network(&mut self, update: &UpdateGeometry) -> SomResult<()> {
        let step = self.current_step("update_network")?;
        let shape: GridShape = self.plan.shape;
        let (wx, wy, wz) = shape.coords(self.winner_index()?);
        let radius = update.radius;
        let r = radius as i64;

        let origin = |w: usize, dim: usize, window: usize| -> usize {
            (w as i64 - r).clamp(0, (dim - window) as i64) as usize
        };
        let lo = [
            origin(wx, shape.width, update.window[0]),
            origin(wy, shape.height, update.window[1]),
            origin(wz, shape.depth, update.window[2]),
        ];
        let hi = [lo[0] + update.window[0], lo[1] + update.window[1], lo[2] + update.window[2]];

        let stride = self.defines.neuron_stride;
        let features = self.defines.neuron_size;
        let neighborhood = self.defines.variant.neighborhood;
        let weighting = self.defines.variant.weighting;
        let sigma_sq = step.sigma_sq;
        let learn_rate = step.learn_rate;
        let sample = self.sample(&step).to_vec();

        self.som
            .par_chunks_exact_mut(stride)
            .enumerate()
            .for_each(|(i, neuron)| {
                let (x, y, z) = shape.coords(i);
                if x < lo[0] || x >= hi[0] || y < lo[1] || y >= hi[1] || z < lo[2] || z >= hi[2] {
                    return;
                }
                let (dx, dy, dz) = (x as i64 - wx as i64, y as i64 - wy as i64, z as i64 - wz as i64);
                if !neighborhood.within(dx, dy, dz, radius) {
                    return;
                }
                let d_sq = weighting.distance_sq(dx, dy, dz) as f32;
                let weight = learn_rate * (-d_sq / (2.0 * sigma_sq)).exp();
                for (n, s) in neuron[..features].iter_mut().zip(&sample) {
                    *n += weight * (s - *n);
                }
            });
        Ok(())
    }

    fn end_step(&mut self) -> SomResult<()> {
        Ok(())
    }

    fn flush(&mut self) -> SomResult<()> {
        Ok(())
    }

    fn finish(&mut self) -> SomResult<()> {
        Ok(())
    }

    fn read_winner(&mut self) -> SomResult<(usize, f32)> {
        let index = self.winner_index()?;
        Ok((index, self.values[self.plan.winner_slot()][0]))
    }

    fn read_distances(&mut self) -> SomResult<Vec<f32>> {
        Ok(self.distances.clone())
    }
}
