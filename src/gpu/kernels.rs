//! wgpu implementation of the training kernels.
//!
//! Each step records its dispatches into one command encoder and submits
//! it from [`SomKernels::end_step`]. Step uniforms are staged with
//! `write_buffer`, which lands before the next submit, so consecutive steps
//! never observe each other's arguments.

use std::sync::Arc;

use log::{debug, trace};

use crate::device::{KernelDefines, SomKernels, StepParams};
use crate::dispatch::{DispatchPlan, ReductionRound, UpdateGeometry};
use crate::error::{DeviceErrorCode, SomError, SomResult};
use crate::gpu::pipeline::PipelineCache;
use crate::gpu::uniforms::StepUniforms;
use crate::gpu::workspace::{BindGroups, GpuBufferSet};
use crate::profile::KernelStage;

/// Runs `f` inside out-of-memory and validation error scopes.
///
/// wgpu reports most failures asynchronously; popping the scopes turns
/// them into a [`SomError::Device`] attributed to `operation`.
pub(crate) fn scoped<T>(
    device: &wgpu::Device,
    operation: &'static str,
    f: impl FnOnce() -> SomResult<T>,
) -> SomResult<T> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let result = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let oom = pollster::block_on(device.pop_error_scope());

    let value = result?;
    if let Some(err) = oom {
        return Err(SomError::device(operation, DeviceErrorCode::OutOfMemory, err.to_string()));
    }
    if let Some(err) = validation {
        return Err(SomError::device(operation, DeviceErrorCode::Validation, err.to_string()));
    }
    Ok(value)
}

fn encode_dispatch(
    encoder: &mut wgpu::CommandEncoder,
    stage: KernelStage,
    pipeline: &wgpu::ComputePipeline,
    bind_group: &wgpu::BindGroup,
    offsets: &[u32],
    workgroups: [u32; 3],
) {
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some(stage.entry_point()),
        timestamp_writes: None,
    });
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, bind_group, offsets);
    pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
}

/// Compiled SOM kernels on a wgpu device.
pub struct GpuSomKernels {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipelines: PipelineCache,
    buffers: GpuBufferSet,
    plan: DispatchPlan,
    encoder: Option<wgpu::CommandEncoder>,
    pending: Vec<&'static str>,
    vector_count: usize,
}

impl GpuSomKernels {
    /// Compiles the pipelines and allocates the buffers for `plan`.
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        defines: &KernelDefines,
        plan: &DispatchPlan,
    ) -> SomResult<Self> {
        let pipelines = PipelineCache::build(Arc::clone(&device), defines, plan)?;
        let buffers = scoped(&device, "allocate", || GpuBufferSet::new(&device, plan))?;
        debug!("GPU kernels ready: {:?}", pipelines);

        Ok(Self {
            device,
            queue,
            pipelines,
            buffers,
            plan: plan.clone(),
            encoder: None,
            pending: Vec::new(),
            vector_count: 0,
        })
    }

    fn encode(
        &mut self,
        stage: KernelStage,
        size: usize,
        workgroups: [u32; 3],
        offsets: &[u32],
        select: impl FnOnce(&BindGroups) -> &wgpu::BindGroup,
    ) -> SomResult<()> {
        let pipeline = self.pipelines.get(stage, size)?;
        let groups = self.buffers.bind_groups(&self.device, &self.pipelines.layouts)?;
        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("SOM step encoder"),
            })
        });
        encode_dispatch(encoder, stage, pipeline, select(groups), offsets, workgroups);
        self.pending.push(stage.entry_point());
        Ok(())
    }

    fn submit(&mut self) -> SomResult<()> {
        let Some(encoder) = self.encoder.take() else {
            return Ok(());
        };
        let pending = std::mem::take(&mut self.pending);
        let operation = pending.last().copied().unwrap_or("submit");
        trace!("Submitting {}", pending.join(", "));

        let queue = &self.queue;
        scoped(&self.device, operation, || {
            queue.submit(std::iter::once(encoder.finish()));
            Ok(())
        })
        .map_err(|err| match err {
            SomError::Device {
                operation,
                code,
                message,
            } => SomError::Device {
                operation,
                code,
                message: format!("{message} (queued: {})", pending.join(", ")),
            },
            other => other,
        })
    }

    /// The buffers bound to the kernels.
    pub fn buffers(&self) -> &GpuBufferSet {
        &self.buffers
    }

    /// The compiled pipelines.
    pub fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }
}

impl SomKernels for GpuSomKernels {
    fn upload_grid(&mut self, data: &[f32]) -> SomResult<()> {
        if data.len() != self.buffers.som.len {
            return Err(SomError::shape_mismatch(&[self.buffers.som.len], &[data.len()]));
        }
        self.submit()?;
        self.buffers.som.write(&self.queue, data)?;
        self.flush()
    }

    fn download_grid(&mut self, out: &mut [f32]) -> SomResult<()> {
        if out.len() != self.buffers.som.len {
            return Err(SomError::shape_mismatch(&[self.buffers.som.len], &[out.len()]));
        }
        self.flush()?;
        let data: Vec<f32> = self.buffers.som.download(&self.device, &self.queue)?;
        out.copy_from_slice(&data);
        Ok(())
    }

    fn upload_training_vectors(&mut self, data: &[f32], count: usize) -> SomResult<()> {
        let stride = self.plan.neuron_size_rounded;
        if data.len() != count * stride {
            return Err(SomError::shape_mismatch(&[count, stride], &[data.len()]));
        }
        self.submit()?;
        let device = Arc::clone(&self.device);
        let buffers = &mut self.buffers;
        scoped(&device, "upload_training_vectors", || {
            if buffers.ensure_inputs(&device, count)? {
                debug!("Training vector buffer grown to {} floats", buffers.inputs.len);
            }
            Ok(())
        })?;
        self.buffers.inputs.write(&self.queue, data)?;
        self.vector_count = count;
        Ok(())
    }

    fn begin_step(&mut self, params: &StepParams) -> SomResult<()> {
        if params.vector_index >= self.vector_count {
            return Err(SomError::validation(format!(
                "training vector {} requested, {} uploaded",
                params.vector_index, self.vector_count
            )));
        }
        // a step left open would read these uniforms instead of its own
        self.submit()?;
        self.buffers.write_step(&self.queue, &StepUniforms::from(params));
        Ok(())
    }

    fn calculate_distances(&mut self) -> SomResult<()> {
        let geometry = self.plan.distance;
        self.encode(
            KernelStage::Distance,
            geometry.local[1],
            geometry.workgroups(),
            &[],
            |groups| &groups.distance,
        )
    }

    fn find_local_minima(&mut self) -> SomResult<()> {
        let geometry = self.plan.reduction;
        self.encode(
            KernelStage::LocalMin,
            geometry.local[0],
            geometry.workgroups(),
            &[],
            |groups| &groups.local_min,
        )
    }

    fn find_global_min(&mut self, index: usize, round: &ReductionRound) -> SomResult<()> {
        let source = ReductionRound::source_slot(index);
        self.encode(
            KernelStage::GlobalMin,
            round.geometry.local[0],
            round.geometry.workgroups(),
            &[GpuBufferSet::round_offset(index)],
            |groups| &groups.global_min[source],
        )
    }

    fn update_network(&mut self, update: &UpdateGeometry) -> SomResult<()> {
        self.encode(
            KernelStage::Update,
            update.geometry.local[1],
            update.geometry.workgroups(),
            &[],
            |groups| &groups.update,
        )
    }

    fn end_step(&mut self) -> SomResult<()> {
        self.submit()
    }

    fn flush(&mut self) -> SomResult<()> {
        self.submit()?;
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn finish(&mut self) -> SomResult<()> {
        self.flush()
    }

    fn read_winner(&mut self) -> SomResult<(usize, f32)> {
        self.flush()?;
        let slot = self.buffers.winner_slot();
        let values: Vec<f32> = self.buffers.values[slot].download_prefix(&self.device, &self.queue, 1)?;
        let indexes: Vec<u32> = self.buffers.indexes[slot].download_prefix(&self.device, &self.queue, 1)?;
        match (indexes.first(), values.first()) {
            (Some(&index), Some(&value)) if index != u32::MAX => Ok((index as usize, value)),
            _ => Err(SomError::invariant("reduction produced no winner")),
        }
    }

    fn read_distances(&mut self) -> SomResult<Vec<f32>> {
        self.flush()?;
        self.buffers.distances.download(&self.device, &self.queue)
    }
}

impl std::fmt::Debug for GpuSomKernels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuSomKernels")
            .field("pipelines", &self.pipelines)
            .field("buffers", &self.buffers)
            .field("pending", &self.pending)
            .finish()
    }
}
