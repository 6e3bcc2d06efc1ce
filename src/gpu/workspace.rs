//! Device buffers of one training grid.
//!
//! [`GpuBufferSet`] owns every buffer the four kernels touch and caches the
//! bind groups that wire them together. Only the training-vector buffer is
//! resized after construction; growing it invalidates the cached groups.

use log::debug;
use wgpu::util::DeviceExt;

use crate::dispatch::{DispatchPlan, ReductionRound};
use crate::error::{SomError, SomResult};
use crate::gpu::pipeline::StageLayouts;
use crate::gpu::uniforms::{RoundUniforms, StepUniforms};
use crate::gpu::{GpuTensor, GPU_BUFFER_ALIGNMENT};

/// Bind groups for one buffer generation.
pub struct BindGroups {
    /// `calculate_distances`
    pub distance: wgpu::BindGroup,
    /// `find_global_first_pass`
    pub local_min: wgpu::BindGroup,
    /// `find_global_min`, indexed by source pair.
    pub global_min: [wgpu::BindGroup; 2],
    /// `update_network`, reading the winner from the plan's final pair.
    pub update: wgpu::BindGroup,
}

/// Buffers for the distance, reduction and update kernels.
///
/// # Buffer Pairs
///
/// The reductions ping-pong between two `(values, indexes)` pairs. The
/// local-minima pass writes pair 0; round `i` reads pair `i % 2` and writes
/// the other. Both pairs hold one entry per local-minima work group.
pub struct GpuBufferSet {
    /// Padded neuron data.
    pub som: GpuTensor,
    /// Padded training vectors.
    pub inputs: GpuTensor,
    /// One squared distance per neuron.
    pub distances: GpuTensor,
    /// Reduction values, two pairs.
    pub values: [GpuTensor; 2],
    /// Reduction indexes, two pairs.
    pub indexes: [GpuTensor; 2],
    step: wgpu::Buffer,
    rounds: wgpu::Buffer,
    winner_slot: usize,
    vector_stride: usize,
    cached: Option<BindGroups>,
    generation: u64,
}

impl GpuBufferSet {
    /// Allocates buffers for `plan`, with room for one training vector.
    pub fn new(device: &wgpu::Device, plan: &DispatchPlan) -> SomResult<Self> {
        let total = plan.shape.total();
        let stride = plan.neuron_size_rounded;
        let reduced = plan.reduced_elems.max(1);

        let som = GpuTensor::zeroed::<f32>(device, total * stride, "som")?;
        let inputs = GpuTensor::zeroed::<f32>(device, stride, "training vectors")?;
        let distances = GpuTensor::zeroed::<f32>(device, total, "distances")?;
        let values = [
            GpuTensor::zeroed::<f32>(device, reduced, "reduction values 0")?,
            GpuTensor::zeroed::<f32>(device, reduced, "reduction values 1")?,
        ];
        let indexes = [
            GpuTensor::zeroed::<u32>(device, reduced, "reduction indexes 0")?,
            GpuTensor::zeroed::<u32>(device, reduced, "reduction indexes 1")?,
        ];

        let step = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("step uniforms"),
            size: StepUniforms::size_bytes() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        // Round counts never change, so every slot is written once here.
        let slot = GPU_BUFFER_ALIGNMENT as usize;
        let mut contents = vec![0u8; plan.rounds.len().max(1) * slot];
        for (i, round) in plan.rounds.iter().enumerate() {
            let uniforms = RoundUniforms::new(round.elements);
            contents[i * slot..i * slot + RoundUniforms::size_bytes()]
                .copy_from_slice(bytemuck::bytes_of(&uniforms));
        }
        let rounds = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("round uniforms"),
            contents: &contents,
            usage: wgpu::BufferUsages::UNIFORM,
        });

        debug!(
            "Allocated SOM buffers: {} neurons x {} floats, {} reduction slots",
            total, stride, reduced
        );

        Ok(Self {
            som,
            inputs,
            distances,
            values,
            indexes,
            step,
            rounds,
            winner_slot: plan.winner_slot(),
            vector_stride: stride,
            cached: None,
            generation: 0,
        })
    }

    /// Grows the training-vector buffer to hold `count` vectors.
    ///
    /// Returns `true` if the buffer was reallocated.
    pub fn ensure_inputs(&mut self, device: &wgpu::Device, count: usize) -> SomResult<bool> {
        let needed = count * self.vector_stride;
        if needed <= self.inputs.len {
            return Ok(false);
        }

        // 1.5x headroom so growing sets don't reallocate every call
        let capacity = (needed * 3 / 2).max(needed);
        self.inputs = GpuTensor::zeroed::<f32>(device, capacity, "training vectors")?;
        self.invalidate_cache();
        Ok(true)
    }

    /// Stages the step uniforms for the next submit.
    pub fn write_step(&self, queue: &wgpu::Queue, uniforms: &StepUniforms) {
        queue.write_buffer(&self.step, 0, bytemuck::bytes_of(uniforms));
    }

    /// Dynamic offset of round `index` in the round uniform buffer.
    pub fn round_offset(index: usize) -> u32 {
        (index as u64 * GPU_BUFFER_ALIGNMENT) as u32
    }

    fn invalidate_cache(&mut self) {
        self.cached = None;
        self.generation += 1;
    }

    /// Returns the current generation (bumped on every reallocation).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Gets or creates the bind groups for the current buffers.
    pub fn bind_groups(&mut self, device: &wgpu::Device, layouts: &StageLayouts) -> SomResult<&BindGroups> {
        if self.cached.is_none() {
            let groups = self.create_bind_groups(device, layouts);
            self.cached = Some(groups);
        }
        self.cached
            .as_ref()
            .ok_or_else(|| SomError::buffer("bind groups missing after rebuild"))
    }

    fn create_bind_groups(&self, device: &wgpu::Device, layouts: &StageLayouts) -> BindGroups {
        fn entry(binding: u32, tensor: &GpuTensor) -> wgpu::BindGroupEntry<'_> {
            wgpu::BindGroupEntry {
                binding,
                resource: tensor.buffer.as_entire_binding(),
            }
        }

        let distance = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("calculate_distances bind group"),
            layout: &layouts.distance,
            entries: &[
                entry(0, &self.som),
                entry(1, &self.inputs),
                entry(2, &self.distances),
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: self.step.as_entire_binding(),
                },
            ],
        });

        let local_min = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("find_global_first_pass bind group"),
            layout: &layouts.local_min,
            entries: &[
                entry(0, &self.distances),
                entry(1, &self.values[0]),
                entry(2, &self.indexes[0]),
            ],
        });

        let global_min = [0, 1].map(|src| {
            let dst = ReductionRound::target_slot(src);
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("find_global_min bind group"),
                layout: &layouts.global_min,
                entries: &[
                    entry(0, &self.values[src]),
                    entry(1, &self.indexes[src]),
                    entry(2, &self.values[dst]),
                    entry(3, &self.indexes[dst]),
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &self.rounds,
                            offset: 0,
                            size: wgpu::BufferSize::new(RoundUniforms::size_bytes() as u64),
                        }),
                    },
                ],
            })
        });

        let update = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("update_network bind group"),
            layout: &layouts.update,
            entries: &[
                entry(0, &self.som),
                entry(1, &self.inputs),
                entry(2, &self.indexes[self.winner_slot]),
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: self.step.as_entire_binding(),
                },
            ],
        });

        BindGroups {
            distance,
            local_min,
            global_min,
            update,
        }
    }

    /// Pair holding the winner once all rounds ran.
    pub fn winner_slot(&self) -> usize {
        self.winner_slot
    }
}

impl std::fmt::Debug for GpuBufferSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBufferSet")
            .field("som", &self.som)
            .field("inputs", &self.inputs)
            .field("distances", &self.distances)
            .field("winner_slot", &self.winner_slot)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_offsets_are_aligned() {
        assert_eq!(GpuBufferSet::round_offset(0), 0);
        assert_eq!(GpuBufferSet::round_offset(1), 256);
        assert_eq!(GpuBufferSet::round_offset(3) as u64 % GPU_BUFFER_ALIGNMENT, 0);
    }
}
