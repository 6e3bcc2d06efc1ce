//! Compute pipeline management.
//!
//! WGSL fixes the work-group size per module, so the cache keys pipelines
//! by `(stage, size)`. Every size the dispatch plan can ask for is compiled
//! when the cache is built; shader errors surface at construction instead
//! of halfway through a training run.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::device::KernelDefines;
use crate::dispatch::DispatchPlan;
use crate::error::{SomError, SomResult};
use crate::gpu::shaders;
use crate::gpu::uniforms::RoundUniforms;
use crate::profile::KernelStage;

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32, has_dynamic_offset: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset,
            min_binding_size: wgpu::BufferSize::new(RoundUniforms::size_bytes() as u64),
        },
        count: None,
    }
}

/// Bind group layouts of the four kernels.
pub struct StageLayouts {
    /// `calculate_distances`
    pub distance: wgpu::BindGroupLayout,
    /// `find_global_first_pass`
    pub local_min: wgpu::BindGroupLayout,
    /// `find_global_min`
    pub global_min: wgpu::BindGroupLayout,
    /// `update_network`
    pub update: wgpu::BindGroupLayout,
}

impl StageLayouts {
    /// Creates all four layouts.
    pub fn new(device: &wgpu::Device) -> Self {
        let distance = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("calculate_distances layout"),
            entries: &[
                // Grid
                storage_entry(0, true),
                // Training vectors
                storage_entry(1, true),
                // Distances
                storage_entry(2, false),
                // Step uniforms
                uniform_entry(3, false),
            ],
        });
        let local_min = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("find_global_first_pass layout"),
            entries: &[
                // Distances
                storage_entry(0, true),
                // Output values
                storage_entry(1, false),
                // Output indexes
                storage_entry(2, false),
            ],
        });
        let global_min = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("find_global_min layout"),
            entries: &[
                // Input values
                storage_entry(0, true),
                // Input indexes
                storage_entry(1, true),
                // Output values
                storage_entry(2, false),
                // Output indexes
                storage_entry(3, false),
                // Round uniforms, one 256-byte slot per round
                uniform_entry(4, true),
            ],
        });
        let update = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("update_network layout"),
            entries: &[
                // Grid
                storage_entry(0, false),
                // Training vectors
                storage_entry(1, true),
                // Winner indexes
                storage_entry(2, true),
                // Step uniforms
                uniform_entry(3, false),
            ],
        });

        Self {
            distance,
            local_min,
            global_min,
            update,
        }
    }

    fn for_stage(&self, stage: KernelStage) -> &wgpu::BindGroupLayout {
        match stage {
            KernelStage::Distance => &self.distance,
            KernelStage::LocalMin => &self.local_min,
            KernelStage::GlobalMin => &self.global_min,
            KernelStage::Update => &self.update,
        }
    }
}

/// Compiled pipelines for one grid, keyed by stage and work-group size.
///
/// For the 2-D stages the size key is the work-group height; for the
/// reductions it is the group length.
pub struct PipelineCache {
    device: Arc<wgpu::Device>,
    /// Bind group layouts shared with the buffer set.
    pub layouts: StageLayouts,
    pipelines: HashMap<(KernelStage, usize), wgpu::ComputePipeline>,
}

impl PipelineCache {
    /// Compiles every pipeline `plan` can dispatch.
    ///
    /// # Errors
    ///
    /// [`SomError::ShaderError`] naming the entry point if a module or
    /// pipeline fails validation.
    pub fn build(device: Arc<wgpu::Device>, defines: &KernelDefines, plan: &DispatchPlan) -> SomResult<Self> {
        let layouts = StageLayouts::new(&device);
        let mut cache = Self {
            device,
            layouts,
            pipelines: HashMap::new(),
        };

        cache.compile(
            KernelStage::Distance,
            plan.distance.local[1],
            shaders::distance_shader(defines, plan.distance.local[1]),
        )?;
        cache.compile(
            KernelStage::LocalMin,
            plan.group_size,
            shaders::local_min_shader(defines, plan.group_size),
        )?;
        for size in plan.round_group_sizes() {
            cache.compile(KernelStage::GlobalMin, size, shaders::global_min_shader(size))?;
        }
        for height in plan.update_group_heights() {
            cache.compile(KernelStage::Update, height, shaders::update_shader(defines, height))?;
        }

        debug!("Compiled {} SOM pipelines", cache.pipelines.len());
        Ok(cache)
    }

    fn compile(&mut self, stage: KernelStage, size: usize, source: String) -> SomResult<()> {
        let entry_point = stage.entry_point();
        let label = format!("{entry_point} ({size})");

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&label),
            bind_group_layouts: &[self.layouts.for_stage(stage)],
            push_constant_ranges: &[],
        });

        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&label),
            layout: Some(&layout),
            module: &module,
            entry_point: Some(entry_point),
            compilation_options: Default::default(),
            cache: None,
        });

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(SomError::shader(label, err.to_string()));
        }

        self.pipelines.insert((stage, size), pipeline);
        Ok(())
    }

    /// Pipeline for `stage` at `size`.
    pub fn get(&self, stage: KernelStage, size: usize) -> SomResult<&wgpu::ComputePipeline> {
        self.pipelines.get(&(stage, size)).ok_or_else(|| {
            SomError::invariant(format!("no {} pipeline for work-group size {size}", stage.entry_point()))
        })
    }

    /// Number of compiled pipelines.
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// Is empty?
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

impl std::fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.pipelines.keys().copied().collect();
        keys.sort_by_key(|(stage, size)| (*stage as usize, *size));
        f.debug_struct("PipelineCache").field("pipelines", &keys).finish()
    }
}
