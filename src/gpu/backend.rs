//! GPU Backend initialization and device management.
//!
//! This module provides [`WgpuBackend`] for initializing and managing
//! the wgpu device and queue, and for building SOM kernels on it.

use std::sync::Arc;

use log::{error, info};

use crate::device::{ComputeDevice, DeviceClass, DeviceInfo, KernelDefines};
use crate::dispatch::DispatchPlan;
use crate::error::{SomError, SomResult};
use crate::gpu::kernels::GpuSomKernels;

/// Power preference for GPU adapter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerPreference {
    /// Prefer low power consumption (integrated GPU).
    LowPower,
    /// Prefer high performance (discrete GPU).
    #[default]
    HighPerformance,
}

impl From<PowerPreference> for wgpu::PowerPreference {
    fn from(pref: PowerPreference) -> Self {
        match pref {
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
        }
    }
}

/// Options for initializing the wgpu backend.
#[derive(Debug, Clone)]
pub struct WgpuOptions {
    /// Power preference for adapter selection.
    pub power_preference: PowerPreference,
    /// Preferred backend (Vulkan, DX12, Metal, etc.).
    /// If None, wgpu will auto-select the best available.
    pub backend: Option<wgpu::Backends>,
    /// Force a specific adapter by name (substring match).
    pub force_adapter_name: Option<String>,
    /// Required features.
    pub required_features: wgpu::Features,
    /// Minimum limits the adapter must support.
    pub required_limits: wgpu::Limits,
    /// Request the adapter's full limits instead of `required_limits`.
    ///
    /// The wgpu defaults cap work groups at 256 invocations; large groups
    /// need the adapter's real limits.
    pub use_adapter_limits: bool,
}

impl Default for WgpuOptions {
    fn default() -> Self {
        Self {
            power_preference: PowerPreference::HighPerformance,
            backend: None,
            force_adapter_name: None,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            use_adapter_limits: true,
        }
    }
}

impl WgpuOptions {
    /// Options for large grids: 1GB storage bindings and 256-wide groups.
    pub fn compute() -> Self {
        Self {
            required_limits: wgpu::Limits {
                max_storage_buffer_binding_size: 1 << 30, // 1GB
                max_buffer_size: 1 << 30,
                max_compute_workgroup_size_x: 256,
                max_compute_workgroup_size_y: 256,
                max_compute_invocations_per_workgroup: 256,
                ..wgpu::Limits::default()
            },
            ..Self::default()
        }
    }

    /// Creates options for low-power or downlevel adapters.
    pub fn low_power() -> Self {
        Self {
            power_preference: PowerPreference::LowPower,
            required_limits: wgpu::Limits::downlevel_defaults(),
            use_adapter_limits: false,
            ..Self::default()
        }
    }
}

/// The main GPU backend struct.
///
/// Holds the wgpu device, queue, and adapter info. Pass it to
/// [`SomTrainer::new`](crate::SomTrainer::new) to train on the GPU.
///
/// # Example
///
/// ```rust,no_run
/// use somgrid::gpu::{WgpuBackend, WgpuOptions};
/// use somgrid::{SomConfig, SomTrainer};
///
/// # fn main() -> Result<(), somgrid::SomError> {
/// let backend = WgpuBackend::init(WgpuOptions::default())?;
/// println!("Using GPU: {}", backend.adapter_info().name);
///
/// let trainer = SomTrainer::new(SomConfig::cube(8, 3), &backend)?;
/// assert_eq!(trainer.radius(), 7);
/// # Ok(())
/// # }
/// ```
pub struct WgpuBackend {
    /// The wgpu instance.
    pub instance: wgpu::Instance,
    /// The selected adapter.
    pub adapter: wgpu::Adapter,
    /// The wgpu device for resource creation.
    pub device: Arc<wgpu::Device>,
    /// The wgpu queue for command submission.
    pub queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
    info: DeviceInfo,
}

impl WgpuBackend {
    /// Initializes the GPU backend with the given options.
    ///
    /// # Errors
    ///
    /// - [`SomError::AdapterNotFound`] - No suitable GPU adapter found.
    /// - [`SomError::UnsupportedLimits`] - The adapter is below `required_limits`.
    /// - [`SomError::DeviceRequestFailed`] - Failed to create the device.
    pub fn init(options: WgpuOptions) -> SomResult<Self> {
        let backends = options.backend.unwrap_or(wgpu::Backends::all());
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = pollster::block_on(Self::request_adapter(&instance, &options))?;
        let adapter_info = adapter.get_info();

        info!(
            "Selected GPU adapter: {} ({:?})",
            adapter_info.name, adapter_info.backend
        );

        let adapter_limits = adapter.limits();
        Self::check_limits(&adapter_limits, &options.required_limits)?;

        let requested = if options.use_adapter_limits {
            adapter_limits
        } else {
            options.required_limits.clone()
        };
        let (device, queue) = pollster::block_on(Self::request_device(&adapter, &options, requested))?;

        // Errors outside an error scope would otherwise panic.
        device.on_uncaptured_error(Box::new(|err| {
            error!("Uncaptured wgpu error: {err}");
        }));

        let limits = device.limits();
        let info = Self::device_info(&adapter_info, &limits);
        info!(
            "Device limits: {} invocations per group, {:?} group size, {} bytes shared",
            info.max_group_size, info.max_workgroup_size, info.max_shared_memory_bytes
        );

        Ok(Self {
            instance,
            adapter,
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            limits,
            info,
        })
    }

    async fn request_adapter(
        instance: &wgpu::Instance,
        options: &WgpuOptions,
    ) -> SomResult<wgpu::Adapter> {
        if let Some(ref name_filter) = options.force_adapter_name {
            let wanted = name_filter.to_lowercase();
            return instance
                .enumerate_adapters(options.backend.unwrap_or(wgpu::Backends::all()))
                .into_iter()
                .find(|a| a.get_info().name.to_lowercase().contains(&wanted))
                .ok_or_else(|| {
                    SomError::adapter_not_found(format!("No adapter matching '{name_filter}' found"))
                });
        }

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference.into(),
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await;

        match adapter {
            Some(a) => Ok(a),
            None => instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::None,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .ok_or_else(|| {
                    SomError::adapter_not_found(
                        "No GPU adapters available. Ensure GPU drivers are installed.",
                    )
                }),
        }
    }

    async fn request_device(
        adapter: &wgpu::Adapter,
        options: &WgpuOptions,
        limits: wgpu::Limits,
    ) -> SomResult<(wgpu::Device, wgpu::Queue)> {
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("somgrid device"),
                    required_features: options.required_features,
                    required_limits: limits,
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;

        Ok((device, queue))
    }

    fn check_limits(adapter: &wgpu::Limits, required: &wgpu::Limits) -> SomResult<()> {
        let checks = [
            (
                "max_storage_buffer_binding_size",
                adapter.max_storage_buffer_binding_size as u64,
                required.max_storage_buffer_binding_size as u64,
            ),
            ("max_buffer_size", adapter.max_buffer_size, required.max_buffer_size),
            (
                "max_compute_workgroup_size_x",
                adapter.max_compute_workgroup_size_x as u64,
                required.max_compute_workgroup_size_x as u64,
            ),
            (
                "max_compute_invocations_per_workgroup",
                adapter.max_compute_invocations_per_workgroup as u64,
                required.max_compute_invocations_per_workgroup as u64,
            ),
        ];
        for (name, has, needs) in checks {
            if has < needs {
                return Err(SomError::unsupported_limits(format!(
                    "{name}: adapter has {has}, required {needs}"
                )));
            }
        }
        Ok(())
    }

    /// Translates wgpu limits into the planner's view of the device.
    pub fn device_info(adapter: &wgpu::AdapterInfo, limits: &wgpu::Limits) -> DeviceInfo {
        let class = if adapter.device_type == wgpu::DeviceType::Cpu {
            DeviceClass::Cpu
        } else {
            DeviceClass::Accelerator
        };
        DeviceInfo {
            name: adapter.name.clone(),
            class,
            max_group_size: limits.max_compute_invocations_per_workgroup as usize,
            max_workgroup_size: [
                limits.max_compute_workgroup_size_x as usize,
                limits.max_compute_workgroup_size_y as usize,
                limits.max_compute_workgroup_size_z as usize,
            ],
            max_workgroups_per_dim: limits.max_compute_workgroups_per_dimension as usize,
            max_shared_memory_bytes: limits.max_compute_workgroup_storage_size as usize,
        }
    }

    /// Returns information about the selected adapter.
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Returns the device limits.
    pub fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }

    /// Returns the maximum storage buffer size in bytes.
    pub fn max_storage_buffer_size(&self) -> u64 {
        self.limits.max_storage_buffer_binding_size as u64
    }

    /// Returns whether a buffer size (in bytes) is supported.
    pub fn supports_buffer_size(&self, size_bytes: u64) -> bool {
        size_bytes <= self.max_storage_buffer_size()
    }

    /// Checks that the grid buffer of `plan` fits one storage binding.
    pub fn validate_grid(&self, plan: &DispatchPlan) -> SomResult<()> {
        let floats = plan.shape.total() * plan.neuron_size_rounded;
        let size_bytes = (floats * std::mem::size_of::<f32>()) as u64;
        if !self.supports_buffer_size(size_bytes) {
            return Err(SomError::unsupported_limits(format!(
                "Grid {}x{}x{} with stride {} needs {} bytes, max storage buffer is {} bytes",
                plan.shape.width,
                plan.shape.height,
                plan.shape.depth,
                plan.neuron_size_rounded,
                size_bytes,
                self.max_storage_buffer_size()
            )));
        }
        Ok(())
    }

    /// Polls the device for completed operations.
    pub fn poll(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }
}

impl ComputeDevice for WgpuBackend {
    type Kernels = GpuSomKernels;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn build_kernels(&self, defines: &KernelDefines, plan: &DispatchPlan) -> SomResult<GpuSomKernels> {
        self.validate_grid(plan)?;
        GpuSomKernels::new(Arc::clone(&self.device), Arc::clone(&self.queue), defines, plan)
    }
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("adapter", &self.adapter_info.name)
            .field("backend", &self.adapter_info.backend)
            .field("device_type", &self.adapter_info.device_type)
            .field(
                "max_storage_buffer",
                &self.limits.max_storage_buffer_binding_size,
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default() {
        let opts = WgpuOptions::default();
        assert_eq!(opts.power_preference, PowerPreference::HighPerformance);
        assert!(opts.backend.is_none());
        assert!(opts.use_adapter_limits);
    }

    #[test]
    fn test_options_compute() {
        let opts = WgpuOptions::compute();
        assert!(opts.required_limits.max_storage_buffer_binding_size >= 1 << 30);
        assert_eq!(opts.required_limits.max_compute_invocations_per_workgroup, 256);
    }

    #[test]
    fn test_device_info_from_limits() {
        let adapter = wgpu::AdapterInfo {
            name: "llvmpipe".to_string(),
            vendor: 0,
            device: 0,
            device_type: wgpu::DeviceType::Cpu,
            driver: String::new(),
            driver_info: String::new(),
            backend: wgpu::Backend::Vulkan,
        };
        let limits = wgpu::Limits::default();
        let info = WgpuBackend::device_info(&adapter, &limits);

        assert_eq!(info.class, DeviceClass::Cpu);
        assert_eq!(info.max_group_size, 256);
        assert_eq!(info.max_workgroup_size, [256, 256, 64]);
        assert_eq!(info.max_shared_memory_bytes, 16384);
    }

    #[test]
    fn test_limit_check_reports_shortfall() {
        let adapter = wgpu::Limits::downlevel_defaults();
        let err = WgpuBackend::check_limits(&adapter, &WgpuOptions::compute().required_limits)
            .unwrap_err();
        assert!(matches!(err, SomError::UnsupportedLimits(_)));
    }

    // GPU tests require actual GPU, run with: cargo test --features gpu -- --ignored
    #[test]
    #[ignore = "Requires GPU"]
    fn test_backend_init() {
        let backend = WgpuBackend::init(WgpuOptions::default()).expect("Failed to init backend");
        assert!(!backend.adapter_info().name.is_empty());
        assert!(backend.info().max_group_size >= 1);
    }
}
