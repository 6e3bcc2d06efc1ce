//! Device buffer with upload and blocking readback helpers.
//!
//! [`GpuTensor`] wraps a storage buffer with its element count. It holds
//! `f32` neuron data as well as the `u32` winner indexes, so transfers are
//! generic over any [`Pod`] element.

use bytemuck::Pod;

use crate::config::ConfigError;
use crate::error::{DeviceErrorCode, SomError, SomResult};
use crate::gpu::{exceeds_vram_limit, MAX_VRAM_ALLOC};

/// A device-resident storage buffer.
///
/// # Memory Layout
///
/// Elements are stored contiguously in host order; the grid buffer uses
/// the same padded layout as [`SomGrid`](crate::SomGrid).
pub struct GpuTensor {
    /// The underlying wgpu buffer.
    pub buffer: wgpu::Buffer,
    /// Number of elements.
    pub len: usize,
    /// Size of one element in bytes.
    pub elem_size: usize,
    label: &'static str,
}

impl GpuTensor {
    /// Creates a zero-initialized tensor of `len` elements of `T`.
    ///
    /// wgpu zero-fills new buffers, so no upload is needed.
    pub fn zeroed<T: Pod>(device: &wgpu::Device, len: usize, label: &'static str) -> SomResult<Self> {
        let elem_size = std::mem::size_of::<T>();
        // zero-sized bindings are invalid; keep at least one element
        let size_bytes = (len.max(1) * elem_size) as u64;
        Self::check_size(size_bytes, label)?;

        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size_bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        Ok(Self {
            buffer,
            len,
            elem_size,
            label,
        })
    }

    fn check_size(size_bytes: u64, label: &str) -> SomResult<()> {
        if exceeds_vram_limit(size_bytes) {
            return Err(ConfigError::GridTooLarge(format!(
                "{label} needs {size_bytes} bytes, limit is {MAX_VRAM_ALLOC}"
            ))
            .into());
        }
        Ok(())
    }

    /// Overwrites the first `data.len()` elements.
    ///
    /// The write is staged on the queue and lands before the next submit.
    pub fn write<T: Pod>(&self, queue: &wgpu::Queue, data: &[T]) -> SomResult<()> {
        if std::mem::size_of::<T>() != self.elem_size || data.len() > self.len {
            return Err(SomError::shape_mismatch(&[self.len], &[data.len()]));
        }
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(data));
        Ok(())
    }

    /// Reads the whole tensor back. Blocks until the copy completes.
    pub fn download<T: Pod>(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> SomResult<Vec<T>> {
        self.download_prefix(device, queue, self.len)
    }

    /// Reads the first `count` elements back. Blocks until the copy completes.
    pub fn download_prefix<T: Pod>(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        count: usize,
    ) -> SomResult<Vec<T>> {
        if std::mem::size_of::<T>() != self.elem_size || count > self.len {
            return Err(SomError::shape_mismatch(&[self.len], &[count]));
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let size_bytes = (count * self.elem_size) as u64;

        // Create staging buffer for readback
        let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuTensor staging (download)"),
            size: size_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("GpuTensor download encoder"),
        });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging_buffer, 0, size_bytes);
        queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            // receiver outlives the poll below
            let _ = tx.send(result);
        });

        device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|e| {
                SomError::device(self.label, DeviceErrorCode::MapFailed, format!("map callback dropped: {e}"))
            })?
            .map_err(|e| SomError::device(self.label, DeviceErrorCode::MapFailed, format!("{e:?}")))?;

        let data = {
            let mapped = buffer_slice.get_mapped_range();
            bytemuck::cast_slice(&mapped).to_vec()
        };
        staging_buffer.unmap();

        Ok(data)
    }

    /// Returns the size in bytes.
    pub fn size_bytes(&self) -> u64 {
        (self.len * self.elem_size) as u64
    }
}

impl std::fmt::Debug for GpuTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuTensor")
            .field("label", &self.label)
            .field("len", &self.len)
            .field("elem_size", &self.elem_size)
            .finish()
    }
}
