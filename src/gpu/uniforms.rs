//! Uniform buffer structures for the SOM shaders.
//!
//! These are `#[repr(C)]` mirrors of the WGSL `uniform` structs. WGSL rounds
//! uniform structs up to 16 bytes, so both are padded to a multiple of one
//! vec4.

use bytemuck::{Pod, Zeroable};

use crate::device::StepParams;

/// Per-step arguments shared by the distance and update kernels.
///
/// # Layout
///
/// Total size: 16 bytes (1 × vec4).
///
/// ```text
/// Offset  Size  Field
/// 0       4     vector_index
/// 4       4     radius
/// 8       4     sigma_sq
/// 12      4     learn_rate
/// ```
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct StepUniforms {
    /// Training vector to read.
    pub vector_index: u32,
    /// Current update radius.
    pub radius: u32,
    /// `sigma²`
    pub sigma_sq: f32,
    /// Learning rate.
    pub learn_rate: f32,
}

impl StepUniforms {
    /// Returns the size in bytes.
    pub const fn size_bytes() -> usize {
        std::mem::size_of::<Self>()
    }
}

impl From<&StepParams> for StepUniforms {
    fn from(step: &StepParams) -> Self {
        Self {
            vector_index: step.vector_index as u32,
            radius: step.radius as u32,
            sigma_sq: step.sigma_sq,
            learn_rate: step.learn_rate,
        }
    }
}

/// Input count of one reduction round.
///
/// One of these is written per round into a single buffer, each at its own
/// 256-byte aligned slot, and selected with a dynamic offset.
///
/// # Layout
///
/// Total size: 16 bytes (1 × vec4).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RoundUniforms {
    /// Candidates entering the round.
    pub elements: u32,
    /// Padding.
    pub _padding: [u32; 3],
}

impl RoundUniforms {
    /// Creates round uniforms.
    pub fn new(elements: usize) -> Self {
        Self {
            elements: elements as u32,
            _padding: [0; 3],
        }
    }

    /// Returns the size in bytes.
    pub const fn size_bytes() -> usize {
        std::mem::size_of::<Self>()
    }
}
