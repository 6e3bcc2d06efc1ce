//! Host copy of the neuron grid.
//!
//! Neurons are stored in one contiguous, cache-line aligned float buffer.
//! Neuron `(x, y, z)` starts at float offset
//! `(x + width * (y + height * z)) * neuron_size_rounded`, so x varies
//! fastest. This is also the layout the device buffers use, which lets
//! uploads and downloads copy the buffer verbatim.
//!
//! Only the first `neuron_size` floats of each neuron are features; the
//! rest is zero padding up to the next power of two. The accessors here
//! never hand out the padding.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::buffer::AlignedBuffer;
use crate::config::{ConfigError, SomConfig};
use crate::dispatch::round_up_power2;
use crate::error::{SomError, SomResult};

/// Grid dimensions in neurons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GridShape {
    /// Extent along x.
    pub width: usize,
    /// Extent along y.
    pub height: usize,
    /// Extent along z.
    pub depth: usize,
}

impl GridShape {
    /// Creates a shape.
    pub const fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Shape of the grid described by `config`.
    pub fn of(config: &SomConfig) -> Self {
        Self::new(config.width, config.height, config.depth)
    }

    /// Number of neurons.
    #[inline]
    pub fn total(&self) -> usize {
        self.width * self.height * self.depth
    }

    /// Flat index of `(x, y, z)`.
    #[inline]
    pub fn flat_index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.width * (y + self.height * z)
    }

    /// Inverse of [`flat_index`](Self::flat_index).
    #[inline]
    pub fn coords(&self, index: usize) -> (usize, usize, usize) {
        let x = index % self.width;
        let y = (index / self.width) % self.height;
        let z = index / (self.width * self.height);
        (x, y, z)
    }

    /// True if `(x, y, z)` lies inside the grid.
    #[inline]
    pub fn contains(&self, x: usize, y: usize, z: usize) -> bool {
        x < self.width && y < self.height && z < self.depth
    }

    /// Radius that covers the whole grid from any neuron:
    /// `max(width-1, height-1, depth-1)`.
    pub fn max_radius(&self) -> usize {
        self.width
            .max(self.height)
            .max(self.depth)
            .saturating_sub(1)
    }

    /// Dimensions as a slice, for error reporting.
    pub fn dims(&self) -> [usize; 3] {
        [self.width, self.height, self.depth]
    }
}

/// Best-matching neuron for a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Winner {
    /// Flat index.
    pub index: usize,
    /// x coordinate.
    pub x: usize,
    /// y coordinate.
    pub y: usize,
    /// z coordinate.
    pub z: usize,
    /// Squared Euclidean distance to the sample.
    pub distance: f32,
}

impl Winner {
    /// Decodes a flat index against `shape`.
    pub fn from_index(shape: &GridShape, index: usize, distance: f32) -> Self {
        let (x, y, z) = shape.coords(index);
        Self {
            index,
            x,
            y,
            z,
            distance,
        }
    }
}

/// Host copy of a 3-D neuron grid.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(try_from = "RawGrid"))]
pub struct SomGrid {
    shape: GridShape,
    neuron_size: usize,
    stride: usize,
    data: AlignedBuffer,
}

impl SomGrid {
    /// Zero-filled grid.
    pub fn new(shape: GridShape, neuron_size: usize) -> SomResult<Self> {
        if shape.total() == 0 {
            return Err(ConfigError::InvalidDimension("grid must contain at least one neuron").into());
        }
        if neuron_size == 0 {
            return Err(ConfigError::InvalidDimension("neuron_size must be > 0").into());
        }
        let stride = round_up_power2(neuron_size.max(2))?;
        Ok(Self {
            shape,
            neuron_size,
            stride,
            data: AlignedBuffer::zeroed(shape.total() * stride),
        })
    }

    /// Grid from tightly packed (unpadded) neuron features.
    pub fn from_neurons(shape: GridShape, neuron_size: usize, features: &[f32]) -> SomResult<Self> {
        let mut grid = Self::new(shape, neuron_size)?;
        let expected = shape.total() * neuron_size;
        if features.len() != expected {
            return Err(SomError::shape_mismatch(&[expected], &[features.len()]));
        }
        for (dst, src) in grid
            .data
            .as_mut_slice()
            .chunks_exact_mut(grid.stride)
            .zip(features.chunks_exact(neuron_size))
        {
            dst[..neuron_size].copy_from_slice(src);
        }
        Ok(grid)
    }

    /// Grid shape.
    pub fn shape(&self) -> GridShape {
        self.shape
    }

    /// Feature length.
    pub fn neuron_size(&self) -> usize {
        self.neuron_size
    }

    /// Padded feature stride.
    pub fn neuron_size_rounded(&self) -> usize {
        self.stride
    }

    /// Number of neurons.
    pub fn neuron_count(&self) -> usize {
        self.shape.total()
    }

    /// Zero-fills every neuron.
    pub fn clear(&mut self) {
        self.data.zero();
    }

    /// Features of neuron `(x, y, z)`.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates lie outside the grid.
    pub fn neuron(&self, x: usize, y: usize, z: usize) -> &[f32] {
        let start = self.offset(x, y, z);
        &self.data.as_slice()[start..start + self.neuron_size]
    }

    /// Mutable features of neuron `(x, y, z)`. Padding stays out of reach.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates lie outside the grid.
    pub fn neuron_mut(&mut self, x: usize, y: usize, z: usize) -> &mut [f32] {
        let start = self.offset(x, y, z);
        &mut self.data.as_mut_slice()[start..start + self.neuron_size]
    }

    /// Overwrites neuron `(x, y, z)`.
    pub fn set_neuron(&mut self, x: usize, y: usize, z: usize, features: &[f32]) -> SomResult<()> {
        if !self.shape.contains(x, y, z) {
            return Err(SomError::shape_mismatch(&self.shape.dims(), &[x, y, z]));
        }
        if features.len() != self.neuron_size {
            return Err(SomError::shape_mismatch(&[self.neuron_size], &[features.len()]));
        }
        self.neuron_mut(x, y, z).copy_from_slice(features);
        Ok(())
    }

    /// Features by flat index.
    pub fn neuron_at(&self, index: usize) -> &[f32] {
        let start = index * self.stride;
        &self.data.as_slice()[start..start + self.neuron_size]
    }

    /// Iterates `((x, y, z), features)` in flat-index order.
    pub fn iter_neurons(&self) -> impl Iterator<Item = ((usize, usize, usize), &[f32])> + '_ {
        let shape = self.shape;
        let size = self.neuron_size;
        self.data
            .as_slice()
            .chunks_exact(self.stride)
            .enumerate()
            .map(move |(i, chunk)| (shape.coords(i), &chunk[..size]))
    }

    /// Sets every feature from a function of `(x, y, z, feature)`.
    pub fn fill_with<F>(&mut self, mut f: F)
    where
        F: FnMut(usize, usize, usize, usize) -> f32,
    {
        let shape = self.shape;
        let size = self.neuron_size;
        for (i, chunk) in self.data.as_mut_slice().chunks_exact_mut(self.stride).enumerate() {
            let (x, y, z) = shape.coords(i);
            for (c, value) in chunk[..size].iter_mut().enumerate() {
                *value = f(x, y, z, c);
            }
        }
    }

    /// Raw padded layout, as uploaded to the device.
    pub fn as_padded_slice(&self) -> &[f32] {
        self.data.as_slice()
    }

    /// Replaces the whole padded layout, e.g. after a device readback.
    ///
    /// Padding lanes in `data` are ignored and stay zero.
    pub fn copy_from_padded(&mut self, data: &[f32]) -> SomResult<()> {
        if data.len() != self.data.len() {
            return Err(SomError::shape_mismatch(&[self.data.len()], &[data.len()]));
        }
        let size = self.neuron_size;
        for (dst, src) in self
            .data
            .as_mut_slice()
            .chunks_exact_mut(self.stride)
            .zip(data.chunks_exact(self.stride))
        {
            dst[..size].copy_from_slice(&src[..size]);
        }
        Ok(())
    }

    fn offset(&self, x: usize, y: usize, z: usize) -> usize {
        assert!(
            self.shape.contains(x, y, z),
            "neuron ({x}, {y}, {z}) outside {}x{}x{} grid",
            self.shape.width,
            self.shape.height,
            self.shape.depth
        );
        self.shape.flat_index(x, y, z) * self.stride
    }
}

/// Serialized grid before shape and padding checks.
#[cfg(feature = "serde")]
#[derive(Deserialize)]
struct RawGrid {
    shape: GridShape,
    neuron_size: usize,
    stride: usize,
    data: Vec<f32>,
}

#[cfg(feature = "serde")]
impl TryFrom<RawGrid> for SomGrid {
    type Error = SomError;

    /// Padding lanes are dropped, so a restored grid always has them zeroed.
    fn try_from(raw: RawGrid) -> SomResult<Self> {
        let mut grid = SomGrid::new(raw.shape, raw.neuron_size)?;
        if raw.stride != grid.stride {
            return Err(SomError::shape_mismatch(&[grid.stride], &[raw.stride]));
        }
        grid.copy_from_padded(&raw.data)?;
        Ok(grid)
    }
}
