//! Cache-line aligned host storage for neuron data.
//!
//! [`AlignedBuffer`] backs the host copy of the grid and the padded
//! training vectors. The whole allocation is zeroed up front, which keeps
//! the padding lanes of every neuron at zero without extra bookkeeping.
//!
//! # Memory Alignment
//!
//! Allocations use 64-byte alignment ([`CACHE_LINE`]). Neuron strides are
//! powers of two, so rows of 16 or more features never straddle a line.

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Cache line size for memory alignment (64 bytes).
pub const CACHE_LINE: usize = 64;

/// 64-byte aligned, zero-initialized `f32` buffer.
///
/// # Example
///
/// ```rust
/// use somgrid::AlignedBuffer;
///
/// let mut buf = AlignedBuffer::zeroed(8);
/// buf.as_mut_slice()[0] = 1.0;
/// assert_eq!(buf[0], 1.0);
/// assert_eq!(buf[7], 0.0);
/// ```
pub struct AlignedBuffer {
    ptr: NonNull<f32>,
    len: usize,
    capacity: usize,
}

// Safety: AlignedBuffer owns its data and doesn't share it
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Creates a new empty aligned buffer.
    pub fn new() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
            capacity: 0,
        }
    }

    fn with_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            return Self::new();
        }

        Self {
            ptr: Self::allocate(capacity),
            len: 0,
            capacity,
        }
    }

    /// Creates a buffer of `len` zeros.
    pub fn zeroed(len: usize) -> Self {
        let mut buf = Self::with_capacity(len);
        buf.len = len;
        buf
    }

    /// Copies `data` into a new aligned buffer.
    pub fn from_slice(data: &[f32]) -> Self {
        let mut buf = Self::zeroed(data.len());
        buf.as_mut_slice().copy_from_slice(data);
        buf
    }

    /// Fills with zeros.
    #[inline]
    pub fn zero(&mut self) {
        if self.len > 0 {
            // SAFETY: buffer is allocated and len > 0
            unsafe {
                std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.len);
            }
        }
    }

    /// Current length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Is empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a slice of the buffer.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        if self.len == 0 {
            &[]
        } else {
            // SAFETY: ptr is valid for `len` contiguous elements
            unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
        }
    }

    /// Returns a mutable slice of the buffer.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        if self.len == 0 {
            &mut []
        } else {
            // SAFETY: ptr uniquely owned, valid for `len` contiguous elements
            unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
        }
    }

    /// Raw pointer.
    #[inline]
    pub fn as_ptr(&self) -> *const f32 {
        self.ptr.as_ptr()
    }

    fn layout(capacity: usize) -> Layout {
        match Layout::from_size_align(capacity * std::mem::size_of::<f32>(), CACHE_LINE) {
            Ok(layout) => layout,
            Err(_) => panic!("AlignedBuffer capacity overflow: {capacity} floats"),
        }
    }

    fn allocate(capacity: usize) -> NonNull<f32> {
        let layout = Self::layout(capacity);
        // SAFETY: layout has non-zero size, allocation failure handled via handle_alloc_error
        unsafe {
            let raw = alloc_zeroed(layout);
            if raw.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            NonNull::new_unchecked(raw as *mut f32)
        }
    }

    fn release(&mut self) {
        if self.capacity > 0 {
            // SAFETY: layout matches original allocation
            unsafe {
                dealloc(self.ptr.as_ptr() as *mut u8, Self::layout(self.capacity));
            }
        }
    }
}

impl Default for AlignedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl Clone for AlignedBuffer {
    fn clone(&self) -> Self {
        let mut new = Self::with_capacity(self.capacity);
        new.len = self.len;
        if self.len > 0 {
            // SAFETY: source/dest are distinct allocations, len is within both
            unsafe {
                std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), new.ptr.as_ptr(), self.len);
            }
        }
        new
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl PartialEq for AlignedBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl std::ops::Index<usize> for AlignedBuffer {
    type Output = f32;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.as_slice()[index]
    }
}

impl std::ops::IndexMut<usize> for AlignedBuffer {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.as_mut_slice()[index]
    }
}

#[cfg(feature = "serde")]
impl Serialize for AlignedBuffer {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.as_slice().serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for AlignedBuffer {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let data: Vec<f32> = Vec::<f32>::deserialize(deserializer)?;
        Ok(AlignedBuffer::from_slice(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_is_aligned_and_clear() {
        let buf = AlignedBuffer::zeroed(100);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.as_ptr() as usize % CACHE_LINE, 0);
        assert!(buf.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_zero_clears_values() {
        let mut buf = AlignedBuffer::from_slice(&[1.0, 2.0, 3.0]);
        buf.zero();
        assert_eq!(buf.as_slice(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_empty_buffer() {
        let buf = AlignedBuffer::new();
        assert!(buf.is_empty());
        assert!(buf.as_slice().is_empty());
        let cloned = buf.clone();
        assert_eq!(cloned, buf);
    }
}
