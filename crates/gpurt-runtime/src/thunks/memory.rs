//! Memory thunks: copy, 32-bit memset, zero fill.

use gpurt_core::device::BufferSlice;
use gpurt_core::error::Result;

use crate::params::ExecuteParams;

/// Device-to-device copy between two equally sized slices.
#[derive(Debug, Clone)]
pub struct CopyThunk {
    source: BufferSlice,
    destination: BufferSlice,
}

impl CopyThunk {
    /// Copy `source` into `destination`.
    pub fn new(source: BufferSlice, destination: BufferSlice) -> Self {
        Self { source, destination }
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let src = params.region(&self.source)?;
        let dst = params.region(&self.destination)?;
        params.stream.memcpy_d2d(&dst, &src)
    }
}

/// Fills a slice with a repeated 32-bit value.
#[derive(Debug, Clone)]
pub struct Memset32Thunk {
    destination: BufferSlice,
    value: u32,
}

impl Memset32Thunk {
    /// Fill `destination` with `value`.
    pub fn new(destination: BufferSlice, value: u32) -> Self {
        Self { destination, value }
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let dst = params.region(&self.destination)?;
        params.stream.memset32(&dst, self.value)
    }
}

/// Zeroes a slice.
#[derive(Debug, Clone)]
pub struct MemzeroThunk {
    destination: BufferSlice,
}

impl MemzeroThunk {
    /// Zero `destination`.
    pub fn new(destination: BufferSlice) -> Self {
        Self { destination }
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let dst = params.region(&self.destination)?;
        params.stream.memzero(&dst)
    }
}
