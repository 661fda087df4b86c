//! Device allocations and the buffer table.

use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::RwLock;

use crate::error::{Result, RuntimeError};

/// A symbolic slice of a buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferSlice {
    /// Index of the allocation in the buffer table.
    pub allocation: usize,
    /// Offset in bytes.
    pub offset: usize,
    /// Size in bytes.
    pub size: usize,
}

impl BufferSlice {
    /// Creates a slice.
    pub const fn new(allocation: usize, offset: usize, size: usize) -> Self {
        Self {
            allocation,
            offset,
            size,
        }
    }

    /// Returns true if the two slices share any byte.
    pub fn overlaps(&self, other: &BufferSlice) -> bool {
        self.allocation == other.allocation
            && self.offset < other.offset + other.size
            && other.offset < self.offset + self.size
    }
}

impl fmt::Display for BufferSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "alloc{}[{}..{}]",
            self.allocation,
            self.offset,
            self.offset + self.size
        )
    }
}

/// One allocated region of device memory.
pub struct DeviceAllocation {
    index: usize,
    data: RwLock<Vec<u8>>,
}

impl DeviceAllocation {
    /// Allocates `size` zeroed bytes.
    pub fn zeroed(index: usize, size: usize) -> Self {
        Self {
            index,
            data: RwLock::new(vec![0; size]),
        }
    }

    /// Index in the buffer table.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.data.read().len()
    }
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("index", &self.index)
            .field("size", &self.size())
            .finish()
    }
}

/// A resolved slice: concrete memory behind a [`BufferSlice`].
#[derive(Clone)]
pub struct DeviceRegion {
    allocation: Arc<DeviceAllocation>,
    offset: usize,
    size: usize,
}

impl DeviceRegion {
    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The slice this region was resolved from.
    pub fn slice(&self) -> BufferSlice {
        BufferSlice::new(self.allocation.index, self.offset, self.size)
    }

    /// Copies the region contents out.
    pub fn read(&self) -> Vec<u8> {
        let data = self.allocation.data.read();
        data[self.offset..self.offset + self.size].to_vec()
    }

    /// Overwrites the region. `bytes` must match the region size.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.size {
            return Err(RuntimeError::InvalidArgument(format!(
                "write of {} bytes into {} byte region {}",
                bytes.len(),
                self.size,
                self.slice()
            )));
        }
        let mut data = self.allocation.data.write();
        data[self.offset..self.offset + self.size].copy_from_slice(bytes);
        Ok(())
    }

    /// Fills the region with a byte value.
    pub fn fill(&self, value: u8) {
        let mut data = self.allocation.data.write();
        data[self.offset..self.offset + self.size].fill(value);
    }

    /// Reads the region as a vector of `T`.
    pub fn read_as<T: Pod>(&self) -> Vec<T> {
        bytemuck::pod_collect_to_vec(&self.read())
    }

    /// Writes a slice of `T` into the region.
    pub fn write_from<T: Pod>(&self, values: &[T]) -> Result<()> {
        self.write(bytemuck::cast_slice(values))
    }

    /// Number of `T` elements that fit in the region.
    pub fn element_count<T: Pod>(&self) -> usize {
        self.size / std::mem::size_of::<T>()
    }
}

impl fmt::Debug for DeviceRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceRegion({})", self.slice())
    }
}

/// Mapping from symbolic buffer slices to concrete device memory.
#[derive(Debug, Clone, Default)]
pub struct BufferTable {
    allocations: Vec<Arc<DeviceAllocation>>,
}

impl BufferTable {
    /// Creates a table with one zeroed allocation per size.
    pub fn with_sizes(sizes: &[usize]) -> Self {
        Self {
            allocations: sizes
                .iter()
                .enumerate()
                .map(|(i, size)| Arc::new(DeviceAllocation::zeroed(i, *size)))
                .collect(),
        }
    }

    /// Number of allocations.
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    /// Returns true if the table holds no allocations.
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Returns the allocation at `index`.
    pub fn allocation(&self, index: usize) -> Option<&Arc<DeviceAllocation>> {
        self.allocations.get(index)
    }

    /// Resolves a slice to device memory.
    pub fn resolve(&self, slice: &BufferSlice) -> Result<DeviceRegion> {
        let allocation = self.allocations.get(slice.allocation).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!("no allocation {} in buffer table", slice.allocation))
        })?;
        let allocation_size = allocation.size();
        if slice.offset + slice.size > allocation_size {
            return Err(RuntimeError::BufferOutOfRange {
                allocation: slice.allocation,
                offset: slice.offset,
                size: slice.size,
                allocation_size,
            });
        }
        Ok(DeviceRegion {
            allocation: Arc::clone(allocation),
            offset: slice.offset,
            size: slice.size,
        })
    }

    /// Resolves a region covering a whole allocation.
    pub fn whole(&self, index: usize) -> Result<DeviceRegion> {
        let size = self
            .allocations
            .get(index)
            .map(|a| a.size())
            .ok_or_else(|| RuntimeError::InvalidArgument(format!("no allocation {}", index)))?;
        self.resolve(&BufferSlice::new(index, 0, size))
    }
}
