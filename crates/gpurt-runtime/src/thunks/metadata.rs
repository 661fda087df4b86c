//! Partition and replica id queries.

use gpurt_core::device::BufferSlice;
use gpurt_core::error::{Result, RuntimeError};

use crate::kind::ThunkKind;
use crate::params::ExecuteParams;

/// Writes this participant's partition or replica id as a `u32`.
///
/// Without a collective context the id is 0.
#[derive(Debug, Clone)]
pub struct IdThunk {
    destination: BufferSlice,
}

impl IdThunk {
    /// Writes the id into `destination`.
    pub fn new(destination: BufferSlice) -> Self {
        Self { destination }
    }

    pub(crate) fn execute(&self, kind: ThunkKind, params: &ExecuteParams<'_>) -> Result<()> {
        let ctx = params.collective;
        let id = match kind {
            ThunkKind::PartitionId => ctx.map_or(0, |c| c.partition_id()),
            ThunkKind::ReplicaId => ctx.map_or(0, |c| c.replica_id()),
            other => {
                return Err(RuntimeError::Internal(format!("{} is not an id query", other)));
            }
        };
        let region = params.region(&self.destination)?;
        params.stream.memcpy_h2d(&region, &id.to_le_bytes())
    }
}
