//! Per-call parameters for thunk initialization and execution.

use std::fmt;
use std::sync::Arc;

use gpurt_core::device::{
    BufferSlice, BufferTable, Communicator, DeviceRegion, ExecutableSource, HostTransfer,
    LocalCommunicator, Stream, StreamExecutor,
};
use gpurt_core::error::{Result, RuntimeError};
use gpurt_ir::SourceRef;

/// Compile-time description of a thunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThunkInfo {
    /// Label shown in profiles.
    pub profile_annotation: String,
    /// The program instruction this thunk was lowered from. Dropped by
    /// `clear_compile_time_info`.
    pub source: Option<SourceRef>,
}

impl ThunkInfo {
    /// Info with an annotation and no source instruction.
    pub fn new(profile_annotation: impl Into<String>) -> Self {
        Self {
            profile_annotation: profile_annotation.into(),
            source: None,
        }
    }

    /// Info for a thunk lowered from `source`, annotated with its name.
    pub fn from_source(source: SourceRef) -> Self {
        Self {
            profile_annotation: source.name.clone(),
            source: Some(source),
        }
    }
}

/// Communication context for collective thunks.
#[derive(Clone)]
pub struct CollectiveContext {
    communicator: Arc<dyn Communicator>,
    replica_id: u32,
    partition_id: u32,
}

impl CollectiveContext {
    /// Context over `communicator`; the replica id defaults to its rank.
    pub fn new(communicator: Arc<dyn Communicator>) -> Self {
        let replica_id = communicator.rank() as u32;
        Self {
            communicator,
            replica_id,
            partition_id: 0,
        }
    }

    /// Single-participant context.
    pub fn local() -> Self {
        Self::new(Arc::new(LocalCommunicator::new()))
    }

    /// Set the replica id.
    #[must_use]
    pub fn with_replica_id(mut self, replica_id: u32) -> Self {
        self.replica_id = replica_id;
        self
    }

    /// Set the partition id.
    #[must_use]
    pub fn with_partition_id(mut self, partition_id: u32) -> Self {
        self.partition_id = partition_id;
        self
    }

    /// The communicator.
    pub fn communicator(&self) -> &dyn Communicator {
        self.communicator.as_ref()
    }

    /// Number of participants in the clique.
    pub fn num_participants(&self) -> usize {
        self.communicator.size()
    }

    /// Replica id of this participant.
    pub fn replica_id(&self) -> u32 {
        self.replica_id
    }

    /// Partition id of this participant.
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }
}

impl fmt::Debug for CollectiveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectiveContext")
            .field("rank", &self.communicator.rank())
            .field("size", &self.communicator.size())
            .field("replica_id", &self.replica_id)
            .field("partition_id", &self.partition_id)
            .finish()
    }
}

/// Parameters passed to `Thunk::initialize`.
#[derive(Clone, Copy)]
pub struct InitializeParams<'a> {
    /// Executor the thunk will run on.
    pub executor: &'a StreamExecutor,
    /// Compiled device code.
    pub src: &'a ExecutableSource,
    /// Buffer table.
    pub buffer_allocations: &'a BufferTable,
    /// Main stream.
    pub stream: &'a Stream,
    /// Auxiliary stream for tracing command buffers.
    pub command_buffer_trace_stream: Option<&'a Stream>,
    /// Collective context.
    pub collective: Option<&'a CollectiveContext>,
}

impl<'a> InitializeParams<'a> {
    /// Parameters without a trace stream or collective context.
    pub fn new(
        executor: &'a StreamExecutor,
        src: &'a ExecutableSource,
        buffer_allocations: &'a BufferTable,
        stream: &'a Stream,
    ) -> Self {
        Self {
            executor,
            src,
            buffer_allocations,
            stream,
            command_buffer_trace_stream: None,
            collective: None,
        }
    }

    /// Set the command buffer trace stream.
    #[must_use]
    pub fn with_trace_stream(mut self, stream: &'a Stream) -> Self {
        self.command_buffer_trace_stream = Some(stream);
        self
    }

    /// Set the collective context.
    #[must_use]
    pub fn with_collective(mut self, collective: &'a CollectiveContext) -> Self {
        self.collective = Some(collective);
        self
    }
}

/// Parameters passed to `Thunk::execute`.
#[derive(Clone, Copy)]
pub struct ExecuteParams<'a> {
    /// Buffer table.
    pub buffer_allocations: &'a BufferTable,
    /// Main stream.
    pub stream: &'a Stream,
    /// Auxiliary stream for tracing command buffers.
    pub command_buffer_trace_stream: Option<&'a Stream>,
    /// Streams for overlapped asynchronous work.
    pub async_streams: &'a [Arc<Stream>],
    /// Collective context.
    pub collective: Option<&'a CollectiveContext>,
    /// Stream for device-to-host transfers.
    pub device_to_host_stream: Option<&'a Stream>,
    /// Stream for host-to-device transfers.
    pub host_to_device_stream: Option<&'a Stream>,
    /// Host transfer callbacks.
    pub host_transfer: Option<&'a dyn HostTransfer>,
}

impl<'a> ExecuteParams<'a> {
    /// Parameters with only a buffer table and main stream.
    pub fn new(buffer_allocations: &'a BufferTable, stream: &'a Stream) -> Self {
        Self {
            buffer_allocations,
            stream,
            command_buffer_trace_stream: None,
            async_streams: &[],
            collective: None,
            device_to_host_stream: None,
            host_to_device_stream: None,
            host_transfer: None,
        }
    }

    /// Set the command buffer trace stream.
    #[must_use]
    pub fn with_trace_stream(mut self, stream: &'a Stream) -> Self {
        self.command_buffer_trace_stream = Some(stream);
        self
    }

    /// Set the async streams.
    #[must_use]
    pub fn with_async_streams(mut self, streams: &'a [Arc<Stream>]) -> Self {
        self.async_streams = streams;
        self
    }

    /// Set the collective context.
    #[must_use]
    pub fn with_collective(mut self, collective: &'a CollectiveContext) -> Self {
        self.collective = Some(collective);
        self
    }

    /// Set dedicated transfer streams.
    #[must_use]
    pub fn with_transfer_streams(mut self, device_to_host: &'a Stream, host_to_device: &'a Stream) -> Self {
        self.device_to_host_stream = Some(device_to_host);
        self.host_to_device_stream = Some(host_to_device);
        self
    }

    /// Set the host transfer callbacks.
    #[must_use]
    pub fn with_host_transfer(mut self, host_transfer: &'a dyn HostTransfer) -> Self {
        self.host_transfer = Some(host_transfer);
        self
    }

    /// Async stream `index`, or the main stream if there is none.
    pub fn async_stream(&self, index: usize) -> &'a Stream {
        match self.async_streams.get(index) {
            Some(stream) => stream.as_ref(),
            None => self.stream,
        }
    }

    /// Device-to-host stream, or the main stream.
    pub fn d2h_stream(&self) -> &'a Stream {
        self.device_to_host_stream.unwrap_or(self.stream)
    }

    /// Host-to-device stream, or the main stream.
    pub fn h2d_stream(&self) -> &'a Stream {
        self.host_to_device_stream.unwrap_or(self.stream)
    }

    /// The collective context, required by communication thunks.
    pub fn collective(&self) -> Result<&'a CollectiveContext> {
        self.collective
            .ok_or_else(|| RuntimeError::Collective("no collective context provided".to_string()))
    }

    /// The host transfer callbacks, required by host transfer thunks.
    pub fn host_transfer(&self) -> Result<&'a dyn HostTransfer> {
        self.host_transfer
            .ok_or_else(|| RuntimeError::HostTransfer("no host transfer callbacks provided".to_string()))
    }

    /// Resolves a slice in the buffer table.
    pub fn region(&self, slice: &BufferSlice) -> Result<DeviceRegion> {
        self.buffer_allocations.resolve(slice)
    }
}
