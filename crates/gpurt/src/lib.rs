//! # gpurt
//!
//! Execution and tuning layer of a GPU program backend.
//!
//! ## Features
//!
//! - **Autotune selection**: the fastest correct algorithm from noisy timings
//! - **Async host transfers**: blocking host/device copies and slices
//!   rewritten into overlapped start/done pairs
//! - **Execution units**: a closed set of thunk kinds with an
//!   initialize/execute lifecycle on explicit streams
//! - **Per-device locks**: device-global mutations serialized without
//!   serializing execution
//!
//! ## Architecture
//!
//! ```text
//!   candidates ──► AutotuneSelector ──► chosen algorithm
//!                                           │
//!   Module ──► HostTransferAsyncifier ──► lowering ──► ThunkSequence
//!                                                          │
//!                     ExecutionStreams + BufferTable ──► Executable
//!                                                          │
//!                         ┌────────────────────────────────┤
//!                         ▼                                ▼
//!                   main stream                     async streams
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use gpurt::prelude::*;
//!
//! let executor = StreamExecutor::host(0);
//! let config = RuntimeConfig::default();
//! let streams = ExecutionStreams::new(&executor, &config);
//! let table = BufferTable::with_sizes(&[8]);
//!
//! let thunks: ThunkSequence = vec![Thunk::new(
//!     ThunkInfo::new("zero.1"),
//!     ThunkOp::Memzero(MemzeroThunk::new(BufferSlice::new(0, 0, 8))),
//! )]
//! .into_iter()
//! .collect();
//! let exe = Executable::new(thunks, ExecutableSource::default());
//!
//! exe.initialize(&streams, &table, None).unwrap();
//! exe.execute(&streams, &table, None, None).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;

pub use gpurt_core::{autotune, config, device, device_mutex, error};
pub use gpurt_ir as ir;
pub use gpurt_runtime as runtime;

use gpurt_core::config::RuntimeConfig;
use gpurt_core::device::{BufferTable, ExecutableSource, HostTransfer, Stream, StreamExecutor};
use gpurt_core::error::Result;
use gpurt_ir::{HostTransferAsyncifier, IrResult, Module, PassPipeline};
use gpurt_runtime::{CollectiveContext, ExecuteParams, InitializeParams, ThunkSequence};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{optimize, Executable, ExecutionStreams};
    pub use gpurt_core::prelude::*;
    pub use gpurt_ir::{
        ComputationBuilder, HostTransferAsyncifier, MemorySpace, Module, ModuleBuilder, ModulePass,
        PrimitiveType, Shape, SourceRef,
    };
    pub use gpurt_runtime::prelude::*;
}

/// Runs the compile-time passes this layer owns over `module`.
///
/// Returns true if anything changed.
pub fn optimize(module: &mut Module, config: &RuntimeConfig) -> IrResult<bool> {
    PassPipeline::new()
        .with_pass(HostTransferAsyncifier::new(config.host_memory_space))
        .run(module)
}

/// The streams one device uses to run an executable.
#[derive(Debug, Clone)]
pub struct ExecutionStreams {
    executor: Arc<StreamExecutor>,
    main: Arc<Stream>,
    trace: Arc<Stream>,
    async_streams: Vec<Arc<Stream>>,
    device_to_host: Arc<Stream>,
    host_to_device: Arc<Stream>,
}

impl ExecutionStreams {
    /// Creates the main, tracing, transfer and `config.num_async_streams`
    /// async streams on `executor`.
    pub fn new(executor: &Arc<StreamExecutor>, config: &RuntimeConfig) -> Self {
        Self {
            executor: Arc::clone(executor),
            main: executor.create_stream("main"),
            trace: executor.create_stream("command-buffer-trace"),
            async_streams: (0..config.num_async_streams)
                .map(|i| executor.create_stream(format!("async-{}", i)))
                .collect(),
            device_to_host: executor.create_stream("d2h"),
            host_to_device: executor.create_stream("h2d"),
        }
    }

    /// The device.
    pub fn executor(&self) -> &Arc<StreamExecutor> {
        &self.executor
    }

    /// Main stream.
    pub fn main(&self) -> &Arc<Stream> {
        &self.main
    }

    /// Async streams.
    pub fn async_streams(&self) -> &[Arc<Stream>] {
        &self.async_streams
    }
}

/// A lowered program: its thunks plus the device code they launch.
#[derive(Debug)]
pub struct Executable {
    thunks: ThunkSequence,
    source: ExecutableSource,
}

impl Executable {
    /// Creates an executable.
    pub fn new(thunks: ThunkSequence, source: ExecutableSource) -> Self {
        Self { thunks, source }
    }

    /// The thunks.
    pub fn thunks(&self) -> &ThunkSequence {
        &self.thunks
    }

    /// Device code.
    pub fn source(&self) -> &ExecutableSource {
        &self.source
    }

    /// Drops compile-time info from every thunk.
    pub fn clear_compile_time_info(&mut self) {
        self.thunks.clear_compile_time_info();
    }

    /// Initializes every thunk on the device behind `streams`.
    pub fn initialize(
        &self,
        streams: &ExecutionStreams,
        table: &BufferTable,
        collective: Option<&CollectiveContext>,
    ) -> Result<()> {
        let mut params = InitializeParams::new(&streams.executor, &self.source, table, &streams.main)
            .with_trace_stream(&streams.trace);
        params.collective = collective;
        tracing::debug!(
            device = %streams.executor.key(),
            thunks = self.thunks.len(),
            "Initializing executable"
        );
        self.thunks.initialize(&params)
    }

    /// Executes every thunk in order on `streams`.
    pub fn execute(
        &self,
        streams: &ExecutionStreams,
        table: &BufferTable,
        collective: Option<&CollectiveContext>,
        host_transfer: Option<&dyn HostTransfer>,
    ) -> Result<()> {
        let mut params = ExecuteParams::new(table, &streams.main)
            .with_trace_stream(&streams.trace)
            .with_async_streams(&streams.async_streams)
            .with_transfer_streams(&streams.device_to_host, &streams.host_to_device);
        params.collective = collective;
        params.host_transfer = host_transfer;
        self.thunks.execute(&params)
    }
}
