//! # gpurt Runtime
//!
//! Execution units ("thunks") for the gpurt backend.
//!
//! A lowered program is a [`ThunkSequence`]. Each [`Thunk`] has a closed
//! [`ThunkKind`], a profile annotation and an optional reference to the
//! program instruction it came from. Thunks are initialized once per device
//! executor, outside the measured path, and then executed any number of
//! times against a buffer table and explicit streams.
//!
//! ## Core Abstractions
//!
//! - [`Thunk`] / [`ThunkOp`] - One unit of device work and its per-kind state
//! - [`ThunkSequence`] - Ordered composition, nested inside control thunks
//! - [`AsyncOperation`] - A start/done pair sharing one completion handle
//! - [`InitializeParams`] / [`ExecuteParams`] - Per-call resources
//!
//! ## Example
//!
//! ```
//! use gpurt_core::device::{BufferSlice, BufferTable, ExecutableSource, StreamExecutor};
//! use gpurt_runtime::prelude::*;
//!
//! let executor = StreamExecutor::host(0);
//! let stream = executor.create_stream("main");
//! let table = BufferTable::with_sizes(&[16]);
//! let src = ExecutableSource::default();
//!
//! let seq: ThunkSequence = vec![Thunk::new(
//!     ThunkInfo::new("memset.1"),
//!     ThunkOp::Memset32BitValue(Memset32Thunk::new(BufferSlice::new(0, 0, 16), 7)),
//! )]
//! .into_iter()
//! .collect();
//!
//! seq.initialize(&InitializeParams::new(&executor, &src, &table, &stream)).unwrap();
//! seq.execute(&ExecuteParams::new(&table, &stream)).unwrap();
//! assert_eq!(table.whole(0).unwrap().read_as::<u32>(), vec![7; 4]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod async_op;
pub mod kind;
pub mod params;
pub mod thunk;
pub mod thunks;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::async_op::{AsyncHandle, AsyncOperation, AsyncWork};
    pub use crate::kind::ThunkKind;
    pub use crate::params::{CollectiveContext, ExecuteParams, InitializeParams, ThunkInfo};
    pub use crate::thunk::{Thunk, ThunkOp, ThunkSequence};
    pub use crate::thunks::collective::{
        CollectiveBuffer, CollectiveOp, CollectiveThunk, PeerRecvThunk, PeerSendThunk,
    };
    pub use crate::thunks::control::{
        BranchSelector, CommandBufferThunk, ConditionalThunk, ForThunk, WhileThunk,
    };
    pub use crate::thunks::host::{InfeedThunk, OutfeedThunk};
    pub use crate::thunks::kernel::KernelThunk;
    pub use crate::thunks::library::{
        register_custom_call, CholeskyThunk, CustomCallThunk, Epilogue, FftThunk, FusedMhaThunk,
        GemmThunk, LibraryCallThunk, SortKeyType, SortThunk, TriangularSolveThunk,
    };
    pub use crate::thunks::memory::{CopyThunk, Memset32Thunk, MemzeroThunk};
    pub use crate::thunks::metadata::IdThunk;
}

// Re-exports for convenience
pub use async_op::AsyncOperation;
pub use kind::ThunkKind;
pub use params::{CollectiveContext, ExecuteParams, InitializeParams, ThunkInfo};
pub use thunk::{Thunk, ThunkOp, ThunkSequence};
