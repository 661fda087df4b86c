//! Host-simulated device layer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── StreamExecutor (platform, ordinal) ───────┐
//! │  kernel implementations    loaded-kernel cache (device mutex)         │
//! │                                                                        │
//! │  Stream "main"   ─► [launch][memcpy][record ev]                       │
//! │  Stream "async0" ─►            [wait ev][all-reduce][record ev2]       │
//! └────────────────────────────────────────────────────────────────────────┘
//!          │                                   │
//!    BufferTable (slices ─► DeviceRegion)   Communicator (clique)
//! ```
//!
//! Work is executed when it is enqueued, so every stream observes its own
//! program order. Cross-stream ordering is expressed with [`Event`]s.

mod buffer;
pub mod collective;
mod executor;
mod host_transfer;
pub mod library;
mod stream;

pub use buffer::{BufferSlice, BufferTable, DeviceAllocation, DeviceRegion};
pub use collective::{
    CliqueCommunicator, Communicator, InProcessClique, LocalCommunicator, ReductionKind,
};
pub use executor::{ExecutableSource, HostKernelFn, LaunchDimensions, LoadedKernel, StreamExecutor};
pub use host_transfer::{HostTransfer, HostTransferQueues};
pub use stream::{Event, Stream, StreamOp};
