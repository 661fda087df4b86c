//! # gpurt Core
//!
//! Core types for the gpurt execution and tuning layer.
//!
//! ## Core Abstractions
//!
//! - [`AutotuneSelector`] - Picks the fastest correct algorithm from noisy measurements
//! - [`DeviceMutexRegistry`] - Process-wide per-device locks
//! - [`StreamExecutor`] / [`Stream`] - Devices and ordered work queues
//! - [`BufferTable`] - Symbolic buffer slices resolved to device memory
//! - [`RuntimeConfig`] - Shared configuration with a process-wide determinism override
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use gpurt_core::prelude::*;
//!
//! let results = vec![
//!     CandidateResult::success(Duration::from_micros(10), 100),
//!     CandidateResult::success(Duration::from_micros(11), 5),
//! ];
//! let best = AutotuneSelector::with_determinism(false)
//!     .select(&results, Some("gemm.1"))
//!     .unwrap();
//! assert_eq!(best.scratch_bytes, 5);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod autotune;
pub mod config;
pub mod device;
pub mod device_mutex;
pub mod error;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::autotune::{
        pick_best_result, Algorithm, AutotuneSelector, CandidateFailure, CandidateResult,
        FailureKind,
    };
    pub use crate::config::{require_determinism, RuntimeConfig, RuntimeConfigBuilder};
    pub use crate::device::{
        BufferSlice, BufferTable, Communicator, DeviceRegion, Event, ExecutableSource,
        HostTransfer, HostTransferQueues, InProcessClique, LaunchDimensions, LocalCommunicator,
        ReductionKind, Stream, StreamExecutor, StreamOp,
    };
    pub use crate::device_mutex::{device_mutex, DeviceKey, DeviceMutexRegistry, PlatformId};
    pub use crate::error::{Result, RuntimeError};
}

// Re-exports for convenience
pub use autotune::{pick_best_result, AutotuneSelector, CandidateResult, FailureKind};
pub use config::RuntimeConfig;
pub use device::{BufferSlice, BufferTable, Stream, StreamExecutor};
pub use device_mutex::{device_mutex, DeviceKey, DeviceMutexRegistry, PlatformId};
pub use error::{Result, RuntimeError};
