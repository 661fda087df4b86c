//! Per-kind thunk handlers.

pub mod collective;
pub mod control;
pub mod host;
pub mod kernel;
pub mod library;
pub mod memory;
pub mod metadata;
