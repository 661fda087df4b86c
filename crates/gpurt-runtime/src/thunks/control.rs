//! Control-flow thunks: conditional, while, for and command buffers.
//!
//! Each owns nested [`ThunkSequence`]s and recurses initialization and
//! execution into them in order. Device-computed predicates are read back
//! through the main stream.

use std::collections::HashSet;

use gpurt_core::device::{BufferSlice, Event};
use gpurt_core::error::{Result, RuntimeError};
use gpurt_core::{device_mutex, DeviceKey};
use parking_lot::Mutex;

use crate::params::{ExecuteParams, InitializeParams};
use crate::thunk::ThunkSequence;

fn read_predicate(params: &ExecuteParams<'_>, slice: &BufferSlice) -> Result<bool> {
    let region = params.region(slice)?;
    let bytes = params.stream.memcpy_d2h(&region)?;
    match bytes.first() {
        Some(b) => Ok(*b != 0),
        None => Err(RuntimeError::InvalidArgument(format!(
            "predicate slice {} is empty",
            slice
        ))),
    }
}

// ============================================================================
// CONDITIONAL
// ============================================================================

/// How a conditional picks its branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchSelector {
    /// A `pred` byte: true runs branch 0, false runs branch 1.
    Predicate,
    /// An `s32` index; out-of-range indices run the last branch.
    Index,
}

/// Runs one of several branches chosen by a device value.
#[derive(Debug)]
pub struct ConditionalThunk {
    selector: BranchSelector,
    branch_index: BufferSlice,
    pub(crate) branches: Vec<ThunkSequence>,
}

impl ConditionalThunk {
    /// Two-way branch on a `pred` value.
    pub fn predicated(predicate: BufferSlice, on_true: ThunkSequence, on_false: ThunkSequence) -> Self {
        Self {
            selector: BranchSelector::Predicate,
            branch_index: predicate,
            branches: vec![on_true, on_false],
        }
    }

    /// N-way branch on an `s32` index.
    pub fn indexed(index: BufferSlice, branches: Vec<ThunkSequence>) -> Self {
        Self {
            selector: BranchSelector::Index,
            branch_index: index,
            branches,
        }
    }

    /// Branch selector.
    pub fn selector(&self) -> BranchSelector {
        self.selector
    }

    /// Branches in index order.
    pub fn branches(&self) -> &[ThunkSequence] {
        &self.branches
    }

    pub(crate) fn initialize(&self, params: &InitializeParams<'_>) -> Result<()> {
        for branch in &self.branches {
            branch.initialize(params)?;
        }
        Ok(())
    }

    fn select(&self, params: &ExecuteParams<'_>) -> Result<usize> {
        let last = self.branches.len().checked_sub(1).ok_or_else(|| {
            RuntimeError::InvalidArgument("conditional has no branches".to_string())
        })?;
        match self.selector {
            BranchSelector::Predicate => {
                Ok(if read_predicate(params, &self.branch_index)? { 0 } else { 1.min(last) })
            }
            BranchSelector::Index => {
                let region = params.region(&self.branch_index)?;
                let bytes = params.stream.memcpy_d2h(&region)?;
                let raw: [u8; 4] = bytes.get(..4).and_then(|b| b.try_into().ok()).ok_or_else(|| {
                    RuntimeError::InvalidArgument(format!(
                        "branch index slice {} holds fewer than 4 bytes",
                        self.branch_index
                    ))
                })?;
                let index = i32::from_le_bytes(raw);
                Ok(usize::try_from(index).ok().filter(|i| *i <= last).unwrap_or(last))
            }
        }
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let branch = self.select(params)?;
        tracing::trace!(branch = branch, "Conditional selected branch");
        self.branches[branch].execute(params)
    }
}

// ============================================================================
// WHILE
// ============================================================================

/// Runs `condition`, reads the predicate it wrote and runs `body` while it
/// is true. A known trip count skips the condition entirely.
#[derive(Debug)]
pub struct WhileThunk {
    pub(crate) condition: ThunkSequence,
    predicate: BufferSlice,
    pub(crate) body: ThunkSequence,
    trip_count: Option<u64>,
}

impl WhileThunk {
    /// Creates a condition-driven loop.
    pub fn new(condition: ThunkSequence, predicate: BufferSlice, body: ThunkSequence) -> Self {
        Self {
            condition,
            predicate,
            body,
            trip_count: None,
        }
    }

    /// Loop exactly `trip_count` times.
    #[must_use]
    pub fn with_trip_count(mut self, trip_count: u64) -> Self {
        self.trip_count = Some(trip_count);
        self
    }

    /// Condition sequence.
    pub fn condition(&self) -> &ThunkSequence {
        &self.condition
    }

    /// Body sequence.
    pub fn body(&self) -> &ThunkSequence {
        &self.body
    }

    /// Known trip count, if any.
    pub fn trip_count(&self) -> Option<u64> {
        self.trip_count
    }

    pub(crate) fn initialize(&self, params: &InitializeParams<'_>) -> Result<()> {
        self.condition.initialize(params)?;
        self.body.initialize(params)
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        if let Some(trip_count) = self.trip_count {
            for _ in 0..trip_count {
                self.body.execute(params)?;
            }
            return Ok(());
        }

        let mut iterations = 0u64;
        loop {
            self.condition.execute(params)?;
            if !read_predicate(params, &self.predicate)? {
                break;
            }
            self.body.execute(params)?;
            iterations += 1;
        }
        tracing::trace!(iterations = iterations, "While loop finished");
        Ok(())
    }
}

// ============================================================================
// FOR
// ============================================================================

/// Runs `body` a fixed number of times.
#[derive(Debug)]
pub struct ForThunk {
    loop_limit: u64,
    pub(crate) body: ThunkSequence,
}

impl ForThunk {
    /// Creates a counted loop.
    pub fn new(loop_limit: u64, body: ThunkSequence) -> Self {
        Self { loop_limit, body }
    }

    /// Iteration count.
    pub fn loop_limit(&self) -> u64 {
        self.loop_limit
    }

    /// Body sequence.
    pub fn body(&self) -> &ThunkSequence {
        &self.body
    }

    pub(crate) fn initialize(&self, params: &InitializeParams<'_>) -> Result<()> {
        self.body.initialize(params)
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        for _ in 0..self.loop_limit {
            self.body.execute(params)?;
        }
        Ok(())
    }
}

// ============================================================================
// COMMAND BUFFER
// ============================================================================

/// Groups commands that are instantiated once per device during
/// initialization and replayed on every execution.
#[derive(Debug)]
pub struct CommandBufferThunk {
    pub(crate) commands: ThunkSequence,
    instantiated: Mutex<HashSet<DeviceKey>>,
}

impl CommandBufferThunk {
    /// Creates a command buffer over `commands`.
    pub fn new(commands: ThunkSequence) -> Self {
        Self {
            commands,
            instantiated: Mutex::new(HashSet::new()),
        }
    }

    /// Recorded commands.
    pub fn commands(&self) -> &ThunkSequence {
        &self.commands
    }

    /// True once instantiated on `device`.
    pub fn is_instantiated_on(&self, device: DeviceKey) -> bool {
        self.instantiated.lock().contains(&device)
    }

    pub(crate) fn initialize(&self, params: &InitializeParams<'_>) -> Result<()> {
        self.commands.initialize(params)?;

        let device = params.executor.key();
        if self.is_instantiated_on(device) {
            return Ok(());
        }
        let _guard = device_mutex(device).lock();
        if self.is_instantiated_on(device) {
            return Ok(());
        }
        if let Some(trace_stream) = params.command_buffer_trace_stream {
            let traced = Event::new();
            trace_stream.record_event(&traced);
        }
        self.instantiated.lock().insert(device);
        tracing::debug!(
            device = %device,
            commands = self.commands.len(),
            traced = params.command_buffer_trace_stream.is_some(),
            "Instantiated command buffer"
        );
        Ok(())
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let device = params.stream.device();
        if !self.is_instantiated_on(device) {
            return Err(RuntimeError::Internal(format!(
                "command buffer replayed on {} before instantiation",
                device
            )));
        }
        self.commands.execute(params)
    }
}
