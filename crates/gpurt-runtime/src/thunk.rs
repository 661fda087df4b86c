//! Execution units and ordered sequences of them.
//!
//! A [`Thunk`] pairs compile-time information with a [`ThunkOp`], the
//! tagged variant carrying the per-kind state. Dispatch is an exhaustive
//! match over the closed variant set.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──initialize()──► Initialized ──execute()──► Executed ─┐
//!                                ▲            ▲                  │
//!                                └─initialize─┴────execute()─────┘
//! ```
//!
//! Initialization is tracked per device executor. Executing on a device the
//! thunk was never initialized on fails with
//! [`RuntimeError::LifecycleViolation`].

use std::collections::HashSet;
use std::fmt;

use gpurt_core::error::{Result, RuntimeError};
use gpurt_core::DeviceKey;
use gpurt_ir::SourceRef;
use parking_lot::Mutex;

use crate::async_op::{AsyncDoneThunk, AsyncStartThunk};
use crate::kind::ThunkKind;
use crate::params::{ExecuteParams, InitializeParams, ThunkInfo};
use crate::thunks::collective::{CollectiveThunk, PeerRecvThunk, PeerSendThunk};
use crate::thunks::control::{CommandBufferThunk, ConditionalThunk, ForThunk, WhileThunk};
use crate::thunks::host::{InfeedThunk, OutfeedThunk};
use crate::thunks::kernel::KernelThunk;
use crate::thunks::library::{
    CholeskyThunk, CustomCallThunk, FftThunk, FusedMhaThunk, GemmThunk, LibraryCallThunk, SortThunk,
    TriangularSolveThunk,
};
use crate::thunks::memory::{CopyThunk, Memset32Thunk, MemzeroThunk};
use crate::thunks::metadata::IdThunk;

// ============================================================================
// THUNK OP
// ============================================================================

/// Per-kind state of a thunk.
#[derive(Debug)]
pub enum ThunkOp {
    /// Compiled kernel launch.
    Kernel(KernelThunk),
    /// Hand-written kernel launch.
    CustomKernel(KernelThunk),

    /// Cholesky decomposition.
    Cholesky(CholeskyThunk),
    /// Convolution.
    Convolution(LibraryCallThunk),
    /// Convolution filter reordering.
    ConvolutionReorder(LibraryCallThunk),
    /// Matrix multiply with an epilogue.
    GemmEpilogue(GemmThunk),
    /// Key sort.
    Sort(SortThunk),
    /// Registered custom-call target.
    CustomCall(CustomCallThunk),
    /// FFT.
    Fft(FftThunk),
    /// Fused attention.
    FusedMha(FusedMhaThunk),
    /// Matrix multiply.
    Gemm(GemmThunk),
    /// Normalization.
    Norm(LibraryCallThunk),
    /// Triangular solve.
    TriangularSolve(TriangularSolveThunk),

    /// Device-to-device copy.
    Copy(CopyThunk),
    /// 32-bit pattern fill.
    Memset32BitValue(Memset32Thunk),
    /// Zero fill.
    Memzero(MemzeroThunk),

    /// Replayable grouping.
    CommandBuffer(CommandBufferThunk),
    /// Branch selection.
    Conditional(ConditionalThunk),
    /// Counted loop.
    For(ForThunk),
    /// Ordered grouping.
    Sequential(ThunkSequence),
    /// Condition-driven loop.
    While(WhileThunk),

    /// Host-to-device infeed.
    Infeed(InfeedThunk),
    /// Device-to-host outfeed.
    Outfeed(OutfeedThunk),

    /// Synchronous collective.
    Collective(CollectiveThunk),
    /// Start half of an async pair.
    AsyncStart(AsyncStartThunk),
    /// Done half of an async pair.
    AsyncDone(AsyncDoneThunk),
    /// Point-to-point send.
    PeerSend(PeerSendThunk),
    /// Point-to-point receive.
    PeerRecv(PeerRecvThunk),

    /// Writes the partition id.
    PartitionId(IdThunk),
    /// Writes the replica id.
    ReplicaId(IdThunk),
}

impl ThunkOp {
    /// Kind of this op.
    pub fn kind(&self) -> ThunkKind {
        match self {
            ThunkOp::Kernel(_) => ThunkKind::Kernel,
            ThunkOp::CustomKernel(_) => ThunkKind::CustomKernel,
            ThunkOp::Cholesky(_) => ThunkKind::Cholesky,
            ThunkOp::Convolution(_) => ThunkKind::Convolution,
            ThunkOp::ConvolutionReorder(_) => ThunkKind::ConvolutionReorder,
            ThunkOp::GemmEpilogue(_) => ThunkKind::GemmEpilogue,
            ThunkOp::Sort(_) => ThunkKind::Sort,
            ThunkOp::CustomCall(_) => ThunkKind::CustomCall,
            ThunkOp::Fft(_) => ThunkKind::Fft,
            ThunkOp::FusedMha(_) => ThunkKind::FusedMha,
            ThunkOp::Gemm(_) => ThunkKind::Gemm,
            ThunkOp::Norm(_) => ThunkKind::Norm,
            ThunkOp::TriangularSolve(_) => ThunkKind::TriangularSolve,
            ThunkOp::Copy(_) => ThunkKind::Copy,
            ThunkOp::Memset32BitValue(_) => ThunkKind::Memset32BitValue,
            ThunkOp::Memzero(_) => ThunkKind::Memzero,
            ThunkOp::CommandBuffer(_) => ThunkKind::CommandBuffer,
            ThunkOp::Conditional(_) => ThunkKind::Conditional,
            ThunkOp::For(_) => ThunkKind::For,
            ThunkOp::Sequential(_) => ThunkKind::Sequential,
            ThunkOp::While(_) => ThunkKind::While,
            ThunkOp::Infeed(_) => ThunkKind::Infeed,
            ThunkOp::Outfeed(_) => ThunkKind::Outfeed,
            ThunkOp::Collective(t) => t.op().kind(),
            ThunkOp::AsyncStart(t) => t.work().start_kind(),
            ThunkOp::AsyncDone(t) => t.kind,
            ThunkOp::PeerSend(_) => ThunkKind::PeerSend,
            ThunkOp::PeerRecv(_) => ThunkKind::PeerRecv,
            ThunkOp::PartitionId(_) => ThunkKind::PartitionId,
            ThunkOp::ReplicaId(_) => ThunkKind::ReplicaId,
        }
    }

    /// Nested sequences owned by composite ops, in execution order.
    pub fn nested(&self) -> Vec<&ThunkSequence> {
        match self {
            ThunkOp::CommandBuffer(t) => vec![t.commands()],
            ThunkOp::Conditional(t) => t.branches().iter().collect(),
            ThunkOp::For(t) => vec![t.body()],
            ThunkOp::Sequential(seq) => vec![seq],
            ThunkOp::While(t) => vec![t.condition(), t.body()],
            _ => Vec::new(),
        }
    }

    fn nested_mut(&mut self) -> Vec<&mut ThunkSequence> {
        match self {
            ThunkOp::CommandBuffer(t) => vec![&mut t.commands],
            ThunkOp::Conditional(t) => t.branches.iter_mut().collect(),
            ThunkOp::For(t) => vec![&mut t.body],
            ThunkOp::Sequential(seq) => vec![seq],
            ThunkOp::While(t) => vec![&mut t.condition, &mut t.body],
            _ => Vec::new(),
        }
    }

    fn initialize(&self, params: &InitializeParams<'_>) -> Result<()> {
        match self {
            ThunkOp::Kernel(t) | ThunkOp::CustomKernel(t) => t.initialize(params),
            ThunkOp::CustomCall(t) => t.initialize(params),
            ThunkOp::CommandBuffer(t) => t.initialize(params),
            ThunkOp::Conditional(t) => t.initialize(params),
            ThunkOp::For(t) => t.initialize(params),
            ThunkOp::Sequential(seq) => seq.initialize(params),
            ThunkOp::While(t) => t.initialize(params),
            ThunkOp::Collective(t) => t.initialize(params),
            ThunkOp::AsyncStart(t) => t.initialize(params),
            ThunkOp::PeerSend(_) | ThunkOp::PeerRecv(_) => {
                crate::thunks::collective::require_context(params).map(|_| ())
            }
            ThunkOp::Cholesky(_)
            | ThunkOp::Convolution(_)
            | ThunkOp::ConvolutionReorder(_)
            | ThunkOp::GemmEpilogue(_)
            | ThunkOp::Sort(_)
            | ThunkOp::Fft(_)
            | ThunkOp::FusedMha(_)
            | ThunkOp::Gemm(_)
            | ThunkOp::Norm(_)
            | ThunkOp::TriangularSolve(_)
            | ThunkOp::Copy(_)
            | ThunkOp::Memset32BitValue(_)
            | ThunkOp::Memzero(_)
            | ThunkOp::Infeed(_)
            | ThunkOp::Outfeed(_)
            | ThunkOp::AsyncDone(_)
            | ThunkOp::PartitionId(_)
            | ThunkOp::ReplicaId(_) => Ok(()),
        }
    }

    fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        match self {
            ThunkOp::Kernel(t) | ThunkOp::CustomKernel(t) => t.execute(params),
            ThunkOp::Cholesky(t) => t.execute(params),
            ThunkOp::Convolution(t) => t.execute(ThunkKind::Convolution, params),
            ThunkOp::ConvolutionReorder(t) => t.execute(ThunkKind::ConvolutionReorder, params),
            ThunkOp::Norm(t) => t.execute(ThunkKind::Norm, params),
            ThunkOp::GemmEpilogue(t) | ThunkOp::Gemm(t) => t.execute(params),
            ThunkOp::Sort(t) => t.execute(params),
            ThunkOp::CustomCall(t) => t.execute(params),
            ThunkOp::Fft(t) => t.execute(params),
            ThunkOp::FusedMha(t) => t.execute(params),
            ThunkOp::TriangularSolve(t) => t.execute(params),
            ThunkOp::Copy(t) => t.execute(params),
            ThunkOp::Memset32BitValue(t) => t.execute(params),
            ThunkOp::Memzero(t) => t.execute(params),
            ThunkOp::CommandBuffer(t) => t.execute(params),
            ThunkOp::Conditional(t) => t.execute(params),
            ThunkOp::For(t) => t.execute(params),
            ThunkOp::Sequential(seq) => seq.execute(params),
            ThunkOp::While(t) => t.execute(params),
            ThunkOp::Infeed(t) => t.execute(params),
            ThunkOp::Outfeed(t) => t.execute(params),
            ThunkOp::Collective(t) => t.execute(params),
            ThunkOp::AsyncStart(t) => t.execute(params),
            ThunkOp::AsyncDone(t) => t.execute(params),
            ThunkOp::PeerSend(t) => t.execute(params),
            ThunkOp::PeerRecv(t) => t.execute(params),
            ThunkOp::PartitionId(t) => t.execute(ThunkKind::PartitionId, params),
            ThunkOp::ReplicaId(t) => t.execute(ThunkKind::ReplicaId, params),
        }
    }
}

// ============================================================================
// THUNK
// ============================================================================

/// One dispatchable unit of device work.
#[derive(Debug)]
pub struct Thunk {
    info: ThunkInfo,
    op: ThunkOp,
    initialized: Mutex<HashSet<DeviceKey>>,
}

impl Thunk {
    /// Creates a thunk in the created state.
    pub fn new(info: ThunkInfo, op: ThunkOp) -> Self {
        Self {
            info,
            op,
            initialized: Mutex::new(HashSet::new()),
        }
    }

    /// Kind of this thunk.
    pub fn kind(&self) -> ThunkKind {
        self.op.kind()
    }

    /// Profile annotation.
    pub fn profile_annotation(&self) -> &str {
        &self.info.profile_annotation
    }

    /// The instruction this thunk was lowered from, until compile-time info
    /// is cleared.
    pub fn source(&self) -> Option<&SourceRef> {
        self.info.source.as_ref()
    }

    /// Compile-time info.
    pub fn info(&self) -> &ThunkInfo {
        &self.info
    }

    /// Per-kind state.
    pub fn op(&self) -> &ThunkOp {
        &self.op
    }

    /// True once `initialize` has succeeded for `device`.
    pub fn is_initialized_on(&self, device: DeviceKey) -> bool {
        self.initialized.lock().contains(&device)
    }

    /// Prepares the thunk on `params.executor`: loads device code,
    /// instantiates command buffers, resolves custom-call targets. Issues
    /// none of the thunk's work. Safe to call more than once.
    pub fn initialize(&self, params: &InitializeParams<'_>) -> Result<()> {
        self.op.initialize(params)?;
        self.initialized.lock().insert(params.executor.key());
        Ok(())
    }

    /// Issues the thunk's work onto the streams in `params`.
    pub fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let device = params.stream.device();
        if !self.is_initialized_on(device) {
            tracing::error!(
                kind = %self.kind(),
                annotation = %self.info.profile_annotation,
                device = %device,
                "Thunk executed before initialization"
            );
            return Err(RuntimeError::LifecycleViolation {
                kind: self.kind().name().to_string(),
                annotation: self.info.profile_annotation.clone(),
                device: device.to_string(),
            });
        }
        self.op.execute(params)
    }

    /// Drops the reference to the source instruction here and in every
    /// nested sequence. Execution is unaffected.
    pub fn clear_compile_time_info(&mut self) {
        self.info.source = None;
        for seq in self.op.nested_mut() {
            seq.clear_compile_time_info();
        }
    }
}

impl fmt::Display for Thunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.info.profile_annotation)
    }
}

// ============================================================================
// THUNK SEQUENCE
// ============================================================================

/// Ordered list of thunks, executed in list order.
#[derive(Debug, Default)]
pub struct ThunkSequence(Vec<Thunk>);

impl ThunkSequence {
    /// Creates a sequence.
    pub fn new(thunks: Vec<Thunk>) -> Self {
        Self(thunks)
    }

    /// Appends a thunk.
    pub fn push(&mut self, thunk: Thunk) {
        self.0.push(thunk);
    }

    /// Number of top-level thunks.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the sequence holds no thunks.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over top-level thunks.
    pub fn iter(&self) -> std::slice::Iter<'_, Thunk> {
        self.0.iter()
    }

    /// Initializes every thunk in order, stopping at the first failure.
    pub fn initialize(&self, params: &InitializeParams<'_>) -> Result<()> {
        for thunk in &self.0 {
            thunk.initialize(params)?;
        }
        Ok(())
    }

    /// Executes every thunk in order, stopping at the first failure.
    pub fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        for thunk in &self.0 {
            thunk.execute(params)?;
        }
        Ok(())
    }

    /// Clears compile-time info on every thunk, recursively.
    pub fn clear_compile_time_info(&mut self) {
        for thunk in &mut self.0 {
            thunk.clear_compile_time_info();
        }
    }

    /// One line per thunk, nested sequences indented by two more spaces.
    pub fn to_string_indented(&self, indent: usize) -> String {
        let mut out = String::new();
        self.write_indented(&mut out, indent);
        out
    }

    fn write_indented(&self, out: &mut String, indent: usize) {
        for thunk in &self.0 {
            out.push_str(&" ".repeat(indent));
            out.push_str(&thunk.to_string());
            out.push('\n');
            for nested in thunk.op().nested() {
                nested.write_indented(out, indent + 2);
            }
        }
    }
}

impl fmt::Display for ThunkSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_indented(0))
    }
}

impl FromIterator<Thunk> for ThunkSequence {
    fn from_iter<I: IntoIterator<Item = Thunk>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ThunkSequence {
    type Item = Thunk;
    type IntoIter = std::vec::IntoIter<Thunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ThunkSequence {
    type Item = &'a Thunk;
    type IntoIter = std::slice::Iter<'a, Thunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpurt_core::device::{BufferSlice, BufferTable, ExecutableSource, StreamExecutor};
    use gpurt_ir::{ComputationId, InstructionId};

    fn memzero(name: &str, slice: BufferSlice) -> Thunk {
        Thunk::new(ThunkInfo::new(name), ThunkOp::Memzero(MemzeroThunk::new(slice)))
    }

    #[test]
    fn test_execute_before_initialize_is_rejected() {
        let executor = StreamExecutor::host(0);
        let stream = executor.create_stream("main");
        let table = BufferTable::with_sizes(&[16]);
        let thunk = memzero("zero.1", BufferSlice::new(0, 0, 16));

        let err = thunk.execute(&ExecuteParams::new(&table, &stream)).unwrap_err();
        assert!(matches!(err, RuntimeError::LifecycleViolation { .. }));
        assert!(err.to_string().contains("zero.1"));
        assert_eq!(stream.op_count(), 0);
    }

    #[test]
    fn test_initialization_is_per_device() {
        let dev0 = StreamExecutor::host(0);
        let dev1 = StreamExecutor::host(1);
        let src = ExecutableSource::default();
        let table = BufferTable::with_sizes(&[16]);
        let s0 = dev0.create_stream("main");
        let s1 = dev1.create_stream("main");
        let thunk = memzero("zero.1", BufferSlice::new(0, 0, 16));

        thunk.initialize(&InitializeParams::new(&dev0, &src, &table, &s0)).unwrap();
        thunk.execute(&ExecuteParams::new(&table, &s0)).unwrap();
        assert!(matches!(
            thunk.execute(&ExecuteParams::new(&table, &s1)),
            Err(RuntimeError::LifecycleViolation { .. })
        ));
    }

    #[test]
    fn test_kind_and_annotation_stable_across_executions() {
        let executor = StreamExecutor::host(0);
        let src = ExecutableSource::default();
        let table = BufferTable::with_sizes(&[16]);
        let stream = executor.create_stream("main");
        let thunk = memzero("zero.1", BufferSlice::new(0, 0, 16));

        thunk.initialize(&InitializeParams::new(&executor, &src, &table, &stream)).unwrap();
        thunk.initialize(&InitializeParams::new(&executor, &src, &table, &stream)).unwrap();
        for _ in 0..3 {
            thunk.execute(&ExecuteParams::new(&table, &stream)).unwrap();
            assert_eq!(thunk.kind(), ThunkKind::Memzero);
            assert_eq!(thunk.profile_annotation(), "zero.1");
        }
        assert_eq!(stream.op_count(), 3);
    }

    #[test]
    fn test_clear_compile_time_info_recurses() {
        let source = SourceRef {
            computation: ComputationId::new(0),
            instruction: InstructionId::new(1),
            name: "zero.1".to_string(),
        };
        let inner = Thunk::new(
            ThunkInfo::from_source(source.clone()),
            ThunkOp::Memzero(MemzeroThunk::new(BufferSlice::new(0, 0, 4))),
        );
        let mut outer = Thunk::new(
            ThunkInfo::from_source(source),
            ThunkOp::Sequential(ThunkSequence::new(vec![inner])),
        );

        outer.clear_compile_time_info();
        assert!(outer.source().is_none());
        let ThunkOp::Sequential(seq) = outer.op() else {
            panic!("expected a sequential thunk");
        };
        assert!(seq.iter().all(|t| t.source().is_none()));
        assert_eq!(outer.profile_annotation(), "zero.1");
    }

    #[test]
    fn test_sequence_dump_indents_nested() {
        let seq: ThunkSequence = vec![
            memzero("zero.1", BufferSlice::new(0, 0, 4)),
            Thunk::new(
                ThunkInfo::new("seq.2"),
                ThunkOp::Sequential(ThunkSequence::new(vec![memzero("zero.3", BufferSlice::new(0, 4, 4))])),
            ),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            seq.to_string_indented(0),
            "memzero: zero.1\nsequential: seq.2\n  memzero: zero.3\n"
        );
    }
}
