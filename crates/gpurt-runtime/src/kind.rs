//! The closed set of thunk kinds.

use std::fmt;

/// Kind of work a thunk performs.
///
/// The set is closed: every kind has a handler and a stable name used in
/// logs and profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ThunkKind {
    // ===== Device kernels =====
    /// Launch of a compiled kernel.
    Kernel,
    /// Launch of a hand-written kernel.
    CustomKernel,

    // ===== Library calls =====
    /// Cholesky decomposition.
    Cholesky,
    /// Convolution.
    Convolution,
    /// Filter/bias reordering for convolution.
    ConvolutionReorder,
    /// Matrix multiply with a bias epilogue.
    GemmEpilogue,
    /// Key sort.
    Sort,
    /// Call into a registered custom-call target.
    CustomCall,
    /// Fast Fourier transform.
    Fft,
    /// Fused multi-head attention.
    FusedMha,
    /// Matrix multiply.
    Gemm,
    /// Normalization.
    Norm,
    /// Triangular solve.
    TriangularSolve,

    // ===== Memory =====
    /// Device-to-device copy.
    Copy,
    /// Fill with a 32-bit pattern.
    Memset32BitValue,
    /// Fill with zeros.
    Memzero,

    // ===== Control =====
    /// Replayable grouping instantiated during initialization.
    CommandBuffer,
    /// Branch selected by a device predicate or index.
    Conditional,
    /// Loop with a fixed trip count.
    For,
    /// Ordered grouping.
    Sequential,
    /// Loop with a device-computed condition.
    While,

    // ===== Host transfer =====
    /// Host-to-device infeed.
    Infeed,
    /// Device-to-host outfeed.
    Outfeed,
    /// Start of a send to the host.
    Send,
    /// Completion of a send to the host.
    SendDone,
    /// Start of a receive from the host.
    Recv,
    /// Completion of a receive from the host.
    RecvDone,

    // ===== Collectives =====
    /// All-gather.
    AllGather,
    /// Start of an async all-gather.
    AllGatherStart,
    /// Completion of an async all-gather.
    AllGatherDone,
    /// All-reduce.
    AllReduce,
    /// Start of an async all-reduce.
    AllReduceStart,
    /// Completion of an async all-reduce.
    AllReduceDone,
    /// All-to-all.
    AllToAll,
    /// Start of an async all-to-all.
    AllToAllStart,
    /// Completion of an async all-to-all.
    AllToAllDone,
    /// Collective permute.
    CollectivePermute,
    /// Start of an async collective permute.
    CollectivePermuteStart,
    /// Completion of an async collective permute.
    CollectivePermuteDone,
    /// Reduce-scatter.
    ReduceScatter,
    /// Start of an async reduce-scatter.
    ReduceScatterStart,
    /// Completion of an async reduce-scatter.
    ReduceScatterDone,
    /// Point-to-point send to a peer.
    PeerSend,
    /// Point-to-point receive from a peer.
    PeerRecv,

    // ===== Metadata =====
    /// Writes the partition id.
    PartitionId,
    /// Writes the replica id.
    ReplicaId,
}

impl ThunkKind {
    /// Every kind, in declaration order.
    pub const ALL: [ThunkKind; 46] = [
        ThunkKind::Kernel,
        ThunkKind::CustomKernel,
        ThunkKind::Cholesky,
        ThunkKind::Convolution,
        ThunkKind::ConvolutionReorder,
        ThunkKind::GemmEpilogue,
        ThunkKind::Sort,
        ThunkKind::CustomCall,
        ThunkKind::Fft,
        ThunkKind::FusedMha,
        ThunkKind::Gemm,
        ThunkKind::Norm,
        ThunkKind::TriangularSolve,
        ThunkKind::Copy,
        ThunkKind::Memset32BitValue,
        ThunkKind::Memzero,
        ThunkKind::CommandBuffer,
        ThunkKind::Conditional,
        ThunkKind::For,
        ThunkKind::Sequential,
        ThunkKind::While,
        ThunkKind::Infeed,
        ThunkKind::Outfeed,
        ThunkKind::Send,
        ThunkKind::SendDone,
        ThunkKind::Recv,
        ThunkKind::RecvDone,
        ThunkKind::AllGather,
        ThunkKind::AllGatherStart,
        ThunkKind::AllGatherDone,
        ThunkKind::AllReduce,
        ThunkKind::AllReduceStart,
        ThunkKind::AllReduceDone,
        ThunkKind::AllToAll,
        ThunkKind::AllToAllStart,
        ThunkKind::AllToAllDone,
        ThunkKind::CollectivePermute,
        ThunkKind::CollectivePermuteStart,
        ThunkKind::CollectivePermuteDone,
        ThunkKind::ReduceScatter,
        ThunkKind::ReduceScatterStart,
        ThunkKind::ReduceScatterDone,
        ThunkKind::PeerSend,
        ThunkKind::PeerRecv,
        ThunkKind::PartitionId,
        ThunkKind::ReplicaId,
    ];

    /// Stable name for logging and telemetry.
    pub fn name(&self) -> &'static str {
        match self {
            ThunkKind::Kernel => "kernel",
            ThunkKind::CustomKernel => "custom-kernel",
            ThunkKind::Cholesky => "cholesky",
            ThunkKind::Convolution => "convolution",
            ThunkKind::ConvolutionReorder => "convolution-reorder",
            ThunkKind::GemmEpilogue => "gemm-epilogue",
            ThunkKind::Sort => "sort",
            ThunkKind::CustomCall => "custom-call",
            ThunkKind::Fft => "fft",
            ThunkKind::FusedMha => "fused-mha",
            ThunkKind::Gemm => "gemm",
            ThunkKind::Norm => "norm",
            ThunkKind::TriangularSolve => "triangular-solve",
            ThunkKind::Copy => "copy",
            ThunkKind::Memset32BitValue => "memset32",
            ThunkKind::Memzero => "memzero",
            ThunkKind::CommandBuffer => "command-buffer",
            ThunkKind::Conditional => "conditional",
            ThunkKind::For => "for",
            ThunkKind::Sequential => "sequential",
            ThunkKind::While => "while",
            ThunkKind::Infeed => "infeed",
            ThunkKind::Outfeed => "outfeed",
            ThunkKind::Send => "send",
            ThunkKind::SendDone => "send-done",
            ThunkKind::Recv => "recv",
            ThunkKind::RecvDone => "recv-done",
            ThunkKind::AllGather => "all-gather",
            ThunkKind::AllGatherStart => "all-gather-start",
            ThunkKind::AllGatherDone => "all-gather-done",
            ThunkKind::AllReduce => "all-reduce",
            ThunkKind::AllReduceStart => "all-reduce-start",
            ThunkKind::AllReduceDone => "all-reduce-done",
            ThunkKind::AllToAll => "all-to-all",
            ThunkKind::AllToAllStart => "all-to-all-start",
            ThunkKind::AllToAllDone => "all-to-all-done",
            ThunkKind::CollectivePermute => "collective-permute",
            ThunkKind::CollectivePermuteStart => "collective-permute-start",
            ThunkKind::CollectivePermuteDone => "collective-permute-done",
            ThunkKind::ReduceScatter => "reduce-scatter",
            ThunkKind::ReduceScatterStart => "reduce-scatter-start",
            ThunkKind::ReduceScatterDone => "reduce-scatter-done",
            ThunkKind::PeerSend => "peer-send",
            ThunkKind::PeerRecv => "peer-recv",
            ThunkKind::PartitionId => "partition-id",
            ThunkKind::ReplicaId => "replica-id",
        }
    }

    /// True for collectives that combine values with a reduction.
    pub fn is_reduction_collective(&self) -> bool {
        matches!(
            self,
            ThunkKind::AllReduce
                | ThunkKind::AllReduceStart
                | ThunkKind::ReduceScatter
                | ThunkKind::ReduceScatterStart
        )
    }

    /// True for the start half of an async pair.
    pub fn is_async_start(&self) -> bool {
        matches!(
            self,
            ThunkKind::Send
                | ThunkKind::Recv
                | ThunkKind::AllGatherStart
                | ThunkKind::AllReduceStart
                | ThunkKind::AllToAllStart
                | ThunkKind::CollectivePermuteStart
                | ThunkKind::ReduceScatterStart
        )
    }

    /// True for the done half of an async pair.
    pub fn is_async_done(&self) -> bool {
        self.start_of_done().is_some()
    }

    /// The start kind paired with this done kind.
    pub fn start_of_done(&self) -> Option<ThunkKind> {
        match self {
            ThunkKind::SendDone => Some(ThunkKind::Send),
            ThunkKind::RecvDone => Some(ThunkKind::Recv),
            ThunkKind::AllGatherDone => Some(ThunkKind::AllGatherStart),
            ThunkKind::AllReduceDone => Some(ThunkKind::AllReduceStart),
            ThunkKind::AllToAllDone => Some(ThunkKind::AllToAllStart),
            ThunkKind::CollectivePermuteDone => Some(ThunkKind::CollectivePermuteStart),
            ThunkKind::ReduceScatterDone => Some(ThunkKind::ReduceScatterStart),
            _ => None,
        }
    }

    /// True for kinds that own nested thunk sequences.
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            ThunkKind::CommandBuffer
                | ThunkKind::Conditional
                | ThunkKind::For
                | ThunkKind::Sequential
                | ThunkKind::While
        )
    }
}

impl fmt::Display for ThunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
