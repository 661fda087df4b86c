//! Collective and point-to-point communication.
//!
//! A [`CollectiveOp`] is the communication work itself; it runs either
//! synchronously on the main stream ([`CollectiveThunk`]) or on an async
//! stream as the start half of an
//! [`AsyncOperation`](crate::async_op::AsyncOperation).
//!
//! Reductions operate on `f32`. A clique of one participant degenerates to
//! a device-local copy for every collective except permute, which follows
//! its source/target pairs and zero-fills destinations nobody sends to.

use gpurt_core::device::collective::{
    all_gather, all_reduce, all_to_all, collective_permute, reduce_scatter,
};
use gpurt_core::device::{BufferSlice, ReductionKind, Stream};
use gpurt_core::error::{Result, RuntimeError};

use crate::kind::ThunkKind;
use crate::params::{CollectiveContext, ExecuteParams, InitializeParams};

/// Source and destination of one collective operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectiveBuffer {
    /// Local contribution.
    pub source: BufferSlice,
    /// Result for this participant.
    pub destination: BufferSlice,
}

impl CollectiveBuffer {
    /// Creates a buffer pair.
    pub fn new(source: BufferSlice, destination: BufferSlice) -> Self {
        Self { source, destination }
    }
}

/// Communication performed by a collective thunk.
#[derive(Debug, Clone)]
pub enum CollectiveOp {
    /// Elementwise reduction; every participant gets the full result.
    AllReduce {
        /// Reduction applied.
        reduction: ReductionKind,
        /// Operands.
        buffers: Vec<CollectiveBuffer>,
    },
    /// Concatenation of every participant's contribution in rank order.
    AllGather {
        /// Operands.
        buffers: Vec<CollectiveBuffer>,
    },
    /// Reduction; each participant keeps its rank's chunk.
    ReduceScatter {
        /// Reduction applied.
        reduction: ReductionKind,
        /// Operands.
        buffers: Vec<CollectiveBuffer>,
    },
    /// Chunk `i` of every contribution goes to rank `i`.
    AllToAll {
        /// Operands.
        buffers: Vec<CollectiveBuffer>,
    },
    /// Moves data along `(source, target)` rank pairs.
    CollectivePermute {
        /// `(source, target)` pairs.
        pairs: Vec<(usize, usize)>,
        /// Operand.
        buffer: CollectiveBuffer,
    },
}

impl CollectiveOp {
    /// Kind of the synchronous thunk.
    pub fn kind(&self) -> ThunkKind {
        match self {
            CollectiveOp::AllReduce { .. } => ThunkKind::AllReduce,
            CollectiveOp::AllGather { .. } => ThunkKind::AllGather,
            CollectiveOp::ReduceScatter { .. } => ThunkKind::ReduceScatter,
            CollectiveOp::AllToAll { .. } => ThunkKind::AllToAll,
            CollectiveOp::CollectivePermute { .. } => ThunkKind::CollectivePermute,
        }
    }

    /// Kind of the async start thunk.
    pub fn start_kind(&self) -> ThunkKind {
        match self {
            CollectiveOp::AllReduce { .. } => ThunkKind::AllReduceStart,
            CollectiveOp::AllGather { .. } => ThunkKind::AllGatherStart,
            CollectiveOp::ReduceScatter { .. } => ThunkKind::ReduceScatterStart,
            CollectiveOp::AllToAll { .. } => ThunkKind::AllToAllStart,
            CollectiveOp::CollectivePermute { .. } => ThunkKind::CollectivePermuteStart,
        }
    }

    /// Kind of the async done thunk.
    pub fn done_kind(&self) -> ThunkKind {
        match self {
            CollectiveOp::AllReduce { .. } => ThunkKind::AllReduceDone,
            CollectiveOp::AllGather { .. } => ThunkKind::AllGatherDone,
            CollectiveOp::ReduceScatter { .. } => ThunkKind::ReduceScatterDone,
            CollectiveOp::AllToAll { .. } => ThunkKind::AllToAllDone,
            CollectiveOp::CollectivePermute { .. } => ThunkKind::CollectivePermuteDone,
        }
    }

    /// Operand pairs.
    pub fn buffers(&self) -> &[CollectiveBuffer] {
        match self {
            CollectiveOp::AllReduce { buffers, .. }
            | CollectiveOp::AllGather { buffers }
            | CollectiveOp::ReduceScatter { buffers, .. }
            | CollectiveOp::AllToAll { buffers } => buffers,
            CollectiveOp::CollectivePermute { buffer, .. } => std::slice::from_ref(buffer),
        }
    }

    /// Issues the communication onto `stream`.
    pub(crate) fn run(&self, params: &ExecuteParams<'_>, stream: &Stream) -> Result<()> {
        let comm = params.collective()?.communicator();
        let name = self.kind().name();

        if comm.size() == 1 && !matches!(self, CollectiveOp::CollectivePermute { .. }) {
            tracing::trace!(op = name, "Single participant, copying locally");
            for buffer in self.buffers() {
                let src = params.region(&buffer.source)?;
                let dst = params.region(&buffer.destination)?;
                stream.memcpy_d2d(&dst, &src)?;
            }
            return Ok(());
        }

        let resolved = self
            .buffers()
            .iter()
            .map(|b| Ok((params.region(&b.source)?, params.region(&b.destination)?)))
            .collect::<Result<Vec<_>>>()?;

        stream.run_communication(name, || {
            for (src, dst) in &resolved {
                match self {
                    CollectiveOp::AllReduce { reduction, .. } => {
                        dst.write_from(&all_reduce(comm, *reduction, &src.read_as::<f32>())?)?
                    }
                    CollectiveOp::AllGather { .. } => dst.write(&all_gather(comm, &src.read())?)?,
                    CollectiveOp::ReduceScatter { reduction, .. } => {
                        dst.write_from(&reduce_scatter(comm, *reduction, &src.read_as::<f32>())?)?
                    }
                    CollectiveOp::AllToAll { .. } => dst.write(&all_to_all(comm, &src.read())?)?,
                    CollectiveOp::CollectivePermute { pairs, .. } => {
                        match collective_permute(comm, pairs, &src.read())? {
                            Some(data) => dst.write(&data)?,
                            None => dst.fill(0),
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

pub(crate) fn require_context<'a>(params: &InitializeParams<'a>) -> Result<&'a CollectiveContext> {
    params.collective.ok_or_else(|| {
        RuntimeError::Collective("collective thunk initialized without a collective context".to_string())
    })
}

/// Synchronous collective on the main stream.
#[derive(Debug, Clone)]
pub struct CollectiveThunk {
    op: CollectiveOp,
}

impl CollectiveThunk {
    /// Creates a synchronous collective.
    pub fn new(op: CollectiveOp) -> Self {
        Self { op }
    }

    /// The communication.
    pub fn op(&self) -> &CollectiveOp {
        &self.op
    }

    pub(crate) fn initialize(&self, params: &InitializeParams<'_>) -> Result<()> {
        let ctx = require_context(params)?;
        tracing::debug!(
            op = self.op.kind().name(),
            participants = ctx.num_participants(),
            "Initialized collective"
        );
        Ok(())
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        self.op.run(params, params.stream)
    }
}

/// Sends a slice to one peer.
#[derive(Debug, Clone)]
pub struct PeerSendThunk {
    peer: usize,
    source: BufferSlice,
}

impl PeerSendThunk {
    /// Sends `source` to rank `peer`.
    pub fn new(peer: usize, source: BufferSlice) -> Self {
        Self { peer, source }
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let comm = params.collective()?.communicator();
        let src = params.region(&self.source)?;
        params
            .stream
            .run_communication("peer-send", || comm.send(self.peer, src.read()))
    }
}

/// Receives a slice from one peer.
#[derive(Debug, Clone)]
pub struct PeerRecvThunk {
    peer: usize,
    destination: BufferSlice,
}

impl PeerRecvThunk {
    /// Receives from rank `peer` into `destination`.
    pub fn new(peer: usize, destination: BufferSlice) -> Self {
        Self { peer, destination }
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let comm = params.collective()?.communicator();
        let dst = params.region(&self.destination)?;
        params
            .stream
            .run_communication("peer-recv", || dst.write(&comm.recv(self.peer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpurt_core::device::{BufferTable, Communicator, InProcessClique, StreamExecutor, StreamOp};
    use std::thread;

    fn all_reduce_op(reduction: ReductionKind) -> CollectiveOp {
        CollectiveOp::AllReduce {
            reduction,
            buffers: vec![CollectiveBuffer::new(BufferSlice::new(0, 0, 8), BufferSlice::new(1, 0, 8))],
        }
    }

    #[test]
    fn test_single_participant_copies_locally() {
        let executor = StreamExecutor::host(0);
        let stream = executor.create_stream("main");
        let table = BufferTable::with_sizes(&[8, 8]);
        table.whole(0).unwrap().write_from(&[1.5f32, 2.5]).unwrap();
        let ctx = CollectiveContext::local();

        CollectiveThunk::new(all_reduce_op(ReductionKind::Sum))
            .execute(&ExecuteParams::new(&table, &stream).with_collective(&ctx))
            .unwrap();
        assert_eq!(table.whole(1).unwrap().read_as::<f32>(), vec![1.5, 2.5]);
        assert_eq!(stream.ops(), vec![StreamOp::MemcpyD2D { bytes: 8 }]);
    }

    #[test]
    fn test_requires_context() {
        let executor = StreamExecutor::host(0);
        let stream = executor.create_stream("main");
        let table = BufferTable::with_sizes(&[8, 8]);
        let err = CollectiveThunk::new(all_reduce_op(ReductionKind::Sum))
            .execute(&ExecuteParams::new(&table, &stream))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Collective(_)));
    }

    #[test]
    fn test_all_reduce_across_ranks() {
        let handles: Vec<_> = InProcessClique::create(3)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.rank();
                    let executor = StreamExecutor::host(rank);
                    let stream = executor.create_stream("main");
                    let table = BufferTable::with_sizes(&[8, 8]);
                    table
                        .whole(0)
                        .unwrap()
                        .write_from(&[rank as f32, 1.0])
                        .unwrap();
                    let ctx = CollectiveContext::new(comm);
                    CollectiveThunk::new(all_reduce_op(ReductionKind::Max))
                        .execute(&ExecuteParams::new(&table, &stream).with_collective(&ctx))
                        .unwrap();
                    table.whole(1).unwrap().read_as::<f32>()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![2.0, 1.0]);
        }
    }

    #[test]
    fn test_permute_zero_fills_untargeted_rank() {
        let handles: Vec<_> = InProcessClique::create(2)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.rank();
                    let executor = StreamExecutor::host(rank);
                    let stream = executor.create_stream("main");
                    let table = BufferTable::with_sizes(&[4, 4]);
                    table.whole(0).unwrap().write(&[rank as u8 + 1; 4]).unwrap();
                    table.whole(1).unwrap().write(&[9; 4]).unwrap();
                    let ctx = CollectiveContext::new(comm);
                    let op = CollectiveOp::CollectivePermute {
                        pairs: vec![(0, 1)],
                        buffer: CollectiveBuffer::new(BufferSlice::new(0, 0, 4), BufferSlice::new(1, 0, 4)),
                    };
                    CollectiveThunk::new(op)
                        .execute(&ExecuteParams::new(&table, &stream).with_collective(&ctx))
                        .unwrap();
                    (rank, table.whole(1).unwrap().read())
                })
            })
            .collect();
        for handle in handles {
            let (rank, data) = handle.join().unwrap();
            let expected = if rank == 1 { vec![1; 4] } else { vec![0; 4] };
            assert_eq!(data, expected);
        }
    }

    #[test]
    fn test_peer_send_recv() {
        let handles: Vec<_> = InProcessClique::create(2)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.rank();
                    let executor = StreamExecutor::host(rank);
                    let stream = executor.create_stream("main");
                    let table = BufferTable::with_sizes(&[4]);
                    let ctx = CollectiveContext::new(comm);
                    let params = ExecuteParams::new(&table, &stream).with_collective(&ctx);
                    if rank == 0 {
                        table.whole(0).unwrap().write(&[7, 7, 7, 7]).unwrap();
                        PeerSendThunk::new(1, BufferSlice::new(0, 0, 4)).execute(&params).unwrap();
                    } else {
                        PeerRecvThunk::new(0, BufferSlice::new(0, 0, 4)).execute(&params).unwrap();
                    }
                    table.whole(0).unwrap().read()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![7; 4]);
        }
    }
}
