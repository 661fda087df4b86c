//! Integration tests for multi-participant execution: async collectives
//! overlapping local work, synchronous collectives and id queries.

use std::sync::Arc;
use std::thread;

use gpurt::prelude::*;

const RANKS: usize = 2;

/// Installs a log subscriber when `RUST_LOG` is set.
fn init_tracing() {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .without_time()
            .try_init();
    }
}

/// Buffers: 0 = contribution, 1 = all-reduce result, 2 = independent work,
/// 3 = all-gather result, 4 = replica id.
fn program() -> Executable {
    let whole = |i, size| BufferSlice::new(i, 0, size);
    let all_reduce = AsyncOperation::collective(
        CollectiveOp::AllReduce {
            reduction: ReductionKind::Sum,
            buffers: vec![CollectiveBuffer::new(whole(0, 8), whole(1, 8))],
        },
        ThunkInfo::new("ar-start"),
        ThunkInfo::new("ar-done"),
    );
    let (start, done) = all_reduce.into_thunks();

    let thunks: ThunkSequence = vec![
        start,
        Thunk::new(
            ThunkInfo::new("fill"),
            ThunkOp::Memset32BitValue(Memset32Thunk::new(whole(2, 8), 7)),
        ),
        done,
        Thunk::new(
            ThunkInfo::new("ag"),
            ThunkOp::Collective(CollectiveThunk::new(CollectiveOp::AllGather {
                buffers: vec![CollectiveBuffer::new(whole(0, 8), whole(3, 8 * RANKS))],
            })),
        ),
        Thunk::new(ThunkInfo::new("rid"), ThunkOp::ReplicaId(IdThunk::new(whole(4, 4)))),
    ]
    .into_iter()
    .collect();
    Executable::new(thunks, ExecutableSource::default())
}

struct RankOutput {
    reduced: Vec<f32>,
    filled: Vec<u32>,
    gathered: Vec<f32>,
    replica_id: Vec<u32>,
    main_ops: Vec<StreamOp>,
    async_ops: Vec<StreamOp>,
}

fn run_rank(comm: Arc<dyn Communicator>, rank: usize, runs: usize) -> Result<RankOutput> {
    let config = RuntimeConfig::default();
    let executor = StreamExecutor::host(rank);
    let streams = ExecutionStreams::new(&executor, &config);
    let table = BufferTable::with_sizes(&[8, 8, 8, 8 * RANKS, 4]);
    table.whole(0)?.write_from(&[rank as f32, 1.0])?;

    let ctx = CollectiveContext::new(comm);
    let exe = program();
    exe.initialize(&streams, &table, Some(&ctx))?;
    for _ in 0..runs {
        exe.execute(&streams, &table, Some(&ctx), None)?;
    }

    Ok(RankOutput {
        reduced: table.whole(1)?.read_as::<f32>(),
        filled: table.whole(2)?.read_as::<u32>(),
        gathered: table.whole(3)?.read_as::<f32>(),
        replica_id: table.whole(4)?.read_as::<u32>(),
        main_ops: streams.main().ops(),
        async_ops: streams.async_streams()[0].ops(),
    })
}

fn run_all(runs: usize) -> Vec<RankOutput> {
    init_tracing();
    let handles: Vec<_> = InProcessClique::create(RANKS)
        .into_iter()
        .enumerate()
        .map(|(rank, comm)| thread::spawn(move || run_rank(comm, rank, runs)))
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect()
}

/// Test that every rank sees the reduced, gathered and id results.
#[test]
fn test_program_results_per_rank() {
    for (rank, out) in run_all(1).into_iter().enumerate() {
        assert_eq!(out.reduced, vec![1.0, 2.0]);
        assert_eq!(out.filled, vec![7, 7]);
        assert_eq!(out.gathered, vec![0.0, 1.0, 1.0, 1.0]);
        assert_eq!(out.replica_id, vec![rank as u32]);
    }
}

/// Test that the async all-reduce runs on the async stream and the main
/// stream only waits for it.
#[test]
fn test_async_all_reduce_leaves_main_stream() {
    for out in run_all(1) {
        assert!(out
            .async_ops
            .contains(&StreamOp::Communication { op: "all-reduce" }));
        assert!(!out
            .main_ops
            .contains(&StreamOp::Communication { op: "all-reduce" }));
        assert!(out
            .main_ops
            .contains(&StreamOp::Communication { op: "all-gather" }));

        // The async stream waits for the ready event first and records
        // completion last.
        assert!(matches!(out.async_ops.first(), Some(StreamOp::WaitEvent { .. })));
        assert!(matches!(out.async_ops.last(), Some(StreamOp::RecordEvent { .. })));

        // The fill was issued between start and done, before the main
        // stream waited for completion.
        let fill = out
            .main_ops
            .iter()
            .position(|op| matches!(op, StreamOp::Memset32 { value: 7, .. }))
            .unwrap();
        let wait = out
            .main_ops
            .iter()
            .position(|op| matches!(op, StreamOp::WaitEvent { .. }))
            .unwrap();
        assert!(fill < wait);
    }
}

/// Test that a start/done pair can run again on the next execution.
#[test]
fn test_program_runs_repeatedly() {
    for out in run_all(3) {
        assert_eq!(out.reduced, vec![1.0, 2.0]);
        let reduces = out
            .async_ops
            .iter()
            .filter(|op| **op == StreamOp::Communication { op: "all-reduce" })
            .count();
        assert_eq!(reduces, 3);
    }
}

/// Test that initialization without a collective context is rejected.
#[test]
fn test_initialize_requires_context() {
    let executor = StreamExecutor::host(0);
    let streams = ExecutionStreams::new(&executor, &RuntimeConfig::default());
    let table = BufferTable::with_sizes(&[8, 8, 8, 8 * RANKS, 4]);

    let err = program().initialize(&streams, &table, None).unwrap_err();
    assert!(matches!(err, RuntimeError::Collective(_)));
}

/// Test that a single participant degenerates to a local copy on the
/// async stream.
#[test]
fn test_single_participant_async_all_reduce() {
    let executor = StreamExecutor::host(0);
    let streams = ExecutionStreams::new(&executor, &RuntimeConfig::default());
    let table = BufferTable::with_sizes(&[8, 8]);
    table.whole(0).unwrap().write_from(&[3.0f32, 4.0]).unwrap();
    let ctx = CollectiveContext::local();

    let (start, done) = AsyncOperation::collective(
        CollectiveOp::AllReduce {
            reduction: ReductionKind::Sum,
            buffers: vec![CollectiveBuffer::new(
                BufferSlice::new(0, 0, 8),
                BufferSlice::new(1, 0, 8),
            )],
        },
        ThunkInfo::new("ar-start"),
        ThunkInfo::new("ar-done"),
    )
    .into_thunks();
    let exe = Executable::new(vec![start, done].into_iter().collect(), ExecutableSource::default());
    exe.initialize(&streams, &table, Some(&ctx)).unwrap();
    exe.execute(&streams, &table, Some(&ctx), None).unwrap();

    assert_eq!(table.whole(1).unwrap().read_as::<f32>(), vec![3.0, 4.0]);
    assert!(streams.async_streams()[0]
        .ops()
        .contains(&StreamOp::MemcpyD2D { bytes: 8 }));
}

/// Test async host send and recv through an executable.
#[test]
fn test_async_host_transfers() {
    let executor = StreamExecutor::host(0);
    let streams = ExecutionStreams::new(&executor, &RuntimeConfig::default());
    let table = BufferTable::with_sizes(&[8, 8]);
    table.whole(0).unwrap().write_from(&[5u32, 6]).unwrap();
    let queues = HostTransferQueues::new();
    queues.push_to_device(2, 9u32.to_le_bytes().repeat(2));

    let (send_start, send_done) = AsyncOperation::host_send(
        1,
        BufferSlice::new(0, 0, 8),
        ThunkInfo::new("send"),
        ThunkInfo::new("send-done"),
    )
    .into_thunks();
    let (recv_start, recv_done) = AsyncOperation::host_recv(
        2,
        BufferSlice::new(1, 0, 8),
        ThunkInfo::new("recv"),
        ThunkInfo::new("recv-done"),
    )
    .into_thunks();
    let thunks: ThunkSequence = vec![send_start, recv_start, send_done, recv_done]
        .into_iter()
        .collect();
    assert_eq!(
        thunks.iter().map(Thunk::kind).collect::<Vec<_>>(),
        vec![ThunkKind::Send, ThunkKind::Recv, ThunkKind::SendDone, ThunkKind::RecvDone]
    );

    let exe = Executable::new(thunks, ExecutableSource::default());
    exe.initialize(&streams, &table, None).unwrap();
    exe.execute(&streams, &table, None, Some(&queues as &dyn HostTransfer)).unwrap();

    assert_eq!(
        queues.pop_from_device(1).unwrap(),
        [5u32.to_le_bytes(), 6u32.to_le_bytes()].concat()
    );
    assert_eq!(table.whole(1).unwrap().read_as::<u32>(), vec![9, 9]);
}
