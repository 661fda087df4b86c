//! Integration tests for the compile-then-run path: asyncify a module,
//! lower it to thunks and execute them on a host device.

use std::collections::HashMap;
use std::time::Duration;

use gpurt::ir::{ComputationId, InstructionId, InstructionKind, ValidationLevel};
use gpurt::prelude::*;

const HOST: MemorySpace = MemorySpace(5);

fn device_vec() -> Shape {
    Shape::array(PrimitiveType::F32, [4]).with_default_layout()
}

/// `out = copy_to_host(copy_to_device(p0) + p1)` with `p0` in host memory.
fn offload_module() -> Module {
    let mut b = ComputationBuilder::new("entry");
    let p0 = b.parameter("p0", Shape::array(PrimitiveType::F32, [4]).in_memory_space(HOST));
    let p1 = b.parameter("p1", device_vec());
    let c = b.copy("c", p0, device_vec());
    let s = b.add("s", c, p1, device_vec());
    let out = b.copy("out", s, Shape::array(PrimitiveType::F32, [4]).in_memory_space(HOST));
    b.set_root(out);

    let mut mb = ModuleBuilder::new("offload");
    mb.add_entry(b.build());
    mb.build()
}

/// One allocation per array-valued instruction, in post order.
fn assign_buffers(module: &Module, comp: ComputationId) -> (HashMap<InstructionId, usize>, Vec<usize>) {
    let computation = module.computation(comp).unwrap();
    let mut slots = HashMap::new();
    let mut sizes = Vec::new();
    for id in computation.post_order() {
        let inst = computation.get(id).unwrap();
        if matches!(inst.shape, Shape::Array { .. }) {
            slots.insert(id, sizes.len());
            sizes.push(inst.shape.byte_size());
        }
    }
    (slots, sizes)
}

fn lower(module: &Module) -> (ThunkSequence, HashMap<InstructionId, usize>, Vec<usize>) {
    let comp = module.entry().unwrap();
    let computation = module.computation(comp).unwrap();
    let (slots, sizes) = assign_buffers(module, comp);
    let whole = |id: InstructionId| BufferSlice::new(slots[&id], 0, sizes[slots[&id]]);

    let mut thunks = ThunkSequence::default();
    for id in computation.post_order() {
        let inst = computation.get(id).unwrap();
        let info = ThunkInfo::from_source(module.source_ref(comp, id).unwrap());
        let op = match inst.kind {
            InstructionKind::CopyStart => {
                let done = computation.users(id)[0];
                ThunkOp::Copy(CopyThunk::new(whole(inst.operands[0]), whole(done)))
            }
            InstructionKind::Add => ThunkOp::Kernel(KernelThunk::new(
                "add_f32",
                vec![whole(inst.operands[0]), whole(inst.operands[1]), whole(id)],
                LaunchDimensions::new(1, 4),
            )),
            _ => continue,
        };
        thunks.push(Thunk::new(info, op));
    }
    (thunks, slots, sizes)
}

fn register_add(executor: &StreamExecutor) {
    executor.register_kernel("add_f32", |_dims, args| {
        let lhs = args[0].read_as::<f32>();
        let rhs = args[1].read_as::<f32>();
        let sum: Vec<f32> = lhs.iter().zip(&rhs).map(|(a, b)| a + b).collect();
        args[2].write_from(&sum)
    });
}

/// Test that host copies become start/done pairs and the module stays valid.
#[test]
fn test_optimize_asyncifies_host_copies() {
    let config = RuntimeConfig::default();
    let mut module = offload_module();

    assert!(optimize(&mut module, &config).unwrap());
    assert!(module.find("c").is_none());
    assert!(module.find("out").is_none());
    assert!(matches!(module.find("c-start").unwrap().1.kind, InstructionKind::CopyStart));
    assert!(matches!(module.find("out-done").unwrap().1.kind, InstructionKind::CopyDone));
    assert!(module.validate(ValidationLevel::Full).is_ok());

    // Nothing left to rewrite.
    assert!(!optimize(&mut module, &config).unwrap());
}

/// Test that a different host memory space leaves the module alone.
#[test]
fn test_optimize_respects_host_memory_space() {
    let config = RuntimeConfig::builder().with_host_memory_space(1).build();
    let mut module = offload_module();

    assert!(!optimize(&mut module, &config).unwrap());
    assert!(module.find("c").is_some());
}

/// Test the full path from an optimized module to executed thunks.
#[test]
fn test_lowered_module_executes() {
    let config = RuntimeConfig::default();
    let mut module = offload_module();
    optimize(&mut module, &config).unwrap();

    let (thunks, slots, sizes) = lower(&module);
    assert_eq!(thunks.len(), 3);
    assert_eq!(
        thunks.iter().map(Thunk::kind).collect::<Vec<_>>(),
        vec![ThunkKind::Copy, ThunkKind::Kernel, ThunkKind::Copy]
    );

    let executor = StreamExecutor::host(0);
    register_add(&executor);
    let streams = ExecutionStreams::new(&executor, &config);
    let table = BufferTable::with_sizes(&sizes);

    let comp = module.entry().unwrap();
    let computation = module.computation(comp).unwrap();
    let slot = |name: &str| slots[&computation.find(name).unwrap().id];
    table.whole(slot("p0")).unwrap().write_from(&[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    table.whole(slot("p1")).unwrap().write_from(&[10.0f32; 4]).unwrap();

    let exe = Executable::new(thunks, ExecutableSource::from_text(".entry add_f32"));
    exe.initialize(&streams, &table, None).unwrap();
    exe.execute(&streams, &table, None, None).unwrap();

    assert_eq!(
        table.whole(slot("out-done")).unwrap().read_as::<f32>(),
        vec![11.0, 12.0, 13.0, 14.0]
    );

    // A second run reuses the loaded kernel.
    exe.execute(&streams, &table, None, None).unwrap();
    assert_eq!(executor.kernel_loads(), 1);
}

/// Test that thunk sources resolve back to instructions until cleared.
#[test]
fn test_thunk_sources_resolve() {
    let mut module = offload_module();
    optimize(&mut module, &RuntimeConfig::default()).unwrap();
    let (thunks, _, _) = lower(&module);

    let mut exe = Executable::new(thunks, ExecutableSource::default());
    let first = exe.thunks().iter().next().unwrap();
    assert_eq!(first.profile_annotation(), "c-start");
    let inst = module.resolve(first.source().unwrap()).unwrap();
    assert!(matches!(inst.kind, InstructionKind::CopyStart));

    exe.clear_compile_time_info();
    assert!(exe.thunks().iter().all(|t| t.source().is_none()));
    assert_eq!(exe.thunks().iter().next().unwrap().profile_annotation(), "c-start");
}

/// Test that executing before initializing fails without touching buffers.
#[test]
fn test_execute_requires_initialize() {
    let mut module = offload_module();
    optimize(&mut module, &RuntimeConfig::default()).unwrap();
    let (thunks, _, sizes) = lower(&module);

    let executor = StreamExecutor::host(0);
    let streams = ExecutionStreams::new(&executor, &RuntimeConfig::default());
    let table = BufferTable::with_sizes(&sizes);
    let exe = Executable::new(thunks, ExecutableSource::from_text(".entry add_f32"));

    let err = exe.execute(&streams, &table, None, None).unwrap_err();
    assert!(matches!(err, RuntimeError::LifecycleViolation { .. }));
    assert_eq!(streams.main().op_count(), 0);
}

/// Test that autotuning picks the algorithm the lowering will use.
#[test]
fn test_autotune_then_run() {
    let results = vec![
        CandidateResult::success(Duration::from_micros(10), 100)
            .with_algorithm(Algorithm::Named("add_f32_wide".to_string())),
        CandidateResult::success(Duration::from_micros(11), 5)
            .with_algorithm(Algorithm::Named("add_f32".to_string())),
        CandidateResult::success(Duration::from_micros(50), 1)
            .with_algorithm(Algorithm::Named("add_f32_slow".to_string())),
    ];
    let config = RuntimeConfig::builder()
        .with_measurement_error(Duration::from_micros(2))
        .build();
    let best = pick_best_result(&results, Some("s"), &config).unwrap();
    let Some(Algorithm::Named(kernel)) = best.algorithm else {
        panic!("expected a named algorithm");
    };
    assert_eq!(kernel, "add_f32");

    let executor = StreamExecutor::host(1);
    register_add(&executor);
    let table = BufferTable::with_sizes(&[16, 16, 16]);
    let whole = |i| BufferSlice::new(i, 0, 16);
    let thunks: ThunkSequence = vec![Thunk::new(
        ThunkInfo::new("s"),
        ThunkOp::Kernel(KernelThunk::new(
            kernel.clone(),
            vec![whole(0), whole(1), whole(2)],
            LaunchDimensions::new(1, 4),
        )),
    )]
    .into_iter()
    .collect();
    let exe = Executable::new(thunks, ExecutableSource::from_text(format!(".entry {}", kernel)));
    let streams = ExecutionStreams::new(&executor, &config);

    table.whole(0).unwrap().write_from(&[1.0f32; 4]).unwrap();
    table.whole(1).unwrap().write_from(&[2.0f32; 4]).unwrap();
    exe.initialize(&streams, &table, None).unwrap();
    exe.execute(&streams, &table, None, None).unwrap();
    assert_eq!(table.whole(2).unwrap().read_as::<f32>(), vec![3.0; 4]);
}
