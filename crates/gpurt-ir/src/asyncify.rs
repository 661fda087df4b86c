//! Host memory transfer asyncification.
//!
//! Rewrites blocking transfers between host and device memory into
//! start/done pairs so the transfer can overlap with other work:
//!
//! ```text
//! ds = f32[4]{0} dynamic-slice(host_buf, i)
//!   ==>
//! ds-start = ((f32[16]{0:S(5)}, s32[]), f32[4]{0}, u32[], s32[]) dynamic-slice-start(host_buf, i)
//! ds-done  = f32[4]{0} dynamic-slice-done(ds-start)
//! ```
//!
//! Handled instructions:
//!
//! - **dynamic-slice** from host memory into device memory
//! - **dynamic-update-slice** of device data into a host buffer
//! - **copy** between host and device memory, in either direction
//!
//! Every candidate is checked before anything is rewritten, so a missing
//! layout anywhere leaves the module untouched.

use crate::{
    ComputationId, InstructionId, InstructionKind, IrError, IrResult, MemorySpace, Module,
    ModulePass, PrimitiveType, Shape,
};

/// Converts host/device transfers into asynchronous start/done pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTransferAsyncifier {
    host_memory_space: MemorySpace,
}

#[derive(Debug)]
enum Rewrite {
    Generic {
        computation: ComputationId,
        instruction: InstructionId,
        context_shapes: Vec<Shape>,
    },
    Copy {
        computation: ComputationId,
        instruction: InstructionId,
    },
}

impl HostTransferAsyncifier {
    /// Create the pass for host memory tagged with `host_memory_space`.
    pub fn new(host_memory_space: i64) -> Self {
        Self {
            host_memory_space: MemorySpace(host_memory_space),
        }
    }

    /// The memory space treated as host memory.
    pub fn host_memory_space(&self) -> MemorySpace {
        self.host_memory_space
    }

    fn plan(&self, module: &Module) -> IrResult<Vec<Rewrite>> {
        let mut plan = Vec::new();
        for computation_id in module.non_fusion_computations() {
            let computation = module.computation(computation_id)?;
            for id in computation.post_order() {
                let inst = computation.get(id)?;
                let rewrite = match &inst.kind {
                    InstructionKind::DynamicSlice { .. } => {
                        self.plan_dynamic_slice(module, computation_id, id)?
                    }
                    InstructionKind::DynamicUpdateSlice => {
                        self.plan_dynamic_update_slice(module, computation_id, id)?
                    }
                    InstructionKind::Copy => self.plan_copy(module, computation_id, id)?,
                    _ => None,
                };
                plan.extend(rewrite);
            }
        }
        Ok(plan)
    }

    fn plan_dynamic_slice(
        &self,
        module: &Module,
        computation: ComputationId,
        id: InstructionId,
    ) -> IrResult<Option<Rewrite>> {
        let comp = module.computation(computation)?;
        let slice = comp.get(id)?;
        let operand = comp.get(operand_of(slice, 0)?)?;

        let dst = laid_out_space(&slice.shape, &slice.name, || {
            format!("{} does not have a layout.", slice.name)
        })?;
        let src = laid_out_space(&operand.shape, &slice.name, || {
            format!("{}'s operand, {}, does not have a layout.", slice.name, operand.name)
        })?;
        let (Some(dst), Some(src)) = (dst, src) else {
            tracing::trace!(instruction = %slice.name, "Skipping tuple-shaped dynamic-slice");
            return Ok(None);
        };

        if src != self.host_memory_space {
            tracing::trace!(instruction = %slice.name, "Skipping dynamic-slice not reading host memory");
            return Ok(None);
        }
        if dst != MemorySpace::DEFAULT {
            tracing::trace!(instruction = %slice.name, "Skipping dynamic-slice not writing device memory");
            return Ok(None);
        }

        tracing::debug!(
            instruction = %slice.name,
            "Dynamic-slice reads host memory, converting to async"
        );
        Ok(Some(Rewrite::Generic {
            computation,
            instruction: id,
            context_shapes: vec![
                Shape::scalar(PrimitiveType::U32),
                Shape::scalar(PrimitiveType::S32),
            ],
        }))
    }

    fn plan_dynamic_update_slice(
        &self,
        module: &Module,
        computation: ComputationId,
        id: InstructionId,
    ) -> IrResult<Option<Rewrite>> {
        let comp = module.computation(computation)?;
        let dus = comp.get(id)?;
        let base = comp.get(operand_of(dus, 0)?)?;
        let update = comp.get(operand_of(dus, 1)?)?;

        let dst = laid_out_space(&dus.shape, &dus.name, || {
            format!("{} does not have a layout.", dus.name)
        })?;
        let base_space = laid_out_space(&base.shape, &dus.name, || {
            format!("{}'s operand, {}, does not have a layout.", dus.name, base.name)
        })?;
        let update_space = laid_out_space(&update.shape, &dus.name, || {
            format!("{}'s update, {}, does not have a layout.", dus.name, update.name)
        })?;
        let (Some(dst), Some(base_space), Some(update_space)) = (dst, base_space, update_space) else {
            tracing::trace!(instruction = %dus.name, "Skipping tuple-shaped dynamic-update-slice");
            return Ok(None);
        };

        if update_space != MemorySpace::DEFAULT {
            tracing::trace!(instruction = %dus.name, "Skipping dynamic-update-slice not reading device memory");
            return Ok(None);
        }
        if dst != self.host_memory_space {
            tracing::trace!(instruction = %dus.name, "Skipping dynamic-update-slice not writing host memory");
            return Ok(None);
        }
        if base_space != dst {
            return Err(IrError::Internal(format!(
                "Unexpected that {}'s memory space is not the same as the dynamic-update-slice.",
                base.name
            )));
        }

        tracing::debug!(
            instruction = %dus.name,
            "Dynamic-update-slice writes host memory, converting to async"
        );
        Ok(Some(Rewrite::Generic {
            computation,
            instruction: id,
            context_shapes: vec![Shape::scalar(PrimitiveType::U32)],
        }))
    }

    fn plan_copy(
        &self,
        module: &Module,
        computation: ComputationId,
        id: InstructionId,
    ) -> IrResult<Option<Rewrite>> {
        let comp = module.computation(computation)?;
        let copy = comp.get(id)?;
        let operand = comp.get(operand_of(copy, 0)?)?;

        let src = laid_out_space(&operand.shape, &operand.name, || {
            format!("{} does not have a layout.", operand.name)
        })?;
        let dst = laid_out_space(&copy.shape, &copy.name, || {
            format!("{} does not have a layout.", copy.name)
        })?;
        let (Some(src), Some(dst)) = (src, dst) else {
            tracing::trace!(instruction = %copy.name, "Skipping tuple-shaped copy");
            return Ok(None);
        };

        let host = self.host_memory_space;
        let to_device = src == host && dst == MemorySpace::DEFAULT;
        let to_host = src == MemorySpace::DEFAULT && dst == host;
        if !(to_device || to_host) {
            tracing::trace!(
                instruction = %copy.name,
                src = %src,
                dst = %dst,
                "Skipping copy that is not between device and host memory"
            );
            return Ok(None);
        }

        tracing::debug!(
            instruction = %copy.name,
            to_host,
            "Copy is between device and host memory, converting to async"
        );
        Ok(Some(Rewrite::Copy {
            computation,
            instruction: id,
        }))
    }

    fn apply(module: &mut Module, rewrite: Rewrite) -> IrResult<()> {
        match rewrite {
            Rewrite::Generic {
                computation,
                instruction,
                context_shapes,
            } => {
                module
                    .computation_mut(computation)?
                    .create_async_instructions(instruction, &context_shapes)?;
            }
            Rewrite::Copy {
                computation,
                instruction,
            } => {
                module
                    .computation_mut(computation)?
                    .create_async_copy(instruction)?;
            }
        }
        Ok(())
    }
}

/// Memory space of an array shape, `None` for a laid-out tuple. A shape
/// with any unresolved layout is an error.
fn laid_out_space(
    shape: &Shape,
    instruction: &str,
    detail: impl FnOnce() -> String,
) -> IrResult<Option<MemorySpace>> {
    if !shape.has_layout() {
        return Err(IrError::missing_layout(instruction, detail()));
    }
    Ok(shape.memory_space())
}

fn operand_of(inst: &crate::Instruction, index: usize) -> IrResult<InstructionId> {
    inst.operand(index).ok_or_else(|| IrError::InvalidOperand {
        instruction: inst.name.clone(),
        detail: format!("missing operand {}", index),
    })
}

impl ModulePass for HostTransferAsyncifier {
    fn name(&self) -> &'static str {
        "host-memory-transfer-asyncifier"
    }

    fn run(&self, module: &mut Module) -> IrResult<bool> {
        let plan = self.plan(module)?;
        let changed = !plan.is_empty();
        let rewrites = plan.len();
        for rewrite in plan {
            Self::apply(module, rewrite)?;
        }
        if changed {
            tracing::debug!(module = module.name(), rewrites, "Asyncified host memory transfers");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ComputationBuilder, ModuleBuilder, ValidationLevel};

    const HOST: MemorySpace = MemorySpace(5);

    fn vec_shape(len: i64) -> Shape {
        Shape::array(PrimitiveType::F32, [len])
    }

    fn index() -> Shape {
        Shape::scalar(PrimitiveType::S32)
    }

    fn single_entry(b: ComputationBuilder) -> Module {
        let mut mb = ModuleBuilder::new("m");
        mb.add_entry(b.build());
        mb.build()
    }

    fn pass() -> HostTransferAsyncifier {
        HostTransferAsyncifier::new(5)
    }

    fn kind_of(module: &Module, name: &str) -> Option<InstructionKind> {
        module.find(name).map(|(_, i)| i.kind.clone())
    }

    #[test]
    fn test_dynamic_slice_from_host_is_asyncified() {
        let mut b = ComputationBuilder::new("entry");
        let p = b.parameter("p", vec_shape(16).in_memory_space(HOST));
        let i = b.parameter("i", index());
        let ds = b.dynamic_slice("ds", p, &[i], vec![4], vec_shape(4).with_default_layout());
        let neg = b.add("use", ds, ds, vec_shape(4).with_default_layout());
        b.set_root(neg);
        let mut module = single_entry(b);

        assert!(pass().run(&mut module).unwrap());
        assert!(kind_of(&module, "ds").is_none());

        let (_, done) = module.find("ds-done").unwrap();
        let (_, start) = module.find("ds-start").unwrap();
        assert_eq!(start.operands, vec![p, i]);
        assert_eq!(start.shape.tuple_element(2), Some(&Shape::scalar(PrimitiveType::U32)));
        assert_eq!(start.shape.tuple_element(3), Some(&Shape::scalar(PrimitiveType::S32)));
        let (_, user) = module.find("use").unwrap();
        assert_eq!(user.operands, vec![done.id, done.id]);
        assert!(module.validate(ValidationLevel::Full).is_ok());
    }

    #[test]
    fn test_dynamic_slice_within_device_is_skipped() {
        let mut b = ComputationBuilder::new("entry");
        let p = b.parameter("p", vec_shape(16).with_default_layout());
        let i = b.parameter("i", index());
        let ds = b.dynamic_slice("ds", p, &[i], vec![4], vec_shape(4).with_default_layout());
        b.set_root(ds);
        let mut module = single_entry(b);

        assert!(!pass().run(&mut module).unwrap());
        assert!(kind_of(&module, "ds").is_some());
    }

    #[test]
    fn test_dynamic_update_slice_into_host() {
        let mut b = ComputationBuilder::new("entry");
        let base = b.parameter("base", vec_shape(16).in_memory_space(HOST));
        let update = b.parameter("update", vec_shape(4).with_default_layout());
        let i = b.parameter("i", index());
        let dus = b.dynamic_update_slice("dus", base, update, &[i], vec_shape(16).in_memory_space(HOST));
        b.set_root(dus);
        let mut module = single_entry(b);

        assert!(pass().run(&mut module).unwrap());
        let (comp, done) = module.find("dus-done").unwrap();
        assert_eq!(module.computation(comp).unwrap().root(), Some(done.id));
        let (_, start) = module.find("dus-start").unwrap();
        match &start.shape {
            Shape::Tuple(elements) => assert_eq!(elements.len(), 3),
            other => panic!("unexpected start shape {}", other),
        }
    }

    #[test]
    fn test_dynamic_update_slice_base_space_mismatch() {
        let mut b = ComputationBuilder::new("entry");
        let base = b.parameter("base", vec_shape(16).with_default_layout());
        let update = b.parameter("update", vec_shape(4).with_default_layout());
        let i = b.parameter("i", index());
        let dus = b.dynamic_update_slice("dus", base, update, &[i], vec_shape(16).in_memory_space(HOST));
        b.set_root(dus);
        let mut module = single_entry(b);

        let err = pass().run(&mut module).unwrap_err();
        assert!(matches!(err, IrError::Internal(ref msg) if msg.contains("base's memory space")));
    }

    #[test]
    fn test_copy_both_directions() {
        let mut b = ComputationBuilder::new("entry");
        let p = b.parameter("p", vec_shape(8).in_memory_space(HOST));
        let to_device = b.copy("to_device", p, vec_shape(8).with_default_layout());
        let to_host = b.copy("to_host", to_device, vec_shape(8).in_memory_space(HOST));
        b.set_root(to_host);
        let mut module = single_entry(b);

        assert!(pass().run(&mut module).unwrap());
        assert_eq!(kind_of(&module, "to_device-start"), Some(InstructionKind::CopyStart));
        assert_eq!(kind_of(&module, "to_host-done"), Some(InstructionKind::CopyDone));
        assert!(kind_of(&module, "to_device").is_none());

        // The second copy now reads from the first one's done.
        let (_, first_done) = module.find("to_device-done").unwrap();
        let (_, second_start) = module.find("to_host-start").unwrap();
        assert_eq!(second_start.operands, vec![first_done.id]);
        assert_eq!(
            second_start.shape,
            Shape::tuple(vec![
                vec_shape(8).in_memory_space(HOST),
                vec_shape(8).with_default_layout(),
                Shape::scalar(PrimitiveType::U32),
            ])
        );
        assert!(module.validate(ValidationLevel::Full).is_ok());
    }

    #[test]
    fn test_same_space_copy_is_untouched() {
        let mut b = ComputationBuilder::new("entry");
        let p = b.parameter("p", vec_shape(8).in_memory_space(HOST));
        let c = b.copy("c", p, vec_shape(8).in_memory_space(HOST));
        b.set_root(c);
        let mut module = single_entry(b);
        let before = module.to_string();

        assert!(!pass().run(&mut module).unwrap());
        assert_eq!(module.to_string(), before);
    }

    #[test]
    fn test_second_run_is_noop() {
        let mut b = ComputationBuilder::new("entry");
        let p = b.parameter("p", vec_shape(16).in_memory_space(HOST));
        let i = b.parameter("i", index());
        let ds = b.dynamic_slice("ds", p, &[i], vec![4], vec_shape(4).with_default_layout());
        let c = b.copy("c", ds, vec_shape(4).in_memory_space(HOST));
        b.set_root(c);
        let mut module = single_entry(b);

        assert!(pass().run(&mut module).unwrap());
        let after_first = module.to_string();
        assert!(!pass().run(&mut module).unwrap());
        assert_eq!(module.to_string(), after_first);
    }

    #[test]
    fn test_missing_layout_aborts_without_mutation() {
        let mut b = ComputationBuilder::new("entry");
        let p = b.parameter("p", vec_shape(8).in_memory_space(HOST));
        // Would be rewritten if the pass got that far.
        let good = b.copy("good", p, vec_shape(8).with_default_layout());
        let q = b.parameter("q", vec_shape(16));
        let i = b.parameter("i", index());
        let ds = b.dynamic_slice("ds", q, &[i], vec![4], vec_shape(4).with_default_layout());
        let t = b.tuple("t", vec![good, ds]);
        b.set_root(t);
        let mut module = single_entry(b);
        let before = module.to_string();

        let err = pass().run(&mut module).unwrap_err();
        assert_eq!(
            err,
            IrError::missing_layout("ds", "ds's operand, q, does not have a layout.")
        );
        assert_eq!(module.to_string(), before);
    }

    #[test]
    fn test_missing_update_layout() {
        let mut b = ComputationBuilder::new("entry");
        let base = b.parameter("base", vec_shape(16).in_memory_space(HOST));
        let update = b.parameter("update", vec_shape(4));
        let i = b.parameter("i", index());
        let dus = b.dynamic_update_slice("dus", base, update, &[i], vec_shape(16).in_memory_space(HOST));
        b.set_root(dus);
        let mut module = single_entry(b);

        let err = pass().run(&mut module).unwrap_err();
        assert!(err.to_string().contains("dus's update, update, does not have a layout."));
    }

    /// Runs the pass expecting a layout error and an untouched module.
    fn assert_missing_layout(mut module: Module, instruction: &str, detail: &str) {
        let before = module.to_string();
        let err = pass().run(&mut module).unwrap_err();
        assert_eq!(err, IrError::missing_layout(instruction, detail));
        assert_eq!(module.to_string(), before);
    }

    fn dus_module(base: Shape, result: Shape) -> Module {
        let mut b = ComputationBuilder::new("entry");
        let base = b.parameter("base", base);
        let update = b.parameter("update", vec_shape(4).with_default_layout());
        let i = b.parameter("i", index());
        let dus = b.dynamic_update_slice("dus", base, update, &[i], result);
        b.set_root(dus);
        single_entry(b)
    }

    fn copy_module(src: Shape, dst: Shape) -> Module {
        let mut b = ComputationBuilder::new("entry");
        let p = b.parameter("p", src);
        let c = b.copy("c", p, dst);
        b.set_root(c);
        single_entry(b)
    }

    #[test]
    fn test_missing_dynamic_update_slice_result_layout() {
        let module = dus_module(vec_shape(16).in_memory_space(HOST), vec_shape(16));
        assert_missing_layout(module, "dus", "dus does not have a layout.");
    }

    #[test]
    fn test_missing_dynamic_update_slice_base_layout() {
        let module = dus_module(vec_shape(16), vec_shape(16).in_memory_space(HOST));
        assert_missing_layout(module, "dus", "dus's operand, base, does not have a layout.");
    }

    #[test]
    fn test_missing_copy_operand_layout() {
        let module = copy_module(vec_shape(8), vec_shape(8).in_memory_space(HOST));
        assert_missing_layout(module, "p", "p does not have a layout.");
    }

    #[test]
    fn test_missing_copy_result_layout() {
        let module = copy_module(vec_shape(8).in_memory_space(HOST), vec_shape(8));
        assert_missing_layout(module, "c", "c does not have a layout.");
    }

    #[test]
    fn test_tuple_copy_is_skipped() {
        let pair = || Shape::tuple(vec![vec_shape(8).in_memory_space(HOST), vec_shape(8).with_default_layout()]);
        let mut module = copy_module(pair(), pair());
        let before = module.to_string();

        assert!(!pass().run(&mut module).unwrap());
        assert_eq!(module.to_string(), before);
        assert_eq!(kind_of(&module, "c"), Some(InstructionKind::Copy));
    }

    #[test]
    fn test_tuple_copy_with_unresolved_element_is_missing_layout() {
        let src = Shape::tuple(vec![vec_shape(8).in_memory_space(HOST), vec_shape(8)]);
        let dst = Shape::tuple(vec![vec_shape(8).in_memory_space(HOST), vec_shape(8).with_default_layout()]);
        let module = copy_module(src, dst);
        assert_missing_layout(module, "p", "p does not have a layout.");
    }

    #[test]
    fn test_fusion_computations_are_not_visited() {
        let mut mb = ModuleBuilder::new("m");
        let mut fused = ComputationBuilder::fusion("fused");
        let a = fused.parameter("a", vec_shape(8).in_memory_space(HOST));
        let c = fused.copy("inner_copy", a, vec_shape(8).with_default_layout());
        fused.set_root(c);
        let fused_id = mb.add_computation(fused.build());

        let mut entry = ComputationBuilder::new("entry");
        let p = entry.parameter("p", vec_shape(8).in_memory_space(HOST));
        let f = entry.fusion_call("f", fused_id, vec![p], vec_shape(8).with_default_layout());
        entry.set_root(f);
        mb.add_entry(entry.build());
        let mut module = mb.build();

        assert!(!pass().run(&mut module).unwrap());
        assert_eq!(kind_of(&module, "inner_copy"), Some(InstructionKind::Copy));
    }
}
