//! IR builder API.
//!
//! Provides an ergonomic interface for constructing modules. Builders do
//! not check operand references; run the [`Validator`](crate::Validator) on
//! the result.

use crate::{Computation, ComputationId, InstructionId, InstructionKind, Module, Shape};

/// Builder for one computation.
pub struct ComputationBuilder {
    computation: Computation,
    next_parameter: usize,
}

impl ComputationBuilder {
    /// Create a builder for a regular computation.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            computation: Computation::new(name),
            next_parameter: 0,
        }
    }

    /// Create a builder for a fusion body.
    pub fn fusion(name: impl Into<String>) -> Self {
        Self {
            computation: Computation::new_fusion(name),
            next_parameter: 0,
        }
    }

    /// Build and return the computation.
    pub fn build(self) -> Computation {
        self.computation
    }

    /// Get a reference to the computation being built.
    pub fn computation(&self) -> &Computation {
        &self.computation
    }

    /// Set the root instruction.
    pub fn set_root(&mut self, root: InstructionId) -> &mut Self {
        // Builder ids are always live.
        let _ = self.computation.set_root(root);
        self
    }

    /// Add an arbitrary instruction.
    pub fn instruction(
        &mut self,
        name: impl Into<String>,
        kind: InstructionKind,
        shape: Shape,
        operands: Vec<InstructionId>,
    ) -> InstructionId {
        self.computation
            .push_unchecked(name.into(), kind, shape, operands)
    }

    // ========================================================================
    // Leaves
    // ========================================================================

    /// Add the next parameter.
    pub fn parameter(&mut self, name: impl Into<String>, shape: Shape) -> InstructionId {
        let index = self.next_parameter;
        self.next_parameter += 1;
        self.instruction(name, InstructionKind::Parameter(index), shape, vec![])
    }

    /// Add an integer constant.
    pub fn constant(&mut self, name: impl Into<String>, value: i64, shape: Shape) -> InstructionId {
        self.instruction(name, InstructionKind::Constant(value), shape, vec![])
    }

    // ========================================================================
    // Data movement
    // ========================================================================

    /// Add a dynamic slice of `operand` at `indices`.
    pub fn dynamic_slice(
        &mut self,
        name: impl Into<String>,
        operand: InstructionId,
        indices: &[InstructionId],
        slice_sizes: Vec<i64>,
        shape: Shape,
    ) -> InstructionId {
        let mut operands = vec![operand];
        operands.extend_from_slice(indices);
        self.instruction(name, InstructionKind::DynamicSlice { slice_sizes }, shape, operands)
    }

    /// Add a dynamic update of `base` with `update` at `indices`.
    pub fn dynamic_update_slice(
        &mut self,
        name: impl Into<String>,
        base: InstructionId,
        update: InstructionId,
        indices: &[InstructionId],
        shape: Shape,
    ) -> InstructionId {
        let mut operands = vec![base, update];
        operands.extend_from_slice(indices);
        self.instruction(name, InstructionKind::DynamicUpdateSlice, shape, operands)
    }

    /// Add a copy of `operand` with result `shape`.
    pub fn copy(&mut self, name: impl Into<String>, operand: InstructionId, shape: Shape) -> InstructionId {
        self.instruction(name, InstructionKind::Copy, shape, vec![operand])
    }

    // ========================================================================
    // Compute and structure
    // ========================================================================

    /// Add an elementwise add.
    pub fn add(&mut self, name: impl Into<String>, lhs: InstructionId, rhs: InstructionId, shape: Shape) -> InstructionId {
        self.instruction(name, InstructionKind::Add, shape, vec![lhs, rhs])
    }

    /// Add a tuple of `elements`; the shape is derived from the operands.
    pub fn tuple(&mut self, name: impl Into<String>, elements: Vec<InstructionId>) -> InstructionId {
        let shapes = elements
            .iter()
            .filter_map(|&e| self.computation.instruction(e).map(|i| i.shape.clone()))
            .collect();
        self.instruction(name, InstructionKind::Tuple, Shape::tuple(shapes), elements)
    }

    /// Add a get-tuple-element.
    pub fn get_tuple_element(
        &mut self,
        name: impl Into<String>,
        tuple: InstructionId,
        index: usize,
        shape: Shape,
    ) -> InstructionId {
        self.instruction(name, InstructionKind::GetTupleElement(index), shape, vec![tuple])
    }

    /// Add a call into fusion body `computation`.
    pub fn fusion_call(
        &mut self,
        name: impl Into<String>,
        computation: ComputationId,
        operands: Vec<InstructionId>,
        shape: Shape,
    ) -> InstructionId {
        self.instruction(name, InstructionKind::Fusion { computation }, shape, operands)
    }
}

/// Builder for a module.
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    /// Create a new builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            module: Module::new(name),
        }
    }

    /// Add a computation.
    pub fn add_computation(&mut self, computation: Computation) -> ComputationId {
        self.module.add_computation(computation)
    }

    /// Add the entry computation.
    pub fn add_entry(&mut self, computation: Computation) -> ComputationId {
        let id = self.module.add_computation(computation);
        // Just added, so the id is valid.
        let _ = self.module.set_entry(id);
        id
    }

    /// Build and return the module.
    pub fn build(self) -> Module {
        self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemorySpace, PrimitiveType};

    #[test]
    fn test_build_module_with_fusion() {
        let shape = Shape::array(PrimitiveType::F32, [4]).with_default_layout();
        let mut mb = ModuleBuilder::new("m");

        let mut fused = ComputationBuilder::fusion("fused");
        let a = fused.parameter("a", shape.clone());
        let sum = fused.add("sum", a, a, shape.clone());
        fused.set_root(sum);
        let fused_id = mb.add_computation(fused.build());

        let mut entry = ComputationBuilder::new("entry");
        let p = entry.parameter("p", shape.clone().in_memory_space(MemorySpace(5)));
        let c = entry.copy("c", p, shape.clone());
        let f = entry.fusion_call("f", fused_id, vec![c], shape);
        entry.set_root(f);
        let entry_id = mb.add_entry(entry.build());

        let module = mb.build();
        assert_eq!(module.entry(), Some(entry_id));
        assert_eq!(module.non_fusion_computations(), vec![entry_id]);
        assert_eq!(module.instruction_count(), 5);
        let (_, copy) = module.find("c").unwrap();
        assert_eq!(copy.operands, vec![p]);
    }

    #[test]
    fn test_parameters_numbered_in_order() {
        let shape = Shape::scalar(PrimitiveType::S32);
        let mut b = ComputationBuilder::new("entry");
        let x = b.parameter("x", shape.clone());
        let y = b.parameter("y", shape);
        let comp = b.build();
        assert_eq!(comp.get(x).unwrap().kind, InstructionKind::Parameter(0));
        assert_eq!(comp.get(y).unwrap().kind, InstructionKind::Parameter(1));
    }
}
