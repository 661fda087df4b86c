//! Computations and modules.

use std::collections::HashSet;
use std::fmt;

use crate::{
    Instruction, InstructionId, InstructionKind, IrError, IrResult, PrimitiveType, Shape,
    SourceRef,
};

/// Index of a computation within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComputationId(usize);

impl ComputationId {
    /// Creates an id from a raw index.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Raw index.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ComputationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comp{}", self.0)
    }
}

/// A computation: an instruction store plus a root.
#[derive(Debug, Clone)]
pub struct Computation {
    name: String,
    is_fusion: bool,
    slots: Vec<Option<Instruction>>,
    root: Option<InstructionId>,
}

impl Computation {
    /// Creates an empty computation.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_fusion: false,
            slots: Vec::new(),
            root: None,
        }
    }

    /// Creates an empty fusion computation.
    pub fn new_fusion(name: impl Into<String>) -> Self {
        Self {
            is_fusion: true,
            ..Self::new(name)
        }
    }

    /// Computation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if this computation is the body of a fusion.
    pub fn is_fusion(&self) -> bool {
        self.is_fusion
    }

    /// Root instruction.
    pub fn root(&self) -> Option<InstructionId> {
        self.root
    }

    /// Sets the root instruction.
    pub fn set_root(&mut self, id: InstructionId) -> IrResult<()> {
        self.get(id)?;
        self.root = Some(id);
        Ok(())
    }

    /// Number of live instructions.
    pub fn instruction_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Live instructions in id order.
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.slots.iter().flatten()
    }

    /// Instruction `id`, if live.
    pub fn instruction(&self, id: InstructionId) -> Option<&Instruction> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    /// Instruction `id`, or an error if it is not live.
    pub fn get(&self, id: InstructionId) -> IrResult<&Instruction> {
        self.instruction(id)
            .ok_or(IrError::UndefinedInstruction(id))
    }

    /// Live instruction named `name`.
    pub fn find(&self, name: &str) -> Option<&Instruction> {
        self.instructions().find(|i| i.name == name)
    }

    /// Appends an instruction after checking its operands are live.
    pub fn add_instruction(
        &mut self,
        name: impl Into<String>,
        kind: InstructionKind,
        shape: Shape,
        operands: Vec<InstructionId>,
    ) -> IrResult<InstructionId> {
        let name = name.into();
        for &operand in &operands {
            if self.instruction(operand).is_none() {
                return Err(IrError::InvalidOperand {
                    instruction: name,
                    detail: format!("operand {} is not a live instruction", operand),
                });
            }
        }
        Ok(self.push_unchecked(name, kind, shape, operands))
    }

    pub(crate) fn push_unchecked(
        &mut self,
        name: String,
        kind: InstructionKind,
        shape: Shape,
        operands: Vec<InstructionId>,
    ) -> InstructionId {
        let id = InstructionId::new(self.slots.len());
        self.slots.push(Some(Instruction {
            id,
            name,
            kind,
            shape,
            operands,
        }));
        id
    }

    /// Distinct instructions that use `id` as an operand, in id order.
    pub fn users(&self, id: InstructionId) -> Vec<InstructionId> {
        self.instructions()
            .filter(|i| i.operands.contains(&id))
            .map(|i| i.id)
            .collect()
    }

    /// Redirects every use of `old`, including the root, to `new`.
    pub fn replace_all_uses_with(&mut self, old: InstructionId, new: InstructionId) -> IrResult<()> {
        self.get(old)?;
        self.get(new)?;
        for inst in self.slots.iter_mut().flatten() {
            if inst.id == new {
                continue;
            }
            for operand in inst.operands.iter_mut() {
                if *operand == old {
                    *operand = new;
                }
            }
        }
        if self.root == Some(old) {
            self.root = Some(new);
        }
        Ok(())
    }

    /// Removes an instruction with no users that is not the root.
    pub fn remove_instruction(&mut self, id: InstructionId) -> IrResult<()> {
        let name = self.get(id)?.name.clone();
        let users = self.users(id).len();
        if users > 0 {
            return Err(IrError::InstructionInUse {
                instruction: name,
                users,
            });
        }
        if self.root == Some(id) {
            return Err(IrError::InstructionInUse {
                instruction: name,
                users: 0,
            });
        }
        self.slots[id.index()] = None;
        Ok(())
    }

    /// Every live instruction with operands before users. Instructions
    /// unreachable from the root are included.
    pub fn post_order(&self) -> Vec<InstructionId> {
        let mut order = Vec::with_capacity(self.slots.len());
        let mut visited = HashSet::new();
        for inst in self.instructions() {
            self.visit(inst.id, &mut visited, &mut order);
        }
        order
    }

    fn visit(
        &self,
        start: InstructionId,
        visited: &mut HashSet<InstructionId>,
        order: &mut Vec<InstructionId>,
    ) {
        // (id, operands already pushed)
        let mut stack = vec![(start, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            let Some(inst) = self.instruction(id) else {
                continue;
            };
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            for &operand in inst.operands.iter().rev() {
                if !visited.contains(&operand) {
                    stack.push((operand, false));
                }
            }
        }
    }

    /// Replaces `id` with an asynchronous start/done pair.
    ///
    /// The start takes the original operands and produces
    /// `(operand shapes, result shape, context shapes...)`; the done consumes
    /// the start and produces the original shape. All uses of `id` move to the
    /// done and `id` is removed. Returns the done.
    pub fn create_async_instructions(
        &mut self,
        id: InstructionId,
        context_shapes: &[Shape],
    ) -> IrResult<InstructionId> {
        let original = self.get(id)?.clone();
        let operand_shapes = original
            .operands
            .iter()
            .map(|&op| self.get(op).map(|i| i.shape.clone()))
            .collect::<IrResult<Vec<_>>>()?;

        let mut start_elements = vec![Shape::tuple(operand_shapes), original.shape.clone()];
        start_elements.extend(context_shapes.iter().cloned());

        let wrapped = Box::new(original.kind.clone());
        let start = self.push_unchecked(
            format!("{}-start", original.name),
            InstructionKind::AsyncStart {
                wrapped: wrapped.clone(),
            },
            Shape::tuple(start_elements),
            original.operands.clone(),
        );
        let done = self.push_unchecked(
            format!("{}-done", original.name),
            InstructionKind::AsyncDone { wrapped },
            original.shape,
            vec![start],
        );
        self.replace_all_uses_with(id, done)?;
        self.remove_instruction(id)?;
        Ok(done)
    }

    /// Replaces a copy with a `copy-start`/`copy-done` pair. The start
    /// produces `(destination shape, source shape, u32 context)`.
    pub fn create_async_copy(&mut self, id: InstructionId) -> IrResult<InstructionId> {
        let copy = self.get(id)?.clone();
        let source = copy.operand(0).ok_or_else(|| IrError::InvalidOperand {
            instruction: copy.name.clone(),
            detail: "copy has no operand".to_string(),
        })?;
        let source_shape = self.get(source)?.shape.clone();

        let start = self.push_unchecked(
            format!("{}-start", copy.name),
            InstructionKind::CopyStart,
            Shape::tuple(vec![
                copy.shape.clone(),
                source_shape,
                Shape::scalar(PrimitiveType::U32),
            ]),
            vec![source],
        );
        let done = self.push_unchecked(
            format!("{}-done", copy.name),
            InstructionKind::CopyDone,
            copy.shape,
            vec![start],
        );
        self.replace_all_uses_with(id, done)?;
        self.remove_instruction(id)?;
        Ok(done)
    }
}

/// A module: computations plus an entry.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    computations: Vec<Computation>,
    entry: Option<ComputationId>,
}

impl Module {
    /// Creates an empty module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            computations: Vec::new(),
            entry: None,
        }
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a computation and returns its id.
    pub fn add_computation(&mut self, computation: Computation) -> ComputationId {
        let id = ComputationId::new(self.computations.len());
        self.computations.push(computation);
        id
    }

    /// Entry computation id.
    pub fn entry(&self) -> Option<ComputationId> {
        self.entry
    }

    /// Sets the entry computation.
    pub fn set_entry(&mut self, id: ComputationId) -> IrResult<()> {
        self.computation(id)?;
        self.entry = Some(id);
        Ok(())
    }

    /// Computation `id`.
    pub fn computation(&self, id: ComputationId) -> IrResult<&Computation> {
        self.computations
            .get(id.index())
            .ok_or(IrError::UndefinedComputation(id))
    }

    /// Mutable computation `id`.
    pub fn computation_mut(&mut self, id: ComputationId) -> IrResult<&mut Computation> {
        self.computations
            .get_mut(id.index())
            .ok_or(IrError::UndefinedComputation(id))
    }

    /// All computations with their ids.
    pub fn computations(&self) -> impl Iterator<Item = (ComputationId, &Computation)> {
        self.computations
            .iter()
            .enumerate()
            .map(|(i, c)| (ComputationId::new(i), c))
    }

    /// Ids of computations that are not fusion bodies.
    pub fn non_fusion_computations(&self) -> Vec<ComputationId> {
        self.computations()
            .filter(|(_, c)| !c.is_fusion())
            .map(|(id, _)| id)
            .collect()
    }

    /// Total live instructions across all computations.
    pub fn instruction_count(&self) -> usize {
        self.computations.iter().map(Computation::instruction_count).sum()
    }

    /// Takes an external reference to an instruction.
    pub fn source_ref(&self, computation: ComputationId, instruction: InstructionId) -> IrResult<SourceRef> {
        let inst = self.computation(computation)?.get(instruction)?;
        Ok(SourceRef {
            computation,
            instruction,
            name: inst.name.clone(),
        })
    }

    /// Resolves a reference taken with [`Module::source_ref`].
    pub fn resolve(&self, source: &SourceRef) -> IrResult<&Instruction> {
        self.computation(source.computation)?.get(source.instruction)
    }

    /// Finds an instruction by name in any computation.
    pub fn find(&self, name: &str) -> Option<(ComputationId, &Instruction)> {
        self.computations()
            .find_map(|(id, c)| c.find(name).map(|i| (id, i)))
    }
}
