//! Instruction definitions.

use std::fmt;

use crate::{ComputationId, Shape};

/// Index of an instruction within its computation.
///
/// Ids are never reused; removing an instruction leaves a tombstone so
/// every other id stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstructionId(usize);

impl InstructionId {
    /// Creates an id from a raw index.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Raw index.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Operation performed by an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    /// Computation parameter.
    Parameter(usize),
    /// Integer constant.
    Constant(i64),
    /// Elementwise addition.
    Add,
    /// Slice with runtime start indices: operand, then one index per dim.
    DynamicSlice {
        /// Size of the slice in each dimension.
        slice_sizes: Vec<i64>,
    },
    /// Update a window of the base: base, update, then start indices.
    DynamicUpdateSlice,
    /// Copy, possibly between memory spaces.
    Copy,
    /// Starts an asynchronous copy.
    CopyStart,
    /// Waits for an asynchronous copy.
    CopyDone,
    /// Starts an asynchronous form of `wrapped`.
    AsyncStart {
        /// The operation running asynchronously.
        wrapped: Box<InstructionKind>,
    },
    /// Waits for an asynchronous form of `wrapped`.
    AsyncDone {
        /// The operation running asynchronously.
        wrapped: Box<InstructionKind>,
    },
    /// Tuple of the operands.
    Tuple,
    /// Element of a tuple operand.
    GetTupleElement(usize),
    /// Call into a fusion computation.
    Fusion {
        /// The fused computation.
        computation: ComputationId,
    },
}

impl InstructionKind {
    /// Opcode name used in text dumps.
    pub fn opcode(&self) -> String {
        match self {
            InstructionKind::Parameter(_) => "parameter".to_string(),
            InstructionKind::Constant(_) => "constant".to_string(),
            InstructionKind::Add => "add".to_string(),
            InstructionKind::DynamicSlice { .. } => "dynamic-slice".to_string(),
            InstructionKind::DynamicUpdateSlice => "dynamic-update-slice".to_string(),
            InstructionKind::Copy => "copy".to_string(),
            InstructionKind::CopyStart => "copy-start".to_string(),
            InstructionKind::CopyDone => "copy-done".to_string(),
            InstructionKind::AsyncStart { wrapped } => format!("{}-start", wrapped.opcode()),
            InstructionKind::AsyncDone { wrapped } => format!("{}-done", wrapped.opcode()),
            InstructionKind::Tuple => "tuple".to_string(),
            InstructionKind::GetTupleElement(_) => "get-tuple-element".to_string(),
            InstructionKind::Fusion { .. } => "fusion".to_string(),
        }
    }

    /// True for the start half of an asynchronous pair.
    pub fn is_async_start(&self) -> bool {
        matches!(
            self,
            InstructionKind::CopyStart | InstructionKind::AsyncStart { .. }
        )
    }

    /// True for the done half of an asynchronous pair.
    pub fn is_async_done(&self) -> bool {
        matches!(
            self,
            InstructionKind::CopyDone | InstructionKind::AsyncDone { .. }
        )
    }

    /// True if `done` is the completion of a start of this kind.
    pub fn pairs_with(&self, done: &InstructionKind) -> bool {
        match (self, done) {
            (InstructionKind::CopyStart, InstructionKind::CopyDone) => true,
            (InstructionKind::AsyncStart { wrapped: s }, InstructionKind::AsyncDone { wrapped: d }) => {
                s == d
            }
            _ => false,
        }
    }
}

/// An instruction in a computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Position in the computation.
    pub id: InstructionId,
    /// Unique name within the computation.
    pub name: String,
    /// Operation.
    pub kind: InstructionKind,
    /// Result shape.
    pub shape: Shape,
    /// Operand ids, in order.
    pub operands: Vec<InstructionId>,
}

impl Instruction {
    /// Operand at `index`.
    pub fn operand(&self, index: usize) -> Option<InstructionId> {
        self.operands.get(index).copied()
    }
}

/// Reference to an instruction from outside its module, valid while the
/// module is alive and the instruction has not been removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    /// Owning computation.
    pub computation: ComputationId,
    /// Instruction within the computation.
    pub instruction: InstructionId,
    /// Instruction name at the time the reference was taken.
    pub name: String,
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.computation, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PrimitiveType;

    #[test]
    fn test_async_pairing() {
        let ds = InstructionKind::DynamicSlice {
            slice_sizes: vec![1],
        };
        let start = InstructionKind::AsyncStart {
            wrapped: Box::new(ds.clone()),
        };
        let done = InstructionKind::AsyncDone {
            wrapped: Box::new(ds),
        };
        let other_done = InstructionKind::AsyncDone {
            wrapped: Box::new(InstructionKind::DynamicUpdateSlice),
        };

        assert!(start.pairs_with(&done));
        assert!(!start.pairs_with(&other_done));
        assert!(!start.pairs_with(&InstructionKind::CopyDone));
        assert!(InstructionKind::CopyStart.pairs_with(&InstructionKind::CopyDone));
        assert_eq!(start.opcode(), "dynamic-slice-start");
    }

    #[test]
    fn test_operand_lookup() {
        let inst = Instruction {
            id: InstructionId::new(2),
            name: "copy.1".to_string(),
            kind: InstructionKind::Copy,
            shape: Shape::array(PrimitiveType::F32, [4]),
            operands: vec![InstructionId::new(0)],
        };
        assert_eq!(inst.operand(0), Some(InstructionId::new(0)));
        assert_eq!(inst.operand(1), None);
    }
}
