//! IR error types.

use thiserror::Error;

use crate::{ComputationId, InstructionId};

/// IR result type.
pub type IrResult<T> = Result<T, IrError>;

/// IR errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    /// A shape that must carry a resolved layout does not.
    #[error("Missing layout: {detail}")]
    MissingLayout {
        /// Name of the offending instruction.
        instruction: String,
        /// Full diagnostic.
        detail: String,
    },

    /// Instruction id does not name a live instruction.
    #[error("Undefined instruction: {0}")]
    UndefinedInstruction(InstructionId),

    /// Computation id does not name a computation in the module.
    #[error("Undefined computation: {0}")]
    UndefinedComputation(ComputationId),

    /// An operand is malformed for its instruction.
    #[error("Invalid operand of {instruction}: {detail}")]
    InvalidOperand {
        /// Name of the instruction.
        instruction: String,
        /// What is wrong.
        detail: String,
    },

    /// Instruction still has users and cannot be removed.
    #[error("Instruction {instruction} still has {users} user(s)")]
    InstructionInUse {
        /// Name of the instruction.
        instruction: String,
        /// Remaining user count.
        users: usize,
    },

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IrError {
    /// Builds a [`IrError::MissingLayout`] for `instruction`.
    pub fn missing_layout(instruction: impl Into<String>, detail: impl Into<String>) -> Self {
        IrError::MissingLayout {
            instruction: instruction.into(),
            detail: detail.into(),
        }
    }
}
