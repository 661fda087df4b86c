//! IR validation.
//!
//! Checks modules for structural correctness and for well-formed
//! asynchronous start/done pairs.

use std::fmt;

use crate::{Computation, ComputationId, InstructionId, InstructionKind, Module};

/// Validation strictness level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationLevel {
    /// No validation.
    None,
    /// Operand, root and entry references.
    Basic,
    /// Basic checks plus async pairing and layout warnings.
    Full,
}

/// Result of validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Errors found.
    pub errors: Vec<ValidationError>,
    /// Warnings found.
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    /// Create a successful result.
    pub fn success() -> Self {
        Self::default()
    }

    /// Check if validation passed.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Check if validation passed with no warnings.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    /// True if any error has `kind`.
    pub fn has_error(&self, kind: ValidationErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }
}

/// Where a problem was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationLocation {
    /// Computation.
    pub computation: ComputationId,
    /// Instruction, if the problem is local to one.
    pub instruction: Option<InstructionId>,
}

impl fmt::Display for ValidationLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instruction {
            Some(inst) => write!(f, "{} {}", self.computation, inst),
            None => write!(f, "{}", self.computation),
        }
    }
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Error kind.
    pub kind: ValidationErrorKind,
    /// Location in IR.
    pub location: Option<ValidationLocation>,
    /// Error message.
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(loc) = &self.location {
            write!(f, "{}: {}: {}", loc, self.kind, self.message)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// Error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Operand does not name a live instruction.
    UndefinedOperand,
    /// Root does not name a live instruction.
    UndefinedRoot,
    /// Module has no entry computation.
    MissingEntry,
    /// Fusion call does not target a fusion computation.
    InvalidFusion,
    /// Start/done pair is malformed.
    UnpairedAsync,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationErrorKind::UndefinedOperand => write!(f, "undefined operand"),
            ValidationErrorKind::UndefinedRoot => write!(f, "undefined root"),
            ValidationErrorKind::MissingEntry => write!(f, "missing entry computation"),
            ValidationErrorKind::InvalidFusion => write!(f, "invalid fusion"),
            ValidationErrorKind::UnpairedAsync => write!(f, "unpaired async operation"),
        }
    }
}

/// Validation warning.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    /// Warning kind.
    pub kind: ValidationWarningKind,
    /// Location in IR.
    pub location: Option<ValidationLocation>,
    /// Warning message.
    pub message: String,
}

/// Warning kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationWarningKind {
    /// Instruction result is never used and is not the root.
    UnusedInstruction,
    /// Instruction shape has no resolved layout.
    MissingLayout,
}

/// IR validator.
pub struct Validator {
    level: ValidationLevel,
    result: ValidationResult,
}

impl Validator {
    /// Create a new validator.
    pub fn new(level: ValidationLevel) -> Self {
        Self {
            level,
            result: ValidationResult::success(),
        }
    }

    /// Validate a module.
    pub fn validate(mut self, module: &Module) -> ValidationResult {
        if self.level == ValidationLevel::None {
            return self.result;
        }

        if module.entry().is_none() {
            self.error(
                ValidationErrorKind::MissingEntry,
                None,
                format!("Module {} has no entry computation", module.name()),
            );
        }

        for (id, computation) in module.computations() {
            self.validate_references(module, id, computation);
            if self.level >= ValidationLevel::Full {
                self.validate_async_pairs(id, computation);
                self.collect_warnings(id, computation);
            }
        }

        self.result
    }

    fn error(&mut self, kind: ValidationErrorKind, location: Option<ValidationLocation>, message: String) {
        self.result.errors.push(ValidationError {
            kind,
            location,
            message,
        });
    }

    fn warning(&mut self, kind: ValidationWarningKind, location: ValidationLocation, message: String) {
        self.result.warnings.push(ValidationWarning {
            kind,
            location: Some(location),
            message,
        });
    }

    fn validate_references(&mut self, module: &Module, id: ComputationId, computation: &Computation) {
        if let Some(root) = computation.root() {
            if computation.instruction(root).is_none() {
                self.error(
                    ValidationErrorKind::UndefinedRoot,
                    Some(ValidationLocation {
                        computation: id,
                        instruction: None,
                    }),
                    format!("Root {} of {} is not live", root, computation.name()),
                );
            }
        }

        for inst in computation.instructions() {
            let location = ValidationLocation {
                computation: id,
                instruction: Some(inst.id),
            };
            for &operand in &inst.operands {
                if computation.instruction(operand).is_none() {
                    self.error(
                        ValidationErrorKind::UndefinedOperand,
                        Some(location.clone()),
                        format!("{} uses undefined operand {}", inst.name, operand),
                    );
                }
            }
            if let InstructionKind::Fusion { computation: target } = &inst.kind {
                if !matches!(module.computation(*target), Ok(c) if c.is_fusion()) {
                    self.error(
                        ValidationErrorKind::InvalidFusion,
                        Some(location),
                        format!("{} calls {} which is not a fusion computation", inst.name, target),
                    );
                }
            }
        }
    }

    fn validate_async_pairs(&mut self, id: ComputationId, computation: &Computation) {
        for inst in computation.instructions() {
            let location = ValidationLocation {
                computation: id,
                instruction: Some(inst.id),
            };

            if inst.kind.is_async_done() {
                let start = match inst.operands.as_slice() {
                    [start] => computation.instruction(*start),
                    _ => None,
                };
                let paired = start.map(|s| s.kind.pairs_with(&inst.kind)).unwrap_or(false);
                if !paired {
                    self.error(
                        ValidationErrorKind::UnpairedAsync,
                        Some(location.clone()),
                        format!("{} does not consume exactly one matching start", inst.name),
                    );
                }
            }

            if inst.kind.is_async_start() {
                let users = computation.users(inst.id);
                let dones = users
                    .iter()
                    .filter_map(|&u| computation.instruction(u))
                    .filter(|u| inst.kind.pairs_with(&u.kind))
                    .count();
                if dones != 1 || users.len() != 1 {
                    self.error(
                        ValidationErrorKind::UnpairedAsync,
                        Some(location),
                        format!(
                            "{} has {} matching done(s) among {} user(s); expected exactly one",
                            inst.name,
                            dones,
                            users.len()
                        ),
                    );
                }
            }
        }
    }

    fn collect_warnings(&mut self, id: ComputationId, computation: &Computation) {
        for inst in computation.instructions() {
            let location = ValidationLocation {
                computation: id,
                instruction: Some(inst.id),
            };
            if !inst.shape.has_layout() {
                self.warning(
                    ValidationWarningKind::MissingLayout,
                    location.clone(),
                    format!("{} has no resolved layout", inst.name),
                );
            }
            let is_root = computation.root() == Some(inst.id);
            let is_parameter = matches!(inst.kind, InstructionKind::Parameter(_));
            if !is_root && !is_parameter && computation.users(inst.id).is_empty() {
                self.warning(
                    ValidationWarningKind::UnusedInstruction,
                    location,
                    format!("{} is never used", inst.name),
                );
            }
        }
    }
}

impl Module {
    /// Validate this module at `level`.
    pub fn validate(&self, level: ValidationLevel) -> ValidationResult {
        Validator::new(level).validate(self)
    }
}
