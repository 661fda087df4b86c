//! gpurt Program Graph
//!
//! This crate provides the program graph consumed by gpurt's rewrite
//! passes: modules of computations, each an index-stable store of
//! instructions whose shapes carry resolved layouts and memory spaces.
//!
//! # Architecture
//!
//! ```text
//! layout assignment → Module → ModulePass (HostTransferAsyncifier) → lowering
//! ```
//!
//! # Example
//!
//! ```
//! use gpurt_ir::*;
//!
//! let host = MemorySpace(5);
//! let mut entry = ComputationBuilder::new("entry");
//! let p = entry.parameter("p", Shape::array(PrimitiveType::F32, [8]).in_memory_space(host));
//! let c = entry.copy("c", p, Shape::array(PrimitiveType::F32, [8]).with_default_layout());
//! entry.set_root(c);
//!
//! let mut builder = ModuleBuilder::new("m");
//! builder.add_entry(entry.build());
//! let mut module = builder.build();
//!
//! let changed = HostTransferAsyncifier::new(5).run(&mut module).unwrap();
//! assert!(changed);
//! assert!(module.find("c-done").is_some());
//! ```

#![warn(missing_docs)]

mod asyncify;
mod builder;
mod error;
mod instruction;
mod module;
mod pass;
mod printer;
mod types;
mod validation;

pub use asyncify::HostTransferAsyncifier;
pub use builder::{ComputationBuilder, ModuleBuilder};
pub use error::{IrError, IrResult};
pub use instruction::{Instruction, InstructionId, InstructionKind, SourceRef};
pub use module::{Computation, ComputationId, Module};
pub use pass::{ModulePass, PassPipeline};
pub use printer::IrPrinter;
pub use types::{Layout, MemorySpace, PrimitiveType, Shape};
pub use validation::{
    ValidationError, ValidationErrorKind, ValidationLevel, ValidationLocation, ValidationResult,
    ValidationWarning, ValidationWarningKind, Validator,
};
