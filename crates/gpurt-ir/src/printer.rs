//! IR pretty printer.
//!
//! Produces a human-readable text representation of modules:
//!
//! ```text
//! module m
//!
//! ENTRY entry {
//!   %0 p = f32[8]{0:S(5)} parameter(0)
//!   %3 c-start = (f32[8]{0}, f32[8]{0:S(5)}, u32[]{}) copy-start(%0)
//!   ROOT %4 c-done = f32[8]{0} copy-done(%3)
//! }
//! ```

use std::fmt::{self, Write};

use crate::{Computation, Instruction, InstructionKind, Module};

/// IR pretty printer.
#[derive(Debug)]
pub struct IrPrinter {
    indent: usize,
}

impl Default for IrPrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl IrPrinter {
    /// Create a new printer.
    pub fn new() -> Self {
        Self { indent: 2 }
    }

    /// Set the instruction indent width.
    #[must_use]
    pub fn with_indent(mut self, indent: usize) -> Self {
        self.indent = indent;
        self
    }

    /// Print a module.
    pub fn print(&self, module: &Module) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = self.write_module(&mut out, module);
        out
    }

    /// Print one computation.
    pub fn print_computation(&self, computation: &Computation) -> String {
        let mut out = String::new();
        let _ = self.write_computation(&mut out, computation, false);
        out
    }

    fn write_module(&self, out: &mut impl Write, module: &Module) -> fmt::Result {
        writeln!(out, "module {}", module.name())?;
        for (id, computation) in module.computations() {
            writeln!(out)?;
            self.write_computation(out, computation, module.entry() == Some(id))?;
        }
        Ok(())
    }

    fn write_computation(&self, out: &mut impl Write, computation: &Computation, entry: bool) -> fmt::Result {
        if entry {
            write!(out, "ENTRY ")?;
        }
        if computation.is_fusion() {
            write!(out, "fused ")?;
        }
        writeln!(out, "{} {{", computation.name())?;
        for inst in computation.instructions() {
            let root = computation.root() == Some(inst.id);
            self.write_instruction(out, inst, root)?;
        }
        writeln!(out, "}}")
    }

    fn write_instruction(&self, out: &mut impl Write, inst: &Instruction, root: bool) -> fmt::Result {
        write!(out, "{:width$}", "", width = self.indent)?;
        if root {
            write!(out, "ROOT ")?;
        }
        write!(out, "{} {} = {} {}(", inst.id, inst.name, inst.shape, inst.kind.opcode())?;

        let mut args: Vec<String> = inst.operands.iter().map(|o| o.to_string()).collect();
        match &inst.kind {
            InstructionKind::Parameter(index) => args.push(index.to_string()),
            InstructionKind::Constant(value) => args.push(value.to_string()),
            _ => {}
        }
        write!(out, "{})", args.join(", "))?;

        match &inst.kind {
            InstructionKind::DynamicSlice { slice_sizes } => {
                let sizes: Vec<String> = slice_sizes.iter().map(|s| s.to_string()).collect();
                write!(out, ", dynamic_slice_sizes={{{}}}", sizes.join(","))?;
            }
            InstructionKind::GetTupleElement(index) => write!(out, ", index={}", index)?,
            InstructionKind::Fusion { computation } => write!(out, ", calls={}", computation)?,
            _ => {}
        }
        writeln!(out)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        IrPrinter::new().write_module(f, self)
    }
}
