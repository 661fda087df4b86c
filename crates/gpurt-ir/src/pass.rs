//! Module pass interface.

use crate::{IrResult, Module};

// ============================================================================
// PASS INTERFACE
// ============================================================================

/// A pass that transforms a module in place.
pub trait ModulePass {
    /// Get the name of this pass.
    fn name(&self) -> &'static str;

    /// Run the pass. Returns whether the module changed.
    fn run(&self, module: &mut Module) -> IrResult<bool>;
}

/// Ordered list of passes run once each.
#[derive(Default)]
pub struct PassPipeline {
    passes: Vec<Box<dyn ModulePass>>,
}

impl PassPipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pass.
    #[must_use]
    pub fn with_pass(mut self, pass: impl ModulePass + 'static) -> Self {
        self.passes.push(Box::new(pass));
        self
    }

    /// Names of the passes, in run order.
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run every pass in order. Stops at the first failing pass.
    pub fn run(&self, module: &mut Module) -> IrResult<bool> {
        let mut changed = false;
        for pass in &self.passes {
            let pass_changed = pass.run(module)?;
            tracing::debug!(pass = pass.name(), changed = pass_changed, "Ran module pass");
            changed |= pass_changed;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IrError;

    struct Rename;

    impl ModulePass for Rename {
        fn name(&self) -> &'static str {
            "rename"
        }

        fn run(&self, _module: &mut Module) -> IrResult<bool> {
            Ok(true)
        }
    }

    struct Fail;

    impl ModulePass for Fail {
        fn name(&self) -> &'static str {
            "fail"
        }

        fn run(&self, _module: &mut Module) -> IrResult<bool> {
            Err(IrError::Internal("boom".to_string()))
        }
    }

    #[test]
    fn test_pipeline_accumulates_changed() {
        let pipeline = PassPipeline::new().with_pass(Rename);
        let mut module = Module::new("m");
        assert!(pipeline.run(&mut module).unwrap());
        assert!(!PassPipeline::new().run(&mut module).unwrap());
    }

    #[test]
    fn test_pipeline_stops_on_error() {
        let pipeline = PassPipeline::new().with_pass(Fail).with_pass(Rename);
        assert_eq!(pipeline.pass_names(), vec!["fail", "rename"]);
        assert!(pipeline.run(&mut Module::new("m")).is_err());
    }
}
