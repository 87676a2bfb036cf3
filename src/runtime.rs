//! A script interpreter wired to an orchestrator

use crate::error::Result;
use crate::script::registry::qualname_path;
use crate::script::{Interpreter, LoadedModule, OutputSink, Unwind, Value};
use crate::workflow::{Orchestrator, WorkflowReport};
use std::path::Path;
use std::sync::Arc;

pub struct Runtime {
    interp: Interpreter,
    orchestrator: Arc<Orchestrator>,
}

impl Runtime {
    pub fn new(orchestrator: Arc<Orchestrator>, output: OutputSink) -> Self {
        let mut interp = Interpreter::new().with_output(output);
        interp.set_handler(orchestrator.clone());
        Self { interp, orchestrator }
    }

    pub fn interpreter(&mut self) -> &mut Interpreter {
        &mut self.interp
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Load a module without a boundary; its top level may still open one
    /// with `with not_implemented_handler():`.
    pub fn load_source(&mut self, name: &str, text: &str) -> Result<LoadedModule> {
        self.interp.load_source(name, text)
    }

    /// Run a script file as `__main__` inside a boundary.
    pub fn run_guarded(&mut self, path: &Path) -> Result<LoadedModule> {
        tracing::debug!(path = %path.display(), "running script");
        self.interp.guarded(|interp| interp.load_file(path, true))
    }

    /// Run in-memory script text inside a boundary.
    pub fn run_source_guarded(&mut self, name: &str, text: &str) -> Result<LoadedModule> {
        self.interp.guarded(|interp| interp.load_source(name, text))
    }

    /// Call a script value inside a boundary.
    pub fn call_guarded(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value> {
        self.interp.guarded(|interp| interp.call(callee, args))
    }

    /// Call without a boundary; placeholders fail normally.
    pub fn call(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value> {
        self.interp.call(callee, args)
    }

    pub fn history(&self) -> Vec<WorkflowReport> {
        self.orchestrator.history()
    }

    /// Resolve a dotted name such as `Shape.area` against a module's globals.
    pub fn lookup(&mut self, module: &LoadedModule, qualname: &str) -> Result<Value> {
        let mut segments = qualname_path(qualname).into_iter();
        let first = segments.next().unwrap_or_default();
        let mut value = module
            .get(first)
            .ok_or_else(|| self.interp.raise_error("NameError", format!("name '{}' is not defined", first)).into_error())?;
        for segment in segments {
            value = self.interp.get_attr(&value, segment).map_err(Unwind::into_error)?;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::ScriptedSurface;
    use crate::error::PatchError;
    use crate::inspect::describe;
    use crate::workflow::Settings;

    fn runtime() -> Runtime {
        let orchestrator = Orchestrator::new(Arc::new(ScriptedSurface::declining()), Settings::default());
        Runtime::new(Arc::new(orchestrator), OutputSink::buffer())
    }

    #[test]
    fn test_lookup_resolves_methods() {
        let mut rt = runtime();
        let module = rt
            .load_source("shapes", "class Shape:\n    def area(self):\n        return 0\n")
            .unwrap();
        let area = rt.lookup(&module, "Shape.area").unwrap();
        assert_eq!(describe(&area).unwrap().qualname, "Shape.area");
        assert!(matches!(
            rt.lookup(&module, "Circle"),
            Err(PatchError::Script { kind, .. }) if kind == "NameError"
        ));
    }

    #[test]
    fn test_guarded_source_runs_top_level() {
        let mut rt = runtime();
        rt.run_source_guarded("hello", "print(\"hi\")\n").unwrap();
        assert_eq!(rt.interpreter().output().contents(), "hi\n");
        assert!(rt.history().is_empty());
    }
}
