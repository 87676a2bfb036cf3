//! Embedded script runtime
//!
//! A small interpreter for the Python subset the patcher works on. Parsing
//! goes through tree-sitter; every function value is an indirection cell so a
//! body can be replaced in place while the program keeps running.

pub mod ast;
pub mod builtins;
pub mod interp;
pub mod ops;
pub mod parser;
pub mod registry;
pub mod value;

pub use interp::{
    FailureHandler, Flow, Interception, Interpreter, LoadedModule, OutputSink, Resolution, Unwind,
};
pub use registry::{ModuleRecord, SourceOrigin, SourceRegistry};
pub use value::{ExceptionValue, FunctionCell, FunctionId, Value};
