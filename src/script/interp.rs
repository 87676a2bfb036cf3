//! Tree-walking interpreter
//!
//! Keeps an explicit stack of [`ActiveFrame`]s (pushed on every script call,
//! popped on exit) so a raised exception can snapshot the exact chain of
//! calling contexts. Interception of placeholder failures happens at the
//! callee's call site, before the failure unwinds into the caller.

use super::ast::*;
use super::builtins;
use super::ops::{self, OpError};
use super::parser;
use super::registry::{ModuleRecord, SourceOrigin, SourceRegistry};
use super::value::*;
use crate::error::{PatchError, Result};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Script call depth at which `RecursionError` is raised.
const MAX_DEPTH: usize = 64;

/// Non-local control flow.
pub enum Unwind {
    Raise(Arc<ExceptionValue>),
    Return(Value),
    Break,
    Continue,
}

impl Unwind {
    /// Surface an unwind that escaped script code as a host error.
    pub fn into_error(self) -> PatchError {
        match self {
            Unwind::Raise(exc) => PatchError::Script {
                kind: exc.kind().to_string(),
                message: exc.message(),
            },
            Unwind::Return(_) => PatchError::Script {
                kind: "SyntaxError".into(),
                message: "'return' outside function".into(),
            },
            Unwind::Break | Unwind::Continue => PatchError::Script {
                kind: "SyntaxError".into(),
                message: "'break' or 'continue' outside loop".into(),
            },
        }
    }
}

impl fmt::Debug for Unwind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unwind::Raise(exc) => write!(f, "Raise({:?})", exc),
            Unwind::Return(v) => write!(f, "Return({:?})", v),
            Unwind::Break => write!(f, "Break"),
            Unwind::Continue => write!(f, "Continue"),
        }
    }
}

pub type Flow<T> = std::result::Result<T, Unwind>;

/// A placeholder failure caught at its callee's call site.
pub struct Interception {
    pub signal: Arc<ExceptionValue>,
    pub function: Arc<FunctionCell>,
    /// Arguments of the failed call (receiver first for methods), for replay.
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
}

pub enum Resolution {
    /// The call returns this value; the caller never sees the failure.
    Resumed(Value),
    /// Let the original signal continue unwinding.
    Propagate,
    /// Replace the signal with another exception (e.g. raised by a replay).
    Raise(Arc<ExceptionValue>),
}

pub trait FailureHandler: Send + Sync {
    fn handle(&self, interp: &mut Interpreter, interception: Interception) -> Resolution;
}

/// Where `print` writes.
#[derive(Clone, Default)]
pub enum OutputSink {
    #[default]
    Stdout,
    Buffer(Arc<Mutex<String>>),
}

impl OutputSink {
    pub fn buffer() -> Self {
        OutputSink::Buffer(Arc::new(Mutex::new(String::new())))
    }

    pub fn contents(&self) -> String {
        match self {
            OutputSink::Stdout => String::new(),
            OutputSink::Buffer(buf) => lock(buf).clone(),
        }
    }

    fn write(&self, text: &str) {
        match self {
            OutputSink::Stdout => {
                use std::io::Write;
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            OutputSink::Buffer(buf) => lock(buf).push_str(text),
        }
    }
}

/// A module after its top level has run.
#[derive(Clone)]
pub struct LoadedModule {
    pub record: Arc<ModuleRecord>,
    pub globals: Arc<Scope>,
}

impl LoadedModule {
    pub fn get(&self, name: &str) -> Option<Value> {
        self.globals.get_local(name)
    }

    /// The function cell bound to `name`, looking through decorators.
    pub fn function(&self, name: &str) -> Option<Arc<FunctionCell>> {
        let mut value = self.get(name)?;
        loop {
            match value {
                Value::Function(cell) => return Some(cell),
                Value::Decorated(d) => value = d.inner.clone(),
                _ => return None,
            }
        }
    }

    /// Expose a host closure to the module as a global.
    pub fn define_native<F>(&self, name: &str, func: F)
    where
        F: Fn(&mut Interpreter, Vec<Value>, Vec<(String, Value)>) -> Flow<Value> + Send + Sync + 'static,
    {
        self.globals.set(name, Value::native(name, func));
    }
}

pub struct Interpreter {
    builtins: Arc<Scope>,
    registry: Arc<SourceRegistry>,
    frames: Vec<ActiveFrame>,
    /// Exceptions currently being handled by `except` blocks, for bare `raise`.
    handling: Vec<Arc<ExceptionValue>>,
    boundary_depth: usize,
    handler: Option<Arc<dyn FailureHandler>>,
    output: OutputSink,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        let builtins = Scope::builtins();
        builtins::install(&builtins);
        Self {
            builtins,
            registry: Arc::new(SourceRegistry::new()),
            frames: Vec::new(),
            handling: Vec::new(),
            boundary_depth: 0,
            handler: None,
            output: OutputSink::Stdout,
        }
    }

    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    pub fn output(&self) -> &OutputSink {
        &self.output
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn set_handler(&mut self, handler: Arc<dyn FailureHandler>) {
        self.handler = Some(handler);
    }

    pub fn frames(&self) -> &[ActiveFrame] {
        &self.frames
    }

    pub fn boundary_active(&self) -> bool {
        self.boundary_depth > 0
    }

    /// Run `f` with an interception boundary active.
    pub fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.boundary_depth += 1;
        let out = f(self);
        self.boundary_depth -= 1;
        out
    }

    pub(crate) fn write_output(&self, text: &str) {
        self.output.write(text);
    }

    pub(crate) fn builtin(&self, name: &str) -> Option<Value> {
        self.builtins.get_local(name)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  MODULES
    // ═══════════════════════════════════════════════════════════════════

    /// Load and execute a script file. `as_main` sets `__name__` to `"__main__"`.
    pub fn load_file(&mut self, path: &Path, as_main: bool) -> Result<LoadedModule> {
        let text = std::fs::read_to_string(path).map_err(|e| PatchError::io(path, e))?;
        let name = if as_main {
            "__main__".to_string()
        } else {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "module".to_string())
        };
        self.load(name, SourceOrigin::File(path.to_path_buf()), &text)
    }

    /// Load and execute in-memory script text.
    pub fn load_source(&mut self, name: &str, text: &str) -> Result<LoadedModule> {
        self.load(name.to_string(), SourceOrigin::Memory(name.to_string()), text)
    }

    fn load(&mut self, name: String, origin: SourceOrigin, text: &str) -> Result<LoadedModule> {
        let module = parser::parse_module(text, &origin.to_string())?;
        let record = self.registry.register(&name, origin, text);
        let globals = Scope::module(&self.builtins, record.clone());
        globals.set("__name__", Value::str(&name));
        tracing::debug!(module = %record.origin, statements = module.body.len(), "executing module");
        self.exec_block(&module.body, &globals)
            .map_err(Unwind::into_error)?;
        Ok(LoadedModule { record, globals })
    }

    // ═══════════════════════════════════════════════════════════════════
    //  CALLS
    // ═══════════════════════════════════════════════════════════════════

    /// Call from host code; escaping exceptions become [`PatchError::Script`].
    pub fn call(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value> {
        self.call_value(callee, args, Vec::new())
            .map_err(Unwind::into_error)
    }

    pub fn call_value(&mut self, callee: &Value, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Flow<Value> {
        match callee {
            Value::Function(cell) => self.call_function(cell, args, kwargs),
            Value::Native(native) => {
                let native = native.clone();
                (native.func)(self, args, kwargs)
            }
            Value::BoundMethod(bound) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(bound.receiver.clone());
                full.extend(args);
                self.call_value(&bound.method, full, kwargs)
            }
            Value::BuiltinMethod(method) => {
                let method = method.clone();
                builtins::call_method(self, &method.receiver, &method.name, args, kwargs)
            }
            Value::Decorated(wrapper) => self.call_traced(wrapper.clone(), args, kwargs),
            Value::Class(class) => self.instantiate(class, args, kwargs),
            other => Err(self.raise_error(
                "TypeError",
                format!("'{}' object is not callable", other.type_name()),
            )),
        }
    }

    /// Call a script function, offering a placeholder failure raised in its
    /// own frame to the installed handler when a boundary is active.
    pub fn call_function(
        &mut self,
        cell: &Arc<FunctionCell>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Flow<Value> {
        let replay = if self.boundary_active() && self.handler.is_some() {
            Some((args.clone(), kwargs.clone()))
        } else {
            None
        };
        match self.invoke(cell, args, kwargs) {
            Err(Unwind::Raise(signal)) => match replay {
                Some((args, kwargs)) if self.interceptable(cell, &signal) => {
                    self.intercept(cell, signal, args, kwargs)
                }
                _ => Err(Unwind::Raise(signal)),
            },
            other => other,
        }
    }

    fn interceptable(&self, cell: &FunctionCell, signal: &ExceptionValue) -> bool {
        self.boundary_active() && signal.is_placeholder() && signal.raised_in(cell) && !signal.is_handled()
    }

    fn intercept(
        &mut self,
        cell: &Arc<FunctionCell>,
        signal: Arc<ExceptionValue>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Flow<Value> {
        let Some(handler) = self.handler.clone() else {
            return Err(Unwind::Raise(signal));
        };
        if !signal.try_claim() {
            return Err(Unwind::Raise(signal));
        }
        tracing::debug!(function = %cell.qualname, "placeholder failure intercepted");
        let interception = Interception {
            signal: signal.clone(),
            function: cell.clone(),
            args,
            kwargs,
        };
        match handler.handle(self, interception) {
            Resolution::Resumed(value) => Ok(value),
            Resolution::Propagate => Err(Unwind::Raise(signal)),
            Resolution::Raise(other) => Err(Unwind::Raise(other)),
        }
    }

    fn invoke(&mut self, cell: &Arc<FunctionCell>, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Flow<Value> {
        if self.frames.len() >= MAX_DEPTH {
            return Err(self.raise_error("RecursionError", "maximum recursion depth exceeded"));
        }
        let body = cell.body();
        let local = Scope::child(&cell.scope, ScopeKind::Function, format!("{}.<locals>.", cell.qualname));
        self.bind_arguments(cell, &body, &local, args, kwargs)?;
        self.frames.push(ActiveFrame {
            function: cell.clone(),
            line: body.def.span.start_line,
        });
        let result = self.exec_block(&body.def.body, &local);
        self.frames.pop();
        match result {
            Ok(()) => Ok(Value::None),
            Err(Unwind::Return(value)) => Ok(value),
            Err(Unwind::Break) | Err(Unwind::Continue) => {
                Err(self.raise_error("SyntaxError", "'break' or 'continue' outside loop"))
            }
            Err(raise) => Err(raise),
        }
    }

    fn bind_arguments(
        &mut self,
        cell: &FunctionCell,
        body: &FunctionBody,
        local: &Scope,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Flow<()> {
        let def = &body.def;
        let name = &cell.name;
        let mut slots: Vec<Option<Value>> = vec![None; def.params.len()];
        let positional: Vec<usize> = def
            .params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.kind == ParamKind::Positional)
            .map(|(i, _)| i)
            .collect();
        let has_varargs = def.params.iter().any(|p| p.kind == ParamKind::VarArgs);
        let has_varkw = def.params.iter().any(|p| p.kind == ParamKind::KwArgs);

        let given = args.len();
        let mut extra = Vec::new();
        for (n, value) in args.into_iter().enumerate() {
            match positional.get(n) {
                Some(&i) => slots[i] = Some(value),
                None => extra.push(value),
            }
        }
        if !extra.is_empty() && !has_varargs {
            return Err(self.raise_error(
                "TypeError",
                format!(
                    "{}() takes {} positional argument{} but {} were given",
                    name,
                    positional.len(),
                    if positional.len() == 1 { "" } else { "s" },
                    given
                ),
            ));
        }

        let mut extra_kw = Vec::new();
        for (key, value) in kwargs {
            match def.params.iter().position(|p| p.name == key && !p.is_variadic()) {
                Some(i) if slots[i].is_some() => {
                    return Err(self.raise_error(
                        "TypeError",
                        format!("{}() got multiple values for argument '{}'", name, key),
                    ));
                }
                Some(i) => slots[i] = Some(value),
                None if has_varkw => extra_kw.push((Value::str(&key), value)),
                None => {
                    return Err(self.raise_error(
                        "TypeError",
                        format!("{}() got an unexpected keyword argument '{}'", name, key),
                    ));
                }
            }
        }

        let mut missing = Vec::new();
        for (i, param) in def.params.iter().enumerate() {
            match param.kind {
                ParamKind::VarArgs => local.set(&param.name, Value::tuple(std::mem::take(&mut extra))),
                ParamKind::KwArgs => local.set(&param.name, Value::dict(std::mem::take(&mut extra_kw))),
                _ => match slots[i].take().or_else(|| body.defaults.get(i).cloned().flatten()) {
                    Some(value) => local.set(&param.name, value),
                    None => missing.push(format!("'{}'", param.name)),
                },
            }
        }
        if !missing.is_empty() {
            return Err(self.raise_error(
                "TypeError",
                format!(
                    "{}() missing {} required argument{}: {}",
                    name,
                    missing.len(),
                    if missing.len() == 1 { "" } else { "s" },
                    missing.join(", ")
                ),
            ));
        }
        Ok(())
    }

    fn call_traced(&mut self, wrapper: Arc<Decorated>, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Flow<Value> {
        let name = match &wrapper.inner {
            Value::Function(cell) => cell.qualname.clone(),
            other => other.repr(),
        };
        tracing::info!(target: "jitter::trace", function = %name, args = args.len(), "call");
        let result = self.call_value(&wrapper.inner, args, kwargs);
        match &result {
            Ok(value) => tracing::info!(target: "jitter::trace", function = %name, result = %value.repr(), "return"),
            Err(Unwind::Raise(exc)) => tracing::info!(target: "jitter::trace", function = %name, error = exc.kind(), "raise"),
            Err(_) => {}
        }
        result
    }

    fn instantiate(&mut self, class: &Arc<Class>, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Flow<Value> {
        if class.is_exception() {
            return Ok(Value::Exception(Arc::new(ExceptionValue::new(class.clone(), args))));
        }
        let instance = Arc::new(Instance::new(class.clone()));
        let receiver = Value::Instance(instance.clone());
        if let Some(spec) = class.dataclass_spec() {
            self.init_dataclass(class, &spec, &instance, args, kwargs)?;
            if let Some(post) = class.lookup("__post_init__") {
                self.call_value(&post, vec![receiver.clone()], Vec::new())?;
            }
        } else if let Some(init) = class.lookup("__init__") {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(receiver.clone());
            full.extend(args);
            self.call_value(&init, full, kwargs)?;
        } else if !args.is_empty() || !kwargs.is_empty() {
            return Err(self.raise_error("TypeError", format!("{}() takes no arguments", class.name)));
        }
        Ok(receiver)
    }

    fn init_dataclass(
        &mut self,
        class: &Class,
        spec: &DataclassSpec,
        instance: &Instance,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Flow<()> {
        if args.len() > spec.fields.len() {
            return Err(self.raise_error(
                "TypeError",
                format!(
                    "{}.__init__() takes {} positional arguments but {} were given",
                    class.name,
                    spec.fields.len() + 1,
                    args.len() + 1
                ),
            ));
        }
        let mut values: Vec<Option<Value>> = vec![None; spec.fields.len()];
        for (i, value) in args.into_iter().enumerate() {
            values[i] = Some(value);
        }
        for (key, value) in kwargs {
            match spec.fields.iter().position(|f| *f == key) {
                Some(i) if values[i].is_some() => {
                    return Err(self.raise_error(
                        "TypeError",
                        format!("{}.__init__() got multiple values for argument '{}'", class.name, key),
                    ));
                }
                Some(i) => values[i] = Some(value),
                None => {
                    return Err(self.raise_error(
                        "TypeError",
                        format!("{}.__init__() got an unexpected keyword argument '{}'", class.name, key),
                    ));
                }
            }
        }
        for (field, value) in spec.fields.iter().zip(values) {
            match value.or_else(|| class.lookup(field)) {
                Some(v) => instance.set(field.clone(), v),
                None => {
                    return Err(self.raise_error(
                        "TypeError",
                        format!("{}.__init__() missing 1 required positional argument: '{}'", class.name, field),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Replace a function's body with `def`, evaluating new defaults in the
    /// function's own enclosing scope. Returns the new revision.
    pub fn hot_swap(&mut self, cell: &Arc<FunctionCell>, def: Arc<FunctionDef>) -> Result<u32> {
        let defaults = self
            .eval_defaults(&def, &cell.scope)
            .map_err(Unwind::into_error)?;
        Ok(cell.replace_body(def, defaults))
    }

    fn eval_defaults(&mut self, def: &FunctionDef, scope: &Arc<Scope>) -> Flow<Vec<Option<Value>>> {
        let mut defaults = Vec::with_capacity(def.params.len());
        for param in &def.params {
            defaults.push(match &param.default {
                Some(expr) => Some(self.eval(expr, scope)?),
                None => None,
            });
        }
        Ok(defaults)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  ERRORS
    // ═══════════════════════════════════════════════════════════════════

    fn exception_class(&self, kind: &str) -> Arc<Class> {
        match self.builtins.get_local(kind) {
            Some(Value::Class(class)) if class.is_exception() => class,
            _ => match self.builtins.get_local("Exception") {
                Some(Value::Class(class)) => class,
                _ => Arc::new(Class::builtin("Exception", None)),
            },
        }
    }

    /// Build an exception of builtin `kind` raised at the current frame.
    pub fn raise_error(&self, kind: &str, message: impl Into<String>) -> Unwind {
        let exc = Arc::new(ExceptionValue::new(
            self.exception_class(kind),
            vec![Value::str(message.into())],
        ));
        exc.record_trace(&self.frames);
        Unwind::Raise(exc)
    }

    pub(crate) fn op_error(&self, err: OpError) -> Unwind {
        self.raise_error(err.kind, err.message)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  STATEMENTS
    // ═══════════════════════════════════════════════════════════════════

    pub(crate) fn exec_block(&mut self, body: &[Stmt], scope: &Arc<Scope>) -> Flow<()> {
        for stmt in body {
            self.exec(stmt, scope)?;
        }
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt, scope: &Arc<Scope>) -> Flow<()> {
        if scope.kind == ScopeKind::Function {
            if let Some(frame) = self.frames.last_mut() {
                frame.line = stmt.line;
            }
        }
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, scope)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, scope)?;
                for target in targets {
                    self.assign(target, value.clone(), scope)?;
                }
            }
            StmtKind::AnnAssign { target, value, .. } => {
                if let Some(value) = value {
                    let value = self.eval(value, scope)?;
                    self.assign(target, value, scope)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => {
                let rhs = self.eval(value, scope)?;
                self.augmented_assign(target, *op, rhs, scope)?;
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::None,
                };
                return Err(Unwind::Return(value));
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test, scope)?.truthy() {
                        return self.exec_block(body, scope);
                    }
                }
                return self.exec_block(orelse, scope);
            }
            StmtKind::While { test, body, orelse } => {
                loop {
                    if !self.eval(test, scope)?.truthy() {
                        return self.exec_block(orelse, scope);
                    }
                    match self.exec_block(body, scope) {
                        Err(Unwind::Break) => break,
                        Err(Unwind::Continue) | Ok(()) => {}
                        Err(other) => return Err(other),
                    }
                }
            }
            StmtKind::For { target, iter, body, orelse } => {
                let iterable = self.eval(iter, scope)?;
                let items = self.iterate(&iterable)?;
                for item in items {
                    self.assign(target, item, scope)?;
                    match self.exec_block(body, scope) {
                        Err(Unwind::Break) => return Ok(()),
                        Err(Unwind::Continue) | Ok(()) => {}
                        Err(other) => return Err(other),
                    }
                }
                return self.exec_block(orelse, scope);
            }
            StmtKind::Break => return Err(Unwind::Break),
            StmtKind::Continue => return Err(Unwind::Continue),
            StmtKind::Pass => {}
            StmtKind::Raise(value) => return Err(self.raise_statement(value.as_ref(), scope)?),
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finally,
            } => return self.exec_try(body, handlers, orelse, finally, scope),
            StmtKind::Assert { test, msg } => {
                if !self.eval(test, scope)?.truthy() {
                    let message = match msg {
                        Some(m) => {
                            let v = self.eval(m, scope)?;
                            self.stringify(&v)?
                        }
                        None => String::new(),
                    };
                    return Err(self.raise_error("AssertionError", message));
                }
            }
            StmtKind::With { context, alias, body } => {
                return self.exec_with(context, alias.as_ref(), body, scope);
            }
            StmtKind::FunctionDef(def) => {
                let value = self.make_function(def, scope)?;
                scope.set(def.name.clone(), value);
            }
            StmtKind::ClassDef(def) => {
                let value = self.make_class(def, scope)?;
                scope.set(def.name.clone(), value);
            }
        }
        Ok(())
    }

    /// Evaluate a `raise` statement into the unwind it produces.
    fn raise_statement(&mut self, value: Option<&Expr>, scope: &Arc<Scope>) -> Flow<Unwind> {
        let Some(expr) = value else {
            return Ok(match self.handling.last() {
                Some(active) => Unwind::Raise(active.clone()),
                None => self.raise_error("RuntimeError", "No active exception to reraise"),
            });
        };
        let exc = match self.eval(expr, scope)? {
            Value::Exception(exc) => exc,
            Value::Class(class) if class.is_exception() => Arc::new(ExceptionValue::new(class, Vec::new())),
            other => {
                return Ok(self.raise_error(
                    "TypeError",
                    format!("exceptions must derive from BaseException, not {}", other.type_name()),
                ))
            }
        };
        exc.rearm(&self.frames);
        Ok(Unwind::Raise(exc))
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
        finally: &[Stmt],
        scope: &Arc<Scope>,
    ) -> Flow<()> {
        let result = match self.exec_block(body, scope) {
            Ok(()) => self.exec_block(orelse, scope),
            Err(Unwind::Raise(exc)) => self.handle_exception(exc, handlers, scope),
            Err(other) => Err(other),
        };
        if !finally.is_empty() {
            self.exec_block(finally, scope)?;
        }
        result
    }

    fn handle_exception(&mut self, exc: Arc<ExceptionValue>, handlers: &[ExceptHandler], scope: &Arc<Scope>) -> Flow<()> {
        for handler in handlers {
            let matches = match &handler.kind {
                None => true,
                Some(kind) => {
                    let kind = self.eval(kind, scope)?;
                    self.exception_matches(&exc, &kind)?
                }
            };
            if !matches {
                continue;
            }
            if let Some(alias) = &handler.alias {
                scope.set(alias.clone(), Value::Exception(exc.clone()));
            }
            self.handling.push(exc.clone());
            let result = self.exec_block(&handler.body, scope);
            self.handling.pop();
            return result;
        }
        Err(Unwind::Raise(exc))
    }

    fn exception_matches(&self, exc: &ExceptionValue, kind: &Value) -> Flow<bool> {
        match kind {
            Value::Class(class) => Ok(exc.is_instance_of(class)),
            Value::Tuple(items) => {
                for item in items.iter() {
                    if self.exception_matches(exc, item)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            other => Err(self.raise_error(
                "TypeError",
                format!("catching '{}' that does not inherit from BaseException is not allowed", other.type_name()),
            )),
        }
    }

    fn exec_with(&mut self, context: &Expr, alias: Option<&Target>, body: &[Stmt], scope: &Arc<Scope>) -> Flow<()> {
        let ctx = self.eval(context, scope)?;
        match &ctx {
            Value::Boundary => {
                if let Some(alias) = alias {
                    self.assign(alias, Value::Boundary, scope)?;
                }
                self.guarded(|interp| interp.exec_block(body, scope))
            }
            Value::Instance(_) => {
                let enter = self.get_attr(&ctx, "__enter__")?;
                let entered = self.call_value(&enter, Vec::new(), Vec::new())?;
                if let Some(alias) = alias {
                    self.assign(alias, entered, scope)?;
                }
                let result = self.exec_block(body, scope);
                let exit = self.get_attr(&ctx, "__exit__")?;
                match result {
                    Err(Unwind::Raise(exc)) => {
                        let args = vec![Value::Class(exc.class.clone()), Value::Exception(exc.clone()), Value::None];
                        if self.call_value(&exit, args, Vec::new())?.truthy() {
                            Ok(())
                        } else {
                            Err(Unwind::Raise(exc))
                        }
                    }
                    other => {
                        self.call_value(&exit, vec![Value::None, Value::None, Value::None], Vec::new())?;
                        other
                    }
                }
            }
            other => Err(self.raise_error(
                "TypeError",
                format!("'{}' object does not support the context manager protocol", other.type_name()),
            )),
        }
    }

    fn make_function(&mut self, def: &Arc<FunctionDef>, scope: &Arc<Scope>) -> Flow<Value> {
        let defaults = self.eval_defaults(def, scope)?;
        let Some(globals) = scope.module_scope() else {
            return Err(self.raise_error("RuntimeError", "function defined outside a module"));
        };
        let Some(record) = globals.record.clone() else {
            return Err(self.raise_error("RuntimeError", "module scope without a source record"));
        };
        let cell = FunctionCell::new(
            def.clone(),
            defaults,
            format!("{}{}", scope.qualprefix, def.name),
            record,
            globals,
            scope.closure_scope(),
            scope.kind == ScopeKind::Class,
        );
        let mut value = Value::Function(Arc::new(cell));
        for decorator in def.decorators.iter().rev() {
            let apply = self.eval(&decorator.expr, scope)?;
            value = self.call_value(&apply, vec![value], Vec::new())?;
        }
        Ok(value)
    }

    fn make_class(&mut self, def: &Arc<ClassDef>, scope: &Arc<Scope>) -> Flow<Value> {
        let mut base = None;
        for expr in &def.bases {
            match self.eval(expr, scope)? {
                Value::Class(class) if base.is_none() => base = Some(class),
                Value::Class(_) => {
                    return Err(self.raise_error("TypeError", "multiple inheritance is not supported"));
                }
                other => {
                    return Err(self.raise_error(
                        "TypeError",
                        format!("cannot inherit from '{}'", other.type_name()),
                    ));
                }
            }
        }
        let qualname = format!("{}{}", scope.qualprefix, def.name);
        let body_scope = Scope::child(scope, ScopeKind::Class, format!("{}.", qualname));
        self.exec_block(&def.body, &body_scope)?;
        let record = scope.module_scope().and_then(|m| m.record.clone());
        let class = Class::new(
            def.name.clone(),
            qualname,
            base,
            body_scope.snapshot(),
            Some(def.clone()),
            record,
        );
        let mut value = Value::Class(Arc::new(class));
        for decorator in def.decorators.iter().rev() {
            let apply = self.eval(&decorator.expr, scope)?;
            value = self.call_value(&apply, vec![value], Vec::new())?;
        }
        Ok(value)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  ASSIGNMENT
    // ═══════════════════════════════════════════════════════════════════

    fn assign(&mut self, target: &Target, value: Value, scope: &Arc<Scope>) -> Flow<()> {
        match target {
            Target::Name(name) => {
                scope.set(name.clone(), value);
                Ok(())
            }
            Target::Attribute(object, attr) => {
                let object = self.eval(object, scope)?;
                self.set_attr(&object, attr, value)
            }
            Target::Subscript(object, index) => {
                let object = self.eval(object, scope)?;
                let index = self.eval(index, scope)?;
                self.set_item(&object, index, value)
            }
            Target::Tuple(targets) => {
                let items = self.iterate(&value)?;
                if items.len() < targets.len() {
                    return Err(self.raise_error(
                        "ValueError",
                        format!("not enough values to unpack (expected {}, got {})", targets.len(), items.len()),
                    ));
                }
                if items.len() > targets.len() {
                    return Err(self.raise_error(
                        "ValueError",
                        format!("too many values to unpack (expected {})", targets.len()),
                    ));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item, scope)?;
                }
                Ok(())
            }
        }
    }

    fn augmented_assign(&mut self, target: &Target, op: BinOp, rhs: Value, scope: &Arc<Scope>) -> Flow<()> {
        match target {
            Target::Name(name) => {
                let current = self.lookup(name, scope)?;
                let updated = self.augmented(op, current, rhs)?;
                scope.set(name.clone(), updated);
                Ok(())
            }
            Target::Attribute(object, attr) => {
                let object = self.eval(object, scope)?;
                let current = self.get_attr(&object, attr)?;
                let updated = self.augmented(op, current, rhs)?;
                self.set_attr(&object, attr, updated)
            }
            Target::Subscript(object, index) => {
                let object = self.eval(object, scope)?;
                let index = self.eval(index, scope)?;
                let current = self.get_item(&object, &index)?;
                let updated = self.augmented(op, current, rhs)?;
                self.set_item(&object, index, updated)
            }
            Target::Tuple(_) => Err(self.raise_error(
                "SyntaxError",
                "illegal expression for augmented assignment",
            )),
        }
    }

    fn augmented(&mut self, op: BinOp, current: Value, rhs: Value) -> Flow<Value> {
        if let (BinOp::Add, Value::List(items)) = (op, &current) {
            let extra = self.iterate(&rhs)?;
            lock(items).extend(extra);
            return Ok(current);
        }
        ops::binary(op, &current, &rhs).map_err(|e| self.op_error(e))
    }

    // ═══════════════════════════════════════════════════════════════════
    //  ATTRIBUTES AND ITEMS
    // ═══════════════════════════════════════════════════════════════════

    fn no_attribute(&self, value: &Value, name: &str) -> Unwind {
        let message = match value {
            Value::Class(class) => format!("type object '{}' has no attribute '{}'", class.name, name),
            other => format!("'{}' object has no attribute '{}'", other.type_name(), name),
        };
        self.raise_error("AttributeError", message)
    }

    pub fn get_attr(&mut self, value: &Value, name: &str) -> Flow<Value> {
        match value {
            Value::Instance(instance) => {
                if let Some(v) = instance.get(name) {
                    return Ok(v);
                }
                if name == "__class__" {
                    return Ok(Value::Class(instance.class.clone()));
                }
                match instance.class.lookup(name) {
                    Some(attr) => Ok(bind(value, attr)),
                    None => Err(self.no_attribute(value, name)),
                }
            }
            Value::Class(class) => match name {
                "__name__" => Ok(Value::str(&class.name)),
                "__qualname__" => Ok(Value::str(&class.qualname)),
                _ => class.lookup(name).ok_or_else(|| self.no_attribute(value, name)),
            },
            Value::Function(cell) => match name {
                "__name__" => Ok(Value::str(&cell.name)),
                "__qualname__" => Ok(Value::str(&cell.qualname)),
                "__doc__" => Ok(cell.doc.as_ref().map(Value::str).unwrap_or(Value::None)),
                "__module__" => Ok(Value::str(&cell.module.name)),
                _ => Err(self.no_attribute(value, name)),
            },
            Value::Decorated(wrapper) => match name {
                "__wrapped__" => Ok(wrapper.inner.clone()),
                _ => {
                    let inner = wrapper.inner.clone();
                    self.get_attr(&inner, name)
                }
            },
            Value::BoundMethod(bound) => match name {
                "__self__" => Ok(bound.receiver.clone()),
                "__func__" => Ok(bound.method.clone()),
                _ => {
                    let method = bound.method.clone();
                    self.get_attr(&method, name)
                }
            },
            Value::Native(native) if name == "__name__" => Ok(Value::str(&native.name)),
            Value::Exception(exc) => match name {
                "args" => Ok(Value::tuple(exc.args.clone())),
                "__class__" => Ok(Value::Class(exc.class.clone())),
                _ => Err(self.no_attribute(value, name)),
            },
            Value::Str(_) | Value::List(_) | Value::Dict(_) | Value::Set(_) | Value::Tuple(_)
                if builtins::has_method(value, name) =>
            {
                Ok(Value::BuiltinMethod(Arc::new(BuiltinMethod {
                    receiver: value.clone(),
                    name: name.to_string(),
                })))
            }
            _ => Err(self.no_attribute(value, name)),
        }
    }

    fn set_attr(&mut self, object: &Value, name: &str, value: Value) -> Flow<()> {
        match object {
            Value::Instance(instance) => {
                if instance.class.dataclass_spec().map(|s| s.frozen).unwrap_or(false) {
                    return Err(self.raise_error(
                        "AttributeError",
                        format!("cannot assign to field '{}'", name),
                    ));
                }
                instance.set(name, value);
                Ok(())
            }
            Value::Class(class) => {
                lock(&class.attrs).insert(name.to_string(), value);
                Ok(())
            }
            other => Err(self.no_attribute(other, name)),
        }
    }

    pub fn get_item(&mut self, object: &Value, index: &Value) -> Flow<Value> {
        match object {
            Value::List(items) => {
                let items = lock(items).clone();
                self.index_sequence(&items, index, "list").map(|r| match r {
                    Indexed::One(v) => v,
                    Indexed::Many(vs) => Value::list(vs),
                })
            }
            Value::Tuple(items) => self.index_sequence(items, index, "tuple").map(|r| match r {
                Indexed::One(v) => v,
                Indexed::Many(vs) => Value::tuple(vs),
            }),
            Value::Str(s) => {
                let chars: Vec<Value> = s.chars().map(|c| Value::str(c.to_string())).collect();
                self.index_sequence(&chars, index, "string").map(|r| match r {
                    Indexed::One(v) => v,
                    Indexed::Many(vs) => {
                        Value::str(vs.iter().filter_map(|v| v.as_str().map(str::to_string)).collect::<String>())
                    }
                })
            }
            Value::Dict(pairs) => {
                let found = lock(pairs)
                    .iter()
                    .find(|(k, _)| k.py_eq(index))
                    .map(|(_, v)| v.clone());
                found.ok_or_else(|| self.raise_error("KeyError", index.repr()))
            }
            Value::Instance(_) => {
                let getter = self.get_attr(object, "__getitem__")?;
                self.call_value(&getter, vec![index.clone()], Vec::new())
            }
            other => Err(self.raise_error(
                "TypeError",
                format!("'{}' object is not subscriptable", other.type_name()),
            )),
        }
    }

    fn index_sequence(&self, items: &[Value], index: &Value, kind: &str) -> Flow<Indexed> {
        match index {
            Value::Slice(lower, upper, step) => {
                let step = step.unwrap_or(1);
                if step == 0 {
                    return Err(self.raise_error("ValueError", "slice step cannot be zero"));
                }
                let picked = slice_indices(items.len(), *lower, *upper, step)
                    .into_iter()
                    .map(|i| items[i].clone())
                    .collect();
                Ok(Indexed::Many(picked))
            }
            other => match other.as_int() {
                Some(i) => {
                    let len = items.len() as i64;
                    let idx = if i < 0 { i + len } else { i };
                    if idx < 0 || idx >= len {
                        return Err(self.raise_error("IndexError", format!("{} index out of range", kind)));
                    }
                    Ok(Indexed::One(items[idx as usize].clone()))
                }
                None => Err(self.raise_error(
                    "TypeError",
                    format!("{} indices must be integers or slices, not {}", kind, other.type_name()),
                )),
            },
        }
    }

    fn set_item(&mut self, object: &Value, index: Value, value: Value) -> Flow<()> {
        match object {
            Value::List(items) => {
                let Some(i) = index.as_int() else {
                    return Err(self.raise_error(
                        "TypeError",
                        format!("list indices must be integers, not {}", index.type_name()),
                    ));
                };
                let mut items = lock(items);
                let len = items.len() as i64;
                let idx = if i < 0 { i + len } else { i };
                if idx < 0 || idx >= len {
                    drop(items);
                    return Err(self.raise_error("IndexError", "list assignment index out of range"));
                }
                items[idx as usize] = value;
                Ok(())
            }
            Value::Dict(pairs) => {
                let mut pairs = lock(pairs);
                match pairs.iter_mut().find(|(k, _)| k.py_eq(&index)) {
                    Some(slot) => slot.1 = value,
                    None => pairs.push((index, value)),
                }
                Ok(())
            }
            other => Err(self.raise_error(
                "TypeError",
                format!("'{}' object does not support item assignment", other.type_name()),
            )),
        }
    }

    /// Materialize an iterable.
    pub fn iterate(&mut self, value: &Value) -> Flow<Vec<Value>> {
        match value {
            Value::List(items) | Value::Set(items) => Ok(lock(items).clone()),
            Value::Tuple(items) => Ok(items.to_vec()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
            Value::Dict(pairs) => Ok(lock(pairs).iter().map(|(k, _)| k.clone()).collect()),
            other => Err(self.raise_error(
                "TypeError",
                format!("'{}' object is not iterable", other.type_name()),
            )),
        }
    }

    /// `str(value)`, honoring user `__str__`/`__repr__`.
    pub fn stringify(&mut self, value: &Value) -> Flow<String> {
        if let Value::Instance(instance) = value {
            for hook in ["__str__", "__repr__"] {
                if let Some(method) = instance.class.lookup(hook) {
                    return self.call_hook(value, method, hook);
                }
            }
        }
        Ok(value.to_display())
    }

    /// `repr(value)`, honoring user `__repr__`.
    pub fn represent(&mut self, value: &Value) -> Flow<String> {
        if let Value::Instance(instance) = value {
            if let Some(method) = instance.class.lookup("__repr__") {
                return self.call_hook(value, method, "__repr__");
            }
        }
        Ok(value.repr())
    }

    fn call_hook(&mut self, receiver: &Value, method: Value, hook: &str) -> Flow<String> {
        match self.call_value(&method, vec![receiver.clone()], Vec::new())? {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(self.raise_error(
                "TypeError",
                format!("{} returned non-string (type {})", hook, other.type_name()),
            )),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  EXPRESSIONS
    // ═══════════════════════════════════════════════════════════════════

    fn lookup(&self, name: &str, scope: &Scope) -> Flow<Value> {
        scope
            .get(name)
            .ok_or_else(|| self.raise_error("NameError", format!("name '{}' is not defined", name)))
    }

    pub(crate) fn eval(&mut self, expr: &Expr, scope: &Arc<Scope>) -> Flow<Value> {
        match &expr.kind {
            ExprKind::None | ExprKind::Ellipsis => Ok(Value::None),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Int(i) => Ok(Value::Int(*i)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Str(s) => Ok(Value::str(s)),
            ExprKind::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FStringPart::Literal(text) => out.push_str(text),
                        FStringPart::Field { expr, spec } => {
                            let value = self.eval(expr, scope)?;
                            let rendered = self.stringify(&value)?;
                            let text = match spec {
                                Some(spec) => ops::format_with_spec(&value, rendered, spec)
                                    .map_err(|e| self.op_error(e))?,
                                None => rendered,
                            };
                            out.push_str(&text);
                        }
                    }
                }
                Ok(Value::str(out))
            }
            ExprKind::Name(name) => self.lookup(name, scope),
            ExprKind::List(items) => Ok(Value::list(self.eval_all(items, scope)?)),
            ExprKind::Tuple(items) => Ok(Value::tuple(self.eval_all(items, scope)?)),
            ExprKind::Set(items) => Ok(Value::set(self.eval_all(items, scope)?)),
            ExprKind::Dict(pairs) => {
                let mut out: Vec<(Value, Value)> = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = self.eval(k, scope)?;
                    let value = self.eval(v, scope)?;
                    match out.iter_mut().find(|(existing, _)| existing.py_eq(&key)) {
                        Some(slot) => slot.1 = value,
                        None => out.push((key, value)),
                    }
                }
                Ok(Value::dict(out))
            }
            ExprKind::Binary { op, left, right } => {
                let l = self.eval(left, scope)?;
                let r = self.eval(right, scope)?;
                ops::binary(*op, &l, &r).map_err(|e| self.op_error(e))
            }
            ExprKind::Unary { op, operand } => {
                let v = self.eval(operand, scope)?;
                ops::unary(*op, &v).map_err(|e| self.op_error(e))
            }
            ExprKind::BoolOp { and, left, right } => {
                let l = self.eval(left, scope)?;
                if l.truthy() == *and {
                    self.eval(right, scope)
                } else {
                    Ok(l)
                }
            }
            ExprKind::Compare { first, rest } => {
                let mut left = self.eval(first, scope)?;
                for (op, right_expr) in rest {
                    let right = self.eval(right_expr, scope)?;
                    if !ops::compare(*op, &left, &right).map_err(|e| self.op_error(e))? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::Conditional { body, test, orelse } => {
                if self.eval(test, scope)?.truthy() {
                    self.eval(body, scope)
                } else {
                    self.eval(orelse, scope)
                }
            }
            ExprKind::Call { func, args } => {
                let callee = self.eval(func, scope)?;
                let (positional, keywords) = self.eval_args(args, scope)?;
                self.call_value(&callee, positional, keywords)
            }
            ExprKind::Attribute { value, attr } => {
                let object = self.eval(value, scope)?;
                self.get_attr(&object, attr)
            }
            ExprKind::Subscript { value, index } => {
                let object = self.eval(value, scope)?;
                let index = self.eval(index, scope)?;
                self.get_item(&object, &index)
            }
            ExprKind::Slice { lower, upper, step } => {
                let lower = self.slice_bound(lower.as_deref(), scope)?;
                let upper = self.slice_bound(upper.as_deref(), scope)?;
                let step = self.slice_bound(step.as_deref(), scope)?;
                Ok(Value::Slice(lower, upper, step))
            }
            ExprKind::Lambda(def) => self.make_function(def, scope),
            ExprKind::ListComp { element, clauses } => {
                let inner = Scope::child(scope, ScopeKind::Function, scope.qualprefix.clone());
                let mut out = Vec::new();
                self.comprehend(clauses, &inner, &mut |interp: &mut Interpreter, s: &Arc<Scope>| {
                    out.push(interp.eval(element, s)?);
                    Ok(())
                })?;
                Ok(Value::list(out))
            }
            ExprKind::DictComp { key, value, clauses } => {
                let inner = Scope::child(scope, ScopeKind::Function, scope.qualprefix.clone());
                let mut out: Vec<(Value, Value)> = Vec::new();
                self.comprehend(clauses, &inner, &mut |interp: &mut Interpreter, s: &Arc<Scope>| {
                    let k = interp.eval(key, s)?;
                    let v = interp.eval(value, s)?;
                    match out.iter_mut().find(|(existing, _)| existing.py_eq(&k)) {
                        Some(slot) => slot.1 = v,
                        None => out.push((k, v)),
                    }
                    Ok(())
                })?;
                Ok(Value::dict(out))
            }
        }
    }

    fn eval_all(&mut self, items: &[Expr], scope: &Arc<Scope>) -> Flow<Vec<Value>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(self.eval(item, scope)?);
        }
        Ok(out)
    }

    fn slice_bound(&mut self, expr: Option<&Expr>, scope: &Arc<Scope>) -> Flow<Option<i64>> {
        let Some(expr) = expr else {
            return Ok(None);
        };
        match self.eval(expr, scope)? {
            Value::None => Ok(None),
            v => match v.as_int() {
                Some(i) => Ok(Some(i)),
                None => Err(self.raise_error("TypeError", "slice indices must be integers or None")),
            },
        }
    }

    fn eval_args(&mut self, args: &[Arg], scope: &Arc<Scope>) -> Flow<(Vec<Value>, Vec<(String, Value)>)> {
        let mut positional = Vec::new();
        let mut keywords = Vec::new();
        for arg in args {
            match arg {
                Arg::Positional(expr) => positional.push(self.eval(expr, scope)?),
                Arg::Keyword(name, expr) => keywords.push((name.clone(), self.eval(expr, scope)?)),
                Arg::Star(expr) => {
                    let value = self.eval(expr, scope)?;
                    positional.extend(self.iterate(&value)?);
                }
                Arg::DoubleStar(expr) => match self.eval(expr, scope)? {
                    Value::Dict(pairs) => {
                        let pairs = lock(&pairs).clone();
                        for (k, v) in pairs {
                            match k {
                                Value::Str(name) => keywords.push((name.to_string(), v)),
                                _ => return Err(self.raise_error("TypeError", "keywords must be strings")),
                            }
                        }
                    }
                    other => {
                        return Err(self.raise_error(
                            "TypeError",
                            format!("argument after ** must be a mapping, not {}", other.type_name()),
                        ))
                    }
                },
            }
        }
        Ok((positional, keywords))
    }

    fn comprehend(
        &mut self,
        clauses: &[CompClause],
        scope: &Arc<Scope>,
        emit: &mut dyn FnMut(&mut Interpreter, &Arc<Scope>) -> Flow<()>,
    ) -> Flow<()> {
        let Some((first, rest)) = clauses.split_first() else {
            return emit(self, scope);
        };
        match first {
            CompClause::For { target, iter } => {
                let iterable = self.eval(iter, scope)?;
                for item in self.iterate(&iterable)? {
                    self.assign(target, item, scope)?;
                    self.comprehend(rest, scope, emit)?;
                }
                Ok(())
            }
            CompClause::If(test) => {
                if self.eval(test, scope)?.truthy() {
                    self.comprehend(rest, scope, emit)
                } else {
                    Ok(())
                }
            }
        }
    }
}

enum Indexed {
    One(Value),
    Many(Vec<Value>),
}

fn bind(receiver: &Value, attr: Value) -> Value {
    match attr {
        Value::Function(_) | Value::Decorated(_) | Value::Native(_) => Value::BoundMethod(Arc::new(BoundMethod {
            receiver: receiver.clone(),
            method: attr,
        })),
        other => other,
    }
}

/// Indices selected by `[lower:upper:step]` on a sequence of `len` items.
fn slice_indices(len: usize, lower: Option<i64>, upper: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let normalize = |v: i64| if v < 0 { v + len } else { v };
    let mut out = Vec::new();
    if step > 0 {
        let start = lower.map(normalize).unwrap_or(0).clamp(0, len);
        let stop = upper.map(normalize).unwrap_or(len).clamp(0, len);
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
    } else {
        let start = lower.map(normalize).unwrap_or(len - 1).clamp(-1, len - 1);
        let stop = upper.map(normalize).unwrap_or(-1).clamp(-1, len - 1);
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> (Interpreter, LoadedModule) {
        let mut interp = Interpreter::new().with_output(OutputSink::buffer());
        let module = interp.load_source("test", src).unwrap();
        (interp, module)
    }

    fn call(interp: &mut Interpreter, module: &LoadedModule, name: &str, args: Vec<Value>) -> Value {
        let f = module.get(name).unwrap();
        interp.call(&f, args).unwrap()
    }

    #[test]
    fn test_slice_indices() {
        assert_eq!(slice_indices(5, Some(1), Some(3), 1), vec![1, 2]);
        assert_eq!(slice_indices(5, None, None, -1), vec![4, 3, 2, 1, 0]);
        assert_eq!(slice_indices(5, Some(-2), None, 1), vec![3, 4]);
        assert_eq!(slice_indices(3, Some(10), None, 1), Vec::<usize>::new());
    }

    #[test]
    fn test_closures_see_enclosing_bindings() {
        let (mut interp, module) = run(
            "def make(n):\n    def add(x):\n        return x + n\n    return add\n\nadd5 = make(5)\n",
        );
        let v = call(&mut interp, &module, "add5", vec![Value::Int(3)]);
        assert_eq!(v.as_int(), Some(8));
    }

    #[test]
    fn test_dataclass_fields_equality_and_frozen() {
        let src = "\
from dataclasses import dataclass

@dataclass(frozen=True)
class Integer:
    val: int

def same():
    return Integer(3) == Integer(val=3)

def mutate():
    x = Integer(1)
    x.val = 2
";
        let (mut interp, module) = run(src);
        assert!(call(&mut interp, &module, "same", vec![]).truthy());
        let f = module.get("mutate").unwrap();
        match interp.call(&f, vec![]) {
            Err(PatchError::Script { kind, .. }) => assert_eq!(kind, "AttributeError"),
            other => panic!("expected AttributeError, got {:?}", other),
        }
    }

    #[test]
    fn test_try_except_finally_and_print() {
        let src = "\
def risky(n):
    try:
        if n == 0:
            raise ValueError('zero')
        return 10 // n
    except ValueError as e:
        print(f'caught {e}')
        return -1
    finally:
        print('done')
";
        let (mut interp, module) = run(src);
        assert_eq!(call(&mut interp, &module, "risky", vec![Value::Int(0)]).as_int(), Some(-1));
        assert_eq!(call(&mut interp, &module, "risky", vec![Value::Int(5)]).as_int(), Some(2));
        assert_eq!(interp.output().contents(), "caught zero\ndone\ndone\n");
    }

    #[test]
    fn test_methods_bind_self() {
        let src = "\
class Counter:
    def __init__(self, start):
        self.count = start

    def bump(self, by=1):
        self.count += by
        return self.count

def go():
    c = Counter(2)
    c.bump()
    return c.bump(by=5)
";
        let (mut interp, module) = run(src);
        assert_eq!(call(&mut interp, &module, "go", vec![]).as_int(), Some(8));
    }

    #[test]
    fn test_comprehensions_and_unpacking() {
        let src = "\
def go():
    pairs = [(i, i * i) for i in range(5) if i % 2 == 0]
    table = {k: v for k, v in pairs}
    a, b = pairs[-1]
    return table[4] + a + b
";
        let (mut interp, module) = run(src);
        assert_eq!(call(&mut interp, &module, "go", vec![]).as_int(), Some(36));
    }

    #[test]
    fn test_argument_errors_are_type_errors() {
        let (mut interp, module) = run("def f(a, b):\n    return a\n");
        let f = module.get("f").unwrap();
        match interp.call(&f, vec![Value::Int(1)]) {
            Err(PatchError::Script { kind, message }) => {
                assert_eq!(kind, "TypeError");
                assert!(message.contains("missing 1 required argument: 'b'"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_placeholder_without_boundary_propagates() {
        let (mut interp, module) = run("def todo():\n    raise NotImplementedError('later')\n");
        let f = module.get("todo").unwrap();
        match interp.call_value(&f, vec![], vec![]) {
            Err(Unwind::Raise(exc)) => {
                assert!(exc.is_placeholder());
                assert_eq!(exc.message(), "later");
                assert!(!exc.is_handled());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_slice_with_huge_step() {
        let src = "\
def go():
    xs = [10, 20, 30]
    a = xs[1::9223372036854775807]
    b = xs[::-9223372036854775807]
    return len(a) * 100 + a[0] + b[0]
";
        let (mut interp, module) = run(src);
        assert_eq!(call(&mut interp, &module, "go", vec![]).as_int(), Some(150));
    }

    #[test]
    fn test_min_int_floor_division_raises() {
        let (mut interp, module) = run("def go(n):\n    return n // -1\n");
        let f = module.get("go").unwrap();
        match interp.call(&f, vec![Value::Int(i64::MIN)]) {
            Err(PatchError::Script { kind, .. }) => assert_eq!(kind, "OverflowError"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bare_raise_keeps_original_raise_point() {
        let src = "\
def inner():
    raise NotImplementedError('x')

def outer():
    try:
        inner()
    except NotImplementedError:
        raise
";
        let (mut interp, module) = run(src);
        let outer = module.get("outer").unwrap();
        let inner = module.function("inner").unwrap();
        match interp.call_value(&outer, vec![], vec![]) {
            Err(Unwind::Raise(exc)) => {
                assert!(exc.raised_in(&inner));
                assert_eq!(exc.trace().len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_explicit_reraise_moves_raise_point() {
        let src = "\
TODO = NotImplementedError('later')

def first():
    raise TODO

def second():
    try:
        first()
    except NotImplementedError as e:
        pass
    raise TODO
";
        let (mut interp, module) = run(src);
        let second = module.get("second").unwrap();
        let second_cell = module.function("second").unwrap();
        match interp.call_value(&second, vec![], vec![]) {
            Err(Unwind::Raise(exc)) => {
                assert!(exc.raised_in(&second_cell));
                assert_eq!(exc.trace().len(), 1);
                assert!(!exc.is_handled());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_recursion_limit() {
        let (mut interp, module) = run("def down(n):\n    return down(n + 1)\n");
        let f = module.get("down").unwrap();
        match interp.call(&f, vec![Value::Int(0)]) {
            Err(PatchError::Script { kind, .. }) => assert_eq!(kind, "RecursionError"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
