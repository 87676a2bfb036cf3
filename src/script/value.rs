//! Runtime values
//!
//! Every script function is a [`FunctionCell`]: a fixed identity that owns a
//! swappable body plus the lexical scope it closes over. Values hold cells by
//! `Arc`, so aliases created before a hot-swap observe the new body.

use super::ast::{ClassDef, FunctionDef, StmtKind, Target};
use super::interp::{Flow, Interpreter};
use super::registry::ModuleRecord;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a script function across body swaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FunctionId(pub u64);

impl FunctionId {
    fn next() -> Self {
        FunctionId(NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  SCOPES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Builtins,
    Module,
    Function,
    Class,
}

/// A lexical namespace. Class scopes are only visible to code running
/// directly in the class body, never to the methods defined there.
pub struct Scope {
    vars: Mutex<HashMap<String, Value>>,
    parent: Option<Arc<Scope>>,
    pub kind: ScopeKind,
    /// Prefix for qualified names of definitions made in this scope.
    pub qualprefix: String,
    /// Set on module scopes only.
    pub record: Option<Arc<ModuleRecord>>,
}

impl Scope {
    pub fn builtins() -> Arc<Self> {
        Arc::new(Self {
            vars: Mutex::new(HashMap::new()),
            parent: None,
            kind: ScopeKind::Builtins,
            qualprefix: String::new(),
            record: None,
        })
    }

    pub fn module(builtins: &Arc<Scope>, record: Arc<ModuleRecord>) -> Arc<Self> {
        Arc::new(Self {
            vars: Mutex::new(HashMap::new()),
            parent: Some(builtins.clone()),
            kind: ScopeKind::Module,
            qualprefix: String::new(),
            record: Some(record),
        })
    }

    pub fn child(parent: &Arc<Scope>, kind: ScopeKind, qualprefix: String) -> Arc<Self> {
        Arc::new(Self {
            vars: Mutex::new(HashMap::new()),
            parent: Some(parent.clone()),
            kind,
            qualprefix,
            record: None,
        })
    }

    /// Resolve a name: this scope, then enclosing non-class scopes.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(v) = lock(&self.vars).get(name) {
            return Some(v.clone());
        }
        let mut current = self.parent.clone();
        while let Some(scope) = current {
            if scope.kind != ScopeKind::Class {
                if let Some(v) = lock(&scope.vars).get(name) {
                    return Some(v.clone());
                }
            }
            current = scope.parent.clone();
        }
        None
    }

    pub fn get_local(&self, name: &str) -> Option<Value> {
        lock(&self.vars).get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        lock(&self.vars).insert(name.into(), value);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        lock(&self.vars).remove(name)
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        lock(&self.vars).clone()
    }

    /// The scope functions defined here close over (class bodies are skipped).
    pub fn closure_scope(self: &Arc<Self>) -> Arc<Scope> {
        let mut current = self.clone();
        while current.kind == ScopeKind::Class {
            match &current.parent {
                Some(parent) => current = parent.clone(),
                None => break,
            }
        }
        current
    }

    /// The module scope this scope belongs to.
    pub fn module_scope(self: &Arc<Self>) -> Option<Arc<Scope>> {
        let mut current = Some(self.clone());
        while let Some(scope) = current {
            if scope.kind == ScopeKind::Module {
                return Some(scope);
            }
            current = scope.parent.clone();
        }
        None
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("kind", &self.kind)
            .field("qualprefix", &self.qualprefix)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// The executable part of a function; replaced wholesale by a hot-swap.
#[derive(Debug)]
pub struct FunctionBody {
    pub def: Arc<FunctionDef>,
    pub defaults: Vec<Option<Value>>,
    pub revision: u32,
}

pub struct FunctionCell {
    pub id: FunctionId,
    pub name: String,
    pub qualname: String,
    pub module: Arc<ModuleRecord>,
    pub globals: Arc<Scope>,
    /// Enclosing lexical environment, kept across swaps.
    pub scope: Arc<Scope>,
    pub is_method: bool,
    /// Metadata captured from the original definition.
    pub doc: Option<String>,
    pub annotations: Vec<(String, String)>,
    /// Line of the original `def`, used to relocate it in fresh source.
    pub def_line: usize,
    body: RwLock<Arc<FunctionBody>>,
}

impl FunctionCell {
    pub(crate) fn new(
        def: Arc<FunctionDef>,
        defaults: Vec<Option<Value>>,
        qualname: String,
        module: Arc<ModuleRecord>,
        globals: Arc<Scope>,
        scope: Arc<Scope>,
        is_method: bool,
    ) -> Self {
        let mut annotations: Vec<(String, String)> = def
            .params
            .iter()
            .filter_map(|p| p.annotation.as_ref().map(|a| (p.name.clone(), a.text.clone())))
            .collect();
        if let Some(ret) = &def.returns {
            annotations.push(("return".to_string(), ret.text.clone()));
        }
        Self {
            id: FunctionId::next(),
            name: def.name.clone(),
            qualname,
            module,
            globals,
            scope,
            is_method,
            doc: def.docstring.clone(),
            annotations,
            def_line: def.span.start_line,
            body: RwLock::new(Arc::new(FunctionBody {
                def,
                defaults,
                revision: 0,
            })),
        }
    }

    pub fn body(&self) -> Arc<FunctionBody> {
        match self.body.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the executable body; identity, scope and metadata stay.
    pub fn replace_body(&self, def: Arc<FunctionDef>, defaults: Vec<Option<Value>>) -> u32 {
        let mut guard = match self.body.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let revision = guard.revision + 1;
        *guard = Arc::new(FunctionBody {
            def,
            defaults,
            revision,
        });
        revision
    }

    pub fn revision(&self) -> u32 {
        self.body().revision
    }

    pub fn param_count(&self) -> usize {
        self.body().def.params.len()
    }
}

impl fmt::Debug for FunctionCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {} {}>", self.qualname, self.id)
    }
}

pub type NativeFn =
    dyn Fn(&mut Interpreter, Vec<Value>, Vec<(String, Value)>) -> Flow<Value> + Send + Sync;

/// A host-provided callable. Opaque to inspection.
pub struct NativeFunction {
    pub name: String,
    pub func: Box<NativeFn>,
}

impl NativeFunction {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut Interpreter, Vec<Value>, Vec<(String, Value)>) -> Flow<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<built-in function {}>", self.name)
    }
}

/// A transparent wrapper produced by a decorator such as `trace`.
#[derive(Debug)]
pub struct Decorated {
    pub label: String,
    pub inner: Value,
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Value,
}

/// A method of a builtin container (`"abc".upper`, `items.append`).
#[derive(Debug)]
pub struct BuiltinMethod {
    pub receiver: Value,
    pub name: String,
}

// ═══════════════════════════════════════════════════════════════════════════
//  CLASSES AND INSTANCES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct DataclassSpec {
    pub fields: Vec<String>,
    pub frozen: bool,
}

pub struct Class {
    pub name: String,
    pub qualname: String,
    pub base: Option<Arc<Class>>,
    pub attrs: Mutex<HashMap<String, Value>>,
    pub def: Option<Arc<ClassDef>>,
    pub module: Option<Arc<ModuleRecord>>,
    pub builtin: bool,
    dataclass: Mutex<Option<DataclassSpec>>,
}

impl Class {
    pub fn new(
        name: impl Into<String>,
        qualname: impl Into<String>,
        base: Option<Arc<Class>>,
        attrs: HashMap<String, Value>,
        def: Option<Arc<ClassDef>>,
        module: Option<Arc<ModuleRecord>>,
    ) -> Self {
        Self {
            name: name.into(),
            qualname: qualname.into(),
            base,
            attrs: Mutex::new(attrs),
            def,
            module,
            builtin: false,
            dataclass: Mutex::new(None),
        }
    }

    pub fn builtin(name: &str, base: Option<Arc<Class>>) -> Self {
        let mut class = Self::new(name, name, base, HashMap::new(), None, None);
        class.builtin = true;
        class
    }

    /// Walk self then bases for an attribute.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = lock(&self.attrs).get(name) {
            return Some(v.clone());
        }
        self.base.as_ref().and_then(|b| b.lookup(name))
    }

    pub fn is_subclass_of(&self, other: &Class) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        match &self.base {
            Some(base) => base.is_subclass_of(other),
            None => false,
        }
    }

    fn has_builtin_ancestor(&self, name: &str) -> bool {
        if self.builtin && self.name == name {
            return true;
        }
        self.base
            .as_ref()
            .map(|b| b.has_builtin_ancestor(name))
            .unwrap_or(false)
    }

    pub fn is_exception(&self) -> bool {
        self.has_builtin_ancestor("Exception")
    }

    pub fn is_placeholder(&self) -> bool {
        self.has_builtin_ancestor("NotImplementedError")
    }

    pub fn dataclass_spec(&self) -> Option<DataclassSpec> {
        lock(&self.dataclass).clone()
    }

    pub(crate) fn set_dataclass(&self, spec: DataclassSpec) {
        *lock(&self.dataclass) = Some(spec);
    }

    /// Names declared with annotations in the class body, bases first.
    pub fn annotated_fields(&self) -> Vec<String> {
        let mut fields = self
            .base
            .as_ref()
            .map(|b| b.annotated_fields())
            .unwrap_or_default();
        if let Some(def) = &self.def {
            for stmt in &def.body {
                if let StmtKind::AnnAssign {
                    target: Target::Name(name),
                    ..
                } = &stmt.kind
                {
                    if !fields.contains(name) {
                        fields.push(name.clone());
                    }
                }
            }
        }
        fields
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<class '{}'>", self.qualname)
    }
}

pub struct Instance {
    pub class: Arc<Class>,
    pub attrs: Mutex<HashMap<String, Value>>,
}

impl Instance {
    pub fn new(class: Arc<Class>) -> Self {
        Self {
            class,
            attrs: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        lock(&self.attrs).get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        lock(&self.attrs).insert(name.into(), value);
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} object>", self.class.name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  EXCEPTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// One entry of the explicit call-context stack.
#[derive(Debug, Clone)]
pub struct ActiveFrame {
    pub function: Arc<FunctionCell>,
    /// Line currently executing in this frame.
    pub line: usize,
}

pub struct ExceptionValue {
    pub class: Arc<Class>,
    pub args: Vec<Value>,
    /// Root-first frames active at the latest explicit raise.
    trace: Mutex<Vec<ActiveFrame>>,
    handled: AtomicBool,
}

impl ExceptionValue {
    pub fn new(class: Arc<Class>, args: Vec<Value>) -> Self {
        Self {
            class,
            args,
            trace: Mutex::new(Vec::new()),
            handled: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> &str {
        &self.class.name
    }

    pub fn message(&self) -> String {
        match self.args.as_slice() {
            [] => String::new(),
            [single] => single.to_display(),
            many => Value::Tuple(Arc::new(many.to_vec())).repr(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.class.is_placeholder()
    }

    pub fn is_instance_of(&self, class: &Class) -> bool {
        self.class.is_subclass_of(class)
    }

    pub fn trace(&self) -> Vec<ActiveFrame> {
        lock(&self.trace).clone()
    }

    /// Record the raise point; the first raise wins.
    pub(crate) fn record_trace(&self, frames: &[ActiveFrame]) {
        let mut trace = lock(&self.trace);
        if trace.is_empty() {
            *trace = frames.to_vec();
        }
    }

    /// An explicit `raise` of an existing instance: the new raise point
    /// replaces the old one and any earlier claim is released.
    pub(crate) fn rearm(&self, frames: &[ActiveFrame]) {
        *lock(&self.trace) = frames.to_vec();
        self.handled.store(false, Ordering::SeqCst);
    }

    /// Was this raised directly in the given function's own frame?
    pub fn raised_in(&self, cell: &FunctionCell) -> bool {
        lock(&self.trace)
            .last()
            .map(|frame| frame.function.id == cell.id)
            .unwrap_or(false)
    }

    /// Claim the signal for interception; only the first claim succeeds.
    pub fn try_claim(&self) -> bool {
        !self.handled.swap(true, Ordering::SeqCst)
    }

    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ExceptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.class.name, self.message())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  VALUE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Arc<Mutex<Vec<Value>>>),
    Tuple(Arc<Vec<Value>>),
    Dict(Arc<Mutex<Vec<(Value, Value)>>>),
    Set(Arc<Mutex<Vec<Value>>>),
    Function(Arc<FunctionCell>),
    Native(Arc<NativeFunction>),
    Decorated(Arc<Decorated>),
    BoundMethod(Arc<BoundMethod>),
    BuiltinMethod(Arc<BuiltinMethod>),
    Class(Arc<Class>),
    Instance(Arc<Instance>),
    Exception(Arc<ExceptionValue>),
    Slice(Option<i64>, Option<i64>, Option<i64>),
    /// Context manager returned by `not_implemented_handler()`.
    Boundary,
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(Mutex::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Arc::new(items))
    }

    pub fn dict(pairs: Vec<(Value, Value)>) -> Self {
        Value::Dict(Arc::new(Mutex::new(pairs)))
    }

    pub fn set(items: Vec<Value>) -> Self {
        let mut unique: Vec<Value> = Vec::with_capacity(items.len());
        for item in items {
            if !unique.iter().any(|u| u.py_eq(&item)) {
                unique.push(item);
            }
        }
        Value::Set(Arc::new(Mutex::new(unique)))
    }

    pub fn native<F>(name: &str, func: F) -> Self
    where
        F: Fn(&mut Interpreter, Vec<Value>, Vec<(String, Value)>) -> Flow<Value> + Send + Sync + 'static,
    {
        Value::Native(Arc::new(NativeFunction::new(name, func)))
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::None => "NoneType".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::Str(_) => "str".into(),
            Value::List(_) => "list".into(),
            Value::Tuple(_) => "tuple".into(),
            Value::Dict(_) => "dict".into(),
            Value::Set(_) => "set".into(),
            Value::Function(_) | Value::Decorated(_) => "function".into(),
            Value::Native(_) | Value::BuiltinMethod(_) => "builtin_function_or_method".into(),
            Value::BoundMethod(_) => "method".into(),
            Value::Class(_) => "type".into(),
            Value::Instance(i) => i.class.name.clone(),
            Value::Exception(e) => e.class.name.clone(),
            Value::Slice(..) => "slice".into(),
            Value::Boundary => "NotImplementedHandler".into(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) | Value::Set(l) => !lock(l).is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Dict(d) => !lock(d).is_empty(),
            _ => true,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_)
                | Value::Native(_)
                | Value::Decorated(_)
                | Value::BoundMethod(_)
                | Value::BuiltinMethod(_)
                | Value::Class(_)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Same object (Python `is`).
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::List(a), Value::List(b)) | (Value::Set(a), Value::Set(b)) => Arc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Arc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            (Value::Decorated(a), Value::Decorated(b)) => Arc::ptr_eq(a, b),
            (Value::BoundMethod(a), Value::BoundMethod(b)) => Arc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Arc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Arc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
            (Value::Boundary, Value::Boundary) => true,
            _ => false,
        }
    }

    /// Structural equality (Python `==` for builtin types and dataclasses).
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(_) | Value::Bool(_) | Value::Float(_), Value::Int(_) | Value::Bool(_) | Value::Float(_)) => {
                match (self.as_int(), other.as_int()) {
                    (Some(a), Some(b)) => a == b,
                    _ => self.as_float() == other.as_float(),
                }
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (lock(a).clone(), lock(b).clone());
                seq_eq(&a, &b)
            }
            (Value::Tuple(a), Value::Tuple(b)) => seq_eq(a, b),
            (Value::Set(a), Value::Set(b)) => {
                let (a, b) = (lock(a).clone(), lock(b).clone());
                a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| x.py_eq(y)))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                let (a, b) = (lock(a).clone(), lock(b).clone());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        b.iter().any(|(k2, v2)| k.py_eq(k2) && v.py_eq(v2))
                    })
            }
            (Value::Instance(a), Value::Instance(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                match a.class.dataclass_spec() {
                    Some(spec) if Arc::ptr_eq(&a.class, &b.class) => spec.fields.iter().all(|f| {
                        match (a.get(f), b.get(f)) {
                            (Some(x), Some(y)) => x.py_eq(&y),
                            (None, None) => true,
                            _ => false,
                        }
                    }),
                    _ => false,
                }
            }
            _ => self.identical(other),
        }
    }

    /// `str(value)` without user-defined `__str__`.
    pub fn to_display(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(e) => e.message(),
            _ => self.repr(),
        }
    }

    /// `repr(value)` without user-defined `__repr__`.
    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".into(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => quote(s),
            Value::List(l) => {
                let items: Vec<String> = lock(l).iter().map(|v| v.repr()).collect();
                format!("[{}]", items.join(", "))
            }
            Value::Tuple(t) => {
                let items: Vec<String> = t.iter().map(|v| v.repr()).collect();
                if items.len() == 1 {
                    format!("({},)", items[0])
                } else {
                    format!("({})", items.join(", "))
                }
            }
            Value::Set(s) => {
                let items: Vec<String> = lock(s).iter().map(|v| v.repr()).collect();
                if items.is_empty() {
                    "set()".into()
                } else {
                    format!("{{{}}}", items.join(", "))
                }
            }
            Value::Dict(d) => {
                let items: Vec<String> = lock(d)
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .collect();
                format!("{{{}}}", items.join(", "))
            }
            Value::Function(cell) => format!("<function {}>", cell.qualname),
            Value::Native(n) => format!("<built-in function {}>", n.name),
            Value::Decorated(d) => d.inner.repr(),
            Value::BoundMethod(b) => format!("<bound method {}>", b.method.repr()),
            Value::BuiltinMethod(m) => {
                format!("<built-in method {} of {} object>", m.name, m.receiver.type_name())
            }
            Value::Class(c) => format!("<class '{}'>", c.qualname),
            Value::Instance(inst) => match inst.class.dataclass_spec() {
                Some(spec) => {
                    let fields: Vec<String> = spec
                        .fields
                        .iter()
                        .map(|f| {
                            let v = inst.get(f).map(|v| v.repr()).unwrap_or_default();
                            format!("{}={}", f, v)
                        })
                        .collect();
                    format!("{}({})", inst.class.name, fields.join(", "))
                }
                None => format!("<{} object>", inst.class.qualname),
            },
            Value::Exception(e) => {
                let args: Vec<String> = e.args.iter().map(|a| a.repr()).collect();
                format!("{}({})", e.class.name, args.join(", "))
            }
            Value::Slice(a, b, c) => {
                let show = |v: &Option<i64>| v.map(|i| i.to_string()).unwrap_or_else(|| "None".into());
                format!("slice({}, {}, {})", show(a), show(b), show(c))
            }
            Value::Boundary => "<not_implemented_handler>".into(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repr())
    }
}

fn seq_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
}

pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".into()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".into() } else { "-inf".into() }
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

fn quote(s: &str) -> String {
    let delim = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(delim);
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            c if c == delim => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(delim);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repr_matches_python() {
        assert_eq!(Value::Float(14.0).repr(), "14.0");
        assert_eq!(Value::Float(2.5).repr(), "2.5");
        assert_eq!(Value::str("it's").repr(), "\"it's\"");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).repr(), "(1,)");
        assert_eq!(
            Value::list(vec![Value::None, Value::Bool(true), Value::str("a")]).repr(),
            "[None, True, 'a']"
        );
    }

    #[test]
    fn test_numeric_equality_crosses_types() {
        assert!(Value::Int(2).py_eq(&Value::Float(2.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert!(!Value::Int(2).py_eq(&Value::str("2")));
    }

    #[test]
    fn test_set_deduplicates() {
        let set = Value::set(vec![Value::Int(1), Value::Int(1), Value::Int(2)]);
        if let Value::Set(items) = set {
            assert_eq!(lock(&items).len(), 2);
        } else {
            panic!("expected set");
        }
    }

    #[test]
    fn test_class_scope_hidden_from_nested_lookup() {
        let builtins = Scope::builtins();
        builtins.set("len", Value::Int(0));
        let class_scope = Scope::child(&builtins, ScopeKind::Class, "C.".into());
        class_scope.set("x", Value::Int(1));
        let method_scope = Scope::child(&class_scope, ScopeKind::Function, "C.m.<locals>.".into());
        assert!(class_scope.get("x").is_some());
        assert!(method_scope.get("x").is_none());
        assert!(method_scope.get("len").is_some());
        assert_eq!(class_scope.closure_scope().kind, ScopeKind::Builtins);
    }
}
