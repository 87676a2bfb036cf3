//! Builtin functions, exception classes and container methods

use super::interp::{Flow, Interpreter, Unwind};
use super::ops;
use super::value::*;
use std::cmp::Ordering;
use std::sync::Arc;

type Kwargs = Vec<(String, Value)>;

/// Populate the builtins scope.
pub fn install(scope: &Arc<Scope>) {
    install_classes(scope);

    define(scope, "print", print);
    define(scope, "len", len);
    define(scope, "range", range);
    define(scope, "str", to_str);
    define(scope, "int", to_int);
    define(scope, "float", to_float);
    define(scope, "bool", to_bool);
    define(scope, "abs", abs);
    define(scope, "min", |i, a, k| extreme(i, a, k, "min", Ordering::Less));
    define(scope, "max", |i, a, k| extreme(i, a, k, "max", Ordering::Greater));
    define(scope, "sum", sum);
    define(scope, "round", round);
    define(scope, "repr", repr);
    define(scope, "isinstance", isinstance);
    define(scope, "callable", |i, a, k| {
        let [value] = exact::<1>(i, "callable", a, &k)?;
        Ok(Value::Bool(value.is_callable()))
    });
    define(scope, "list", |i, a, k| {
        let items = optional_iterable(i, "list", a, &k)?;
        Ok(Value::list(items))
    });
    define(scope, "tuple", |i, a, k| {
        let items = optional_iterable(i, "tuple", a, &k)?;
        Ok(Value::tuple(items))
    });
    define(scope, "set", |i, a, k| {
        let items = optional_iterable(i, "set", a, &k)?;
        Ok(Value::set(items))
    });
    define(scope, "dict", dict);
    define(scope, "enumerate", enumerate);
    define(scope, "zip", zip);
    define(scope, "sorted", sorted);
    define(scope, "reversed", |i, a, k| {
        let [value] = exact::<1>(i, "reversed", a, &k)?;
        let mut items = i.iterate(&value)?;
        items.reverse();
        Ok(Value::list(items))
    });
    define(scope, "hasattr", hasattr);
    define(scope, "getattr", getattr);
    define(scope, "type", type_of);
    define(scope, "dataclass", dataclass);
    define(scope, "trace", |i, a, k| {
        let [inner] = exact::<1>(i, "trace", a, &k)?;
        Ok(Value::Decorated(Arc::new(Decorated {
            label: "trace".into(),
            inner,
        })))
    });
    define(scope, "not_implemented_handler", |i, a, k| {
        let [] = exact::<0>(i, "not_implemented_handler", a, &k)?;
        Ok(Value::Boundary)
    });
}

fn define<F>(scope: &Scope, name: &str, func: F)
where
    F: Fn(&mut Interpreter, Vec<Value>, Kwargs) -> Flow<Value> + Send + Sync + 'static,
{
    scope.set(name, Value::native(name, func));
}

fn install_classes(scope: &Scope) {
    scope.set("object", Value::Class(Arc::new(Class::builtin("object", None))));

    let exception = Arc::new(Class::builtin("Exception", None));
    scope.set("Exception", Value::Class(exception.clone()));
    scope.set("BaseException", Value::Class(exception.clone()));

    let derive = |name: &str, base: &Arc<Class>| {
        let class = Arc::new(Class::builtin(name, Some(base.clone())));
        scope.set(name, Value::Class(class.clone()));
        class
    };
    let runtime = derive("RuntimeError", &exception);
    derive("NotImplementedError", &runtime);
    derive("RecursionError", &runtime);
    let arithmetic = derive("ArithmeticError", &exception);
    derive("ZeroDivisionError", &arithmetic);
    derive("OverflowError", &arithmetic);
    let lookup = derive("LookupError", &exception);
    derive("KeyError", &lookup);
    derive("IndexError", &lookup);
    for name in [
        "ValueError",
        "TypeError",
        "AttributeError",
        "NameError",
        "AssertionError",
        "StopIteration",
        "SyntaxError",
    ] {
        derive(name, &exception);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  ARGUMENT HELPERS
// ═══════════════════════════════════════════════════════════════════════════

fn type_error(interp: &Interpreter, message: impl Into<String>) -> Unwind {
    interp.raise_error("TypeError", message)
}

fn no_kwargs(interp: &Interpreter, name: &str, kwargs: &Kwargs) -> Flow<()> {
    match kwargs.first() {
        Some((key, _)) => Err(type_error(
            interp,
            format!("{}() got an unexpected keyword argument '{}'", name, key),
        )),
        None => Ok(()),
    }
}

/// Exactly `N` positional arguments and no keywords.
fn exact<const N: usize>(interp: &Interpreter, name: &str, args: Vec<Value>, kwargs: &Kwargs) -> Flow<[Value; N]> {
    no_kwargs(interp, name, kwargs)?;
    let given = args.len();
    args.try_into().map_err(|_| {
        type_error(
            interp,
            format!(
                "{}() takes exactly {} argument{} ({} given)",
                name,
                N,
                if N == 1 { "" } else { "s" },
                given
            ),
        )
    })
}

fn arity(interp: &Interpreter, name: &str, args: &[Value], min: usize, max: usize) -> Flow<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{} to {}", min, max)
        };
        return Err(type_error(
            interp,
            format!("{}() expected {} arguments, got {}", name, expected, args.len()),
        ));
    }
    Ok(())
}

fn kwarg(kwargs: &Kwargs, name: &str) -> Option<Value> {
    kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
}

fn optional_iterable(interp: &mut Interpreter, name: &str, args: Vec<Value>, kwargs: &Kwargs) -> Flow<Vec<Value>> {
    no_kwargs(interp, name, kwargs)?;
    arity(interp, name, &args, 0, 1)?;
    match args.first() {
        Some(value) => interp.iterate(value),
        None => Ok(Vec::new()),
    }
}

fn int_arg(interp: &Interpreter, value: &Value, what: &str) -> Flow<i64> {
    value.as_int().ok_or_else(|| {
        type_error(
            interp,
            format!("'{}' object cannot be interpreted as an integer ({})", value.type_name(), what),
        )
    })
}

fn str_arg<'a>(interp: &Interpreter, value: &'a Value, method: &str) -> Flow<&'a str> {
    value.as_str().ok_or_else(|| {
        type_error(
            interp,
            format!("{}() argument must be str, not {}", method, value.type_name()),
        )
    })
}

fn order(interp: &Interpreter, a: &Value, b: &Value) -> Flow<Ordering> {
    ops::order(a, b).map_err(|e| interp.op_error(e))
}

/// Stable sort by optional key; comparison failures surface as TypeError.
fn sort_values(interp: &mut Interpreter, items: Vec<Value>, key: Option<Value>, reverse: bool) -> Flow<Vec<Value>> {
    let mut keyed = Vec::with_capacity(items.len());
    for item in items {
        let k = match &key {
            Some(f) if !matches!(f, Value::None) => interp.call_value(f, vec![item.clone()], Vec::new())?,
            _ => item.clone(),
        };
        keyed.push((k, item));
    }
    let mut failure = None;
    keyed.sort_by(|(a, _), (b, _)| {
        let result = if reverse { ops::order(b, a) } else { ops::order(a, b) };
        result.unwrap_or_else(|e| {
            failure.get_or_insert(e);
            Ordering::Equal
        })
    });
    if let Some(err) = failure {
        return Err(interp.op_error(err));
    }
    Ok(keyed.into_iter().map(|(_, v)| v).collect())
}

// ═══════════════════════════════════════════════════════════════════════════
//  FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

fn print(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    let sep = match kwarg(&kwargs, "sep") {
        Some(Value::Str(s)) => s.to_string(),
        _ => " ".to_string(),
    };
    let end = match kwarg(&kwargs, "end") {
        Some(Value::Str(s)) => s.to_string(),
        _ => "\n".to_string(),
    };
    let mut parts = Vec::with_capacity(args.len());
    for arg in &args {
        parts.push(interp.stringify(arg)?);
    }
    interp.write_output(&format!("{}{}", parts.join(&sep), end));
    Ok(Value::None)
}

fn len(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    let [value] = exact::<1>(interp, "len", args, &kwargs)?;
    let n = match &value {
        Value::Str(s) => s.chars().count(),
        Value::List(items) | Value::Set(items) => lock(items).len(),
        Value::Tuple(items) => items.len(),
        Value::Dict(pairs) => lock(pairs).len(),
        Value::Instance(instance) if instance.class.lookup("__len__").is_some() => {
            let method = interp.get_attr(&value, "__len__")?;
            return interp.call_value(&method, Vec::new(), Vec::new());
        }
        other => {
            return Err(type_error(
                interp,
                format!("object of type '{}' has no len()", other.type_name()),
            ))
        }
    };
    Ok(Value::Int(n as i64))
}

fn range(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    no_kwargs(interp, "range", &kwargs)?;
    arity(interp, "range", &args, 1, 3)?;
    let mut bounds = Vec::with_capacity(args.len());
    for arg in &args {
        bounds.push(int_arg(interp, arg, "range")?);
    }
    let (start, stop, step) = match bounds.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => unreachable!("arity checked"),
    };
    if step == 0 {
        return Err(interp.raise_error("ValueError", "range() arg 3 must not be zero"));
    }
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(Value::Int(i));
        i += step;
    }
    Ok(Value::list(out))
}

fn to_str(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    no_kwargs(interp, "str", &kwargs)?;
    arity(interp, "str", &args, 0, 1)?;
    match args.first() {
        Some(value) => Ok(Value::str(interp.stringify(value)?)),
        None => Ok(Value::str("")),
    }
}

fn to_int(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    no_kwargs(interp, "int", &kwargs)?;
    arity(interp, "int", &args, 0, 1)?;
    match args.first() {
        None => Ok(Value::Int(0)),
        Some(Value::Int(i)) => Ok(Value::Int(*i)),
        Some(Value::Bool(b)) => Ok(Value::Int(*b as i64)),
        Some(Value::Float(f)) => {
            if !f.is_finite() {
                return Err(interp.raise_error("OverflowError", "cannot convert float infinity to integer"));
            }
            Ok(Value::Int(f.trunc() as i64))
        }
        Some(Value::Str(s)) => s
            .trim()
            .replace('_', "")
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| {
                interp.raise_error(
                    "ValueError",
                    format!("invalid literal for int() with base 10: {}", Value::Str(s.clone()).repr()),
                )
            }),
        Some(other) => Err(type_error(
            interp,
            format!("int() argument must be a string or a number, not '{}'", other.type_name()),
        )),
    }
}

fn to_float(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    no_kwargs(interp, "float", &kwargs)?;
    arity(interp, "float", &args, 0, 1)?;
    match args.first() {
        None => Ok(Value::Float(0.0)),
        Some(Value::Str(s)) => {
            let text = s.trim().to_ascii_lowercase();
            let parsed = match text.as_str() {
                "inf" | "+inf" | "infinity" => Some(f64::INFINITY),
                "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
                "nan" => Some(f64::NAN),
                other => other.parse::<f64>().ok(),
            };
            parsed.map(Value::Float).ok_or_else(|| {
                interp.raise_error(
                    "ValueError",
                    format!("could not convert string to float: {}", Value::Str(s.clone()).repr()),
                )
            })
        }
        Some(value) => value.as_float().map(Value::Float).ok_or_else(|| {
            type_error(
                interp,
                format!("float() argument must be a string or a number, not '{}'", value.type_name()),
            )
        }),
    }
}

fn to_bool(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    no_kwargs(interp, "bool", &kwargs)?;
    arity(interp, "bool", &args, 0, 1)?;
    Ok(Value::Bool(args.first().map(Value::truthy).unwrap_or(false)))
}

fn abs(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    let [value] = exact::<1>(interp, "abs", args, &kwargs)?;
    match value {
        Value::Int(i) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| interp.raise_error("OverflowError", "integer overflow")),
        Value::Bool(b) => Ok(Value::Int(b as i64)),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(type_error(
            interp,
            format!("bad operand type for abs(): '{}'", other.type_name()),
        )),
    }
}

fn extreme(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs, name: &str, want: Ordering) -> Flow<Value> {
    let key = kwarg(&kwargs, "key").filter(|k| !matches!(k, Value::None));
    let default = kwarg(&kwargs, "default");
    let items = match args.len() {
        0 => return Err(type_error(interp, format!("{} expected at least 1 argument, got 0", name))),
        1 => interp.iterate(&args[0])?,
        _ => args,
    };
    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let k = match &key {
            Some(f) => interp.call_value(f, vec![item.clone()], Vec::new())?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((best_key, _)) => order(interp, &k, best_key)? == want,
        };
        if replace {
            best = Some((k, item));
        }
    }
    match (best, default) {
        (Some((_, v)), _) => Ok(v),
        (None, Some(d)) => Ok(d),
        (None, None) => Err(interp.raise_error(
            "ValueError",
            format!("{}() arg is an empty sequence", name),
        )),
    }
}

fn sum(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    arity(interp, "sum", &args, 1, 2)?;
    let mut total = args
        .get(1)
        .cloned()
        .or_else(|| kwarg(&kwargs, "start"))
        .unwrap_or(Value::Int(0));
    for item in interp.iterate(&args[0])? {
        total = ops::binary(super::ast::BinOp::Add, &total, &item).map_err(|e| interp.op_error(e))?;
    }
    Ok(total)
}

fn round(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    arity(interp, "round", &args, 1, 2)?;
    let digits = match args.get(1).cloned().or_else(|| kwarg(&kwargs, "ndigits")) {
        None | Some(Value::None) => None,
        Some(v) => Some(int_arg(interp, &v, "ndigits")?),
    };
    match (&args[0], digits) {
        (Value::Int(i), _) => Ok(Value::Int(*i)),
        (Value::Bool(b), _) => Ok(Value::Int(*b as i64)),
        (Value::Float(f), None) => Ok(Value::Int(f.round_ties_even() as i64)),
        (Value::Float(f), Some(n)) => {
            let scale = 10f64.powi(n as i32);
            Ok(Value::Float((f * scale).round_ties_even() / scale))
        }
        (other, _) => Err(type_error(
            interp,
            format!("type {} doesn't define __round__ method", other.type_name()),
        )),
    }
}

fn repr(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    let [value] = exact::<1>(interp, "repr", args, &kwargs)?;
    Ok(Value::str(interp.represent(&value)?))
}

/// Does `value` match a builtin type constructor such as `int`?
fn matches_builtin_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "int" => matches!(value, Value::Int(_) | Value::Bool(_)),
        "float" => matches!(value, Value::Float(_)),
        "str" => matches!(value, Value::Str(_)),
        "bool" => matches!(value, Value::Bool(_)),
        "list" => matches!(value, Value::List(_)),
        "dict" => matches!(value, Value::Dict(_)),
        "tuple" => matches!(value, Value::Tuple(_)),
        "set" => matches!(value, Value::Set(_)),
        _ => false,
    }
}

fn instance_of(interp: &Interpreter, value: &Value, class: &Value) -> Flow<bool> {
    match class {
        Value::Native(native) => Ok(matches_builtin_type(value, &native.name)),
        Value::Class(class) => Ok(match value {
            Value::Instance(instance) => instance.class.is_subclass_of(class),
            Value::Exception(exc) => exc.is_instance_of(class),
            _ => class.builtin && class.name == "object",
        }),
        Value::Tuple(options) => {
            for option in options.iter() {
                if instance_of(interp, value, option)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(type_error(
            interp,
            format!("isinstance() arg 2 must be a type or tuple of types, not {}", other.type_name()),
        )),
    }
}

fn isinstance(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    let [value, class] = exact::<2>(interp, "isinstance", args, &kwargs)?;
    Ok(Value::Bool(instance_of(interp, &value, &class)?))
}

fn dict(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    arity(interp, "dict", &args, 0, 1)?;
    let mut pairs: Vec<(Value, Value)> = Vec::new();
    let insert = |pairs: &mut Vec<(Value, Value)>, k: Value, v: Value| match pairs.iter_mut().find(|(e, _)| e.py_eq(&k)) {
        Some(slot) => slot.1 = v,
        None => pairs.push((k, v)),
    };
    if let Some(source) = args.first() {
        match source {
            Value::Dict(existing) => {
                for (k, v) in lock(existing).clone() {
                    insert(&mut pairs, k, v);
                }
            }
            other => {
                for item in interp.iterate(other)? {
                    let entry = interp.iterate(&item)?;
                    let [k, v]: [Value; 2] = entry.try_into().map_err(|_| {
                        interp.raise_error("ValueError", "dictionary update sequence element has wrong length")
                    })?;
                    insert(&mut pairs, k, v);
                }
            }
        }
    }
    for (k, v) in kwargs {
        insert(&mut pairs, Value::str(k), v);
    }
    Ok(Value::dict(pairs))
}

fn enumerate(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    arity(interp, "enumerate", &args, 1, 2)?;
    let start = match args.get(1).cloned().or_else(|| kwarg(&kwargs, "start")) {
        Some(v) => int_arg(interp, &v, "start")?,
        None => 0,
    };
    let items = interp.iterate(&args[0])?;
    Ok(Value::list(
        items
            .into_iter()
            .enumerate()
            .map(|(i, v)| Value::tuple(vec![Value::Int(start + i as i64), v]))
            .collect(),
    ))
}

fn zip(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    no_kwargs(interp, "zip", &kwargs)?;
    let mut columns = Vec::with_capacity(args.len());
    for arg in &args {
        columns.push(interp.iterate(arg)?);
    }
    let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
    Ok(Value::list(
        (0..rows)
            .map(|r| Value::tuple(columns.iter().map(|c| c[r].clone()).collect()))
            .collect(),
    ))
}

fn sorted(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    arity(interp, "sorted", &args, 1, 1)?;
    let items = interp.iterate(&args[0])?;
    let reverse = kwarg(&kwargs, "reverse").map(|v| v.truthy()).unwrap_or(false);
    let sorted = sort_values(interp, items, kwarg(&kwargs, "key"), reverse)?;
    Ok(Value::list(sorted))
}

fn hasattr(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    let [value, name] = exact::<2>(interp, "hasattr", args, &kwargs)?;
    let name = str_arg(interp, &name, "hasattr")?.to_string();
    match interp.get_attr(&value, &name) {
        Ok(_) => Ok(Value::Bool(true)),
        Err(Unwind::Raise(exc)) if exc.kind() == "AttributeError" => Ok(Value::Bool(false)),
        Err(other) => Err(other),
    }
}

fn getattr(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    no_kwargs(interp, "getattr", &kwargs)?;
    arity(interp, "getattr", &args, 2, 3)?;
    let name = str_arg(interp, &args[1], "getattr")?.to_string();
    match interp.get_attr(&args[0], &name) {
        Err(Unwind::Raise(exc)) if exc.kind() == "AttributeError" && args.len() == 3 => Ok(args[2].clone()),
        other => other,
    }
}

fn type_of(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    let [value] = exact::<1>(interp, "type", args, &kwargs)?;
    Ok(match &value {
        Value::Instance(instance) => Value::Class(instance.class.clone()),
        Value::Exception(exc) => Value::Class(exc.class.clone()),
        other => {
            let name = other.type_name();
            interp.builtin(&name).unwrap_or_else(|| Value::str(name))
        }
    })
}

fn dataclass(interp: &mut Interpreter, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    let frozen = kwarg(&kwargs, "frozen").map(|v| v.truthy()).unwrap_or(false);
    match args.into_iter().next() {
        Some(Value::Class(class)) => {
            mark_dataclass(&class, frozen);
            Ok(Value::Class(class))
        }
        Some(other) => Err(type_error(
            interp,
            format!("dataclass() expects a class, not {}", other.type_name()),
        )),
        None => Ok(Value::native("dataclass", move |interp, args, _| match args.first() {
            Some(Value::Class(class)) => {
                mark_dataclass(class, frozen);
                Ok(Value::Class(class.clone()))
            }
            _ => Err(type_error(interp, "dataclass() expects a class")),
        })),
    }
}

fn mark_dataclass(class: &Class, frozen: bool) {
    class.set_dataclass(DataclassSpec {
        fields: class.annotated_fields(),
        frozen,
    });
}

// ═══════════════════════════════════════════════════════════════════════════
//  CONTAINER METHODS
// ═══════════════════════════════════════════════════════════════════════════

const STR_METHODS: &[&str] = &[
    "upper", "lower", "strip", "lstrip", "rstrip", "split", "splitlines", "join", "startswith", "endswith",
    "replace", "find", "index", "count", "isdigit", "isalpha", "isspace", "isalnum", "title", "capitalize",
];
const LIST_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "remove", "index", "count", "copy", "clear", "reverse", "sort",
];
const DICT_METHODS: &[&str] = &["get", "keys", "values", "items", "pop", "setdefault", "update", "copy", "clear"];
const SET_METHODS: &[&str] = &["add", "discard", "remove", "copy", "clear"];
const TUPLE_METHODS: &[&str] = &["index", "count"];

pub fn has_method(receiver: &Value, name: &str) -> bool {
    let table = match receiver {
        Value::Str(_) => STR_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Set(_) => SET_METHODS,
        Value::Tuple(_) => TUPLE_METHODS,
        _ => return false,
    };
    table.contains(&name)
}

pub fn call_method(interp: &mut Interpreter, receiver: &Value, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    match receiver {
        Value::Str(s) => str_method(interp, s, name, args, kwargs),
        Value::List(items) => list_method(interp, items, name, args, kwargs),
        Value::Dict(pairs) => dict_method(interp, pairs, name, args, kwargs),
        Value::Set(items) => set_method(interp, items, name, args, kwargs),
        Value::Tuple(items) => sequence_query(interp, items, "tuple", name, args),
        other => Err(interp.raise_error(
            "AttributeError",
            format!("'{}' object has no attribute '{}'", other.type_name(), name),
        )),
    }
}

fn str_method(interp: &mut Interpreter, s: &str, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Flow<Value> {
    let method = format!("str.{}", name);
    let strip_chars = |args: &[Value]| -> Option<Vec<char>> {
        args.first().and_then(|v| v.as_str()).map(|c| c.chars().collect())
    };
    let value = match name {
        "upper" => Value::str(s.to_uppercase()),
        "lower" => Value::str(s.to_lowercase()),
        "title" => Value::str(
            s.split(' ')
                .map(|w| {
                    let mut chars = w.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                        None => String::new(),
                    }
                })
                .collect::<Vec<String>>()
                .join(" "),
        ),
        "capitalize" => {
            let mut chars = s.chars();
            Value::str(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            })
        }
        "strip" | "lstrip" | "rstrip" => {
            let chars = strip_chars(&args);
            let matcher = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            Value::str(match name {
                "strip" => s.trim_matches(matcher),
                "lstrip" => s.trim_start_matches(matcher),
                _ => s.trim_end_matches(matcher),
            })
        }
        "split" => {
            let sep = args.first().cloned().or_else(|| kwarg(&kwargs, "sep"));
            let parts: Vec<Value> = match sep {
                None | Some(Value::None) => s.split_whitespace().map(Value::str).collect(),
                Some(sep) => {
                    let sep = str_arg(interp, &sep, &method)?;
                    if sep.is_empty() {
                        return Err(interp.raise_error("ValueError", "empty separator"));
                    }
                    s.split(sep).map(Value::str).collect()
                }
            };
            Value::list(parts)
        }
        "splitlines" => Value::list(s.lines().map(Value::str).collect()),
        "join" => {
            arity(interp, &method, &args, 1, 1)?;
            let mut parts = Vec::new();
            for item in interp.iterate(&args[0])? {
                match item {
                    Value::Str(part) => parts.push(part.to_string()),
                    other => {
                        return Err(type_error(
                            interp,
                            format!("sequence item {}: expected str instance, {} found", parts.len(), other.type_name()),
                        ))
                    }
                }
            }
            Value::str(parts.join(s))
        }
        "startswith" | "endswith" => {
            arity(interp, &method, &args, 1, 1)?;
            let candidates: Vec<Value> = match &args[0] {
                Value::Tuple(options) => options.to_vec(),
                other => vec![other.clone()],
            };
            let mut hit = false;
            for candidate in &candidates {
                let affix = str_arg(interp, candidate, &method)?;
                hit |= if name == "startswith" { s.starts_with(affix) } else { s.ends_with(affix) };
            }
            Value::Bool(hit)
        }
        "replace" => {
            arity(interp, &method, &args, 2, 2)?;
            let from = str_arg(interp, &args[0], &method)?;
            let to = str_arg(interp, &args[1], &method)?;
            Value::str(s.replace(from, to))
        }
        "find" | "index" => {
            arity(interp, &method, &args, 1, 1)?;
            let needle = str_arg(interp, &args[0], &method)?;
            match s.find(needle) {
                Some(byte) => Value::Int(s[..byte].chars().count() as i64),
                None if name == "find" => Value::Int(-1),
                None => return Err(interp.raise_error("ValueError", "substring not found")),
            }
        }
        "count" => {
            arity(interp, &method, &args, 1, 1)?;
            let needle = str_arg(interp, &args[0], &method)?;
            let n = if needle.is_empty() { s.chars().count() + 1 } else { s.matches(needle).count() };
            Value::Int(n as i64)
        }
        "isdigit" => Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())),
        "isalpha" => Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic)),
        "isspace" => Value::Bool(!s.is_empty() && s.chars().all(char::is_whitespace)),
        "isalnum" => Value::Bool(!s.is_empty() && s.chars().all(char::is_alphanumeric)),
        _ => {
            return Err(interp.raise_error(
                "AttributeError",
                format!("'str' object has no attribute '{}'", name),
            ))
        }
    };
    Ok(value)
}

fn sequence_query(interp: &mut Interpreter, items: &[Value], kind: &str, name: &str, args: Vec<Value>) -> Flow<Value> {
    arity(interp, &format!("{}.{}", kind, name), &args, 1, 1)?;
    match name {
        "count" => Ok(Value::Int(items.iter().filter(|v| v.py_eq(&args[0])).count() as i64)),
        "index" => match items.iter().position(|v| v.py_eq(&args[0])) {
            Some(i) => Ok(Value::Int(i as i64)),
            None => Err(interp.raise_error(
                "ValueError",
                format!("{} is not in {}", args[0].repr(), kind),
            )),
        },
        _ => Err(interp.raise_error(
            "AttributeError",
            format!("'{}' object has no attribute '{}'", kind, name),
        )),
    }
}

fn list_method(
    interp: &mut Interpreter,
    items: &Arc<std::sync::Mutex<Vec<Value>>>,
    name: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Flow<Value> {
    let method = format!("list.{}", name);
    match name {
        "append" => {
            let [value] = exact::<1>(interp, &method, args, &kwargs)?;
            lock(items).push(value);
        }
        "extend" => {
            let [other] = exact::<1>(interp, &method, args, &kwargs)?;
            let extra = interp.iterate(&other)?;
            lock(items).extend(extra);
        }
        "insert" => {
            let [index, value] = exact::<2>(interp, &method, args, &kwargs)?;
            let index = int_arg(interp, &index, &method)?;
            let mut guard = lock(items);
            let len = guard.len() as i64;
            let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
            guard.insert(at as usize, value);
        }
        "pop" => {
            arity(interp, &method, &args, 0, 1)?;
            let index = match args.first() {
                Some(v) => int_arg(interp, v, &method)?,
                None => -1,
            };
            let mut guard = lock(items);
            let len = guard.len() as i64;
            let at = if index < 0 { index + len } else { index };
            if guard.is_empty() || at < 0 || at >= len {
                let message = if guard.is_empty() { "pop from empty list" } else { "pop index out of range" };
                drop(guard);
                return Err(interp.raise_error("IndexError", message));
            }
            return Ok(guard.remove(at as usize));
        }
        "remove" => {
            let [value] = exact::<1>(interp, &method, args, &kwargs)?;
            let mut guard = lock(items);
            match guard.iter().position(|v| v.py_eq(&value)) {
                Some(i) => {
                    guard.remove(i);
                }
                None => {
                    drop(guard);
                    return Err(interp.raise_error("ValueError", "list.remove(x): x not in list"));
                }
            }
        }
        "index" | "count" => {
            no_kwargs(interp, &method, &kwargs)?;
            let snapshot = lock(items).clone();
            return sequence_query(interp, &snapshot, "list", name, args);
        }
        "copy" => return Ok(Value::list(lock(items).clone())),
        "clear" => lock(items).clear(),
        "reverse" => lock(items).reverse(),
        "sort" => {
            arity(interp, &method, &args, 0, 0)?;
            let snapshot = lock(items).clone();
            let reverse = kwarg(&kwargs, "reverse").map(|v| v.truthy()).unwrap_or(false);
            let sorted = sort_values(interp, snapshot, kwarg(&kwargs, "key"), reverse)?;
            *lock(items) = sorted;
        }
        _ => {
            return Err(interp.raise_error(
                "AttributeError",
                format!("'list' object has no attribute '{}'", name),
            ))
        }
    }
    Ok(Value::None)
}

fn dict_method(
    interp: &mut Interpreter,
    pairs: &Arc<std::sync::Mutex<Vec<(Value, Value)>>>,
    name: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Flow<Value> {
    let method = format!("dict.{}", name);
    let find = |key: &Value| lock(pairs).iter().find(|(k, _)| k.py_eq(key)).map(|(_, v)| v.clone());
    match name {
        "get" => {
            no_kwargs(interp, &method, &kwargs)?;
            arity(interp, &method, &args, 1, 2)?;
            Ok(find(&args[0]).unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
        }
        "keys" => Ok(Value::list(lock(pairs).iter().map(|(k, _)| k.clone()).collect())),
        "values" => Ok(Value::list(lock(pairs).iter().map(|(_, v)| v.clone()).collect())),
        "items" => Ok(Value::list(
            lock(pairs)
                .iter()
                .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
                .collect(),
        )),
        "pop" => {
            no_kwargs(interp, &method, &kwargs)?;
            arity(interp, &method, &args, 1, 2)?;
            let removed = {
                let mut guard = lock(pairs);
                guard
                    .iter()
                    .position(|(k, _)| k.py_eq(&args[0]))
                    .map(|i| guard.remove(i).1)
            };
            match (removed, args.get(1)) {
                (Some(v), _) => Ok(v),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(interp.raise_error("KeyError", args[0].repr())),
            }
        }
        "setdefault" => {
            no_kwargs(interp, &method, &kwargs)?;
            arity(interp, &method, &args, 1, 2)?;
            if let Some(existing) = find(&args[0]) {
                return Ok(existing);
            }
            let value = args.get(1).cloned().unwrap_or(Value::None);
            lock(pairs).push((args[0].clone(), value.clone()));
            Ok(value)
        }
        "update" => {
            arity(interp, &method, &args, 0, 1)?;
            let mut incoming: Vec<(Value, Value)> = match args.first() {
                Some(Value::Dict(other)) => lock(other).clone(),
                Some(other) => {
                    return Err(type_error(
                        interp,
                        format!("'{}' object is not a mapping", other.type_name()),
                    ))
                }
                None => Vec::new(),
            };
            incoming.extend(kwargs.into_iter().map(|(k, v)| (Value::str(k), v)));
            let mut guard = lock(pairs);
            for (k, v) in incoming {
                match guard.iter_mut().find(|(e, _)| e.py_eq(&k)) {
                    Some(slot) => slot.1 = v,
                    None => guard.push((k, v)),
                }
            }
            Ok(Value::None)
        }
        "copy" => Ok(Value::dict(lock(pairs).clone())),
        "clear" => {
            lock(pairs).clear();
            Ok(Value::None)
        }
        _ => Err(interp.raise_error(
            "AttributeError",
            format!("'dict' object has no attribute '{}'", name),
        )),
    }
}

fn set_method(
    interp: &mut Interpreter,
    items: &Arc<std::sync::Mutex<Vec<Value>>>,
    name: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Flow<Value> {
    let method = format!("set.{}", name);
    match name {
        "add" => {
            let [value] = exact::<1>(interp, &method, args, &kwargs)?;
            let mut guard = lock(items);
            if !guard.iter().any(|v| v.py_eq(&value)) {
                guard.push(value);
            }
        }
        "discard" | "remove" => {
            let [value] = exact::<1>(interp, &method, args, &kwargs)?;
            let mut guard = lock(items);
            match guard.iter().position(|v| v.py_eq(&value)) {
                Some(i) => {
                    guard.remove(i);
                }
                None if name == "remove" => {
                    drop(guard);
                    return Err(interp.raise_error("KeyError", value.repr()));
                }
                None => {}
            }
        }
        "copy" => return Ok(Value::set(lock(items).clone())),
        "clear" => lock(items).clear(),
        _ => {
            return Err(interp.raise_error(
                "AttributeError",
                format!("'set' object has no attribute '{}'", name),
            ))
        }
    }
    Ok(Value::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::interp::OutputSink;

    fn eval(body: &str) -> Value {
        let src = format!("def go():\n    return {}\n", body);
        let mut interp = Interpreter::new().with_output(OutputSink::buffer());
        let module = interp.load_source("t", &src).unwrap();
        let go = module.get("go").unwrap();
        interp.call(&go, vec![]).unwrap()
    }

    #[test]
    fn test_sorted_with_key_and_reverse() {
        let v = eval("sorted(['bb', 'a', 'ccc'], key=len, reverse=True)");
        assert_eq!(v.repr(), "['ccc', 'bb', 'a']");
    }

    #[test]
    fn test_round_uses_bankers_rounding() {
        assert_eq!(eval("round(2.5)").repr(), "2");
        assert_eq!(eval("round(3.14159, 2)").repr(), "3.14");
    }

    #[test]
    fn test_string_methods() {
        assert_eq!(eval("'a,b,,c'.split(',')").repr(), "['a', 'b', '', 'c']");
        assert_eq!(eval("'-'.join(['x', 'y'])").repr(), "'x-y'");
        assert_eq!(eval("'  hi  '.strip().upper()").repr(), "'HI'");
        assert_eq!(eval("'hello'.find('l')").repr(), "2");
    }

    #[test]
    fn test_isinstance_builtin_types() {
        assert!(eval("isinstance(True, int)").truthy());
        assert!(!eval("isinstance(1.0, int)").truthy());
        assert!(eval("isinstance('x', (int, str))").truthy());
    }

    #[test]
    fn test_dict_helpers() {
        assert_eq!(eval("dict(a=1).get('b', 7)").repr(), "7");
        assert_eq!(eval("list(enumerate(['x'], 1))").repr(), "[(1, 'x')]");
        assert_eq!(eval("max([3, 9, 2])").repr(), "9");
        assert_eq!(eval("sum([1, 2, 3], 10)").repr(), "16");
    }

    #[test]
    fn test_placeholder_class_hierarchy() {
        let scope = Scope::builtins();
        install(&scope);
        let Some(Value::Class(placeholder)) = scope.get_local("NotImplementedError") else {
            panic!("missing NotImplementedError");
        };
        let Some(Value::Class(runtime)) = scope.get_local("RuntimeError") else {
            panic!("missing RuntimeError");
        };
        assert!(placeholder.is_placeholder());
        assert!(placeholder.is_exception());
        assert!(placeholder.is_subclass_of(&runtime));
        assert!(!runtime.is_placeholder());
    }
}
