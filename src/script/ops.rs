//! Operator semantics for builtin values

use super::ast::{BinOp, CmpOp, UnaryOp};
use super::value::{lock, Value};
use std::cmp::Ordering;

/// A failed operation, named by the exception kind it raises.
#[derive(Debug, Clone, PartialEq)]
pub struct OpError {
    pub kind: &'static str,
    pub message: String,
}

impl OpError {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }
}

pub type OpResult<T> = std::result::Result<T, OpError>;

fn unsupported(op: &str, left: &Value, right: &Value) -> OpError {
    OpError::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        left.type_name(),
        right.type_name()
    ))
}

fn overflow() -> OpError {
    OpError::new("OverflowError", "integer result out of range")
}

/// `None` when the quotient does not fit (`i64::MIN // -1`).
fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

fn py_mod(a: i64, b: i64) -> i64 {
    // Only `i64::MIN % -1` overflows, and its remainder is 0.
    let r = a.checked_rem(b).unwrap_or(0);
    if r != 0 && ((r < 0) != (b < 0)) {
        r + b
    } else {
        r
    }
}

fn repeat(items: &[Value], times: i64) -> Vec<Value> {
    let mut out = Vec::new();
    for _ in 0..times.max(0) {
        out.extend(items.iter().cloned());
    }
    out
}

pub fn binary(op: BinOp, left: &Value, right: &Value) -> OpResult<Value> {
    use Value::*;
    let symbol = op.symbol();
    match (left, right) {
        (Int(_) | Bool(_), Int(_) | Bool(_)) => {
            let (a, b) = match (left.as_int(), right.as_int()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(unsupported(symbol, left, right)),
            };
            int_binary(op, a, b)
        }
        (Int(_) | Bool(_) | Float(_), Int(_) | Bool(_) | Float(_)) => {
            let (a, b) = match (left.as_float(), right.as_float()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(unsupported(symbol, left, right)),
            };
            float_binary(op, a, b)
        }
        (Str(a), Str(b)) if op == BinOp::Add => Ok(Value::str(format!("{}{}", a, b))),
        (Str(s), Int(n)) | (Int(n), Str(s)) if op == BinOp::Mul => {
            Ok(Value::str(s.repeat((*n).max(0) as usize)))
        }
        (Str(s), other) if op == BinOp::Mod => Ok(Value::str(percent_format(s, other))),
        (List(a), List(b)) if op == BinOp::Add => {
            let mut items = lock(a).clone();
            items.extend(lock(b).iter().cloned());
            Ok(Value::list(items))
        }
        (List(l), Int(n)) | (Int(n), List(l)) if op == BinOp::Mul => {
            let items = lock(l).clone();
            Ok(Value::list(repeat(&items, *n)))
        }
        (Tuple(a), Tuple(b)) if op == BinOp::Add => {
            let mut items = a.to_vec();
            items.extend(b.iter().cloned());
            Ok(Value::tuple(items))
        }
        (Tuple(t), Int(n)) | (Int(n), Tuple(t)) if op == BinOp::Mul => Ok(Value::tuple(repeat(t, *n))),
        (Set(a), Set(b)) => {
            let (a, b) = (lock(a).clone(), lock(b).clone());
            let items: Vec<Value> = match op {
                BinOp::BitOr => a.iter().chain(b.iter()).cloned().collect(),
                BinOp::BitAnd => a.into_iter().filter(|x| b.iter().any(|y| x.py_eq(y))).collect(),
                BinOp::Sub => a.into_iter().filter(|x| !b.iter().any(|y| x.py_eq(y))).collect(),
                _ => return Err(unsupported(symbol, left, right)),
            };
            Ok(Value::set(items))
        }
        _ => Err(unsupported(symbol, left, right)),
    }
}

fn int_binary(op: BinOp, a: i64, b: i64) -> OpResult<Value> {
    let zero = || OpError::new("ZeroDivisionError", "integer division or modulo by zero");
    let v = match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinOp::Div => {
            if b == 0 {
                return Err(OpError::new("ZeroDivisionError", "division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(zero());
            }
            floor_div(a, b).ok_or_else(overflow)?
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(zero());
            }
            py_mod(a, b)
        }
        BinOp::Pow => {
            if b < 0 {
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            let exp = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exp).ok_or_else(overflow)?
        }
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
        BinOp::Shl => {
            let shift = u32::try_from(b).map_err(|_| OpError::new("ValueError", "negative shift count"))?;
            a.checked_shl(shift).ok_or_else(overflow)?
        }
        BinOp::Shr => {
            let shift = u32::try_from(b).map_err(|_| OpError::new("ValueError", "negative shift count"))?;
            a >> shift.min(63)
        }
    };
    Ok(Value::Int(v))
}

fn float_binary(op: BinOp, a: f64, b: f64) -> OpResult<Value> {
    let zero = || OpError::new("ZeroDivisionError", "float division by zero");
    let v = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(zero());
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(zero());
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(OpError::new("ZeroDivisionError", "float modulo"));
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                r + b
            } else {
                r
            }
        }
        BinOp::Pow => a.powf(b),
        _ => {
            return Err(OpError::type_error(format!(
                "unsupported operand type(s) for {}: 'float' and 'float'",
                op.symbol()
            )))
        }
    };
    Ok(Value::Float(v))
}

/// Minimal `%s`/`%d`/`%r` formatting for `"..." % value`.
fn percent_format(template: &str, args: &Value) -> String {
    let values: Vec<Value> = match args {
        Value::Tuple(items) => items.to_vec(),
        other => vec![other.clone()],
    };
    let mut out = String::new();
    let mut next = values.into_iter();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('r') => out.push_str(&next.next().map(|v| v.repr()).unwrap_or_default()),
            Some(_) => out.push_str(&next.next().map(|v| v.to_display()).unwrap_or_default()),
            None => out.push('%'),
        }
    }
    out
}

pub fn unary(op: UnaryOp, operand: &Value) -> OpResult<Value> {
    match (op, operand) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, v) => match v.as_int() {
            Some(i) => Ok(Value::Int(i.checked_neg().ok_or_else(overflow)?)),
            None => Err(OpError::type_error(format!("bad operand type for unary -: '{}'", v.type_name()))),
        },
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (UnaryOp::Pos, v) => match v.as_int() {
            Some(i) => Ok(Value::Int(i)),
            None => Err(OpError::type_error(format!("bad operand type for unary +: '{}'", v.type_name()))),
        },
        (UnaryOp::Invert, v) => match v.as_int() {
            Some(i) => Ok(Value::Int(!i)),
            None => Err(OpError::type_error(format!("bad operand type for unary ~: '{}'", v.type_name()))),
        },
    }
}

/// Total order used by `<`, `sorted`, `min` and `max`.
pub fn order(left: &Value, right: &Value) -> OpResult<Ordering> {
    use Value::*;
    match (left, right) {
        (Int(_) | Bool(_), Int(_) | Bool(_)) => match (left.as_int(), right.as_int()) {
            (Some(a), Some(b)) => Ok(a.cmp(&b)),
            _ => Err(not_orderable(left, right)),
        },
        (Int(_) | Bool(_) | Float(_), Int(_) | Bool(_) | Float(_)) => {
            match (left.as_float(), right.as_float()) {
                (Some(a), Some(b)) => a.partial_cmp(&b).ok_or_else(|| not_orderable(left, right)),
                _ => Err(not_orderable(left, right)),
            }
        }
        (Str(a), Str(b)) => Ok(a.cmp(b)),
        (List(a), List(b)) => {
            let (a, b) = (lock(a).clone(), lock(b).clone());
            order_seq(&a, &b)
        }
        (Tuple(a), Tuple(b)) => order_seq(a, b),
        _ => Err(not_orderable(left, right)),
    }
}

fn order_seq(a: &[Value], b: &[Value]) -> OpResult<Ordering> {
    for (x, y) in a.iter().zip(b) {
        if x.py_eq(y) {
            continue;
        }
        return order(x, y);
    }
    Ok(a.len().cmp(&b.len()))
}

fn not_orderable(left: &Value, right: &Value) -> OpError {
    OpError::type_error(format!(
        "'<' not supported between instances of '{}' and '{}'",
        left.type_name(),
        right.type_name()
    ))
}

pub fn contains(container: &Value, item: &Value) -> OpResult<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(needle.as_ref())),
            other => Err(OpError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) | Value::Set(items) => Ok(lock(items).iter().any(|v| v.py_eq(item))),
        Value::Tuple(items) => Ok(items.iter().any(|v| v.py_eq(item))),
        Value::Dict(pairs) => Ok(lock(pairs).iter().any(|(k, _)| k.py_eq(item))),
        other => Err(OpError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

pub fn compare(op: CmpOp, left: &Value, right: &Value) -> OpResult<bool> {
    Ok(match op {
        CmpOp::Eq => left.py_eq(right),
        CmpOp::NotEq => !left.py_eq(right),
        CmpOp::Lt => order(left, right)? == Ordering::Less,
        CmpOp::LtE => order(left, right)? != Ordering::Greater,
        CmpOp::Gt => order(left, right)? == Ordering::Greater,
        CmpOp::GtE => order(left, right)? != Ordering::Less,
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
        CmpOp::Is => left.identical(right),
        CmpOp::IsNot => !left.identical(right),
    })
}

/// Apply an f-string format spec (`[[fill]align][sign][,][width][.precision][type]`).
pub fn format_with_spec(value: &Value, rendered: String, spec: &str) -> OpResult<String> {
    if spec.is_empty() {
        return Ok(rendered);
    }
    let mut chars: Vec<char> = spec.chars().collect();
    let mut fill = ' ';
    let mut align = None;
    if chars.len() >= 2 && matches!(chars[1], '<' | '>' | '^') {
        fill = chars[0];
        align = Some(chars[1]);
        chars.drain(..2);
    } else if !chars.is_empty() && matches!(chars[0], '<' | '>' | '^') {
        align = Some(chars[0]);
        chars.remove(0);
    }
    let mut sign_plus = false;
    if chars.first() == Some(&'+') {
        sign_plus = true;
        chars.remove(0);
    }
    let rest: String = chars.into_iter().collect();
    let (width_part, precision, kind) = split_spec(&rest);
    let grouping = width_part.contains(',');
    let width_digits = width_part.trim_matches(',');
    if width_digits.starts_with('0') && align.is_none() {
        fill = '0';
        align = Some('>');
    }
    let width: usize = width_digits.parse().unwrap_or(0);

    let mut body = match kind {
        Some('f') | Some('%') => {
            let mut f = value
                .as_float()
                .ok_or_else(|| OpError::new("ValueError", format!("Unknown format code 'f' for object of type '{}'", value.type_name())))?;
            if kind == Some('%') {
                f *= 100.0;
            }
            let text = format!("{:.*}", precision.unwrap_or(6), f);
            if kind == Some('%') {
                format!("{}%", text)
            } else {
                text
            }
        }
        Some('d') => match value.as_int() {
            Some(i) => i.to_string(),
            None => {
                return Err(OpError::new(
                    "ValueError",
                    format!("Unknown format code 'd' for object of type '{}'", value.type_name()),
                ))
            }
        },
        Some('e') => format!("{:.*e}", precision.unwrap_or(6), value.as_float().unwrap_or(0.0)),
        _ => match (precision, value) {
            (Some(p), Value::Float(f)) => format!("{:.*}", p, f),
            (Some(p), Value::Str(s)) => s.chars().take(p).collect(),
            _ => rendered,
        },
    };
    if grouping {
        body = group_thousands(&body);
    }
    if sign_plus && value.as_float().map(|f| f >= 0.0).unwrap_or(false) {
        body = format!("+{}", body);
    }
    let len = body.chars().count();
    if len >= width {
        return Ok(body);
    }
    let pad = width - len;
    let numeric = matches!(value, Value::Int(_) | Value::Float(_));
    let padded = match align.unwrap_or(if numeric { '>' } else { '<' }) {
        '>' => format!("{}{}", fill.to_string().repeat(pad), body),
        '^' => {
            let left = pad / 2;
            format!("{}{}{}", fill.to_string().repeat(left), body, fill.to_string().repeat(pad - left))
        }
        _ => format!("{}{}", body, fill.to_string().repeat(pad)),
    };
    Ok(padded)
}

fn split_spec(spec: &str) -> (&str, Option<usize>, Option<char>) {
    let (spec, kind) = match spec.chars().last() {
        Some(c) if c.is_ascii_alphabetic() || c == '%' => (&spec[..spec.len() - c.len_utf8()], Some(c)),
        _ => (spec, None),
    };
    match spec.split_once('.') {
        Some((width, precision)) => (width, precision.parse().ok(), kind),
        None => (spec, None, kind),
    }
}

fn group_thousands(number: &str) -> String {
    let (sign, digits) = match number.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", number),
    };
    let (int_part, frac) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };
    let mut grouped = String::new();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    match frac {
        Some(f) => format!("{}{}.{}", sign, grouped, f),
        None => format!("{}{}", sign, grouped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_division_and_modulo_follow_python_signs() {
        assert_eq!(binary(BinOp::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap().as_int(), Some(-4));
        assert_eq!(binary(BinOp::Mod, &Value::Int(-7), &Value::Int(2)).unwrap().as_int(), Some(1));
        assert_eq!(binary(BinOp::Mod, &Value::Int(7), &Value::Int(-2)).unwrap().as_int(), Some(-1));
    }

    #[test]
    fn test_min_int_division_by_minus_one() {
        let err = binary(BinOp::FloorDiv, &Value::Int(i64::MIN), &Value::Int(-1)).unwrap_err();
        assert_eq!(err.kind, "OverflowError");
        assert_eq!(binary(BinOp::Mod, &Value::Int(i64::MIN), &Value::Int(-1)).unwrap().as_int(), Some(0));
    }

    #[test]
    fn test_true_division_yields_float() {
        let v = binary(BinOp::Div, &Value::Int(4), &Value::Int(2)).unwrap();
        assert!(matches!(v, Value::Float(f) if f == 2.0));
    }

    #[test]
    fn test_division_by_zero_kind() {
        let err = binary(BinOp::Div, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.kind, "ZeroDivisionError");
    }

    #[test]
    fn test_mixed_types_are_rejected() {
        let err = binary(BinOp::Add, &Value::Int(1), &Value::str("a")).unwrap_err();
        assert_eq!(err.kind, "TypeError");
        assert!(err.message.contains("'int' and 'str'"));
    }

    #[test]
    fn test_format_spec() {
        let f = Value::Float(3.14159);
        assert_eq!(format_with_spec(&f, "3.14159".into(), ".2f").unwrap(), "3.14");
        assert_eq!(format_with_spec(&Value::Int(42), "42".into(), ">5").unwrap(), "   42");
        assert_eq!(format_with_spec(&Value::Int(7), "7".into(), "03d").unwrap(), "007");
        assert_eq!(format_with_spec(&Value::Int(1234567), "1234567".into(), ",").unwrap(), "1,234,567");
        assert_eq!(format_with_spec(&Value::str("ab"), "ab".into(), "*^6").unwrap(), "**ab**");
    }

    #[test]
    fn test_chained_sequence_order() {
        let a = Value::tuple(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::tuple(vec![Value::Int(1), Value::Int(3)]);
        assert!(compare(CmpOp::Lt, &a, &b).unwrap());
        assert!(compare(CmpOp::In, &Value::Int(2), &a).unwrap());
    }
}
