// Tagged-union runtime value. Grounded on spec.md §3's Value definition and
// on original_source/Loxcpp/Value.cpp (printValue, operator==).

use std::fmt;

use crate::object::{Obj, ObjKind, ObjRef};

#[derive(Clone, Copy)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(ObjRef),
}

impl Value {
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::Obj(o) if matches!(o.as_ref().kind, ObjKind::Str(_)))
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(o) => Some(*o),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Obj(o) => o.as_ref().kind.type_name(),
        }
    }
}

/// Value equality. Numbers/bools/nil compare by content; objects compare by
/// identity — except strings, whose identity equality is sound precisely
/// because every string reaching a `Value` has already been interned.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Obj(x), Value::Obj(y)) => x.ptr_eq(*y),
        _ => false,
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else if n == n.trunc() {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Obj(o) => fmt_obj(*o, f),
        }
    }
}

fn fmt_obj(o: ObjRef, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let obj: &Obj = o.as_ref();
    match &obj.kind {
        ObjKind::Str(s) => write!(f, "{}", s.as_str()),
        ObjKind::Function(func) => match func.name {
            Some(name) => write!(f, "<fn {}>", name.as_string().as_str()),
            None => write!(f, "<script>"),
        },
        ObjKind::Native(n) => write!(f, "<native fn {}>", n.name),
        ObjKind::Upvalue(_) => write!(f, "upvalue"),
        ObjKind::Closure(c) => match c.function.as_function().name {
            Some(name) => write!(f, "<fn {}>", name.as_string().as_str()),
            None => write!(f, "<script>"),
        },
        ObjKind::Class(c) => write!(f, "{}", c.name.as_string().as_str()),
        ObjKind::Instance(i) => write!(f, "{} instance", i.class.as_class().name.as_string().as_str()),
        ObjKind::BoundMethod(b) => write!(f, "{}", b.method),
        ObjKind::Range(r) => write!(f, "{}..{}", format_number(r.lower), format_number(r.upper)),
        ObjKind::List(l) => {
            write!(f, "[")?;
            for (idx, v) in l.items.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", v)?;
            }
            write!(f, "]")
        }
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_obj(*self, f)
    }
}
