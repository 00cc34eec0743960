// Heap object model. Grounded on original_source/Loxcpp/Object.h (a common
// Obj header carrying a type tag and GC mark bit, ObjString owning its bytes
// and a cached FNV-1a hash) extended with the Function/Native/Upvalue/
// Closure/Class/Instance/BoundMethod/Range/List variants spec.md names.
//
// Objects are allocated once on the Heap (see heap.rs) and never moved; an
// `ObjRef` is a bare non-owning pointer to one, copied freely the way a
// garbage-collected reference is in the source material this crate follows.
// Rust's borrow checker cannot see the GC's liveness guarantee, so `ObjRef`
// derefs are unsafe at the point of use and this crate confines that
// unsafety to heap.rs/vm.rs/compiler.rs call sites that know an object is
// reachable from a root.

use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

pub const FNV_OFFSET_BASIS: u32 = 2166136261;
pub const FNV_PRIME: u32 = 16777619;

pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub struct ObjString {
    pub bytes: Vec<u8>,
    pub hash: u32,
}

impl ObjString {
    pub fn new(bytes: Vec<u8>) -> Self {
        let hash = hash_bytes(&bytes);
        ObjString { bytes, hash }
    }

    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<ObjRef>, // ObjRef to ObjString, None for the top-level script
}

pub type NativeFn = fn(vm: &mut crate::vm::VM, args: &[Value]) -> Result<Value, String>;

pub struct ObjNative {
    pub name: &'static str,
    pub arity: Option<u8>, // None = variadic
    pub function: NativeFn,
    /// Method-style natives are invoked with the receiver prepended to `args`.
    pub is_method: bool,
}

pub struct ObjUpvalue {
    /// While open, points at a live VM stack slot. `closed` holds the hoisted
    /// value once the frame that owned the slot has returned.
    pub location: *mut Value,
    pub closed: Value,
    pub is_closed: bool,
    pub next_open: Option<ObjRef>,
}

pub struct ObjClosure {
    pub function: ObjRef, // ObjFunction
    pub upvalues: Vec<ObjRef>, // ObjUpvalue
}

pub struct ObjClass {
    pub name: ObjRef, // ObjString
    pub methods: Table,
    pub initializer: Value,
}

pub struct ObjInstance {
    pub class: ObjRef, // ObjClass
    pub fields: Table,
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef, // ObjClosure or ObjNative
}

pub struct ObjRange {
    pub lower: f64,
    pub upper: f64,
}

impl ObjRange {
    pub fn contains(&self, n: f64) -> bool {
        if self.lower <= self.upper {
            n >= self.lower && n <= self.upper
        } else {
            n >= self.upper && n <= self.lower
        }
    }

    pub fn len(&self) -> usize {
        (self.upper - self.lower).abs() as usize + 1
    }
}

pub struct ObjList {
    pub items: Vec<Value>,
}

pub enum ObjKind {
    Str(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Upvalue(ObjUpvalue),
    Closure(ObjClosure),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Range(ObjRange),
    List(ObjList),
}

impl ObjKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjKind::Str(_) => "string",
            ObjKind::Function(_) => "function",
            ObjKind::Native(_) => "native function",
            ObjKind::Upvalue(_) => "upvalue",
            ObjKind::Closure(_) => "function",
            ObjKind::Class(_) => "class",
            ObjKind::Instance(_) => "instance",
            ObjKind::BoundMethod(_) => "bound method",
            ObjKind::Range(_) => "range",
            ObjKind::List(_) => "list",
        }
    }
}

pub struct Obj {
    pub marked: Cell<bool>,
    pub kind: ObjKind,
}

/// A non-owning, Copy pointer to a heap-allocated `Obj`. Equality is pointer
/// identity — the same notion the source material's interning and `==`
/// semantics rely on (two distinct objects are never `==` even with equal
/// contents, except strings, which are always interned before use).
#[derive(Clone, Copy)]
pub struct ObjRef(NonNull<Obj>);

impl ObjRef {
    pub fn from_raw(ptr: *mut Obj) -> Self {
        ObjRef(NonNull::new(ptr).expect("null Obj pointer"))
    }

    pub fn as_ptr(self) -> *mut Obj {
        self.0.as_ptr()
    }

    pub fn ptr_eq(self, other: ObjRef) -> bool {
        self.0 == other.0
    }

    /// SAFETY: caller must know the referenced object is still alive (i.e.
    /// reachable from a root, or the GC is not currently mid-sweep).
    #[allow(clippy::should_implement_trait)]
    pub fn as_ref<'a>(self) -> &'a Obj {
        unsafe { self.0.as_ref() }
    }

    pub fn as_mut<'a>(self) -> &'a mut Obj {
        unsafe { &mut *self.0.as_ptr() }
    }

    pub fn is_marked(self) -> bool {
        self.as_ref().marked.get()
    }

    pub fn mark(self) {
        self.as_ref().marked.set(true);
    }

    pub fn unmark(self) {
        self.as_ref().marked.set(false);
    }

    pub fn as_string<'a>(self) -> &'a ObjString {
        match &unsafe { &*self.0.as_ptr() }.kind {
            ObjKind::Str(s) => s,
            _ => panic!("ObjRef is not a string"),
        }
    }

    pub fn as_function<'a>(self) -> &'a ObjFunction {
        match &unsafe { &*self.0.as_ptr() }.kind {
            ObjKind::Function(f) => f,
            _ => panic!("ObjRef is not a function"),
        }
    }

    pub fn as_function_mut<'a>(self) -> &'a mut ObjFunction {
        match &mut unsafe { &mut *self.0.as_ptr() }.kind {
            ObjKind::Function(f) => f,
            _ => panic!("ObjRef is not a function"),
        }
    }

    pub fn as_closure<'a>(self) -> &'a ObjClosure {
        match &unsafe { &*self.0.as_ptr() }.kind {
            ObjKind::Closure(c) => c,
            _ => panic!("ObjRef is not a closure"),
        }
    }

    pub fn as_closure_mut<'a>(self) -> &'a mut ObjClosure {
        match &mut unsafe { &mut *self.0.as_ptr() }.kind {
            ObjKind::Closure(c) => c,
            _ => panic!("ObjRef is not a closure"),
        }
    }

    pub fn as_upvalue_mut<'a>(self) -> &'a mut ObjUpvalue {
        match &mut unsafe { &mut *self.0.as_ptr() }.kind {
            ObjKind::Upvalue(u) => u,
            _ => panic!("ObjRef is not an upvalue"),
        }
    }

    pub fn as_class<'a>(self) -> &'a ObjClass {
        match &unsafe { &*self.0.as_ptr() }.kind {
            ObjKind::Class(c) => c,
            _ => panic!("ObjRef is not a class"),
        }
    }

    pub fn as_class_mut<'a>(self) -> &'a mut ObjClass {
        match &mut unsafe { &mut *self.0.as_ptr() }.kind {
            ObjKind::Class(c) => c,
            _ => panic!("ObjRef is not a class"),
        }
    }

    pub fn as_instance<'a>(self) -> &'a ObjInstance {
        match &unsafe { &*self.0.as_ptr() }.kind {
            ObjKind::Instance(i) => i,
            _ => panic!("ObjRef is not an instance"),
        }
    }

    pub fn as_instance_mut<'a>(self) -> &'a mut ObjInstance {
        match &mut unsafe { &mut *self.0.as_ptr() }.kind {
            ObjKind::Instance(i) => i,
            _ => panic!("ObjRef is not an instance"),
        }
    }

    pub fn as_list<'a>(self) -> &'a ObjList {
        match &unsafe { &*self.0.as_ptr() }.kind {
            ObjKind::List(l) => l,
            _ => panic!("ObjRef is not a list"),
        }
    }

    pub fn as_list_mut<'a>(self) -> &'a mut ObjList {
        match &mut unsafe { &mut *self.0.as_ptr() }.kind {
            ObjKind::List(l) => l,
            _ => panic!("ObjRef is not a list"),
        }
    }

    pub fn as_range<'a>(self) -> &'a ObjRange {
        match &unsafe { &*self.0.as_ptr() }.kind {
            ObjKind::Range(r) => r,
            _ => panic!("ObjRef is not a range"),
        }
    }

    pub fn as_native<'a>(self) -> &'a ObjNative {
        match &unsafe { &*self.0.as_ptr() }.kind {
            ObjKind::Native(n) => n,
            _ => panic!("ObjRef is not a native function"),
        }
    }

    pub fn as_bound_method<'a>(self) -> &'a ObjBoundMethod {
        match &unsafe { &*self.0.as_ptr() }.kind {
            ObjKind::BoundMethod(b) => b,
            _ => panic!("ObjRef is not a bound method"),
        }
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:p})", self.as_ptr())
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(*other)
    }
}
impl Eq for ObjRef {}
