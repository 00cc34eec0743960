// Stack-based bytecode VM. Grounded on original_source/Loxcpp/Vm.cpp's
// dispatch loop almost line-for-line for opcode semantics (OP_ADD's
// string/number coercion, OP_MATCH's range-vs-equality split,
// OP_INDEX_SUBSCR/OP_STORE_SUBSCR's instance/list/string/range branches,
// callValue/invoke/bindMethod/captureUpvalue/closeUpvalues), with Rust-side
// structure (CallFrame fields, a plain-owned Heap rather than the teacher's
// Arc<Mutex<_>>-shared one, since this VM is single-threaded and owns its
// heap outright) grounded on the shape of the teacher's own src/vm.rs.

use std::io::Write;

use crate::chunk::OpCode;
use crate::compiler::{self, CompileOutput};
use crate::errors::{CompileError, RuntimeError, TraceFrame};
use crate::heap::{Heap, Roots};
use crate::object::{NativeFn, ObjNative, ObjRef};
use crate::table::Table;
use crate::value::{values_equal, Value};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

struct CallFrame {
    closure: ObjRef, // ObjClosure
    ip: usize,
    slot_base: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

pub struct VM {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    heap: Heap,
    globals: Table,
    const_globals: Table,
    open_upvalues: Option<ObjRef>, // descending stack address
    output: Box<dyn Write>,
    start_time: std::time::Instant,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok()
}

impl Default for VM {
    fn default() -> Self {
        VM::new()
    }
}

impl VM {
    pub fn new() -> Self {
        let mut vm = VM {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            heap: Heap::new(),
            globals: Table::new(),
            const_globals: Table::new(),
            open_upvalues: None,
            output: Box::new(std::io::stdout()),
            start_time: std::time::Instant::now(),
        };
        crate::natives::register(&mut vm);
        vm
    }

    /// Used by tests and the REPL-under-test harness to capture printed
    /// output instead of writing to the real stdout.
    pub fn with_output(output: Box<dyn Write>) -> Self {
        let mut vm = VM::new();
        vm.output = output;
        vm
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn define_native(&mut self, name: &str, arity: Option<u8>, is_method: bool, function: NativeFn) {
        let name_obj = self.heap.intern_str(name);
        let native = ObjNative { name: Box::leak(name.to_string().into_boxed_str()), arity, function, is_method };
        let native_obj = self.heap.new_native(native);
        self.globals.set(name_obj, Value::Obj(native_obj));
    }

    pub fn define_global_value(&mut self, name: &str, value: Value) {
        let name_obj = self.heap.intern_str(name);
        self.globals.set(name_obj, value);
    }

    // ----- top-level entry points -----

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let CompileOutput { function, errors } =
            compiler::compile(source, &mut self.heap, &mut self.const_globals);

        if !errors.is_empty() {
            report_compile_errors(&errors);
            return InterpretResult::CompileError;
        }

        self.stack.push(Value::Obj(function));
        let closure = self.heap.new_closure(function);
        self.stack.pop();
        self.stack.push(Value::Obj(closure));

        if let Err(err) = self.call_value(closure, 0) {
            eprint!("{}", err);
            self.stack.clear();
            self.frames.clear();
            return InterpretResult::RuntimeError;
        }

        match self.run(0) {
            Ok(_) => InterpretResult::Ok,
            Err(err) => {
                eprint!("{}", err);
                self.stack.clear();
                self.frames.clear();
                InterpretResult::RuntimeError
            }
        }
    }

    // ----- stack helpers -----

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ----- errors -----

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in &self.frames {
            let function = frame.closure.as_closure().function.as_function();
            let line = function.chunk.lines.get(frame.ip.saturating_sub(1)).copied().unwrap_or(0);
            let name = match function.name {
                Some(n) => n.as_string().as_str().to_string(),
                None => "script".to_string(),
            };
            trace.push(TraceFrame { line, name });
        }
        RuntimeError::new(message, trace)
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            let frame_closures: Vec<ObjRef> = self.frames.iter().map(|f| f.closure).collect();
            let mut open = Vec::new();
            let mut cursor = self.open_upvalues;
            while let Some(up) = cursor {
                open.push(up);
                cursor = up.as_upvalue_mut().next_open;
            }
            let roots = Roots {
                stack: &self.stack,
                frames: &frame_closures,
                open_upvalues: &open,
                globals: &self.globals,
                compiler_functions: &[],
            };
            self.heap.collect(roots);
        }
    }

    fn intern(&mut self, s: &str) -> ObjRef {
        self.maybe_collect();
        let mut protect = vec![];
        let r = self.heap.copy_string(s, &mut protect);
        r
    }

    // ----- calling convention -----

    fn call_closure(&mut self, closure: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let function = closure.as_closure().function.as_function();
        if argc != function.arity {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                function.arity, argc
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slot_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure, ip: 0, slot_base });
        Ok(())
    }

    fn call_native(&mut self, native_obj: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let native = native_obj.as_native();
        if let Some(arity) = native.arity {
            if arity != argc {
                return Err(self.runtime_error(format!(
                    "Expected {} arguments but got {}.",
                    arity, argc
                )));
            }
        }
        let base = self.stack.len() - argc as usize - 1;
        // Method-style natives keep the receiver (the callee slot itself) as
        // args[0]; ordinary natives only see the arguments above it.
        let args: Vec<Value> =
            if native.is_method { self.stack[base..].to_vec() } else { self.stack[base + 1..].to_vec() };
        let function = native.function;
        match function(self, &args) {
            Ok(result) => {
                self.stack.truncate(base);
                self.push(result)
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    /// `callValue` from spec.md §4.6: dispatches on the callee's runtime
    /// type, replacing `peek(argc)` (the callee slot) in place.
    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let Value::Obj(obj) = callee else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };
        match &obj.as_ref().kind {
            crate::object::ObjKind::Closure(_) => self.call_closure(obj, argc),
            crate::object::ObjKind::Native(_) => self.call_native(obj, argc),
            crate::object::ObjKind::Class(_) => {
                self.maybe_collect();
                let instance = self.heap.new_instance(obj);
                let base = self.stack.len() - argc as usize - 1;
                self.stack[base] = Value::Obj(instance);
                let initializer = obj.as_class().initializer;
                match initializer {
                    Value::Nil => {
                        if argc != 0 {
                            return Err(self
                                .runtime_error(format!("Expected 0 arguments but got {}.", argc)));
                        }
                        Ok(())
                    }
                    init => self.call_value(init, argc),
                }
            }
            crate::object::ObjKind::BoundMethod(_) => {
                let bound = obj.as_bound_method();
                let receiver = bound.receiver;
                let method = bound.method;
                let base = self.stack.len() - argc as usize - 1;
                self.stack[base] = receiver;
                self.call_value(Value::Obj(method), argc)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    /// `invoke` from spec.md §4.6: `instance.method(args)` fast path that
    /// avoids allocating a BoundMethod when the field isn't a callable
    /// override of the method.
    fn invoke(&mut self, name: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let Value::Obj(obj) = receiver else {
            return Err(self.runtime_error("Only instances have methods."));
        };
        let crate::object::ObjKind::Instance(_) = &obj.as_ref().kind else {
            return Err(self.runtime_error("Only instances have methods."));
        };
        let instance = obj.as_instance();
        if let Some(field) = instance.fields.get(name) {
            let base = self.stack.len() - argc as usize - 1;
            self.stack[base] = field;
            return self.call_value(field, argc);
        }
        let class = instance.class;
        match class.as_class().methods.get(name) {
            Some(method) => self.call_value(method, argc),
            None => Err(self.runtime_error(format!("Undefined property '{}'.", name.as_string().as_str()))),
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Option<ObjRef> {
        let method = class.as_class().methods.get(name)?;
        let Value::Obj(method_obj) = method else { return None };
        self.maybe_collect();
        let receiver = self.peek(0);
        Some(self.heap.new_bound_method(receiver, method_obj))
    }

    // ----- upvalues -----

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        let mut cursor = self.open_upvalues;
        let mut prev: Option<ObjRef> = None;
        while let Some(up) = cursor {
            let up_slot = self.slot_index_of(up);
            if up_slot == stack_index {
                return up;
            }
            if up_slot < stack_index {
                break;
            }
            prev = cursor;
            cursor = up.as_upvalue_mut().next_open;
        }

        self.maybe_collect();
        let location: *mut Value = &mut self.stack[stack_index];
        let created = self.heap.new_upvalue(location);
        created.as_upvalue_mut().next_open = cursor;
        match prev {
            Some(p) => p.as_upvalue_mut().next_open = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Stack index an *open* upvalue currently points at, derived from its
    /// raw pointer's offset into `self.stack`'s backing storage.
    fn slot_index_of(&self, up: ObjRef) -> usize {
        let base = self.stack.as_ptr();
        let loc = up.as_upvalue_mut().location;
        unsafe { loc.offset_from(base) as usize }
    }

    fn close_upvalues(&mut self, from: usize) {
        while let Some(up) = self.open_upvalues {
            if self.slot_index_of(up) < from {
                break;
            }
            let u = up.as_upvalue_mut();
            u.closed = unsafe { *u.location };
            u.is_closed = true;
            self.open_upvalues = u.next_open;
            u.next_open = None;
        }
    }

    // ----- dispatch loop -----

    /// Runs until the call-frame stack depth drops back to `depth`. Used both
    /// for the top-level `interpret()` call (depth 0) and for natives that
    /// re-enter the VM (`map`/`filter`/`reduce`), which call this with the
    /// depth captured just before pushing their callback frame.
    pub fn run(&mut self, depth: usize) -> Result<Value, RuntimeError> {
        let trace = env_flag("RUFF_TRACE_EXECUTION");
        loop {
            if self.frames.len() <= depth {
                return Ok(self.stack.last().copied().unwrap_or(Value::Nil));
            }

            if trace {
                let frame = self.frames.last().unwrap();
                let chunk = &frame.closure.as_closure().function.as_function().chunk;
                eprint!("          ");
                for v in &self.stack {
                    eprint!("[ {} ]", v);
                }
                eprintln!();
                crate::disassembler::disassemble_instruction(chunk, frame.ip);
            }

            let op = self.read_op()?;
            match op {
                OpCode::Constant => {
                    let v = self.read_constant(false);
                    self.push(v)?;
                }
                OpCode::ConstantLong => {
                    let v = self.read_constant(true);
                    self.push(v)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slot_base;
                    self.push(self.stack[base + slot])?;
                }
                OpCode::GetLocalLong => {
                    let slot = self.read_u32() as usize;
                    let base = self.frames.last().unwrap().slot_base;
                    self.push(self.stack[base + slot])?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slot_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::SetLocalLong => {
                    let slot = self.read_u32() as usize;
                    let base = self.frames.last().unwrap().slot_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal | OpCode::GetGlobalLong => {
                    let name = self.read_constant(op == OpCode::GetGlobalLong).as_obj().unwrap();
                    match self.globals.get(name) {
                        Some(v) => self.push(v)?,
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined variable '{}'.",
                                name.as_string().as_str()
                            )))
                        }
                    }
                }
                OpCode::DefineGlobal | OpCode::DefineGlobalLong => {
                    let name = self.read_constant(op == OpCode::DefineGlobalLong).as_obj().unwrap();
                    let value = self.peek(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::SetGlobal | OpCode::SetGlobalLong => {
                    let name = self.read_constant(op == OpCode::SetGlobalLong).as_obj().unwrap();
                    let value = self.peek(0);
                    if self.globals.set(name, value) {
                        self.globals.delete(name);
                        return Err(self.runtime_error(format!(
                            "Undefined variable '{}'.",
                            name.as_string().as_str()
                        )));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let up = closure.as_closure().upvalues[slot];
                    let u = up.as_upvalue_mut();
                    let v = if u.is_closed { u.closed } else { unsafe { *u.location } };
                    self.push(v)?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let up = closure.as_closure().upvalues[slot];
                    let value = self.peek(0);
                    let u = up.as_upvalue_mut();
                    if u.is_closed {
                        u.closed = value;
                    } else {
                        unsafe { *u.location = value };
                    }
                }
                OpCode::GetProperty | OpCode::GetPropertyLong => {
                    let name = self.read_constant(op == OpCode::GetPropertyLong).as_obj().unwrap();
                    let receiver = self.peek(0);
                    let Value::Obj(obj) = receiver else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };
                    let crate::object::ObjKind::Instance(_) = &obj.as_ref().kind else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };
                    let instance = obj.as_instance();
                    if let Some(field) = instance.fields.get(name) {
                        self.pop();
                        self.push(field)?;
                    } else if let Some(bound) = self.bind_method(instance.class, name) {
                        self.pop();
                        self.push(Value::Obj(bound))?;
                    } else {
                        self.pop();
                        self.push(Value::Nil)?;
                    }
                }
                OpCode::SetProperty | OpCode::SetPropertyLong => {
                    let name = self.read_constant(op == OpCode::SetPropertyLong).as_obj().unwrap();
                    let value = self.peek(0);
                    let receiver = self.peek(1);
                    let Value::Obj(obj) = receiver else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };
                    let crate::object::ObjKind::Instance(_) = &obj.as_ref().kind else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };
                    obj.as_instance_mut().fields.set(name, value);
                    self.pop();
                    self.pop();
                    self.push(value)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(values_equal(&a, &b)))?;
                }
                OpCode::Greater => self.number_compare(|a, b| a > b)?,
                OpCode::Less => self.number_compare(|a, b| a < b)?,
                OpCode::Match => self.op_match()?,
                OpCode::Add => self.op_add()?,
                OpCode::Subtract => self.number_binop(|a, b| a - b)?,
                OpCode::Multiply => self.number_binop(|a, b| a * b)?,
                OpCode::Divide => self.number_binop(|a, b| a / b)?,
                OpCode::Modulo => self.number_binop(|a, b| a % b)?,
                OpCode::Negate => {
                    let Some(n) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-n))?;
                }
                OpCode::Increment => {
                    let Some(n) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(n + 1.0))?;
                }
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()))?;
                }
                OpCode::BuildRange => {
                    let max = self.pop();
                    let min = self.pop();
                    let (Some(min), Some(max)) = (min.as_number(), max.as_number()) else {
                        return Err(self.runtime_error("Range bounds must be numbers."));
                    };
                    self.maybe_collect();
                    let r = self.heap.new_range(min, max);
                    self.push(Value::Obj(r))?;
                }
                OpCode::BuildList => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    let items: Vec<Value> = self.stack[start..].to_vec();
                    self.stack.truncate(start);
                    self.maybe_collect();
                    let list = self.heap.new_list(items);
                    self.push(Value::Obj(list))?;
                }
                OpCode::IndexSubscr => self.op_index()?,
                OpCode::StoreSubscr => self.op_store_index()?,
                OpCode::Print => {
                    let v = self.pop();
                    let _ = writeln!(self.output, "{}", v);
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke | OpCode::InvokeLong => {
                    let name = self.read_constant(op == OpCode::InvokeLong).as_obj().unwrap();
                    let argc = self.read_byte();
                    self.invoke(name, argc)?;
                }
                OpCode::Closure | OpCode::ClosureLong => {
                    let function = self.read_constant(op == OpCode::ClosureLong).as_obj().unwrap();
                    self.maybe_collect();
                    let closure = self.heap.new_closure(function);
                    let upvalue_count = function.as_function().upvalue_count;
                    let frame_base = self.frames.last().unwrap().slot_base;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let up = if is_local {
                            self.capture_upvalue(frame_base + index)
                        } else {
                            self.frames.last().unwrap().closure.as_closure().upvalues[index]
                        };
                        closure.as_closure_mut().upvalues.push(up);
                    }
                    self.push(Value::Obj(closure))?;
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.slot_base);
                    self.stack.truncate(frame.slot_base);
                    self.push(result)?;
                    if self.frames.len() <= depth {
                        return Ok(result);
                    }
                }
                OpCode::Class | OpCode::ClassLong => {
                    let name = self.read_constant(op == OpCode::ClassLong).as_obj().unwrap();
                    self.maybe_collect();
                    let class = self.heap.new_class(name);
                    self.push(Value::Obj(class))?;
                }
                OpCode::Method | OpCode::MethodLong => {
                    let name = self.read_constant(op == OpCode::MethodLong).as_obj().unwrap();
                    let method = self.peek(0);
                    let class = self.peek(1).as_obj().unwrap();
                    if name.as_string().as_str() == "init" {
                        class.as_class_mut().initializer = method;
                    } else {
                        class.as_class_mut().methods.set(name, method);
                    }
                    self.pop();
                }
            }
        }
    }

    // ----- bytecode reading -----

    fn read_op(&mut self) -> Result<OpCode, RuntimeError> {
        let byte = self.read_byte();
        OpCode::from_u8(byte).ok_or_else(|| self.runtime_error("Unknown opcode."))
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let closure = frame.closure.as_closure();
        let chunk = &closure.function.as_function().chunk;
        let byte = chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_le_bytes([hi, lo])
    }

    fn read_u32(&mut self) -> u32 {
        let b0 = self.read_byte();
        let b1 = self.read_byte();
        let b2 = self.read_byte();
        let b3 = self.read_byte();
        u32::from_le_bytes([b0, b1, b2, b3])
    }

    fn read_constant(&mut self, long: bool) -> Value {
        let index = if long { self.read_u32() as usize } else { self.read_byte() as usize };
        let frame = self.frames.last().unwrap();
        frame.closure.as_closure().function.as_function().chunk.constants[index]
    }

    // ----- arithmetic helpers -----

    fn number_binop(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.peek(0).as_number();
        let a = self.peek(1).as_number();
        let (Some(a), Some(b)) = (a, b) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(Value::Number(f(a, b)))
    }

    fn number_compare(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.peek(0).as_number();
        let a = self.peek(1).as_number();
        let (Some(a), Some(b)) = (a, b) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(Value::Bool(f(a, b)))
    }

    fn op_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            return self.push(Value::Number(x + y));
        }
        if a.is_string() || b.is_string() {
            let left = a.to_string();
            let right = b.to_string();
            self.pop();
            self.pop();
            let mut bytes = left.into_bytes();
            bytes.extend(right.into_bytes());
            self.maybe_collect();
            let mut protect = vec![];
            let obj = self.heap.take_string(bytes, &mut protect);
            return self.push(Value::Obj(obj));
        }
        Err(self.runtime_error("Operands must be two numbers or at least one string."))
    }

    fn op_match(&mut self) -> Result<(), RuntimeError> {
        let pattern = self.pop();
        let subject = self.pop();
        let matched = match pattern.as_obj() {
            Some(obj) if matches!(obj.as_ref().kind, crate::object::ObjKind::Range(_)) => {
                match subject.as_number() {
                    Some(n) => obj.as_range().contains(n),
                    None => false,
                }
            }
            _ => values_equal(&subject, &pattern),
        };
        self.push(Value::Bool(matched))
    }

    fn op_index(&mut self) -> Result<(), RuntimeError> {
        let index = self.pop();
        let receiver = self.pop();
        let Value::Obj(obj) = receiver else {
            return Err(self.runtime_error("Can only index strings, lists, and ranges."));
        };
        match &obj.as_ref().kind {
            crate::object::ObjKind::List(list) => {
                let Some(i) = index.as_number() else {
                    return Err(self.runtime_error("List index must be a number."));
                };
                let i = i as i64;
                if i < 0 || i as usize >= list.items.len() {
                    self.push(Value::Nil)
                } else {
                    let v = list.items[i as usize];
                    self.push(v)
                }
            }
            crate::object::ObjKind::Str(s) => {
                let Some(i) = index.as_number() else {
                    return Err(self.runtime_error("String index must be a number."));
                };
                let i = i as i64;
                let text = s.as_str();
                let chars: Vec<char> = text.chars().collect();
                if i < 0 || i as usize >= chars.len() {
                    self.push(Value::Nil)
                } else {
                    let ch = chars[i as usize].to_string();
                    self.maybe_collect();
                    let mut protect = vec![];
                    let obj = self.heap.copy_string(&ch, &mut protect);
                    self.push(Value::Obj(obj))
                }
            }
            crate::object::ObjKind::Range(r) => {
                let Some(i) = index.as_number() else {
                    return Err(self.runtime_error("Range index must be a number."));
                };
                let i = i as i64;
                if i < 0 || i as usize >= r.len() {
                    self.push(Value::Nil)
                } else {
                    let v = if r.lower <= r.upper { r.lower + i as f64 } else { r.lower - i as f64 };
                    self.push(Value::Number(v))
                }
            }
            crate::object::ObjKind::Instance(instance) => {
                if !index.is_string() {
                    return Err(self.runtime_error("Instance index must be a string."));
                }
                let key = index.as_obj().unwrap();
                match instance.fields.get(key) {
                    Some(v) => self.push(v),
                    None => self.push(Value::Nil),
                }
            }
            _ => Err(self.runtime_error("Can only index strings, lists, ranges, and instances.")),
        }
    }

    fn op_store_index(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop();
        let index = self.pop();
        let receiver = self.pop();
        let Value::Obj(obj) = receiver else {
            return Err(self.runtime_error("Can only index lists and instances."));
        };
        match &obj.as_ref().kind {
            crate::object::ObjKind::List(_) => {
                let Some(i) = index.as_number() else {
                    return Err(self.runtime_error("List index must be a number."));
                };
                let i = i as i64;
                let list = obj.as_list_mut();
                if i < 0 || i as usize >= list.items.len() {
                    return Err(self.runtime_error("List index out of range."));
                }
                list.items[i as usize] = value;
                self.push(value)
            }
            crate::object::ObjKind::Instance(_) => {
                if !index.is_string() {
                    return Err(self.runtime_error("Instance index must be a string."));
                }
                let key = index.as_obj().unwrap();
                obj.as_instance_mut().fields.set(key, value);
                self.push(value)
            }
            _ => Err(self.runtime_error("Can only index lists and instances.")),
        }
    }

    // ----- helpers used by natives -----

    /// Calls `callable` with `args` and runs until it returns, for
    /// re-entrant natives (`map`/`filter`/`reduce`). Mirrors `Vm.cpp`'s
    /// pattern of pushing the callee and arguments, invoking `callValue`,
    /// then pumping the dispatch loop down to the depth captured before the
    /// call.
    pub fn call_reentrant(&mut self, callable: Value, args: &[Value]) -> Result<Value, String> {
        let depth = self.frames.len();
        self.push(callable).map_err(|e| e.message)?;
        for &a in args {
            self.push(a).map_err(|e| e.message)?;
        }
        self.call_value(callable, args.len() as u8).map_err(|e| e.message)?;
        // A native callee returns immediately without pushing a frame; a
        // closure callee needs the dispatch loop pumped to unwind it. Either
        // way the result is left sitting on the value stack (`run` only
        // peeks it so the top-level `interpret` caller can read it before
        // clearing the stack wholesale) so it must be popped here to keep
        // the stack balanced for the native that re-entered us.
        if self.frames.len() > depth {
            let result = self.run(depth).map_err(|e| e.message)?;
            self.pop();
            Ok(result)
        } else {
            Ok(self.pop())
        }
    }

    pub fn intern_str(&mut self, s: &str) -> ObjRef {
        self.intern(s)
    }

    pub fn new_list(&mut self, items: Vec<Value>) -> ObjRef {
        self.maybe_collect();
        self.heap.new_list(items)
    }
}

fn report_compile_errors(errors: &[CompileError]) {
    for err in errors {
        eprintln!("{}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn run_and_capture(src: &str) -> (InterpretResult, String) {
        let shared = SharedBuf::default();
        let mut vm = VM::with_output(Box::new(shared.clone()));
        let result = vm.interpret(src);
        let out = String::from_utf8(shared.0.lock().unwrap().clone()).unwrap();
        (result, out)
    }

    #[test]
    fn arithmetic_and_print() {
        let (result, out) = run_and_capture("print 1 + 2 * 3;");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "7\n");
    }

    #[test]
    fn closure_counter_shares_upvalue() {
        let src = r#"
            fun makeCounter() {
                var i = 0;
                fun c() { i = i + 1; return i; }
                return c;
            }
            var c = makeCounter();
            print c();
            print c();
            print c();
        "#;
        let (result, out) = run_and_capture(src);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "1\n2\n3\n");
    }

    #[test]
    fn class_init_and_method() {
        let src = r#"
            class Greeter {
                init(n) { this.name = n; }
                hello() { print "hi " + this.name; }
            }
            Greeter("world").hello();
        "#;
        let (result, out) = run_and_capture(src);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "hi world\n");
    }

    #[test]
    fn string_concat_with_number_coercion() {
        let (result, out) = run_and_capture(r#"print "n=" + 42;"#);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "n=42\n");
    }

    #[test]
    fn match_with_range_pattern() {
        let src = r#"match (7) { 1..5 => print "lo"; 6..10 => print "hi"; _ => print "?"; }"#;
        let (result, out) = run_and_capture(src);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "hi\n");
    }

    #[test]
    fn recursive_fib() {
        let src = "fun fib(n){ if (n<2) return n; return fib(n-1)+fib(n-2); } print fib(10);";
        let (result, out) = run_and_capture(src);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "55\n");
    }

    #[test]
    fn arity_mismatch_is_runtime_error() {
        let (result, _out) = run_and_capture("fun f(a,b){} f(1);");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn list_index_out_of_range_reads_nil() {
        let (result, out) = run_and_capture("print [1,2,3][10];");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "nil\n");
    }

    #[test]
    fn list_store_out_of_range_is_runtime_error() {
        let (result, _) = run_and_capture("var l = [1,2]; l[5] = 9;");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn and_or_short_circuit() {
        let src = r#"
            fun boom() { print "should not run"; return true; }
            if (false and boom()) { print "no"; }
            if (true or boom()) { print "yes"; }
        "#;
        let (result, out) = run_and_capture(src);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "yes\n");
    }
}
