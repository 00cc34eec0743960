// Host-provided native functions, bound into the globals table at VM start.
// Grounded on original_source/Loxcpp/Vm.cpp's `interpret()` `defineNative`
// block: a deliberately small set of "thin external collaborators" per
// spec.md §1/§6 (clock, file I/O, list helpers, and the re-entrant
// map/filter/reduce trio that call back into the VM via `call_value` +ra
// bounded `run(depth)`), plus the `Math` host-provided class spec.md §4.6
// names as the concrete instance of "some host-provided classes register
// fields in their initializer (e.g., Math.PI)".

use crate::object::{ObjKind, ObjNative};
use crate::value::Value;
use crate::vm::VM;

pub fn register(vm: &mut VM) {
    vm.define_native("clock", Some(0), false, native_clock);
    vm.define_native("read_input", Some(0), false, native_read_input);
    vm.define_native("read_file", Some(1), false, native_read_file);
    vm.define_native("write_file", Some(2), false, native_write_file);
    vm.define_native("len", Some(1), false, native_len);
    vm.define_native("push", Some(2), false, native_push);
    vm.define_native("pop", Some(1), false, native_pop);
    vm.define_native("remove_at", Some(2), false, native_remove_at);
    vm.define_native("map", Some(2), false, native_map);
    vm.define_native("filter", Some(2), false, native_filter);
    vm.define_native("reduce", Some(3), false, native_reduce);
    register_math_class(vm);
}

fn native_clock(vm: &mut VM, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.elapsed_secs()))
}

fn native_read_input(vm: &mut VM, _args: &[Value]) -> Result<Value, String> {
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).map_err(|e| e.to_string())?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Value::Obj(vm.intern_str(&line)))
}

fn expect_string(value: &Value, what: &str) -> Result<String, String> {
    match value {
        Value::Obj(o) if matches!(o.as_ref().kind, ObjKind::Str(_)) => Ok(o.as_string().as_str().to_string()),
        _ => Err(format!("{what} must be a string.")),
    }
}

fn native_read_file(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let path = expect_string(&args[0], "read_file's argument")?;
    let contents = std::fs::read_to_string(&path).map_err(|e| format!("Could not read file '{path}': {e}"))?;
    Ok(Value::Obj(vm.intern_str(&contents)))
}

fn native_write_file(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let path = expect_string(&args[0], "write_file's first argument")?;
    let contents = expect_string(&args[1], "write_file's second argument")?;
    std::fs::write(&path, contents).map_err(|e| format!("Could not write file '{path}': {e}"))?;
    Ok(Value::Nil)
}

fn native_len(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    match &args[0] {
        Value::Obj(o) => match &o.as_ref().kind {
            ObjKind::Str(s) => Ok(Value::Number(s.as_str().chars().count() as f64)),
            ObjKind::List(l) => Ok(Value::Number(l.items.len() as f64)),
            ObjKind::Range(r) => Ok(Value::Number(r.len() as f64)),
            _ => Err("len() expects a string, list, or range.".to_string()),
        },
        _ => Err("len() expects a string, list, or range.".to_string()),
    }
}

fn expect_list(value: &Value, what: &str) -> Result<crate::object::ObjRef, String> {
    match value {
        Value::Obj(o) if matches!(o.as_ref().kind, ObjKind::List(_)) => Ok(*o),
        _ => Err(format!("{what} must be a list.")),
    }
}

fn native_push(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let list = expect_list(&args[0], "push()'s first argument")?;
    list.as_list_mut().items.push(args[1]);
    Ok(args[0])
}

fn native_pop(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let list = expect_list(&args[0], "pop()'s argument")?;
    Ok(list.as_list_mut().items.pop().unwrap_or(Value::Nil))
}

fn native_remove_at(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let list = expect_list(&args[0], "remove_at()'s first argument")?;
    let index = args[1].as_number().ok_or("remove_at()'s second argument must be a number.")? as i64;
    let items = &mut list.as_list_mut().items;
    if index < 0 || index as usize >= items.len() {
        return Ok(Value::Nil);
    }
    Ok(items.remove(index as usize))
}

/// Collects a List or Range into a Vec<Value> of Numbers/elements, for the
/// re-entrant map/filter/reduce natives. Ranges with `lower > upper` iterate
/// in reverse, mirroring `ObjRange` containment/indexing semantics.
fn iterable_values(value: &Value) -> Result<Vec<Value>, String> {
    match value {
        Value::Obj(o) => match &o.as_ref().kind {
            ObjKind::List(l) => Ok(l.items.clone()),
            ObjKind::Range(r) => {
                let mut out = Vec::new();
                if r.lower <= r.upper {
                    let mut n = r.lower;
                    while n <= r.upper {
                        out.push(Value::Number(n));
                        n += 1.0;
                    }
                } else {
                    let mut n = r.lower;
                    while n >= r.upper {
                        out.push(Value::Number(n));
                        n -= 1.0;
                    }
                }
                Ok(out)
            }
            _ => Err("Expected a list or range.".to_string()),
        },
        _ => Err("Expected a list or range.".to_string()),
    }
}

fn native_map(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let items = iterable_values(&args[0])?;
    let callable = args[1];
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(vm.call_reentrant(callable, &[item])?);
    }
    Ok(Value::Obj(vm.new_list(out)))
}

fn native_filter(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let items = iterable_values(&args[0])?;
    let callable = args[1];
    let mut out = Vec::new();
    for item in items {
        if !vm.call_reentrant(callable, &[item])?.is_falsey() {
            out.push(item);
        }
    }
    Ok(Value::Obj(vm.new_list(out)))
}

fn native_reduce(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let items = iterable_values(&args[0])?;
    let callable = args[1];
    let mut acc = args[2];
    for item in items {
        acc = vm.call_reentrant(callable, &[acc, item])?;
    }
    Ok(acc)
}

fn math_abs(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let n = args[1].as_number().ok_or("Math.abs() expects a number.")?;
    Ok(Value::Number(n.abs()))
}

fn math_min(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let a = args[1].as_number().ok_or("Math.min() expects numbers.")?;
    let b = args[2].as_number().ok_or("Math.min() expects numbers.")?;
    Ok(Value::Number(a.min(b)))
}

fn math_max(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let a = args[1].as_number().ok_or("Math.max() expects numbers.")?;
    let b = args[2].as_number().ok_or("Math.max() expects numbers.")?;
    Ok(Value::Number(a.max(b)))
}

/// Built the way `Vm.cpp`'s `defineNativeClass("Math", …)` does: a class
/// carrying native methods plus a singleton instance whose fields are seeded
/// directly rather than through a user-visible `init` (Math is never
/// constructed by name, only referenced as the `Math` global).
fn register_math_class(vm: &mut VM) {
    let name = vm.intern_str("Math");
    let class = vm.heap_mut().new_class(name);
    let methods: &[(&'static str, u8, crate::object::NativeFn)] =
        &[("abs", 1, math_abs as crate::object::NativeFn), ("min", 2, math_min), ("max", 2, math_max)];
    for (method_name, arity, function) in methods.iter().copied() {
        let native_obj = vm.heap_mut().new_native(ObjNative {
            name: method_name,
            arity: Some(arity),
            function,
            is_method: true,
        });
        let name_obj = vm.intern_str(method_name);
        class.as_class_mut().methods.set(name_obj, Value::Obj(native_obj));
    }
    let instance = vm.heap_mut().new_instance(class);
    let pi_name = vm.intern_str("PI");
    instance.as_instance_mut().fields.set(pi_name, Value::Number(std::f64::consts::PI));
    vm.define_global_value("Math", Value::Obj(instance));
}

#[cfg(test)]
mod tests {
    use crate::vm::{InterpretResult, VM};
    use std::io::Write;
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

    fn run(src: &str) -> (InterpretResult, String) {
        let shared = SharedBuf::default();
        let mut vm = VM::with_output(Box::new(shared.clone()));
        let result = vm.interpret(src);
        let out = String::from_utf8(shared.0.lock().unwrap().clone()).unwrap();
        (result, out)
    }

    #[test]
    fn math_pi_and_abs() {
        let (result, out) = run("print Math.PI; print Math.abs(-5);");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "3.141592653589793\n5\n");
    }

    #[test]
    fn math_min_max() {
        let (result, out) = run("print Math.min(3, 7); print Math.max(3, 7);");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "3\n7\n");
    }

    #[test]
    fn list_push_pop_len() {
        let (result, out) = run(
            r#"
            var l = [1, 2, 3];
            push(l, 4);
            print len(l);
            print pop(l);
            print len(l);
        "#,
        );
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "4\n4\n3\n");
    }

    #[test]
    fn map_filter_reduce_over_a_list() {
        let (result, out) = run(
            r#"
            fun double(x) { return x * 2; }
            fun isEven(x) { return x % 2 == 0; }
            fun add(acc, x) { return acc + x; }
            print map([1, 2, 3], double);
            print filter([1, 2, 3, 4], isEven);
            print reduce([1, 2, 3, 4], add, 0);
        "#,
        );
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "[2, 4, 6]\n[2, 4]\n10\n");
    }

    #[test]
    fn map_over_a_range() {
        let (result, out) = run(
            r#"
            fun double(x) { return x * 2; }
            print map(1..3, double);
        "#,
        );
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "[2, 4, 6]\n");
    }

    #[test]
    fn clock_returns_a_number() {
        let (result, out) = run("print clock() >= 0;");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(out, "true\n");
    }
}
