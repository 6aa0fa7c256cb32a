// File: src/builtins.rs
//
// Native functions for the Cinder standard environment. Natives are
// ordinary Rust functions registered by name before interpretation; a
// script sees them as callable globals.

use std::time::Instant;

use once_cell::sync::Lazy;

use crate::memory::Heap;
use crate::object::ObjKind;
use crate::value::Value;
use crate::vm::Vm;

/// Registers every builtin on a fresh VM.
pub fn install(vm: &mut Vm) {
    vm.define_native("clock", clock);
    vm.define_native("combine", combine);
}

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// clock() -> seconds since the process started, as a number.
fn clock(_heap: &mut Heap, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(START.elapsed().as_secs_f64()))
}

/// combine(s1, s2, ...) -> one interned string holding every argument's
/// characters in order.
fn combine(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    let mut combined = String::new();
    for &arg in args {
        match arg {
            Value::Obj(r) => match &heap.get(r).kind {
                ObjKind::String(s) => combined.push_str(&s.chars),
                _ => return Err("combine() takes only string arguments.".to_string()),
            },
            _ => return Err("combine() takes only string arguments.".to_string()),
        }
    }
    Ok(Value::Obj(heap.take_string(combined)))
}
