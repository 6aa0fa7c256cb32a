// File: src/vm.rs
//
// Stack-based virtual machine executing Cinder bytecode.
// A dispatch loop reads one opcode at a time from the chunk of the active
// call frame. The VM owns the heap, the value stack, the frame stack, the
// globals table, and the list of open upvalues; those four structures are
// exactly the garbage collector's root set.

use std::io::{self, Write};

use colored::Colorize;

use crate::builtins;
use crate::bytecode::{Chunk, OpCode};
use crate::compiler::compile;
use crate::debug;
use crate::errors::InterpretError;
use crate::memory::Heap;
use crate::object::{NativeFn, ObjKind, ObjRef, UpvalueState};
use crate::scanner::Dialect;
use crate::table::Table;
use crate::value::{format_value, Value};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Resolved call target, split out of the heap borrow before dispatch.
enum Callee {
    Closure(ObjRef),
    Native(NativeFn),
}

/// One function activation: the closure being run, the instruction pointer
/// into its chunk, and the stack slot where its window begins (slot 0 holds
/// the callee itself, parameters and locals follow).
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Head of the open-upvalue list, sorted by descending stack slot.
    open_upvalues: Option<ObjRef>,
    dialect: Dialect,
    /// Program output. Swappable so tests can capture what `print` writes.
    out: Box<dyn Write>,
    trace: bool,
}

impl Vm {
    pub fn new(dialect: Dialect) -> Self {
        Vm::with_output(dialect, Box::new(io::stdout()))
    }

    pub fn with_output(dialect: Dialect, out: Box<dyn Write>) -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: None,
            dialect,
            out,
            trace: std::env::var("CINDER_TRACE_EXEC").is_ok(),
        };
        builtins::install(&mut vm);
        vm
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Registers a native function under `name`. Both the name and the
    /// native object are parked on the stack across the allocations so a
    /// collection between them cannot reap either.
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.heap.copy_string(name);
        self.stack.push(Value::Obj(name));
        let native = self.heap.new_native(function);
        self.stack.push(Value::Obj(native));

        let hash = self.heap.as_string(name).hash;
        self.globals.set(name, hash, Value::Obj(native));

        self.stack.pop();
        self.stack.pop();
    }

    /// Compiles and runs `source`. Globals survive across calls, which is
    /// what makes the REPL stateful.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let Some(function) = compile(source, &mut self.heap, self.dialect) else {
            return Err(InterpretError::Compile);
        };

        // The script function sits on the stack while its closure is
        // allocated, keeping it reachable if that allocation collects.
        self.stack.push(Value::Obj(function));
        self.prepare_allocation();
        let closure = self.heap.new_closure(function);
        self.stack.pop();
        self.stack.push(Value::Obj(closure));
        self.call(closure, 0)?;

        self.run()
    }

    // === Dispatch loop ===

    fn run(&mut self) -> Result<(), InterpretError> {
        loop {
            if self.trace {
                self.trace_instruction();
            }

            let byte = self.read_byte();
            let Ok(op) = OpCode::try_from(byte) else {
                return Err(self.runtime_error("Corrupted bytecode."));
            };

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.stack.push(value);
                }
                OpCode::Nil => self.stack.push(Value::Nil),
                OpCode::True => self.stack.push(Value::Bool(true)),
                OpCode::False => self.stack.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().base + slot];
                    self.stack.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    // Assignment is an expression; the value stays put.
                    self.stack[base + slot] = self.peek(0);
                }

                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.as_string(name).hash;
                    match self.globals.get(name, hash) {
                        Some(value) => self.stack.push(value),
                        None => {
                            let message =
                                format!("Undefined variable '{}'.", self.heap.string(name));
                            return Err(self.runtime_error(&message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.as_string(name).hash;
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.as_string(name).hash;
                    let value = self.peek(0);
                    // Assigning an undefined name is an error, so undo the
                    // insertion `set` just made.
                    if self.globals.set(name, hash, value) {
                        self.globals.delete(name, hash);
                        let message =
                            format!("Undefined variable '{}'.", self.heap.string(name));
                        return Err(self.runtime_error(&message));
                    }
                }

                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.current_closure_upvalue(slot);
                    let value = match self.heap.as_upvalue(upvalue).state {
                        UpvalueState::Open(stack_slot) => self.stack[stack_slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.stack.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.current_closure_upvalue(slot);
                    let value = self.peek(0);
                    match self.heap.as_upvalue(upvalue).state {
                        UpvalueState::Open(stack_slot) => self.stack[stack_slot] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.as_upvalue_mut(upvalue).state =
                                UpvalueState::Closed(value);
                        }
                    }
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_number_op(op)?,
                OpCode::Less => self.binary_number_op(op)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_number_op(op)?,
                OpCode::Multiply => self.binary_number_op(op)?,
                OpCode::Divide => self.binary_number_op(op)?,

                OpCode::Not => {
                    let value = self.pop();
                    self.stack.push(Value::Bool(value.is_falsy()));
                }
                OpCode::Negate => {
                    let Some(n) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.stack.push(Value::Number(-n));
                }

                OpCode::Print => {
                    let value = self.pop();
                    let rendered = format_value(value, &self.heap);
                    let _ = writeln!(self.out, "{}", rendered);
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    // The condition stays on the stack; the compiler emits
                    // a Pop on both sides of the branch.
                    if self.peek(0).is_falsy() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }

                OpCode::Closure => {
                    let function = self
                        .read_constant()
                        .as_obj()
                        .expect("closure operand is a function");
                    self.prepare_allocation();
                    let closure = self.heap.new_closure(function);
                    self.stack.push(Value::Obj(closure));

                    let upvalue_count = self.heap.as_function(function).upvalue_count;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frame().base;
                            self.capture_upvalue(base + index)
                        } else {
                            self.current_closure_upvalue(index)
                        };
                        self.heap.as_closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("return without frame");
                    self.close_upvalues(frame.base);

                    if self.frames.is_empty() {
                        // Pop the script closure; execution is complete.
                        self.pop();
                        return Ok(());
                    }

                    self.stack.truncate(frame.base);
                    self.stack.push(result);
                }
            }
        }
    }

    // === Calls ===

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), InterpretError> {
        let target = match callee {
            Value::Obj(r) => match &self.heap.get(r).kind {
                ObjKind::Closure(_) => Some(Callee::Closure(r)),
                ObjKind::Native(native) => Some(Callee::Native(native.function)),
                _ => None,
            },
            _ => None,
        };

        match target {
            Some(Callee::Closure(closure)) => self.call(closure, arg_count),
            Some(Callee::Native(function)) => {
                let start = self.stack.len() - arg_count;
                let args: Vec<Value> = self.stack[start..].to_vec();
                match function(&mut self.heap, &args) {
                    Ok(result) => {
                        // The callee and its arguments all pop together.
                        self.stack.truncate(start - 1);
                        self.stack.push(result);
                        Ok(())
                    }
                    Err(message) => Err(self.runtime_error(&message)),
                }
            }
            None => Err(self.runtime_error("Can only call functions.")),
        }
    }

    fn call(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), InterpretError> {
        let arity = self.heap.as_function(self.heap.as_closure(closure).function).arity;
        if arg_count != arity {
            let message = format!("Expected {} arguments but got {}.", arity, arg_count);
            return Err(self.runtime_error(&message));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }

        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    // === Upvalues ===

    /// Finds or creates the open upvalue watching `slot`. The descending
    /// sort of the list makes the walk stop at the first slot below the
    /// target, so reuse and insertion share one pass.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut cursor = self.open_upvalues;
        while let Some(r) = cursor {
            let upvalue = self.heap.as_upvalue(r);
            let open_slot = upvalue.open_slot().expect("closed upvalue in open list");
            if open_slot == slot {
                return r;
            }
            if open_slot < slot {
                break;
            }
            prev = Some(r);
            cursor = upvalue.next;
        }

        self.prepare_allocation();
        // The new upvalue is linked in immediately, which also makes it
        // reachable before any later allocation can collect.
        let created = self.heap.new_upvalue(slot, cursor);
        match prev {
            Some(prev) => self.heap.as_upvalue_mut(prev).next = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Closes every open upvalue watching slot `last` or above: the current
    /// stack value moves into the upvalue, which leaves the open list.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(r) = self.open_upvalues {
            let upvalue = self.heap.as_upvalue(r);
            let Some(slot) = upvalue.open_slot() else { break };
            if slot < last {
                break;
            }
            let next = upvalue.next;
            let value = self.stack[slot];
            let upvalue = self.heap.as_upvalue_mut(r);
            upvalue.state = UpvalueState::Closed(value);
            upvalue.next = None;
            self.open_upvalues = next;
        }
    }

    fn current_closure_upvalue(&self, index: usize) -> ObjRef {
        let closure = self.heap.as_closure(self.frame().closure);
        closure.upvalues[index]
    }

    // === Arithmetic ===

    fn binary_number_op(&mut self, op: OpCode) -> Result<(), InterpretError> {
        let (Some(b), Some(a)) = (self.peek(0).as_number(), self.peek(1).as_number()) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Greater => Value::Bool(a > b),
            OpCode::Less => Value::Bool(a < b),
            OpCode::Subtract => Value::Number(a - b),
            OpCode::Multiply => Value::Number(a * b),
            OpCode::Divide => Value::Number(a / b),
            _ => unreachable!(),
        };
        self.stack.push(result);
        Ok(())
    }

    fn add(&mut self) -> Result<(), InterpretError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.stack.push(Value::Number(a + b));
                Ok(())
            }
            (Value::Obj(a), Value::Obj(b)) if self.both_strings(a, b) => {
                // Concatenate while the operands are still on the stack, so
                // a collection here cannot reap them.
                let mut combined =
                    String::with_capacity(self.heap.string(a).len() + self.heap.string(b).len());
                combined.push_str(self.heap.string(a));
                combined.push_str(self.heap.string(b));
                self.prepare_allocation();
                let result = self.heap.take_string(combined);
                self.pop();
                self.pop();
                self.stack.push(Value::Obj(result));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    fn both_strings(&self, a: ObjRef, b: ObjRef) -> bool {
        matches!(self.heap.get(a).kind, ObjKind::String(_))
            && matches!(self.heap.get(b).kind, ObjKind::String(_))
    }

    // === Stack and frame plumbing ===

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn chunk(&self) -> &Chunk {
        let closure = self.heap.as_closure(self.frame().closure);
        &self.heap.as_function(closure.function).chunk
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.frame().ip;
        let byte = self.chunk().code[ip];
        self.frame_mut().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        u16::from_be_bytes([self.read_byte(), self.read_byte()])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.chunk().constants[index]
    }

    fn read_string(&mut self) -> ObjRef {
        self.read_constant().as_obj().expect("name constant is a string")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    /// Reports a runtime error with a frame-by-frame backtrace, resets the
    /// stack, and hands back the error for the caller to propagate.
    fn runtime_error(&mut self, message: &str) -> InterpretError {
        eprintln!("{}", message.red());
        for frame in self.frames.iter().rev() {
            let closure = self.heap.as_closure(frame.closure);
            let function = self.heap.as_function(closure.function);
            // The ip already advanced past the failing instruction.
            let line = function.chunk.line(frame.ip.saturating_sub(1));
            match function.name {
                Some(name) => eprintln!("[line {}] in {}()", line, self.heap.string(name)),
                None => eprintln!("[line {}] in script", line),
            }
        }
        self.reset_stack();
        InterpretError::Runtime
    }

    // === Garbage collection ===

    /// Gives the collector a chance to run before a runtime allocation.
    fn prepare_allocation(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Marks the VM's roots, then lets the heap trace, purge dead interned
    /// strings, and sweep.
    fn collect_garbage(&mut self) {
        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        let mut cursor = self.open_upvalues;
        while let Some(r) = cursor {
            self.heap.mark_object(r);
            cursor = self.heap.as_upvalue(r).next;
        }
        for (key, value) in self.globals.iter() {
            self.heap.mark_object(key);
            self.heap.mark_value(value);
        }

        self.heap.collect();
    }

    fn trace_instruction(&self) {
        eprint!("          ");
        for &value in &self.stack {
            eprint!("[ {} ]", format_value(value, &self.heap));
        }
        eprintln!();
        debug::disassemble_instruction(self.chunk(), self.frame().ip, &self.heap);
    }
}
