// File: src/debug.rs
//
// Bytecode disassembler. Used by the execution tracer (CINDER_TRACE_EXEC)
// and handy from tests when a chunk does something surprising. Listings go
// to stderr so they never mix with program output.

use crate::bytecode::{Chunk, OpCode};
use crate::memory::Heap;
use crate::object::ObjKind;
use crate::value::{format_value, Value};

pub fn disassemble_chunk(chunk: &Chunk, name: &str, heap: &Heap) {
    eprintln!("== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, heap);
    }
}

/// Prints one instruction and returns the offset of the next one.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    eprint!("{:04} ", offset);
    if offset > 0 && chunk.line(offset) == chunk.line(offset - 1) {
        eprint!("   | ");
    } else {
        eprint!("{:4} ", chunk.line(offset));
    }

    let op = match OpCode::try_from(chunk.code[offset]) {
        Ok(op) => op,
        Err(_) => {
            eprintln!("Unknown opcode {}", chunk.code[offset]);
            return offset + 1;
        }
    };

    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal => constant_instruction(op, chunk, offset, heap),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(op, chunk, offset),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(op, 1, chunk, offset),
        OpCode::Loop => jump_instruction(op, -1, chunk, offset),
        OpCode::Closure => closure_instruction(chunk, offset, heap),
        _ => {
            eprintln!("{:?}", op);
            offset + 1
        }
    }
}

fn constant_instruction(op: OpCode, chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    let index = chunk.code[offset + 1];
    let value = chunk.constants[index as usize];
    eprintln!("{:<16} {:4} '{}'", format!("{:?}", op), index, format_value(value, heap));
    offset + 2
}

fn byte_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    eprintln!("{:<16} {:4}", format!("{:?}", op), slot);
    offset + 2
}

fn jump_instruction(op: OpCode, sign: i64, chunk: &Chunk, offset: usize) -> usize {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]) as i64;
    let target = offset as i64 + 3 + sign * jump;
    eprintln!("{:<16} {:4} -> {}", format!("{:?}", op), offset, target);
    offset + 3
}

/// Closure instructions trail a variable number of capture descriptors, two
/// bytes per upvalue of the wrapped function.
fn closure_instruction(chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    let mut offset = offset + 1;
    let index = chunk.code[offset];
    offset += 1;
    let value = chunk.constants[index as usize];
    eprintln!("{:<16} {:4} {}", "Closure", index, format_value(value, heap));

    let upvalue_count = match value {
        Value::Obj(r) => match &heap.get(r).kind {
            ObjKind::Function(f) => f.upvalue_count,
            _ => 0,
        },
        _ => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let up_index = chunk.code[offset + 1];
        eprintln!(
            "{:04}    |                   {} {}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" },
            up_index
        );
        offset += 2;
    }
    offset
}
