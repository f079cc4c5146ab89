//! Feature-gated tracing: a bytecode disassembler (`debug-bytecode`) and a
//! per-instruction stack/execution tracer (`debug-execution`), mirroring
//! clox's own `debug.c` since the teacher's AST dumper has no equivalent
//! once compilation skips the AST entirely.

use super::chunk::{Chunk, OpCode};
use super::value::Value;

#[cfg(feature = "debug-bytecode")]
pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {name} ==");
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

#[cfg(not(feature = "debug-bytecode"))]
pub fn disassemble_chunk(_chunk: &Chunk, _name: &str) {}

#[cfg(feature = "debug-execution")]
pub fn trace_execution(stack: &[Value], chunk: &Chunk, ip: usize) {
    print!("          ");
    for value in stack {
        print!("[ {value} ]");
    }
    println!();
    disassemble_instruction(chunk, ip);
}

#[cfg(not(feature = "debug-execution"))]
pub fn trace_execution(_stack: &[Value], _chunk: &Chunk, _ip: usize) {}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{offset:04} ");
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.line_at(offset));
    }

    let op = match OpCode::from_u8(chunk.code()[offset]) {
        Some(op) => op,
        None => {
            println!("Unknown opcode {}", chunk.code()[offset]);
            return offset + 1;
        }
    };

    match op {
        OpCode::Constant => constant_instr("OP_CONSTANT", chunk, offset),
        OpCode::Nil => simple_instr("OP_NIL", offset),
        OpCode::True => simple_instr("OP_TRUE", offset),
        OpCode::False => simple_instr("OP_FALSE", offset),
        OpCode::Pop => simple_instr("OP_POP", offset),
        OpCode::GetLocal => byte_instr("OP_GET_LOCAL", chunk, offset),
        OpCode::SetLocal => byte_instr("OP_SET_LOCAL", chunk, offset),
        OpCode::GetGlobal => constant_instr("OP_GET_GLOBAL", chunk, offset),
        OpCode::DefineGlobal => constant_instr("OP_DEFINE_GLOBAL", chunk, offset),
        OpCode::SetGlobal => constant_instr("OP_SET_GLOBAL", chunk, offset),
        OpCode::GetUpvalue => byte_instr("OP_GET_UPVALUE", chunk, offset),
        OpCode::SetUpvalue => byte_instr("OP_SET_UPVALUE", chunk, offset),
        OpCode::GetProperty => constant_instr("OP_GET_PROPERTY", chunk, offset),
        OpCode::SetProperty => constant_instr("OP_SET_PROPERTY", chunk, offset),
        OpCode::GetSuper => constant_instr("OP_GET_SUPER", chunk, offset),
        OpCode::Equal => simple_instr("OP_EQUAL", offset),
        OpCode::Greater => simple_instr("OP_GREATER", offset),
        OpCode::Less => simple_instr("OP_LESS", offset),
        OpCode::Add => simple_instr("OP_ADD", offset),
        OpCode::Subtract => simple_instr("OP_SUBTRACT", offset),
        OpCode::Multiply => simple_instr("OP_MULTIPLY", offset),
        OpCode::Divide => simple_instr("OP_DIVIDE", offset),
        OpCode::Not => simple_instr("OP_NOT", offset),
        OpCode::Negate => simple_instr("OP_NEGATE", offset),
        OpCode::Print => simple_instr("OP_PRINT", offset),
        OpCode::Jump => jump_instr("OP_JUMP", 1, chunk, offset),
        OpCode::JumpIfFalse => jump_instr("OP_JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::Loop => jump_instr("OP_LOOP", -1, chunk, offset),
        OpCode::Call => byte_instr("OP_CALL", chunk, offset),
        OpCode::Invoke => invoke_instr("OP_INVOKE", chunk, offset),
        OpCode::SuperInvoke => invoke_instr("OP_SUPER_INVOKE", chunk, offset),
        OpCode::Closure => closure_instr(chunk, offset),
        OpCode::CloseUpvalue => simple_instr("OP_CLOSE_UPVALUE", offset),
        OpCode::Return => simple_instr("OP_RETURN", offset),
        OpCode::Class => constant_instr("OP_CLASS", chunk, offset),
        OpCode::Inherit => simple_instr("OP_INHERIT", offset),
        OpCode::Method => constant_instr("OP_METHOD", chunk, offset),
    }
}

fn simple_instr(name: &str, offset: usize) -> usize {
    println!("{name}");
    offset + 1
}

fn byte_instr(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code()[offset + 1];
    println!("{name:-16} {slot:4}");
    offset + 2
}

fn jump_instr(name: &str, sign: i64, chunk: &Chunk, offset: usize) -> usize {
    let hi = chunk.code()[offset + 1] as u16;
    let lo = chunk.code()[offset + 2] as u16;
    let jump = (hi << 8) | lo;
    let target = offset as i64 + 3 + sign * jump as i64;
    println!("{name:-16} {offset:4} -> {target}");
    offset + 3
}

fn constant_instr(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let idx = chunk.code()[offset + 1];
    println!("{name:-16} {idx:4} '{}'", chunk.constant(idx));
    offset + 2
}

fn invoke_instr(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let idx = chunk.code()[offset + 1];
    let argc = chunk.code()[offset + 2];
    println!("{name:-16} ({argc} args) {idx:4} '{}'", chunk.constant(idx));
    offset + 3
}

fn closure_instr(chunk: &Chunk, offset: usize) -> usize {
    let mut offset = offset + 1;
    let idx = chunk.code()[offset];
    offset += 1;
    println!("{:-16} {idx:4} '{}'", "OP_CLOSURE", chunk.constant(idx));
    if let Value::Obj(obj) = chunk.constant(idx) {
        let function = obj.as_function();
        for _ in 0..function.upvalue_count {
            let is_local = chunk.code()[offset];
            let index = chunk.code()[offset + 1];
            println!(
                "{:04}      |                     {} {}",
                offset,
                if is_local != 0 { "local" } else { "upvalue" },
                index
            );
            offset += 2;
        }
    }
    offset
}
