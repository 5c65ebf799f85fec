// Diagnostic disassembler, gated behind the `trace` feature the same way
// `rlox` gates its execution trace — a debugging aid, not part of the
// language surface (spec §2.5).

use crate::chunk::{Chunk, OpCode};

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.line_at(offset));
    }

    let op = OpCode::from_byte(chunk.read_byte(offset));
    match op {
        OpCode::Constant => constant_instruction("OP_CONSTANT", chunk, offset),
        OpCode::GetGlobal => constant_instruction("OP_GET_GLOBAL", chunk, offset),
        OpCode::DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", chunk, offset),
        OpCode::SetGlobal => constant_instruction("OP_SET_GLOBAL", chunk, offset),
        OpCode::GetProperty => constant_instruction("OP_GET_PROPERTY", chunk, offset),
        OpCode::SetProperty => constant_instruction("OP_SET_PROPERTY", chunk, offset),
        OpCode::GetSuper => constant_instruction("OP_GET_SUPER", chunk, offset),
        OpCode::Class => constant_instruction("OP_CLASS", chunk, offset),
        OpCode::Method => constant_instruction("OP_METHOD", chunk, offset),
        OpCode::Nil => simple_instruction("OP_NIL", offset),
        OpCode::True => simple_instruction("OP_TRUE", offset),
        OpCode::False => simple_instruction("OP_FALSE", offset),
        OpCode::Pop => simple_instruction("OP_POP", offset),
        OpCode::Equal => simple_instruction("OP_EQUAL", offset),
        OpCode::Greater => simple_instruction("OP_GREATER", offset),
        OpCode::Less => simple_instruction("OP_LESS", offset),
        OpCode::Add => simple_instruction("OP_ADD", offset),
        OpCode::Subtract => simple_instruction("OP_SUBTRACT", offset),
        OpCode::Multiply => simple_instruction("OP_MULTIPLY", offset),
        OpCode::Divide => simple_instruction("OP_DIVIDE", offset),
        OpCode::Not => simple_instruction("OP_NOT", offset),
        OpCode::Negate => simple_instruction("OP_NEGATE", offset),
        OpCode::Print => simple_instruction("OP_PRINT", offset),
        OpCode::CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset),
        OpCode::Return => simple_instruction("OP_RETURN", offset),
        OpCode::Inherit => simple_instruction("OP_INHERIT", offset),
        OpCode::GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset),
        OpCode::SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset),
        OpCode::GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset),
        OpCode::SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset),
        OpCode::Call => byte_instruction("OP_CALL", chunk, offset),
        OpCode::Jump => jump_instruction("OP_JUMP", 1, chunk, offset),
        OpCode::JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::Loop => jump_instruction("OP_LOOP", -1, chunk, offset),
        OpCode::Invoke => invoke_instruction("OP_INVOKE", chunk, offset),
        OpCode::SuperInvoke => invoke_instruction("OP_SUPER_INVOKE", chunk, offset),
        OpCode::Closure => closure_instruction(chunk, offset),
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{}", name);
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.read_byte(offset + 1);
    println!("{:<16} {:4}", name, slot);
    offset + 2
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let jump = chunk.read_short(offset + 1) as i32;
    let target = offset as i32 + 3 + sign * jump;
    println!("{:<16} {:4} -> {}", name, offset, target);
    offset + 3
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.read_byte(offset + 1);
    println!("{:<16} {:4} '{}'", name, index, chunk.constants[index as usize]);
    offset + 2
}

fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.read_byte(offset + 1);
    let arg_count = chunk.read_byte(offset + 2);
    println!(
        "{:<16} ({} args) {:4} '{}'",
        name, arg_count, index, chunk.constants[index as usize]
    );
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let mut offset = offset + 1;
    let index = chunk.read_byte(offset);
    offset += 1;
    println!("{:<16} {:4} '{}'", "OP_CLOSURE", index, chunk.constants[index as usize]);

    if let crate::value::Value::Obj(r) = chunk.constants[index as usize] {
        let upvalue_count = r.get().as_function().upvalue_count;
        for _ in 0..upvalue_count {
            let is_local = chunk.read_byte(offset) != 0;
            offset += 1;
            let upvalue_index = chunk.read_byte(offset);
            offset += 1;
            println!(
                "{:04}      |                     {} {}",
                offset - 2,
                if is_local { "local" } else { "upvalue" },
                upvalue_index
            );
        }
    }
    offset
}
