// Debug-only bytecode printer, gated by the RUFF_PRINT_CODE /
// RUFF_TRACE_EXECUTION env vars rather than wired into normal execution.
// Grounded on original_source/Loxcpp/Debug.cpp's disassembleChunk /
// disassembleInstruction (one line per instruction, byte offset + source
// line + mnemonic + operands).

use crate::chunk::{Chunk, OpCode};

pub fn disassemble(chunk: &Chunk, name: &str) {
    eprintln!("== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    eprint!("{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        eprint!("   | ");
    } else {
        eprint!("{:4} ", chunk.lines[offset]);
    }

    let Some(op) = OpCode::from_u8(chunk.code[offset]) else {
        eprintln!("unknown opcode {}", chunk.code[offset]);
        return offset + 1;
    };

    use OpCode::*;
    match op {
        Constant => constant_instruction("OP_CONSTANT", chunk, offset, false),
        ConstantLong => constant_instruction("OP_CONSTANT_LONG", chunk, offset, true),
        GetGlobal => constant_instruction("OP_GET_GLOBAL", chunk, offset, false),
        GetGlobalLong => constant_instruction("OP_GET_GLOBAL_LONG", chunk, offset, true),
        DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", chunk, offset, false),
        DefineGlobalLong => constant_instruction("OP_DEFINE_GLOBAL_LONG", chunk, offset, true),
        SetGlobal => constant_instruction("OP_SET_GLOBAL", chunk, offset, false),
        SetGlobalLong => constant_instruction("OP_SET_GLOBAL_LONG", chunk, offset, true),
        GetProperty => constant_instruction("OP_GET_PROPERTY", chunk, offset, false),
        GetPropertyLong => constant_instruction("OP_GET_PROPERTY_LONG", chunk, offset, true),
        SetProperty => constant_instruction("OP_SET_PROPERTY", chunk, offset, false),
        SetPropertyLong => constant_instruction("OP_SET_PROPERTY_LONG", chunk, offset, true),
        Class => constant_instruction("OP_CLASS", chunk, offset, false),
        ClassLong => constant_instruction("OP_CLASS_LONG", chunk, offset, true),
        Method => constant_instruction("OP_METHOD", chunk, offset, false),
        MethodLong => constant_instruction("OP_METHOD_LONG", chunk, offset, true),

        GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset, false),
        GetLocalLong => byte_instruction("OP_GET_LOCAL_LONG", chunk, offset, true),
        SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset, false),
        SetLocalLong => byte_instruction("OP_SET_LOCAL_LONG", chunk, offset, true),
        GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset, false),
        SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset, false),
        Call => byte_instruction("OP_CALL", chunk, offset, false),

        Invoke => invoke_instruction("OP_INVOKE", chunk, offset, false),
        InvokeLong => invoke_instruction("OP_INVOKE_LONG", chunk, offset, true),

        Jump => jump_instruction("OP_JUMP", 1, chunk, offset),
        JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset),
        Loop => jump_instruction("OP_LOOP", -1, chunk, offset),

        Closure | ClosureLong => closure_instruction(op, chunk, offset),

        Nil => simple_instruction("OP_NIL", offset),
        True => simple_instruction("OP_TRUE", offset),
        False => simple_instruction("OP_FALSE", offset),
        Pop => simple_instruction("OP_POP", offset),
        Equal => simple_instruction("OP_EQUAL", offset),
        Greater => simple_instruction("OP_GREATER", offset),
        Less => simple_instruction("OP_LESS", offset),
        Match => simple_instruction("OP_MATCH", offset),
        Add => simple_instruction("OP_ADD", offset),
        Subtract => simple_instruction("OP_SUBTRACT", offset),
        Multiply => simple_instruction("OP_MULTIPLY", offset),
        Divide => simple_instruction("OP_DIVIDE", offset),
        Modulo => simple_instruction("OP_MODULO", offset),
        Negate => simple_instruction("OP_NEGATE", offset),
        Increment => simple_instruction("OP_INCREMENT", offset),
        Not => simple_instruction("OP_NOT", offset),
        BuildRange => simple_instruction("OP_BUILD_RANGE", offset),
        BuildList => byte_instruction("OP_BUILD_LIST", chunk, offset, false),
        IndexSubscr => simple_instruction("OP_INDEX_SUBSCR", offset),
        StoreSubscr => simple_instruction("OP_STORE_SUBSCR", offset),
        Print => simple_instruction("OP_PRINT", offset),
        CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset),
        Return => simple_instruction("OP_RETURN", offset),
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    eprintln!("{name}");
    offset + 1
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize, long: bool) -> usize {
    if long {
        let index = chunk.read_u32(offset + 1) as usize;
        eprintln!("{name:<20} {index:4} '{}'", chunk.constants[index]);
        offset + 5
    } else {
        let index = chunk.code[offset + 1] as usize;
        eprintln!("{name:<20} {index:4} '{}'", chunk.constants[index]);
        offset + 2
    }
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize, long: bool) -> usize {
    if long {
        let slot = chunk.read_u32(offset + 1);
        eprintln!("{name:<20} {slot:4}");
        offset + 5
    } else {
        let slot = chunk.code[offset + 1];
        eprintln!("{name:<20} {slot:4}");
        offset + 2
    }
}

fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize, long: bool) -> usize {
    if long {
        let index = chunk.read_u32(offset + 1) as usize;
        let argc = chunk.code[offset + 5];
        eprintln!("{name:<20} ({argc} args) {index:4} '{}'", chunk.constants[index]);
        offset + 6
    } else {
        let index = chunk.code[offset + 1] as usize;
        let argc = chunk.code[offset + 2];
        eprintln!("{name:<20} ({argc} args) {index:4} '{}'", chunk.constants[index]);
        offset + 3
    }
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let jump = chunk.read_u16(offset + 1) as i32;
    let target = offset as i32 + 3 + sign * jump;
    eprintln!("{name:<20} {offset:4} -> {target}");
    offset + 3
}

fn closure_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let long = op == OpCode::ClosureLong;
    let (index, mut cursor) = if long {
        (chunk.read_u32(offset + 1) as usize, offset + 5)
    } else {
        (chunk.code[offset + 1] as usize, offset + 2)
    };
    let name = if long { "OP_CLOSURE_LONG" } else { "OP_CLOSURE" };
    eprintln!("{name:<20} {index:4} '{}'", chunk.constants[index]);

    let upvalue_count = match &chunk.constants[index] {
        crate::value::Value::Obj(f) => f.as_function().upvalue_count,
        _ => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[cursor];
        let up_index = chunk.code[cursor + 1];
        eprintln!(
            "{:04}      |                     {} {}",
            cursor,
            if is_local != 0 { "local" } else { "upvalue" },
            up_index
        );
        cursor += 2;
    }
    cursor
}
