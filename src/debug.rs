//! Deterministic bytecode disassembler, used by the debug features and the
//! compile-stability tests.

use crate::chunk::{Chunk, OpCode};
use crate::value::{as_function, is_function, value_to_string};

pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut output = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.len() {
        let (text, next) = disassemble_instruction(chunk, offset);
        output.push_str(&text);
        output.push('\n');
        offset = next;
    }
    output
}

/// Render one instruction; returns the text and the next offset.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = format!("{:04} ", offset);
    if offset > 0 && chunk.line_for(offset) == chunk.line_for(offset - 1) {
        text.push_str("   | ");
    } else {
        text.push_str(&format!("{:4} ", chunk.line_for(offset)));
    }

    let op = match OpCode::from_byte(chunk.read(offset)) {
        Some(op) => op,
        None => {
            text.push_str(&format!("Unknown opcode {}", chunk.read(offset)));
            return (text, offset + 1);
        }
    };

    match op {
        OpCode::Constant | OpCode::GetGlobal | OpCode::SetGlobal | OpCode::DefineGlobal
        | OpCode::GetField | OpCode::SetField | OpCode::NewClass | OpCode::DefMethod => {
            let index = chunk.read_u16(offset + 1) as usize;
            let constant = chunk.get_constant(index);
            text.push_str(&format!(
                "{:<16} {:4} '{}'",
                op,
                index,
                value_to_string(constant)
            ));
            (text, offset + 3)
        }
        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue
        | OpCode::Call | OpCode::BuildList | OpCode::BuildTuple => {
            let operand = chunk.read(offset + 1);
            text.push_str(&format!("{:<16} {:4}", op, operand));
            (text, offset + 2)
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
            let distance = chunk.read_u16(offset + 1) as usize;
            text.push_str(&format!(
                "{:<16} {:4} -> {}",
                op,
                offset,
                offset + 3 + distance
            ));
            (text, offset + 3)
        }
        OpCode::Loop => {
            let distance = chunk.read_u16(offset + 1) as usize;
            text.push_str(&format!(
                "{:<16} {:4} -> {}",
                op,
                offset,
                offset + 3 - distance
            ));
            (text, offset + 3)
        }
        OpCode::Invoke | OpCode::SuperInvoke => {
            let index = chunk.read_u16(offset + 1) as usize;
            let argc = chunk.read(offset + 3);
            let constant = chunk.get_constant(index);
            text.push_str(&format!(
                "{:<16} ({} args) {:4} '{}'",
                op,
                argc,
                index,
                value_to_string(constant)
            ));
            (text, offset + 4)
        }
        OpCode::SetupTry => {
            let except_off = chunk.read_u16(offset + 1) as usize;
            let ensure_off = chunk.read_u16(offset + 3) as usize;
            let base = offset + 5;
            text.push_str(&format!(
                "{:<16} except -> {} ensure -> {}",
                op,
                if except_off > 0 { base + except_off } else { 0 },
                if ensure_off > 0 { base + ensure_off } else { 0 }
            ));
            (text, offset + 5)
        }
        OpCode::Import => {
            let module = chunk.read_u16(offset + 1) as usize;
            let binding = chunk.read_u16(offset + 3) as usize;
            text.push_str(&format!(
                "{:<16} '{}' as '{}'",
                op,
                value_to_string(chunk.get_constant(module)),
                value_to_string(chunk.get_constant(binding))
            ));
            (text, offset + 5)
        }
        OpCode::MakeClosure => {
            let index = chunk.read_u16(offset + 1) as usize;
            let constant = chunk.get_constant(index);
            text.push_str(&format!(
                "{:<16} {:4} '{}'",
                op,
                index,
                value_to_string(constant)
            ));
            let mut next = offset + 3;
            if is_function(constant) {
                let upvalue_count = unsafe { (*as_function(constant)).upvalue_count };
                for _ in 0..upvalue_count {
                    let is_local = chunk.read(next) == 1;
                    let slot = chunk.read(next + 1);
                    text.push_str(&format!(
                        "\n{:04}    |                  {} {}",
                        next,
                        if is_local { "local" } else { "upvalue" },
                        slot
                    ));
                    next += 2;
                }
            }
            (text, next)
        }
        _ => {
            text.push_str(&format!("{}", op));
            (text, offset + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::make_number_value;

    #[test]
    fn renders_simple_instructions() {
        let mut chunk = Chunk::new();
        let index = chunk.add_constant(make_number_value(1.5)).unwrap();
        chunk.write(OpCode::Constant.to_byte(), 1);
        chunk.write_u16(index as u16, 1);
        chunk.write(OpCode::Return.to_byte(), 1);
        let listing = disassemble_chunk(&chunk, "test");
        assert!(listing.starts_with("== test ==\n"));
        assert!(listing.contains("Constant"));
        assert!(listing.contains("'1.5'"));
        assert!(listing.contains("Return"));
    }

    #[test]
    fn is_deterministic() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Null.to_byte(), 1);
        chunk.write(OpCode::Return.to_byte(), 2);
        let first = disassemble_chunk(&chunk, "x");
        let second = disassemble_chunk(&chunk, "x");
        assert_eq!(first, second);
    }
}
