//! Bytecode disassembler for debug output.

use crate::vm::chunk::{Chunk, Constant, FunctionProto};
use crate::vm::opcode::Op;

/// Disassemble a function prototype to a human-readable string, recursing
/// into nested function constants.
pub fn disassemble(proto: &FunctionProto) -> String {
    let mut out = String::new();
    let name = match &proto.name {
        Some(name) => name.as_ref(),
        None => "<script>",
    };
    out.push_str(&format!(
        "== {} (arity={}, upvalues={}) ==\n",
        name,
        proto.arity,
        proto.upvalues.len()
    ));
    disassemble_chunk(&proto.chunk, &mut out);

    for constant in &proto.chunk.constants {
        if let Constant::Function(nested) = constant {
            out.push('\n');
            out.push_str(&disassemble(nested));
        }
    }
    out
}

fn disassemble_chunk(chunk: &Chunk, out: &mut String) {
    for (offset, op) in chunk.code.iter().enumerate() {
        let line = chunk.lines.get(offset).copied().unwrap_or(0);
        let line_str = if offset > 0 && chunk.lines.get(offset - 1).copied() == Some(line) {
            "   |".to_string()
        } else {
            format!("{:4}", line)
        };
        out.push_str(&format!("{:04} {} ", offset, line_str));
        disassemble_op(op, chunk, out);
        out.push('\n');
    }
}

fn disassemble_op(op: &Op, chunk: &Chunk, out: &mut String) {
    match op {
        Op::Constant(idx) => {
            let constant = chunk.constants.get(*idx as usize);
            out.push_str(&format!("CONSTANT     {:>4} ({})", idx, format_constant(constant)));
        }
        Op::Nil => out.push_str("NIL"),
        Op::True => out.push_str("TRUE"),
        Op::False => out.push_str("FALSE"),
        Op::Pop => out.push_str("POP"),
        Op::GetLocal(slot) => out.push_str(&format!("GET_LOCAL    {:>4}", slot)),
        Op::SetLocal(slot) => out.push_str(&format!("SET_LOCAL    {:>4}", slot)),
        Op::GetGlobal(idx) => {
            out.push_str(&format!("GET_GLOBAL   {:>4} ({})", idx, constant_string(chunk, *idx)));
        }
        Op::DefineGlobal(idx) => {
            out.push_str(&format!("DEF_GLOBAL   {:>4} ({})", idx, constant_string(chunk, *idx)));
        }
        Op::SetGlobal(idx) => {
            out.push_str(&format!("SET_GLOBAL   {:>4} ({})", idx, constant_string(chunk, *idx)));
        }
        Op::GetUpvalue(idx) => out.push_str(&format!("GET_UPVALUE  {:>4}", idx)),
        Op::SetUpvalue(idx) => out.push_str(&format!("SET_UPVALUE  {:>4}", idx)),
        Op::GetProperty(idx) => {
            out.push_str(&format!("GET_PROPERTY {:>4} ({})", idx, constant_string(chunk, *idx)));
        }
        Op::SetProperty(idx) => {
            out.push_str(&format!("SET_PROPERTY {:>4} ({})", idx, constant_string(chunk, *idx)));
        }
        Op::GetSuper(idx) => {
            out.push_str(&format!("GET_SUPER    {:>4} ({})", idx, constant_string(chunk, *idx)));
        }
        Op::Equal => out.push_str("EQUAL"),
        Op::Greater => out.push_str("GREATER"),
        Op::Less => out.push_str("LESS"),
        Op::Add => out.push_str("ADD"),
        Op::Subtract => out.push_str("SUBTRACT"),
        Op::Multiply => out.push_str("MULTIPLY"),
        Op::Divide => out.push_str("DIVIDE"),
        Op::Modulo => out.push_str("MODULO"),
        Op::Negate => out.push_str("NEGATE"),
        Op::Not => out.push_str("NOT"),
        Op::Print => out.push_str("PRINT"),
        Op::Jump(offset) => out.push_str(&format!("JUMP         {:>4}", offset)),
        Op::JumpIfFalse(offset) => out.push_str(&format!("JUMP_IF_FALSE {:>3}", offset)),
        Op::Loop(offset) => out.push_str(&format!("LOOP         {:>4}", offset)),
        Op::Call(argc) => out.push_str(&format!("CALL         {:>4}", argc)),
        Op::Invoke(idx, argc) => {
            out.push_str(&format!(
                "INVOKE       {:>4} ({}) argc={}",
                idx,
                constant_string(chunk, *idx),
                argc
            ));
        }
        Op::SuperInvoke(idx, argc) => {
            out.push_str(&format!(
                "SUPER_INVOKE {:>4} ({}) argc={}",
                idx,
                constant_string(chunk, *idx),
                argc
            ));
        }
        Op::Closure(idx) => {
            let constant = chunk.constants.get(*idx as usize);
            out.push_str(&format!("CLOSURE      {:>4} ({})", idx, format_constant(constant)));
        }
        Op::CloseUpvalue => out.push_str("CLOSE_UPVALUE"),
        Op::Return => out.push_str("RETURN"),
        Op::Class(idx) => {
            out.push_str(&format!("CLASS        {:>4} ({})", idx, constant_string(chunk, *idx)));
        }
        Op::Inherit => out.push_str("INHERIT"),
        Op::Method(idx) => {
            out.push_str(&format!("METHOD       {:>4} ({})", idx, constant_string(chunk, *idx)));
        }
    }
}

fn constant_string(chunk: &Chunk, idx: u8) -> String {
    match chunk.constants.get(idx as usize) {
        Some(Constant::String(s)) => s.to_string(),
        _ => format!("?{}", idx),
    }
}

fn format_constant(constant: Option<&Constant>) -> String {
    match constant {
        Some(Constant::Number(n)) => format!("{}", n),
        Some(Constant::String(s)) => format!("\"{}\"", s),
        Some(Constant::Function(proto)) => match &proto.name {
            Some(name) => format!("<fn {}>", name),
            None => "<script>".to_string(),
        },
        None => "???".to_string(),
    }
}
