//! Compiler tests: emitted bytecode shape and static error reporting.

use std::rc::Rc;

use crate::compiler::Compiler;
use crate::vm::chunk::{Constant, FunctionProto};
use crate::vm::disassembler::disassemble;
use crate::vm::interner::Interner;
use crate::vm::opcode::Op;

fn compile(source: &str) -> Rc<FunctionProto> {
    let mut interner = Interner::new();
    match Compiler::compile(source, &mut interner) {
        Ok(proto) => proto,
        Err(err) => panic!("compile failed: {}", err),
    }
}

fn compile_err(source: &str) -> String {
    let mut interner = Interner::new();
    match Compiler::compile(source, &mut interner) {
        Ok(_) => panic!("expected a compile error"),
        Err(err) => err.to_string(),
    }
}

#[test]
fn test_script_ends_with_nil_return() {
    let proto = compile("1;");
    let code = &proto.chunk.code;
    assert_eq!(&code[code.len() - 2..], &[Op::Nil, Op::Return]);
}

#[test]
fn test_print_compiles_to_dedicated_opcode() {
    let proto = compile("打印 1;");
    assert!(proto.chunk.code.contains(&Op::Print));
}

#[test]
fn test_global_var_uses_define_global() {
    let proto = compile("变量 甲 = 1;");
    assert!(matches!(proto.chunk.code[1], Op::DefineGlobal(_)));
}

#[test]
fn test_local_var_uses_slots() {
    let proto = compile("{ 变量 甲 = 1; 打印 甲; }");
    assert!(proto.chunk.code.contains(&Op::GetLocal(1)));
    assert!(!proto
        .chunk
        .code
        .iter()
        .any(|op| matches!(op, Op::GetGlobal(_))));
}

#[test]
fn test_comparison_operators_desugar() {
    // 大等 is Less + Not; 小等 is Greater + Not; 不等 is Equal + Not.
    let proto = compile("1 大等 2;");
    assert!(proto.chunk.code.windows(2).any(|w| w == [Op::Less, Op::Not]));
    let proto = compile("1 小等 2;");
    assert!(proto.chunk.code.windows(2).any(|w| w == [Op::Greater, Op::Not]));
    let proto = compile("1 不等 2;");
    assert!(proto.chunk.code.windows(2).any(|w| w == [Op::Equal, Op::Not]));
}

#[test]
fn test_jump_patching_lands_after_then_branch() {
    let proto = compile("如果 (真) 打印 1;");
    let code = &proto.chunk.code;
    let jump_at = code
        .iter()
        .position(|op| matches!(op, Op::JumpIfFalse(_)))
        .expect("no conditional jump emitted");
    let Op::JumpIfFalse(distance) = code[jump_at] else {
        unreachable!();
    };
    // The patched jump must land inside the chunk, past the then-branch.
    let target = jump_at + 1 + distance as usize;
    assert!(target < code.len());
    assert!(matches!(code[target], Op::Pop));
}

#[test]
fn test_loop_jumps_backward() {
    let proto = compile("而 (假) { }");
    assert!(proto
        .chunk
        .code
        .iter()
        .any(|op| matches!(op, Op::Loop(_))));
}

#[test]
fn test_function_constant_and_closure() {
    let proto = compile("功能 f(甲, 乙) { 返回 甲 + 乙; }");
    assert!(proto.chunk.code.iter().any(|op| matches!(op, Op::Closure(_))));
    let nested = proto
        .chunk
        .constants
        .iter()
        .find_map(|c| match c {
            Constant::Function(f) => Some(f.clone()),
            _ => None,
        })
        .expect("no function constant");
    assert_eq!(nested.arity, 2);
    assert_eq!(nested.name.as_deref(), Some("f"));
}

#[test]
fn test_upvalue_descriptors() {
    let proto = compile(
        "功能 外() {
             变量 x = 1;
             功能 内() { 返回 x; }
             返回 内;
         }",
    );
    let outer = proto
        .chunk
        .constants
        .iter()
        .find_map(|c| match c {
            Constant::Function(f) => Some(f.clone()),
            _ => None,
        })
        .expect("no outer function");
    let inner = outer
        .chunk
        .constants
        .iter()
        .find_map(|c| match c {
            Constant::Function(f) => Some(f.clone()),
            _ => None,
        })
        .expect("no inner function");
    assert_eq!(inner.upvalues.len(), 1);
    assert!(inner.upvalues[0].is_local);
}

#[test]
fn test_captured_block_local_closes_on_scope_exit() {
    // A captured local in a block scope is closed (not popped) at the
    // closing brace; function-body locals close at return instead.
    let proto = compile(
        "{
             变量 x = 1;
             功能 f() { 返回 x; }
             打印 f();
         }",
    );
    assert!(proto.chunk.code.contains(&Op::CloseUpvalue));
}

#[test]
fn test_class_emits_inherit_and_methods() {
    let proto = compile(
        "类 A 『 方法() { } 』
         类 B < A 『 方法() { 超.方法(); } 』",
    );
    let text = disassemble(&proto);
    assert!(text.contains("CLASS"));
    assert!(text.contains("INHERIT"));
    assert!(text.contains("METHOD"));
    assert!(text.contains("SUPER_INVOKE"));
}

#[test]
fn test_method_call_fuses_to_invoke() {
    let proto = compile("变量 甲 = 1; 甲.乙();");
    assert!(proto
        .chunk
        .code
        .iter()
        .any(|op| matches!(op, Op::Invoke(_, _))));
}

#[test]
fn test_error_format_and_line() {
    let message = compile_err("变量;");
    assert_eq!(message, "[line 1] Error at ';': Expect variable name.");
}

#[test]
fn test_error_at_end() {
    let message = compile_err("打印 1");
    assert!(message.contains("[line 1] Error at end: Expect ';' after value."), "{}", message);
}

#[test]
fn test_return_at_top_level() {
    let message = compile_err("返回;");
    assert!(
        message.contains("Error at '返回': Can't return from top-level code."),
        "{}",
        message
    );
}

#[test]
fn test_return_value_from_initializer() {
    let message = compile_err("类 A 『 初始化() { 返回 1; } 』");
    assert!(message.contains("Can't return a value from an initializer."), "{}", message);
}

#[test]
fn test_invalid_assignment_target() {
    let message = compile_err("1 = 2;");
    assert!(message.contains("Invalid assignment target."), "{}", message);
}

#[test]
fn test_this_outside_class() {
    let message = compile_err("打印 这;");
    assert!(message.contains("Can't use 'this' outside of a class."), "{}", message);
}

#[test]
fn test_super_outside_class() {
    let message = compile_err("超.甲();");
    assert!(message.contains("Can't use 'super' outside of a class."), "{}", message);
}

#[test]
fn test_super_without_superclass() {
    let message = compile_err("类 A 『 m() { 超.m(); } 』");
    assert!(
        message.contains("Can't use 'super' in a class with no superclass."),
        "{}",
        message
    );
}

#[test]
fn test_class_inheriting_from_itself() {
    let message = compile_err("类 A < A 『 』");
    assert!(message.contains("A class can't inherit from itself."), "{}", message);
}

#[test]
fn test_duplicate_local() {
    let message = compile_err("{ 变量 甲 = 1; 变量 甲 = 2; }");
    assert!(
        message.contains("Already a variable with this name in this scope."),
        "{}",
        message
    );
}

#[test]
fn test_local_in_own_initializer() {
    let message = compile_err("{ 变量 甲 = 甲; }");
    assert!(
        message.contains("Can't read local variable in its own initializer."),
        "{}",
        message
    );
}

#[test]
fn test_break_outside_loop() {
    let message = compile_err("打断;");
    assert!(message.contains("Can't use 'break' outside of a loop."), "{}", message);
}

#[test]
fn test_continue_outside_loop() {
    let message = compile_err("继续;");
    assert!(message.contains("Can't use 'continue' outside of a loop."), "{}", message);
}

#[test]
fn test_too_many_constants() {
    let mut source = String::new();
    for i in 0..300 {
        source.push_str(&format!("打印 {};", i));
    }
    let message = compile_err(&source);
    assert!(message.contains("Too many constants in one chunk."), "{}", message);
}

#[test]
fn test_too_many_arguments() {
    let mut source = String::from("功能 f() { } f(");
    for _ in 0..256 {
        source.push_str("1,");
    }
    source.push_str("1);");
    let message = compile_err(&source);
    assert!(message.contains("Can't have more than 255 arguments."), "{}", message);
}

#[test]
fn test_too_many_locals() {
    let mut source = String::from("{ ");
    for i in 0..300 {
        source.push_str(&format!("变量 名{} = 0;", i));
    }
    source.push_str(" }");
    let message = compile_err(&source);
    assert!(message.contains("Too many local variables in function."), "{}", message);
}

#[test]
fn test_panic_mode_recovers_at_statement_boundary() {
    // Both statements are bad; recovery must surface both diagnostics.
    let message = compile_err("变量; 返回;");
    assert!(message.contains("Expect variable name."), "{}", message);
    assert!(message.contains("Can't return from top-level code."), "{}", message);
}

#[test]
fn test_errors_discard_the_chunk() {
    let mut interner = Interner::new();
    assert!(Compiler::compile("变量 甲 = ;", &mut interner).is_err());
}
