//! The bytecode virtual machine — stack-based execution engine.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::compiler::Compiler;
use crate::error::{QiError, RuntimeError};
use crate::vm::chunk::Constant;
use crate::vm::interner::Interner;
use crate::vm::opcode::Op;
use crate::vm::upvalue::{Closure, Upvalue};
use crate::vm::value::Value;

/// Maximum call depth.
pub const FRAMES_MAX: usize = 64;
/// Value stack capacity: one full window of local slots per frame.
pub const STACK_MAX: usize = FRAMES_MAX * (u8::MAX as usize + 1);

/// A call frame: one in-progress function invocation.
pub struct CallFrame {
    /// The closure being executed.
    pub closure: Rc<Closure>,
    /// Instruction pointer (index into the chunk's code).
    pub ip: usize,
    /// Base index into the value stack for this frame's slot 0.
    pub stack_base: usize,
}

/// The VM. Owns all runtime state; dropping it releases every object.
pub struct Vm {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) globals: HashMap<Rc<str>, Value>,
    pub(crate) strings: Interner,
    /// Open upvalues, sorted by stack slot ascending. Closing everything at
    /// or above a slot walks the suffix only.
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    /// Everything printed so far, one entry per print. Mirrors stdout so
    /// tests and embedders can observe program output.
    pub output: Vec<String>,
    started: Instant,
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Self {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: HashMap::new(),
            strings: Interner::new(),
            open_upvalues: Vec::new(),
            output: Vec::new(),
            started: Instant::now(),
        };
        vm.install_natives();
        vm
    }

    /// Compile and execute a complete program. Globals persist across
    /// calls, so a REPL can feed one line at a time.
    pub fn interpret(&mut self, source: &str) -> Result<(), QiError> {
        let proto = Compiler::compile(source, &mut self.strings)?;
        let closure = Rc::new(Closure::new(proto, Vec::new()));
        self.push(Value::Closure(closure.clone()));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            stack_base: 0,
        });

        self.run().map_err(|err| {
            self.reset();
            QiError::Runtime(err)
        })
    }

    /// The fetch-decode-execute loop. Returns when the top-level frame
    /// returns; the value stack is empty at that point.
    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let frame_idx = self.frames.len() - 1;
            let ip = self.frames[frame_idx].ip;
            let op = self.frames[frame_idx].closure.proto.chunk.code[ip];
            self.frames[frame_idx].ip += 1;

            match op {
                Op::Constant(idx) => {
                    let value = self.read_constant(frame_idx, idx);
                    self.push(value);
                }
                Op::Nil => self.push(Value::Nil),
                Op::True => self.push(Value::Bool(true)),
                Op::False => self.push(Value::Bool(false)),

                Op::Pop => {
                    self.pop();
                }

                Op::GetLocal(slot) => {
                    let base = self.frames[frame_idx].stack_base;
                    let value = self.stack[base + slot as usize].clone();
                    self.push(value);
                }
                Op::SetLocal(slot) => {
                    let value = self.peek(0).clone();
                    let base = self.frames[frame_idx].stack_base;
                    self.stack[base + slot as usize] = value;
                }
                Op::GetGlobal(idx) => {
                    let name = self.read_string_constant(frame_idx, idx);
                    match self.globals.get(&name).cloned() {
                        Some(value) => self.push(value),
                        None => {
                            return Err(
                                self.runtime_error(format!("Undefined variable '{}'.", name))
                            );
                        }
                    }
                }
                Op::DefineGlobal(idx) => {
                    let name = self.read_string_constant(frame_idx, idx);
                    let value = self.pop();
                    self.globals.insert(name, value);
                }
                Op::SetGlobal(idx) => {
                    let name = self.read_string_constant(frame_idx, idx);
                    if !self.globals.contains_key(&name) {
                        return Err(self.runtime_error(format!("Undefined variable '{}'.", name)));
                    }
                    let value = self.peek(0).clone();
                    self.globals.insert(name, value);
                }

                Op::GetUpvalue(idx) => {
                    let value = {
                        let upvalue = &self.frames[frame_idx].closure.upvalues[idx as usize];
                        match &*upvalue.borrow() {
                            Upvalue::Open(slot) => self.stack[*slot].clone(),
                            Upvalue::Closed(value) => value.clone(),
                        }
                    };
                    self.push(value);
                }
                Op::SetUpvalue(idx) => {
                    let value = self.peek(0).clone();
                    let upvalue = self.frames[frame_idx].closure.upvalues[idx as usize].clone();
                    let mut cell = upvalue.borrow_mut();
                    match &mut *cell {
                        Upvalue::Open(slot) => self.stack[*slot] = value,
                        Upvalue::Closed(stored) => *stored = value,
                    }
                }
                Op::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                Op::GetProperty(idx) => {
                    let name = self.read_string_constant(frame_idx, idx);
                    self.get_property(name)?;
                }
                Op::SetProperty(idx) => {
                    let name = self.read_string_constant(frame_idx, idx);
                    self.set_property(name)?;
                }
                Op::GetSuper(idx) => {
                    let name = self.read_string_constant(frame_idx, idx);
                    let Value::Class(superclass) = self.pop() else {
                        return Err(self.runtime_error("Superclass must be a class.".to_string()));
                    };
                    self.bind_method(&superclass, &name)?;
                }

                Op::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Op::Greater => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Bool(a > b));
                }
                Op::Less => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Bool(a < b));
                }

                Op::Add => {
                    let b = self.pop();
                    let a = self.pop();
                    match (&a, &b) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.push(Value::Number(a + b));
                        }
                        (Value::Str(a), Value::Str(b)) => {
                            let joined = format!("{}{}", a, b);
                            let interned = self.strings.intern(&joined);
                            self.push(Value::Str(interned));
                        }
                        _ => {
                            return Err(self.runtime_error(
                                "Operands must be two numbers or two strings.".to_string(),
                            ));
                        }
                    }
                }
                Op::Subtract => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Number(a - b));
                }
                Op::Multiply => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Number(a * b));
                }
                Op::Divide => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Number(a / b));
                }
                Op::Modulo => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Number(a % b));
                }
                Op::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.runtime_error("Operand must be a number.".to_string()));
                    };
                    let n = -n;
                    self.pop();
                    self.push(Value::Number(n));
                }
                Op::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(!value.is_truthy()));
                }

                Op::Print => {
                    let value = self.pop();
                    let text = value.to_string();
                    println!("{}", text);
                    self.output.push(text);
                }

                Op::Jump(offset) => {
                    self.frames[frame_idx].ip += offset as usize;
                }
                Op::JumpIfFalse(offset) => {
                    if !self.peek(0).is_truthy() {
                        self.frames[frame_idx].ip += offset as usize;
                    }
                }
                Op::Loop(offset) => {
                    self.frames[frame_idx].ip -= offset as usize;
                }

                Op::Call(argc) => {
                    self.call_value(argc as usize)?;
                }
                Op::Invoke(name_idx, argc) => {
                    let name = self.read_string_constant(frame_idx, name_idx);
                    self.invoke(name, argc as usize)?;
                }
                Op::SuperInvoke(name_idx, argc) => {
                    let name = self.read_string_constant(frame_idx, name_idx);
                    let Value::Class(superclass) = self.pop() else {
                        return Err(self.runtime_error("Superclass must be a class.".to_string()));
                    };
                    self.invoke_from_class(&superclass, &name, argc as usize)?;
                }
                Op::Closure(idx) => {
                    let constant =
                        self.frames[frame_idx].closure.proto.chunk.constants[idx as usize].clone();
                    if let Constant::Function(proto) = constant {
                        let mut upvalues = Vec::with_capacity(proto.upvalues.len());
                        for descriptor in &proto.upvalues {
                            let upvalue = if descriptor.is_local {
                                let slot = self.frames[frame_idx].stack_base
                                    + descriptor.index as usize;
                                self.capture_upvalue(slot)
                            } else {
                                self.frames[frame_idx].closure.upvalues
                                    [descriptor.index as usize]
                                    .clone()
                            };
                            upvalues.push(upvalue);
                        }
                        self.push(Value::Closure(Rc::new(Closure::new(proto, upvalues))));
                    }
                }
                Op::Return => {
                    let result = self.pop();
                    let frame = match self.frames.pop() {
                        Some(frame) => frame,
                        None => return Ok(()),
                    };
                    self.close_upvalues(frame.stack_base);
                    self.stack.truncate(frame.stack_base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result);
                }

                Op::Class(idx) => {
                    let name = self.read_string_constant(frame_idx, idx);
                    self.push(Value::Class(Rc::new(crate::vm::value::Class::new(name))));
                }
                Op::Inherit => {
                    self.inherit()?;
                }
                Op::Method(idx) => {
                    let name = self.read_string_constant(frame_idx, idx);
                    self.define_method(name);
                }
            }
        }
    }

    // --- Stack operations ---

    #[inline]
    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    #[inline]
    pub(crate) fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn pop_number_operands(&mut self) -> Result<(f64, f64), RuntimeError> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return Err(self.runtime_error("Operands must be numbers.".to_string()));
        };
        let pair = (*a, *b);
        self.pop();
        self.pop();
        Ok(pair)
    }

    // --- Constants ---

    fn read_constant(&mut self, frame_idx: usize, idx: u8) -> Value {
        match &self.frames[frame_idx].closure.proto.chunk.constants[idx as usize] {
            Constant::Number(n) => Value::Number(*n),
            Constant::String(s) => Value::Str(s.clone()),
            Constant::Function(proto) => {
                // Bare function constants only exist behind Closure ops, but
                // wrap one defensively if it surfaces.
                Value::Closure(Rc::new(Closure::new(proto.clone(), Vec::new())))
            }
        }
    }

    pub(crate) fn read_string_constant(&self, frame_idx: usize, idx: u8) -> Rc<str> {
        match &self.frames[frame_idx].closure.proto.chunk.constants[idx as usize] {
            Constant::String(s) => s.clone(),
            _ => Rc::from(""),
        }
    }

    // --- Upvalues ---

    /// Find or create the open upvalue for `slot`, keeping the open list
    /// sorted by slot.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        let insert_at = self
            .open_upvalues
            .partition_point(|uv| matches!(&*uv.borrow(), Upvalue::Open(s) if *s < slot));
        if let Some(existing) = self.open_upvalues.get(insert_at) {
            if matches!(&*existing.borrow(), Upvalue::Open(s) if *s == slot) {
                return existing.clone();
            }
        }
        let created = Rc::new(RefCell::new(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created.clone());
        created
    }

    /// Close every open upvalue at or above `from_slot`, moving the values
    /// off the stack and into the cells.
    pub(crate) fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(last) = self.open_upvalues.last() {
            let slot = match &*last.borrow() {
                Upvalue::Open(slot) if *slot >= from_slot => *slot,
                _ => break,
            };
            let value = self.stack[slot].clone();
            if let Some(upvalue) = self.open_upvalues.pop() {
                *upvalue.borrow_mut() = Upvalue::Closed(value);
            }
        }
    }

    // --- Errors ---

    /// Build a runtime error carrying the message and a stack trace,
    /// innermost frame first.
    pub(crate) fn runtime_error(&self, message: String) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let proto = &frame.closure.proto;
            let line = proto
                .chunk
                .lines
                .get(frame.ip.saturating_sub(1))
                .copied()
                .unwrap_or(0);
            match &proto.name {
                Some(name) => trace.push(format!("[line {}] in {}()", line, name)),
                None => trace.push(format!("[line {}] in script", line)),
            }
        }
        RuntimeError { message, trace }
    }

    /// Clear all transient state after a runtime error. Globals and the
    /// intern pool survive.
    pub(crate) fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    pub(crate) fn start_time(&self) -> Instant {
        self.started
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(source: &str) -> Vec<String> {
        let mut vm = Vm::new();
        if let Err(err) = vm.interpret(source) {
            panic!("program failed: {}", err);
        }
        assert!(vm.stack.is_empty(), "stack not empty after OK return");
        vm.output
    }

    fn run_err(source: &str) -> String {
        let mut vm = Vm::new();
        match vm.interpret(source) {
            Ok(()) => panic!("expected an error"),
            Err(err) => err.to_string(),
        }
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run_ok("变量 甲 = 1 + 2; 打印 甲;"), vec!["3"]);
        assert_eq!(run_ok("打印 2 + 3 * 4;"), vec!["14"]);
        assert_eq!(run_ok("打印 (2 + 3) * 4;"), vec!["20"]);
        assert_eq!(run_ok("打印 7 % 3;"), vec!["1"]);
        assert_eq!(run_ok("打印 -5 + 2;"), vec!["-3"]);
        assert_eq!(run_ok("打印 1 / 2;"), vec!["0.5"]);
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(run_ok("打印 2 大 1;"), vec!["true"]);
        assert_eq!(run_ok("打印 2 小等 2;"), vec!["true"]);
        assert_eq!(run_ok("打印 1 不等 2;"), vec!["true"]);
        assert_eq!(run_ok("打印 1 等 2;"), vec!["false"]);
        assert_eq!(run_ok("打印 不 真;"), vec!["false"]);
        // 和/或 return the deciding operand, not a boolean.
        assert_eq!(run_ok("打印 真 和 \"甲\";"), vec!["甲"]);
        assert_eq!(run_ok("打印 假 或 3;"), vec!["3"]);
        assert_eq!(run_ok("打印 空 和 1;"), vec!["nil"]);
    }

    #[test]
    fn test_string_concatenation_is_interned() {
        assert_eq!(run_ok("打印 \"你\" + \"好\";"), vec!["你好"]);
        // Identity equality still holds for a concatenated result.
        assert_eq!(run_ok("打印 (\"你\" + \"好\") 等 \"你好\";"), vec!["true"]);
    }

    #[test]
    fn test_global_and_local_scopes() {
        assert_eq!(
            run_ok("变量 甲 = \"外\"; { 变量 甲 = \"内\"; 打印 甲; } 打印 甲;"),
            vec!["内", "外"]
        );
    }

    #[test]
    fn test_compound_assignment() {
        assert_eq!(
            run_ok("变量 甲 = 1; 甲 += 2; 打印 甲; 甲 -= 1; 打印 甲; 甲++; 打印 甲; 甲--; 打印 甲;"),
            vec!["3", "2", "3", "2"]
        );
    }

    #[test]
    fn test_function_returns_string() {
        assert_eq!(run_ok("功能 f() { 返回 \"你好\"; } 打印 f();"), vec!["你好"]);
    }

    #[test]
    fn test_recursion() {
        assert_eq!(
            run_ok(
                "功能 斐(n) { 如果 (n 小 2) 返回 n; 返回 斐(n - 1) + 斐(n - 2); } 打印 斐(10);"
            ),
            vec!["55"]
        );
    }

    #[test]
    fn test_counter_closure() {
        let output = run_ok(
            "功能 造计数器() {
                 变量 数 = 0;
                 功能 增() { 数 = 数 + 1; 返回 数; }
                 返回 增;
             }
             变量 计 = 造计数器();
             打印 计();
             打印 计();
             打印 计();",
        );
        assert_eq!(output, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_closures_share_one_upvalue() {
        // Both closures capture the same slot; mutation through one is seen
        // by the other, before and after the defining scope exits.
        let output = run_ok(
            "变量 加; 变量 看;
             功能 外() {
                 变量 x = 0;
                 功能 a() { x = x + 1; }
                 功能 b() { 打印 x; }
                 加 = a; 看 = b;
             }
             外();
             加(); 加();
             看();",
        );
        assert_eq!(output, vec!["2"]);
    }

    #[test]
    fn test_while_and_break() {
        assert_eq!(
            run_ok("变量 i = 0; 而 (真) { i++; 如果 (i 大 2) 打断; } 打印 i;"),
            vec!["3"]
        );
    }

    #[test]
    fn test_for_with_continue() {
        assert_eq!(
            run_ok("对于 (变量 i = 0; i 小 3; i++) { 如果 (i 等 1) 继续; 打印 i; }"),
            vec!["0", "2"]
        );
    }

    #[test]
    fn test_for_full_width_punctuation() {
        assert_eq!(
            run_ok("对于 （变量 i = 0； i 小 2； i++） 「 打印 i； 」"),
            vec!["0", "1"]
        );
    }

    #[test]
    fn test_switch() {
        let source = "切换 (2) {
             案例 1: 打印 \"一\";
             案例 2: 打印 \"二\";
             预设: 打印 \"其他\";
         }";
        assert_eq!(run_ok(source), vec!["二"]);
        assert_eq!(run_ok(&source.replace("(2)", "(9)")), vec!["其他"]);
        assert_eq!(run_ok(&source.replace("(2)", "(1)")), vec!["一"]);
    }

    #[test]
    fn test_classes_fields_methods_this() {
        let output = run_ok(
            "类 点 『
                 初始化(x, y) { 这.x = x; 这.y = y; }
                 和() { 返回 这.x + 这.y; }
             』
             变量 p = 点(3, 4);
             打印 p.x;
             打印 p.和();",
        );
        assert_eq!(output, vec!["3", "7"]);
    }

    #[test]
    fn test_bound_method_keeps_receiver() {
        let output = run_ok(
            "类 点 『
                 初始化(x, y) { 这.x = x; 这.y = y; }
                 和() { 返回 这.x + 这.y; }
             』
             变量 m = 点(3, 4).和;
             打印 m();",
        );
        assert_eq!(output, vec!["7"]);
    }

    #[test]
    fn test_inheritance_and_super() {
        let output = run_ok(
            "类 A 『 问候() { 打印 \"A\"; } 』
             类 B < A 『 问候() { 超.问候(); 打印 \"B\"; } 』
             B().问候();",
        );
        assert_eq!(output, vec!["A", "B"]);
    }

    #[test]
    fn test_inherited_method_without_override() {
        let output = run_ok(
            "类 A 『 问候() { 打印 \"甲\"; } 』
             类 B < A 『 』
             B().问候();",
        );
        assert_eq!(output, vec!["甲"]);
    }

    #[test]
    fn test_inherit_copies_methods_at_declaration_time() {
        // Re-binding the superclass name later must not change the subclass.
        let output = run_ok(
            "类 A 『 方法() { 打印 \"旧\"; } 』
             类 D < A 『 』
             类 A 『 方法() { 打印 \"新\"; } 』
             D().方法();",
        );
        assert_eq!(output, vec!["旧"]);
    }

    #[test]
    fn test_field_shadows_method_in_invoke() {
        let output = run_ok(
            "功能 号() { 返回 9; }
             类 盒 『 取() { 返回 1; } 』
             变量 b = 盒();
             b.取 = 号;
             打印 b.取();",
        );
        assert_eq!(output, vec!["9"]);
    }

    #[test]
    fn test_globals_persist_across_interpret_calls() {
        let mut vm = Vm::new();
        vm.interpret("变量 甲 = 1;").unwrap();
        vm.interpret("打印 甲;").unwrap();
        assert_eq!(vm.output, vec!["1"]);
    }

    #[test]
    fn test_clock_native() {
        assert_eq!(run_ok("打印 clock() 大等 0;"), vec!["true"]);
    }

    #[test]
    fn test_undefined_global_error() {
        let message = run_err("未定义();");
        assert!(message.contains("Undefined variable '未定义'."), "{}", message);
        assert!(message.contains("[line 1] in script"), "{}", message);
    }

    #[test]
    fn test_type_error_with_trace() {
        let message = run_err("功能 f() { 返回 1 + \"x\"; } f();");
        assert!(
            message.contains("Operands must be two numbers or two strings."),
            "{}",
            message
        );
        assert!(message.contains("in f()"), "{}", message);
        assert!(message.contains("in script"), "{}", message);
    }

    #[test]
    fn test_arity_error() {
        let message = run_err("功能 f(甲) { } f();");
        assert!(message.contains("Expected 1 arguments but got 0."), "{}", message);
    }

    #[test]
    fn test_not_callable_error() {
        let message = run_err("变量 甲 = 1; 甲();");
        assert!(message.contains("Can only call functions and classes."), "{}", message);
    }

    #[test]
    fn test_stack_overflow() {
        let message = run_err("功能 f() { f(); } f();");
        assert!(message.contains("Stack overflow."), "{}", message);
    }

    #[test]
    fn test_property_on_non_instance() {
        let message = run_err("变量 甲 = 1; 打印 甲.乙;");
        assert!(message.contains("Only instances have properties."), "{}", message);
    }

    #[test]
    fn test_undefined_property() {
        let message = run_err("类 空盒 『 』 打印 空盒().没有;");
        assert!(message.contains("Undefined property '没有'."), "{}", message);
    }

    #[test]
    fn test_class_without_initializer_rejects_arguments() {
        let message = run_err("类 空盒 『 』 空盒(1);");
        assert!(message.contains("Expected 0 arguments but got 1."), "{}", message);
    }

    #[test]
    fn test_closure_captures_two_locals() {
        let output = run_ok(
            "功能 外() {
                 变量 a = 1;
                 变量 b = 2;
                 功能 内() { 返回 a + b; }
                 返回 内;
             }
             打印 外()();",
        );
        assert_eq!(output, vec!["3"]);
    }

    #[test]
    fn test_dropping_the_vm_releases_objects() {
        let weak;
        {
            let mut vm = Vm::new();
            vm.interpret("变量 甲 = \"常驻\";").unwrap();
            let interned = vm.strings.intern("常驻");
            weak = Rc::downgrade(&interned);
            drop(interned);
            // The global still holds the string.
            assert!(weak.upgrade().is_some());
        }
        // Dropping the VM released everything it owned.
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_vm_state_cleared_after_runtime_error() {
        let mut vm = Vm::new();
        assert!(vm.interpret("变量 甲 = 1 + \"x\";").is_err());
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        // The VM stays usable.
        vm.interpret("打印 2;").unwrap();
        assert_eq!(vm.output, vec!["2"]);
    }
}
