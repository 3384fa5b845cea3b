//! Single-pass bytecode compiler: core state and shared machinery.
//!
//! There is no AST. The compiler pulls tokens from the scanner and emits
//! bytecode as it parses, resolving locals, upvalues, and class context on
//! the way. Per-function state stacks through an `enclosing` pointer, so
//! nested function and method bodies push and pop compiler states.
//!
//! Errors do not abort the parse: the compiler reports the diagnostic,
//! enters panic mode, and discards tokens until a statement boundary before
//! resuming. A compilation with any recorded error yields no chunk.

use std::rc::Rc;

use crate::error::{CompileErrors, Diagnostic, Location};
use crate::lexer::{Scanner, Token, TokenKind};
use crate::vm::chunk::{Constant, FunctionProto};
use crate::vm::interner::Interner;
use crate::vm::opcode::Op;
use crate::vm::upvalue::UpvalueDescriptor;

pub const MAX_LOCALS: usize = u8::MAX as usize + 1;
pub const MAX_UPVALUES: usize = u8::MAX as usize + 1;

/// A local variable tracked during compilation. `depth == -1` marks a
/// variable that is declared but not yet initialized.
#[derive(Debug)]
pub struct Local {
    pub name: String,
    pub depth: i32,
    pub is_captured: bool,
}

/// What kind of function is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

/// Innermost-loop bookkeeping for 打断/继续.
#[derive(Debug)]
pub struct LoopContext {
    /// Backward target for 继续 (the condition, or the increment clause of
    /// a 对于 loop).
    pub start: usize,
    /// Forward jumps emitted by 打断, patched when the loop ends.
    pub break_patches: Vec<usize>,
    /// Scope depth at loop entry; locals deeper than this are popped before
    /// jumping out.
    pub depth: i32,
    pub enclosing: Option<Box<LoopContext>>,
}

/// Per-function compiler state. Slot 0 is reserved: it holds 这 in methods
/// and initializers, and is unnamed otherwise.
#[derive(Debug)]
pub struct FunctionState {
    pub proto: FunctionProto,
    pub function_type: FunctionType,
    pub locals: Vec<Local>,
    pub upvalues: Vec<UpvalueDescriptor>,
    pub scope_depth: i32,
    pub loop_context: Option<Box<LoopContext>>,
    pub enclosing: Option<Box<FunctionState>>,
}

impl FunctionState {
    pub fn new(function_type: FunctionType, name: Option<Rc<str>>) -> Self {
        let slot_zero = if matches!(
            function_type,
            FunctionType::Method | FunctionType::Initializer
        ) {
            "这"
        } else {
            ""
        };
        Self {
            proto: FunctionProto::new(name),
            function_type,
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loop_context: None,
            enclosing: None,
        }
    }

    /// Find `name` among this function's locals, innermost first.
    pub fn resolve_local(&self, name: &str) -> Result<Option<u8>, &'static str> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err("Can't read local variable in its own initializer.");
                }
                return Ok(Some(i as u8));
            }
        }
        Ok(None)
    }

    /// Find `name` in an enclosing function, capturing it as an upvalue
    /// here. Recursion marks the chain of intermediate functions.
    pub fn resolve_upvalue(&mut self, name: &str) -> Result<Option<u8>, &'static str> {
        let Some(mut enclosing) = self.enclosing.take() else {
            return Ok(None);
        };
        let resolved = Self::resolve_in_enclosing(&mut enclosing, name);
        self.enclosing = Some(enclosing);
        match resolved? {
            Some((index, is_local)) => self.add_upvalue(index, is_local).map(Some),
            None => Ok(None),
        }
    }

    fn resolve_in_enclosing(
        enclosing: &mut FunctionState,
        name: &str,
    ) -> Result<Option<(u8, bool)>, &'static str> {
        if let Some(slot) = enclosing.resolve_local(name)? {
            enclosing.locals[slot as usize].is_captured = true;
            return Ok(Some((slot, true)));
        }
        if let Some(index) = enclosing.resolve_upvalue(name)? {
            return Ok(Some((index, false)));
        }
        Ok(None)
    }

    /// Record an upvalue, reusing an existing entry for the same capture.
    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, &'static str> {
        let descriptor = UpvalueDescriptor { is_local, index };
        for (i, existing) in self.upvalues.iter().enumerate() {
            if *existing == descriptor {
                return Ok(i as u8);
            }
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        self.upvalues.push(descriptor);
        Ok((self.upvalues.len() - 1) as u8)
    }
}

/// Class-declaration state, stacked for nested class bodies.
#[derive(Debug)]
pub struct ClassContext {
    pub has_superclass: bool,
    pub enclosing: Option<Box<ClassContext>>,
}

/// How a resolved name is accessed at runtime.
pub enum VariableAccess {
    Local(u8),
    Upvalue(u8),
    Global(u8),
}

/// The compiler: parses tokens and emits bytecode in one pass.
pub struct Compiler<'src, 'i> {
    scanner: Scanner<'src>,
    pub(crate) interner: &'i mut Interner,
    pub(crate) current: Token,
    pub(crate) previous: Token,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<Diagnostic>,
    pub(crate) state: Box<FunctionState>,
    pub(crate) class_context: Option<Box<ClassContext>>,
}

impl<'src, 'i> Compiler<'src, 'i> {
    /// Compile a complete program into the top-level function.
    pub fn compile(
        source: &'src str,
        interner: &'i mut Interner,
    ) -> Result<Rc<FunctionProto>, CompileErrors> {
        let mut compiler = Compiler {
            scanner: Scanner::new(source),
            interner,
            current: Token::eof(1),
            previous: Token::eof(1),
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            state: Box::new(FunctionState::new(FunctionType::Script, None)),
            class_context: None,
        };

        compiler.advance();
        while !compiler.matches(TokenKind::Eof) {
            compiler.declaration();
        }
        compiler.emit_return();

        if compiler.had_error {
            return Err(CompileErrors(compiler.errors));
        }
        let mut proto = std::mem::replace(
            &mut compiler.state.proto,
            FunctionProto::new(None),
        );
        proto.upvalues = std::mem::take(&mut compiler.state.upvalues);
        Ok(Rc::new(proto))
    }

    // --- Token handling ---

    pub(crate) fn advance(&mut self) {
        loop {
            let next = self.scanner.scan_token();
            if next.kind != TokenKind::Error {
                self.previous = std::mem::replace(&mut self.current, next);
                return;
            }
            let (line, message) = (next.line, next.lexeme);
            self.report(line, Location::None, &message);
        }
    }

    pub(crate) fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    pub(crate) fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // --- Error reporting & recovery ---

    pub(crate) fn error(&mut self, message: &str) {
        let (line, location) = Self::describe(&self.previous);
        self.report(line, location, message);
    }

    pub(crate) fn error_at_current(&mut self, message: &str) {
        let (line, location) = Self::describe(&self.current);
        self.report(line, location, message);
    }

    fn describe(token: &Token) -> (usize, Location) {
        let location = match token.kind {
            TokenKind::Eof => Location::Eof,
            TokenKind::Error => Location::None,
            _ => Location::Lexeme(token.lexeme.clone()),
        };
        (token.line, location)
    }

    fn report(&mut self, line: usize, location: Location, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(Diagnostic {
            line,
            location,
            message: message.to_string(),
        });
    }

    /// Skip tokens until a statement boundary so one mistake does not
    /// cascade into a pile of bogus diagnostics.
    pub(crate) fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Switch
                | TokenKind::Break
                | TokenKind::Continue => return,
                _ => self.advance(),
            }
        }
    }

    pub(crate) fn in_panic_mode(&self) -> bool {
        self.panic_mode
    }

    // --- Emission helpers ---

    pub(crate) fn emit(&mut self, op: Op) -> usize {
        let line = self.previous.line;
        self.state.proto.chunk.emit(op, line)
    }

    pub(crate) fn emit_return(&mut self) {
        if self.state.function_type == FunctionType::Initializer {
            self.emit(Op::GetLocal(0));
        } else {
            self.emit(Op::Nil);
        }
        self.emit(Op::Return);
    }

    pub(crate) fn make_constant(&mut self, constant: Constant) -> u8 {
        match self.state.proto.chunk.add_constant(constant) {
            Some(idx) => idx,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    pub(crate) fn emit_constant(&mut self, constant: Constant) {
        let idx = self.make_constant(constant);
        self.emit(Op::Constant(idx));
    }

    /// Intern an identifier and stash it in the constant pool, for the
    /// opcodes that name globals, properties, and methods.
    pub(crate) fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.interner.intern(name);
        self.make_constant(Constant::String(interned))
    }

    pub(crate) fn emit_jump(&mut self, op: Op) -> usize {
        self.emit(op)
    }

    pub(crate) fn patch_jump(&mut self, offset: usize) {
        let distance = self.state.proto.chunk.len() - offset - 1;
        if distance > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        self.state.proto.chunk.patch_jump(offset, distance as u16);
    }

    pub(crate) fn emit_loop(&mut self, loop_start: usize) {
        let offset = self.state.proto.chunk.len() - loop_start + 1;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
            return;
        }
        self.emit(Op::Loop(offset as u16));
    }

    pub(crate) fn current_offset(&self) -> usize {
        self.state.proto.chunk.len()
    }

    // --- Scope management ---

    pub(crate) fn begin_scope(&mut self) {
        self.state.scope_depth += 1;
    }

    pub(crate) fn end_scope(&mut self) {
        self.state.scope_depth -= 1;
        while let Some(local) = self.state.locals.last() {
            if local.depth <= self.state.scope_depth {
                break;
            }
            if local.is_captured {
                self.emit(Op::CloseUpvalue);
            } else {
                self.emit(Op::Pop);
            }
            self.state.locals.pop();
        }
    }

    // --- Variables ---

    /// Declare the variable named by `previous` in the current scope.
    /// Globals are late-bound and need no declaration.
    pub(crate) fn declare_variable(&mut self) {
        if self.state.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.clone();
        let mut duplicate = false;
        for local in self.state.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.state.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    pub(crate) fn add_local(&mut self, name: String) {
        if self.state.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state.locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    /// Add an initialized local the program cannot name directly (the
    /// switch subject, the 超 binding).
    pub(crate) fn add_hidden_local(&mut self, name: &str) {
        if self.state.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state.locals.push(Local {
            name: name.to_string(),
            depth: self.state.scope_depth,
            is_captured: false,
        });
    }

    pub(crate) fn mark_initialized(&mut self) {
        if self.state.scope_depth == 0 {
            return;
        }
        if let Some(local) = self.state.locals.last_mut() {
            local.depth = self.state.scope_depth;
        }
    }

    /// Parse a variable name. Returns the constant-pool index of the name
    /// for globals, or 0 for locals (which are addressed by slot).
    pub(crate) fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.state.scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.clone();
        self.identifier_constant(&name)
    }

    pub(crate) fn define_variable(&mut self, global: u8) {
        if self.state.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(Op::DefineGlobal(global));
    }

    /// Resolve a name: local, then captured upvalue, then global.
    pub(crate) fn resolve_variable(&mut self, name: &str) -> VariableAccess {
        match self.state.resolve_local(name) {
            Ok(Some(slot)) => return VariableAccess::Local(slot),
            Ok(None) => {}
            Err(message) => {
                self.error(message);
                return VariableAccess::Local(0);
            }
        }
        match self.state.resolve_upvalue(name) {
            Ok(Some(index)) => return VariableAccess::Upvalue(index),
            Ok(None) => {}
            Err(message) => {
                self.error(message);
                return VariableAccess::Local(0);
            }
        }
        let idx = self.identifier_constant(name);
        VariableAccess::Global(idx)
    }

    // --- Function state stacking ---

    pub(crate) fn start_function(&mut self, function_type: FunctionType, name: Option<Rc<str>>) {
        let fresh = Box::new(FunctionState::new(function_type, name));
        let enclosing = std::mem::replace(&mut self.state, fresh);
        self.state.enclosing = Some(enclosing);
    }

    /// Finish the current function and restore the enclosing one. Returns
    /// the completed prototype.
    pub(crate) fn finish_function(&mut self) -> FunctionProto {
        self.emit_return();
        let enclosing = self
            .state
            .enclosing
            .take()
            .unwrap_or_else(|| Box::new(FunctionState::new(FunctionType::Script, None)));
        let finished = std::mem::replace(&mut self.state, enclosing);
        let mut proto = finished.proto;
        proto.upvalues = finished.upvalues;
        proto
    }

    // --- Loop context ---

    pub(crate) fn begin_loop(&mut self, start: usize) {
        let enclosing = self.state.loop_context.take();
        self.state.loop_context = Some(Box::new(LoopContext {
            start,
            break_patches: Vec::new(),
            depth: self.state.scope_depth,
            enclosing,
        }));
    }

    pub(crate) fn end_loop(&mut self) {
        if let Some(ctx) = self.state.loop_context.take() {
            for patch in &ctx.break_patches {
                self.patch_jump(*patch);
            }
            self.state.loop_context = ctx.enclosing;
        }
    }

    /// Emit pops for locals that live deeper than the innermost loop, so a
    /// jump out of the loop leaves the stack consistent.
    pub(crate) fn discard_loop_locals(&mut self) {
        let Some(ctx) = self.state.loop_context.as_ref() else {
            return;
        };
        let depth = ctx.depth;
        let mut ops = Vec::new();
        for local in self.state.locals.iter().rev() {
            if local.depth <= depth {
                break;
            }
            ops.push(if local.is_captured {
                Op::CloseUpvalue
            } else {
                Op::Pop
            });
        }
        for op in ops {
            self.emit(op);
        }
    }
}
