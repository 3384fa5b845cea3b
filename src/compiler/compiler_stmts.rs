//! Declaration and statement parsing.

use std::rc::Rc;

use crate::compiler::compiler::{Compiler, FunctionType};
use crate::lexer::TokenKind;
use crate::vm::chunk::Constant;
use crate::vm::opcode::Op;

impl Compiler<'_, '_> {
    pub(crate) fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.in_panic_mode() {
            self.synchronize();
        }
    }

    pub(crate) fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Switch) {
            self.switch_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(Op::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        let name = self.interner.intern(&self.previous.lexeme);
        // A function may refer to itself, so it counts as initialized
        // before its body compiles.
        self.mark_initialized();
        self.function(FunctionType::Function, name);
        self.define_variable(global);
    }

    /// Compile a function body into a nested prototype and emit the closure
    /// that wraps it.
    pub(crate) fn function(&mut self, function_type: FunctionType, name: Rc<str>) {
        self.start_function(function_type, Some(name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.state.proto.arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.state.proto.arity += 1;
                }
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: the whole frame is discarded on return.
        let proto = self.finish_function();
        let idx = self.make_constant(Constant::Function(Rc::new(proto)));
        self.emit(Op::Closure(idx));
    }

    pub(crate) fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit(Op::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit(Op::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Op::JumpIfFalse(0));
        self.emit(Op::Pop);
        self.statement();
        let else_jump = self.emit_jump(Op::Jump(0));

        self.patch_jump(then_jump);
        self.emit(Op::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn return_statement(&mut self) {
        if self.state.function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.state.function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit(Op::Return);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_offset();
        self.begin_loop(loop_start);

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Op::JumpIfFalse(0));
        self.emit(Op::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(Op::Pop);
        self.end_loop();
    }

    /// 对于 desugars onto the existing jump/loop opcodes: initializer,
    /// condition check, body, then the increment clause wired in so 继续
    /// lands on it.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_offset();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse(0)));
            self.emit(Op::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Op::Jump(0));
            let increment_start = self.current_offset();
            self.expression();
            self.emit(Op::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(Op::Pop);
        }
        self.end_loop();
        self.end_scope();
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        if self.state.loop_context.is_none() {
            self.error("Can't use 'break' outside of a loop.");
            return;
        }
        self.discard_loop_locals();
        let jump = self.emit_jump(Op::Jump(0));
        if let Some(ctx) = self.state.loop_context.as_mut() {
            ctx.break_patches.push(jump);
        }
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        let Some(start) = self.state.loop_context.as_ref().map(|ctx| ctx.start) else {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        };
        self.discard_loop_locals();
        self.emit_loop(start);
    }

    /// 切换 compiles as a cascade of equality tests against a hidden local
    /// holding the subject. A matched case body jumps to the end; 预设 runs
    /// only when nothing matched.
    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch value.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch cases.");

        self.begin_scope();
        self.add_hidden_local("");
        let subject_slot = (self.state.locals.len() - 1) as u8;

        let mut end_jumps = Vec::new();
        let mut saw_default = false;

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.matches(TokenKind::Case) {
                if saw_default {
                    self.error("Can't have a case after the default clause.");
                }
                self.emit(Op::GetLocal(subject_slot));
                self.expression();
                self.emit(Op::Equal);
                self.consume(TokenKind::Colon, "Expect ':' after case value.");

                let miss_jump = self.emit_jump(Op::JumpIfFalse(0));
                self.emit(Op::Pop);
                self.case_body();
                end_jumps.push(self.emit_jump(Op::Jump(0)));

                self.patch_jump(miss_jump);
                self.emit(Op::Pop);
            } else if self.matches(TokenKind::Default) {
                if saw_default {
                    self.error("Can't have more than one default clause.");
                }
                saw_default = true;
                self.consume(TokenKind::Colon, "Expect ':' after 'default'.");
                self.case_body();
            } else {
                self.error_at_current("Expect 'case' or 'default' in switch body.");
                break;
            }
        }

        self.consume(TokenKind::RightBrace, "Expect '}' after switch cases.");
        for jump in end_jumps {
            self.patch_jump(jump);
        }
        self.end_scope();
    }

    fn case_body(&mut self) {
        while !self.check(TokenKind::Case)
            && !self.check(TokenKind::Default)
            && !self.check(TokenKind::RightBrace)
            && !self.check(TokenKind::Eof)
        {
            self.statement();
        }
    }
}
