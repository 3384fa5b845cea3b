//! Expression parsing and emission — the Pratt rules.

use crate::compiler::compiler::{Compiler, VariableAccess};
use crate::compiler::precedence::{infix_precedence, Precedence};
use crate::lexer::TokenKind;
use crate::vm::chunk::Constant;
use crate::vm::opcode::Op;

impl Compiler<'_, '_> {
    pub(crate) fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Consume a prefix expression, then keep consuming infix operators
    /// whose precedence is at least `precedence`.
    pub(crate) fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix_rule(can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    /// Dispatch on the token in prefix position. Returns false when the
    /// token starts no expression.
    fn prefix_rule(&mut self, can_assign: bool) -> bool {
        match self.previous.kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::StringLiteral => self.string(),
            TokenKind::Nil => {
                self.emit(Op::Nil);
            }
            TokenKind::True => {
                self.emit(Op::True);
            }
            TokenKind::False => {
                self.emit(Op::False);
            }
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_(),
            TokenKind::Super => self.super_(),
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, can_assign: bool) {
        match self.previous.kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::Percent
            | TokenKind::EqualEqual
            | TokenKind::BangEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.binary(),
            TokenKind::And => self.and_(),
            TokenKind::Or => self.or_(),
            TokenKind::LeftParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            _ => unreachable!("no infix rule for {:?}", self.previous.kind),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit(Op::Negate),
            TokenKind::Bang => self.emit(Op::Not),
            _ => unreachable!(),
        };
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(infix_precedence(operator).next());
        match operator {
            TokenKind::Plus => {
                self.emit(Op::Add);
            }
            TokenKind::Minus => {
                self.emit(Op::Subtract);
            }
            TokenKind::Star => {
                self.emit(Op::Multiply);
            }
            TokenKind::Slash => {
                self.emit(Op::Divide);
            }
            TokenKind::Percent => {
                self.emit(Op::Modulo);
            }
            TokenKind::EqualEqual => {
                self.emit(Op::Equal);
            }
            TokenKind::BangEqual => {
                self.emit(Op::Equal);
                self.emit(Op::Not);
            }
            TokenKind::Greater => {
                self.emit(Op::Greater);
            }
            TokenKind::GreaterEqual => {
                self.emit(Op::Less);
                self.emit(Op::Not);
            }
            TokenKind::Less => {
                self.emit(Op::Less);
            }
            TokenKind::LessEqual => {
                self.emit(Op::Greater);
                self.emit(Op::Not);
            }
            _ => unreachable!(),
        }
    }

    fn number(&mut self) {
        match self.previous.lexeme.parse::<f64>() {
            Ok(n) => self.emit_constant(Constant::Number(n)),
            Err(_) => self.error("Invalid number."),
        }
    }

    fn string(&mut self) {
        // The lexeme includes the surrounding quotes.
        let lexeme = &self.previous.lexeme;
        let content = lexeme[1..lexeme.len() - 1].to_string();
        let interned = self.interner.intern(&content);
        self.emit_constant(Constant::String(interned));
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    /// Emit access to a named variable. In assignment position this also
    /// handles `=`, the compound forms `+=`/`-=`, and `++`/`--`.
    pub(crate) fn named_variable(&mut self, name: &str, can_assign: bool) {
        let (get_op, set_op) = match self.resolve_variable(name) {
            VariableAccess::Local(slot) => (Op::GetLocal(slot), Op::SetLocal(slot)),
            VariableAccess::Upvalue(index) => (Op::GetUpvalue(index), Op::SetUpvalue(index)),
            VariableAccess::Global(idx) => (Op::GetGlobal(idx), Op::SetGlobal(idx)),
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit(set_op);
        } else if can_assign && self.matches(TokenKind::PlusEqual) {
            self.emit(get_op);
            self.expression();
            self.emit(Op::Add);
            self.emit(set_op);
        } else if can_assign && self.matches(TokenKind::MinusEqual) {
            self.emit(get_op);
            self.expression();
            self.emit(Op::Subtract);
            self.emit(set_op);
        } else if can_assign && self.matches(TokenKind::PlusPlus) {
            self.emit(get_op);
            self.emit_constant(Constant::Number(1.0));
            self.emit(Op::Add);
            self.emit(set_op);
        } else if can_assign && self.matches(TokenKind::MinusMinus) {
            self.emit(get_op);
            self.emit_constant(Constant::Number(1.0));
            self.emit(Op::Subtract);
            self.emit(set_op);
        } else {
            self.emit(get_op);
        }
    }

    /// 和 short-circuits: if the left side is falsy the right side is not
    /// evaluated and the left value is the result.
    fn and_(&mut self) {
        let end_jump = self.emit_jump(Op::JumpIfFalse(0));
        self.emit(Op::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    /// 或 short-circuits on a truthy left side.
    fn or_(&mut self) {
        let else_jump = self.emit_jump(Op::JumpIfFalse(0));
        let end_jump = self.emit_jump(Op::Jump(0));
        self.patch_jump(else_jump);
        self.emit(Op::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit(Op::Call(argc));
    }

    pub(crate) fn argument_list(&mut self) -> u8 {
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    argc += 1;
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc
    }

    /// Property access; fuses the read-then-call pattern into Invoke.
    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.clone();
        let name_idx = self.identifier_constant(&name);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit(Op::SetProperty(name_idx));
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit(Op::Invoke(name_idx, argc));
        } else {
            self.emit(Op::GetProperty(name_idx));
        }
    }

    fn this_(&mut self) {
        if self.class_context.is_none() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("这", false);
    }

    fn super_(&mut self) {
        match self.class_context.as_ref().map(|ctx| ctx.has_superclass) {
            None => self.error("Can't use 'super' outside of a class."),
            Some(false) => self.error("Can't use 'super' in a class with no superclass."),
            Some(true) => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.clone();
        let name_idx = self.identifier_constant(&name);

        self.named_variable("这", false);
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("超", false);
            self.emit(Op::SuperInvoke(name_idx, argc));
        } else {
            self.named_variable("超", false);
            self.emit(Op::GetSuper(name_idx));
        }
    }
}
