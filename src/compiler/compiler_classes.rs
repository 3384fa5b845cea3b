//! Class declaration compilation.

use crate::compiler::compiler::{ClassContext, Compiler, FunctionType};
use crate::lexer::TokenKind;
use crate::vm::opcode::Op;

/// Methods with this name are initializers: they run on instantiation and
/// always return the instance.
pub const INITIALIZER_NAME: &str = "初始化";

impl Compiler<'_, '_> {
    pub(crate) fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.clone();
        let name_idx = self.identifier_constant(&class_name);
        self.declare_variable();

        self.emit(Op::Class(name_idx));
        self.define_variable(name_idx);

        let enclosing = self.class_context.take();
        self.class_context = Some(Box::new(ClassContext {
            has_superclass: false,
            enclosing,
        }));

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass_name = self.previous.lexeme.clone();
            self.named_variable(&superclass_name, false);

            if superclass_name == class_name {
                self.error("A class can't inherit from itself.");
            }

            // The superclass lives in a hidden scoped local named 超, which
            // method bodies capture as an upvalue for 超.方法 forms.
            self.begin_scope();
            self.add_hidden_local("超");

            self.named_variable(&class_name, false);
            self.emit(Op::Inherit);
            if let Some(ctx) = self.class_context.as_mut() {
                ctx.has_superclass = true;
            }
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit(Op::Pop);

        let has_superclass = self
            .class_context
            .as_ref()
            .is_some_and(|ctx| ctx.has_superclass);
        if has_superclass {
            self.end_scope();
        }

        self.class_context = self
            .class_context
            .take()
            .and_then(|ctx| ctx.enclosing);
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let method_name = self.previous.lexeme.clone();
        let name_idx = self.identifier_constant(&method_name);

        let function_type = if method_name == INITIALIZER_NAME {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        let name = self.interner.intern(&method_name);
        self.function(function_type, name);
        self.emit(Op::Method(name_idx));
    }
}
