//! Call dispatch and native functions.

use std::cell::RefCell;
use std::rc::Rc;

use crate::compiler::INITIALIZER_NAME;
use crate::error::RuntimeError;
use crate::vm::upvalue::Closure;
use crate::vm::value::{Class, Instance, NativeFunction, Value};
use crate::vm::vm::{CallFrame, Vm, FRAMES_MAX};

impl Vm {
    /// Call the value sitting below `argc` arguments on the stack.
    pub(crate) fn call_value(&mut self, argc: usize) -> Result<(), RuntimeError> {
        let callee_idx = self.stack.len() - 1 - argc;
        let callee = self.stack[callee_idx].clone();

        match callee {
            Value::Closure(closure) => self.call_closure(closure, argc),
            Value::Native(native) => self.call_native(&native, argc),
            Value::Class(class) => self.call_class(class, argc),
            Value::BoundMethod(bound) => {
                // Rebind slot 0 to the receiver and run the method body.
                self.stack[callee_idx] = bound.receiver.clone();
                self.call_closure(bound.method.clone(), argc)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.".to_string())),
        }
    }

    pub(crate) fn call_closure(
        &mut self,
        closure: Rc<Closure>,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        let arity = closure.proto.arity as usize;
        if argc != arity {
            return Err(
                self.runtime_error(format!("Expected {} arguments but got {}.", arity, argc))
            );
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }

        // Slot 0 is the callee (or the receiver, for methods).
        let stack_base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            stack_base,
        });
        Ok(())
    }

    fn call_native(&mut self, native: &NativeFunction, argc: usize) -> Result<(), RuntimeError> {
        if argc != native.arity as usize {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                native.arity, argc
            )));
        }

        let args_start = self.stack.len() - argc;
        let result = (native.func)(&self.stack[args_start..]);
        let result = match result {
            Ok(value) => value,
            Err(message) => return Err(self.runtime_error(message)),
        };
        self.stack.truncate(args_start - 1);
        self.push(result);
        Ok(())
    }

    /// Calling a class makes a fresh instance. If the class has an
    /// initializer it runs with the arguments; otherwise none are allowed.
    fn call_class(&mut self, class: Rc<Class>, argc: usize) -> Result<(), RuntimeError> {
        let callee_idx = self.stack.len() - 1 - argc;
        let instance = Instance::new(class.clone());
        self.stack[callee_idx] = Value::Instance(Rc::new(RefCell::new(instance)));

        if let Some(initializer) = class.find_method(INITIALIZER_NAME) {
            self.call_closure(initializer, argc)
        } else if argc != 0 {
            Err(self.runtime_error(format!("Expected 0 arguments but got {}.", argc)))
        } else {
            Ok(())
        }
    }

    // --- Natives ---

    pub(crate) fn install_natives(&mut self) {
        let epoch = self.start_time();
        self.define_native("clock", 0, move |_args| {
            Ok(Value::Number(epoch.elapsed().as_secs_f64()))
        });
    }

    fn define_native<F>(&mut self, name: &str, arity: u8, func: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + 'static,
    {
        let name = self.strings.intern(name);
        self.globals.insert(
            name.clone(),
            Value::Native(NativeFunction::new(name, arity, func)),
        );
    }
}
