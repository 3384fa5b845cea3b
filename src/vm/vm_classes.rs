//! Class operations: property access, method binding, invoke, inheritance.

use std::rc::Rc;

use crate::error::RuntimeError;
use crate::vm::value::{BoundMethod, Class, Value};

use super::vm::Vm;

impl Vm {
    /// Property read on the instance at the top of the stack: fields first,
    /// then the class's methods (producing a bound method).
    pub(crate) fn get_property(&mut self, name: Rc<str>) -> Result<(), RuntimeError> {
        let Value::Instance(instance) = self.peek(0).clone() else {
            return Err(self.runtime_error("Only instances have properties.".to_string()));
        };

        let field = instance.borrow().fields.get(&name).cloned();
        if let Some(value) = field {
            self.pop();
            self.push(value);
            return Ok(());
        }

        let class = instance.borrow().class.clone();
        self.bind_method(&class, &name)
    }

    /// Property write. Stack: [instance, value] -> [value].
    pub(crate) fn set_property(&mut self, name: Rc<str>) -> Result<(), RuntimeError> {
        let Value::Instance(instance) = self.peek(1).clone() else {
            return Err(self.runtime_error("Only instances have fields.".to_string()));
        };

        let value = self.pop();
        instance.borrow_mut().fields.insert(name, value.clone());
        self.pop();
        self.push(value);
        Ok(())
    }

    /// Replace the receiver on top of the stack with a bound method.
    pub(crate) fn bind_method(&mut self, class: &Rc<Class>, name: &str) -> Result<(), RuntimeError> {
        let Some(method) = class.find_method(name) else {
            return Err(self.runtime_error(format!("Undefined property '{}'.", name)));
        };
        let receiver = self.pop();
        self.push(Value::BoundMethod(Rc::new(BoundMethod { receiver, method })));
        Ok(())
    }

    /// Fused property-read-and-call. A field holding a callable still wins
    /// over a method of the same name.
    pub(crate) fn invoke(&mut self, name: Rc<str>, argc: usize) -> Result<(), RuntimeError> {
        let Value::Instance(instance) = self.peek(argc).clone() else {
            return Err(self.runtime_error("Only instances have methods.".to_string()));
        };

        let field = instance.borrow().fields.get(&name).cloned();
        if let Some(value) = field {
            let callee_idx = self.stack.len() - 1 - argc;
            self.stack[callee_idx] = value;
            return self.call_value(argc);
        }

        let class = instance.borrow().class.clone();
        self.invoke_from_class(&class, &name, argc)
    }

    /// Method dispatch with a known class, skipping the bound-method
    /// allocation. The receiver is already in the callee slot.
    pub(crate) fn invoke_from_class(
        &mut self,
        class: &Rc<Class>,
        name: &str,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        let Some(method) = class.find_method(name) else {
            return Err(self.runtime_error(format!("Undefined property '{}'.", name)));
        };
        self.call_closure(method, argc)
    }

    /// Copy the superclass's methods into the subclass. The subclass's own
    /// methods are bound afterwards, so overrides win; later changes to the
    /// superclass do not propagate. Stack: [super, sub] -> [super].
    pub(crate) fn inherit(&mut self) -> Result<(), RuntimeError> {
        let Value::Class(superclass) = self.peek(1).clone() else {
            return Err(self.runtime_error("Superclass must be a class.".to_string()));
        };
        if let Value::Class(subclass) = self.peek(0).clone() {
            let inherited = superclass.methods.borrow().clone();
            subclass.methods.borrow_mut().extend(inherited);
        }
        self.pop();
        Ok(())
    }

    /// Bind the closure on top of the stack as a method on the class below.
    pub(crate) fn define_method(&mut self, name: Rc<str>) {
        if let (Value::Closure(method), Value::Class(class)) =
            (self.peek(0).clone(), self.peek(1).clone())
        {
            class.methods.borrow_mut().insert(name, method);
        }
        self.pop();
    }
}
