//! Execution contexts.
//!
//! Contexts form a chain through `outer` and live in an arena owned by the
//! engine. A context captured by a closure stays alive for the rest of the
//! engine's life; an uncaptured one on top of the arena is released when
//! the call or scope that pushed it ends.

use std::rc::Rc;

use crate::runner::ds::identifier::Identifier;
use crate::runner::ds::internal_class::InternalClassPool;
use crate::runner::ds::managed::ManagedRef;
use crate::runner::ds::value::Value;
use crate::runner::function::Function;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ContextId(u32);

impl ContextId {
    pub const fn new(index: u32) -> Self {
        ContextId(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

/// Where a name of a function's scope is stored.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VarSlot {
    Formal(usize),
    Local(usize),
}

pub struct CallContext {
    pub function: Rc<Function>,
    pub function_object: ManagedRef,
    pub this: Value,
    /// Actual arguments, padded with undefined up to the formal count.
    pub arguments: Vec<Value>,
    pub argc: u32,
    pub locals: Vec<Value>,
}

impl CallContext {
    pub fn new(function: Rc<Function>, function_object: ManagedRef, this: Value, args: Vec<Value>) -> Self {
        let argc = args.len() as u32;
        let mut arguments = args;
        let formals = function.formals.len();
        if arguments.len() < formals {
            arguments.resize(formals, Value::undefined());
        }
        let locals = vec![Value::undefined(); function.locals.len()];
        CallContext {
            function,
            function_object,
            this,
            arguments,
            argc,
            locals,
        }
    }

    /// Slot of `id` in the function's scope class. Formals were added last
    /// to first, so class slot `s` below the formal count is formal
    /// `count - s - 1`.
    pub fn slot(&self, id: Identifier, classes: &InternalClassPool) -> Option<VarSlot> {
        let slot = classes.find(self.function.internal_class, id)? as usize;
        let formals = self.function.formals.len();
        if slot < formals {
            Some(VarSlot::Formal(formals - slot - 1))
        } else {
            Some(VarSlot::Local(slot - formals))
        }
    }

    pub fn read(&self, slot: VarSlot) -> Value {
        match slot {
            VarSlot::Formal(i) => self.arguments.get(i).copied(),
            VarSlot::Local(i) => self.locals.get(i).copied(),
        }
        .unwrap_or_else(Value::undefined)
    }

    pub fn write(&mut self, slot: VarSlot, value: Value) {
        let cell = match slot {
            VarSlot::Formal(i) => self.arguments.get_mut(i),
            VarSlot::Local(i) => self.locals.get_mut(i),
        };
        if let Some(cell) = cell {
            *cell = value;
        }
    }

    /// Value of argument `i` as the caller passed it.
    pub fn argument(&self, i: usize) -> Value {
        if i < self.argc as usize {
            self.arguments[i]
        } else {
            Value::undefined()
        }
    }
}

pub enum ContextKind {
    Global,
    Call(CallContext),
    Catch {
        exception_var: Identifier,
        exception_value: Value,
    },
    With {
        object: ManagedRef,
    },
}

pub struct ExecutionContext {
    pub outer: Option<ContextId>,
    pub strict: bool,
    /// Set once a closure keeps this context as its scope.
    pub captured: bool,
    pub kind: ContextKind,
}

impl ExecutionContext {
    pub fn global() -> Self {
        ExecutionContext {
            outer: None,
            strict: false,
            captured: true,
            kind: ContextKind::Global,
        }
    }

    pub fn as_call(&self) -> Option<&CallContext> {
        match &self.kind {
            ContextKind::Call(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_call_mut(&mut self) -> Option<&mut CallContext> {
        match &mut self.kind {
            ContextKind::Call(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct ContextArena {
    contexts: Vec<ExecutionContext>,
}

impl ContextArena {
    pub fn new() -> Self {
        ContextArena {
            contexts: Vec::with_capacity(64),
        }
    }

    pub fn push(&mut self, ctx: ExecutionContext) -> ContextId {
        let id = ContextId(self.contexts.len() as u32);
        self.contexts.push(ctx);
        id
    }

    pub fn get(&self, id: ContextId) -> &ExecutionContext {
        &self.contexts[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ContextId) -> &mut ExecutionContext {
        &mut self.contexts[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Drops `id` if it is the newest context and nothing captured it.
    pub fn release(&mut self, id: ContextId) -> bool {
        let last = self.contexts.len().checked_sub(1);
        if last == Some(id.0 as usize) && !self.contexts[id.0 as usize].captured {
            self.contexts.pop();
            true
        } else {
            false
        }
    }

    /// Marks `id` and its outer chain as kept alive by a closure.
    pub fn capture(&mut self, id: ContextId) {
        let mut cur = Some(id);
        while let Some(c) = cur {
            let ctx = &mut self.contexts[c.0 as usize];
            if ctx.captured {
                break;
            }
            ctx.captured = true;
            cur = ctx.outer;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_only_newest_uncaptured() {
        let mut arena = ContextArena::new();
        let g = arena.push(ExecutionContext::global());
        let a = arena.push(ExecutionContext {
            outer: Some(g),
            strict: false,
            captured: false,
            kind: ContextKind::With {
                object: ManagedRef::new(0),
            },
        });
        let b = arena.push(ExecutionContext {
            outer: Some(a),
            strict: false,
            captured: false,
            kind: ContextKind::With {
                object: ManagedRef::new(1),
            },
        });
        assert!(!arena.release(a));
        arena.capture(b);
        assert!(arena.get(a).captured);
        assert!(!arena.release(b));
        assert!(!arena.release(g));
        assert_eq!(arena.len(), 3);
    }
}
