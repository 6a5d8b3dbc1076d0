//! The execution engine: heap, hidden classes, contexts and the pending
//! exception.
//!
//! Runtime operations report a throw by returning [`ExceptionSignal`]; the
//! thrown value itself is parked in [`ExecutionEngine::exception_value`]
//! with [`ExecutionEngine::has_exception`] set, which is also the flag
//! generated code tests after every runtime call.

use std::rc::Rc;
use std::sync::Arc;

use crate::runner::builtins;
use crate::runner::config::{Backend, EngineConfig};
use crate::runner::context::{CallContext, ContextArena, ContextId, ContextKind, ExecutionContext};
use crate::runner::ds::error::{ErrorType, ExceptionSignal, ReturnedValue};
use crate::runner::ds::heap::{HeapObject, MemoryManager};
use crate::runner::ds::identifier::{Identifier, IdentifierTable};
use crate::runner::ds::internal_class::{ClassId, InternalClassPool};
use crate::runner::ds::lookup::Lookup;
use crate::runner::ds::managed::{ManagedRef, VTable, MANAGED_VTABLE, STRING_VTABLE};
use crate::runner::ds::object::{
    self, insert_member, CallData, ObjectData, ObjectIterator, ObjectKind, ARGUMENTS_OBJECT_VTABLE,
    ARRAY_OBJECT_VTABLE, BOOLEAN_OBJECT_VTABLE, ERROR_OBJECT_VTABLE, FOREACH_ITERATOR_VTABLE,
    NUMBER_OBJECT_VTABLE, OBJECT_VTABLE, REGEXP_OBJECT_VTABLE, STRING_OBJECT_VTABLE,
};
use crate::runner::ds::property::{
    Property, PropertyAttributes, ATTR_NOT_CONFIGURABLE, ATTR_NOT_ENUMERABLE, ATTR_READ_ONLY,
};
use crate::runner::ds::value::Value;
use crate::runner::executable_allocator::{ExecutableAllocator, HeapPageAllocator};
use crate::runner::function::{
    BuiltinCode, CodeRef, Function, FunctionKind, BUILTIN_FUNCTION_VTABLE, SCRIPT_FUNCTION_VTABLE,
};
use crate::runner::isel::unit::CompilationUnit;
use crate::runner::jit;
use crate::runner::jit::machine::MachineError;
use crate::runner::moth;

/// Names the runtime looks up often.
pub struct CommonIdentifiers {
    pub length: Identifier,
    pub prototype: Identifier,
    pub constructor: Identifier,
    pub message: Identifier,
    pub name: Identifier,
    pub arguments: Identifier,
    pub callee: Identifier,
    pub to_string: Identifier,
    pub value_of: Identifier,
    pub undefined: Identifier,
    pub nan: Identifier,
    pub infinity: Identifier,
    pub empty: Identifier,
}

impl CommonIdentifiers {
    fn new(table: &mut IdentifierTable) -> Self {
        CommonIdentifiers {
            length: table.intern("length"),
            prototype: table.intern("prototype"),
            constructor: table.intern("constructor"),
            message: table.intern("message"),
            name: table.intern("name"),
            arguments: table.intern("arguments"),
            callee: table.intern("callee"),
            to_string: table.intern("toString"),
            value_of: table.intern("valueOf"),
            undefined: table.intern("undefined"),
            nan: table.intern("NaN"),
            infinity: table.intern("Infinity"),
            empty: table.intern(""),
        }
    }
}

pub struct Prototypes {
    pub object: ManagedRef,
    pub function: ManagedRef,
    pub array: ManagedRef,
    pub string: ManagedRef,
    pub number: ManagedRef,
    pub boolean: ManagedRef,
    pub regexp: ManagedRef,
    /// Indexed by `ErrorType as usize`.
    pub errors: [ManagedRef; 7],
}

/// Initial class of each object kind.
pub struct ObjectClasses {
    pub string: ClassId,
    pub object: ClassId,
    pub array: ClassId,
    pub script_function: ClassId,
    pub builtin_function: ClassId,
    pub boolean: ClassId,
    pub number: ClassId,
    pub string_object: ClassId,
    pub arguments: ClassId,
    pub regexp: ClassId,
    pub foreach_iterator: ClassId,
    pub errors: [ClassId; 7],
}

/// A compilation unit after linking: strings, lookups and functions as the
/// running code sees them.
pub struct LinkedUnit {
    pub unit: Rc<CompilationUnit>,
    pub runtime_strings: Vec<Value>,
    pub runtime_identifiers: Vec<Identifier>,
    pub runtime_functions: Vec<Rc<Function>>,
    /// Shapes of the unit's object literals.
    pub runtime_classes: Vec<ClassId>,
    pub lookups: Vec<Lookup>,
}

pub struct ExecutionEngine {
    pub config: EngineConfig,
    pub heap: MemoryManager,
    pub classes: InternalClassPool,
    pub identifiers: IdentifierTable,
    pub ids: CommonIdentifiers,
    pub contexts: ContextArena,
    pub root_context: ContextId,
    pub current_context: ContextId,
    pub global_object: ManagedRef,
    pub has_exception: bool,
    pub exception_value: Value,
    pub protos: Prototypes,
    pub object_classes: ObjectClasses,
    pub units: Vec<LinkedUnit>,
    pub executable_allocator: Arc<ExecutableAllocator>,
    /// Last fault raised by the machine-code simulator, kept so the host
    /// can tell it apart from an ordinary script exception.
    pub fault: Option<MachineError>,
    call_depth: u32,
    /// Host stack address of the outermost active call.
    stack_base: usize,
    output: Vec<String>,
}

fn bootstrap_object(heap: &mut MemoryManager, class: ClassId, data: ObjectData) -> ManagedRef {
    heap.allocate_reserved(HeapObject::object(class, data))
}

fn empty_builtin(_: &mut ExecutionEngine, _: &CallData) -> ReturnedValue {
    Ok(Value::undefined())
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig) -> ExecutionEngine {
        let mut heap = MemoryManager::new(config.heap.clone());
        let mut classes = InternalClassPool::new(VTable::Managed(&MANAGED_VTABLE));
        let mut identifiers = IdentifierTable::new();
        let ids = CommonIdentifiers::new(&mut identifiers);

        let object_vt = VTable::Object(&OBJECT_VTABLE);
        let proto_class = classes.create(object_vt, None);
        let object_proto = bootstrap_object(&mut heap, proto_class, ObjectData::ordinary());
        let plain = classes.create(object_vt, Some(object_proto));
        let builtin_fn_class = classes.create(VTable::Object(&BUILTIN_FUNCTION_VTABLE), Some(object_proto));
        let function_proto = bootstrap_object(
            &mut heap,
            builtin_fn_class,
            ObjectData::new(ObjectKind::Function(FunctionKind::Builtin {
                name: ids.empty,
                code: empty_builtin,
                construct: None,
            })),
        );
        let array_proto = bootstrap_object(&mut heap, plain, ObjectData::ordinary());
        let string_proto = bootstrap_object(&mut heap, plain, ObjectData::ordinary());
        let number_proto = bootstrap_object(&mut heap, plain, ObjectData::ordinary());
        let boolean_proto = bootstrap_object(&mut heap, plain, ObjectData::ordinary());
        let regexp_proto = bootstrap_object(&mut heap, plain, ObjectData::ordinary());
        let error_proto = bootstrap_object(&mut heap, plain, ObjectData::ordinary());
        let sub_error_class = classes.create(object_vt, Some(error_proto));
        let mut error_protos = [error_proto; 7];
        for slot in error_protos.iter_mut().skip(1) {
            *slot = bootstrap_object(&mut heap, sub_error_class, ObjectData::ordinary());
        }
        let mut error_classes = [plain; 7];
        for (i, slot) in error_classes.iter_mut().enumerate() {
            *slot = classes.create(VTable::Object(&ERROR_OBJECT_VTABLE), Some(error_protos[i]));
        }

        let object_classes = ObjectClasses {
            string: classes.create(VTable::Managed(&STRING_VTABLE), None),
            object: plain,
            array: classes.create(VTable::Object(&ARRAY_OBJECT_VTABLE), Some(array_proto)),
            script_function: classes.create(VTable::Object(&SCRIPT_FUNCTION_VTABLE), Some(function_proto)),
            builtin_function: classes.create(VTable::Object(&BUILTIN_FUNCTION_VTABLE), Some(function_proto)),
            boolean: classes.create(VTable::Object(&BOOLEAN_OBJECT_VTABLE), Some(boolean_proto)),
            number: classes.create(VTable::Object(&NUMBER_OBJECT_VTABLE), Some(number_proto)),
            string_object: classes.create(VTable::Object(&STRING_OBJECT_VTABLE), Some(string_proto)),
            arguments: classes.create(VTable::Object(&ARGUMENTS_OBJECT_VTABLE), Some(object_proto)),
            regexp: classes.create(VTable::Object(&REGEXP_OBJECT_VTABLE), Some(regexp_proto)),
            foreach_iterator: classes.create(VTable::Object(&FOREACH_ITERATOR_VTABLE), Some(object_proto)),
            errors: error_classes,
        };
        let global_object = bootstrap_object(&mut heap, plain, ObjectData::ordinary());

        let mut contexts = ContextArena::new();
        let root_context = contexts.push(ExecutionContext::global());
        let executable_allocator = Arc::new(ExecutableAllocator::new(
            HeapPageAllocator::default(),
            config.executable_page_size,
        ));

        let mut engine = ExecutionEngine {
            config,
            heap,
            classes,
            identifiers,
            ids,
            contexts,
            root_context,
            current_context: root_context,
            global_object,
            has_exception: false,
            exception_value: Value::empty(),
            protos: Prototypes {
                object: object_proto,
                function: function_proto,
                array: array_proto,
                string: string_proto,
                number: number_proto,
                boolean: boolean_proto,
                regexp: regexp_proto,
                errors: error_protos,
            },
            object_classes,
            units: Vec::new(),
            executable_allocator,
            fault: None,
            call_depth: 0,
            stack_base: 0,
            output: Vec::new(),
        };
        builtins::install(&mut engine);
        tracing::debug!(
            target: "jsv4::engine",
            backend = ?engine.config.backend,
            cells = engine.heap.len(),
            classes = engine.classes.len(),
            "engine ready"
        );
        engine
    }

    pub fn backend(&self) -> Backend {
        self.config.backend
    }

    // ── Cells ──

    pub fn class_of(&self, m: ManagedRef) -> ClassId {
        self.heap.header(m).internal_class
    }

    pub fn vtable_of(&self, m: ManagedRef) -> VTable {
        self.classes.get(self.class_of(m)).vtable
    }

    pub fn prototype_of(&self, m: ManagedRef) -> Option<ManagedRef> {
        self.classes.get(self.class_of(m)).prototype
    }

    pub fn set_prototype_of(&mut self, m: ManagedRef, proto: Option<ManagedRef>) {
        let class = self.class_of(m);
        let new_class = self.classes.change_prototype(class, proto);
        self.heap.header_mut(m).internal_class = new_class;
    }

    pub fn is_function(&self, v: Value) -> bool {
        v.as_managed()
            .map_or(false, |m| self.heap.is_object(m) && self.vtable_of(m).managed().is_function_object)
    }

    /// Stores an object cell. A full heap raises a RangeError.
    pub fn alloc_object(&mut self, class: ClassId, data: ObjectData) -> Result<ManagedRef, ExceptionSignal> {
        match self.heap.allocate(HeapObject::object(class, data)) {
            Ok(m) => Ok(m),
            Err(e) => {
                tracing::warn!(target: "jsv4::alloc", error = %e, "allocation failed");
                Err(self.throw_error(ErrorType::RangeError, "Out of memory"))
            }
        }
    }

    pub fn new_object(&mut self) -> Result<ManagedRef, ExceptionSignal> {
        self.alloc_object(self.object_classes.object, ObjectData::ordinary())
    }

    /// Object of shape `class` with every slot present: undefined for data
    /// members, an empty accessor for the others.
    pub fn new_literal_object(&mut self, class: ClassId) -> Result<ManagedRef, ExceptionSignal> {
        let c = self.classes.get(class);
        let mut data = ObjectData::ordinary();
        let mut has_accessor = false;
        data.members = (0..c.size())
            .map(|slot| {
                if c.attributes_at(slot).is_accessor() {
                    has_accessor = true;
                    Property::accessor(None, None)
                } else {
                    Property::new(Value::undefined())
                }
            })
            .collect();
        let m = self.alloc_object(class, data)?;
        if has_accessor {
            self.heap.header_mut(m).flags.set_has_accessor_property(true);
        }
        Ok(m)
    }

    pub fn new_object_with_proto(&mut self, proto: Option<ManagedRef>) -> Result<ManagedRef, ExceptionSignal> {
        let class = self.classes.create(VTable::Object(&OBJECT_VTABLE), proto);
        self.alloc_object(class, ObjectData::ordinary())
    }

    pub fn new_array(&mut self, values: Vec<Value>) -> Result<ManagedRef, ExceptionSignal> {
        self.alloc_object(self.object_classes.array, ObjectData::array(values))
    }

    pub fn new_string(&mut self, text: &str) -> ReturnedValue {
        self.new_string_rc(Rc::from(text))
    }

    pub fn new_string_rc(&mut self, text: Rc<str>) -> ReturnedValue {
        match self.heap.allocate(HeapObject::string(self.object_classes.string, text)) {
            Ok(m) => Ok(Value::from_managed(m)),
            Err(_) => Err(self.throw_error(ErrorType::RangeError, "Out of memory")),
        }
    }

    pub fn identifier_string(&mut self, id: Identifier) -> ReturnedValue {
        let text = self.identifiers.name_rc(id);
        self.new_string_rc(text)
    }

    /// Text of a string value.
    pub fn string_text(&self, v: Value) -> Option<Rc<str>> {
        v.as_managed().and_then(|m| self.heap.string(m)).map(|s| s.text())
    }

    pub fn new_boolean_object(&mut self, b: bool) -> Result<ManagedRef, ExceptionSignal> {
        self.alloc_object(self.object_classes.boolean, ObjectData::new(ObjectKind::Boolean(b)))
    }

    pub fn new_number_object(&mut self, d: f64) -> Result<ManagedRef, ExceptionSignal> {
        self.alloc_object(self.object_classes.number, ObjectData::new(ObjectKind::Number(d)))
    }

    pub fn new_string_object(&mut self, s: Value) -> Result<ManagedRef, ExceptionSignal> {
        self.alloc_object(self.object_classes.string_object, ObjectData::new(ObjectKind::String(s)))
    }

    pub fn new_regexp_object(&mut self, source: Rc<str>, flags: Rc<str>) -> Result<ManagedRef, ExceptionSignal> {
        let kind = ObjectKind::RegExp {
            source: source.clone(),
            flags: flags.clone(),
        };
        let r = self.alloc_object(self.object_classes.regexp, ObjectData::new(kind))?;
        let source_id = self.identifiers.intern("source");
        let global_id = self.identifiers.intern("global");
        let ignore_case_id = self.identifiers.intern("ignoreCase");
        let multiline_id = self.identifiers.intern("multiline");
        let last_index_id = self.identifiers.intern("lastIndex");
        let read_only = PropertyAttributes::from_flags(ATTR_READ_ONLY);
        let src = self.new_string_rc(source)?;
        insert_member(self, r, source_id, Property::new(src), read_only);
        for (id, c) in [(global_id, 'g'), (ignore_case_id, 'i'), (multiline_id, 'm')] {
            let on = Value::from_bool(flags.contains(c));
            insert_member(self, r, id, Property::new(on), read_only);
        }
        let last_index = PropertyAttributes::from_flags(ATTR_NOT_ENUMERABLE | ATTR_NOT_CONFIGURABLE);
        insert_member(self, r, last_index_id, Property::new(Value::from_int32(0)), last_index);
        Ok(r)
    }

    pub fn new_foreach_iterator(&mut self, o: Option<ManagedRef>) -> Result<ManagedRef, ExceptionSignal> {
        let data = ObjectData::new(ObjectKind::ForeachIterator(ObjectIterator::new(o)));
        self.alloc_object(self.object_classes.foreach_iterator, data)
    }

    pub fn new_builtin_function(&mut self, name: &str, code: BuiltinCode) -> Result<ManagedRef, ExceptionSignal> {
        self.new_builtin_constructor(name, code, None)
    }

    pub fn new_builtin_constructor(
        &mut self,
        name: &str,
        code: BuiltinCode,
        construct: Option<BuiltinCode>,
    ) -> Result<ManagedRef, ExceptionSignal> {
        let name = self.identifiers.intern(name);
        let kind = ObjectKind::Function(FunctionKind::Builtin { name, code, construct });
        self.alloc_object(self.object_classes.builtin_function, ObjectData::new(kind))
    }

    /// Closure over `scope`. Gets `length` and a fresh `prototype` object.
    pub fn new_script_function(&mut self, function: Rc<Function>, scope: ContextId) -> Result<ManagedRef, ExceptionSignal> {
        let formal_count = function.formals.len() as i32;
        let kind = ObjectKind::Function(FunctionKind::Script { function, scope });
        let f = self.alloc_object(self.object_classes.script_function, ObjectData::new(kind))?;
        self.contexts.capture(scope);
        let length = self.ids.length;
        insert_member(
            self,
            f,
            length,
            Property::new(Value::from_int32(formal_count)),
            PropertyAttributes::from_flags(ATTR_READ_ONLY),
        );
        let proto = self.new_object()?;
        let constructor = self.ids.constructor;
        insert_member(
            self,
            proto,
            constructor,
            Property::new(Value::from_managed(f)),
            PropertyAttributes::from_flags(ATTR_NOT_ENUMERABLE),
        );
        let prototype = self.ids.prototype;
        insert_member(
            self,
            f,
            prototype,
            Property::new(Value::from_managed(proto)),
            PropertyAttributes::from_flags(ATTR_NOT_ENUMERABLE | ATTR_NOT_CONFIGURABLE),
        );
        Ok(f)
    }

    /// Unmapped `arguments` for the innermost call context.
    pub fn new_arguments_object(&mut self, ctx: ContextId) -> Result<ManagedRef, ExceptionSignal> {
        let (args, callee, strict) = match self.contexts.get(ctx).as_call() {
            Some(c) => (
                c.arguments[..c.argc as usize].to_vec(),
                c.function_object,
                c.function.is_strict(),
            ),
            None => return Err(self.throw_reference_error("arguments is not defined")),
        };
        let count = args.len() as i32;
        let mut data = ObjectData::new(ObjectKind::Arguments);
        data.array = object::ArrayData::from_values(args);
        let a = self.alloc_object(self.object_classes.arguments, data)?;
        let hidden = PropertyAttributes::from_flags(ATTR_NOT_ENUMERABLE);
        let length = self.ids.length;
        insert_member(self, a, length, Property::new(Value::from_int32(count)), hidden);
        if !strict {
            let callee_id = self.ids.callee;
            insert_member(self, a, callee_id, Property::new(Value::from_managed(callee)), hidden);
        }
        Ok(a)
    }

    // ── Exceptions ──

    /// Parks `value` as the pending exception.
    pub fn throw(&mut self, value: Value) -> ExceptionSignal {
        tracing::trace!(target: "jsv4::engine", value = ?value, "throw");
        self.has_exception = true;
        self.exception_value = value;
        ExceptionSignal
    }

    /// Error object of the given type. Never fails: used on the path that
    /// reports a full heap.
    pub fn new_error(&mut self, ty: ErrorType, message: &str) -> ManagedRef {
        let class = self.object_classes.errors[ty as usize];
        let e = self
            .heap
            .allocate_reserved(HeapObject::object(class, ObjectData::new(ObjectKind::Error(ty))));
        self.heap.header_mut(e).flags.set_subtype(ty as u8);
        let text = self
            .heap
            .allocate_reserved(HeapObject::string(self.object_classes.string, Rc::from(message)));
        let id = self.ids.message;
        insert_member(
            self,
            e,
            id,
            Property::new(Value::from_managed(text)),
            PropertyAttributes::from_flags(ATTR_NOT_ENUMERABLE),
        );
        e
    }

    pub fn throw_error(&mut self, ty: ErrorType, message: &str) -> ExceptionSignal {
        let e = self.new_error(ty, message);
        self.throw(Value::from_managed(e))
    }

    pub fn throw_type_error(&mut self, message: impl AsRef<str>) -> ExceptionSignal {
        self.throw_error(ErrorType::TypeError, message.as_ref())
    }

    pub fn throw_range_error(&mut self, message: impl AsRef<str>) -> ExceptionSignal {
        self.throw_error(ErrorType::RangeError, message.as_ref())
    }

    pub fn throw_reference_error(&mut self, message: impl AsRef<str>) -> ExceptionSignal {
        self.throw_error(ErrorType::ReferenceError, message.as_ref())
    }

    pub fn throw_syntax_error(&mut self, message: impl AsRef<str>) -> ExceptionSignal {
        self.throw_error(ErrorType::SyntaxError, message.as_ref())
    }

    /// Takes the pending exception, clearing the flag.
    pub fn catch_exception(&mut self) -> Value {
        self.has_exception = false;
        std::mem::replace(&mut self.exception_value, Value::empty())
    }

    pub fn error_type_of(&self, v: Value) -> Option<ErrorType> {
        match v.as_managed().and_then(|m| self.heap.object(m)).map(|o| &o.kind) {
            Some(ObjectKind::Error(t)) => Some(*t),
            _ => None,
        }
    }

    // ── Contexts ──

    pub fn current_strict(&self) -> bool {
        self.contexts.get(self.current_context).strict
    }

    pub fn push_context(&mut self, kind: ContextKind) -> ContextId {
        let strict = self.current_strict();
        let id = self.contexts.push(ExecutionContext {
            outer: Some(self.current_context),
            strict,
            captured: false,
            kind,
        });
        self.current_context = id;
        id
    }

    /// Leaves the innermost scope context.
    pub fn pop_context(&mut self) {
        let id = self.current_context;
        if let Some(outer) = self.contexts.get(id).outer {
            self.current_context = outer;
            self.contexts.release(id);
        }
    }

    // ── Calls ──

    /// Depth and host stack use are both bounded: a call frame of the
    /// interpreter or the simulator is far larger than a JS frame, more so in
    /// unoptimized builds.
    fn enter_call(&mut self) -> Result<(), ExceptionSignal> {
        let marker = 0u8;
        let here = &marker as *const u8 as usize;
        if self.call_depth == 0 {
            self.stack_base = here;
        }
        let used = self.stack_base.abs_diff(here);
        if self.call_depth >= self.config.max_call_depth || used > self.config.max_native_stack {
            tracing::debug!(target: "jsv4::engine", depth = self.call_depth, used, "call stack exhausted");
            return Err(self.throw_range_error("Maximum call stack size exceeded"));
        }
        self.call_depth += 1;
        Ok(())
    }

    pub fn call_function(&mut self, f: ManagedRef, this: Value, args: Vec<Value>) -> ReturnedValue {
        if !self.is_function(Value::from_managed(f)) {
            return Err(self.throw_type_error("object is not a function"));
        }
        object::call(self, f, &CallData::new(this, args))
    }

    pub fn call_value(&mut self, f: Value, this: Value, args: Vec<Value>) -> ReturnedValue {
        match f.as_managed() {
            Some(m) if self.is_function(f) => object::call(self, m, &CallData::new(this, args)),
            _ => Err(self.throw_type_error("value is not a function")),
        }
    }

    pub fn call_builtin(&mut self, code: BuiltinCode, data: &CallData) -> ReturnedValue {
        self.enter_call()?;
        let result = code(self, data);
        self.call_depth -= 1;
        result
    }

    /// Runs `function` in a fresh call context whose outer scope is `scope`.
    pub fn call_script(
        &mut self,
        function: Rc<Function>,
        function_object: ManagedRef,
        scope: ContextId,
        this: Value,
        args: Vec<Value>,
    ) -> ReturnedValue {
        self.enter_call()?;
        let strict = function.is_strict();
        let call = CallContext::new(function.clone(), function_object, this, args);
        let ctx = self.contexts.push(ExecutionContext {
            outer: Some(scope),
            strict,
            captured: false,
            kind: ContextKind::Call(call),
        });
        let saved = self.current_context;
        self.current_context = ctx;
        let result = self.run_code(&function, ctx);
        self.current_context = saved;
        self.contexts.release(ctx);
        self.call_depth -= 1;
        result
    }

    /// Executes the code of `function` with `ctx` as the current context.
    pub fn run_code(&mut self, function: &Rc<Function>, ctx: ContextId) -> ReturnedValue {
        let result = match &function.code {
            CodeRef::Bytecode(code) => moth::vm::run(self, ctx, function, code),
            CodeRef::Native { target, address, .. } => jit::machine::run(self, ctx, function, *target, *address),
        };
        match result {
            Ok(v) if self.has_exception => {
                tracing::trace!(target: "jsv4::engine", value = ?v, "exception flag set on normal return");
                Err(ExceptionSignal)
            }
            r => r,
        }
    }

    // ── Host output ──

    pub fn print(&mut self, line: String) {
        self.output.push(line);
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        ExecutionEngine::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::config::HeapConfig;

    #[test]
    fn test_global_object_is_plain_object() {
        let e = ExecutionEngine::default();
        assert!(e.vtable_of(e.global_object).is::<object::PlainObject>());
        assert_eq!(e.prototype_of(e.global_object), Some(e.protos.object));
        assert_eq!(e.prototype_of(e.protos.object), None);
    }

    #[test]
    fn test_heap_limit_raises_range_error() {
        let config = EngineConfig::default().with_heap(HeapConfig::with_limit(0));
        let mut e = ExecutionEngine::new(config);
        assert!(e.new_object().is_err());
        assert!(e.has_exception);
        let exc = e.catch_exception();
        assert_eq!(e.error_type_of(exc), Some(ErrorType::RangeError));
        assert!(!e.has_exception);
    }

    #[test]
    fn test_error_objects_carry_subtype() {
        let mut e = ExecutionEngine::default();
        let err = e.new_error(ErrorType::URIError, "bad");
        assert_eq!(e.heap.header(err).flags.subtype(), ErrorType::URIError as u8);
        assert_eq!(e.prototype_of(err), Some(e.protos.errors[ErrorType::URIError as usize]));
        let message = e.ids.message;
        let m = object::get(&mut e, err, message).unwrap();
        assert_eq!(e.string_text(m).as_deref(), Some("bad"));
    }

    #[test]
    fn test_call_depth_limit() {
        fn recurse(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
            let f = data.arg(0);
            engine.call_value(f, Value::undefined(), vec![f])
        }
        let mut e = ExecutionEngine::new(EngineConfig::default().with_max_call_depth(16));
        let f = e.new_builtin_function("recurse", recurse).unwrap();
        let r = e.call_function(f, Value::undefined(), vec![Value::from_managed(f)]);
        assert!(r.is_err());
        let exc = e.catch_exception();
        assert_eq!(e.error_type_of(exc), Some(ErrorType::RangeError));
    }

    #[test]
    fn test_native_stack_limit() {
        fn recurse(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
            let f = data.arg(0);
            engine.call_value(f, Value::undefined(), vec![f])
        }
        let config = EngineConfig::default()
            .with_max_call_depth(u32::MAX)
            .with_max_native_stack(64 * 1024);
        let mut e = ExecutionEngine::new(config);
        let f = e.new_builtin_function("recurse", recurse).unwrap();
        let r = e.call_function(f, Value::undefined(), vec![Value::from_managed(f)]);
        assert!(r.is_err());
        let exc = e.catch_exception();
        assert_eq!(e.error_type_of(exc), Some(ErrorType::RangeError));
        assert_eq!(e.call_depth, 0);
        fn one(_: &mut ExecutionEngine, _: &CallData) -> ReturnedValue {
            Ok(Value::from_int32(1))
        }
        let ok = e.new_builtin_function("ok", one).unwrap();
        assert_eq!(e.call_function(ok, Value::undefined(), vec![]).unwrap().int_32(), 1);
    }
}
