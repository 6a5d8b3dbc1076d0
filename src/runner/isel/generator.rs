//! Collects the constant tables of a compilation unit while its functions
//! are being lowered.

use std::rc::Rc;

use ahash::AHashMap;

use crate::runner::ds::lookup::LookupKind;
use crate::runner::ds::value::string_to_array_index;
use crate::runner::function::FunctionFlags;
use crate::runner::ir;
use crate::runner::isel::unit::{CompiledFunction, JsClassMember, LookupEntry, UnitData};

#[derive(Default)]
pub struct JsUnitGenerator {
    strings: Vec<Rc<str>>,
    string_index: AHashMap<Rc<str>, u32>,
    lookups: Vec<LookupEntry>,
    regexps: Vec<(Rc<str>, Rc<str>)>,
    js_classes: Vec<Vec<JsClassMember>>,
    js_class_index: AHashMap<Vec<JsClassMember>, u32>,
    functions: Vec<CompiledFunction>,
}

impl JsUnitGenerator {
    pub fn new() -> Self {
        JsUnitGenerator::default()
    }

    /// Index of `s` in the string table; equal strings share an entry.
    pub fn register_string(&mut self, s: &str) -> u32 {
        if let Some(&i) = self.string_index.get(s) {
            return i;
        }
        let i = self.strings.len() as u32;
        let s: Rc<str> = Rc::from(s);
        self.strings.push(s.clone());
        self.string_index.insert(s, i);
        i
    }

    fn register_lookup(&mut self, kind: LookupKind, name: &str) -> u32 {
        let name = self.register_string(name);
        self.lookups.push(LookupEntry { kind, name });
        (self.lookups.len() - 1) as u32
    }

    /// Every access site gets a cache of its own.
    pub fn register_getter_lookup(&mut self, name: &str) -> u32 {
        self.register_lookup(LookupKind::Getter, name)
    }

    pub fn register_setter_lookup(&mut self, name: &str) -> u32 {
        self.register_lookup(LookupKind::Setter, name)
    }

    pub fn register_global_getter_lookup(&mut self, name: &str) -> u32 {
        self.register_lookup(LookupKind::GlobalGetter, name)
    }

    pub fn register_regexp(&mut self, source: &Rc<str>, flags: &Rc<str>) -> u32 {
        self.regexps.push((source.clone(), flags.clone()));
        (self.regexps.len() - 1) as u32
    }

    /// Shape of an object literal whose properties are `members`, given as
    /// `(key, is_accessor)` in source order. Array index keys live in indexed
    /// storage and are left out; a repeated name keeps its first position
    /// and takes the kind of its last definition. Literals of equal shape
    /// share an entry.
    pub fn register_js_class(&mut self, members: &[(&str, bool)]) -> u32 {
        let mut class: Vec<JsClassMember> = Vec::with_capacity(members.len());
        for &(key, is_accessor) in members {
            if string_to_array_index(key) != u32::MAX {
                continue;
            }
            let name = self.register_string(key);
            match class.iter_mut().find(|m| m.name == name) {
                Some(m) => m.is_accessor = is_accessor,
                None => class.push(JsClassMember { name, is_accessor }),
            }
        }
        if let Some(&i) = self.js_class_index.get(&class) {
            return i;
        }
        let i = self.js_classes.len() as u32;
        self.js_class_index.insert(class.clone(), i);
        self.js_classes.push(class);
        i
    }

    pub fn register_function(&mut self, f: &ir::Function) {
        let name = f.name.as_ref().map(|n| self.register_string(n));
        let formals = f.formals.iter().map(|n| self.register_string(n)).collect();
        let locals = f.locals.iter().map(|n| self.register_string(n)).collect();
        self.functions.push(CompiledFunction {
            name,
            formals,
            locals,
            flags: FunctionFlags {
                strict: f.flags.strict,
                has_nested_functions: f.flags.has_nested_functions,
                uses_arguments: f.flags.uses_arguments,
                uses_this: f.flags.uses_this,
                is_named_expression: f.flags.is_named_expression,
            },
            nested: f.nested.clone(),
            line: f.line,
            column: f.column,
        });
    }

    pub fn string(&self, index: u32) -> Option<&Rc<str>> {
        self.strings.get(index as usize)
    }

    /// Hands the tables over to the unit, leaving the generator empty.
    pub fn generate_unit_data(&mut self, file_name: &str) -> UnitData {
        self.string_index.clear();
        self.js_class_index.clear();
        UnitData {
            file_name: file_name.to_string(),
            strings: std::mem::take(&mut self.strings),
            lookups: std::mem::take(&mut self.lookups),
            regexps: std::mem::take(&mut self.regexps),
            js_classes: std::mem::take(&mut self.js_classes),
            functions: std::mem::take(&mut self.functions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strings_are_shared_lookups_are_not() {
        let mut g = JsUnitGenerator::new();
        let a = g.register_string("a");
        assert_eq!(g.register_string("b"), a + 1);
        assert_eq!(g.register_string("a"), a);
        let l1 = g.register_getter_lookup("a");
        let l2 = g.register_getter_lookup("a");
        assert_ne!(l1, l2);
        let l3 = g.register_global_getter_lookup("c");
        let data = g.generate_unit_data("x.js");
        assert_eq!(data.strings.len(), 3);
        assert_eq!(data.lookups[l1 as usize].name, a);
        assert_eq!(data.lookups[l3 as usize].kind, LookupKind::GlobalGetter);
        assert_eq!(&*data.strings[data.lookups[l3 as usize].name as usize], "c");
    }

    #[test]
    fn test_literal_classes() {
        let mut g = JsUnitGenerator::new();
        let c = g.register_js_class(&[("a", false), ("b", true), ("a", true), ("3", false)]);
        assert_eq!(g.register_js_class(&[("a", true), ("b", true)]), c);
        let other = g.register_js_class(&[("b", true), ("a", true)]);
        assert_ne!(other, c);
        let empty = g.register_js_class(&[("0", false)]);
        let data = g.generate_unit_data("x.js");
        let members = &data.js_classes[c as usize];
        let names: Vec<&str> = members.iter().map(|m| &*data.strings[m.name as usize]).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(members.iter().all(|m| m.is_accessor));
        assert!(data.js_classes[empty as usize].is_empty());
        assert!(!data.strings.iter().any(|s| &**s == "3"));
    }

    #[test]
    fn test_function_metadata() {
        let mut g = JsUnitGenerator::new();
        let f = ir::Function {
            name: Some(Rc::from("f")),
            formals: vec![Rc::from("a"), Rc::from("a")],
            locals: vec![Rc::from("x")],
            ..ir::Function::default()
        };
        g.register_function(&f);
        let data = g.generate_unit_data("x.js");
        let cf = &data.functions[0];
        assert_eq!(cf.formals, vec![1, 1]);
        assert_eq!(cf.name, Some(0));
        assert_eq!(&*data.strings[cf.locals[0] as usize], "x");
    }
}
