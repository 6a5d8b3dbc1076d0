mod api;
pub mod ast;
#[allow(non_fmt_panics)]
#[cfg(test)]
mod unit_tests;

pub use api::{parse_program, parse_to_ast, parse_to_token_tree, to_js_error, JsParser, Rule};
