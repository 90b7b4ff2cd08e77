//! The scripting language shared by library units and pipeline scripts.
//!
//! Library units (global variables and classes) are a list of
//! `field name [= expr]` and `def name(params) { .. }` members. Pipeline
//! scripts are a list of statements that reference library symbols by bare
//! name:
//!
//! ```text
//! acme.name = "acmeName"
//! echo acme.name
//! acme.caution("wet floor")
//! ```
//!
//! # Modules
//!
//! - [`lexer`]:   tokens with line numbers
//! - [`ast`]:     `Unit`, `Script`, statements and expressions
//! - [`parser`]:  `parse_unit()`, `parse_script()`
//! - [`resolve`]: free-symbol analysis used at define time
//! - [`eval`]:    async tree-walking evaluator used by the engine

pub mod ast;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod resolve;

pub use ast::{Script, Unit};
pub use eval::{Console, Interpreter, RuntimeError, Value};
pub use parser::{parse_script, parse_unit, MAX_NESTING};
pub use resolve::{free_symbols, FreeSymbol, SymbolUse};

/// Steps every script can call without a library definition.
pub const BUILTIN_STEPS: [&str; 4] = ["echo", "sleep", "error", "libraryResource"];

pub fn is_builtin_step(name: &str) -> bool {
    BUILTIN_STEPS.contains(&name)
}

/// A lexing or parsing failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct SyntaxError {
    pub line: usize,
    pub message: String,
}
