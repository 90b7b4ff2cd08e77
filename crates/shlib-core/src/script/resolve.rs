//! Free-symbol analysis for pipeline scripts.
//!
//! Locals are function-scoped: a name bound by `let` or by assignment stays
//! bound for the rest of the script, regardless of the block it was bound in.
//! Library method bodies are not analysed here; they resolve at run time
//! against the run's pinned snapshot.

use std::collections::HashSet;

use super::ast::{AssignTarget, Expr, Script, Stmt, StmtKind};
use super::is_builtin_step;

/// How a free name is used, which decides the symbol kind it must resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolUse {
    /// Read as a value: must be a global variable.
    Variable,
    /// Called as `name(..)`: a global variable with `call`, or a builtin step.
    Callable,
    /// Instantiated with `new`: must be a class.
    Class,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FreeSymbol {
    pub name: String,
    pub usage: SymbolUse,
}

/// Free symbols of `script` in order of first appearance.
///
/// Callable uses of builtin steps are still reported so the engine can let
/// a library variable shadow a step of the same name.
pub fn free_symbols(script: &Script) -> Vec<FreeSymbol> {
    let mut walker = Walker::default();
    walker.stmts(&script.body);
    walker.found
}

#[derive(Default)]
struct Walker {
    bound: HashSet<String>,
    seen: HashSet<FreeSymbol>,
    found: Vec<FreeSymbol>,
}

impl Walker {
    fn record(&mut self, name: &str, usage: SymbolUse) {
        let symbol = FreeSymbol {
            name: name.to_string(),
            usage,
        };
        if self.seen.insert(symbol.clone()) {
            self.found.push(symbol);
        }
    }

    fn stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let { name, value } => {
                self.expr(value);
                self.bound.insert(name.clone());
            }
            StmtKind::Assign { target, value } => {
                self.expr(value);
                match target {
                    AssignTarget::Ident(name) => {
                        self.bound.insert(name.clone());
                    }
                    AssignTarget::Property { target, .. } => self.expr(target),
                }
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.expr(cond);
                self.stmts(then_branch);
                self.stmts(else_branch);
            }
            StmtKind::While { cond, body } => {
                self.expr(cond);
                self.stmts(body);
            }
            StmtKind::Expr(expr) => self.expr(expr),
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Str(_) | Expr::Int(_) | Expr::Bool(_) | Expr::Null => {}
            Expr::Ident(name) => {
                if !self.bound.contains(name) {
                    self.record(name, SymbolUse::Variable);
                }
            }
            Expr::Property { target, .. } => self.expr(target),
            Expr::MethodCall { target, args, .. } => {
                self.expr(target);
                self.exprs(args);
            }
            Expr::Call { name, args } => {
                if !self.bound.contains(name) || is_builtin_step(name) {
                    self.record(name, SymbolUse::Callable);
                }
                self.exprs(args);
            }
            Expr::New { class, args } => {
                self.record(class, SymbolUse::Class);
                self.exprs(args);
            }
            Expr::Unary { operand, .. } => self.expr(operand),
            Expr::Binary { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
        }
    }

    fn exprs(&mut self, exprs: &[Expr]) {
        for expr in exprs {
            self.expr(expr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse_script;

    fn names(source: &str) -> Vec<(String, SymbolUse)> {
        free_symbols(&parse_script(source).unwrap())
            .into_iter()
            .map(|s| (s.name, s.usage))
            .collect()
    }

    #[test]
    fn test_variables_and_steps() {
        assert_eq!(
            names("acme.name = 'acmeName'\necho acme.name"),
            vec![
                ("acme".to_string(), SymbolUse::Variable),
                ("echo".to_string(), SymbolUse::Callable),
            ]
        );
    }

    #[test]
    fn test_locals_are_not_free() {
        assert_eq!(
            names("let greeting = 'hi'\ncount = 1\necho greeting + count"),
            vec![("echo".to_string(), SymbolUse::Callable)]
        );
    }

    #[test]
    fn test_use_before_binding_is_free() {
        assert_eq!(
            names("echo later\nlet later = 1"),
            vec![
                ("echo".to_string(), SymbolUse::Callable),
                ("later".to_string(), SymbolUse::Variable),
            ]
        );
    }

    #[test]
    fn test_class_instantiation() {
        assert_eq!(
            names("let g = new Greeting(acme)"),
            vec![
                ("Greeting".to_string(), SymbolUse::Class),
                ("acme".to_string(), SymbolUse::Variable),
            ]
        );
    }

    #[test]
    fn test_nested_blocks_are_walked() {
        let found = names("while (ready) {\n if (x) { missing.run() }\n}");
        assert!(found.contains(&("missing".to_string(), SymbolUse::Variable)));
        assert!(found.contains(&("ready".to_string(), SymbolUse::Variable)));
    }

    #[test]
    fn test_duplicates_reported_once() {
        let found = names("echo acme.a\necho acme.b");
        assert_eq!(found.len(), 2);
    }
}
