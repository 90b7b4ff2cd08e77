//! Syntax tree for library units and pipeline scripts.

use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(String),
    Int(i64),
    Bool(bool),
    Null,
    Ident(String),
    /// `target.name`
    Property { target: Box<Expr>, name: String },
    /// `target.method(args)`
    MethodCall {
        target: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    /// `name(args)` or command form `name arg, arg`
    Call { name: String, args: Vec<Expr> },
    /// `new Class(args)`
    New { class: String, args: Vec<Expr> },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    Ident(String),
    Property { target: Expr, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Let { name: String, value: Expr },
    Assign { target: AssignTarget, value: Expr },
    Return(Option<Expr>),
    If {
        cond: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Vec<Stmt>,
    },
    While { cond: Expr, body: Vec<Stmt> },
    Expr(Expr),
}

/// A statement tagged with the line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: String,
    pub init: Option<Expr>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub line: usize,
}

/// Compiled form of a variable or class source: declared fields in source
/// order plus methods by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Unit {
    pub fields: Vec<FieldDecl>,
    pub methods: BTreeMap<String, Arc<MethodDecl>>,
}

impl Unit {
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    /// Method `name` taking exactly `arity` parameters.
    pub fn method(&self, name: &str, arity: usize) -> Option<&Arc<MethodDecl>> {
        self.methods.get(name).filter(|m| m.params.len() == arity)
    }
}

/// A parsed pipeline script.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Script {
    pub body: Vec<Stmt>,
}
