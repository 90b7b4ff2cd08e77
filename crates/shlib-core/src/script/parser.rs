//! Recursive-descent parser.
//!
//! Precedence, lowest first: `||`, `&&`, `== !=`, `< <= > >=`, `+ -`,
//! `* / %`, unary `! -`, postfix `.name` / `.name(..)`.
//!
//! Nesting of expressions, blocks and operator chains is capped at
//! [`MAX_NESTING`] so every later pass over the tree stays shallow.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::ast::{
    AssignTarget, BinaryOp, Expr, FieldDecl, MethodDecl, Script, Stmt, StmtKind, UnaryOp, Unit,
};
use super::lexer::{tokenize, Token, TokenKind};
use super::SyntaxError;

/// Parse a variable or class source into a [`Unit`].
pub fn parse_unit(source: &str) -> Result<Unit, SyntaxError> {
    let tokens = tokenize(source)?;
    Parser::new(&tokens).unit()
}

/// Parse a pipeline script.
pub fn parse_script(source: &str) -> Result<Script, SyntaxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(&tokens);
    let body = parser.statements_until(&TokenKind::Eof)?;
    Ok(Script { body })
}

/// Deepest nesting of expressions and blocks a source may use.
pub const MAX_NESTING: usize = 64;

type ParseResult<T> = Result<T, SyntaxError>;

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    // ------------------------------------------------------------------
    // Token cursor
    // ------------------------------------------------------------------

    fn peek(&self) -> &TokenKind {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> &TokenKind {
        let idx = self.pos.min(self.tokens.len() - 1);
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        &self.tokens[idx].kind
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, context: &str) -> ParseResult<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("{} {context}", kind.describe())))
        }
    }

    fn expect_ident(&mut self, context: &str) -> ParseResult<String> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(&format!("identifier {context}"))),
        }
    }

    fn unexpected(&self, wanted: &str) -> SyntaxError {
        SyntaxError {
            line: self.line(),
            message: format!("expected {wanted}, found {}", self.peek().describe()),
        }
    }

    fn enter(&mut self) -> ParseResult<()> {
        if self.depth >= MAX_NESTING {
            return Err(SyntaxError {
                line: self.line(),
                message: format!("nested too deeply (limit {MAX_NESTING})"),
            });
        }
        self.depth += 1;
        Ok(())
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        self.enter()?;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), TokenKind::Newline | TokenKind::Semi) {
            self.advance();
        }
    }

    fn end_of_statement(&mut self) -> ParseResult<()> {
        match self.peek() {
            TokenKind::Newline | TokenKind::Semi => {
                self.advance();
                Ok(())
            }
            TokenKind::RBrace | TokenKind::Eof => Ok(()),
            _ => Err(self.unexpected("end of statement")),
        }
    }

    // ------------------------------------------------------------------
    // Library units
    // ------------------------------------------------------------------

    fn unit(&mut self) -> ParseResult<Unit> {
        let mut fields: Vec<FieldDecl> = Vec::new();
        let mut methods: BTreeMap<String, Arc<MethodDecl>> = BTreeMap::new();

        self.skip_separators();
        while !self.check(&TokenKind::Eof) {
            let line = self.line();
            match self.peek() {
                TokenKind::Field => {
                    self.advance();
                    let name = self.expect_ident("after `field`")?;
                    let init = if self.eat(&TokenKind::Assign) {
                        Some(self.expression()?)
                    } else {
                        None
                    };
                    if fields.iter().any(|f| f.name == name) || methods.contains_key(&name) {
                        return Err(duplicate_member(&name, line));
                    }
                    fields.push(FieldDecl { name, init, line });
                    self.end_of_statement()?;
                }
                TokenKind::Def => {
                    self.advance();
                    let name = self.expect_ident("after `def`")?;
                    let params = self.params()?;
                    let body = self.block()?;
                    if fields.iter().any(|f| f.name == name) || methods.contains_key(&name) {
                        return Err(duplicate_member(&name, line));
                    }
                    methods.insert(
                        name.clone(),
                        Arc::new(MethodDecl {
                            name,
                            params,
                            body,
                            line,
                        }),
                    );
                    self.end_of_statement()?;
                }
                _ => return Err(self.unexpected("`field` or `def`")),
            }
            self.skip_separators();
        }

        Ok(Unit { fields, methods })
    }

    fn params(&mut self) -> ParseResult<Vec<String>> {
        self.expect(&TokenKind::LParen, "to open the parameter list")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                let line = self.line();
                let name = self.expect_ident("in parameter list")?;
                if params.contains(&name) {
                    return Err(SyntaxError {
                        line,
                        message: format!("duplicate parameter `{name}`"),
                    });
                }
                params.push(name);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "to close the parameter list")?;
        Ok(params)
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn statements_until(&mut self, end: &TokenKind) -> ParseResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        self.skip_separators();
        while !self.check(end) {
            if self.check(&TokenKind::Eof) {
                return Err(self.unexpected(&end.describe()));
            }
            stmts.push(self.statement()?);
            self.end_of_statement()?;
            self.skip_separators();
        }
        Ok(stmts)
    }

    fn block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect(&TokenKind::LBrace, "to open a block")?;
        let body = self.nested(|p| p.statements_until(&TokenKind::RBrace))?;
        self.expect(&TokenKind::RBrace, "to close the block")?;
        Ok(body)
    }

    fn statement(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        let kind = match self.peek() {
            TokenKind::Let => {
                self.advance();
                let name = self.expect_ident("after `let`")?;
                self.expect(&TokenKind::Assign, "after the variable name")?;
                let value = self.expression()?;
                StmtKind::Let { name, value }
            }
            TokenKind::Return => {
                self.advance();
                let value = match self.peek() {
                    TokenKind::Newline | TokenKind::Semi | TokenKind::RBrace | TokenKind::Eof => {
                        None
                    }
                    _ => Some(self.expression()?),
                };
                StmtKind::Return(value)
            }
            TokenKind::If => return self.nested(Self::if_statement),
            TokenKind::While => {
                self.advance();
                self.expect(&TokenKind::LParen, "after `while`")?;
                let cond = self.expression()?;
                self.expect(&TokenKind::RParen, "after the loop condition")?;
                let body = self.block()?;
                StmtKind::While { cond, body }
            }
            TokenKind::Ident(name) if starts_command_argument(self.peek_at(1)) => {
                let name = name.clone();
                self.advance();
                let args = self.command_arguments()?;
                StmtKind::Expr(Expr::Call { name, args })
            }
            _ => {
                let expr = self.expression()?;
                if self.eat(&TokenKind::Assign) {
                    let target = match expr {
                        Expr::Ident(name) => AssignTarget::Ident(name),
                        Expr::Property { target, name } => AssignTarget::Property {
                            target: *target,
                            name,
                        },
                        _ => {
                            return Err(SyntaxError {
                                line,
                                message: "invalid assignment target".to_string(),
                            })
                        }
                    };
                    let value = self.expression()?;
                    StmtKind::Assign { target, value }
                } else {
                    StmtKind::Expr(expr)
                }
            }
        };
        Ok(Stmt { kind, line })
    }

    fn if_statement(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.expect(&TokenKind::If, "")?;
        self.expect(&TokenKind::LParen, "after `if`")?;
        let cond = self.expression()?;
        self.expect(&TokenKind::RParen, "after the condition")?;
        let then_branch = self.block()?;

        // `else` may sit on the line after the closing brace.
        let mut lookahead = 0;
        while self.peek_at(lookahead) == &TokenKind::Newline {
            lookahead += 1;
        }
        let else_branch = if self.peek_at(lookahead) == &TokenKind::Else {
            for _ in 0..=lookahead {
                self.advance();
            }
            if self.check(&TokenKind::If) {
                vec![self.nested(Self::if_statement)?]
            } else {
                self.block()?
            }
        } else {
            Vec::new()
        };

        Ok(Stmt {
            kind: StmtKind::If {
                cond,
                then_branch,
                else_branch,
            },
            line,
        })
    }

    fn command_arguments(&mut self) -> ParseResult<Vec<Expr>> {
        let mut args = vec![self.expression()?];
        while self.eat(&TokenKind::Comma) {
            args.push(self.expression()?);
        }
        Ok(args)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expression(&mut self) -> ParseResult<Expr> {
        self.nested(Self::or)
    }

    /// Left-associative chain `next (op next)*`. Each operator adds one
    /// level to the tree, so the chain length counts toward the nesting cap.
    fn chain(
        &mut self,
        next: fn(&mut Self) -> ParseResult<Expr>,
        operator: fn(&TokenKind) -> Option<BinaryOp>,
    ) -> ParseResult<Expr> {
        let mut left = next(self)?;
        let mut levels = 0;
        while let Some(op) = operator(self.peek()) {
            self.advance();
            self.enter()?;
            levels += 1;
            let right = next(self)?;
            left = binary(op, left, right);
        }
        self.depth -= levels;
        Ok(left)
    }

    fn or(&mut self) -> ParseResult<Expr> {
        self.chain(Self::and, |kind| match kind {
            TokenKind::OrOr => Some(BinaryOp::Or),
            _ => None,
        })
    }

    fn and(&mut self) -> ParseResult<Expr> {
        self.chain(Self::equality, |kind| match kind {
            TokenKind::AndAnd => Some(BinaryOp::And),
            _ => None,
        })
    }

    fn equality(&mut self) -> ParseResult<Expr> {
        self.chain(Self::comparison, |kind| match kind {
            TokenKind::EqEq => Some(BinaryOp::Eq),
            TokenKind::NotEq => Some(BinaryOp::NotEq),
            _ => None,
        })
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        self.chain(Self::term, |kind| match kind {
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::LtEq => Some(BinaryOp::LtEq),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::GtEq => Some(BinaryOp::GtEq),
            _ => None,
        })
    }

    fn term(&mut self) -> ParseResult<Expr> {
        self.chain(Self::factor, |kind| match kind {
            TokenKind::Plus => Some(BinaryOp::Add),
            TokenKind::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn factor(&mut self) -> ParseResult<Expr> {
        self.chain(Self::unary, |kind| match kind {
            TokenKind::Star => Some(BinaryOp::Mul),
            TokenKind::Slash => Some(BinaryOp::Div),
            TokenKind::Percent => Some(BinaryOp::Rem),
            _ => None,
        })
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let op = match self.peek() {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        self.advance();
        let operand = self.nested(Self::unary)?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;
        let mut levels = 0;
        while self.eat(&TokenKind::Dot) {
            self.enter()?;
            levels += 1;
            let name = self.expect_ident("after `.`")?;
            if self.check(&TokenKind::LParen) {
                let args = self.arguments()?;
                expr = Expr::MethodCall {
                    target: Box::new(expr),
                    method: name,
                    args,
                };
            } else {
                expr = Expr::Property {
                    target: Box::new(expr),
                    name,
                };
            }
        }
        self.depth -= levels;
        Ok(expr)
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let expr = match self.peek().clone() {
            TokenKind::Str(value) => {
                self.advance();
                Expr::Str(value)
            }
            TokenKind::Int(value) => {
                self.advance();
                Expr::Int(value)
            }
            TokenKind::True => {
                self.advance();
                Expr::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                Expr::Bool(false)
            }
            TokenKind::Null => {
                self.advance();
                Expr::Null
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.check(&TokenKind::LParen) {
                    let args = self.arguments()?;
                    Expr::Call { name, args }
                } else {
                    Expr::Ident(name)
                }
            }
            TokenKind::New => {
                self.advance();
                let class = self.expect_ident("after `new`")?;
                let args = if self.check(&TokenKind::LParen) {
                    self.arguments()?
                } else {
                    Vec::new()
                };
                Expr::New { class, args }
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(&TokenKind::RParen, "to close the parenthesis")?;
                inner
            }
            _ => return Err(self.unexpected("an expression")),
        };
        Ok(expr)
    }

    fn arguments(&mut self) -> ParseResult<Vec<Expr>> {
        self.expect(&TokenKind::LParen, "to open the argument list")?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                args.push(self.expression()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "to close the argument list")?;
        Ok(args)
    }
}

/// Tokens that may follow a bare identifier to form a command statement
/// such as `echo "hi"` or `sleep 10`.
fn starts_command_argument(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Str(_)
            | TokenKind::Int(_)
            | TokenKind::Ident(_)
            | TokenKind::True
            | TokenKind::False
            | TokenKind::Null
            | TokenKind::New
            | TokenKind::Bang
    )
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn duplicate_member(name: &str, line: usize) -> SyntaxError {
    SyntaxError {
        line,
        message: format!("duplicate member `{name}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACME: &str = r#"
        field name = ""

        def setName(value) {
            name = value
        }

        def getName() {
            return name
        }

        def caution(message) {
            echo "Hello, " + name + "! CAUTION: " + message
        }
    "#;

    #[test]
    fn test_parse_unit_members() {
        let unit = parse_unit(ACME).unwrap();
        assert_eq!(unit.fields.len(), 1);
        assert_eq!(unit.fields[0].name, "name");
        assert_eq!(unit.fields[0].init, Some(Expr::Str(String::new())));
        assert!(unit.method("setName", 1).is_some());
        assert!(unit.method("getName", 0).is_some());
        assert!(unit.method("caution", 1).is_some());
        assert!(unit.method("caution", 2).is_none());
    }

    #[test]
    fn test_command_statement() {
        let script = parse_script("echo 'a', 1\nsleep 5").unwrap();
        assert_eq!(script.body.len(), 2);
        assert_eq!(
            script.body[0].kind,
            StmtKind::Expr(Expr::Call {
                name: "echo".into(),
                args: vec![Expr::Str("a".into()), Expr::Int(1)],
            })
        );
        assert_eq!(script.body[1].line, 2);
    }

    #[test]
    fn test_property_assignment() {
        let script = parse_script("acme.name = 'acmeName'").unwrap();
        match &script.body[0].kind {
            StmtKind::Assign {
                target: AssignTarget::Property { target, name },
                value,
            } => {
                assert_eq!(*target, Expr::Ident("acme".into()));
                assert_eq!(name, "name");
                assert_eq!(*value, Expr::Str("acmeName".into()));
            }
            other => panic!("expected property assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_precedence() {
        let script = parse_script("let x = 1 + 2 * 3 == 7 && !false").unwrap();
        let StmtKind::Let { value, .. } = &script.body[0].kind else {
            panic!("expected let");
        };
        let Expr::Binary { op, left, .. } = value else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::And);
        let Expr::Binary { op, left, .. } = left.as_ref() else {
            panic!("expected equality");
        };
        assert_eq!(*op, BinaryOp::Eq);
        let Expr::Binary { op, right, .. } = left.as_ref() else {
            panic!("expected addition");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            right.as_ref(),
            Expr::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_if_else_chain_across_lines() {
        let script = parse_script(
            "if (a) {\n echo 'a'\n}\nelse if (b) {\n echo 'b'\n} else {\n echo 'c'\n}\necho 'd'",
        )
        .unwrap();
        assert_eq!(script.body.len(), 2);
        let StmtKind::If { else_branch, .. } = &script.body[0].kind else {
            panic!("expected if");
        };
        assert_eq!(else_branch.len(), 1);
        assert!(matches!(
            &else_branch[0].kind,
            StmtKind::If { else_branch, .. } if else_branch.len() == 1
        ));
    }

    #[test]
    fn test_method_chain_and_new() {
        let script = parse_script("echo new Greeting('x').render(acme.name).length()").unwrap();
        let StmtKind::Expr(Expr::Call { args, .. }) = &script.body[0].kind else {
            panic!("expected command");
        };
        let Expr::MethodCall { target, method, .. } = &args[0] else {
            panic!("expected method call");
        };
        assert_eq!(method, "length");
        assert!(matches!(target.as_ref(), Expr::MethodCall { method, .. } if method == "render"));
    }

    #[test]
    fn test_unbalanced_braces_reported_with_line() {
        let err = parse_unit("def broken() {\n  echo 'x'\n").unwrap_err();
        assert!(err.message.contains("`}`"), "{err}");
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let err = parse_unit("field name\ndef name() { return 1 }").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("duplicate member `name`"));
    }

    #[test]
    fn test_garbage_at_top_level_of_unit() {
        let err = parse_unit("this is not a library").unwrap_err();
        assert!(err.message.contains("`field` or `def`"));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse_script("1 = 2").unwrap_err();
        assert!(err.message.contains("invalid assignment target"));
    }

    #[test]
    fn test_nesting_limit_covers_every_form() {
        let deep = MAX_NESTING + 1;
        let cases = [
            format!("let x = {}1", "(".repeat(100_000)),
            format!("let x = {}true", "!".repeat(deep)),
            format!("let x = 1{}", " + 1".repeat(deep)),
            format!("let x = acme{}", ".next".repeat(deep)),
            format!("{}echo 1{}", "if (true) {\n".repeat(deep), "\n}".repeat(deep)),
            format!("if (a) {{ }}{}", " else if (a) { }".repeat(deep)),
        ];
        for source in &cases {
            let err = parse_script(source).unwrap_err();
            assert!(err.message.contains("nested too deeply"), "{err}");
        }

        let err = parse_unit(&format!("field x = {}", "(".repeat(100_000))).unwrap_err();
        assert!(err.message.contains("nested too deeply"), "{err}");
    }

    #[test]
    fn test_nesting_below_limit_parses() {
        let shallow = MAX_NESTING / 4;
        assert!(parse_script(&format!("let x = 1{}", " + 1".repeat(shallow))).is_ok());
        assert!(parse_script(&format!(
            "let x = {}1{}",
            "(".repeat(shallow),
            ")".repeat(shallow)
        ))
        .is_ok());
        // Sibling expressions do not accumulate depth.
        let siblings = "let x = (((1)))\n".repeat(MAX_NESTING * 2);
        assert!(parse_script(&siblings).is_ok());
    }

    #[test]
    fn test_statements_need_separators() {
        assert!(parse_script("let a = 1 let b = 2").is_err());
        assert!(parse_script("let a = 1; let b = 2").is_ok());
    }
}
