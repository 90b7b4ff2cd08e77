//! Tokenizer for library units and pipeline scripts.
//!
//! Newlines are significant as statement separators, except inside
//! parentheses where a call's argument list may span lines. Runs of blank
//! lines collapse into a single `Newline` token.

use std::iter::Peekable;
use std::str::Chars;

use super::SyntaxError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Str(String),
    Int(i64),

    // Keywords
    Def,
    Field,
    Let,
    Return,
    If,
    Else,
    While,
    New,
    True,
    False,
    Null,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Semi,
    Newline,

    // Operators
    Assign,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    AndAnd,
    OrOr,

    Eof,
}

impl TokenKind {
    /// Human-readable form used in parser diagnostics.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("identifier `{name}`"),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Int(n) => format!("integer `{n}`"),
            TokenKind::Newline => "end of line".to_string(),
            TokenKind::Eof => "end of input".to_string(),
            other => format!("`{}`", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            TokenKind::Def => "def",
            TokenKind::Field => "field",
            TokenKind::Let => "let",
            TokenKind::Return => "return",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::While => "while",
            TokenKind::New => "new",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Null => "null",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Comma => ",",
            TokenKind::Dot => ".",
            TokenKind::Semi => ";",
            TokenKind::Assign => "=",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::LtEq => "<=",
            TokenKind::Gt => ">",
            TokenKind::GtEq => ">=",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Bang => "!",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::Ident(_)
            | TokenKind::Str(_)
            | TokenKind::Int(_)
            | TokenKind::Newline
            | TokenKind::Eof => "",
        }
    }
}

/// A token and the 1-based line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
    paren_depth: usize,
    tokens: Vec<Token>,
}

/// Tokenize `source`. The result always ends with [`TokenKind::Eof`].
pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut lexer = Lexer {
        chars: source.chars().peekable(),
        line: 1,
        paren_depth: 0,
        tokens: Vec::new(),
    };
    while let Some(c) = lexer.chars.next() {
        lexer.scan(c)?;
    }
    lexer.push(TokenKind::Eof);
    Ok(lexer.tokens)
}

impl Lexer<'_> {
    fn push(&mut self, kind: TokenKind) {
        self.tokens.push(Token {
            kind,
            line: self.line,
        });
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            line: self.line,
            message: message.into(),
        }
    }

    /// Consume the next char if it equals `expected`.
    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek() == Some(&expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn scan(&mut self, c: char) -> Result<(), SyntaxError> {
        match c {
            '\n' => {
                if self.paren_depth == 0
                    && !matches!(
                        self.tokens.last().map(|t| &t.kind),
                        None | Some(TokenKind::Newline)
                    )
                {
                    self.push(TokenKind::Newline);
                }
                self.line += 1;
            }
            c if c.is_whitespace() => {}
            '/' if self.eat('/') => {
                while let Some(&next) = self.chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    self.chars.next();
                }
            }
            '(' => {
                self.paren_depth += 1;
                self.push(TokenKind::LParen);
            }
            ')' => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                self.push(TokenKind::RParen);
            }
            '{' => self.push(TokenKind::LBrace),
            '}' => self.push(TokenKind::RBrace),
            ',' => self.push(TokenKind::Comma),
            '.' => self.push(TokenKind::Dot),
            ';' => self.push(TokenKind::Semi),
            '+' => self.push(TokenKind::Plus),
            '-' => self.push(TokenKind::Minus),
            '*' => self.push(TokenKind::Star),
            '/' => self.push(TokenKind::Slash),
            '%' => self.push(TokenKind::Percent),
            '=' => {
                let kind = if self.eat('=') {
                    TokenKind::EqEq
                } else {
                    TokenKind::Assign
                };
                self.push(kind);
            }
            '!' => {
                let kind = if self.eat('=') {
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                };
                self.push(kind);
            }
            '<' => {
                let kind = if self.eat('=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                };
                self.push(kind);
            }
            '>' => {
                let kind = if self.eat('=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                };
                self.push(kind);
            }
            '&' if self.eat('&') => self.push(TokenKind::AndAnd),
            '|' if self.eat('|') => self.push(TokenKind::OrOr),
            '"' | '\'' => self.string(c)?,
            c if c.is_ascii_digit() => self.number(c)?,
            c if c.is_alphabetic() || c == '_' => self.word(c),
            other => return Err(self.error(format!("unexpected character `{other}`"))),
        }
        Ok(())
    }

    fn string(&mut self, quote: char) -> Result<(), SyntaxError> {
        let start_line = self.line;
        let mut value = String::new();
        loop {
            match self.chars.next() {
                None => {
                    return Err(SyntaxError {
                        line: start_line,
                        message: "unterminated string literal".to_string(),
                    })
                }
                Some(c) if c == quote => break,
                Some('\\') => match self.chars.next() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('\\') => value.push('\\'),
                    Some('"') => value.push('"'),
                    Some('\'') => value.push('\''),
                    Some(other) => {
                        return Err(self.error(format!("unknown escape `\\{other}`")));
                    }
                    None => {
                        return Err(SyntaxError {
                            line: start_line,
                            message: "unterminated string literal".to_string(),
                        })
                    }
                },
                Some('\n') => {
                    self.line += 1;
                    value.push('\n');
                }
                Some(c) => value.push(c),
            }
        }
        self.tokens.push(Token {
            kind: TokenKind::Str(value),
            line: start_line,
        });
        Ok(())
    }

    fn number(&mut self, first: char) -> Result<(), SyntaxError> {
        let mut digits = String::from(first);
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    digits.push(c);
                }
                self.chars.next();
            } else {
                break;
            }
        }
        let value = digits
            .parse::<i64>()
            .map_err(|_| self.error(format!("integer literal `{digits}` is out of range")))?;
        self.push(TokenKind::Int(value));
        Ok(())
    }

    fn word(&mut self, first: char) {
        let mut word = String::from(first);
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        let kind = match word.as_str() {
            "def" => TokenKind::Def,
            "field" => TokenKind::Field,
            "let" => TokenKind::Let,
            "return" => TokenKind::Return,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "new" => TokenKind::New,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            _ => TokenKind::Ident(word),
        };
        self.push(kind);
    }
}
