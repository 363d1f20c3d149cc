//! Lexer and parser for policy expressions.
//!
//! Supported syntax:
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - Boolean operators: `&&`, `||`, `!`
//! - Membership: `x in list`, `key in map`
//! - Selection and indexing: `url.params.id`, `req.header["X-Api-Key"][0]`
//! - Calls: `size(x)`, `has(m.f)`, `s.startsWith(t)`, `s.endsWith(t)`, `s.contains(t)`
//! - Literals: integers, `"strings"` or `'strings'`, `true`, `false`, `[lists]`
//! - Parentheses for grouping
//!
//! Names are not resolved here; `url.path` parses as a field selection on the
//! identifier `url`, and the checker folds it back into a declared variable.

use crate::policy::errors::CompileError;

/// Maximum nesting of sub-expressions. Every `(`, unary operator, bracket,
/// chained `&&`/`||` operand and postfix `.field`/`[index]` counts one level,
/// which bounds the depth of the tree the checker and evaluator recurse over.
pub const MAX_DEPTH: usize = 128;

// ─── AST ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    /// 1-based column of the token that introduced this node.
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(LitValue),
    Ident(String),
    List(Vec<Expr>),
    Select {
        operand: Box<Expr>,
        field: String,
    },
    Index {
        operand: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        target: Option<Box<Expr>>,
        function: String,
        args: Vec<Expr>,
    },
    UnaryNot(Box<Expr>),
    Negate(Box<Expr>),
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    In {
        element: Box<Expr>,
        collection: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Gt => ">",
            BinOp::Lt => "<",
            BinOp::Ge => ">=",
            BinOp::Le => "<=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LitValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

// ─── Lexer ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    True,
    False,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eq,    // ==
    Ne,    // !=
    Gt,    // >
    Lt,    // <
    Ge,    // >=
    Le,    // <=
    And,   // &&
    Or,    // ||
    Not,   // !
    Minus, // -
    In,    // in
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    column: usize,
}

fn syntax(column: usize, message: impl Into<String>) -> CompileError {
    CompileError::SyntaxError {
        column,
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<Spanned>, CompileError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    let two = |i: usize, next: char| i + 1 < chars.len() && chars[i + 1] == next;

    while i < chars.len() {
        let column = i + 1;
        let (token, width) = match chars[i] {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
                continue;
            }
            '.' => (Token::Dot, 1),
            ',' => (Token::Comma, 1),
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            '[' => (Token::LBracket, 1),
            ']' => (Token::RBracket, 1),
            '-' => (Token::Minus, 1),
            '=' if two(i, '=') => (Token::Eq, 2),
            '=' => return Err(syntax(column, "unexpected `=` (did you mean `==`?)")),
            '!' if two(i, '=') => (Token::Ne, 2),
            '!' => (Token::Not, 1),
            '>' if two(i, '=') => (Token::Ge, 2),
            '>' => (Token::Gt, 1),
            '<' if two(i, '=') => (Token::Le, 2),
            '<' => (Token::Lt, 1),
            '&' if two(i, '&') => (Token::And, 2),
            '&' => return Err(syntax(column, "unexpected `&` (did you mean `&&`?)")),
            '|' if two(i, '|') => (Token::Or, 2),
            '|' => return Err(syntax(column, "unexpected `|` (did you mean `||`?)")),
            quote @ ('"' | '\'') => {
                let (s, consumed) = read_string(&chars[i..], quote, column)?;
                (Token::Str(s), consumed)
            }
            c if c.is_ascii_digit() => {
                let start = i;
                let mut end = i;
                while end < chars.len() && chars[end].is_ascii_digit() {
                    end += 1;
                }
                if end < chars.len() && chars[end] == '.' {
                    return Err(syntax(column, "floating-point literals are not supported"));
                }
                let digits: String = chars[start..end].iter().collect();
                let n: i64 = digits
                    .parse()
                    .map_err(|_| syntax(column, format!("integer literal `{digits}` out of range")))?;
                (Token::Int(n), end - start)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                let mut end = i;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                let word: String = chars[start..end].iter().collect();
                let token = match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "in" => Token::In,
                    _ => Token::Ident(word),
                };
                (token, end - start)
            }
            c => return Err(syntax(column, format!("unexpected character `{c}`"))),
        };
        tokens.push(Spanned { token, column });
        i += width;
    }
    Ok(tokens)
}

/// Read a quoted string starting at `chars[0]`; returns the unescaped text
/// and the number of chars consumed including both quotes.
fn read_string(chars: &[char], quote: char, column: usize) -> Result<(String, usize), CompileError> {
    let mut out = String::new();
    let mut i = 1;
    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((out, i + 1)),
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| syntax(column, "unterminated string literal"))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '\\' => '\\',
                    '"' => '"',
                    '\'' => '\'',
                    other => {
                        return Err(syntax(
                            column + i,
                            format!("unknown escape sequence `\\{other}`"),
                        ))
                    }
                });
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(syntax(column, "unterminated string literal"))
}

// ─── Parser ─────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    end_column: usize,
}

impl Parser {
    fn new(tokens: Vec<Spanned>, end_column: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            end_column,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn column(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|s| s.column)
            .unwrap_or(self.end_column)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|s| s.token.clone());
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: Token, what: &str) -> Result<(), CompileError> {
        let column = self.column();
        if self.advance() != Some(want) {
            return Err(syntax(column, format!("expected {what}")));
        }
        Ok(())
    }

    fn descend(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(syntax(
                self.column(),
                format!("expression nesting exceeds {MAX_DEPTH} levels"),
            ));
        }
        Ok(())
    }

    /// Entry: parse_or, with a nesting guard.
    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.descend()?;
        let expr = self.parse_or();
        self.depth -= 1;
        expr
    }

    /// or_expr = and_expr ("||" and_expr)*
    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let entered = self.depth;
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.descend()?;
            let column = self.column();
            self.advance();
            let right = self.parse_and()?;
            left = binary(BinOp::Or, left, right, column);
        }
        self.depth = entered;
        Ok(left)
    }

    /// and_expr = comparison ("&&" comparison)*
    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let entered = self.depth;
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.descend()?;
            let column = self.column();
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(BinOp::And, left, right, column);
        }
        self.depth = entered;
        Ok(left)
    }

    /// comparison = unary (("==" | "!=" | ">" | "<" | ">=" | "<=" | "in") unary)?
    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let left = self.parse_unary()?;
        let column = self.column();
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::Le) => BinOp::Le,
            Some(Token::In) => {
                self.advance();
                let right = self.parse_unary()?;
                return Ok(Expr {
                    kind: ExprKind::In {
                        element: Box::new(left),
                        collection: Box::new(right),
                    },
                    column,
                });
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Ok(binary(op, left, right, column))
    }

    /// unary = "!" unary | "-" unary | postfix
    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        let column = self.column();
        let wrap: fn(Box<Expr>) -> ExprKind = match self.peek() {
            Some(Token::Not) => ExprKind::UnaryNot,
            Some(Token::Minus) => ExprKind::Negate,
            _ => return self.parse_postfix(),
        };
        self.advance();
        self.descend()?;
        let operand = self.parse_unary();
        self.depth -= 1;
        Ok(Expr {
            kind: wrap(Box::new(operand?)),
            column,
        })
    }

    /// postfix = primary ("." IDENT | "." IDENT "(" args ")" | "[" expr "]")*
    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let entered = self.depth;
        let mut expr = self.parse_primary()?;
        loop {
            let column = self.column();
            match self.peek() {
                Some(Token::Dot) => {
                    self.descend()?;
                    self.advance();
                    let name = match self.advance() {
                        Some(Token::Ident(name)) => name,
                        _ => return Err(syntax(column, "expected identifier after `.`")),
                    };
                    if self.peek() == Some(&Token::LParen) {
                        self.advance();
                        let args = self.parse_args(Token::RParen, "closing parenthesis `)`")?;
                        expr = Expr {
                            kind: ExprKind::Call {
                                target: Some(Box::new(expr)),
                                function: name,
                                args,
                            },
                            column,
                        };
                    } else {
                        expr = Expr {
                            kind: ExprKind::Select {
                                operand: Box::new(expr),
                                field: name,
                            },
                            column,
                        };
                    }
                }
                Some(Token::LBracket) => {
                    self.descend()?;
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(Token::RBracket, "closing bracket `]`")?;
                    expr = Expr {
                        kind: ExprKind::Index {
                            operand: Box::new(expr),
                            index: Box::new(index),
                        },
                        column,
                    };
                }
                _ => {
                    self.depth = entered;
                    return Ok(expr);
                }
            }
        }
    }

    /// primary = literal | IDENT | IDENT "(" args ")" | "[" args "]" | "(" expr ")"
    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let column = self.column();
        let literal = |value| Expr {
            kind: ExprKind::Literal(value),
            column,
        };
        match self.advance() {
            Some(Token::Int(n)) => Ok(literal(LitValue::Int(n))),
            Some(Token::Str(s)) => Ok(literal(LitValue::Str(s))),
            Some(Token::True) => Ok(literal(LitValue::Bool(true))),
            Some(Token::False) => Ok(literal(LitValue::Bool(false))),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let args = self.parse_args(Token::RParen, "closing parenthesis `)`")?;
                    return Ok(Expr {
                        kind: ExprKind::Call {
                            target: None,
                            function: name,
                            args,
                        },
                        column,
                    });
                }
                Ok(Expr {
                    kind: ExprKind::Ident(name),
                    column,
                })
            }
            Some(Token::LBracket) => {
                let items = self.parse_args(Token::RBracket, "closing bracket `]`")?;
                Ok(Expr {
                    kind: ExprKind::List(items),
                    column,
                })
            }
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(Token::RParen, "closing parenthesis `)`")?;
                Ok(expr)
            }
            Some(other) => Err(syntax(column, format!("unexpected token {other:?}"))),
            None => Err(syntax(column, "unexpected end of expression")),
        }
    }

    /// Comma-separated expressions up to and including `close`.
    fn parse_args(&mut self, close: Token, what: &str) -> Result<Vec<Expr>, CompileError> {
        let mut args = Vec::new();
        if self.peek() == Some(&close) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.peek() == Some(&Token::Comma) {
                self.advance();
                continue;
            }
            self.expect(close, what)?;
            return Ok(args);
        }
    }
}

fn binary(op: BinOp, left: Expr, right: Expr, column: usize) -> Expr {
    Expr {
        kind: ExprKind::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        column,
    }
}

/// Parse a policy expression string into an AST.
pub fn parse_condition(input: &str) -> Result<Expr, CompileError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(syntax(1, "empty expression"));
    }
    let end_column = input.chars().count() + 1;
    let mut parser = Parser::new(tokens, end_column);
    let expr = parser.parse_expr()?;
    if let Some(trailing) = parser.tokens.get(parser.pos) {
        return Err(syntax(
            trailing.column,
            format!("unexpected trailing token {:?}", trailing.token),
        ));
    }
    Ok(expr)
}
