//! Grading formulas.
//!
//! A formula is an arithmetic expression over four names: `ex_sum`,
//! `mid_term`, `finals` and `num_exercises`. Formulas are typed by
//! administrators, so the whitelist is enforced by the grammar itself: the
//! lexer only produces tokens for those names, numbers and `+ - * / ( )`.

use thiserror::Error;

/// Maximum parenthesis/unary nesting accepted by the parser.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variable {
    ExSum,
    MidTerm,
    Finals,
    NumExercises,
}

impl Variable {
    pub const ALL: [Variable; 4] = [
        Variable::ExSum,
        Variable::MidTerm,
        Variable::Finals,
        Variable::NumExercises,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ex_sum" => Some(Self::ExSum),
            "mid_term" => Some(Self::MidTerm),
            "finals" => Some(Self::Finals),
            "num_exercises" => Some(Self::NumExercises),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ExSum => "ex_sum",
            Self::MidTerm => "mid_term",
            Self::Finals => "finals",
            Self::NumExercises => "num_exercises",
        }
    }
}

fn allowed_names() -> String {
    Variable::ALL
        .iter()
        .map(|v| v.name())
        .collect::<Vec<_>>()
        .join(", ")
}

fn quote_chars(chars: &[char]) -> String {
    chars
        .iter()
        .map(|c| format!("'{}'", c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Values the formula is evaluated against. This is the whole namespace.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bindings {
    pub ex_sum: f64,
    pub mid_term: f64,
    pub finals: f64,
    pub num_exercises: f64,
}

impl Bindings {
    fn get(&self, var: Variable) -> f64 {
        match var {
            Variable::ExSum => self.ex_sum,
            Variable::MidTerm => self.mid_term,
            Variable::Finals => self.finals,
            Variable::NumExercises => self.num_exercises,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("formula must not be empty")]
    Empty,

    #[error("unknown variable(s): {}; allowed: {}", .names.join(", "), allowed_names())]
    UnknownVariables { names: Vec<String> },

    #[error("illegal character(s): {}", quote_chars(.chars))]
    IllegalCharacters { chars: Vec<char> },

    #[error("invalid number '{lexeme}' at column {column}")]
    InvalidNumber { lexeme: String, column: usize },

    #[error("{message} at column {column}")]
    Syntax { message: String, column: usize },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("formula produced a non-finite result")]
    NonFinite,

    #[error(transparent)]
    Formula(#[from] FormulaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

impl Op {
    fn symbol(self) -> char {
        match self {
            Op::Add => '+',
            Op::Sub => '-',
            Op::Mul => '*',
            Op::Div => '/',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Var(Variable),
    Op(Op),
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    lexeme: String,
    column: usize,
}

fn lex(src: &str) -> Result<Vec<Token>, FormulaError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut unknown: Vec<String> = Vec::new();
    let mut illegal: Vec<char> = Vec::new();
    let mut bad_number: Option<(String, usize)> = None;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let column = i + 1;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if word == "x" || word == "X" {
                tokens.push(Token {
                    kind: TokenKind::Op(Op::Mul),
                    lexeme: "*".to_string(),
                    column,
                });
            } else if let Some(var) = Variable::from_name(&word) {
                tokens.push(Token {
                    kind: TokenKind::Var(var),
                    lexeme: word,
                    column,
                });
            } else if !unknown.contains(&word) {
                unknown.push(word);
            }
            continue;
        }

        if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let lexeme: String = chars[start..i].iter().collect();
            match lexeme.parse::<f64>() {
                Ok(n) if lexeme.chars().any(|ch| ch.is_ascii_digit()) => tokens.push(Token {
                    kind: TokenKind::Number(n),
                    lexeme,
                    column,
                }),
                _ => {
                    if bad_number.is_none() {
                        bad_number = Some((lexeme, column));
                    }
                }
            }
            continue;
        }

        let kind = match c {
            '+' => Some(TokenKind::Op(Op::Add)),
            '-' => Some(TokenKind::Op(Op::Sub)),
            '*' => Some(TokenKind::Op(Op::Mul)),
            '/' => Some(TokenKind::Op(Op::Div)),
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            _ => None,
        };
        match kind {
            Some(kind) => tokens.push(Token {
                kind,
                lexeme: c.to_string(),
                column,
            }),
            None => {
                if !illegal.contains(&c) {
                    illegal.push(c);
                }
            }
        }
        i += 1;
    }

    if !unknown.is_empty() {
        return Err(FormulaError::UnknownVariables { names: unknown });
    }
    if !illegal.is_empty() {
        return Err(FormulaError::IllegalCharacters { chars: illegal });
    }
    if let Some((lexeme, column)) = bad_number {
        return Err(FormulaError::InvalidNumber { lexeme, column });
    }
    if tokens.is_empty() {
        return Err(FormulaError::Empty);
    }
    Ok(tokens)
}

/// Sums and products are kept flat so long chains never deepen the tree;
/// only parentheses and unary signs nest, and those are bounded by `MAX_DEPTH`.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Var(Variable),
    Neg(Box<Expr>),
    Chain { first: Box<Expr>, rest: Vec<(Op, Expr)> },
}

fn apply(op: Op, a: f64, b: f64) -> Result<f64, EvalError> {
    let out = match op {
        Op::Add => a + b,
        Op::Sub => a - b,
        Op::Mul => a * b,
        Op::Div => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            a / b
        }
    };
    if out.is_finite() {
        Ok(out)
    } else {
        Err(EvalError::NonFinite)
    }
}

impl Expr {
    fn chain(first: Expr, rest: Vec<(Op, Expr)>) -> Expr {
        if rest.is_empty() {
            first
        } else {
            Expr::Chain {
                first: Box::new(first),
                rest,
            }
        }
    }

    fn eval(&self, bindings: &Bindings) -> Result<f64, EvalError> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Var(v) => Ok(bindings.get(*v)),
            Expr::Neg(inner) => Ok(-inner.eval(bindings)?),
            Expr::Chain { first, rest } => {
                let mut acc = first.eval(bindings)?;
                for (op, operand) in rest {
                    acc = apply(*op, acc, operand.eval(bindings)?)?;
                }
                Ok(acc)
            }
        }
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    end_column: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn column(&self) -> usize {
        self.peek().map(|t| t.column).unwrap_or(self.end_column)
    }

    fn syntax(&self, message: impl Into<String>) -> FormulaError {
        FormulaError::Syntax {
            message: message.into(),
            column: self.column(),
        }
    }

    fn expr(&mut self, depth: usize) -> Result<Expr, FormulaError> {
        let first = self.term(depth)?;
        let mut rest = Vec::new();
        while let Some(Token {
            kind: TokenKind::Op(op @ (Op::Add | Op::Sub)),
            ..
        }) = self.peek()
        {
            self.pos += 1;
            rest.push((*op, self.term(depth)?));
        }
        Ok(Expr::chain(first, rest))
    }

    fn term(&mut self, depth: usize) -> Result<Expr, FormulaError> {
        let first = self.unary(depth)?;
        let mut rest = Vec::new();
        while let Some(Token {
            kind: TokenKind::Op(op @ (Op::Mul | Op::Div)),
            ..
        }) = self.peek()
        {
            self.pos += 1;
            rest.push((*op, self.unary(depth)?));
        }
        Ok(Expr::chain(first, rest))
    }

    fn unary(&mut self, depth: usize) -> Result<Expr, FormulaError> {
        if depth > MAX_DEPTH {
            return Err(self.syntax("formula nests too deeply"));
        }
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Op(Op::Sub)) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary(depth + 1)?)))
            }
            Some(TokenKind::Op(Op::Add)) => {
                self.pos += 1;
                self.unary(depth + 1)
            }
            _ => self.primary(depth),
        }
    }

    fn primary(&mut self, depth: usize) -> Result<Expr, FormulaError> {
        let Some(token) = self.peek() else {
            return Err(self.syntax("unexpected end of formula"));
        };
        match &token.kind {
            TokenKind::Number(n) => {
                self.pos += 1;
                Ok(Expr::Number(*n))
            }
            TokenKind::Var(v) => {
                self.pos += 1;
                Ok(Expr::Var(*v))
            }
            TokenKind::LParen => {
                self.pos += 1;
                let inner = self.expr(depth + 1)?;
                match self.peek().map(|t| &t.kind) {
                    Some(TokenKind::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(self.syntax("expected ')'")),
                }
            }
            TokenKind::RParen => Err(self.syntax("unexpected ')'")),
            TokenKind::Op(op) => Err(self.syntax(format!("unexpected '{}'", op.symbol()))),
        }
    }
}

/// A validated, parsed grading formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    /// Source with whitespace removed and `x` rewritten to `*`.
    normalized: String,
    expr: Expr,
}

impl Formula {
    pub fn parse(src: &str) -> Result<Self, FormulaError> {
        let tokens = lex(src)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            end_column: src.chars().count() + 1,
        };
        let expr = parser.expr(0)?;
        if let Some(extra) = parser.peek() {
            return Err(FormulaError::Syntax {
                message: format!("unexpected '{}'", extra.lexeme),
                column: extra.column,
            });
        }
        let normalized = tokens.iter().map(|t| t.lexeme.as_str()).collect();
        Ok(Self { normalized, expr })
    }

    pub fn eval(&self, bindings: &Bindings) -> Result<f64, EvalError> {
        self.expr.eval(bindings)
    }
}

/// Checks an administrator-supplied formula and returns the text to persist.
pub fn validate(src: &str) -> Result<String, FormulaError> {
    Formula::parse(src).map(|f| f.normalized)
}

pub fn evaluate(src: &str, bindings: &Bindings) -> Result<f64, EvalError> {
    Ok(Formula::parse(src)?.eval(bindings)?)
}
