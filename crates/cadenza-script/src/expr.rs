//! Expressions in instrument bodies.
//!
//! Expressions are compiled once, at orchestra compile time, into trees
//! whose leaves are already resolved to channel indices, local-variable
//! slots, and p-field positions. Evaluation on the audio thread is a plain
//! tree walk with no name lookups and no allocation.

use cadenza_core::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(f32),
    Str(String),
    Punct(char),
    /// Two-character comparison operators: `>=`, `<=`, `==`, `!=`
    Cmp([char; 2]),
}

/// Split one orchestra line into tokens. `;` starts a comment.
pub fn tokenize(line: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ';' => break,
            c if c.is_whitespace() => {
                chars.next();
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value: f32 = text
                    .parse()
                    .map_err(|_| EngineError::Error(format!("bad number '{text}'")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(text));
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => text.push(c),
                        None => {
                            return Err(EngineError::Error("unterminated string".into()));
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '>' | '<' | '=' | '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Cmp([c, '=']));
                } else {
                    tokens.push(Token::Punct(c));
                }
            }
            '+' | '-' | '*' | '/' | '(' | ')' | ',' => {
                chars.next();
                tokens.push(Token::Punct(c));
            }
            other => {
                return Err(EngineError::Error(format!(
                    "unexpected character '{other}'"
                )));
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Sin,
    Cos,
    Sqrt,
    Abs,
    Min,
    Max,
    /// MIDI note number to frequency in Hz
    CpsMidiNn,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Const(f32),
    /// 1-based p-field (p1 = instrument tag, p2 = start, p3 = duration, ...)
    PField(usize),
    /// Voice-local variable slot
    Local(usize),
    /// Exported channel index
    Channel(usize),
    Neg(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
    /// Sine oscillator; `state` indexes the voice's phase slots
    Oscil {
        amp: Box<Expr>,
        freq: Box<Expr>,
        state: usize,
    },
    /// Table playback; `state` indexes the voice's position slots
    Sample {
        table: u32,
        amp: Box<Expr>,
        pitch: Box<Expr>,
        state: usize,
    },
}

/// Resolves bare identifiers while compiling an instrument body.
pub trait Resolve {
    fn resolve(&mut self, name: &str) -> Result<Expr>;
}

/// What expression evaluation reads from.
pub trait EvalContext {
    fn pfield(&self, idx: usize) -> f32;
    fn local(&self, slot: usize) -> f32;
    fn channel(&self, idx: usize) -> f32;
    /// Read and advance oscillator/sample state.
    fn oscil(&mut self, state: usize, amp: f32, freq: f32) -> f32;
    fn sample(&mut self, state: usize, table: u32, amp: f32, pitch: f32) -> f32;
}

pub fn eval(expr: &Expr, ctx: &mut dyn EvalContext) -> f32 {
    match expr {
        Expr::Const(value) => *value,
        Expr::PField(idx) => ctx.pfield(*idx),
        Expr::Local(slot) => ctx.local(*slot),
        Expr::Channel(idx) => ctx.channel(*idx),
        Expr::Neg(inner) => -eval(inner, ctx),
        Expr::Bin(op, lhs, rhs) => {
            let l = eval(lhs, ctx);
            let r = eval(rhs, ctx);
            match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => {
                    if r == 0.0 {
                        0.0
                    } else {
                        l / r
                    }
                }
                BinOp::Lt => f32::from(l < r),
                BinOp::Gt => f32::from(l > r),
                BinOp::Le => f32::from(l <= r),
                BinOp::Ge => f32::from(l >= r),
                BinOp::Eq => f32::from(l == r),
                BinOp::Ne => f32::from(l != r),
            }
        }
        Expr::Call(func, args) => {
            let a = args.first().map_or(0.0, |e| eval(e, ctx));
            match func {
                Func::Sin => a.sin(),
                Func::Cos => a.cos(),
                Func::Sqrt => a.max(0.0).sqrt(),
                Func::Abs => a.abs(),
                Func::Min => a.min(args.get(1).map_or(0.0, |e| eval(e, ctx))),
                Func::Max => a.max(args.get(1).map_or(0.0, |e| eval(e, ctx))),
                Func::CpsMidiNn => 440.0 * ((a - 69.0) / 12.0).exp2(),
            }
        }
        Expr::Oscil { amp, freq, state } => {
            let amp = eval(amp, ctx);
            let freq = eval(freq, ctx);
            ctx.oscil(*state, amp, freq)
        }
        Expr::Sample {
            table,
            amp,
            pitch,
            state,
        } => {
            let amp = eval(amp, ctx);
            let pitch = eval(pitch, ctx);
            ctx.sample(*state, *table, amp, pitch)
        }
    }
}

fn func_by_name(name: &str) -> Option<Func> {
    match name {
        "sin" => Some(Func::Sin),
        "cos" => Some(Func::Cos),
        "sqrt" => Some(Func::Sqrt),
        "abs" => Some(Func::Abs),
        "min" => Some(Func::Min),
        "max" => Some(Func::Max),
        "cpsmidinn" => Some(Func::CpsMidiNn),
        _ => None,
    }
}

/// Recursive-descent expression parser over a token slice.
pub struct ExprParser<'a> {
    tokens: &'a [Token],
    at: usize,
}

impl<'a> ExprParser<'a> {
    pub fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, at: 0 }
    }

    pub fn at_end(&self) -> bool {
        self.at >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.at)
    }

    fn bump(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.at);
        if token.is_some() {
            self.at += 1;
        }
        token
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.peek() == Some(&Token::Punct(c)) {
            self.at += 1;
            true
        } else {
            false
        }
    }

    /// Consume a separating comma, if present.
    pub fn eat_comma(&mut self) -> bool {
        self.eat_punct(',')
    }

    /// Parse one full expression; comparison has the lowest precedence.
    pub fn parse(&mut self, resolver: &mut dyn Resolve) -> Result<Expr> {
        let lhs = self.parse_additive(resolver)?;
        let op = match self.peek() {
            Some(Token::Punct('<')) => Some(BinOp::Lt),
            Some(Token::Punct('>')) => Some(BinOp::Gt),
            Some(Token::Cmp(['<', '='])) => Some(BinOp::Le),
            Some(Token::Cmp(['>', '='])) => Some(BinOp::Ge),
            Some(Token::Cmp(['=', '='])) => Some(BinOp::Eq),
            Some(Token::Cmp(['!', '='])) => Some(BinOp::Ne),
            _ => None,
        };
        if let Some(op) = op {
            self.at += 1;
            let rhs = self.parse_additive(resolver)?;
            return Ok(Expr::Bin(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self, resolver: &mut dyn Resolve) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative(resolver)?;
        loop {
            let op = match self.peek() {
                Some(Token::Punct('+')) => BinOp::Add,
                Some(Token::Punct('-')) => BinOp::Sub,
                _ => break,
            };
            self.at += 1;
            let rhs = self.parse_multiplicative(resolver)?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self, resolver: &mut dyn Resolve) -> Result<Expr> {
        let mut lhs = self.parse_unary(resolver)?;
        loop {
            let op = match self.peek() {
                Some(Token::Punct('*')) => BinOp::Mul,
                Some(Token::Punct('/')) => BinOp::Div,
                _ => break,
            };
            self.at += 1;
            let rhs = self.parse_unary(resolver)?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self, resolver: &mut dyn Resolve) -> Result<Expr> {
        if self.eat_punct('-') {
            return Ok(Expr::Neg(Box::new(self.parse_unary(resolver)?)));
        }
        self.parse_primary(resolver)
    }

    fn parse_primary(&mut self, resolver: &mut dyn Resolve) -> Result<Expr> {
        match self.bump().cloned() {
            Some(Token::Number(value)) => Ok(Expr::Const(value)),
            Some(Token::Punct('(')) => {
                let inner = self.parse(resolver)?;
                if !self.eat_punct(')') {
                    return Err(EngineError::Error("missing ')'".into()));
                }
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::Punct('(')) {
                    let func = func_by_name(&name).ok_or_else(|| {
                        EngineError::Error(format!("unknown function '{name}'"))
                    })?;
                    self.at += 1;
                    let mut args = Vec::new();
                    if !self.eat_punct(')') {
                        loop {
                            args.push(self.parse(resolver)?);
                            if self.eat_punct(')') {
                                break;
                            }
                            if !self.eat_punct(',') {
                                return Err(EngineError::Error(
                                    "expected ',' or ')' in call".into(),
                                ));
                            }
                        }
                    }
                    return Ok(Expr::Call(func, args));
                }
                resolver.resolve(&name)
            }
            other => Err(EngineError::Error(format!(
                "unexpected token in expression: {other:?}"
            ))),
        }
    }
}
