//! Band-math expression language.
//!
//! A closed arithmetic grammar, parsed by recursive descent:
//!
//! ```text
//! expr  := term (('+' | '-') term)*
//! term  := unary (('*' | '/') unary)*
//! unary := ('-' | '+') unary | power
//! power := atom (('^' | '**') unary)?
//! atom  := NUMBER | IDENT | IDENT '(' args ')' | '(' expr ')'
//! ```
//!
//! Identifiers resolve to a declared band, a coefficient, a constant (`pi`,
//! `e`) or one of the functions in [`Func`]. Nothing else is reachable from a
//! formula; unresolvable names are rejected before any raster is read.

use crate::error::{BandCalcError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Coefficient name to value.
pub type Coefficients = BTreeMap<String, f64>;

/// Built-in constants.
const CONSTANTS: [(&str, f64); 2] = [("pi", std::f64::consts::PI), ("e", std::f64::consts::E)];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Pow,
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Ident(name) => write!(f, "{}", name),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Pow => write!(f, "^"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
        }
    }
}

fn syntax_error(msg: impl fmt::Display) -> BandCalcError {
    BandCalcError::Validation(format!("syntax error: {}", msg))
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Pow);
                i += 2;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Pow);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Exponent only when digits follow: `2e3`, `1.5E-4`. A bare `e` is the constant.
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        while j < chars.len() && chars[j].is_ascii_digit() {
                            j += 1;
                        }
                        i = j;
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| syntax_error(format!("invalid number '{}'", literal)))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(syntax_error(format!("unexpected character '{}' at position {}", other, i)));
            }
        }
    }

    Ok(tokens)
}

/// Functions callable from a formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Abs,
    Sqrt,
    Exp,
    Log,
    Log10,
    Sin,
    Cos,
    Tan,
    Atan,
    Min,
    Max,
    Pow,
    Clip,
}

impl Func {
    pub const ALL: [Func; 13] = [
        Func::Abs,
        Func::Sqrt,
        Func::Exp,
        Func::Log,
        Func::Log10,
        Func::Sin,
        Func::Cos,
        Func::Tan,
        Func::Atan,
        Func::Min,
        Func::Max,
        Func::Pow,
        Func::Clip,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Func::Abs => "abs",
            Func::Sqrt => "sqrt",
            Func::Exp => "exp",
            Func::Log => "log",
            Func::Log10 => "log10",
            Func::Sin => "sin",
            Func::Cos => "cos",
            Func::Tan => "tan",
            Func::Atan => "atan",
            Func::Min => "min",
            Func::Max => "max",
            Func::Pow => "pow",
            Func::Clip => "clip",
        }
    }

    pub fn from_name(name: &str) -> Option<Func> {
        Func::ALL.into_iter().find(|f| f.name() == name)
    }

    /// `(min, max)` argument count; `None` max means variadic.
    fn arity(self) -> (usize, Option<usize>) {
        match self {
            Func::Min | Func::Max => (2, None),
            Func::Pow => (2, Some(2)),
            Func::Clip => (3, Some(3)),
            _ => (1, Some(1)),
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Func::Abs => args[0].abs(),
            Func::Sqrt => args[0].sqrt(),
            Func::Exp => args[0].exp(),
            Func::Log => args[0].ln(),
            Func::Log10 => args[0].log10(),
            Func::Sin => args[0].sin(),
            Func::Cos => args[0].cos(),
            Func::Tan => args[0].tan(),
            Func::Atan => args[0].atan(),
            Func::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
            Func::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Func::Pow => args[0].powf(args[1]),
            Func::Clip => args[0].max(args[1]).min(args[2]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Parsed but unresolved syntax tree.
#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Num(f64),
    Name(String),
    Neg(Box<Ast>),
    Binary(BinOp, Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
}

/// Deepest nesting a formula may use. Parentheses, calls, unary signs and
/// each link of an operator chain all count as one level.
pub const MAX_NESTING: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.advance() {
            Some(ref t) if *t == expected => Ok(()),
            Some(t) => Err(syntax_error(format!("expected '{}', found '{}'", expected, t))),
            None => Err(syntax_error(format!("expected '{}' at end of formula", expected))),
        }
    }

    fn parse(mut self) -> Result<Ast> {
        if self.tokens.is_empty() {
            return Err(syntax_error("empty formula"));
        }
        let ast = self.parse_expr()?;
        match self.peek() {
            None => Ok(ast),
            Some(t) => Err(syntax_error(format!("unexpected '{}'", t))),
        }
    }

    /// Chains build left-leaning trees, one level per operator.
    fn parse_expr(&mut self) -> Result<Ast> {
        let depth = self.depth;
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            self.enter()?;
            let right = self.parse_term()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Ast> {
        let depth = self.depth;
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.advance();
            self.enter()?;
            let right = self.parse_unary()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn enter(&mut self) -> Result<()> {
        if self.depth >= MAX_NESTING {
            return Err(BandCalcError::Validation("formula nesting too deep".to_string()));
        }
        self.depth += 1;
        Ok(())
    }

    /// Parentheses and calls recurse back through here.
    fn parse_unary(&mut self) -> Result<Ast> {
        self.enter()?;
        let ast = self.parse_signed()?;
        self.depth -= 1;
        Ok(ast)
    }

    fn parse_signed(&mut self) -> Result<Ast> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                Ok(Ast::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Ast> {
        let base = self.parse_atom()?;
        if let Some(Token::Pow) = self.peek() {
            self.advance();
            let exponent = self.parse_unary()?;
            return Ok(Ast::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<Ast> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Ast::Num(n)),
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.advance();
                    let mut args = Vec::new();
                    if let Some(Token::RParen) = self.peek() {
                        self.advance();
                        return Ok(Ast::Call(name, args));
                    }
                    loop {
                        args.push(self.parse_expr()?);
                        match self.advance() {
                            Some(Token::Comma) => continue,
                            Some(Token::RParen) => break,
                            Some(t) => return Err(syntax_error(format!("expected ',' or ')', found '{}'", t))),
                            None => return Err(syntax_error("unclosed function call")),
                        }
                    }
                    Ok(Ast::Call(name, args))
                } else {
                    Ok(Ast::Name(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(t) => Err(syntax_error(format!("unexpected '{}'", t))),
            None => Err(syntax_error("unexpected end of formula")),
        }
    }
}

/// Resolved expression over band slots.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Const(f64),
    Band(usize),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

impl Expr {
    fn eval(&self, values: &[f64]) -> f64 {
        match self {
            Expr::Const(v) => *v,
            Expr::Band(slot) => values[*slot],
            Expr::Neg(inner) => -inner.eval(values),
            Expr::Binary(op, lhs, rhs) => {
                let (l, r) = (lhs.eval(values), rhs.eval(values));
                match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                    BinOp::Pow => l.powf(r),
                }
            }
            Expr::Call(func, args) => {
                let args: Vec<f64> = args.iter().map(|a| a.eval(values)).collect();
                func.apply(&args)
            }
        }
    }

    fn collect_bands(&self, used: &mut BTreeSet<usize>) {
        match self {
            Expr::Band(slot) => {
                used.insert(*slot);
            }
            Expr::Neg(inner) => inner.collect_bands(used),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_bands(used);
                rhs.collect_bands(used);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_bands(used)),
            Expr::Const(_) => {}
        }
    }
}

/// A validated formula, ready to evaluate against per-pixel band values.
#[derive(Debug, Clone)]
pub struct Formula {
    text: String,
    bands: Vec<String>,
    expr: Expr,
    used: Vec<usize>,
}

impl Formula {
    /// Parse and validate `text` against the declared band names and coefficients.
    ///
    /// Band slots follow the order of `bands`. Every failure is a
    /// `Validation` error; no I/O happens here.
    pub fn compile<S: AsRef<str>>(text: &str, bands: &[S], coefficients: &Coefficients) -> Result<Formula> {
        let bands: Vec<String> = bands.iter().map(|b| b.as_ref().to_string()).collect();
        check_coefficients(&bands, coefficients)?;

        let tokens = tokenize(text)?;

        let unknown: BTreeSet<&str> = tokens
            .iter()
            .filter_map(|t| match t {
                Token::Ident(name) => Some(name.as_str()),
                _ => None,
            })
            .filter(|name| {
                !bands.iter().any(|b| b == name)
                    && !coefficients.contains_key(*name)
                    && !CONSTANTS.iter().any(|(c, _)| c == name)
                    && Func::from_name(name).is_none()
            })
            .collect();
        if !unknown.is_empty() {
            return Err(BandCalcError::Validation(format!(
                "unknown identifier(s) in formula: {} (bands: {}; coefficients: {}; functions: {})",
                unknown.into_iter().collect::<Vec<_>>().join(", "),
                list_or_none(bands.iter().map(String::as_str)),
                list_or_none(coefficients.keys().map(String::as_str)),
                Func::ALL.iter().map(|f| f.name()).collect::<Vec<_>>().join(", "),
            )));
        }

        let ast = Parser { tokens, pos: 0, depth: 0 }.parse()?;
        let expr = resolve(&ast, &bands, coefficients)?;

        let mut used = BTreeSet::new();
        expr.collect_bands(&mut used);

        Ok(Formula {
            text: text.to_string(),
            bands,
            expr,
            used: used.into_iter().collect(),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Declared bands in slot order.
    pub fn bands(&self) -> &[String] {
        &self.bands
    }

    /// Slots of the bands the formula actually references.
    pub fn used_slots(&self) -> &[usize] {
        &self.used
    }

    /// Evaluate with one value per declared band, in slot order.
    #[inline]
    pub fn eval(&self, values: &[f64]) -> f64 {
        self.expr.eval(values)
    }
}

fn list_or_none<'a>(names: impl Iterator<Item = &'a str>) -> String {
    let names: Vec<&str> = names.collect();
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn check_coefficients(bands: &[String], coefficients: &Coefficients) -> Result<()> {
    for (name, value) in coefficients {
        if !is_identifier(name) {
            return Err(BandCalcError::Validation(format!("coefficient name '{}' is not an identifier", name)));
        }
        if bands.iter().any(|b| b == name) {
            return Err(BandCalcError::Validation(format!("coefficient '{}' shadows a band of the same name", name)));
        }
        if Func::from_name(name).is_some() || CONSTANTS.iter().any(|(c, _)| c == name) {
            return Err(BandCalcError::Validation(format!("coefficient '{}' shadows a built-in name", name)));
        }
        if !value.is_finite() {
            return Err(BandCalcError::Validation(format!("coefficient '{}' is not finite: {}", name, value)));
        }
    }
    for band in bands {
        if !is_identifier(band) {
            return Err(BandCalcError::Validation(format!("band name '{}' is not an identifier", band)));
        }
    }
    Ok(())
}

fn resolve(ast: &Ast, bands: &[String], coefficients: &Coefficients) -> Result<Expr> {
    match ast {
        Ast::Num(v) => Ok(Expr::Const(*v)),
        Ast::Name(name) => {
            if let Some(slot) = bands.iter().position(|b| b == name) {
                Ok(Expr::Band(slot))
            } else if let Some(value) = coefficients.get(name) {
                Ok(Expr::Const(*value))
            } else if let Some((_, value)) = CONSTANTS.iter().find(|(c, _)| c == name) {
                Ok(Expr::Const(*value))
            } else if Func::from_name(name).is_some() {
                Err(BandCalcError::Validation(format!("function '{}' used without arguments", name)))
            } else {
                Err(BandCalcError::Validation(format!("unknown identifier '{}'", name)))
            }
        }
        Ast::Neg(inner) => Ok(Expr::Neg(Box::new(resolve(inner, bands, coefficients)?))),
        Ast::Binary(op, lhs, rhs) => Ok(Expr::Binary(
            *op,
            Box::new(resolve(lhs, bands, coefficients)?),
            Box::new(resolve(rhs, bands, coefficients)?),
        )),
        Ast::Call(name, args) => {
            let func = Func::from_name(name)
                .ok_or_else(|| BandCalcError::Validation(format!("'{}' is not a function", name)))?;
            let (min, max) = func.arity();
            if args.len() < min || max.is_some_and(|max| args.len() > max) {
                let expected = match max {
                    Some(max) if max == min => format!("{}", min),
                    Some(max) => format!("{} to {}", min, max),
                    None => format!("at least {}", min),
                };
                return Err(BandCalcError::Validation(format!(
                    "function '{}' takes {} argument(s), got {}",
                    name,
                    expected,
                    args.len()
                )));
            }
            let args = args
                .iter()
                .map(|a| resolve(a, bands, coefficients))
                .collect::<Result<Vec<_>>>()?;
            Ok(Expr::Call(func, args))
        }
    }
}
