//! Expression language for plugin outputs.
//!
//! Plugins never run host code. Each output is an expression over the
//! current tick's inputs, evaluated by a small interpreter with bounded
//! source length, node count, and nesting depth.
//!
//! ```text
//! expr     := or
//! or       := and ("||" and)*
//! and      := cmp ("&&" cmp)*
//! cmp      := sum (("==" | "!=" | "<" | "<=" | ">" | ">=") sum)*
//! sum      := product (("+" | "-") product)*
//! product  := power (("*" | "/" | "%") power)*
//! power    := unary ("^" power)?
//! unary    := ("-" | "!") power | primary
//! primary  := number | "null" | "true" | "false" | "pi" | "tick" | in<N>
//!           | name "(" args ")" | "(" expr ")"
//! ```
//!
//! Values are numbers or null. Arithmetic, comparison, and logic on a null
//! operand yield null; `coalesce`, `is_null`, and `if` are the ways to
//! handle nulls explicitly.
//!
//! Window functions take a bare input reference and look at the last
//! `window` non-null values of that input, including the current one:
//! `mean sum wmin wmax count delta` (newest minus oldest). `prev(inN)` is
//! the most recent non-null value from an earlier tick.

use std::collections::VecDeque;
use thiserror::Error;

pub const MAX_SOURCE_LEN: usize = 4096;
pub const MAX_NODES: usize = 512;
pub const MAX_DEPTH: usize = 32;
/// Highest input index an expression may reference.
pub const MAX_INPUT_INDEX: usize = 63;

/// Compile error with the character position it was found at.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at position {position}")]
pub struct ExprError {
    pub message: String,
    pub position: usize,
}

impl ExprError {
    fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// `(operator, precedence, right associative)`
    fn lookup(op: &str) -> Option<(BinOp, u8, bool)> {
        Some(match op {
            "||" => (BinOp::Or, 1, false),
            "&&" => (BinOp::And, 2, false),
            "==" => (BinOp::Eq, 3, false),
            "!=" => (BinOp::Ne, 3, false),
            "<" => (BinOp::Lt, 3, false),
            "<=" => (BinOp::Le, 3, false),
            ">" => (BinOp::Gt, 3, false),
            ">=" => (BinOp::Ge, 3, false),
            "+" => (BinOp::Add, 4, false),
            "-" => (BinOp::Sub, 4, false),
            "*" => (BinOp::Mul, 5, false),
            "/" => (BinOp::Div, 5, false),
            "%" => (BinOp::Rem, 5, false),
            "^" => (BinOp::Pow, 6, true),
            _ => return None,
        })
    }

    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            BinOp::Rem => a % b,
            BinOp::Pow => a.powf(b),
            BinOp::Eq => truth(a == b),
            BinOp::Ne => truth(a != b),
            BinOp::Lt => truth(a < b),
            BinOp::Le => truth(a <= b),
            BinOp::Gt => truth(a > b),
            BinOp::Ge => truth(a >= b),
            BinOp::And => truth(a != 0.0 && b != 0.0),
            BinOp::Or => truth(a != 0.0 || b != 0.0),
        }
    }
}

const POW_PRECEDENCE: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    Abs,
    Sqrt,
    Ln,
    Log10,
    Exp,
    Floor,
    Ceil,
    Round,
    Min,
    Max,
    Clamp,
    If,
    Coalesce,
    IsNull,
}

impl Func {
    fn lookup(name: &str) -> Option<Func> {
        Some(match name {
            "abs" => Func::Abs,
            "sqrt" => Func::Sqrt,
            "ln" => Func::Ln,
            "log10" => Func::Log10,
            "exp" => Func::Exp,
            "floor" => Func::Floor,
            "ceil" => Func::Ceil,
            "round" => Func::Round,
            "min" => Func::Min,
            "max" => Func::Max,
            "clamp" => Func::Clamp,
            "if" => Func::If,
            "coalesce" => Func::Coalesce,
            "is_null" => Func::IsNull,
            _ => return None,
        })
    }

    /// `(min, max)` argument count
    fn arity(self) -> (usize, usize) {
        match self {
            Func::Min | Func::Max | Func::Coalesce => (1, usize::MAX),
            Func::Clamp | Func::If => (3, 3),
            _ => (1, 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum WindowFn {
    Prev,
    Mean,
    Sum,
    Min,
    Max,
    Count,
    Delta,
}

impl WindowFn {
    fn lookup(name: &str) -> Option<WindowFn> {
        Some(match name {
            "prev" => WindowFn::Prev,
            "mean" => WindowFn::Mean,
            "sum" => WindowFn::Sum,
            "wmin" => WindowFn::Min,
            "wmax" => WindowFn::Max,
            "count" => WindowFn::Count,
            "delta" => WindowFn::Delta,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Num(f64),
    Null,
    Input(usize),
    Tick,
    Neg(Box<Node>),
    Not(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
    Window(WindowFn, usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mark = i;
                i += 1;
                if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                    i += 1;
                }
                if i < chars.len() && chars[i].is_ascii_digit() {
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                } else {
                    i = mark;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| ExprError::new(format!("invalid number '{}'", text), start))?;
            tokens.push((Token::Num(value), start));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push((Token::Ident(chars[start..i].iter().collect()), start));
            continue;
        }

        let pair: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        let double = match pair.as_str() {
            "&&" => Some("&&"),
            "||" => Some("||"),
            "==" => Some("=="),
            "!=" => Some("!="),
            "<=" => Some("<="),
            ">=" => Some(">="),
            _ => None,
        };
        if let Some(op) = double {
            tokens.push((Token::Op(op), start));
            i += 2;
            continue;
        }

        let token = match c {
            '+' => Token::Op("+"),
            '-' => Token::Op("-"),
            '*' => Token::Op("*"),
            '/' => Token::Op("/"),
            '%' => Token::Op("%"),
            '^' => Token::Op("^"),
            '<' => Token::Op("<"),
            '>' => Token::Op(">"),
            '!' => Token::Op("!"),
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            other => {
                return Err(ExprError::new(
                    format!("unexpected character '{}'", other),
                    start,
                ))
            }
        };
        tokens.push((token, start));
        i += 1;
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
    depth: usize,
    nodes: usize,
    max_input: Option<usize>,
    uses_window: bool,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(_, p)| *p)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExprError> {
        let at = self.position();
        match self.next() {
            Some((token, _)) if token == expected => Ok(()),
            _ => Err(ExprError::new(format!("expected {}", what), at)),
        }
    }

    fn node(&mut self, node: Node) -> Result<Node, ExprError> {
        self.nodes += 1;
        if self.nodes > MAX_NODES {
            return Err(ExprError::new(
                format!("expression has more than {} nodes", MAX_NODES),
                self.position(),
            ));
        }
        Ok(node)
    }

    fn expression(&mut self, min_precedence: u8) -> Result<Node, ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::new(
                format!("expression nested deeper than {}", MAX_DEPTH),
                self.position(),
            ));
        }

        let mut lhs = self.unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            let Some((binop, precedence, right_assoc)) = BinOp::lookup(op) else {
                break;
            };
            if precedence < min_precedence {
                break;
            }
            self.pos += 1;
            let next_min = if right_assoc { precedence } else { precedence + 1 };
            let rhs = self.expression(next_min)?;
            lhs = self.node(Node::Binary(binop, Box::new(lhs), Box::new(rhs)))?;
        }

        self.depth -= 1;
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        match self.peek() {
            Some(Token::Op("-")) => {
                self.pos += 1;
                let operand = self.expression(POW_PRECEDENCE)?;
                self.node(Node::Neg(Box::new(operand)))
            }
            Some(Token::Op("!")) => {
                self.pos += 1;
                let operand = self.expression(POW_PRECEDENCE)?;
                self.node(Node::Not(Box::new(operand)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        let at = self.position();
        match self.next() {
            Some((Token::Num(value), _)) => self.node(Node::Num(value)),
            Some((Token::LParen, _)) => {
                let inner = self.expression(0)?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some((Token::Ident(name), _)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    self.call(&name, at)
                } else {
                    let node = self.identifier(&name, at)?;
                    self.node(node)
                }
            }
            Some(_) => Err(ExprError::new("unexpected token", at)),
            None => Err(ExprError::new("unexpected end of expression", at)),
        }
    }

    fn identifier(&mut self, name: &str, at: usize) -> Result<Node, ExprError> {
        match name {
            "null" => Ok(Node::Null),
            "true" => Ok(Node::Num(1.0)),
            "false" => Ok(Node::Num(0.0)),
            "pi" => Ok(Node::Num(std::f64::consts::PI)),
            "tick" => Ok(Node::Tick),
            _ => self
                .input_index(name)
                .map(Node::Input)
                .ok_or_else(|| ExprError::new(format!("unknown identifier '{}'", name), at)),
        }
    }

    fn input_index(&mut self, name: &str) -> Option<usize> {
        let digits = name.strip_prefix("in")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let index: usize = digits.parse().ok().filter(|i| *i <= MAX_INPUT_INDEX)?;
        self.max_input = Some(self.max_input.map_or(index, |m| m.max(index)));
        Some(index)
    }

    fn call(&mut self, name: &str, at: usize) -> Result<Node, ExprError> {
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.expression(0)?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "')' after arguments")?;

        if let Some(window) = WindowFn::lookup(name) {
            return match args.as_slice() {
                [Node::Input(index)] => {
                    self.uses_window = true;
                    self.node(Node::Window(window, *index))
                }
                _ => Err(ExprError::new(
                    format!("{}() takes a single input reference such as in0", name),
                    at,
                )),
            };
        }

        let func = Func::lookup(name)
            .ok_or_else(|| ExprError::new(format!("unknown function '{}'", name), at))?;
        let (min, max) = func.arity();
        if args.len() < min || args.len() > max {
            let expected = if min == max {
                format!("{}", min)
            } else {
                format!("at least {}", min)
            };
            return Err(ExprError::new(
                format!("{}() takes {} argument(s), got {}", name, expected, args.len()),
                at,
            ));
        }
        self.node(Node::Call(func, args))
    }
}

/// Values visible to an expression at one tick.
pub struct EvalContext<'a> {
    pub tick: u64,
    pub inputs: &'a [Option<f64>],
    /// Last `window` non-null values per input, oldest first, current included
    pub history: &'a [VecDeque<f64>],
    /// Most recent non-null value per input before this tick
    pub previous: &'a [Option<f64>],
}

/// A compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    root: Node,
    max_input: Option<usize>,
    uses_window: bool,
}

impl Expr {
    pub fn parse(source: &str) -> Result<Expr, ExprError> {
        if source.len() > MAX_SOURCE_LEN {
            return Err(ExprError::new(
                format!("expression longer than {} characters", MAX_SOURCE_LEN),
                MAX_SOURCE_LEN,
            ));
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            end: source.chars().count(),
            tokens,
            pos: 0,
            depth: 0,
            nodes: 0,
            max_input: None,
            uses_window: false,
        };
        let root = parser.expression(0)?;
        if parser.pos < parser.tokens.len() {
            return Err(ExprError::new("unexpected trailing input", parser.position()));
        }
        Ok(Expr {
            root,
            max_input: parser.max_input,
            uses_window: parser.uses_window,
        })
    }

    /// Highest `inN` referenced.
    pub fn max_input(&self) -> Option<usize> {
        self.max_input
    }

    pub fn uses_window(&self) -> bool {
        self.uses_window
    }

    pub fn eval(&self, ctx: &EvalContext<'_>) -> Option<f64> {
        eval(&self.root, ctx)
    }
}

fn truth(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn eval(node: &Node, ctx: &EvalContext<'_>) -> Option<f64> {
    match node {
        Node::Num(value) => Some(*value),
        Node::Null => None,
        Node::Input(index) => ctx.inputs.get(*index).copied().flatten(),
        Node::Tick => Some(ctx.tick as f64),
        Node::Neg(inner) => eval(inner, ctx).map(|v| -v),
        Node::Not(inner) => eval(inner, ctx).map(|v| truth(v == 0.0)),
        Node::Binary(op, lhs, rhs) => {
            let a = eval(lhs, ctx)?;
            let b = eval(rhs, ctx)?;
            Some(op.apply(a, b))
        }
        Node::Call(func, args) => call(*func, args, ctx),
        Node::Window(func, index) => window(*func, *index, ctx),
    }
}

fn call(func: Func, args: &[Node], ctx: &EvalContext<'_>) -> Option<f64> {
    let arg = |i: usize| args.get(i).and_then(|a| eval(a, ctx));
    match func {
        Func::Abs => arg(0).map(f64::abs),
        Func::Sqrt => arg(0).map(f64::sqrt),
        Func::Ln => arg(0).map(f64::ln),
        Func::Log10 => arg(0).map(f64::log10),
        Func::Exp => arg(0).map(f64::exp),
        Func::Floor => arg(0).map(f64::floor),
        Func::Ceil => arg(0).map(f64::ceil),
        Func::Round => arg(0).map(f64::round),
        Func::Min | Func::Max => {
            let mut acc: Option<f64> = None;
            for a in args {
                let v = eval(a, ctx)?;
                acc = Some(match (acc, func) {
                    (None, _) => v,
                    (Some(m), Func::Min) => m.min(v),
                    (Some(m), _) => m.max(v),
                });
            }
            acc
        }
        Func::Clamp => {
            let (v, lo, hi) = (arg(0)?, arg(1)?, arg(2)?);
            Some(v.max(lo).min(hi))
        }
        Func::If => {
            if arg(0)? != 0.0 {
                arg(1)
            } else {
                arg(2)
            }
        }
        Func::Coalesce => args.iter().find_map(|a| eval(a, ctx)),
        Func::IsNull => Some(truth(arg(0).is_none())),
    }
}

fn window(func: WindowFn, index: usize, ctx: &EvalContext<'_>) -> Option<f64> {
    if func == WindowFn::Prev {
        return ctx.previous.get(index).copied().flatten();
    }
    let values = ctx.history.get(index)?;
    match func {
        WindowFn::Count => Some(values.len() as f64),
        WindowFn::Sum => Some(values.iter().sum()),
        WindowFn::Mean => {
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        }
        WindowFn::Min => values.iter().copied().reduce(f64::min),
        WindowFn::Max => values.iter().copied().reduce(f64::max),
        WindowFn::Delta => Some(values.back()? - values.front()?),
        WindowFn::Prev => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_with(source: &str, inputs: &[Option<f64>]) -> Option<f64> {
        let expr = Expr::parse(source).unwrap();
        let history: Vec<VecDeque<f64>> = inputs
            .iter()
            .map(|v| v.iter().copied().collect())
            .collect();
        let previous = vec![None; inputs.len()];
        expr.eval(&EvalContext {
            tick: 7,
            inputs,
            history: &history,
            previous: &previous,
        })
    }

    #[test]
    fn test_precedence_and_associativity() {
        assert_eq!(eval_with("1 + 2 * 3", &[]), Some(7.0));
        assert_eq!(eval_with("(1 + 2) * 3", &[]), Some(9.0));
        assert_eq!(eval_with("2 ^ 3 ^ 2", &[]), Some(512.0));
        assert_eq!(eval_with("-2 ^ 2", &[]), Some(-4.0));
        assert_eq!(eval_with("10 - 4 - 3", &[]), Some(3.0));
        assert_eq!(eval_with("1 < 2 && 3 >= 3", &[]), Some(1.0));
        assert_eq!(eval_with("tick * 2", &[]), Some(14.0));
        assert_eq!(eval_with("1.5e2", &[]), Some(150.0));
    }

    #[test]
    fn test_null_propagation() {
        assert_eq!(eval_with("in0 + 1", &[None]), None);
        assert_eq!(eval_with("in1 - in0", &[Some(1.0), Some(3.0)]), Some(2.0));
        assert_eq!(eval_with("coalesce(in0, 5)", &[None]), Some(5.0));
        assert_eq!(eval_with("is_null(in0)", &[None]), Some(1.0));
        assert_eq!(eval_with("if(in0 > 0, 1, null)", &[Some(-1.0)]), None);
        assert_eq!(eval_with("max(in0, 3)", &[None]), None);
        assert_eq!(eval_with("clamp(in0, 0, 10)", &[Some(12.0)]), Some(10.0));
    }

    #[test]
    fn test_compile_errors() {
        let err = Expr::parse("in0 +").unwrap_err();
        assert_eq!(err.position, 5);
        assert!(Expr::parse("foo(1)").is_err());
        assert!(Expr::parse("bogus").is_err());
        assert!(Expr::parse("mean(in0 + 1)").is_err());
        assert!(Expr::parse("clamp(1, 2)").is_err());
        assert!(Expr::parse("1 # 2").is_err());
        assert!(Expr::parse("(1").is_err());
        assert!(Expr::parse("1 2").is_err());
        assert!(Expr::parse("in64").is_err());
    }

    #[test]
    fn test_limits() {
        let deep = format!("{}1{}", "(".repeat(MAX_DEPTH + 1), ")".repeat(MAX_DEPTH + 1));
        assert!(Expr::parse(&deep).is_err());
        let wide = vec!["1"; MAX_NODES].join("+");
        assert!(Expr::parse(&wide).is_err());
        assert!(Expr::parse(&"1".repeat(MAX_SOURCE_LEN + 1)).is_err());
    }

    #[test]
    fn test_input_tracking() {
        let expr = Expr::parse("in0 + mean(in3)").unwrap();
        assert_eq!(expr.max_input(), Some(3));
        assert!(expr.uses_window());
        assert_eq!(Expr::parse("pi").unwrap().max_input(), None);
    }
}
