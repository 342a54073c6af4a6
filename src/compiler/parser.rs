//! Fingerprint expression parsing.
//!
//! The input is split on a fixed symbol set into a token stream, fed through
//! a four-state machine that assembles comparison leaves, reordered into
//! postfix with a shunting-yard pass (`&&` binds tighter than `||`), and
//! finally reduced into a Rule Tree.

use crate::error::{FingerprintError, Result};
use crate::rule::{CompareOp, Condition, Field, FingerPrintRule, Literal};

/// Symbols recognised by the tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Symbol {
    Equal,
    NotEqual,
    Regexp,
    And,
    Or,
    Contains,
    LeftParen,
    RightParen,
    Quote,
    Backslash,
}

/// Two-character symbols come first so that matching is longest-first.
const SYMBOLS: [Symbol; 10] = [
    Symbol::Equal,
    Symbol::NotEqual,
    Symbol::Regexp,
    Symbol::And,
    Symbol::Or,
    Symbol::Contains,
    Symbol::LeftParen,
    Symbol::RightParen,
    Symbol::Quote,
    Symbol::Backslash,
];

impl Symbol {
    pub(crate) fn text(self) -> &'static str {
        match self {
            Symbol::Equal => "==",
            Symbol::NotEqual => "!=",
            Symbol::Regexp => "~=",
            Symbol::And => "&&",
            Symbol::Or => "||",
            Symbol::Contains => "=",
            Symbol::LeftParen => "(",
            Symbol::RightParen => ")",
            Symbol::Quote => "\"",
            Symbol::Backslash => "\\",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind<'a> {
    Symbol(Symbol),
    /// Everything between two symbols, verbatim.
    Text(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Token<'a> {
    pub(crate) kind: TokenKind<'a>,
    /// Byte offset in the input.
    pub(crate) position: usize,
}

/// Split an expression into symbol and text tokens.
pub(crate) fn tokenize(input: &str) -> Vec<Token<'_>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut text_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let symbol = SYMBOLS
            .iter()
            .copied()
            .find(|symbol| bytes[i..].starts_with(symbol.text().as_bytes()));
        match symbol {
            Some(symbol) => {
                if text_start < i {
                    tokens.push(Token {
                        kind: TokenKind::Text(&input[text_start..i]),
                        position: text_start,
                    });
                }
                tokens.push(Token {
                    kind: TokenKind::Symbol(symbol),
                    position: i,
                });
                i += symbol.text().len();
                text_start = i;
            }
            None => i += 1,
        }
    }
    if text_start < bytes.len() {
        tokens.push(Token {
            kind: TokenKind::Text(&input[text_start..]),
            position: text_start,
        });
    }

    tokens
}

/// Whitespace-separated words of a text token, with their byte offsets.
fn words(text: &str, base: usize) -> Vec<(&str, usize)> {
    let mut words = Vec::new();
    let mut start = None;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                words.push((&text[s..idx], base + s));
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(s) = start {
        words.push((&text[s..], base + s));
    }
    words
}

fn is_identifier(word: &str) -> bool {
    word.chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn conjunction(word: &str) -> Option<Condition> {
    if word.eq_ignore_ascii_case("and") {
        Some(Condition::And)
    } else if word.eq_ignore_ascii_case("or") {
        Some(Condition::Or)
    } else {
        None
    }
}

fn precedence(condition: Condition) -> u8 {
    match condition {
        Condition::And => 2,
        Condition::Or => 1,
    }
}

/// Resolve the character after a backslash. Unknown escapes keep their
/// backslash so that regex classes such as `\d` pass through untouched.
fn push_escaped(buffer: &mut String, ch: char) {
    match ch {
        'n' => buffer.push('\n'),
        'r' => buffer.push('\r'),
        't' => buffer.push('\t'),
        '"' | '\\' => buffer.push(ch),
        other => {
            buffer.push('\\');
            buffer.push(other);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting a field name or a grouping token.
    Exp,
    /// Expecting a comparison operator.
    Op,
    /// Expecting a quoted string or a bare int/bool.
    Value,
    StringValue,
}

#[derive(Debug)]
enum Postfix {
    Operand(FingerPrintRule),
    Operator(Condition, usize),
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Operator(Condition),
    Open,
}

struct ExpressionParser {
    state: State,
    field: Option<(Field, usize)>,
    op: Option<Symbol>,
    buffer: String,
    string_start: usize,
    escaped: bool,
    expect_operand: bool,
    output: Vec<Postfix>,
    operators: Vec<(Pending, usize)>,
}

impl ExpressionParser {
    fn new() -> Self {
        Self {
            state: State::Exp,
            field: None,
            op: None,
            buffer: String::new(),
            string_start: 0,
            escaped: false,
            expect_operand: true,
            output: Vec::new(),
            operators: Vec::new(),
        }
    }

    fn feed(&mut self, token: Token<'_>) -> Result<()> {
        match (self.state, token.kind) {
            (State::StringValue, _) => self.string_value(token),
            (_, TokenKind::Text(text)) => {
                for (word, position) in words(text, token.position) {
                    self.word(word, position)?;
                }
                Ok(())
            }
            (_, TokenKind::Symbol(symbol)) => self.symbol(symbol, token.position),
        }
    }

    fn word(&mut self, word: &str, position: usize) -> Result<()> {
        match self.state {
            State::Exp => {
                if let Some(condition) = conjunction(word) {
                    return self.operator(condition, position);
                }
                if !self.expect_operand {
                    return Err(FingerprintError::parse(
                        position,
                        format!("missing '&&' or '||' before '{word}'"),
                    ));
                }
                let field = Field::parse(word)
                    .filter(|_| is_identifier(word))
                    .ok_or_else(|| {
                        FingerprintError::parse(position, format!("invalid field name '{word}'"))
                    })?;
                self.field = Some((field, position));
                self.state = State::Op;
                Ok(())
            }
            State::Op => Err(FingerprintError::parse(
                position,
                format!("expected comparison operator, found '{word}'"),
            )),
            State::Value => {
                let value = if let Ok(int) = word.parse::<i64>() {
                    Literal::Int(int)
                } else if word.eq_ignore_ascii_case("true") {
                    Literal::Bool(true)
                } else if word.eq_ignore_ascii_case("false") {
                    Literal::Bool(false)
                } else {
                    return Err(FingerprintError::parse(
                        position,
                        format!("unquoted value '{word}'; strings must be quoted"),
                    ));
                };
                self.leaf(value, position)
            }
            State::StringValue => {
                self.buffer.push_str(word);
                Ok(())
            }
        }
    }

    fn symbol(&mut self, symbol: Symbol, position: usize) -> Result<()> {
        match (self.state, symbol) {
            (State::Exp, Symbol::And) => self.operator(Condition::And, position),
            (State::Exp, Symbol::Or) => self.operator(Condition::Or, position),
            (State::Exp, Symbol::LeftParen) => {
                if !self.expect_operand {
                    return Err(FingerprintError::parse(
                        position,
                        "missing '&&' or '||' before '('",
                    ));
                }
                self.operators.push((Pending::Open, position));
                Ok(())
            }
            (State::Exp, Symbol::RightParen) => {
                if self.expect_operand {
                    return Err(FingerprintError::parse(position, "missing operand before ')'"));
                }
                loop {
                    match self.operators.pop() {
                        Some((Pending::Open, _)) => return Ok(()),
                        Some((Pending::Operator(condition), at)) => {
                            self.output.push(Postfix::Operator(condition, at));
                        }
                        None => {
                            return Err(FingerprintError::parse(position, "unbalanced ')'"));
                        }
                    }
                }
            }
            (State::Op, Symbol::Contains | Symbol::Equal | Symbol::NotEqual | Symbol::Regexp) => {
                self.op = Some(symbol);
                self.state = State::Value;
                Ok(())
            }
            (State::Value, Symbol::Quote) => {
                self.buffer.clear();
                self.string_start = position;
                self.state = State::StringValue;
                Ok(())
            }
            (State::Op, _) => Err(FingerprintError::parse(
                position,
                format!("expected comparison operator, found '{}'", symbol.text()),
            )),
            (State::Value, _) => Err(FingerprintError::parse(
                position,
                format!("expected value, found '{}'", symbol.text()),
            )),
            (_, _) => Err(FingerprintError::parse(
                position,
                format!("unexpected '{}'", symbol.text()),
            )),
        }
    }

    fn string_value(&mut self, token: Token<'_>) -> Result<()> {
        let text = match token.kind {
            TokenKind::Symbol(Symbol::Quote) if !self.escaped => {
                let value = Literal::Str(std::mem::take(&mut self.buffer));
                return self.leaf(value, self.string_start);
            }
            TokenKind::Symbol(Symbol::Backslash) if !self.escaped => {
                self.escaped = true;
                return Ok(());
            }
            TokenKind::Symbol(symbol) => symbol.text(),
            TokenKind::Text(text) => text,
        };

        if self.escaped {
            self.escaped = false;
            let mut chars = text.chars();
            if let Some(first) = chars.next() {
                push_escaped(&mut self.buffer, first);
            }
            self.buffer.push_str(chars.as_str());
        } else {
            self.buffer.push_str(text);
        }
        Ok(())
    }

    fn leaf(&mut self, value: Literal, position: usize) -> Result<()> {
        let (field, field_position) = self
            .field
            .take()
            .ok_or_else(|| FingerprintError::parse(position, "value without a field"))?;
        let rule = match self.op.take() {
            Some(Symbol::Contains) => FingerPrintRule::exp(field, CompareOp::Contains, value),
            Some(Symbol::Equal) => FingerPrintRule::exp(field, CompareOp::Equal, value),
            Some(Symbol::NotEqual) => FingerPrintRule::exp(field, CompareOp::NotEqual, value),
            Some(Symbol::Regexp) => match value {
                Literal::Str(pattern) => FingerPrintRule::regexp(field, pattern),
                _ => {
                    return Err(FingerprintError::parse(
                        position,
                        "regular expression must be a quoted string",
                    ))
                }
            },
            _ => {
                return Err(FingerprintError::parse(
                    field_position,
                    "comparison without an operator",
                ))
            }
        };
        self.output.push(Postfix::Operand(rule));
        self.expect_operand = false;
        self.state = State::Exp;
        Ok(())
    }

    fn operator(&mut self, condition: Condition, position: usize) -> Result<()> {
        if self.expect_operand {
            return Err(FingerprintError::parse(
                position,
                format!("missing operand before '{}'", condition.symbol()),
            ));
        }
        while let Some(&(Pending::Operator(top), at)) = self.operators.last() {
            if precedence(top) < precedence(condition) {
                break;
            }
            self.operators.pop();
            self.output.push(Postfix::Operator(top, at));
        }
        self.operators.push((Pending::Operator(condition), position));
        self.expect_operand = true;
        Ok(())
    }

    fn finish(mut self, end: usize) -> Result<FingerPrintRule> {
        match self.state {
            State::Exp => {}
            State::StringValue => {
                return Err(FingerprintError::parse(
                    self.string_start,
                    "unterminated string",
                ))
            }
            State::Op => {
                return Err(FingerprintError::parse(end, "expected comparison operator"))
            }
            State::Value => return Err(FingerprintError::parse(end, "missing value")),
        }
        if self.output.is_empty() && self.operators.is_empty() {
            return Err(FingerprintError::parse(0, "empty expression"));
        }
        if self.expect_operand {
            return Err(FingerprintError::parse(end, "missing operand at end of expression"));
        }
        while let Some((pending, at)) = self.operators.pop() {
            match pending {
                Pending::Operator(condition) => self.output.push(Postfix::Operator(condition, at)),
                Pending::Open => return Err(FingerprintError::parse(at, "unbalanced '('")),
            }
        }

        let mut trees: Vec<FingerPrintRule> = Vec::new();
        for item in self.output {
            match item {
                Postfix::Operand(rule) => trees.push(rule),
                Postfix::Operator(condition, at) => {
                    let (rhs, lhs) = match (trees.pop(), trees.pop()) {
                        (Some(rhs), Some(lhs)) => (rhs, lhs),
                        _ => {
                            return Err(FingerprintError::parse(
                                at,
                                format!("missing operand for '{}'", condition.symbol()),
                            ))
                        }
                    };
                    trees.push(lhs.merge(condition, rhs));
                }
            }
        }

        match (trees.pop(), trees.is_empty()) {
            (Some(rule), true) => Ok(rule),
            (Some(_), false) => Err(FingerprintError::parse(
                end,
                format!("{} expressions without a joining operator", trees.len() + 1),
            )),
            (None, _) => Err(FingerprintError::parse(0, "empty expression")),
        }
    }
}

/// Parse a textual expression into a Rule Tree.
///
/// # Example
/// ```rust
/// use fingerprint_engine::compiler::parse_expression;
///
/// let rule = parse_expression(r#"header = "MiniCMS" && (body = "1" || body = "2")"#)?;
/// assert_eq!(rule.to_string(), r#"header = "MiniCMS" && (body = "1" || body = "2")"#);
/// # Ok::<(), fingerprint_engine::FingerprintError>(())
/// ```
pub fn parse_expression(input: &str) -> Result<FingerPrintRule> {
    let mut parser = ExpressionParser::new();
    for token in tokenize(input) {
        parser.feed(token)?;
    }
    parser.finish(input.len())
}
