//! Rule Tree: the intermediate representation shared by the expression
//! parser, the signature loader, the bytecode compiler and the decompiler.
//!
//! A rule is a tagged union over match methods. Leaves compare one response
//! field against a literal or a pattern; `complex` nodes join two or more
//! children with AND/OR. Trees are immutable once built and can be shared
//! across threads for read-only evaluation.

pub mod info;
pub mod loader;

pub use info::{Cpe, FingerprintInfo};
pub use loader::{LoadReport, RuleLoader};

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Named response field a leaf reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Header,
    Body,
    Title,
    Server,
    Banner,
    Protocol,
    Md5,
    /// Values of every header whose name contains the key, case-insensitively.
    HeaderItem(String),
    /// Any identifier outside the built-in vocabulary. Resolved (or rejected)
    /// by the field extractor at execution time.
    Custom(String),
}

const HEADER_ITEM_PREFIX: &str = "header_item.";

impl Field {
    /// Resolve an identifier token. Returns `None` for an empty name or an
    /// empty header item key.
    pub fn parse(name: &str) -> Option<Field> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let lower = name.to_ascii_lowercase();
        if lower.starts_with(HEADER_ITEM_PREFIX) {
            let key = &name[HEADER_ITEM_PREFIX.len()..];
            return if key.is_empty() {
                None
            } else {
                Some(Field::HeaderItem(key.to_string()))
            };
        }
        let field = match lower.as_str() {
            "header" | "headers" => Field::Header,
            "body" => Field::Body,
            "title" => Field::Title,
            "server" => Field::Server,
            "banner" | "raw" => Field::Banner,
            "protocol" => Field::Protocol,
            "md5" => Field::Md5,
            _ => Field::Custom(name.to_string()),
        };
        Some(field)
    }

    pub fn name(&self) -> Cow<'_, str> {
        match self {
            Field::Header => Cow::Borrowed("header"),
            Field::Body => Cow::Borrowed("body"),
            Field::Title => Cow::Borrowed("title"),
            Field::Server => Cow::Borrowed("server"),
            Field::Banner => Cow::Borrowed("banner"),
            Field::Protocol => Cow::Borrowed("protocol"),
            Field::Md5 => Cow::Borrowed("md5"),
            Field::HeaderItem(key) => Cow::Owned(format!("{HEADER_ITEM_PREFIX}{key}")),
            Field::Custom(name) => Cow::Borrowed(name),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Literal {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl Literal {
    /// The text a field value is compared against.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Literal::Str(s) => Cow::Borrowed(s),
            Literal::Int(i) => Cow::Owned(i.to_string()),
            Literal::Bool(b) => Cow::Owned(b.to_string()),
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::Str(value.to_string())
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Literal::Str(value)
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Literal::Int(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Bool(value)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => f.write_str(&quote(s)),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Render a string literal with the canonical escapes.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out.push('"');
    out
}

/// Comparison operator of an `exp` leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// `=`: the field contains the literal.
    Contains,
    /// `==`: the field equals the literal.
    Equal,
    /// `!=`
    NotEqual,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Contains => "=",
            CompareOp::Equal => "==",
            CompareOp::NotEqual => "!=",
        }
    }

    pub fn evaluate(self, subject: &str, needle: &str) -> bool {
        match self {
            CompareOp::Contains => subject.contains(needle),
            CompareOp::Equal => subject == needle,
            CompareOp::NotEqual => subject != needle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    And,
    Or,
}

impl Condition {
    pub fn symbol(self) -> &'static str {
        match self {
            Condition::And => "&&",
            Condition::Or => "||",
        }
    }
}

/// Submatch indices mapped into CPE components. Index 0 means "not captured".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CaptureGroups {
    pub vendor: usize,
    pub product: usize,
    pub version: usize,
    pub update: usize,
    pub edition: usize,
    pub language: usize,
}

impl CaptureGroups {
    pub fn is_empty(&self) -> bool {
        self.indices().iter().all(|&i| i == 0)
    }

    fn indices(&self) -> [usize; 6] {
        [
            self.vendor,
            self.product,
            self.version,
            self.update,
            self.edition,
            self.language,
        ]
    }

    /// Build a CPE from the submatches of a successful regex match.
    pub fn extract(&self, captures: &regex::Captures<'_>) -> Cpe {
        let group = |idx: usize| {
            if idx == 0 {
                return String::new();
            }
            captures
                .get(idx)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default()
        };
        Cpe {
            part: String::new(),
            vendor: group(self.vendor),
            product: group(self.product),
            version: group(self.version),
            update: group(self.update),
            edition: group(self.edition),
            language: group(self.language),
        }
    }

    /// CPE with `$n` placeholders where components come from submatches.
    pub fn template(&self) -> Cpe {
        let placeholder = |idx: usize| {
            if idx == 0 {
                String::new()
            } else {
                format!("${idx}")
            }
        };
        Cpe {
            part: String::new(),
            vendor: placeholder(self.vendor),
            product: placeholder(self.product),
            version: placeholder(self.version),
            update: placeholder(self.update),
            edition: placeholder(self.edition),
            language: placeholder(self.language),
        }
    }
}

/// Discriminator of a rule node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchMethod {
    Exp,
    Complex,
    Regexp,
    HttpHeader,
    Md5,
}

impl MatchMethod {
    pub const ALL: [MatchMethod; 5] = [
        MatchMethod::Exp,
        MatchMethod::Complex,
        MatchMethod::Regexp,
        MatchMethod::HttpHeader,
        MatchMethod::Md5,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MatchMethod::Exp => "exp",
            MatchMethod::Complex => "complex",
            MatchMethod::Regexp => "regexp",
            MatchMethod::HttpHeader => "http_header",
            MatchMethod::Md5 => "md5",
        }
    }
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method-specific payload of a rule node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchParam {
    Exp {
        field: Field,
        op: CompareOp,
        value: Literal,
    },
    Complex {
        condition: Condition,
        sub_rules: Vec<FingerPrintRule>,
    },
    Regexp {
        field: Field,
        pattern: String,
        groups: Option<CaptureGroups>,
    },
    HttpHeader {
        header_key: String,
        header_match_rule: Box<FingerPrintRule>,
    },
    Md5 {
        md5: String,
    },
}

/// A node of the Rule Tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FingerPrintRule {
    pub param: MatchParam,
    pub info: Option<FingerprintInfo>,
}

impl FingerPrintRule {
    pub fn new(param: MatchParam) -> Self {
        Self { param, info: None }
    }

    pub fn exp(field: Field, op: CompareOp, value: impl Into<Literal>) -> Self {
        Self::new(MatchParam::Exp {
            field,
            op,
            value: value.into(),
        })
    }

    pub fn contains(field: Field, value: impl Into<Literal>) -> Self {
        Self::exp(field, CompareOp::Contains, value)
    }

    pub fn equals(field: Field, value: impl Into<Literal>) -> Self {
        Self::exp(field, CompareOp::Equal, value)
    }

    pub fn regexp(field: Field, pattern: impl Into<String>) -> Self {
        Self::new(MatchParam::Regexp {
            field,
            pattern: pattern.into(),
            groups: None,
        })
    }

    pub fn regexp_with_groups(
        field: Field,
        pattern: impl Into<String>,
        groups: CaptureGroups,
    ) -> Self {
        Self::new(MatchParam::Regexp {
            field,
            pattern: pattern.into(),
            groups: Some(groups),
        })
    }

    pub fn complex(condition: Condition, sub_rules: Vec<FingerPrintRule>) -> Self {
        Self::new(MatchParam::Complex {
            condition,
            sub_rules,
        })
    }

    pub fn and(sub_rules: Vec<FingerPrintRule>) -> Self {
        Self::complex(Condition::And, sub_rules)
    }

    pub fn or(sub_rules: Vec<FingerPrintRule>) -> Self {
        Self::complex(Condition::Or, sub_rules)
    }

    pub fn http_header(header_key: impl Into<String>, rule: FingerPrintRule) -> Self {
        Self::new(MatchParam::HttpHeader {
            header_key: header_key.into(),
            header_match_rule: Box::new(rule),
        })
    }

    pub fn md5(digest: impl Into<String>) -> Self {
        Self::new(MatchParam::Md5 {
            md5: digest.into().to_ascii_lowercase(),
        })
    }

    pub fn with_info(mut self, info: FingerprintInfo) -> Self {
        self.info = Some(info);
        self
    }

    pub fn method(&self) -> MatchMethod {
        match self.param {
            MatchParam::Exp { .. } => MatchMethod::Exp,
            MatchParam::Complex { .. } => MatchMethod::Complex,
            MatchParam::Regexp { .. } => MatchMethod::Regexp,
            MatchParam::HttpHeader { .. } => MatchMethod::HttpHeader,
            MatchParam::Md5 { .. } => MatchMethod::Md5,
        }
    }

    /// Join two trees, extending `self` in place when it is already an
    /// info-less group with the same condition.
    pub(crate) fn merge(self, condition: Condition, rhs: FingerPrintRule) -> FingerPrintRule {
        match self {
            FingerPrintRule {
                param:
                    MatchParam::Complex {
                        condition: existing,
                        mut sub_rules,
                    },
                info: None,
            } if existing == condition => {
                sub_rules.push(rhs);
                FingerPrintRule::complex(condition, sub_rules)
            }
            lhs => FingerPrintRule::complex(condition, vec![lhs, rhs]),
        }
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, field_override: Option<&Field>) -> fmt::Result {
        match &self.param {
            MatchParam::Exp { field, op, value } => {
                let field = field_override.unwrap_or(field);
                write!(f, "{field} {} {value}", op.symbol())
            }
            MatchParam::Regexp { field, pattern, .. } => {
                let field = field_override.unwrap_or(field);
                write!(f, "{field} ~= {}", quote(pattern))
            }
            MatchParam::Md5 { md5 } => write!(f, "{} == {}", Field::Md5, quote(md5)),
            MatchParam::HttpHeader {
                header_key,
                header_match_rule,
            } => {
                let field = Field::HeaderItem(header_key.clone());
                header_match_rule.render(f, Some(&field))
            }
            MatchParam::Complex {
                condition,
                sub_rules,
            } => {
                for (idx, sub_rule) in sub_rules.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " {} ", condition.symbol())?;
                    }
                    if sub_rule.method() == MatchMethod::Complex {
                        f.write_str("(")?;
                        sub_rule.render(f, field_override)?;
                        f.write_str(")")?;
                    } else {
                        sub_rule.render(f, field_override)?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Canonical textual expression. Nested groups are always parenthesized.
impl fmt::Display for FingerPrintRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, None)
    }
}
