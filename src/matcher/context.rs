//! Response context: named-field access over one captured network response.

use crate::error::{FingerprintError, Result};
use crate::rule::Field;
use md5::{Digest, Md5};
use regex::Regex;
use std::cell::OnceCell;
use std::sync::OnceLock;

/// Value produced for a field. Header items can occur several times, and a
/// comparison against `Many` succeeds when any candidate satisfies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Single(String),
    Many(Vec<String>),
}

impl FieldValue {
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            FieldValue::Single(value) => std::slice::from_ref(value),
            FieldValue::Many(values) => values,
        };
        slice.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.candidates().all(str::is_empty)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Single(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Single(value.to_string())
    }
}

/// Maps a field name to the matching part of a response.
///
/// Errors (unknown field, missing data) propagate to the caller as execution
/// errors; they are never turned into a "no match".
pub trait FieldExtractor {
    fn extract(&self, field: &Field) -> Result<FieldValue>;
}

impl<T: FieldExtractor + ?Sized> FieldExtractor for &T {
    fn extract(&self, field: &Field) -> Result<FieldValue> {
        (**self).extract(field)
    }
}

/// Field extractor over a raw response buffer.
///
/// HTTP responses are split at the first blank line into header block and
/// body; anything else is treated as a plain banner where the whole buffer is
/// the body. Title and checksum are derived lazily and cached for the
/// lifetime of the context.
///
/// # Example
/// ```rust
/// use fingerprint_engine::matcher::{FieldExtractor, FieldValue, ResponseContext};
/// use fingerprint_engine::rule::Field;
///
/// let ctx = ResponseContext::new(b"HTTP/1.1 200 OK\r\nServer: nginx\r\n\r\n<title>Hi</title>");
/// assert_eq!(ctx.extract(&Field::Server)?, FieldValue::Single("nginx".to_string()));
/// assert_eq!(ctx.extract(&Field::Title)?, FieldValue::Single("Hi".to_string()));
/// # Ok::<(), fingerprint_engine::FingerprintError>(())
/// ```
///
/// Not `Sync`: each evaluation thread builds its own context.
#[derive(Debug)]
pub struct ResponseContext {
    raw: String,
    header_end: usize,
    body_start: usize,
    protocol: String,
    title: OnceCell<String>,
    md5: OnceCell<String>,
}

impl ResponseContext {
    pub fn new(raw: &[u8]) -> Self {
        let raw = String::from_utf8_lossy(raw).into_owned();
        let (header_end, body_start) = split_http(&raw);
        Self {
            raw,
            header_end,
            body_start,
            protocol: String::new(),
            title: OnceCell::new(),
            md5: OnceCell::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn header(&self) -> &str {
        &self.raw[..self.header_end]
    }

    pub fn body(&self) -> &str {
        &self.raw[self.body_start..]
    }

    /// `(name, value)` pairs of the header block, skipping the status line.
    pub fn header_lines(&self) -> impl Iterator<Item = (&str, &str)> {
        self.header()
            .lines()
            .skip(1)
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim(), value.trim()))
    }

    /// Values of all headers whose name contains `key`, ignoring case.
    pub fn header_values(&self, key: &str) -> Vec<String> {
        let key = key.to_ascii_lowercase();
        self.header_lines()
            .filter(|(name, _)| name.to_ascii_lowercase().contains(&key))
            .map(|(_, value)| value.to_string())
            .collect()
    }

    fn server(&self) -> String {
        self.header_lines()
            .find(|(name, _)| name.eq_ignore_ascii_case("server"))
            .map(|(_, value)| value.to_string())
            .unwrap_or_default()
    }

    fn title(&self) -> &str {
        self.title.get_or_init(|| {
            title_regex()
                .and_then(|re| re.captures(self.body()))
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default()
        })
    }

    fn md5(&self) -> &str {
        self.md5
            .get_or_init(|| hex::encode(Md5::digest(self.body().as_bytes())))
    }
}

impl FieldExtractor for ResponseContext {
    fn extract(&self, field: &Field) -> Result<FieldValue> {
        let value = match field {
            Field::Header => self.header().to_string(),
            Field::Body => self.body().to_string(),
            Field::Title => self.title().to_string(),
            Field::Server => self.server(),
            Field::Banner => self.raw.clone(),
            Field::Protocol => self.protocol.clone(),
            Field::Md5 => self.md5().to_string(),
            Field::HeaderItem(key) if key.is_empty() => {
                return Err(FingerprintError::FieldExtraction(
                    "header_item without a header name".to_string(),
                ))
            }
            Field::HeaderItem(key) => return Ok(FieldValue::Many(self.header_values(key))),
            Field::Custom(name) => return Err(FingerprintError::UnknownField(name.clone())),
        };
        Ok(FieldValue::Single(value))
    }
}

/// Extractor that answers every field with the same value. Used to evaluate
/// the nested rule of an `http_header` node against the matching header
/// values.
#[derive(Debug, Clone)]
pub struct ScopedValue(pub FieldValue);

impl FieldExtractor for ScopedValue {
    fn extract(&self, _field: &Field) -> Result<FieldValue> {
        Ok(self.0.clone())
    }
}

fn title_regex() -> Option<&'static Regex> {
    static TITLE: OnceLock<Option<Regex>> = OnceLock::new();
    TITLE
        .get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok())
        .as_ref()
}

/// Returns `(header_end, body_start)` byte offsets.
fn split_http(raw: &str) -> (usize, usize) {
    if !raw.starts_with("HTTP/") {
        return (0, 0);
    }
    let crlf = raw.find("\r\n\r\n").map(|i| (i, i + 4));
    let lf = raw.find("\n\n").map(|i| (i, i + 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => (raw.len(), raw.len()),
    }
}
