//! Error types for the fingerprint engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FingerprintError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FingerprintError {
    #[error("Parse error at {position}: {message}")]
    Parse { position: usize, message: String },
    #[error("Compilation error: {0}")]
    Compilation(String),
    #[error("Invalid bytecode: {0}")]
    InvalidBytecode(String),
    #[error("Stack underflow during execution")]
    StackUnderflow,
    #[error("Stack overflow during execution")]
    StackOverflow,
    #[error("Unknown field: {0}")]
    UnknownField(String),
    #[error("Field extraction error: {0}")]
    FieldExtraction(String),
    #[error("Invalid regex pattern: {0}")]
    InvalidRegex(String),
    #[error("Decompilation error: {0}")]
    Decompilation(String),
    #[error("Invalid CPE: {0}")]
    InvalidCpe(String),
    #[error("YAML parsing error: {0}")]
    Yaml(String),
    #[error("JSON parsing error: {0}")]
    Json(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl FingerprintError {
    pub(crate) fn parse(position: usize, message: impl Into<String>) -> Self {
        FingerprintError::Parse {
            position,
            message: message.into(),
        }
    }

    /// Errors that can only come from a compiler/executor mismatch, never
    /// from a badly written rule.
    pub fn is_engine_bug(&self) -> bool {
        matches!(
            self,
            FingerprintError::InvalidBytecode(_)
                | FingerprintError::StackUnderflow
                | FingerprintError::StackOverflow
        )
    }

    /// Errors caused by the rule text or tree itself. The offending rule is
    /// dropped; other rules keep loading.
    pub fn is_rule_error(&self) -> bool {
        matches!(
            self,
            FingerprintError::Parse { .. }
                | FingerprintError::Compilation(_)
                | FingerprintError::InvalidRegex(_)
                | FingerprintError::InvalidCpe(_)
        )
    }
}

impl From<std::io::Error> for FingerprintError {
    fn from(err: std::io::Error) -> Self {
        FingerprintError::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for FingerprintError {
    fn from(err: serde_yaml::Error) -> Self {
        FingerprintError::Yaml(err.to_string())
    }
}

impl From<serde_json::Error> for FingerprintError {
    fn from(err: serde_json::Error) -> Self {
        FingerprintError::Json(err.to_string())
    }
}

impl From<regex::Error> for FingerprintError {
    fn from(err: regex::Error) -> Self {
        FingerprintError::InvalidRegex(err.to_string())
    }
}
