//! Fingerprint rule compiler.
//!
//! Turns textual expressions and Rule Trees into verified bytecode
//! [`Program`]s for the virtual machine.
//!
//! The compiler is organized into two sub-modules:
//! - [`parser`] - Tokenization and parsing of textual expressions
//! - [`codegen`] - Bytecode generation from Rule Trees
//!
//! # Examples
//!
//! ```rust
//! use fingerprint_engine::Compiler;
//!
//! let compiler = Compiler::new();
//! let program = compiler.compile_expression(r#"header = "VIDEO WEB SERVER""#)?;
//! assert_eq!(program.len(), 4);
//! # Ok::<(), fingerprint_engine::FingerprintError>(())
//! ```

pub mod codegen;
pub mod parser;

pub use parser::parse_expression;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::ir::Program;
use crate::rule::{FingerPrintRule, FingerprintInfo};
use tracing::{debug, trace};

/// Stateless rule compiler.
#[derive(Debug, Clone)]
pub struct Compiler {
    verify_programs: bool,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            verify_programs: true,
        }
    }

    pub fn with_config(config: &EngineConfig) -> Self {
        Self {
            verify_programs: config.verify_programs,
        }
    }

    /// Lower a Rule Tree to bytecode.
    ///
    /// # Errors
    /// * `Compilation` for a malformed tree (a `complex` node with fewer than
    ///   two children, a composite `http_header` match rule, an empty md5)
    /// * `InvalidBytecode` if the generated program fails verification
    pub fn compile(&self, rule: &FingerPrintRule) -> Result<Program> {
        let opcodes = codegen::generate_bytecode(rule)?;
        trace!("generated {} opcodes for {} rule", opcodes.len(), rule.method());

        if self.verify_programs {
            let program = Program::new(opcodes)?;
            debug!(
                "compiled rule into {} opcodes (max stack depth {})",
                program.len(),
                program.max_stack_depth()
            );
            Ok(program)
        } else {
            Ok(Program::new_unverified(opcodes))
        }
    }

    /// Parse and compile a textual expression.
    pub fn compile_expression(&self, expression: &str) -> Result<Program> {
        self.compile(&parse_expression(expression)?)
    }

    /// Parse and compile a textual expression whose matches report `info`.
    pub fn compile_expression_with_info(
        &self,
        expression: &str,
        info: FingerprintInfo,
    ) -> Result<Program> {
        self.compile(&parse_expression(expression)?.with_info(info))
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FingerprintError;
    use crate::ir::OpCode;
    use crate::rule::{Cpe, Field};

    #[test]
    fn test_compile_expression() {
        let program = Compiler::new()
            .compile_expression(r#"header = "MiniCMS" && (body = "1" || body = "2")"#)
            .unwrap();
        assert_eq!(program.opcodes()[3], OpCode::And(8));
        assert_eq!(program.opcodes()[7], OpCode::Or(4));
        assert_eq!(program.len(), 12);
    }

    #[test]
    fn test_compile_expression_with_info() {
        let info = FingerprintInfo::with_cpe(Cpe::product("minicms"));
        let program = Compiler::new()
            .compile_expression_with_info(r#"body = "MiniCMS""#, info)
            .unwrap();
        assert_eq!(program.default_info().unwrap().cpe.product, "minicms");
    }

    #[test]
    fn test_compile_reports_parse_errors() {
        let err = Compiler::new().compile_expression("body = ").unwrap_err();
        assert!(matches!(err, FingerprintError::Parse { .. }));
        assert!(err.is_rule_error());
    }

    #[test]
    fn test_compile_without_verification() {
        let config = EngineConfig::default().with_verify_programs(false);
        let program = Compiler::with_config(&config)
            .compile(&FingerPrintRule::contains(Field::Body, "x"))
            .unwrap();
        assert!(program.verify().is_ok());
    }
}
