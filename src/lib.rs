//! # Fingerprint Engine
//!
//! A rule expression compiler and stack virtual machine for service
//! fingerprinting. Rules identify a product (as a CPE) from a captured
//! network response: its HTTP headers, body, title, banner or checksum.
//!
//! The pipeline:
//!
//! - [`parse_expression`] turns `header = "MiniCMS" && (body = "1" || body = "2")`
//!   into a Rule Tree ([`FingerPrintRule`]); [`RuleLoader`] builds the same
//!   trees from YAML/JSON signature databases.
//! - [`Compiler`] lowers a Rule Tree to a verified bytecode [`Program`] with
//!   short-circuit jumps.
//! - [`Vm`] executes a program against a [`FieldExtractor`], fetching fields
//!   only when an instruction needs them.
//! - [`Decompiler`] turns a program back into a canonical expression, used to
//!   deduplicate signatures written in different styles.
//! - [`MethodRegistry`] evaluates Rule Trees directly, without bytecode.
//!
//! ## Quick Start
//!
//! ```rust
//! use fingerprint_engine::{Compiler, ResponseContext, Vm};
//!
//! let program = Compiler::new().compile_expression(r#"header = "VIDEO WEB SERVER""#)?;
//! let response = ResponseContext::new(
//!     b"HTTP/1.1 200 OK\r\nTag: --- VIDEO WEB SERVER ---\r\n\r\n<html></html>",
//! );
//!
//! let info = Vm::new().execute(&program, &response)?;
//! assert!(info.is_some());
//! # Ok::<(), fingerprint_engine::FingerprintError>(())
//! ```
//!
//! ### Capturing versions
//!
//! ```rust
//! use fingerprint_engine::rule::{CaptureGroups, Field, FingerPrintRule};
//! use fingerprint_engine::{Compiler, ResponseContext, Vm};
//!
//! let groups = CaptureGroups { version: 1, ..CaptureGroups::default() };
//! let rule = FingerPrintRule::regexp_with_groups(Field::Server, r"nginx/([\d.]+)", groups);
//! let program = Compiler::new().compile(&rule)?;
//!
//! let response = ResponseContext::new(b"HTTP/1.1 200 OK\r\nServer: nginx/1.18.0\r\n\r\n");
//! let info = Vm::new().execute(&program, &response)?.unwrap();
//! assert_eq!(info.cpe.version, "1.18.0");
//! assert_eq!(info.version, "1.18.0");
//! # Ok::<(), fingerprint_engine::FingerprintError>(())
//! ```
//!
//! ### Rule sets
//!
//! ```rust
//! use fingerprint_engine::{FingerprintEngine, RuleLoader};
//!
//! let report = RuleLoader::new().load_yaml_str(r#"
//! - condition: or
//!   keywords:
//!     - product: exe
//!       regexp: '.*\.exe'
//!     - product: exe
//!       regexp: '.*\.aexe'
//! "#)?;
//! let engine = FingerprintEngine::from_rules(report.rules);
//!
//! let results = engine.match_batch(&[
//!     b"HTTP/1.1 200 OK\r\n\r\n/AV732E/setup.exe".to_vec(),
//!     b"HTTP/1.1 200 OK\r\n\r\nnothing here".to_vec(),
//! ]);
//! assert_eq!(results[0].first().unwrap().cpe.product, "exe");
//! assert!(!results[1].is_match());
//! # Ok::<(), fingerprint_engine::FingerprintError>(())
//! ```

pub mod compiler;
pub mod config;
pub mod decompiler;
pub mod engine;
pub mod error;
pub mod ir;
pub mod matcher;
pub mod rule;
pub mod vm;

// Primary engine interface
pub use engine::{CompiledRule, EngineResult, FingerprintEngine, RuleMatch};

// Compiler, decompiler and configuration
pub use compiler::{parse_expression, Compiler};
pub use config::EngineConfig;
pub use decompiler::{Decompiler, GeneralRule};

// Core types and errors
pub use error::{FingerprintError, Result};
pub use ir::{OpCode, Program};
pub use rule::{
    CaptureGroups, CompareOp, Condition, Cpe, Field, FingerPrintRule, FingerprintInfo, Literal,
    LoadReport, MatchMethod, MatchParam, RuleLoader,
};
pub use vm::Vm;

// Matcher system
pub use matcher::{
    FieldExtractor, FieldValue, Matcher, MatcherFactory, MethodRegistry, RegexCache,
    ResponseContext, Verdict,
};
