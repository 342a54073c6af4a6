//! Leaf matching primitives and the tree-walk method registry.
//!
//! ## Core Components
//!
//! - [`FieldExtractor`] - Named-field access over a captured response
//! - [`ResponseContext`] - Default extractor for raw HTTP responses and banners
//! - [`RegexCache`] - Bounded compiled-pattern cache shared by both execution paths
//! - [`MethodRegistry`] - Method-name to matcher-factory registry for tree-walking
//!
//! The virtual machine and the registry both reduce leaves to
//! [`compare_text`] and [`regex_verdict`], so they agree on every verdict.
//!
//! ## Example Usage
//!
//! ```rust
//! use fingerprint_engine::matcher::{MethodRegistry, ResponseContext};
//! use fingerprint_engine::parse_expression;
//!
//! let rule = parse_expression(r#"header_item.X-Powered-By ~= "PHP""#)?;
//! let ctx = ResponseContext::new(b"HTTP/1.1 200 OK\r\nX-Powered-By: PHP/7.4\r\n\r\n");
//! assert!(MethodRegistry::new().evaluate(&rule, &ctx)?.is_some());
//! # Ok::<(), fingerprint_engine::FingerprintError>(())
//! ```

pub mod builder;
pub mod cache;
pub mod context;
pub mod defaults;
pub mod types;

pub use builder::{MethodRegistry, PreparedRule};
pub use cache::{CacheStats, RegexCache};
pub use context::{FieldExtractor, FieldValue, ResponseContext, ScopedValue};
pub use defaults::{
    create_complex_matcher, create_exp_matcher, create_http_header_matcher, create_md5_matcher,
    create_regexp_matcher, register_defaults,
};
pub use types::{compare_text, finish_verdict, regex_verdict, Matcher, MatcherFactory, Verdict};
