//! Primary fingerprint engine interface.
//!
//! [`FingerprintEngine`] owns a rule set compiled to bytecode, the virtual
//! machine that runs it and the regex cache both execution paths share.

use crate::compiler::{parse_expression, Compiler};
use crate::config::EngineConfig;
use crate::decompiler::Decompiler;
use crate::error::{FingerprintError, Result};
use crate::ir::Program;
use crate::matcher::{FieldExtractor, MethodRegistry, PreparedRule, RegexCache, ResponseContext};
use crate::rule::{FingerPrintRule, FingerprintInfo};
use crate::vm::Vm;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// A rule accepted into the engine.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    /// Position of the rule in the list the engine was built from.
    pub index: usize,
    pub rule: Arc<FingerPrintRule>,
    pub program: Arc<Program>,
    /// Canonical expression recovered from `program`.
    pub expression: String,
    prepared: PreparedRule,
}

/// One matched rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub rule_index: usize,
    pub info: FingerprintInfo,
}

/// Outcome of matching one response against the rule set.
#[derive(Debug, Default)]
pub struct EngineResult {
    pub matches: Vec<RuleMatch>,
    /// Rules that failed to evaluate, by rule index. A failed rule is never
    /// reported as a non-match.
    pub errors: Vec<(usize, FingerprintError)>,
}

impl EngineResult {
    pub fn is_match(&self) -> bool {
        !self.matches.is_empty()
    }

    pub fn first(&self) -> Option<&FingerprintInfo> {
        self.matches.first().map(|m| &m.info)
    }
}

/// Primary engine for fingerprint rule evaluation.
///
/// # Examples
///
/// ```rust
/// use fingerprint_engine::{FingerprintEngine, ResponseContext};
///
/// let engine = FingerprintEngine::from_expressions(&[
///     r#"header = "VIDEO WEB SERVER""#,
///     r#"body = "MiniCMS""#,
/// ]);
/// assert_eq!(engine.rule_count(), 2);
///
/// let ctx = ResponseContext::new(b"HTTP/1.1 200 OK\r\nTag: --- VIDEO WEB SERVER ---\r\n\r\n");
/// let result = engine.match_response(&ctx);
/// assert_eq!(result.matches.len(), 1);
/// assert_eq!(result.matches[0].rule_index, 0);
/// ```
#[derive(Debug)]
pub struct FingerprintEngine {
    rules: Vec<CompiledRule>,
    rejected: Vec<(usize, FingerprintError)>,
    vm: Vm,
    registry: MethodRegistry,
    config: EngineConfig,
}

impl FingerprintEngine {
    /// Build an engine with the default configuration.
    pub fn from_rules(rules: Vec<FingerPrintRule>) -> Self {
        Self::from_rules_with_config(rules, EngineConfig::default())
    }

    /// Build an engine, compiling every rule. Rules that fail to compile are
    /// kept out of the rule set and listed in [`FingerprintEngine::rejected`].
    pub fn from_rules_with_config(rules: Vec<FingerPrintRule>, config: EngineConfig) -> Self {
        let vm = Vm::with_config(&config);
        let registry = MethodRegistry::with_config(&config, Arc::clone(vm.regex_cache()));
        let mut engine = Self {
            rules: Vec::with_capacity(rules.len()),
            rejected: Vec::new(),
            vm,
            registry,
            config,
        };

        let compiler = Compiler::with_config(&engine.config);
        let decompiler = Decompiler::new();
        let mut seen = HashSet::new();

        for (index, rule) in rules.into_iter().enumerate() {
            match engine.admit(index, rule, &compiler, &decompiler, &mut seen) {
                Ok(true) => {}
                Ok(false) => debug!("dropped duplicate rule {}", index),
                Err(err) => {
                    warn!("rejected rule {}: {}", index, err);
                    engine.rejected.push((index, err));
                }
            }
        }
        debug!(
            "engine ready with {} rules ({} rejected)",
            engine.rules.len(),
            engine.rejected.len()
        );
        engine
    }

    /// Parse and build from textual expressions. Parse errors reject the
    /// offending expression only.
    pub fn from_expressions(expressions: &[&str]) -> Self {
        Self::from_expressions_with_config(expressions, EngineConfig::default())
    }

    pub fn from_expressions_with_config(expressions: &[&str], config: EngineConfig) -> Self {
        let mut parsed = Vec::with_capacity(expressions.len());
        let mut rejected = Vec::new();
        for (index, expression) in expressions.iter().enumerate() {
            match parse_expression(expression) {
                Ok(rule) => parsed.push((index, rule)),
                Err(err) => {
                    warn!("rejected expression {}: {}", index, err);
                    rejected.push((index, err));
                }
            }
        }

        let (indices, rules): (Vec<usize>, Vec<FingerPrintRule>) = parsed.into_iter().unzip();
        let mut engine = Self::from_rules_with_config(rules, config);
        for rule in &mut engine.rules {
            rule.index = indices[rule.index];
        }
        for (index, _) in &mut engine.rejected {
            *index = indices[*index];
        }
        engine.rejected.extend(rejected);
        engine.rejected.sort_by_key(|(index, _)| *index);
        engine
    }

    /// Compile one rule and add it unless it duplicates an earlier one.
    fn admit(
        &mut self,
        index: usize,
        rule: FingerPrintRule,
        compiler: &Compiler,
        decompiler: &Decompiler,
        seen: &mut HashSet<FingerPrintRule>,
    ) -> Result<bool> {
        let program = compiler.compile(&rule)?;
        let prepared = self.registry.prepare(&rule)?;
        let general = decompiler.decompile(&program)?;

        if self.config.dedup_rules && !seen.insert(general.dedup_key().clone()) {
            return Ok(false);
        }
        self.rules.push(CompiledRule {
            index,
            rule: Arc::new(rule),
            program: Arc::new(program),
            expression: general.expression,
            prepared,
        });
        Ok(true)
    }

    /// Match one response against every rule through the virtual machine.
    pub fn match_response(&self, extractor: &dyn FieldExtractor) -> EngineResult {
        self.run(extractor, |rule, extractor| {
            self.vm.execute(&rule.program, extractor)
        })
    }

    /// Match one response by tree-walking the source rules through the
    /// method registry. Verdicts agree with [`FingerprintEngine::match_response`].
    pub fn tree_walk(&self, extractor: &dyn FieldExtractor) -> EngineResult {
        self.run(extractor, |rule, extractor| rule.prepared.evaluate(extractor))
    }

    fn run<F>(&self, extractor: &dyn FieldExtractor, evaluate: F) -> EngineResult
    where
        F: Fn(&CompiledRule, &dyn FieldExtractor) -> Result<Option<FingerprintInfo>>,
    {
        let mut result = EngineResult::default();
        for rule in &self.rules {
            match evaluate(rule, extractor) {
                Ok(Some(info)) => {
                    result.matches.push(RuleMatch {
                        rule_index: rule.index,
                        info,
                    });
                    if !self.config.use_all_rules {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    debug!("rule {} failed: {}", rule.index, err);
                    result.errors.push((rule.index, err));
                }
            }
        }
        result
    }

    /// Match many raw responses. Large batches are spread over the rayon
    /// pool; results keep the order of `responses`.
    pub fn match_batch<T>(&self, responses: &[T]) -> Vec<EngineResult>
    where
        T: AsRef<[u8]> + Sync,
    {
        let evaluate = |raw: &T| self.match_response(&ResponseContext::new(raw.as_ref()));
        if self.parallel_for(responses.len()) {
            responses.par_iter().map(evaluate).collect()
        } else {
            responses.iter().map(evaluate).collect()
        }
    }

    /// Match many prepared extractors, in parallel when the batch is large.
    pub fn match_extractors<E>(&self, extractors: &[E]) -> Vec<EngineResult>
    where
        E: FieldExtractor + Sync,
    {
        if self.parallel_for(extractors.len()) {
            extractors
                .par_iter()
                .map(|extractor| self.match_response(extractor))
                .collect()
        } else {
            extractors
                .iter()
                .map(|extractor| self.match_response(extractor))
                .collect()
        }
    }

    fn parallel_for(&self, batch: usize) -> bool {
        self.config.enable_parallel_processing
            && batch >= self.config.min_batch_size_for_parallelism.max(2)
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Get the number of rules in the engine.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn rejected(&self) -> &[(usize, FingerprintError)] {
        &self.rejected
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn regex_cache(&self) -> &Arc<RegexCache> {
        self.vm.regex_cache()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Cpe, Field};

    fn http(headers: &str, body: &str) -> ResponseContext {
        ResponseContext::new(format!("HTTP/1.1 200 OK\r\n{headers}\r\n\r\n{body}").as_bytes())
    }

    #[test]
    fn test_engine_creation() {
        let engine = FingerprintEngine::from_rules(Vec::new());
        assert_eq!(engine.rule_count(), 0);
        assert!(engine.rejected().is_empty());
        assert!(!engine.match_response(&http("Server: x", "")).is_match());
    }

    #[test]
    fn test_rejects_are_isolated() {
        let engine = FingerprintEngine::from_expressions(&[
            r#"body = "ok""#,
            r#"body = "#,
            r#"body ~= "a(b""#,
            r#"title = "ok""#,
        ]);
        assert_eq!(engine.rule_count(), 2);
        let rejected: Vec<usize> = engine.rejected().iter().map(|(idx, _)| *idx).collect();
        assert_eq!(rejected, vec![1, 2]);
        assert!(matches!(engine.rejected()[1].1, FingerprintError::InvalidRegex(_)));
        assert_eq!(engine.rules()[1].index, 3);
    }

    #[test]
    fn test_dedup_by_canonical_form() {
        let engine = FingerprintEngine::from_expressions(&[
            r#"body="x" AND title="y""#,
            r#"(body = "x") && (title = "y")"#,
            r#"body = "x" || title = "y""#,
        ]);
        assert_eq!(engine.rule_count(), 2);

        let config = EngineConfig::default().with_dedup_rules(false);
        let engine = FingerprintEngine::from_expressions_with_config(
            &[r#"body = "x""#, r#"body="x""#],
            config,
        );
        assert_eq!(engine.rule_count(), 2);
    }

    #[test]
    fn test_dedup_keeps_distinct_cpe() {
        let rule = FingerPrintRule::contains(Field::Body, "x");
        let engine = FingerprintEngine::from_rules(vec![
            rule.clone().with_info(FingerprintInfo::with_cpe(Cpe::product("a"))),
            rule.with_info(FingerprintInfo::with_cpe(Cpe::product("b"))),
        ]);
        assert_eq!(engine.rule_count(), 2);
    }

    #[test]
    fn test_dedup_keeps_distinct_nested_info() {
        let rule = |product: &str| {
            FingerPrintRule::or(vec![
                FingerPrintRule::regexp(Field::Body, "alpha")
                    .with_info(FingerprintInfo::with_cpe(Cpe::product(product))),
                FingerPrintRule::regexp(Field::Body, "beta")
                    .with_info(FingerprintInfo::with_cpe(Cpe::product(product))),
            ])
        };
        let engine = FingerprintEngine::from_rules(vec![rule("alphaprod"), rule("otherprod")]);
        assert_eq!(engine.rule_count(), 2);

        let result = engine.match_response(&http("Server: x", "alpha"));
        let products: Vec<&str> = result
            .matches
            .iter()
            .map(|m| m.info.cpe.product.as_str())
            .collect();
        assert_eq!(products, vec!["alphaprod", "otherprod"]);
    }

    #[test]
    fn test_dedup_keeps_distinct_service_name() {
        let rule = |service: &str| {
            FingerPrintRule::contains(Field::Banner, "220").with_info(FingerprintInfo {
                service_name: service.to_string(),
                ..FingerprintInfo::default()
            })
        };
        let engine = FingerprintEngine::from_rules(vec![rule("ftp"), rule("smtp"), rule("ftp")]);
        assert_eq!(engine.rule_count(), 2);
    }

    #[test]
    fn test_first_match_only() {
        let expressions = [r#"body = "a""#, r#"body = "b""#];
        let ctx = http("Server: x", "ab");

        let all = FingerprintEngine::from_expressions(&expressions);
        assert_eq!(all.match_response(&ctx).matches.len(), 2);

        let config = EngineConfig::default().with_use_all_rules(false);
        let first = FingerprintEngine::from_expressions_with_config(&expressions, config);
        let result = first.match_response(&ctx);
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].rule_index, 0);
    }

    #[test]
    fn test_execution_errors_reported() {
        let engine = FingerprintEngine::from_expressions(&[r#"cert = "x""#, r#"body = "y""#]);
        let result = engine.match_response(&http("Server: x", "y"));
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(result.errors[0].1, FingerprintError::UnknownField(_)));
    }

    #[test]
    fn test_tree_walk_agrees() {
        let engine = FingerprintEngine::from_expressions(&[
            r#"header = "nginx" && (body = "1" || title = "Admin")"#,
            r#"server != "apache""#,
            r#"body ~= "v([\d.]+)""#,
        ]);
        let ctx = http("Server: nginx", "<title>Admin</title> v1.2");
        let compiled = engine.match_response(&ctx);
        let walked = engine.tree_walk(&ctx);
        assert_eq!(compiled.matches, walked.matches);
        assert_eq!(compiled.matches.len(), 3);
    }

    #[test]
    fn test_match_batch_keeps_order() {
        let config = EngineConfig::default().with_min_batch_size_for_parallelism(2);
        let engine =
            FingerprintEngine::from_expressions_with_config(&[r#"body = "hit""#], config);
        let responses: Vec<Vec<u8>> = (0..32)
            .map(|i| {
                let body = if i % 3 == 0 { "hit" } else { "miss" };
                format!("HTTP/1.1 200 OK\r\n\r\n{body}").into_bytes()
            })
            .collect();

        let results = engine.match_batch(&responses);
        assert_eq!(results.len(), 32);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.is_match(), i % 3 == 0, "response {i}");
        }
    }

    #[test]
    fn test_shared_regex_cache() {
        let engine = FingerprintEngine::from_expressions(&[r#"body ~= "a+""#]);
        // Building the tree-walk matcher already compiled the pattern.
        assert_eq!(engine.regex_cache().len(), 1);
        engine.match_response(&http("", "aaa"));
        assert_eq!(engine.regex_cache().len(), 1);
        assert!(engine.regex_cache().stats().hits >= 1);
    }
}
