//! Method registry for tree-walk evaluation of Rule Trees.

use crate::config::EngineConfig;
use crate::error::{FingerprintError, Result};
use crate::matcher::cache::RegexCache;
use crate::matcher::context::FieldExtractor;
use crate::matcher::defaults::register_defaults;
use crate::matcher::types::{finish_verdict, Matcher, MatcherFactory, Verdict};
use crate::rule::{FingerPrintRule, FingerprintInfo, MatchMethod};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Registry mapping each match method to the factory that builds its matcher.
///
/// Evaluates a Rule Tree directly, without compiling it to bytecode. Every
/// method the compiler knows is registered by [`MethodRegistry::new`];
/// factories can be replaced to customize how a method is evaluated.
///
/// # Example
/// ```rust
/// use fingerprint_engine::matcher::{MethodRegistry, ResponseContext};
/// use fingerprint_engine::rule::{Field, FingerPrintRule};
///
/// let registry = MethodRegistry::new();
/// let rule = FingerPrintRule::contains(Field::Body, "MiniCMS");
/// let ctx = ResponseContext::new(b"HTTP/1.1 200 OK\r\n\r\nPowered by MiniCMS");
/// assert!(registry.evaluate(&rule, &ctx)?.is_some());
/// # Ok::<(), fingerprint_engine::FingerprintError>(())
/// ```
pub struct MethodRegistry {
    factories: HashMap<MatchMethod, MatcherFactory>,
    regex_cache: Arc<RegexCache>,
    short_circuit: bool,
}

impl MethodRegistry {
    /// Create a registry with the default factory for every method.
    pub fn new() -> Self {
        Self::with_cache(Arc::new(RegexCache::new()))
    }

    /// Create a registry sharing an existing regex cache.
    pub fn with_cache(regex_cache: Arc<RegexCache>) -> Self {
        let mut registry = Self::empty(regex_cache);
        register_defaults(&mut registry);
        registry
    }

    pub fn with_config(config: &EngineConfig, regex_cache: Arc<RegexCache>) -> Self {
        Self::with_cache(regex_cache).with_short_circuit(config.tree_walk_short_circuit)
    }

    /// Create a registry with no factories registered.
    pub fn empty(regex_cache: Arc<RegexCache>) -> Self {
        Self {
            factories: HashMap::new(),
            regex_cache,
            short_circuit: false,
        }
    }

    /// Stop `complex` nodes once their result is decided. When off, every
    /// child is evaluated and the reported verdict is still the deciding one.
    pub fn with_short_circuit(mut self, enable: bool) -> Self {
        self.short_circuit = enable;
        self
    }

    /// Register (or replace) the factory for a method.
    ///
    /// # Example
    /// ```rust
    /// use fingerprint_engine::matcher::{Matcher, MethodRegistry, Verdict};
    /// use fingerprint_engine::rule::MatchMethod;
    /// use std::sync::Arc;
    ///
    /// let mut registry = MethodRegistry::new();
    /// registry.register(MatchMethod::Md5, |_rule, _registry| {
    ///     let never: Matcher = Arc::new(|_extractor| Ok(Verdict::no_match()));
    ///     Ok(never)
    /// });
    /// ```
    pub fn register<F>(&mut self, method: MatchMethod, factory: F) -> &mut Self
    where
        F: Fn(&FingerPrintRule, &MethodRegistry) -> Result<Matcher> + Send + Sync + 'static,
    {
        self.factories.insert(method, Arc::new(factory));
        self
    }

    /// Build a matcher for a nested node. A node with its own info attaches
    /// it to positive verdicts.
    pub fn build(&self, rule: &FingerPrintRule) -> Result<Matcher> {
        let matcher = self.build_node(rule)?;
        match &rule.info {
            Some(info) => {
                let info = info.clone();
                Ok(Arc::new(move |extractor: &dyn FieldExtractor| {
                    let mut verdict = matcher(extractor)?;
                    verdict.attach(&info);
                    Ok(verdict)
                }))
            }
            None => Ok(matcher),
        }
    }

    /// Prepare a root rule for repeated evaluation.
    pub fn prepare(&self, rule: &FingerPrintRule) -> Result<PreparedRule> {
        Ok(PreparedRule {
            matcher: self.build_node(rule)?,
            info: rule.info.clone(),
        })
    }

    /// Evaluate a root rule once against one response.
    pub fn evaluate(
        &self,
        rule: &FingerPrintRule,
        extractor: &dyn FieldExtractor,
    ) -> Result<Option<FingerprintInfo>> {
        self.prepare(rule)?.evaluate(extractor)
    }

    pub fn has_method(&self, method: MatchMethod) -> bool {
        self.factories.contains_key(&method)
    }

    pub fn method_count(&self) -> usize {
        self.factories.len()
    }

    pub fn short_circuit(&self) -> bool {
        self.short_circuit
    }

    pub fn regex_cache(&self) -> &Arc<RegexCache> {
        &self.regex_cache
    }

    fn build_node(&self, rule: &FingerPrintRule) -> Result<Matcher> {
        let method = rule.method();
        let factory = self.factories.get(&method).ok_or_else(|| {
            FingerprintError::Compilation(format!("no matcher registered for method '{method}'"))
        })?;
        factory(rule, self)
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&str> = self.factories.keys().map(|m| m.as_str()).collect();
        methods.sort_unstable();
        f.debug_struct("MethodRegistry")
            .field("methods", &methods)
            .field("short_circuit", &self.short_circuit)
            .finish()
    }
}

/// A root rule built into a matcher, ready to evaluate many responses.
#[derive(Clone)]
pub struct PreparedRule {
    matcher: Matcher,
    info: Option<FingerprintInfo>,
}

impl PreparedRule {
    pub fn evaluate(&self, extractor: &dyn FieldExtractor) -> Result<Option<FingerprintInfo>> {
        let verdict: Verdict = (self.matcher)(extractor)?;
        Ok(finish_verdict(&verdict, self.info.as_ref()))
    }

    pub fn info(&self) -> Option<&FingerprintInfo> {
        self.info.as_ref()
    }
}

impl fmt::Debug for PreparedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedRule")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}
