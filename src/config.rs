//! Engine configuration.
//!
//! Every setting has a default, so a YAML document only needs the keys it
//! changes:
//!
//! ```rust
//! use fingerprint_engine::EngineConfig;
//!
//! let config = EngineConfig::from_yaml_str("use_all_rules: false\nmax_stack_depth: 32\n")?;
//! assert!(!config.use_all_rules);
//! assert_eq!(config.max_stack_depth, 32);
//! assert_eq!(config.regex_cache_capacity, 1024);
//! # Ok::<(), fingerprint_engine::FingerprintError>(())
//! ```

use crate::error::Result;
use crate::matcher::cache::DEFAULT_CAPACITY;
use crate::vm::DEFAULT_MAX_STACK_DEPTH;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Operand stack limit of the virtual machine.
    pub max_stack_depth: usize,
    /// Maximum number of compiled patterns kept in the regex cache.
    pub regex_cache_capacity: usize,
    /// Stop a tree-walked `complex` node as soon as its result is decided.
    /// Off by default: tree-walking evaluates every child.
    pub tree_walk_short_circuit: bool,
    /// Report every matching rule instead of stopping at the first.
    pub use_all_rules: bool,
    /// Drop rules whose canonical expression and CPE duplicate an earlier rule.
    pub dedup_rules: bool,
    /// Run the bytecode verifier on every compiled program.
    pub verify_programs: bool,
    /// Evaluate batches on the rayon thread pool.
    pub enable_parallel_processing: bool,
    /// Smaller batches are evaluated on the calling thread.
    pub min_batch_size_for_parallelism: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            regex_cache_capacity: DEFAULT_CAPACITY,
            tree_walk_short_circuit: false,
            use_all_rules: true,
            dedup_rules: true,
            verify_programs: true,
            enable_parallel_processing: true,
            min_batch_size_for_parallelism: 16,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for scanning large target lists: first hit wins, a
    /// larger regex cache, parallel batches from small sizes up.
    pub fn high_throughput() -> Self {
        Self {
            regex_cache_capacity: 8192,
            tree_walk_short_circuit: true,
            use_all_rules: false,
            min_batch_size_for_parallelism: 4,
            ..Self::default()
        }
    }

    /// Configuration for rule authoring: every rule reported, no dedup, no
    /// threads.
    pub fn development() -> Self {
        Self {
            dedup_rules: false,
            enable_parallel_processing: false,
            ..Self::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn with_max_stack_depth(mut self, depth: usize) -> Self {
        self.max_stack_depth = depth;
        self
    }

    pub fn with_regex_cache_capacity(mut self, capacity: usize) -> Self {
        self.regex_cache_capacity = capacity;
        self
    }

    pub fn with_tree_walk_short_circuit(mut self, enable: bool) -> Self {
        self.tree_walk_short_circuit = enable;
        self
    }

    pub fn with_use_all_rules(mut self, enable: bool) -> Self {
        self.use_all_rules = enable;
        self
    }

    pub fn with_dedup_rules(mut self, enable: bool) -> Self {
        self.dedup_rules = enable;
        self
    }

    pub fn with_verify_programs(mut self, enable: bool) -> Self {
        self.verify_programs = enable;
        self
    }

    pub fn with_parallel_processing(mut self, enable: bool) -> Self {
        self.enable_parallel_processing = enable;
        self
    }

    pub fn with_min_batch_size_for_parallelism(mut self, min_size: usize) -> Self {
        self.min_batch_size_for_parallelism = min_size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FingerprintError;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();

        assert_eq!(config.max_stack_depth, 64);
        assert_eq!(config.regex_cache_capacity, 1024);
        assert!(!config.tree_walk_short_circuit);
        assert!(config.use_all_rules);
        assert!(config.dedup_rules);
        assert!(config.verify_programs);
    }

    #[test]
    fn test_high_throughput_config() {
        let config = EngineConfig::high_throughput();

        assert!(!config.use_all_rules);
        assert!(config.tree_walk_short_circuit);
        assert_eq!(config.regex_cache_capacity, 8192);
        assert!(config.verify_programs);
    }

    #[test]
    fn test_development_config() {
        let config = EngineConfig::development();

        assert!(!config.dedup_rules);
        assert!(!config.enable_parallel_processing);
        assert!(config.use_all_rules);
    }

    #[test]
    fn test_builder_methods() {
        let config = EngineConfig::new()
            .with_max_stack_depth(16)
            .with_regex_cache_capacity(10)
            .with_tree_walk_short_circuit(true)
            .with_use_all_rules(false)
            .with_dedup_rules(false)
            .with_verify_programs(false)
            .with_parallel_processing(false)
            .with_min_batch_size_for_parallelism(2);

        assert_eq!(config.max_stack_depth, 16);
        assert_eq!(config.regex_cache_capacity, 10);
        assert!(config.tree_walk_short_circuit);
        assert!(!config.use_all_rules);
        assert!(!config.dedup_rules);
        assert!(!config.verify_programs);
        assert!(!config.enable_parallel_processing);
        assert_eq!(config.min_batch_size_for_parallelism, 2);
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = EngineConfig::from_yaml_str("tree_walk_short_circuit: true\n").unwrap();
        assert!(config.tree_walk_short_circuit);
        assert_eq!(config.max_stack_depth, 64);
    }

    #[test]
    fn test_from_yaml_rejects_bad_type() {
        let err = EngineConfig::from_yaml_str("max_stack_depth: lots\n").unwrap_err();
        assert!(matches!(err, FingerprintError::Yaml(_)));
    }
}
