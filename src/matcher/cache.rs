//! Compiled-regex cache shared by the executor and the method registry.
//!
//! The cache is keyed by pattern text and append-only: once a pattern is in,
//! it stays until `clear`. Readers take a shared lock; a miss compiles
//! outside the lock and inserts under the write lock. Two threads racing on
//! the same miss both compile, and the first insert wins. A poisoned lock is
//! treated as a miss, so the cache never turns into a correctness issue.

use crate::error::Result;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Default number of patterns kept.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct RegexCache {
    patterns: RwLock<HashMap<String, Arc<Regex>>>,
    capacity: usize,
    stats: CacheCounters,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicUsize,
    misses: AtomicUsize,
    compilations: AtomicUsize,
}

/// Snapshot of cache activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub compilations: usize,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Once `capacity` patterns are held, further patterns are still compiled
    /// but no longer stored.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            patterns: RwLock::new(HashMap::new()),
            capacity,
            stats: CacheCounters::default(),
        }
    }

    /// Get the compiled form of `pattern`, compiling it on first use.
    pub fn get_regex(&self, pattern: &str) -> Result<Arc<Regex>> {
        if let Ok(patterns) = self.patterns.read() {
            if let Some(regex) = patterns.get(pattern) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(regex));
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let regex = Regex::new(pattern)?;
        self.stats.compilations.fetch_add(1, Ordering::Relaxed);
        let regex = Arc::new(regex);

        if let Ok(mut patterns) = self.patterns.write() {
            if patterns.len() < self.capacity || patterns.contains_key(pattern) {
                let entry = patterns
                    .entry(pattern.to_string())
                    .or_insert_with(|| Arc::clone(&regex));
                return Ok(Arc::clone(entry));
            }
        }
        Ok(regex)
    }

    pub fn len(&self) -> usize {
        self.patterns.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            compilations: self.stats.compilations.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut patterns) = self.patterns.write() {
            patterns.clear();
        }
    }
}

impl Default for RegexCache {
    fn default() -> Self {
        Self::new()
    }
}
