//! Signature database loading.
//!
//! A signature file is a list of entries. Each entry combines any number of
//! keyword regexps, header matchers, body checksums, a textual expression and
//! nested entries under one `condition`:
//!
//! ```yaml
//! - name: exe-download
//!   condition: or
//!   keywords:
//!     - product: exe
//!       regexp: '.*\.exe'
//!     - product: exe
//!       regexp: '.*\.aexe'
//! - name: php
//!   cpe: "cpe:/a:php:php"
//!   headers:
//!     - key: X-Powered-By
//!       value:
//!         regexp: 'PHP/([\d.]+)'
//!         version_index: 1
//! ```
//!
//! Entries are decoded one at a time, so a malformed entry is reported in the
//! [`LoadReport`] without affecting the others.

use crate::compiler::parse_expression;
use crate::error::{FingerprintError, Result};
use crate::rule::{CaptureGroups, Condition, Cpe, Field, FingerPrintRule, FingerprintInfo};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Rules decoded from one signature source.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub rules: Vec<FingerPrintRule>,
    /// Position of every rejected entry in the source list, with the reason.
    pub rejected: Vec<(usize, FingerprintError)>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    info: Option<FingerprintInfo>,
    /// Shorthand for `info.cpe`, in `cpe:/part:vendor:product:...` form.
    #[serde(default)]
    cpe: Option<String>,
    #[serde(default = "default_condition")]
    condition: Condition,
    #[serde(default)]
    keywords: Vec<KeywordEntry>,
    #[serde(default)]
    headers: Vec<HeaderEntry>,
    #[serde(default)]
    md5s: Vec<String>,
    #[serde(default)]
    expression: Option<String>,
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

fn default_condition() -> Condition {
    Condition::Or
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct KeywordEntry {
    regexp: String,
    /// Field the pattern runs over; the whole response when absent.
    field: Option<String>,
    part: String,
    vendor: String,
    product: String,
    version: String,
    update: String,
    edition: String,
    language: String,
    vendor_index: usize,
    product_index: usize,
    version_index: usize,
    update_index: usize,
    edition_index: usize,
    language_index: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HeaderEntry {
    key: String,
    value: KeywordEntry,
}

impl KeywordEntry {
    fn into_rule(self) -> Result<FingerPrintRule> {
        if self.regexp.is_empty() {
            return Err(FingerprintError::Compilation(
                "keyword without a regexp".to_string(),
            ));
        }
        let field = match &self.field {
            Some(name) => Field::parse(name)
                .ok_or_else(|| FingerprintError::UnknownField(name.clone()))?,
            None => Field::Banner,
        };
        let groups = CaptureGroups {
            vendor: self.vendor_index,
            product: self.product_index,
            version: self.version_index,
            update: self.update_index,
            edition: self.edition_index,
            language: self.language_index,
        };
        let cpe = Cpe {
            part: self.part,
            vendor: self.vendor,
            product: self.product,
            version: self.version,
            update: self.update,
            edition: self.edition,
            language: self.language,
        };

        let rule = if groups.is_empty() {
            FingerPrintRule::regexp(field, self.regexp)
        } else {
            FingerPrintRule::regexp_with_groups(field, self.regexp, groups)
        };
        Ok(if cpe.is_empty() {
            rule
        } else {
            rule.with_info(FingerprintInfo::with_cpe(cpe))
        })
    }
}

impl RuleEntry {
    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    fn own_info(&mut self) -> Result<Option<FingerprintInfo>> {
        let mut info = self.info.take();
        if let Some(text) = self.cpe.take() {
            let cpe = Cpe::parse(&text)?;
            info.get_or_insert_with(FingerprintInfo::default).cpe.overlay(&cpe);
        }
        Ok(info)
    }

    fn into_rule(mut self) -> Result<FingerPrintRule> {
        let info = self.own_info()?;
        let label = self.label().to_string();
        let mut children = Vec::new();

        for keyword in self.keywords {
            children.push(keyword.into_rule()?);
        }
        for header in self.headers {
            if header.key.is_empty() {
                return Err(FingerprintError::Compilation(format!(
                    "rule '{label}': header matcher without a key"
                )));
            }
            children.push(FingerPrintRule::http_header(
                header.key,
                header.value.into_rule()?,
            ));
        }
        for md5 in self.md5s {
            children.push(FingerPrintRule::md5(md5));
        }
        if let Some(expression) = &self.expression {
            children.push(parse_expression(expression)?);
        }
        for nested in self.rules {
            children.push(nested.into_rule()?);
        }

        let rule = match children.len() {
            0 => {
                return Err(FingerprintError::Compilation(format!(
                    "rule '{label}' has no conditions"
                )))
            }
            1 => {
                let mut only = children.remove(0);
                if let Some(info) = info {
                    // The child's own info is the more specific one.
                    let mut merged = info;
                    if let Some(child_info) = only.info.take() {
                        merged.overlay(&child_info);
                    }
                    only.info = Some(merged);
                }
                return Ok(only);
            }
            _ => FingerPrintRule::complex(self.condition, children),
        };
        Ok(match info {
            Some(info) => rule.with_info(info),
            None => rule,
        })
    }
}

/// Reads signature files into Rule Trees.
///
/// # Example
/// ```rust
/// use fingerprint_engine::rule::RuleLoader;
///
/// let report = RuleLoader::new().load_yaml_str(r#"
/// - name: minicms
///   expression: 'header = "MiniCMS"'
/// "#)?;
/// assert_eq!(report.rules.len(), 1);
/// assert!(report.is_clean());
/// # Ok::<(), fingerprint_engine::FingerprintError>(())
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleLoader;

impl RuleLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a YAML signature list.
    ///
    /// # Errors
    /// Fails only when the document itself is not a list; bad entries are
    /// collected in [`LoadReport::rejected`].
    pub fn load_yaml_str(&self, yaml: &str) -> Result<LoadReport> {
        let entries: Vec<serde_yaml::Value> = serde_yaml::from_str(yaml)?;
        Ok(self.collect(entries, |value| Ok(serde_yaml::from_value(value)?)))
    }

    /// Load a JSON signature list.
    pub fn load_json_str(&self, json: &str) -> Result<LoadReport> {
        let entries: Vec<serde_json::Value> = serde_json::from_str(json)?;
        Ok(self.collect(entries, |value| Ok(serde_json::from_value(value)?)))
    }

    /// Load a signature file, choosing the format by extension (`.json` is
    /// JSON, anything else YAML).
    pub fn load_path(&self, path: impl AsRef<Path>) -> Result<LoadReport> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        debug!("loading signatures from {}", path.display());
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => self.load_json_str(&text),
            _ => self.load_yaml_str(&text),
        }
    }

    fn collect<V, F>(&self, entries: Vec<V>, decode: F) -> LoadReport
    where
        F: Fn(V) -> Result<RuleEntry>,
    {
        let mut report = LoadReport::default();
        for (index, value) in entries.into_iter().enumerate() {
            let entry = match decode(value) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("rejected rule entry {}: {}", index, err);
                    report.rejected.push((index, err));
                    continue;
                }
            };
            let label = entry.label().to_string();
            match entry.into_rule() {
                Ok(rule) => report.rules.push(rule),
                Err(err) => {
                    warn!("rejected rule entry {} ({}): {}", index, label, err);
                    report.rejected.push((index, err));
                }
            }
        }
        debug!(
            "loaded {} rules, rejected {}",
            report.rules.len(),
            report.rejected.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::MatchMethod;

    #[test]
    fn test_keywords_or() {
        let yaml = r#"
- condition: or
  keywords:
    - product: exe
      regexp: '.*\.exe'
    - product: exe
      regexp: '.*\.aexe'
"#;
        let report = RuleLoader::new().load_yaml_str(yaml).unwrap();
        assert!(report.is_clean());
        let rule = &report.rules[0];
        assert_eq!(rule.method(), MatchMethod::Complex);
        assert_eq!(rule.to_string(), r#"banner ~= ".*\\.exe" || banner ~= ".*\\.aexe""#);
    }

    #[test]
    fn test_single_keyword_not_wrapped() {
        let yaml = r#"
- cpe: "cpe:/a:php:php"
  headers:
    - key: X-Powered-By
      value:
        regexp: 'PHP/([\d.]+)'
        version_index: 1
"#;
        let report = RuleLoader::new().load_yaml_str(yaml).unwrap();
        let rule = &report.rules[0];
        assert_eq!(rule.method(), MatchMethod::HttpHeader);
        let info = rule.info.as_ref().unwrap();
        assert_eq!(info.cpe.vendor, "php");
        assert_eq!(info.cpe.product, "php");
    }

    #[test]
    fn test_mixed_sources_and_nesting() {
        let yaml = r#"
- name: mixed
  condition: and
  info:
    service_name: http
  md5s: ["5D41402ABC4B2A76B9719D911017C592"]
  expression: 'title = "Login"'
  rules:
    - keywords:
        - regexp: 'nginx'
          field: server
          product: nginx
"#;
        let report = RuleLoader::new().load_yaml_str(yaml).unwrap();
        let rule = &report.rules[0];
        assert_eq!(
            rule.to_string(),
            r#"md5 == "5d41402abc4b2a76b9719d911017c592" && title = "Login" && server ~= "nginx""#
        );
        assert_eq!(rule.info.as_ref().unwrap().service_name, "http");
    }

    #[test]
    fn test_bad_entries_isolated() {
        let yaml = r#"
- expression: 'body = '
- keywords:
    - regexp: 'ok'
- unknown_key: 1
- name: empty
- cpe: "not a cpe"
  keywords:
    - regexp: 'x'
"#;
        let report = RuleLoader::new().load_yaml_str(yaml).unwrap();
        assert_eq!(report.rules.len(), 1);
        let rejected: Vec<usize> = report.rejected.iter().map(|(idx, _)| *idx).collect();
        assert_eq!(rejected, vec![0, 2, 3, 4]);
        assert!(matches!(report.rejected[0].1, FingerprintError::Parse { .. }));
        assert!(matches!(report.rejected[1].1, FingerprintError::Yaml(_)));
        assert!(matches!(report.rejected[3].1, FingerprintError::InvalidCpe(_)));
    }

    #[test]
    fn test_load_json() {
        let json = r#"[{"name": "iis", "keywords": [{"regexp": "Microsoft-IIS/([\\d.]+)", "product": "iis", "version_index": 1}]}]"#;
        let report = RuleLoader::new().load_json_str(json).unwrap();
        assert_eq!(report.rules.len(), 1);
        assert_eq!(report.rules[0].method(), MatchMethod::Regexp);
    }

    #[test]
    fn test_document_must_be_list() {
        assert!(RuleLoader::new().load_yaml_str("name: single").is_err());
        assert!(RuleLoader::new().load_json_str("{}").is_err());
    }
}
