//! Core types shared by the bytecode executor and the tree-walk registry.
//!
//! Both execution paths reduce every leaf to the same primitives defined
//! here, so a rule gives the same verdict whichever path evaluates it.

use crate::error::Result;
use crate::matcher::builder::MethodRegistry;
use crate::matcher::context::{FieldExtractor, FieldValue};
use crate::rule::{CaptureGroups, CompareOp, FingerPrintRule, FingerprintInfo};
use regex::Regex;
use std::sync::Arc;

/// Outcome of evaluating one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    pub matched: bool,
    /// Identification carried by the node that decided the verdict.
    pub info: Option<FingerprintInfo>,
}

impl Verdict {
    pub fn new(matched: bool) -> Self {
        Self {
            matched,
            info: None,
        }
    }

    pub fn no_match() -> Self {
        Self::new(false)
    }

    pub fn matched_with(info: FingerprintInfo) -> Self {
        Self {
            matched: true,
            info: Some(info),
        }
    }

    /// Attach a node's own info to a positive verdict. Fields already
    /// captured by a descendant take precedence over the node's template.
    pub fn attach(&mut self, node_info: &FingerprintInfo) {
        if !self.matched {
            return;
        }
        let mut merged = node_info.clone();
        if let Some(captured) = self.info.take() {
            merged.overlay(&captured);
        }
        self.info = Some(merged);
    }

    /// Logical negation. Captured info does not survive negation.
    pub fn negate(&self) -> Self {
        Self::new(!self.matched)
    }
}

/// Final step of every evaluation: a positive verdict becomes the rule's own
/// info merged with whatever the deciding node carried.
pub fn finish_verdict(
    verdict: &Verdict,
    default: Option<&FingerprintInfo>,
) -> Option<FingerprintInfo> {
    if !verdict.matched {
        return None;
    }
    let mut result = default.cloned().unwrap_or_default();
    if let Some(info) = &verdict.info {
        result.overlay(info);
    }
    Some(result)
}

/// Compiled predicate produced by a registry factory.
///
/// # Example
/// ```rust,ignore
/// let always: Matcher = Arc::new(|_extractor| Ok(Verdict::new(true)));
/// ```
pub type Matcher = Arc<dyn Fn(&dyn FieldExtractor) -> Result<Verdict> + Send + Sync>;

/// Builds a [`Matcher`] for one rule node. Receives the registry so that
/// composite methods can resolve their children.
pub type MatcherFactory =
    Arc<dyn Fn(&FingerPrintRule, &MethodRegistry) -> Result<Matcher> + Send + Sync>;

/// Compare a field value against a literal. Multi-valued fields match when
/// any candidate does; `!=` holds only when no candidate equals the needle.
pub fn compare_text(op: CompareOp, value: &FieldValue, needle: &str) -> bool {
    match op {
        CompareOp::NotEqual => !value.candidates().any(|candidate| candidate == needle),
        _ => value
            .candidates()
            .any(|candidate| op.evaluate(candidate, needle)),
    }
}

/// Run `regex` over each candidate until one matches. A match records the
/// matched text and, when `groups` is given, the CPE components it captured.
pub fn regex_verdict(regex: &Regex, value: &FieldValue, groups: Option<&CaptureGroups>) -> Verdict {
    for candidate in value.candidates() {
        if let Some(captures) = regex.captures(candidate) {
            let mut info = FingerprintInfo {
                raw: captures
                    .get(0)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
                ..FingerprintInfo::default()
            };
            if let Some(groups) = groups {
                info.cpe = groups.extract(&captures);
            }
            return Verdict::matched_with(info);
        }
    }
    Verdict::no_match()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::Cpe;

    #[test]
    fn test_compare_text_many() {
        let value = FieldValue::Many(vec!["PHP/7.4".to_string(), "PleskLin".to_string()]);
        assert!(compare_text(CompareOp::Contains, &value, "Plesk"));
        assert!(compare_text(CompareOp::Equal, &value, "PHP/7.4"));
        assert!(!compare_text(CompareOp::NotEqual, &value, "PHP/7.4"));
        assert!(compare_text(CompareOp::NotEqual, &value, "nginx"));
    }

    #[test]
    fn test_compare_text_empty_many() {
        let value = FieldValue::Many(Vec::new());
        assert!(!compare_text(CompareOp::Contains, &value, ""));
        assert!(compare_text(CompareOp::NotEqual, &value, "x"));
    }

    #[test]
    fn test_regex_verdict_captures() {
        let regex = Regex::new("a(e.e)a").unwrap();
        let groups = CaptureGroups {
            product: 1,
            ..CaptureGroups::default()
        };
        let verdict = regex_verdict(
            &regex,
            &FieldValue::Single("xx aexea yy".to_string()),
            Some(&groups),
        );
        assert!(verdict.matched);
        let info = verdict.info.unwrap();
        assert_eq!(info.cpe.product, "exe");
        assert_eq!(info.raw, "aexea");
    }

    #[test]
    fn test_regex_verdict_no_match() {
        let regex = Regex::new("nginx").unwrap();
        let verdict = regex_verdict(&regex, &FieldValue::Single("apache".to_string()), None);
        assert_eq!(verdict, Verdict::no_match());
    }

    #[test]
    fn test_attach_prefers_captured_fields() {
        let mut verdict = Verdict::matched_with(FingerprintInfo {
            cpe: Cpe {
                version: "1.2".to_string(),
                ..Cpe::default()
            },
            ..FingerprintInfo::default()
        });
        verdict.attach(&FingerprintInfo::with_cpe(Cpe::product("exe")));

        let info = verdict.info.unwrap();
        assert_eq!(info.cpe.product, "exe");
        assert_eq!(info.cpe.version, "1.2");
    }

    #[test]
    fn test_attach_ignores_negative_verdict() {
        let mut verdict = Verdict::no_match();
        verdict.attach(&FingerprintInfo::with_cpe(Cpe::product("exe")));
        assert!(verdict.info.is_none());
    }

    #[test]
    fn test_finish_verdict() {
        let default = FingerprintInfo::with_cpe(Cpe::product("nginx"));
        assert_eq!(finish_verdict(&Verdict::no_match(), Some(&default)), None);

        let plain = finish_verdict(&Verdict::new(true), None).unwrap();
        assert_eq!(plain, FingerprintInfo::default());

        let captured = Verdict::matched_with(FingerprintInfo {
            raw: "nginx/1.18.0".to_string(),
            ..FingerprintInfo::default()
        });
        let info = finish_verdict(&captured, Some(&default)).unwrap();
        assert_eq!(info.cpe.product, "nginx");
        assert_eq!(info.raw, "nginx/1.18.0");
    }

    #[test]
    fn test_matcher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Matcher>();
        assert_send_sync::<MatcherFactory>();
    }
}
