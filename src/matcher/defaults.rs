//! Default matcher factories for every match method.
//!
//! Each factory checks the node's payload once, at build time, and returns a
//! closure that only does field extraction and comparison per response.

use crate::error::{FingerprintError, Result};
use crate::matcher::builder::MethodRegistry;
use crate::matcher::context::{FieldExtractor, ScopedValue};
use crate::matcher::types::{compare_text, regex_verdict, Matcher, Verdict};
use crate::rule::{CompareOp, Condition, Field, FingerPrintRule, MatchMethod, MatchParam};
use std::sync::Arc;

/// Register the default factory for every method.
pub fn register_defaults(registry: &mut MethodRegistry) {
    registry
        .register(MatchMethod::Exp, create_exp_matcher)
        .register(MatchMethod::Complex, create_complex_matcher)
        .register(MatchMethod::Regexp, create_regexp_matcher)
        .register(MatchMethod::HttpHeader, create_http_header_matcher)
        .register(MatchMethod::Md5, create_md5_matcher);
}

fn unexpected(expected: MatchMethod, rule: &FingerPrintRule) -> FingerprintError {
    FingerprintError::Compilation(format!(
        "{expected} matcher cannot build a {} rule",
        rule.method()
    ))
}

/// Compare one field against a literal with `=`, `!=` or `~=`.
///
/// # Example
/// ```rust,ignore
/// let matcher = create_exp_matcher(&FingerPrintRule::contains(Field::Body, "x"), &registry)?;
/// ```
pub fn create_exp_matcher(rule: &FingerPrintRule, _registry: &MethodRegistry) -> Result<Matcher> {
    let MatchParam::Exp { field, op, value } = &rule.param else {
        return Err(unexpected(MatchMethod::Exp, rule));
    };
    let field = field.clone();
    let op = *op;
    let needle = value.as_text().into_owned();

    Ok(Arc::new(move |extractor: &dyn FieldExtractor| {
        let subject = extractor.extract(&field)?;
        Ok(Verdict::new(compare_text(op, &subject, &needle)))
    }))
}

/// Match a field against a regular expression. The pattern is compiled
/// through the registry's cache when the matcher is built, so a bad pattern
/// rejects the rule instead of failing every evaluation.
pub fn create_regexp_matcher(rule: &FingerPrintRule, registry: &MethodRegistry) -> Result<Matcher> {
    let MatchParam::Regexp {
        field,
        pattern,
        groups,
    } = &rule.param
    else {
        return Err(unexpected(MatchMethod::Regexp, rule));
    };
    let field = field.clone();
    let regex = registry.regex_cache().get_regex(pattern)?;
    let groups = (*groups).filter(|g| !g.is_empty());

    Ok(Arc::new(move |extractor: &dyn FieldExtractor| {
        let subject = extractor.extract(&field)?;
        Ok(regex_verdict(&regex, &subject, groups.as_ref()))
    }))
}

/// Compare the response checksum against a hex digest.
pub fn create_md5_matcher(rule: &FingerPrintRule, _registry: &MethodRegistry) -> Result<Matcher> {
    let MatchParam::Md5 { md5 } = &rule.param else {
        return Err(unexpected(MatchMethod::Md5, rule));
    };
    if md5.is_empty() {
        return Err(FingerprintError::Compilation(
            "md5 rule without a digest".to_string(),
        ));
    }
    let digest = md5.clone();

    Ok(Arc::new(move |extractor: &dyn FieldExtractor| {
        let checksum = extractor.extract(&Field::Md5)?;
        Ok(Verdict::new(compare_text(CompareOp::Equal, &checksum, &digest)))
    }))
}

/// Evaluate the nested rule against every value of one header. The nested
/// rule must be an `exp` or `regexp` leaf; its own field is ignored.
pub fn create_http_header_matcher(
    rule: &FingerPrintRule,
    registry: &MethodRegistry,
) -> Result<Matcher> {
    let MatchParam::HttpHeader {
        header_key,
        header_match_rule,
    } = &rule.param
    else {
        return Err(unexpected(MatchMethod::HttpHeader, rule));
    };
    if header_key.is_empty() {
        return Err(FingerprintError::Compilation(
            "http_header rule without a header key".to_string(),
        ));
    }
    match header_match_rule.method() {
        MatchMethod::Exp | MatchMethod::Regexp => {}
        other => {
            return Err(FingerprintError::Compilation(format!(
                "http_header '{header_key}' must match with exp or regexp, not {other}"
            )))
        }
    }
    let field = Field::HeaderItem(header_key.clone());
    let nested = registry.build(header_match_rule)?;

    Ok(Arc::new(move |extractor: &dyn FieldExtractor| {
        let values = extractor.extract(&field)?;
        nested(&ScopedValue(values))
    }))
}

/// Combine children with `and`/`or`.
///
/// The reported verdict is always the one that decided the group: the first
/// negative child of an `and`, the first positive child of an `or`, or the
/// last child when none decided early. Without short-circuiting the remaining
/// children still run, so their extraction errors surface.
pub fn create_complex_matcher(
    rule: &FingerPrintRule,
    registry: &MethodRegistry,
) -> Result<Matcher> {
    let MatchParam::Complex {
        condition,
        sub_rules,
    } = &rule.param
    else {
        return Err(unexpected(MatchMethod::Complex, rule));
    };
    if sub_rules.len() < 2 {
        return Err(FingerprintError::Compilation(format!(
            "complex node needs at least two children, found {}",
            sub_rules.len()
        )));
    }

    let children = sub_rules
        .iter()
        .map(|sub_rule| registry.build(sub_rule))
        .collect::<Result<Vec<_>>>()?;
    // The child value that settles the whole group.
    let decisive = *condition == Condition::Or;
    let short_circuit = registry.short_circuit();

    Ok(Arc::new(move |extractor: &dyn FieldExtractor| {
        let mut decided: Option<Verdict> = None;
        let mut last = Verdict::no_match();
        for child in &children {
            let verdict = child(extractor)?;
            if decided.is_some() {
                continue;
            }
            if verdict.matched == decisive {
                decided = Some(verdict);
                if short_circuit {
                    break;
                }
            } else {
                last = verdict;
            }
        }
        Ok(decided.unwrap_or(last))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::context::FieldValue;
    use crate::rule::{CaptureGroups, Cpe, FingerprintInfo};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Fields {
        values: HashMap<Field, FieldValue>,
        calls: AtomicUsize,
    }

    impl Fields {
        fn with(mut self, field: Field, value: FieldValue) -> Self {
            self.values.insert(field, value);
            self
        }
    }

    impl FieldExtractor for Fields {
        fn extract(&self, field: &Field) -> Result<FieldValue> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.values
                .get(field)
                .cloned()
                .ok_or_else(|| FingerprintError::UnknownField(field.to_string()))
        }
    }

    #[test]
    fn test_exp_matcher() {
        let registry = MethodRegistry::new();
        let fields = Fields::default().with(Field::Title, "Welcome to nginx".into());

        let contains = create_exp_matcher(&FingerPrintRule::contains(Field::Title, "nginx"), &registry)
            .unwrap();
        assert!(contains(&fields).unwrap().matched);

        let not_equal = create_exp_matcher(
            &FingerPrintRule::exp(Field::Title, CompareOp::NotEqual, "nginx"),
            &registry,
        )
        .unwrap();
        assert!(not_equal(&fields).unwrap().matched);
    }

    #[test]
    fn test_factory_rejects_wrong_method() {
        let registry = MethodRegistry::new();
        let err = create_exp_matcher(&FingerPrintRule::md5("abc"), &registry).err().unwrap();
        assert!(err.to_string().contains("exp matcher cannot build a md5 rule"));
    }

    #[test]
    fn test_regexp_matcher_rejects_bad_pattern() {
        let registry = MethodRegistry::new();
        let result = create_regexp_matcher(&FingerPrintRule::regexp(Field::Body, "a(b"), &registry);
        assert!(matches!(result, Err(FingerprintError::InvalidRegex(_))));
    }

    #[test]
    fn test_regexp_matcher_captures() {
        let registry = MethodRegistry::new();
        let groups = CaptureGroups {
            version: 1,
            ..CaptureGroups::default()
        };
        let rule = FingerPrintRule::regexp_with_groups(Field::Server, r"nginx/([\d.]+)", groups);
        let matcher = create_regexp_matcher(&rule, &registry).unwrap();
        let fields = Fields::default().with(Field::Server, "nginx/1.18.0".into());

        let verdict = matcher(&fields).unwrap();
        assert_eq!(verdict.info.unwrap().cpe.version, "1.18.0");
    }

    #[test]
    fn test_http_header_matcher_any_value() {
        let registry = MethodRegistry::new();
        let rule = FingerPrintRule::http_header(
            "X-Powered-By",
            FingerPrintRule::contains(Field::Banner, "Plesk"),
        );
        let matcher = create_http_header_matcher(&rule, &registry).unwrap();
        let fields = Fields::default().with(
            Field::HeaderItem("X-Powered-By".to_string()),
            FieldValue::Many(vec!["PHP/7.4".to_string(), "PleskLin".to_string()]),
        );
        assert!(matcher(&fields).unwrap().matched);
    }

    #[test]
    fn test_http_header_matcher_rejects_composite() {
        let registry = MethodRegistry::new();
        let rule = FingerPrintRule::http_header("Server", FingerPrintRule::md5("abc"));
        assert!(create_http_header_matcher(&rule, &registry).is_err());
    }

    #[test]
    fn test_md5_matcher() {
        let registry = MethodRegistry::new();
        let rule = FingerPrintRule::md5("5d41402abc4b2a76b9719d911017c592");
        let matcher = create_md5_matcher(&rule, &registry).unwrap();
        let fields = Fields::default().with(Field::Md5, "5d41402abc4b2a76b9719d911017c592".into());
        assert!(matcher(&fields).unwrap().matched);
    }

    #[test]
    fn test_complex_reports_deciding_child() {
        let registry = MethodRegistry::new();
        let exe = FingerprintInfo::with_cpe(Cpe::product("exe"));
        let aexe = FingerprintInfo::with_cpe(Cpe::product("aexe"));
        let rule = FingerPrintRule::or(vec![
            FingerPrintRule::contains(Field::Body, ".exe").with_info(exe),
            FingerPrintRule::contains(Field::Body, ".aexe").with_info(aexe),
        ]);
        let matcher = create_complex_matcher(&rule, &registry).unwrap();
        let fields = Fields::default().with(Field::Body, "setup.aexe".into());

        // ".exe" does not occur in "setup.aexe"; the second child decides.
        let verdict = matcher(&fields).unwrap();
        assert_eq!(verdict.info.unwrap().cpe.product, "aexe");
    }

    #[test]
    fn test_complex_evaluates_all_children_by_default() {
        let registry = MethodRegistry::new();
        let rule = FingerPrintRule::or(vec![
            FingerPrintRule::contains(Field::Body, "a"),
            FingerPrintRule::contains(Field::Body, "b"),
            FingerPrintRule::contains(Field::Body, "c"),
        ]);
        let fields = Fields::default().with(Field::Body, "a".into());

        let matcher = create_complex_matcher(&rule, &registry).unwrap();
        assert!(matcher(&fields).unwrap().matched);
        assert_eq!(fields.calls.load(Ordering::Relaxed), 3);

        let eager = MethodRegistry::new().with_short_circuit(true);
        let fields = Fields::default().with(Field::Body, "a".into());
        let matcher = create_complex_matcher(&rule, &eager).unwrap();
        assert!(matcher(&fields).unwrap().matched);
        assert_eq!(fields.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_complex_and_verdict() {
        let registry = MethodRegistry::new();
        let rule = FingerPrintRule::and(vec![
            FingerPrintRule::contains(Field::Body, "a"),
            FingerPrintRule::contains(Field::Body, "b"),
        ]);
        let matcher = create_complex_matcher(&rule, &registry).unwrap();
        assert!(matcher(&Fields::default().with(Field::Body, "ab".into())).unwrap().matched);
        assert!(!matcher(&Fields::default().with(Field::Body, "a".into())).unwrap().matched);
    }

    #[test]
    fn test_complex_rejects_single_child() {
        let registry = MethodRegistry::new();
        let rule = FingerPrintRule::and(vec![FingerPrintRule::contains(Field::Body, "a")]);
        assert!(matches!(
            create_complex_matcher(&rule, &registry),
            Err(FingerprintError::Compilation(_))
        ));
    }
}
