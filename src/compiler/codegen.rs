//! Bytecode generation from Rule Trees.
//!
//! Lowering is a single recursive walk. A `complex` node emits its children
//! in order with an `and`/`or` after every child but the last; all of those
//! jumps land on the instruction right after the group. Nested nodes that
//! carry their own info get an attaching `info` after their code, and the
//! root's info goes on the trailing finishing `info`.

use crate::error::{FingerprintError, Result};
use crate::ir::OpCode;
use crate::rule::{CompareOp, Condition, Field, FingerPrintRule, Literal, MatchMethod, MatchParam};

/// Generate the full instruction sequence for a rule, including the
/// trailing finishing `info`.
pub(crate) fn generate_bytecode(rule: &FingerPrintRule) -> Result<Vec<OpCode>> {
    let mut opcodes = Vec::new();
    generate_node(rule, None, &mut opcodes)?;
    opcodes.push(OpCode::finish(rule.info.clone()));
    Ok(opcodes)
}

fn generate_nested(
    rule: &FingerPrintRule,
    field_override: Option<&Field>,
    opcodes: &mut Vec<OpCode>,
) -> Result<()> {
    generate_node(rule, field_override, opcodes)?;
    if let Some(info) = &rule.info {
        opcodes.push(OpCode::attach(info.clone()));
    }
    Ok(())
}

fn generate_node(
    rule: &FingerPrintRule,
    field_override: Option<&Field>,
    opcodes: &mut Vec<OpCode>,
) -> Result<()> {
    match &rule.param {
        MatchParam::Exp { field, op, value } => {
            push_field(field_override.unwrap_or(field), opcodes);
            opcodes.push(OpCode::Push(value.clone()));
            match op {
                CompareOp::Contains => opcodes.push(OpCode::Contains),
                CompareOp::Equal => opcodes.push(OpCode::Equal),
                CompareOp::NotEqual => {
                    opcodes.push(OpCode::Equal);
                    opcodes.push(OpCode::Not);
                }
            }
        }
        MatchParam::Regexp {
            field,
            pattern,
            groups,
        } => {
            push_field(field_override.unwrap_or(field), opcodes);
            opcodes.push(OpCode::Push(Literal::Str(pattern.clone())));
            opcodes.push(OpCode::RegexpMatch((*groups).filter(|g| !g.is_empty())));
        }
        MatchParam::Md5 { md5 } => {
            if md5.is_empty() {
                return Err(FingerprintError::Compilation(
                    "md5 rule without a digest".to_string(),
                ));
            }
            opcodes.push(OpCode::ExtractData(Field::Md5));
            opcodes.push(OpCode::Push(Literal::Str(md5.clone())));
            opcodes.push(OpCode::Equal);
        }
        MatchParam::HttpHeader {
            header_key,
            header_match_rule,
        } => {
            if field_override.is_some() {
                return Err(FingerprintError::Compilation(
                    "http_header rules cannot be nested inside http_header".to_string(),
                ));
            }
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
            generate_nested(header_match_rule, Some(&field), opcodes)?;
        }
        MatchParam::Complex {
            condition,
            sub_rules,
        } => {
            if sub_rules.len() < 2 {
                return Err(FingerprintError::Compilation(format!(
                    "complex node needs at least two children, found {}",
                    sub_rules.len()
                )));
            }

            let mut jumps = Vec::with_capacity(sub_rules.len() - 1);
            for (idx, sub_rule) in sub_rules.iter().enumerate() {
                generate_nested(sub_rule, field_override, opcodes)?;
                if idx + 1 < sub_rules.len() {
                    jumps.push(opcodes.len());
                    opcodes.push(jump(*condition, 0));
                }
            }

            let end = opcodes.len();
            for at in jumps {
                opcodes[at] = jump(*condition, end - at);
            }
        }
    }
    Ok(())
}

fn jump(condition: Condition, offset: usize) -> OpCode {
    match condition {
        Condition::And => OpCode::And(offset),
        Condition::Or => OpCode::Or(offset),
    }
}

fn push_field(field: &Field, opcodes: &mut Vec<OpCode>) {
    match field {
        Field::Banner => opcodes.push(OpCode::Data),
        other => opcodes.push(OpCode::ExtractData(other.clone())),
    }
}
