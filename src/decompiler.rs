//! Bytecode decompiler.
//!
//! Walks a program front to back with a mirror of the executor's stack,
//! rebuilding leaves from `push`/`extract_data` operands and groups from the
//! `and`/`or` jumps. All jumps of one group land on the same instruction, so
//! a group is closed when the walk reaches its landing point.
//!
//! The result is canonical: the same condition decompiles to the same tree
//! and text however it was authored. The tree, together with the info
//! attached to its nodes, is the deduplication key.

use crate::error::{FingerprintError, Result};
use crate::ir::{OpCode, Program};
use crate::rule::{
    CompareOp, Condition, Cpe, Field, FingerPrintRule, FingerprintInfo, Literal, MatchParam,
};
use tracing::trace;

/// Canonical form of a compiled rule.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneralRule {
    /// Reconstructed Rule Tree, root info included.
    pub rule: FingerPrintRule,
    /// Canonical textual expression of `rule`.
    pub expression: String,
    /// The root info's CPE.
    pub cpe: Cpe,
    /// One CPE template per capturing regexp, in program order, with `$n`
    /// placeholders for the components taken from submatches.
    pub captures: Vec<Cpe>,
}

impl GeneralRule {
    /// Key under which two equivalent rules collide: the whole canonical
    /// tree, with the info of every node and the capture groups of every
    /// regexp.
    pub fn dedup_key(&self) -> &FingerPrintRule {
        &self.rule
    }
}

enum Item {
    Field(Field),
    Literal(Literal),
    Node(FingerPrintRule),
}

impl Item {
    fn kind(&self) -> &'static str {
        match self {
            Item::Field(_) => "field",
            Item::Literal(_) => "literal",
            Item::Node(_) => "condition",
        }
    }
}

/// A group whose jumps have been seen but whose landing point has not.
struct OpenGroup {
    condition: Condition,
    end: usize,
    operands: Vec<FingerPrintRule>,
}

#[derive(Default)]
struct Walk {
    stack: Vec<Item>,
    groups: Vec<OpenGroup>,
    captures: Vec<Cpe>,
    root: Option<FingerPrintRule>,
}

impl Walk {
    fn pop(&mut self) -> Result<Item> {
        self.stack.pop().ok_or(FingerprintError::StackUnderflow)
    }

    fn pop_node(&mut self, ip: usize) -> Result<FingerPrintRule> {
        match self.pop()? {
            Item::Node(node) => Ok(node),
            other => Err(unexpected(ip, "condition", &other)),
        }
    }

    fn pop_literal(&mut self, ip: usize) -> Result<Literal> {
        match self.pop()? {
            Item::Literal(literal) => Ok(literal),
            other => Err(unexpected(ip, "literal", &other)),
        }
    }

    fn pop_field(&mut self, ip: usize) -> Result<Field> {
        match self.pop()? {
            Item::Field(field) => Ok(field),
            other => Err(unexpected(ip, "field", &other)),
        }
    }

    /// Close every group whose jumps land on `ip`, innermost first.
    fn close_groups(&mut self, ip: usize) -> Result<()> {
        while self.groups.last().map_or(false, |group| group.end == ip) {
            let last = self.pop_node(ip)?;
            if let Some(mut group) = self.groups.pop() {
                group.operands.push(last);
                self.stack
                    .push(Item::Node(FingerPrintRule::complex(group.condition, group.operands)));
            }
        }
        Ok(())
    }

    fn comparison(&mut self, ip: usize, op: CompareOp) -> Result<()> {
        let value = self.pop_literal(ip)?;
        let field = self.pop_field(ip)?;
        let is_digest = op == CompareOp::Equal
            && field == Field::Md5
            && matches!(&value, Literal::Str(digest) if *digest == digest.to_ascii_lowercase());
        let node = if is_digest {
            FingerPrintRule::md5(value.as_text().into_owned())
        } else {
            FingerPrintRule::exp(field, op, value)
        };
        self.stack.push(Item::Node(node));
        Ok(())
    }

    fn step(&mut self, ip: usize, opcode: &OpCode, len: usize) -> Result<()> {
        match opcode {
            OpCode::Data => self.stack.push(Item::Field(Field::Banner)),
            OpCode::ExtractData(field) => self.stack.push(Item::Field(field.clone())),
            OpCode::Push(literal) => self.stack.push(Item::Literal(literal.clone())),
            OpCode::Equal => self.comparison(ip, CompareOp::Equal)?,
            OpCode::Contains => self.comparison(ip, CompareOp::Contains)?,
            OpCode::RegexpMatch(groups) => {
                let pattern = self.pop_literal(ip)?.as_text().into_owned();
                let field = self.pop_field(ip)?;
                let node = match groups {
                    Some(groups) => {
                        self.captures.push(groups.template());
                        FingerPrintRule::regexp_with_groups(field, pattern, *groups)
                    }
                    None => FingerPrintRule::regexp(field, pattern),
                };
                self.stack.push(Item::Node(node));
            }
            OpCode::Not => {
                let node = self.pop_node(ip)?;
                let negated = match node.param {
                    MatchParam::Exp {
                        field,
                        op: CompareOp::Equal,
                        value,
                    } => FingerPrintRule {
                        param: MatchParam::Exp {
                            field,
                            op: CompareOp::NotEqual,
                            value,
                        },
                        info: node.info,
                    },
                    MatchParam::Md5 { md5 } => FingerPrintRule {
                        param: MatchParam::Exp {
                            field: Field::Md5,
                            op: CompareOp::NotEqual,
                            value: Literal::Str(md5),
                        },
                        info: node.info,
                    },
                    _ => {
                        return Err(FingerprintError::Decompilation(format!(
                            "at {ip}: not only follows an equality comparison"
                        )))
                    }
                };
                self.stack.push(Item::Node(negated));
            }
            OpCode::And(offset) | OpCode::Or(offset) => {
                let condition = match opcode {
                    OpCode::And(_) => Condition::And,
                    _ => Condition::Or,
                };
                let end = ip
                    .checked_add(*offset)
                    .filter(|&end| *offset >= 2 && end < len)
                    .ok_or_else(|| {
                        FingerprintError::Decompilation(format!(
                            "at {ip}: jump offset {offset} out of range"
                        ))
                    })?;
                let operand = self.pop_node(ip)?;
                match self.groups.last_mut() {
                    Some(group) if group.end == end && group.condition == condition => {
                        group.operands.push(operand);
                    }
                    Some(group) if end > group.end => {
                        return Err(FingerprintError::Decompilation(format!(
                            "at {ip}: jump to {end} escapes the group ending at {}",
                            group.end
                        )))
                    }
                    _ => self.groups.push(OpenGroup {
                        condition,
                        end,
                        operands: vec![operand],
                    }),
                }
            }
            OpCode::Info {
                info,
                finish: false,
            } => {
                let info = info.as_deref().ok_or_else(|| {
                    FingerprintError::Decompilation(format!("at {ip}: attaching info without payload"))
                })?;
                let mut node = self.pop_node(ip)?;
                attach_info(&mut node, info);
                self.stack.push(Item::Node(node));
            }
            OpCode::Info { info, finish: true } => {
                if !self.groups.is_empty() {
                    return Err(FingerprintError::Decompilation(format!(
                        "at {ip}: {} group(s) still open at the finishing info",
                        self.groups.len()
                    )));
                }
                let mut node = self.pop_node(ip)?;
                if let Some(item) = self.stack.last() {
                    return Err(FingerprintError::Decompilation(format!(
                        "at {ip}: {} left on the stack after the finishing info",
                        item.kind()
                    )));
                }
                if let Some(info) = info {
                    attach_info(&mut node, info);
                }
                self.root = Some(node);
            }
        }
        Ok(())
    }
}

fn unexpected(ip: usize, expected: &str, found: &Item) -> FingerprintError {
    FingerprintError::Decompilation(format!(
        "at {ip}: expected {expected} on the stack, found {}",
        found.kind()
    ))
}

/// Outer info is the template, anything the node already carries wins.
fn attach_info(node: &mut FingerPrintRule, info: &FingerprintInfo) {
    let mut merged = info.clone();
    if let Some(existing) = node.info.take() {
        merged.overlay(&existing);
    }
    node.info = Some(merged);
}

/// Turns bytecode back into Rule Trees and canonical expressions.
///
/// # Example
/// ```rust
/// use fingerprint_engine::{Compiler, Decompiler};
///
/// let program = Compiler::new().compile_expression(r#"body="a" and (title="b" or title="c")"#)?;
/// let general = Decompiler::new().decompile(&program)?;
/// assert_eq!(general.expression, r#"body = "a" && (title = "b" || title = "c")"#);
/// # Ok::<(), fingerprint_engine::FingerprintError>(())
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Decompiler;

impl Decompiler {
    pub fn new() -> Self {
        Self
    }

    pub fn decompile(&self, program: &Program) -> Result<GeneralRule> {
        self.decompile_opcodes(program.opcodes())
    }

    /// Decompile a raw instruction sequence, which need not have passed the
    /// verifier.
    ///
    /// # Errors
    /// * `StackUnderflow` when an instruction lacks operands
    /// * `Decompilation` for any shape the compiler never emits (operands of
    ///   the wrong kind, stray or improperly nested jumps, a missing or
    ///   non-trailing finishing info, leftovers on the stack)
    pub fn decompile_opcodes(&self, opcodes: &[OpCode]) -> Result<GeneralRule> {
        let mut walk = Walk::default();
        for (ip, opcode) in opcodes.iter().enumerate() {
            if walk.root.is_some() {
                return Err(FingerprintError::Decompilation(format!(
                    "at {ip}: instruction after the finishing info"
                )));
            }
            walk.close_groups(ip)?;
            walk.step(ip, opcode, opcodes.len())?;
        }

        let rule = walk.root.ok_or_else(|| {
            FingerprintError::Decompilation("program has no finishing info".to_string())
        })?;
        let cpe = rule
            .info
            .as_ref()
            .map(|info| info.cpe.clone())
            .unwrap_or_default();
        let expression = rule.to_string();
        trace!("decompiled {} opcodes into {}", opcodes.len(), expression);

        Ok(GeneralRule {
            rule,
            expression,
            cpe,
            captures: walk.captures,
        })
    }
}
