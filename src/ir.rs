//! Intermediate Representation (IR) for fingerprint bytecode.
//!
//! A [`Program`] is a flat instruction sequence for a stack machine. Values
//! on the stack are either text (field contents, literals) or verdicts
//! produced by comparisons. `and`/`or` carry a relative forward offset used
//! when they short-circuit, so control flow is bounded by program length.

use crate::error::{FingerprintError, Result};
use crate::rule::{CaptureGroups, Field, FingerprintInfo, Literal};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Bytecode instructions for the stack-based virtual machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpCode {
    /// With `finish`, the single trailing instruction: turns the final
    /// verdict into the match result. Without it, attaches a nested node's
    /// info to the verdict on top of the stack.
    Info {
        info: Option<Arc<FingerprintInfo>>,
        finish: bool,
    },
    /// Push the whole raw response.
    Data,
    ExtractData(Field),
    Push(Literal),
    /// Short-circuit when the verdict on top is true.
    Or(usize),
    /// Short-circuit when the verdict on top is false.
    And(usize),
    Not,
    Equal,
    Contains,
    RegexpMatch(Option<CaptureGroups>),
}

impl OpCode {
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::Info { .. } => "info",
            OpCode::Data => "data",
            OpCode::ExtractData(_) => "extract_data",
            OpCode::Push(_) => "push",
            OpCode::Or(_) => "or",
            OpCode::And(_) => "and",
            OpCode::Not => "not",
            OpCode::Equal => "equal",
            OpCode::Contains => "contains",
            OpCode::RegexpMatch(_) => "regexp_match",
        }
    }

    pub fn finish(info: Option<FingerprintInfo>) -> Self {
        OpCode::Info {
            info: info.map(Arc::new),
            finish: true,
        }
    }

    pub fn attach(info: FingerprintInfo) -> Self {
        OpCode::Info {
            info: Some(Arc::new(info)),
            finish: false,
        }
    }

    pub fn jump_offset(&self) -> Option<usize> {
        match self {
            OpCode::And(offset) | OpCode::Or(offset) => Some(*offset),
            _ => None,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            OpCode::Info { info, finish } => {
                if !finish {
                    f.write_str(" attach")?;
                }
                if let Some(info) = info {
                    write!(f, " {}", info.cpe)?;
                }
                Ok(())
            }
            OpCode::ExtractData(field) => write!(f, " {field}"),
            OpCode::Push(literal) => write!(f, " {literal}"),
            OpCode::Or(offset) | OpCode::And(offset) => write!(f, " +{offset}"),
            OpCode::RegexpMatch(Some(groups)) => write!(f, " {}", groups.template()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Text,
    Verdict,
}

/// A verified, immutable bytecode program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    opcodes: Vec<OpCode>,
    max_stack_depth: usize,
}

impl Program {
    /// Build a program, rejecting any instruction sequence the executor
    /// could not run to a well-formed final stack.
    pub fn new(opcodes: Vec<OpCode>) -> Result<Self> {
        let max_stack_depth = verify(&opcodes)?;
        Ok(Self {
            opcodes,
            max_stack_depth,
        })
    }

    /// Build a program without running the verifier. The executor still
    /// checks every stack operation, so a malformed program fails with an
    /// error rather than a crash.
    pub fn new_unverified(opcodes: Vec<OpCode>) -> Self {
        let max_stack_depth = opcodes.len();
        Self {
            opcodes,
            max_stack_depth,
        }
    }

    pub fn opcodes(&self) -> &[OpCode] {
        &self.opcodes
    }

    pub fn len(&self) -> usize {
        self.opcodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opcodes.is_empty()
    }

    /// Upper bound on the operand stack size during execution.
    pub fn max_stack_depth(&self) -> usize {
        self.max_stack_depth
    }

    /// Info carried by the trailing instruction.
    pub fn default_info(&self) -> Option<&FingerprintInfo> {
        match self.opcodes.last() {
            Some(OpCode::Info {
                info: Some(info),
                finish: true,
            }) => Some(info),
            _ => None,
        }
    }

    pub fn verify(&self) -> Result<()> {
        verify(&self.opcodes).map(|_| ())
    }
}

/// Disassembly listing, one instruction per line.
impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, opcode) in self.opcodes.iter().enumerate() {
            match opcode.jump_offset() {
                Some(offset) => writeln!(f, "{idx:04} {opcode} (-> {:04})", idx + offset)?,
                None => writeln!(f, "{idx:04} {opcode}")?,
            }
        }
        Ok(())
    }
}

fn invalid(idx: usize, message: impl fmt::Display) -> FingerprintError {
    FingerprintError::InvalidBytecode(format!("at {idx}: {message}"))
}

fn pop_slot(stack: &mut Vec<Slot>, expected: Slot, idx: usize, opcode: &OpCode) -> Result<()> {
    match stack.pop() {
        Some(slot) if slot == expected => Ok(()),
        Some(slot) => Err(invalid(
            idx,
            format!("{} expects {expected:?} on the stack, found {slot:?}", opcode.name()),
        )),
        None => Err(invalid(idx, format!("{} underflows the stack", opcode.name()))),
    }
}

/// Simulate the typed stack along every path and return the maximum depth.
///
/// Checks that every instruction finds the operands it needs, that each jump
/// lands inside the program on a state identical to the fall-through state,
/// that jumps never leave their enclosing group, and that the program ends
/// with exactly one finishing `info` over a single verdict.
fn verify(opcodes: &[OpCode]) -> Result<usize> {
    let last = opcodes
        .len()
        .checked_sub(1)
        .ok_or_else(|| FingerprintError::InvalidBytecode("empty program".to_string()))?;
    if !matches!(opcodes[last], OpCode::Info { finish: true, .. }) {
        return Err(invalid(last, "program must end with a finishing info"));
    }

    let mut stack: Vec<Slot> = Vec::new();
    let mut max_depth = 0;
    let mut arrivals: BTreeMap<usize, Vec<Slot>> = BTreeMap::new();
    let mut open_groups: Vec<usize> = Vec::new();

    for (idx, opcode) in opcodes.iter().enumerate() {
        if let Some(expected) = arrivals.remove(&idx) {
            if expected != stack {
                return Err(invalid(idx, "jump lands on a different stack shape"));
            }
        }
        while open_groups.last().is_some_and(|&end| end <= idx) {
            open_groups.pop();
        }

        match opcode {
            OpCode::Data | OpCode::ExtractData(_) | OpCode::Push(_) => stack.push(Slot::Text),
            OpCode::Equal | OpCode::Contains | OpCode::RegexpMatch(_) => {
                pop_slot(&mut stack, Slot::Text, idx, opcode)?;
                pop_slot(&mut stack, Slot::Text, idx, opcode)?;
                stack.push(Slot::Verdict);
            }
            OpCode::Not => {
                pop_slot(&mut stack, Slot::Verdict, idx, opcode)?;
                stack.push(Slot::Verdict);
            }
            OpCode::And(offset) | OpCode::Or(offset) => {
                pop_slot(&mut stack, Slot::Verdict, idx, opcode)?;
                if *offset < 2 {
                    return Err(invalid(idx, format!("jump offset {offset} skips nothing")));
                }
                let target = idx
                    .checked_add(*offset)
                    .filter(|&target| target <= last)
                    .ok_or_else(|| invalid(idx, format!("jump offset {offset} leaves the program")))?;
                if let Some(&end) = open_groups.last() {
                    if target > end {
                        return Err(invalid(
                            idx,
                            format!("jump to {target} escapes the group ending at {end}"),
                        ));
                    }
                }
                open_groups.push(target);

                let mut landing = stack.clone();
                landing.push(Slot::Verdict);
                match arrivals.entry(target) {
                    Entry::Occupied(entry) => {
                        if entry.get() != &landing {
                            return Err(invalid(idx, "jumps to one target disagree on the stack"));
                        }
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(landing);
                    }
                }
            }
            OpCode::Info {
                info,
                finish: false,
            } => {
                if info.is_none() {
                    return Err(invalid(idx, "attaching info without a payload"));
                }
                pop_slot(&mut stack, Slot::Verdict, idx, opcode)?;
                stack.push(Slot::Verdict);
            }
            OpCode::Info { finish: true, .. } => {
                if idx != last {
                    return Err(invalid(idx, "finishing info before the end of the program"));
                }
                pop_slot(&mut stack, Slot::Verdict, idx, opcode)?;
                if !stack.is_empty() {
                    return Err(invalid(
                        idx,
                        format!("{} values left under the final verdict", stack.len()),
                    ));
                }
            }
        }
        max_depth = max_depth.max(stack.len());
    }

    Ok(max_depth)
}
