//! Stack-based virtual machine for executing fingerprint bytecode.
//!
//! The machine walks the instruction array once, front to back. Field
//! contents are pulled from a [`FieldExtractor`] only when an instruction
//! asks for them, so a short-circuited operand never touches the response.
//! All mutable state lives in a per-call operand stack; one `Vm` can serve
//! any number of threads.

use crate::config::EngineConfig;
use crate::error::{FingerprintError, Result};
use crate::ir::{OpCode, Program};
use crate::matcher::cache::RegexCache;
use crate::matcher::context::{FieldExtractor, FieldValue};
use crate::matcher::types::{compare_text, finish_verdict, regex_verdict, Verdict};
use crate::rule::{CompareOp, Field, FingerprintInfo};
use std::sync::Arc;

/// Default operand stack limit.
pub const DEFAULT_MAX_STACK_DEPTH: usize = 64;

#[derive(Debug)]
enum StackValue {
    Text(FieldValue),
    Verdict(Verdict),
    Matched(FingerprintInfo),
}

impl StackValue {
    fn kind(&self) -> &'static str {
        match self {
            StackValue::Text(_) => "text",
            StackValue::Verdict(_) => "verdict",
            StackValue::Matched(_) => "match result",
        }
    }
}

/// Operand stack for a single execution.
struct Frame {
    stack: Vec<StackValue>,
    limit: usize,
}

impl Frame {
    fn new(capacity: usize, limit: usize) -> Self {
        Self {
            stack: Vec::with_capacity(capacity.min(limit)),
            limit,
        }
    }

    fn push(&mut self, value: StackValue) -> Result<()> {
        if self.stack.len() >= self.limit {
            return Err(FingerprintError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<StackValue> {
        self.stack.pop().ok_or(FingerprintError::StackUnderflow)
    }

    fn pop_text(&mut self, ip: usize) -> Result<FieldValue> {
        match self.pop()? {
            StackValue::Text(value) => Ok(value),
            other => Err(type_mismatch(ip, "text", &other)),
        }
    }

    /// Pop a literal operand. Literals are always single values.
    fn pop_needle(&mut self, ip: usize) -> Result<String> {
        match self.pop_text(ip)? {
            FieldValue::Single(needle) => Ok(needle),
            FieldValue::Many(_) => Err(FingerprintError::InvalidBytecode(format!(
                "at {ip}: comparison operand must be a single value"
            ))),
        }
    }

    fn pop_verdict(&mut self, ip: usize) -> Result<Verdict> {
        match self.pop()? {
            StackValue::Verdict(verdict) => Ok(verdict),
            other => Err(type_mismatch(ip, "verdict", &other)),
        }
    }
}

fn type_mismatch(ip: usize, expected: &str, found: &StackValue) -> FingerprintError {
    FingerprintError::InvalidBytecode(format!(
        "at {ip}: expected {expected} on the stack, found {}",
        found.kind()
    ))
}

/// Stack-based virtual machine for executing fingerprint bytecode.
#[derive(Debug, Clone)]
pub struct Vm {
    regex_cache: Arc<RegexCache>,
    max_stack_depth: usize,
}

impl Vm {
    /// Create a virtual machine with its own regex cache.
    pub fn new() -> Self {
        Self::with_cache(Arc::new(RegexCache::new()))
    }

    /// Create a virtual machine sharing an existing regex cache.
    pub fn with_cache(regex_cache: Arc<RegexCache>) -> Self {
        Self {
            regex_cache,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
        }
    }

    pub fn with_config(config: &EngineConfig) -> Self {
        Self::with_cache(Arc::new(RegexCache::with_capacity(
            config.regex_cache_capacity,
        )))
        .with_max_stack_depth(config.max_stack_depth)
    }

    pub fn with_max_stack_depth(mut self, max_stack_depth: usize) -> Self {
        self.max_stack_depth = max_stack_depth;
        self
    }

    pub fn regex_cache(&self) -> &Arc<RegexCache> {
        &self.regex_cache
    }

    pub fn max_stack_depth(&self) -> usize {
        self.max_stack_depth
    }

    /// Execute a program against one response.
    ///
    /// # Returns
    /// * `Ok(Some(info))` if the rule matched
    /// * `Ok(None)` if the rule did not match
    ///
    /// # Errors
    /// Returns an error if:
    /// * The extractor fails (unknown field, missing data)
    /// * A pattern does not compile
    /// * The program is malformed (stack underflow/overflow, wrong operand
    ///   types, bad jump, final stack with more than one item)
    pub fn execute(
        &self,
        program: &Program,
        extractor: &dyn FieldExtractor,
    ) -> Result<Option<FingerprintInfo>> {
        let opcodes = program.opcodes();
        let mut frame = Frame::new(program.max_stack_depth(), self.max_stack_depth);
        let mut ip = 0;

        while ip < opcodes.len() {
            match &opcodes[ip] {
                OpCode::Data => {
                    let value = extractor.extract(&Field::Banner)?;
                    frame.push(StackValue::Text(value))?;
                }
                OpCode::ExtractData(field) => {
                    let value = extractor.extract(field)?;
                    frame.push(StackValue::Text(value))?;
                }
                OpCode::Push(literal) => {
                    let value = FieldValue::Single(literal.as_text().into_owned());
                    frame.push(StackValue::Text(value))?;
                }
                OpCode::Equal => {
                    let needle = frame.pop_needle(ip)?;
                    let subject = frame.pop_text(ip)?;
                    let verdict = Verdict::new(compare_text(CompareOp::Equal, &subject, &needle));
                    frame.push(StackValue::Verdict(verdict))?;
                }
                OpCode::Contains => {
                    let needle = frame.pop_needle(ip)?;
                    let subject = frame.pop_text(ip)?;
                    let verdict =
                        Verdict::new(compare_text(CompareOp::Contains, &subject, &needle));
                    frame.push(StackValue::Verdict(verdict))?;
                }
                OpCode::RegexpMatch(groups) => {
                    let pattern = frame.pop_needle(ip)?;
                    let subject = frame.pop_text(ip)?;
                    let regex = self.regex_cache.get_regex(&pattern)?;
                    let verdict = regex_verdict(&regex, &subject, groups.as_ref());
                    frame.push(StackValue::Verdict(verdict))?;
                }
                OpCode::Not => {
                    let verdict = frame.pop_verdict(ip)?;
                    frame.push(StackValue::Verdict(verdict.negate()))?;
                }
                OpCode::And(offset) | OpCode::Or(offset) => {
                    let verdict = frame.pop_verdict(ip)?;
                    let short_circuits = match &opcodes[ip] {
                        OpCode::And(_) => !verdict.matched,
                        _ => verdict.matched,
                    };
                    if short_circuits {
                        let target = ip
                            .checked_add(*offset)
                            .filter(|&target| target > ip && target < opcodes.len())
                            .ok_or_else(|| {
                                FingerprintError::InvalidBytecode(format!(
                                    "at {ip}: jump offset {offset} out of range"
                                ))
                            })?;
                        frame.push(StackValue::Verdict(verdict))?;
                        ip = target;
                        continue;
                    }
                }
                OpCode::Info {
                    info,
                    finish: false,
                } => {
                    let mut verdict = frame.pop_verdict(ip)?;
                    if let Some(info) = info {
                        verdict.attach(info);
                    }
                    frame.push(StackValue::Verdict(verdict))?;
                }
                OpCode::Info { info, finish: true } => {
                    let verdict = frame.pop_verdict(ip)?;
                    if let Some(result) = finish_verdict(&verdict, info.as_deref()) {
                        frame.push(StackValue::Matched(result))?;
                    }
                }
            }
            ip += 1;
        }

        let Frame { mut stack, .. } = frame;
        match (stack.pop(), stack.is_empty()) {
            (None, _) => Ok(None),
            (Some(StackValue::Matched(info)), true) => Ok(Some(info)),
            (Some(other), true) => Err(FingerprintError::InvalidBytecode(format!(
                "program ended with a {} instead of a match result",
                other.kind()
            ))),
            (Some(_), false) => Err(FingerprintError::InvalidBytecode(format!(
                "program ended with {} values on the stack",
                stack.len() + 1
            ))),
        }
    }

    /// Verdict only, discarding the match info.
    pub fn matches(&self, program: &Program, extractor: &dyn FieldExtractor) -> Result<bool> {
        self.execute(program, extractor).map(|info| info.is_some())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{CaptureGroups, Cpe, Literal};
    use std::collections::HashMap;

    struct MapExtractor(HashMap<Field, FieldValue>);

    impl MapExtractor {
        fn new(entries: &[(Field, &str)]) -> Self {
            Self(
                entries
                    .iter()
                    .map(|(field, value)| (field.clone(), FieldValue::from(*value)))
                    .collect(),
            )
        }
    }

    impl FieldExtractor for MapExtractor {
        fn extract(&self, field: &Field) -> Result<FieldValue> {
            self.0
                .get(field)
                .cloned()
                .ok_or_else(|| FingerprintError::UnknownField(field.to_string()))
        }
    }

    fn leaf(field: Field, op: OpCode, value: &str) -> Vec<OpCode> {
        vec![OpCode::ExtractData(field), OpCode::Push(Literal::from(value)), op]
    }

    fn program(mut opcodes: Vec<OpCode>, info: Option<FingerprintInfo>) -> Program {
        opcodes.push(OpCode::finish(info));
        Program::new(opcodes).unwrap()
    }

    #[test]
    fn test_contains_match() {
        let vm = Vm::new();
        let extractor = MapExtractor::new(&[(Field::Header, "Tag: --- VIDEO WEB SERVER ---")]);
        let program = program(leaf(Field::Header, OpCode::Contains, "VIDEO WEB SERVER"), None);

        let result = vm.execute(&program, &extractor).unwrap();
        assert_eq!(result, Some(FingerprintInfo::default()));
    }

    #[test]
    fn test_equal_no_match() {
        let vm = Vm::new();
        let extractor = MapExtractor::new(&[(Field::Title, "Welcome")]);
        let program = program(leaf(Field::Title, OpCode::Equal, "Welc"), None);

        assert_eq!(vm.execute(&program, &extractor).unwrap(), None);
    }

    #[test]
    fn test_default_info_on_match() {
        let vm = Vm::new();
        let extractor = MapExtractor::new(&[(Field::Server, "nginx/1.18.0")]);
        let info = FingerprintInfo::with_cpe(Cpe::product("nginx"));
        let program = program(leaf(Field::Server, OpCode::Contains, "nginx"), Some(info));

        let result = vm.execute(&program, &extractor).unwrap().unwrap();
        assert_eq!(result.cpe.product, "nginx");
        assert_eq!(result.product, "nginx");
    }

    #[test]
    fn test_and_short_circuit_skips_second_operand() {
        let vm = Vm::new();
        // Title is absent; extracting it would fail.
        let extractor = MapExtractor::new(&[(Field::Body, "hello")]);
        let mut opcodes = leaf(Field::Body, OpCode::Contains, "absent");
        opcodes.push(OpCode::And(4));
        opcodes.extend(leaf(Field::Title, OpCode::Contains, "x"));

        assert_eq!(vm.execute(&program(opcodes, None), &extractor).unwrap(), None);
    }

    #[test]
    fn test_or_short_circuit_skips_second_operand() {
        let vm = Vm::new();
        let extractor = MapExtractor::new(&[(Field::Body, "hello")]);
        let mut opcodes = leaf(Field::Body, OpCode::Contains, "hell");
        opcodes.push(OpCode::Or(4));
        opcodes.extend(leaf(Field::Title, OpCode::Contains, "x"));

        assert!(vm.matches(&program(opcodes, None), &extractor).unwrap());
    }

    #[test]
    fn test_extractor_error_propagates() {
        let vm = Vm::new();
        let extractor = MapExtractor::new(&[]);
        let program = program(leaf(Field::Custom("cert".to_string()), OpCode::Contains, "x"), None);

        let err = vm.execute(&program, &extractor).unwrap_err();
        assert_eq!(err, FingerprintError::UnknownField("cert".to_string()));
        assert!(!err.is_engine_bug());
    }

    #[test]
    fn test_regexp_capture_into_cpe() {
        let vm = Vm::new();
        let extractor = MapExtractor::new(&[(Field::Body, "<a href=/aexea>")]);
        let groups = CaptureGroups {
            product: 1,
            ..CaptureGroups::default()
        };
        let program = program(
            leaf(Field::Body, OpCode::RegexpMatch(Some(groups)), "a(e.e)a"),
            None,
        );

        let result = vm.execute(&program, &extractor).unwrap().unwrap();
        assert_eq!(result.cpe.product, "exe");
        assert_eq!(result.raw, "aexea");
        assert_eq!(vm.regex_cache().len(), 1);
    }

    #[test]
    fn test_invalid_regex_is_error() {
        let vm = Vm::new();
        let extractor = MapExtractor::new(&[(Field::Body, "x")]);
        let program = program(leaf(Field::Body, OpCode::RegexpMatch(None), "(x"), None);

        assert!(matches!(
            vm.execute(&program, &extractor),
            Err(FingerprintError::InvalidRegex(_))
        ));
    }

    #[test]
    fn test_not_inverts() {
        let vm = Vm::new();
        let extractor = MapExtractor::new(&[(Field::Server, "apache")]);
        let mut opcodes = leaf(Field::Server, OpCode::Equal, "nginx");
        opcodes.push(OpCode::Not);

        assert!(vm.matches(&program(opcodes, None), &extractor).unwrap());
    }

    #[test]
    fn test_data_reads_banner() {
        let vm = Vm::new();
        let extractor = MapExtractor::new(&[(Field::Banner, "SSH-2.0-OpenSSH_8.2p1")]);
        let opcodes = vec![
            OpCode::Data,
            OpCode::Push(Literal::from("OpenSSH")),
            OpCode::Contains,
        ];

        assert!(vm.matches(&program(opcodes, None), &extractor).unwrap());
    }

    #[test]
    fn test_attached_info_survives_or() {
        let vm = Vm::new();
        let extractor = MapExtractor::new(&[(Field::Body, "/AV732E/setup.exe")]);
        let exe = FingerprintInfo::with_cpe(Cpe::product("exe"));

        let mut opcodes = leaf(Field::Body, OpCode::RegexpMatch(None), r".*\.aexe");
        opcodes.push(OpCode::attach(exe.clone()));
        opcodes.push(OpCode::Or(5));
        opcodes.extend(leaf(Field::Body, OpCode::RegexpMatch(None), r".*\.exe"));
        opcodes.push(OpCode::attach(exe));

        let result = vm.execute(&program(opcodes, None), &extractor).unwrap().unwrap();
        assert_eq!(result.cpe.product, "exe");
        assert_eq!(result.raw, "/AV732E/setup.exe");
    }

    #[test]
    fn test_stack_overflow() {
        let vm = Vm::new().with_max_stack_depth(1);
        let extractor = MapExtractor::new(&[(Field::Body, "x")]);
        let program = program(leaf(Field::Body, OpCode::Contains, "x"), None);

        assert_eq!(
            vm.execute(&program, &extractor).unwrap_err(),
            FingerprintError::StackOverflow
        );
    }

    #[test]
    fn test_unverified_underflow_is_error_not_panic() {
        let vm = Vm::new();
        let extractor = MapExtractor::new(&[]);
        let program = Program::new_unverified(vec![OpCode::Equal, OpCode::finish(None)]);

        let err = vm.execute(&program, &extractor).unwrap_err();
        assert_eq!(err, FingerprintError::StackUnderflow);
        assert!(err.is_engine_bug());
    }

    #[test]
    fn test_unverified_leftover_stack_is_error() {
        let vm = Vm::new();
        let extractor = MapExtractor::new(&[(Field::Body, "x")]);
        let program = Program::new_unverified(vec![OpCode::ExtractData(Field::Body)]);

        let err = vm.execute(&program, &extractor).unwrap_err();
        assert!(matches!(err, FingerprintError::InvalidBytecode(_)));
    }

    #[test]
    fn test_unverified_bad_jump_is_error() {
        let vm = Vm::new();
        let extractor = MapExtractor::new(&[(Field::Body, "x")]);
        let mut opcodes = leaf(Field::Body, OpCode::Contains, "y");
        opcodes.push(OpCode::And(99));
        opcodes.push(OpCode::finish(None));

        let err = vm
            .execute(&Program::new_unverified(opcodes), &extractor)
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_vm_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Vm>();
        assert_send_sync::<Program>();
    }
}
