//! A FORTH-like textual surface language for predicate programs (§4.4).
//!
//! Tokens separate on whitespace. A numeral pushes itself as a `Value::Number`
//! constant; `true`/`T`/`false`/`F` push booleans; `nil` pushes `Value::Nil`.
//! Opcode mnemonics (`ADD`, `DUP`, `JMP`, ...) and a handful of symbolic
//! aliases (`+`, `==`, `&&`, ...) compile directly to their instructions. The
//! relational aliases (`==`, `!=`, `<`, `<=`, `>`, `>=`) compile straight to
//! their relational opcode (`EQ`, `NE`, `LT`, `LE`, `GT`, `GE`) — callers
//! must emit `CMP` themselves first, since the relational opcodes consume an
//! already-computed spaceship result rather than two raw operands.
//! `CLOAD_<n>` loads a raw constant-pool index; `CNAMED_<name>` reserves (or
//! reuses) a named slot the hub fills in at link time. `name:` defines a jump
//! label; `JMP`/`JMPT`/`JMPF`/`CALL` each take the following token as a label
//! reference.

use std::collections::HashMap;

use super::op;
use super::program::{BuiltProgram, Program, ReservedSlot};
use super::value::{Kind, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("unknown token {0:?}")]
    UnknownToken(String),
    #[error("{0:?} is not a valid number literal")]
    BadNumber(String),
    #[error("{0:?} is not a valid truth-table mask")]
    BadTruthTableMask(String),
    #[error("label {0:?} defined more than once")]
    DuplicateLabel(String),
    #[error("{0:?} has no following label token")]
    MissingLabelTarget(String),
    #[error("jump to undefined label {0:?}")]
    UnknownLabel(String),
}

/// Kind a well-known reserved name is expected to carry (§6). Names outside
/// this table reserve as `Kind::Nil`, meaning "accept whatever kind the hub
/// supplies".
fn well_known_kind(name: &str) -> Kind {
    match name {
        "rt_cpu" | "cpuid_cpu" => Kind::Number,
        "goos" | "hostname" | "username" | "address" => Kind::String,
        _ => Kind::Nil,
    }
}

struct Assembler {
    bytecode: Vec<u8>,
    consts: Vec<Value>,
    reserved: Vec<ReservedSlot>,
    reserved_by_name: HashMap<String, u32>,
    labels: HashMap<String, u32>,
    patches: Vec<(usize, String)>,
}

impl Assembler {
    fn new() -> Self {
        Self {
            bytecode: Vec::new(),
            consts: Vec::new(),
            reserved: Vec::new(),
            reserved_by_name: HashMap::new(),
            labels: HashMap::new(),
            patches: Vec::new(),
        }
    }

    fn emit_op(&mut self, opcode: u8) {
        self.bytecode.push(opcode);
    }

    fn emit_number_literal(&mut self, n: f64) {
        if n == 0.0 {
            self.emit_op(op::NCONST_0);
        } else if n == 1.0 {
            self.emit_op(op::NCONST_1);
        } else if n == 2.0 {
            self.emit_op(op::NCONST_2);
        } else {
            self.emit_op(op::NCONST);
            self.bytecode.extend_from_slice(&n.to_le_bytes());
        }
    }

    fn emit_cload(&mut self, index: u32) {
        self.emit_op(op::CLOAD);
        self.bytecode.extend_from_slice(&index.to_le_bytes());
    }

    /// Pushes `s` into the constant pool and emits a load of it (there is no
    /// dedicated string-constant opcode — string literals share `CLOAD` with
    /// `CLOAD_<n>`/`CNAMED_<name>`, per §4.4's constant pool).
    fn emit_string_literal(&mut self, s: String) {
        let idx = self.consts.len() as u32;
        self.consts.push(Value::String(s));
        self.emit_cload(idx);
    }

    fn emit_cnamed(&mut self, name: &str) {
        let mut program = Program {
            bytecode: std::mem::take(&mut self.bytecode),
            consts: std::mem::take(&mut self.consts),
        };
        let idx = program.reserve_named(
            &mut self.reserved,
            &mut self.reserved_by_name,
            name,
            well_known_kind(name),
        );
        self.bytecode = program.bytecode;
        self.consts = program.consts;
        self.emit_cload(idx);
    }

    fn emit_jump(&mut self, opcode: u8, label: &str) {
        self.emit_op(opcode);
        let patch_at = self.bytecode.len();
        self.bytecode.extend_from_slice(&0u32.to_le_bytes());
        self.patches.push((patch_at, label.to_string()));
    }

    fn define_label(&mut self, name: &str) -> Result<(), CompileError> {
        if self.labels.insert(name.to_string(), self.bytecode.len() as u32).is_some() {
            return Err(CompileError::DuplicateLabel(name.to_string()));
        }
        Ok(())
    }

    fn resolve_patches(&mut self) -> Result<(), CompileError> {
        for (offset, label) in &self.patches {
            let target = self
                .labels
                .get(label)
                .copied()
                .ok_or_else(|| CompileError::UnknownLabel(label.clone()))?;
            self.bytecode[*offset..*offset + 4].copy_from_slice(&target.to_le_bytes());
        }
        Ok(())
    }

    fn finish(mut self) -> Result<BuiltProgram, CompileError> {
        self.resolve_patches()?;
        Ok(BuiltProgram {
            program: Program {
                bytecode: self.bytecode,
                consts: self.consts,
            },
            reserved: self.reserved,
        })
    }
}

/// Splits `source` into whitespace-separated tokens, treating a
/// double-quoted run (with `\"` and `\\` escapes) as a single token so string
/// literals may contain spaces (§4.4 "whitespace-separated tokens with
/// double-quoted strings and backslash escape").
fn tokenize(source: &str) -> Result<Vec<String>, CompileError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            let mut tok = String::from("\"");
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => {
                        tok.push('"');
                        break;
                    }
                    Some('\\') => match chars.next() {
                        Some('"') => tok.push('"'),
                        Some('\\') => tok.push('\\'),
                        Some(other) => {
                            tok.push('\\');
                            tok.push(other);
                        }
                        None => return Err(CompileError::UnknownToken(tok)),
                    },
                    Some(other) => tok.push(other),
                    None => return Err(CompileError::UnknownToken(tok)),
                }
            }
            tokens.push(tok);
            continue;
        }
        let mut tok = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            tok.push(c);
            chars.next();
        }
        tokens.push(tok);
    }
    Ok(tokens)
}

/// Unescapes the contents of a `"..."` token (quotes already stripped by the
/// caller via [`tokenize`]'s escape handling).
fn parse_string_literal(tok: &str) -> Option<String> {
    let inner = tok.strip_prefix('"')?.strip_suffix('"')?;
    Some(inner.to_string())
}

fn parse_truth_table_mask(digits: &str) -> Option<u8> {
    if digits.len() == 1 {
        return u8::from_str_radix(digits, 16).ok().filter(|m| *m < 16);
    }
    if digits.len() == 4 && digits.chars().all(|c| c == '0' || c == '1') {
        return u8::from_str_radix(digits, 2).ok();
    }
    None
}

/// Compiles a predicate's textual source into a [`BuiltProgram`].
pub fn compile(source: &str) -> Result<BuiltProgram, CompileError> {
    let mut asm = Assembler::new();
    let token_list = tokenize(source)?;
    let mut tokens = token_list.iter().map(String::as_str).peekable();

    while let Some(tok) = tokens.next() {
        if let Some(label) = tok.strip_suffix(':') {
            asm.define_label(label)?;
            continue;
        }

        if let Some(s) = parse_string_literal(tok) {
            asm.emit_string_literal(s);
            continue;
        }

        if let Some(n) = parse_number(tok) {
            asm.emit_number_literal(n);
            continue;
        }

        if let Some(rest) = tok.strip_prefix("CLOAD_") {
            let idx: u32 = rest.parse().map_err(|_| CompileError::BadNumber(tok.to_string()))?;
            asm.emit_cload(idx);
            continue;
        }
        if let Some(name) = tok.strip_prefix("CNAMED_") {
            asm.emit_cnamed(name);
            continue;
        }
        if let Some(digits) = tok.strip_prefix("LTTBLB_") {
            let mask = parse_truth_table_mask(digits)
                .ok_or_else(|| CompileError::BadTruthTableMask(tok.to_string()))?;
            asm.emit_op(op::LTTBLB);
            asm.bytecode.push(mask);
            continue;
        }
        if let Some(digits) = tok.strip_prefix("LTTBLU_") {
            let mask = parse_truth_table_mask(digits)
                .ok_or_else(|| CompileError::BadTruthTableMask(tok.to_string()))?;
            asm.emit_op(op::LTTBLU);
            asm.bytecode.push(mask);
            continue;
        }

        match tok {
            "true" | "T" => asm.emit_op(op::BCONST_1),
            "false" | "F" => asm.emit_op(op::BCONST_0),
            "nil" => asm.emit_op(op::NILCONST),

            "NCONST_0" => asm.emit_op(op::NCONST_0),
            "NCONST_1" => asm.emit_op(op::NCONST_1),
            "NCONST_2" => asm.emit_op(op::NCONST_2),
            "BCONST_0" => asm.emit_op(op::BCONST_0),
            "BCONST_1" => asm.emit_op(op::BCONST_1),
            "NILCONST" => asm.emit_op(op::NILCONST),

            "ISNIL" => asm.emit_op(op::ISNIL),
            "KIND" => asm.emit_op(op::KIND),
            "DUP" => asm.emit_op(op::DUP),
            "DROP" => asm.emit_op(op::DROP),
            "SWAP" => asm.emit_op(op::SWAP),
            "OVER" => asm.emit_op(op::OVER),
            "ROT" => asm.emit_op(op::ROT),

            "CMP" => asm.emit_op(op::CMP),
            "LT" => asm.emit_op(op::LT),
            "LE" => asm.emit_op(op::LE),
            "EQ" => asm.emit_op(op::EQ),
            "GE" => asm.emit_op(op::GE),
            "GT" => asm.emit_op(op::GT),
            "NE" => asm.emit_op(op::NE),
            "==" => asm.emit_op(op::EQ),
            "!=" => asm.emit_op(op::NE),
            "<" => asm.emit_op(op::LT),
            "<=" => asm.emit_op(op::LE),
            ">" => asm.emit_op(op::GT),
            ">=" => asm.emit_op(op::GE),

            "LAND" | "&&" => asm.emit_op(op::LAND),
            "LOR" | "||" => asm.emit_op(op::LOR),
            "LXOR" | "^" => asm.emit_op(op::LXOR),
            "LNOT" | "!" => asm.emit_op(op::LNOT),

            "ADD" | "+" => asm.emit_op(op::ADD),
            "SUB" | "-" => asm.emit_op(op::SUB),
            "MUL" | "*" => asm.emit_op(op::MUL),
            "DIV" | "/" => asm.emit_op(op::DIV),
            "FMOD" | "%" => asm.emit_op(op::FMOD),
            "POW" | "**" => asm.emit_op(op::POW),
            "SHL" | "<<" => asm.emit_op(op::SHL),
            "SHR" | ">>" => asm.emit_op(op::SHR),
            "SQRT" => asm.emit_op(op::SQRT),
            "TRUNC" => asm.emit_op(op::TRUNC),
            "FLOOR" => asm.emit_op(op::FLOOR),
            "CEIL" => asm.emit_op(op::CEIL),

            "JMP" | "JMPT" | "JMPF" | "CALL" => {
                let label = tokens
                    .next()
                    .ok_or_else(|| CompileError::MissingLabelTarget(tok.to_string()))?;
                let opcode = match tok {
                    "JMP" => op::JMP,
                    "JMPT" => op::JMPT,
                    "JMPF" => op::JMPF,
                    _ => op::CALL,
                };
                asm.emit_jump(opcode, label);
            }
            "DJMP" => asm.emit_op(op::DJMP),
            "DJMPT" => asm.emit_op(op::DJMPT),
            "DJMPF" => asm.emit_op(op::DJMPF),
            "DCALL" => asm.emit_op(op::DCALL),
            "RET" => asm.emit_op(op::RET),
            "HLT" => asm.emit_op(op::HLT),
            "NOP" => asm.emit_op(op::NOP),

            other => return Err(CompileError::UnknownToken(other.to_string())),
        }
    }

    asm.finish()
}

fn parse_number(tok: &str) -> Option<f64> {
    let mut chars = tok.chars();
    let first = chars.next()?;
    if !(first.is_ascii_digit() || ((first == '-' || first == '+') && chars.as_str().chars().next().is_some_and(|c| c.is_ascii_digit()))) {
        return None;
    }
    tok.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::interp::execute;
    use crate::vm::linker::link;
    use std::collections::HashMap;

    #[test]
    fn compiles_literals_and_arithmetic() {
        let built = compile("2 3 ADD 5 CMP ==").unwrap();
        let linked = link(&built, &HashMap::new()).unwrap();
        assert_eq!(execute(&linked).unwrap(), Value::Bool(true));
    }

    #[test]
    fn named_reservation_is_idempotent_by_name() {
        let built = compile("CNAMED_rt_cpu CNAMED_rt_cpu CMP ==").unwrap();
        assert_eq!(built.reserved.len(), 1);
        assert_eq!(built.reserved[0].expected_kind, Kind::Number);
    }

    #[test]
    fn unknown_name_reserves_as_nil_kind() {
        let built = compile("CNAMED_custom_flag").unwrap();
        assert_eq!(built.reserved[0].expected_kind, Kind::Nil);
    }

    #[test]
    fn truth_table_mask_accepts_binary_or_hex_form() {
        let a = compile("true false LTTBLB_1000").unwrap();
        let b = compile("true false LTTBLB_8").unwrap();
        assert_eq!(a.program.bytecode, b.program.bytecode);
    }

    #[test]
    fn labels_resolve_forward_and_backward() {
        let built = compile("JMP skip HLT skip: true").unwrap();
        let linked = link(&built, &HashMap::new()).unwrap();
        assert_eq!(execute(&linked).unwrap(), Value::Bool(true));
    }

    #[test]
    fn unknown_label_is_rejected() {
        assert_eq!(
            compile("JMP nowhere"),
            Err(CompileError::UnknownLabel("nowhere".to_string()))
        );
    }

    #[test]
    fn unknown_token_is_rejected() {
        assert_eq!(
            compile("BOGUS"),
            Err(CompileError::UnknownToken("BOGUS".to_string()))
        );
    }
}
