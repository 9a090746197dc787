//! Disassembly for test diagnostics (§3 "disassembly/debug helpers"). Never
//! called from the dispatch hot path — only by tests and the operator tool
//! when printing what a compiled predicate will actually run.

use super::op;
use super::program::Program;

fn mnemonic(opcode: u8) -> &'static str {
    match opcode {
        op::NCONST => "NCONST",
        op::NCONST_0 => "NCONST_0",
        op::NCONST_1 => "NCONST_1",
        op::NCONST_2 => "NCONST_2",
        op::BCONST_0 => "BCONST_0",
        op::BCONST_1 => "BCONST_1",
        op::NILCONST => "NILCONST",
        op::CLOAD => "CLOAD",
        op::ISNIL => "ISNIL",
        op::KIND => "KIND",
        op::DUP => "DUP",
        op::DROP => "DROP",
        op::SWAP => "SWAP",
        op::OVER => "OVER",
        op::ROT => "ROT",
        op::CMP => "CMP",
        op::LT => "LT",
        op::LE => "LE",
        op::EQ => "EQ",
        op::GE => "GE",
        op::GT => "GT",
        op::NE => "NE",
        op::LAND => "LAND",
        op::LOR => "LOR",
        op::LXOR => "LXOR",
        op::LNOT => "LNOT",
        op::LTTBLB => "LTTBLB",
        op::LTTBLU => "LTTBLU",
        op::ADD => "ADD",
        op::SUB => "SUB",
        op::MUL => "MUL",
        op::DIV => "DIV",
        op::FMOD => "FMOD",
        op::POW => "POW",
        op::SHL => "SHL",
        op::SHR => "SHR",
        op::SQRT => "SQRT",
        op::TRUNC => "TRUNC",
        op::FLOOR => "FLOOR",
        op::CEIL => "CEIL",
        op::JMP => "JMP",
        op::JMPT => "JMPT",
        op::JMPF => "JMPF",
        op::CALL => "CALL",
        op::DJMP => "DJMP",
        op::DJMPT => "DJMPT",
        op::DJMPF => "DJMPF",
        op::DCALL => "DCALL",
        op::RET => "RET",
        op::HLT => "HLT",
        op::NOP => "NOP",
        _ => "???",
    }
}

/// One decoded instruction: its offset, mnemonic, and raw argument bytes
/// (already-resolved jump targets or constant indices are left as hex to
/// avoid duplicating the interpreter's decoding logic).
pub struct Instruction {
    pub offset: usize,
    pub opcode: u8,
    pub arg: Vec<u8>,
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}  {}", self.offset, mnemonic(self.opcode))?;
        if !self.arg.is_empty() {
            write!(f, " ")?;
            for byte in &self.arg {
                write!(f, "{byte:02x}")?;
            }
        }
        Ok(())
    }
}

/// Decodes `bytecode` into a flat instruction list. Stops (without error) at
/// the first byte that isn't a recognized opcode or that lacks enough
/// trailing bytes for its argument, since this is a diagnostic tool, not a
/// validator — `Machine::run` is the source of truth for malformed programs.
pub fn disassemble(bytecode: &[u8]) -> Vec<Instruction> {
    let mut out = Vec::new();
    let mut pc = 0;
    while pc < bytecode.len() {
        let opcode = bytecode[pc];
        let Some(len) = super::arg_len(opcode) else {
            break;
        };
        if pc + 1 + len > bytecode.len() {
            break;
        }
        out.push(Instruction {
            offset: pc,
            opcode,
            arg: bytecode[pc + 1..pc + 1 + len].to_vec(),
        });
        pc += 1 + len;
    }
    out
}

/// Renders a full program: its constant pool followed by its instructions,
/// one per line.
pub fn pretty_print(program: &Program) -> String {
    let mut out = String::new();
    for (i, value) in program.consts.iter().enumerate() {
        out.push_str(&format!("const[{i}] = {value:?}\n"));
    }
    for instr in disassemble(&program.bytecode) {
        out.push_str(&instr.to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::compile;

    #[test]
    fn disassembles_a_compiled_program() {
        let built = compile("1 2 ADD").unwrap();
        let text = pretty_print(&built.program);
        assert!(text.contains("NCONST_1"));
        assert!(text.contains("ADD"));
    }

    #[test]
    fn stops_cleanly_at_a_truncated_trailing_instruction() {
        let instrs = disassemble(&[op::CLOAD, 0x01]); // needs 4 arg bytes, only 1 given
        assert!(instrs.is_empty());
    }
}
