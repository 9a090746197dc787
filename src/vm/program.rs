//! VM programs: the constant pool + opcode stream pair, the "built" stage
//! with named reserved-constant slots, and the fully-linked immutable
//! program the interpreter runs (§3 "VM program").

use std::collections::HashMap;

use super::value::{Kind, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgramError {
    #[error("unexpected end of input")]
    Eof,
    #[error("unknown value kind tag {0}")]
    BadKind(u16),
    #[error("reserved-constant name is not valid UTF-8")]
    BadName,
}

/// A byte vector of opcodes plus a constant pool of tagged values.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub bytecode: Vec<u8>,
    pub consts: Vec<Value>,
}

/// A single reserved-constant slot: the name the compiler emitted a
/// `CNAMED_<name>` load for, which constant-pool index it occupies, and the
/// kind the linker must supply.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservedSlot {
    pub name: String,
    pub const_index: u32,
    pub expected_kind: Kind,
}

/// A [`Program`] plus the reserved-constant slots an operator's predicate
/// source reserved via `CNAMED_<name>` (§4.4).
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltProgram {
    pub program: Program,
    pub reserved: Vec<ReservedSlot>,
}

/// An immutable, fully-populated program safe for repeated evaluation
/// (§3: "linking ... yields an immutable linked program").
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedProgram {
    pub bytecode: Vec<u8>,
    pub consts: Vec<Value>,
}

fn kind_from_tag(tag: u16) -> Result<Kind, ProgramError> {
    Ok(match tag {
        0 => Kind::Nil,
        1 => Kind::Number,
        2 => Kind::Bool,
        3 => Kind::String,
        other => return Err(ProgramError::BadKind(other)),
    })
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    out.extend_from_slice(&(value.kind() as u8 as u16).to_le_bytes());
    match value {
        Value::Nil => {}
        Value::Bool(b) => out.push(*b as u8),
        Value::Number(n) => out.extend_from_slice(&n.to_le_bytes()),
        Value::String(s) => {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
    }
}

fn read_value(buf: &[u8], pos: &mut usize) -> Result<Value, ProgramError> {
    let tag = read_u16(buf, pos)?;
    Ok(match kind_from_tag(tag)? {
        Kind::Nil => Value::Nil,
        Kind::Bool => Value::Bool(read_u8(buf, pos)? != 0),
        Kind::Number => Value::Number(f64::from_le_bytes(read_bytes::<8>(buf, pos)?)),
        Kind::String => {
            let len = read_u32(buf, pos)? as usize;
            let bytes = read_slice(buf, pos, len)?;
            Value::String(String::from_utf8(bytes.to_vec()).map_err(|_| ProgramError::BadName)?)
        }
    })
}

fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8, ProgramError> {
    let b = *buf.get(*pos).ok_or(ProgramError::Eof)?;
    *pos += 1;
    Ok(b)
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16, ProgramError> {
    Ok(u16::from_le_bytes(read_bytes::<2>(buf, pos)?))
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, ProgramError> {
    Ok(u32::from_le_bytes(read_bytes::<4>(buf, pos)?))
}

fn read_bytes<const N: usize>(buf: &[u8], pos: &mut usize) -> Result<[u8; N], ProgramError> {
    let slice = read_slice(buf, pos, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

fn read_slice<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], ProgramError> {
    let end = pos.checked_add(len).ok_or(ProgramError::Eof)?;
    let slice = buf.get(*pos..end).ok_or(ProgramError::Eof)?;
    *pos = end;
    Ok(slice)
}

impl BuiltProgram {
    /// Serializes this program in the wire format embedded in `ProxyRequest`
    /// (§6): `u32 bytecode_len || bytecode || u32 const_count || consts ||
    /// u32 reserved_count || reserved slots`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.program.bytecode.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.program.bytecode);
        out.extend_from_slice(&(self.program.consts.len() as u32).to_le_bytes());
        for value in &self.program.consts {
            write_value(&mut out, value);
        }
        out.extend_from_slice(&(self.reserved.len() as u32).to_le_bytes());
        for slot in &self.reserved {
            out.extend_from_slice(&(slot.name.len() as u32).to_le_bytes());
            out.extend_from_slice(slot.name.as_bytes());
            out.extend_from_slice(&slot.const_index.to_le_bytes());
            out.extend_from_slice(&(slot.expected_kind as u8 as u16).to_le_bytes());
        }
        out
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, ProgramError> {
        let mut pos = 0usize;
        let bytecode_len = read_u32(buf, &mut pos)? as usize;
        let bytecode = read_slice(buf, &mut pos, bytecode_len)?.to_vec();

        let const_count = read_u32(buf, &mut pos)? as usize;
        let mut consts = Vec::with_capacity(const_count);
        for _ in 0..const_count {
            consts.push(read_value(buf, &mut pos)?);
        }

        let reserved_count = read_u32(buf, &mut pos)? as usize;
        let mut reserved = Vec::with_capacity(reserved_count);
        for _ in 0..reserved_count {
            let name_len = read_u32(buf, &mut pos)? as usize;
            let name_bytes = read_slice(buf, &mut pos, name_len)?;
            let name = String::from_utf8(name_bytes.to_vec()).map_err(|_| ProgramError::BadName)?;
            let const_index = read_u32(buf, &mut pos)?;
            let expected_kind = kind_from_tag(read_u16(buf, &mut pos)?)?;
            reserved.push(ReservedSlot {
                name,
                const_index,
                expected_kind,
            });
        }

        Ok(BuiltProgram {
            program: Program { bytecode, consts },
            reserved,
        })
    }
}

impl Program {
    /// Finds (or reserves) a named slot, returning its constant-pool index.
    /// Used by the compiler, which must be idempotent by name (§4.4
    /// `CNAMED_<name>`): repeated references to the same name reuse the same
    /// slot instead of growing the pool. `expected_kind` is `Kind::Nil` for
    /// names the compiler's well-known registry doesn't recognize, which the
    /// linker treats as "accept whatever kind is supplied".
    pub fn reserve_named(
        &mut self,
        reserved: &mut Vec<ReservedSlot>,
        index_by_name: &mut HashMap<String, u32>,
        name: &str,
        expected_kind: Kind,
    ) -> u32 {
        if let Some(&idx) = index_by_name.get(name) {
            return idx;
        }
        let idx = self.consts.len() as u32;
        self.consts.push(Value::Nil);
        index_by_name.insert(name.to_string(), idx);
        reserved.push(ReservedSlot {
            name: name.to_string(),
            const_index: idx,
            expected_kind,
        });
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_program_round_trips() {
        let built = BuiltProgram {
            program: Program {
                bytecode: vec![1, 2, 3, 4],
                consts: vec![
                    Value::Nil,
                    Value::Number(4.0),
                    Value::Bool(true),
                    Value::String("linux".into()),
                ],
            },
            reserved: vec![ReservedSlot {
                name: "rt_cpu".into(),
                const_index: 1,
                expected_kind: Kind::Number,
            }],
        };
        let wire = built.serialize();
        let decoded = BuiltProgram::deserialize(&wire).unwrap();
        assert_eq!(built, decoded);
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let built = BuiltProgram {
            program: Program {
                bytecode: vec![1, 2, 3],
                consts: vec![],
            },
            reserved: vec![],
        };
        let mut wire = built.serialize();
        wire.truncate(wire.len() - 1);
        assert_eq!(BuiltProgram::deserialize(&wire), Err(ProgramError::Eof));
    }
}
