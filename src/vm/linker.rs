//! Linking a built program against a name→value fact map (§3, §4.4).

use std::collections::HashMap;

use super::program::{BuiltProgram, LinkedProgram};
use super::value::{Kind, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("no mapping supplied for reserved name {0:?}")]
    MissingMapping(String),
    #[error("reserved name {name:?} expected kind {expected:?}, got a different kind")]
    KindMismatch { name: String, expected: Kind },
}

/// Fills every reserved-constant slot in `built` from `facts`, producing an
/// immutable [`LinkedProgram`] (§3: "Linking"). Transactional: on failure the
/// built program's own constant pool is untouched (§7 "Linking is
/// transactional") — we only ever mutate a fresh clone of the pool.
pub fn link(built: &BuiltProgram, facts: &HashMap<String, Value>) -> Result<LinkedProgram, LinkError> {
    let mut consts = built.program.consts.clone();

    for slot in &built.reserved {
        let value = facts
            .get(&slot.name)
            .ok_or_else(|| LinkError::MissingMapping(slot.name.clone()))?;

        if slot.expected_kind != Kind::Nil && value.kind() != slot.expected_kind {
            return Err(LinkError::KindMismatch {
                name: slot.name.clone(),
                expected: slot.expected_kind,
            });
        }

        let idx = slot.const_index as usize;
        if idx >= consts.len() {
            return Err(LinkError::MissingMapping(slot.name.clone()));
        }
        consts[idx] = value.clone();
    }

    Ok(LinkedProgram {
        bytecode: built.program.bytecode.clone(),
        consts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::program::{Program, ReservedSlot};

    fn built_with_one_reserved(name: &str, expected_kind: Kind) -> BuiltProgram {
        BuiltProgram {
            program: Program {
                bytecode: vec![],
                consts: vec![Value::Nil],
            },
            reserved: vec![ReservedSlot {
                name: name.to_string(),
                const_index: 0,
                expected_kind,
            }],
        }
    }

    #[test]
    fn links_matching_value() {
        let built = built_with_one_reserved("rt_cpu", Kind::Number);
        let mut facts = HashMap::new();
        facts.insert("rt_cpu".to_string(), Value::Number(4.0));
        let linked = link(&built, &facts).unwrap();
        assert_eq!(linked.consts[0], Value::Number(4.0));
    }

    #[test]
    fn missing_mapping_fails() {
        let built = built_with_one_reserved("rt_cpu", Kind::Number);
        let facts = HashMap::new();
        assert_eq!(
            link(&built, &facts),
            Err(LinkError::MissingMapping("rt_cpu".into()))
        );
    }

    #[test]
    fn kind_mismatch_fails() {
        let built = built_with_one_reserved("goos", Kind::String);
        let mut facts = HashMap::new();
        facts.insert("goos".to_string(), Value::Number(1.0));
        assert_eq!(
            link(&built, &facts),
            Err(LinkError::KindMismatch {
                name: "goos".into(),
                expected: Kind::String
            })
        );
    }

    #[test]
    fn unregistered_name_accepts_any_kind() {
        let built = built_with_one_reserved("custom_flag", Kind::Nil);
        let mut facts = HashMap::new();
        facts.insert("custom_flag".to_string(), Value::Bool(true));
        let linked = link(&built, &facts).unwrap();
        assert_eq!(linked.consts[0], Value::Bool(true));
    }
}
