//! Agent system facts (§3 "Agent record", §6 reserved-constant names).
//!
//! Collecting these values — CPU identification, OS/arch strings, user and
//! path information — is explicitly out of scope (§1); this module only
//! carries the facts once collected, serializes them for the `Handshake`
//! message, and projects the six names the hub reserves for predicate
//! linking.

use std::collections::HashMap;

use crate::vm::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FactsError {
    #[error("unexpected end of input")]
    Eof,
    #[error("string is not valid UTF-8")]
    BadString,
}

/// Everything an agent reports about itself at handshake (§3, §6).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SystemFacts {
    pub num_cpu: i64,
    pub cpuid_cpu: i64,
    pub goos: String,
    pub arch: String,
    pub hostname: String,
    pub username: String,
    pub home_dir: String,
    pub exec_path: String,
    pub features: u64,
}

impl SystemFacts {
    /// Projects the six reserved names the hub supplies when linking an
    /// operator's predicate (§6). `address` comes from the session's remote
    /// peer address, not from the agent's self-report, so the caller supplies
    /// it separately.
    pub fn to_reserved_map(&self, address: &str) -> HashMap<String, Value> {
        let mut map = HashMap::with_capacity(6);
        map.insert("rt_cpu".to_string(), Value::Number(self.num_cpu as f64));
        map.insert("cpuid_cpu".to_string(), Value::Number(self.cpuid_cpu as f64));
        map.insert("goos".to_string(), Value::String(self.goos.clone()));
        map.insert("hostname".to_string(), Value::String(self.hostname.clone()));
        map.insert("username".to_string(), Value::String(self.username.clone()));
        map.insert("address".to_string(), Value::String(address.to_string()));
        map
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.num_cpu.to_le_bytes());
        out.extend_from_slice(&self.cpuid_cpu.to_le_bytes());
        write_string(out, &self.goos);
        write_string(out, &self.arch);
        write_string(out, &self.hostname);
        write_string(out, &self.username);
        write_string(out, &self.home_dir);
        write_string(out, &self.exec_path);
        out.extend_from_slice(&self.features.to_le_bytes());
    }

    pub fn read(buf: &[u8], pos: &mut usize) -> Result<Self, FactsError> {
        Ok(Self {
            num_cpu: read_i64(buf, pos)?,
            cpuid_cpu: read_i64(buf, pos)?,
            goos: read_string(buf, pos)?,
            arch: read_string(buf, pos)?,
            hostname: read_string(buf, pos)?,
            username: read_string(buf, pos)?,
            home_dir: read_string(buf, pos)?,
            exec_path: read_string(buf, pos)?,
            features: read_u64(buf, pos)?,
        })
    }
}

pub(crate) fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

pub(crate) fn read_string(buf: &[u8], pos: &mut usize) -> Result<String, FactsError> {
    let len = read_u32(buf, pos)? as usize;
    let end = pos.checked_add(len).ok_or(FactsError::Eof)?;
    let bytes = buf.get(*pos..end).ok_or(FactsError::Eof)?;
    *pos = end;
    String::from_utf8(bytes.to_vec()).map_err(|_| FactsError::BadString)
}

pub(crate) fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, FactsError> {
    let bytes = read_bytes::<4>(buf, pos)?;
    Ok(u32::from_le_bytes(bytes))
}

pub(crate) fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64, FactsError> {
    let bytes = read_bytes::<8>(buf, pos)?;
    Ok(u64::from_le_bytes(bytes))
}

pub(crate) fn read_i64(buf: &[u8], pos: &mut usize) -> Result<i64, FactsError> {
    let bytes = read_bytes::<8>(buf, pos)?;
    Ok(i64::from_le_bytes(bytes))
}

pub(crate) fn read_bytes<const N: usize>(buf: &[u8], pos: &mut usize) -> Result<[u8; N], FactsError> {
    let end = pos.checked_add(N).ok_or(FactsError::Eof)?;
    let slice = buf.get(*pos..end).ok_or(FactsError::Eof)?;
    *pos = end;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SystemFacts {
        SystemFacts {
            num_cpu: 4,
            cpuid_cpu: 4,
            goos: "linux".into(),
            arch: "amd64".into(),
            hostname: "box".into(),
            username: "root".into(),
            home_dir: "/root".into(),
            exec_path: "/usr/bin/agent".into(),
            features: 0b1011,
        }
    }

    #[test]
    fn round_trips() {
        let facts = sample();
        let mut buf = Vec::new();
        facts.write(&mut buf);
        let mut pos = 0;
        assert_eq!(SystemFacts::read(&buf, &mut pos).unwrap(), facts);
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn projects_the_six_reserved_names() {
        let facts = sample();
        let map = facts.to_reserved_map("127.0.0.1:4444");
        assert_eq!(map.get("rt_cpu"), Some(&Value::Number(4.0)));
        assert_eq!(map.get("cpuid_cpu"), Some(&Value::Number(4.0)));
        assert_eq!(map.get("goos"), Some(&Value::String("linux".into())));
        assert_eq!(map.get("hostname"), Some(&Value::String("box".into())));
        assert_eq!(map.get("username"), Some(&Value::String("root".into())));
        assert_eq!(
            map.get("address"),
            Some(&Value::String("127.0.0.1:4444".into()))
        );
        assert_eq!(map.len(), 6);
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let facts = sample();
        let mut buf = Vec::new();
        facts.write(&mut buf);
        buf.truncate(buf.len() - 1);
        let mut pos = 0;
        assert_eq!(SystemFacts::read(&buf, &mut pos), Err(FactsError::Eof));
    }
}
