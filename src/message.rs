//! The self-describing tagged message catalog (§4.2, §6).
//!
//! Every message is identified by a 16-bit tag laid out `r ccc iiii iiii`:
//! bit 11 marks a reply, bits 8-10 give the category, bits 0-7 the ordinal
//! within that category. Wire form is `uvarint(tag) || body`, where `body`
//! uses fixed-size little-endian ints and length-prefixed strings. The
//! catalog is closed: an unrecognized tag is a deserialization error, never
//! silently dropped.

use crate::facts::{read_bytes, read_i64, read_string, read_u32, read_u64, write_string, FactsError, SystemFacts};
use crate::frame::{FrameError, Packet};
use crate::varint::{read_uvarint, write_uvarint, VarintError};
use crate::vm::program::ProgramError;
use crate::vm::BuiltProgram;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error(transparent)]
    Varint(#[from] VarintError),
    #[error(transparent)]
    Facts(#[from] FactsError),
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("unknown message tag {0:#06x}")]
    UnknownTag(u16),
    #[error("expected message tag {expected:#06x}, got {got:#06x}")]
    UnexpectedTag { expected: u16, got: u16 },
}

const REPLY_BIT: u16 = 1 << 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
enum Category {
    Misc = 0,
    State = 1,
    Query = 2,
    CommandControl = 3,
    Error = 4,
}

const fn tag(category: Category, ordinal: u8, reply: bool) -> u16 {
    ((category as u16) << 8) | (ordinal as u16) | if reply { REPLY_BIT } else { 0 }
}

mod tags {
    use super::{tag, Category};

    pub const PING: u16 = tag(Category::Misc, 0, false);
    pub const PING_REPLY: u16 = tag(Category::Misc, 0, true);
    pub const SIGNED_PING: u16 = tag(Category::Misc, 1, false);
    pub const SIGNED_PING_REPLY: u16 = tag(Category::Misc, 1, true);

    pub const HANDSHAKE: u16 = tag(Category::State, 0, false);
    pub const HANDSHAKE_REPLY: u16 = tag(Category::State, 0, true);
    pub const TOKEN_REQUEST: u16 = tag(Category::State, 1, false);
    pub const TOKEN: u16 = tag(Category::State, 1, true);

    pub const CLIENTS: u16 = tag(Category::Query, 0, false);
    pub const CLIENTS_REPLY: u16 = tag(Category::Query, 0, true);
    pub const CLIENT_QUERY: u16 = tag(Category::Query, 1, false);
    pub const CLIENT_QUERY_REPLY: u16 = tag(Category::Query, 1, true);

    pub const PROXY_REQUEST: u16 = tag(Category::CommandControl, 0, false);
    pub const PROXY_REPLY: u16 = tag(Category::CommandControl, 0, true);
    pub const FETCH_PROXY_REQUEST: u16 = tag(Category::CommandControl, 1, false);
    pub const PROXY_PAYLOAD: u16 = tag(Category::CommandControl, 2, false);
    pub const FETCH_PROXY_REPLY: u16 = tag(Category::CommandControl, 2, true);

    pub const BAD_REQUEST: u16 = tag(Category::Error, 0, false);
    pub const INTERNAL: u16 = tag(Category::Error, 1, false);
    pub const UNSIGNED: u16 = tag(Category::Error, 2, false);
}

/// A typed agent record as returned by `ClientQuery` (§6).
#[derive(Debug, Clone, PartialEq)]
pub struct AgentInfo {
    pub id: u64,
    pub address: String,
    pub facts: SystemFacts,
}

/// Every wire message this catalog recognizes (§6 "Required message variants").
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping { token: i32 },
    PingReply { token: i32 },
    SignedPing { ptoken: i32, stoken: u64 },
    SignedPingReply { ptoken: i32 },

    Handshake { facts: SystemFacts },
    HandshakeReply { id: u64 },
    TokenRequest,
    Token { token: u64 },

    Clients { stoken: u64 },
    ClientsReply { ids: Vec<u64> },
    ClientQuery { id: u64, stoken: u64 },
    ClientQueryReply { found: bool, info: Option<AgentInfo> },

    ProxyRequest {
        max_targets: i32,
        program: BuiltProgram,
        issued_on: i64,
        expires_on: i64,
        payload: Packet,
        stoken: u64,
    },
    ProxyReply {
        relayed_to: Vec<u64>,
    },
    FetchProxyRequest {
        from: i64,
        to: i64,
    },
    ProxyPayload(Packet),
    FetchProxyReply,

    BadRequest(String),
    Internal(String),
    Unsigned,
}

impl Message {
    /// This message's wire tag (§4.2 bit layout `r ccc iiii iiii`).
    pub fn wire_tag(&self) -> u16 {
        use tags::*;
        match self {
            Message::Ping { .. } => PING,
            Message::PingReply { .. } => PING_REPLY,
            Message::SignedPing { .. } => SIGNED_PING,
            Message::SignedPingReply { .. } => SIGNED_PING_REPLY,
            Message::Handshake { .. } => HANDSHAKE,
            Message::HandshakeReply { .. } => HANDSHAKE_REPLY,
            Message::TokenRequest => TOKEN_REQUEST,
            Message::Token { .. } => TOKEN,
            Message::Clients { .. } => CLIENTS,
            Message::ClientsReply { .. } => CLIENTS_REPLY,
            Message::ClientQuery { .. } => CLIENT_QUERY,
            Message::ClientQueryReply { .. } => CLIENT_QUERY_REPLY,
            Message::ProxyRequest { .. } => PROXY_REQUEST,
            Message::ProxyReply { .. } => PROXY_REPLY,
            Message::FetchProxyRequest { .. } => FETCH_PROXY_REQUEST,
            Message::ProxyPayload(_) => PROXY_PAYLOAD,
            Message::FetchProxyReply => FETCH_PROXY_REPLY,
            Message::BadRequest(_) => BAD_REQUEST,
            Message::Internal(_) => INTERNAL,
            Message::Unsigned => UNSIGNED,
        }
    }

    /// A short debug name, independent of the wire tag, for logging.
    pub fn command_name(&self) -> &'static str {
        match self {
            Message::Ping { .. } => "Ping",
            Message::PingReply { .. } => "PingReply",
            Message::SignedPing { .. } => "SignedPing",
            Message::SignedPingReply { .. } => "SignedPingReply",
            Message::Handshake { .. } => "Handshake",
            Message::HandshakeReply { .. } => "HandshakeReply",
            Message::TokenRequest => "TokenRequest",
            Message::Token { .. } => "Token",
            Message::Clients { .. } => "Clients",
            Message::ClientsReply { .. } => "ClientsReply",
            Message::ClientQuery { .. } => "ClientQuery",
            Message::ClientQueryReply { .. } => "ClientQueryReply",
            Message::ProxyRequest { .. } => "ProxyRequest",
            Message::ProxyReply { .. } => "ProxyReply",
            Message::FetchProxyRequest { .. } => "FetchProxyRequest",
            Message::ProxyPayload(_) => "ProxyPayload",
            Message::FetchProxyReply => "FetchProxyReply",
            Message::BadRequest(_) => "BadRequest",
            Message::Internal(_) => "Internal",
            Message::Unsigned => "Unsigned",
        }
    }

    /// True for request variants the catalog requires a valid signature and
    /// signature token on (§4.2 "Signed-requiring messages").
    pub fn requires_signature(&self) -> bool {
        matches!(
            self,
            Message::SignedPing { .. }
                | Message::Clients { .. }
                | Message::ClientQuery { .. }
                | Message::ProxyRequest { .. }
        )
    }

    /// The signature token a signed-requiring message carries, for the hub to
    /// compare against the session's current token (§4.2, §4.5).
    pub fn signature_token(&self) -> Option<u64> {
        match self {
            Message::SignedPing { stoken, .. } => Some(*stoken),
            Message::Clients { stoken } => Some(*stoken),
            Message::ClientQuery { stoken, .. } => Some(*stoken),
            Message::ProxyRequest { stoken, .. } => Some(*stoken),
            _ => None,
        }
    }

    fn write_body(&self, out: &mut Vec<u8>) {
        match self {
            Message::Ping { token } | Message::PingReply { token } => {
                out.extend_from_slice(&token.to_le_bytes());
            }
            Message::SignedPing { ptoken, stoken } => {
                out.extend_from_slice(&ptoken.to_le_bytes());
                out.extend_from_slice(&stoken.to_le_bytes());
            }
            Message::SignedPingReply { ptoken } => {
                out.extend_from_slice(&ptoken.to_le_bytes());
            }
            Message::Handshake { facts } => facts.write(out),
            Message::HandshakeReply { id } => out.extend_from_slice(&id.to_le_bytes()),
            Message::TokenRequest => {}
            Message::Token { token } => out.extend_from_slice(&token.to_le_bytes()),
            Message::Clients { stoken } => out.extend_from_slice(&stoken.to_le_bytes()),
            Message::ClientsReply { ids } => {
                out.extend_from_slice(&(ids.len() as u32).to_le_bytes());
                for id in ids {
                    out.extend_from_slice(&id.to_le_bytes());
                }
            }
            Message::ClientQuery { id, stoken } => {
                out.extend_from_slice(&id.to_le_bytes());
                out.extend_from_slice(&stoken.to_le_bytes());
            }
            Message::ClientQueryReply { found, info } => {
                out.push(*found as u8);
                if let Some(info) = info {
                    out.extend_from_slice(&info.id.to_le_bytes());
                    write_string(out, &info.address);
                    info.facts.write(out);
                }
            }
            Message::ProxyRequest {
                max_targets,
                program,
                issued_on,
                expires_on,
                payload,
                stoken,
            } => {
                out.extend_from_slice(&max_targets.to_le_bytes());
                let program_bytes = program.serialize();
                out.extend_from_slice(&(program_bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(&program_bytes);
                out.extend_from_slice(&issued_on.to_le_bytes());
                out.extend_from_slice(&expires_on.to_le_bytes());
                write_packet(out, payload);
                out.extend_from_slice(&stoken.to_le_bytes());
            }
            Message::ProxyReply { relayed_to } => {
                out.extend_from_slice(&(relayed_to.len() as u32).to_le_bytes());
                for id in relayed_to {
                    out.extend_from_slice(&id.to_le_bytes());
                }
            }
            Message::FetchProxyRequest { from, to } => {
                out.extend_from_slice(&from.to_le_bytes());
                out.extend_from_slice(&to.to_le_bytes());
            }
            Message::ProxyPayload(packet) => write_packet(out, packet),
            Message::FetchProxyReply => {}
            Message::BadRequest(reason) | Message::Internal(reason) => write_string(out, reason),
            Message::Unsigned => {}
        }
    }

    /// Serializes this message as `uvarint(tag) || body` (§6).
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_uvarint(&mut out, self.wire_tag() as u64);
        self.write_body(&mut out);
        out
    }

    /// Parses a message from a buffer containing exactly one serialized
    /// message. Unknown tags are a hard error (§4.2 "the catalog is closed").
    pub fn deserialize(buf: &[u8]) -> Result<Self, MessageError> {
        let (raw_tag, consumed) = read_uvarint(buf)?;
        let wire_tag = u16::try_from(raw_tag).map_err(|_| MessageError::UnknownTag(u16::MAX))?;
        let mut pos = consumed;
        let body = buf;
        let pos_ref = &mut pos;

        use tags::*;
        Ok(match wire_tag {
            PING => Message::Ping {
                token: read_i32(body, pos_ref)?,
            },
            PING_REPLY => Message::PingReply {
                token: read_i32(body, pos_ref)?,
            },
            SIGNED_PING => Message::SignedPing {
                ptoken: read_i32(body, pos_ref)?,
                stoken: read_u64(body, pos_ref)?,
            },
            SIGNED_PING_REPLY => Message::SignedPingReply {
                ptoken: read_i32(body, pos_ref)?,
            },
            HANDSHAKE => Message::Handshake {
                facts: SystemFacts::read(body, pos_ref)?,
            },
            HANDSHAKE_REPLY => Message::HandshakeReply {
                id: read_u64(body, pos_ref)?,
            },
            TOKEN_REQUEST => Message::TokenRequest,
            TOKEN => Message::Token {
                token: read_u64(body, pos_ref)?,
            },
            CLIENTS => Message::Clients {
                stoken: read_u64(body, pos_ref)?,
            },
            CLIENTS_REPLY => {
                let count = read_u32(body, pos_ref)? as usize;
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    ids.push(read_u64(body, pos_ref)?);
                }
                Message::ClientsReply { ids }
            }
            CLIENT_QUERY => Message::ClientQuery {
                id: read_u64(body, pos_ref)?,
                stoken: read_u64(body, pos_ref)?,
            },
            CLIENT_QUERY_REPLY => {
                let found = read_u8(body, pos_ref)? != 0;
                let info = if found {
                    let id = read_u64(body, pos_ref)?;
                    let address = read_string(body, pos_ref)?;
                    let facts = SystemFacts::read(body, pos_ref)?;
                    Some(AgentInfo { id, address, facts })
                } else {
                    None
                };
                Message::ClientQueryReply { found, info }
            }
            PROXY_REQUEST => {
                let max_targets = read_i32(body, pos_ref)?;
                let program_len = read_u32(body, pos_ref)? as usize;
                let program_bytes = read_slice(body, pos_ref, program_len)?;
                let program = BuiltProgram::deserialize(program_bytes)?;
                let issued_on = read_i64(body, pos_ref)?;
                let expires_on = read_i64(body, pos_ref)?;
                let payload = read_packet(body, pos_ref)?;
                let stoken = read_u64(body, pos_ref)?;
                Message::ProxyRequest {
                    max_targets,
                    program,
                    issued_on,
                    expires_on,
                    payload,
                    stoken,
                }
            }
            PROXY_REPLY => {
                let count = read_u32(body, pos_ref)? as usize;
                let mut relayed_to = Vec::with_capacity(count);
                for _ in 0..count {
                    relayed_to.push(read_u64(body, pos_ref)?);
                }
                Message::ProxyReply { relayed_to }
            }
            FETCH_PROXY_REQUEST => Message::FetchProxyRequest {
                from: read_i64(body, pos_ref)?,
                to: read_i64(body, pos_ref)?,
            },
            PROXY_PAYLOAD => Message::ProxyPayload(read_packet(body, pos_ref)?),
            FETCH_PROXY_REPLY => Message::FetchProxyReply,
            BAD_REQUEST => Message::BadRequest(read_string(body, pos_ref)?),
            INTERNAL => Message::Internal(read_string(body, pos_ref)?),
            UNSIGNED => Message::Unsigned,
            other => return Err(MessageError::UnknownTag(other)),
        })
    }
}

fn write_packet(out: &mut Vec<u8>, packet: &Packet) {
    out.push(packet.alg as u8);
    out.extend_from_slice(&(packet.signature.len() as u32).to_le_bytes());
    out.extend_from_slice(&packet.signature);
    out.extend_from_slice(&(packet.payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&packet.payload);
}

fn read_packet(buf: &[u8], pos: &mut usize) -> Result<Packet, MessageError> {
    let alg_raw = read_u8(buf, pos)?;
    let alg = crate::crypto::SigAlg::try_from(alg_raw).map_err(FrameError::from)?;
    let sig_len = read_u32(buf, pos)? as usize;
    let signature = read_slice(buf, pos, sig_len)?.to_vec();
    let payload_len = read_u32(buf, pos)? as usize;
    let payload = read_slice(buf, pos, payload_len)?.to_vec();
    Ok(Packet::presigned(alg, signature, payload)?)
}

fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8, MessageError> {
    let byte = *buf.get(*pos).ok_or(MessageError::Facts(FactsError::Eof))?;
    *pos += 1;
    Ok(byte)
}

fn read_i32(buf: &[u8], pos: &mut usize) -> Result<i32, MessageError> {
    Ok(i32::from_le_bytes(read_bytes::<4>(buf, pos)?))
}

fn read_slice<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], MessageError> {
    let end = pos.checked_add(len).ok_or(FactsError::Eof)?;
    let slice = buf.get(*pos..end).ok_or(FactsError::Eof)?;
    *pos = end;
    Ok(slice)
}

/// Looks up the well-known reserved names for a predicate, for callers that
/// want to pre-validate an operator's program before sending it. Not used by
/// the catalog itself; kept alongside for symmetry with [`crate::facts`].
pub fn known_reserved_names() -> &'static [&'static str] {
    &["rt_cpu", "cpuid_cpu", "goos", "hostname", "username", "address"]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::compile;

    fn sample_program() -> BuiltProgram {
        compile("CNAMED_rt_cpu 1 CMP >=").unwrap()
    }

    fn round_trip(msg: Message) {
        let wire = msg.serialize();
        let decoded = Message::deserialize(&wire).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(Message::Ping { token: 7 });
        round_trip(Message::PingReply { token: 7 });
        round_trip(Message::SignedPing { ptoken: 1, stoken: 2 });
        round_trip(Message::SignedPingReply { ptoken: 1 });
        round_trip(Message::Handshake {
            facts: SystemFacts {
                num_cpu: 4,
                cpuid_cpu: 4,
                goos: "linux".into(),
                arch: "amd64".into(),
                hostname: "h".into(),
                username: "u".into(),
                home_dir: "/root".into(),
                exec_path: "/bin/a".into(),
                features: 3,
            },
        });
        round_trip(Message::HandshakeReply { id: 42 });
        round_trip(Message::TokenRequest);
        round_trip(Message::Token { token: 99 });
        round_trip(Message::Clients { stoken: 0 });
        round_trip(Message::ClientsReply { ids: vec![1, 2, 3] });
        round_trip(Message::ClientQuery { id: 5, stoken: 0 });
        round_trip(Message::ClientQueryReply { found: false, info: None });
        round_trip(Message::ProxyReply { relayed_to: vec![1] });
        round_trip(Message::FetchProxyRequest { from: 0, to: 100 });
        round_trip(Message::ProxyPayload(Packet::unsigned(b"hi".to_vec())));
        round_trip(Message::FetchProxyReply);
        round_trip(Message::BadRequest("nope".into()));
        round_trip(Message::Internal("boom".into()));
        round_trip(Message::Unsigned);
        round_trip(Message::ProxyRequest {
            max_targets: 0,
            program: sample_program(),
            issued_on: 10,
            expires_on: 20,
            payload: Packet::unsigned(b"payload".to_vec()),
            stoken: 123,
        });
    }

    #[test]
    fn reply_bit_distinguishes_request_from_reply_same_ordinal() {
        let request = Message::Handshake {
            facts: SystemFacts::default(),
        };
        let reply = Message::HandshakeReply { id: 1 };
        assert_ne!(request.wire_tag(), reply.wire_tag());
        assert_eq!(request.wire_tag() & !REPLY_BIT, reply.wire_tag() & !REPLY_BIT);
        assert_eq!(reply.wire_tag() & REPLY_BIT, REPLY_BIT);
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let mut buf = Vec::new();
        write_uvarint(&mut buf, 0x0fff);
        assert!(matches!(
            Message::deserialize(&buf),
            Err(MessageError::UnknownTag(0x0fff))
        ));
    }

    #[test]
    fn signed_requiring_messages_match_the_catalog() {
        assert!(Message::Clients { stoken: 0 }.requires_signature());
        assert!(Message::ClientQuery { id: 1, stoken: 0 }.requires_signature());
        assert!(Message::SignedPing { ptoken: 0, stoken: 0 }.requires_signature());
        assert!(!Message::Ping { token: 0 }.requires_signature());
    }

    #[test]
    fn known_reserved_names_matches_the_catalog() {
        assert_eq!(known_reserved_names().len(), 6);
    }
}
