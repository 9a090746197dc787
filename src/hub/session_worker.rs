//! Per-connection session handling (§4.5 "Session worker per connection").

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::message::{AgentInfo, Message};
use crate::session::Session;
use crate::vm::{link, Value};

use super::commandlog::CommandRecord;
use super::registry::AgentRecord;
use super::Hub;

/// Per-connection state exclusive to the worker task bound to it (§3
/// "Session state"): the current anti-replay token and, once handshaken,
/// the agent identifier this connection owns.
struct SessionState {
    token: u64,
    agent_id: Option<u64>,
}

/// Drives one accepted connection to completion. Terminates (returns) on any
/// parse/validation error, a signature-token mismatch, or the peer closing
/// the stream (§4.5 "Failure semantics").
pub async fn run<S: AsyncRead + AsyncWrite + Unpin>(hub: &Hub, stream: S, peer_addr: String) {
    let mut session = Session::new(stream);
    let mut state = SessionState {
        token: rand::thread_rng().next_u64(),
        agent_id: None,
    };

    loop {
        let packet = match session.read_packet().await {
            Ok(packet) => packet,
            Err(err) => {
                info!(peer = %peer_addr, error = %err, "session ended");
                break;
            }
        };
        let message = match Message::deserialize(&packet.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(peer = %peer_addr, error = %err, "malformed message, terminating session");
                break;
            }
        };

        if message.requires_signature() {
            if packet.verify(&hub.operator_trust).is_err() {
                warn!(peer = %peer_addr, "unverified signature, terminating session");
                let _ = session.write_message(&Message::Unsigned).await;
                break;
            }
            let stoken = message.signature_token().expect("checked by requires_signature");
            if stoken != state.token {
                warn!(peer = %peer_addr, "signature token mismatch, terminating session");
                let _ = session.write_message(&Message::BadRequest("bad token".into())).await;
                break; // property 10: token is NOT rotated on a rejected request
            }
            state.token = rand::thread_rng().next_u64();
        }

        let reply = match dispatch(hub, &mut state, &peer_addr, &mut session, message).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(peer = %peer_addr, error = %err, "handler failed, terminating session");
                break;
            }
        };
        if let Some(reply) = reply
            && session.write_message(&reply).await.is_err()
        {
            break;
        }
    }

    if let Some(id) = state.agent_id {
        hub.registry.mark_done(id).await;
    }
}

async fn dispatch<S: AsyncRead + AsyncWrite + Unpin>(
    hub: &Hub,
    state: &mut SessionState,
    peer_addr: &str,
    session: &mut Session<S>,
    message: Message,
) -> Result<Option<Message>, crate::session::SessionError> {
    Ok(Some(match message {
        Message::Ping { token } => Message::PingReply { token },
        Message::SignedPing { ptoken, .. } => Message::SignedPingReply { ptoken },

        Message::Handshake { facts } => {
            let id = hub.registry.allocate_new(peer_addr.to_string(), facts).await;
            state.agent_id = Some(id);
            Message::HandshakeReply { id }
        }
        Message::TokenRequest => Message::Token { token: state.token },

        Message::Clients { .. } => Message::ClientsReply {
            ids: hub.registry.list_ids().await,
        },
        Message::ClientQuery { id, .. } => match hub.registry.get(id).await {
            Some(record) => Message::ClientQueryReply {
                found: true,
                info: Some(AgentInfo {
                    id: record.id,
                    address: record.address,
                    facts: record.facts,
                }),
            },
            None => Message::ClientQueryReply {
                found: false,
                info: None,
            },
        },

        Message::ProxyRequest {
            max_targets,
            program,
            issued_on,
            expires_on,
            payload,
            ..
        } => {
            // Delivery happens exclusively through an agent's own
            // `FetchProxyRequest` poll (§4.5 "Agent fetch path"); inserting a
            // command never pushes it to anyone, so nothing is relayed yet.
            let command_id = hub
                .commands
                .insert(CommandRecord {
                    id: 0,
                    program,
                    issued_on,
                    expires_on,
                    payload,
                    max_targets,
                })
                .await;
            Message::ProxyReply {
                relayed_to: hub.commands.delivered_to(command_id).await,
            }
        }

        Message::FetchProxyRequest { from, to } => {
            let Some(agent_id) = state.agent_id else {
                return Ok(Some(Message::BadRequest(
                    "FetchProxyRequest before Handshake".into(),
                )));
            };
            let Some(agent) = hub.registry.get(agent_id).await else {
                return Ok(Some(Message::FetchProxyReply));
            };
            let now = crate::time::now_millis();
            let candidates = hub.commands.scan_candidates(from, to, now).await;
            for command in candidates {
                // Property 9 (§8): a command with `expires_on <= now` is never
                // delivered, independent of whether the periodic GC has swept it
                // yet (§4.5 "Command record ... removed when `now >= expires_at`").
                if command.expires_on <= now {
                    continue;
                }
                if !hub.commands.may_deliver(command.id, command.max_targets, agent.id).await {
                    continue;
                }
                if !predicate_matches(&command.program, &agent) {
                    continue;
                }
                hub.commands.record_delivery(command.id, agent.id).await;
                session.write_message(&Message::ProxyPayload(command.payload)).await?;
            }
            Message::FetchProxyReply
        }

        // Replies and errors are never dispatched as requests.
        other => Message::BadRequest(format!("unexpected request {}", other.command_name())),
    }))
}

/// Links `program` against `agent`'s facts and runs it to a boolean verdict,
/// skipping (returning `false`) on any link or execution failure, or on a
/// non-boolean final value (§4.5 "Any predicate link/execute failure ...
/// skips that agent"; §9 open question: non-boolean verdict skips).
fn predicate_matches(program: &crate::vm::BuiltProgram, agent: &AgentRecord) -> bool {
    let facts = agent.facts.to_reserved_map(&agent.address);
    let linked = match link(program, &facts) {
        Ok(linked) => linked,
        Err(_) => return false,
    };
    matches!(crate::vm::execute(&linked), Ok(Value::Bool(true)))
}
