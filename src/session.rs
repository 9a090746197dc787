//! Session layer primitives (§4.6): turning a raw bidirectional byte stream
//! into typed request/reply pairs with signed-message wrappers.
//!
//! `write_message`/`read_message` are thin wrappers over the frame codec.
//! `signed_request` implements the client-side half of the signed handshake:
//! it asks the peer for its current token, embeds that token in the caller's
//! message, signs the whole thing, and reads back the reply — all under a
//! mutex so a session with multiple concurrent senders can't interleave two
//! token-request/signed-send pairs (§9 "typed SignedRequest<M> wrapper").

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

use crate::crypto::{CryptoError, Keypair, TrustRoot};
use crate::frame::{read_packet_async, write_packet_async, FrameError, Packet};
use crate::message::{Message, MessageError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("peer replied with an unexpected message tag {0:#06x}")]
    UnexpectedReply(u16),
}

/// A session bound to one bidirectional stream (§3 "Session state"). Owns the
/// stream exclusively; the token mutex only serializes this session's own
/// signed-request helper, it does not hold any hub-side bookkeeping.
pub struct Session<S> {
    stream: S,
    token_lock: Mutex<()>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            token_lock: Mutex::new(()),
        }
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), SessionError> {
        write_packet_async(&mut self.stream, packet).await?;
        Ok(())
    }

    pub async fn read_packet(&mut self) -> Result<Packet, SessionError> {
        Ok(read_packet_async(&mut self.stream).await?)
    }

    pub async fn write_message(&mut self, msg: &Message) -> Result<(), SessionError> {
        self.write_packet(&Packet::unsigned(msg.serialize())).await
    }

    pub async fn read_message(&mut self) -> Result<Message, SessionError> {
        let packet = self.read_packet().await?;
        Ok(Message::deserialize(&packet.payload)?)
    }

    /// Reads one message, failing unless its wire tag equals `expected`.
    pub async fn read_message_expecting(&mut self, expected: u16) -> Result<Message, SessionError> {
        let msg = self.read_message().await?;
        if msg.wire_tag() != expected {
            return Err(SessionError::UnexpectedReply(msg.wire_tag()));
        }
        Ok(msg)
    }

    /// Sends a signed message built from the peer's current token, and
    /// returns its reply (§4.6, §9).
    ///
    /// `build` receives the token just obtained via `TokenRequest`/`Token`
    /// and must return the fully-formed request message embedding it.
    pub async fn signed_request(
        &mut self,
        keypair: &Keypair,
        build: impl FnOnce(u64) -> Message,
    ) -> Result<Message, SessionError> {
        let _guard = self.token_lock.lock().await;
        // Operate on `self.stream` directly rather than through `self.write_message`
        // etc.: those take `&mut self`, which the borrow checker won't allow
        // while `_guard` (borrowed from `self.token_lock`) is alive.
        let stream = &mut self.stream;

        write_packet_async(stream, &Packet::unsigned(Message::TokenRequest.serialize())).await?;
        let token_packet = read_packet_async(stream).await?;
        let token = match Message::deserialize(&token_packet.payload)? {
            Message::Token { token } => token,
            other => return Err(SessionError::UnexpectedReply(other.wire_tag())),
        };

        let request = build(token);
        let packet = Packet::signed(keypair, request.serialize());
        write_packet_async(stream, &packet).await?;

        let reply_packet = read_packet_async(stream).await?;
        Ok(Message::deserialize(&reply_packet.payload)?)
    }

    /// Verifies a signed packet's payload against `trust` and parses it.
    pub fn verify_and_parse(packet: &Packet, trust: &TrustRoot) -> Result<Message, SessionError> {
        packet.verify(trust)?;
        Ok(Message::deserialize(&packet.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TrustRoot;

    #[tokio::test]
    async fn write_then_read_round_trips_a_message() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = Session::new(client);
        let mut server = Session::new(server);

        client.write_message(&Message::Ping { token: 5 }).await.unwrap();
        let got = server.read_message().await.unwrap();
        assert_eq!(got, Message::Ping { token: 5 });
    }

    #[tokio::test]
    async fn read_message_expecting_rejects_mismatched_tag() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = Session::new(client);
        let mut server = Session::new(server);

        client.write_message(&Message::Ping { token: 1 }).await.unwrap();
        let err = server
            .read_message_expecting(Message::Token { token: 0 }.wire_tag())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnexpectedReply(_)));
    }

    #[tokio::test]
    async fn signed_request_embeds_the_peers_current_token_and_reads_the_reply() {
        let (client_stream, server_stream) = tokio::io::duplex(8192);
        let mut client = Session::new(client_stream);
        let mut server = Session::new(server_stream);
        let kp = Keypair::generate();
        let trust = TrustRoot::new(vec![kp.public_key()]);

        let server_task = tokio::spawn(async move {
            let req = server.read_message().await.unwrap();
            assert_eq!(req, Message::TokenRequest);
            server.write_message(&Message::Token { token: 777 }).await.unwrap();

            let packet = server.read_packet().await.unwrap();
            let msg = Session::<tokio::io::DuplexStream>::verify_and_parse(&packet, &trust).unwrap();
            match msg {
                Message::SignedPing { ptoken, stoken } => {
                    assert_eq!(ptoken, 9);
                    assert_eq!(stoken, 777);
                }
                other => panic!("unexpected message {other:?}"),
            }
            server
                .write_packet(&Packet::unsigned(Message::SignedPingReply { ptoken: 9 }.serialize()))
                .await
                .unwrap();
        });

        let reply = client
            .signed_request(&kp, |token| Message::SignedPing { ptoken: 9, stoken: token })
            .await
            .unwrap();
        assert_eq!(reply, Message::SignedPingReply { ptoken: 9 });
        server_task.await.unwrap();
    }
}
