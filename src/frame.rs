//! On-wire frame codec (§4.1).
//!
//! Header layout, little-endian:
//!
//! 1. 2 bytes of flags: bits 12-14 select the signature algorithm, bit 15 is
//!    legacy-reserved and must be zero.
//! 2. uvarint *uncompressed size* — zero means "payload is not compressed".
//! 3. uvarint *payload size on the wire*.
//! 4. exactly `alg.expected_size()` bytes of signature.
//! 5. exactly *payload size* bytes of payload.

use crate::crypto::{CryptoError, SigAlg};
use crate::varint::{read_uvarint, uvarint_len, write_uvarint, VarintError};
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::Read;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum size, in bytes, of either the compressed or uncompressed payload.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

const FLAG_ALG_SHIFT: u16 = 12;
const FLAG_ALG_MASK: u16 = 0b111 << FLAG_ALG_SHIFT;
const FLAG_LEGACY_BIT: u16 = 1 << 15;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Varint(#[from] VarintError),
    #[error("signature length {got} does not match {expected} bytes expected for this algorithm")]
    BadSignatureSize { expected: usize, got: usize },
    #[error("legacy-reserved flag bit is set")]
    BadMagic,
    #[error("uncompressed size {uncompressed} does not shrink the {payload}-byte wire payload")]
    BadCompressionDeclaration { uncompressed: u64, payload: u64 },
    #[error("declared size {0} exceeds the {MAX_PAYLOAD_SIZE}-byte limit")]
    PayloadTooLarge(u64),
    #[error("decompression produced more than the declared {0} bytes")]
    DecompressedTooLarge(u64),
    #[error("zlib decompression failed")]
    BadCompressedData,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An authenticated, optionally compressed frame carrying one message
/// payload (§3 "Packet", §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub alg: SigAlg,
    pub signature: Vec<u8>,
    /// The uncompressed message bytes. Signatures cover exactly these bytes.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Builds an unsigned packet.
    pub fn unsigned(payload: Vec<u8>) -> Self {
        Self {
            alg: SigAlg::None,
            signature: Vec::new(),
            payload,
        }
    }

    /// Builds a packet with a pre-computed signature.
    pub fn presigned(alg: SigAlg, signature: Vec<u8>, payload: Vec<u8>) -> Result<Self, FrameError> {
        let expected = alg.expected_size();
        if signature.len() != expected {
            return Err(FrameError::BadSignatureSize {
                expected,
                got: signature.len(),
            });
        }
        Ok(Self {
            alg,
            signature,
            payload,
        })
    }

    /// Builds a packet by signing `payload` on demand with `keypair`.
    pub fn signed(keypair: &crate::crypto::Keypair, payload: Vec<u8>) -> Self {
        let signature = keypair.sign(&payload);
        Self {
            alg: SigAlg::Ed25519,
            signature,
            payload,
        }
    }

    /// Verifies this packet's signature against `trust`, per §4.1/§4.3.
    pub fn verify(&self, trust: &crate::crypto::TrustRoot) -> Result<(), CryptoError> {
        match self.alg {
            SigAlg::None => {
                if self.signature.is_empty() {
                    Err(CryptoError::UnsignedButRequired)
                } else {
                    Err(CryptoError::BadSignatureSize {
                        alg: SigAlg::None,
                        expected: 0,
                        got: self.signature.len(),
                    })
                }
            }
            SigAlg::Ed25519 => trust.verify_any(&self.payload, &self.signature),
        }
    }
}

/// Attempts zlib compression, keeping the compressed form only if strictly
/// shorter than the original (§4.1 compression policy).
fn maybe_compress(payload: &[u8]) -> (u64 /* uncompressed_size */, Vec<u8> /* wire bytes */) {
    let mut encoder = ZlibEncoder::new(payload, Compression::default());
    let mut compressed = Vec::new();
    if encoder.read_to_end(&mut compressed).is_ok() && compressed.len() < payload.len() {
        (payload.len() as u64, compressed)
    } else {
        (0, payload.to_vec())
    }
}

fn decompress_capped(wire: &[u8], uncompressed_size: u64) -> Result<Vec<u8>, FrameError> {
    let cap = uncompressed_size
        .checked_add(1)
        .ok_or(FrameError::PayloadTooLarge(uncompressed_size))?;
    let mut decoder = ZlibDecoder::new(wire).take(cap);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| FrameError::BadCompressedData)?;
    if out.len() as u64 > uncompressed_size {
        return Err(FrameError::DecompressedTooLarge(uncompressed_size));
    }
    Ok(out)
}

fn validate_sizes(uncompressed_size: u64, payload_size: u64) -> Result<(), FrameError> {
    if payload_size > MAX_PAYLOAD_SIZE as u64 {
        return Err(FrameError::PayloadTooLarge(payload_size));
    }
    if uncompressed_size > MAX_PAYLOAD_SIZE as u64 {
        return Err(FrameError::PayloadTooLarge(uncompressed_size));
    }
    if uncompressed_size != 0 && uncompressed_size <= payload_size {
        return Err(FrameError::BadCompressionDeclaration {
            uncompressed: uncompressed_size,
            payload: payload_size,
        });
    }
    Ok(())
}

/// Serializes a packet to its on-wire representation.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, FrameError> {
    let expected = packet.alg.expected_size();
    if packet.signature.len() != expected {
        return Err(FrameError::BadSignatureSize {
            expected,
            got: packet.signature.len(),
        });
    }
    if packet.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(packet.payload.len() as u64));
    }

    let (uncompressed_size, wire_payload) = maybe_compress(&packet.payload);
    validate_sizes(uncompressed_size, wire_payload.len() as u64)?;

    let flags = (u16::from(packet.alg.as_u8()) << FLAG_ALG_SHIFT) & FLAG_ALG_MASK;

    let mut out = Vec::with_capacity(
        2 + uvarint_len(uncompressed_size)
            + uvarint_len(wire_payload.len() as u64)
            + packet.signature.len()
            + wire_payload.len(),
    );
    out.extend_from_slice(&flags.to_le_bytes());
    write_uvarint(&mut out, uncompressed_size);
    write_uvarint(&mut out, wire_payload.len() as u64);
    out.extend_from_slice(&packet.signature);
    out.extend_from_slice(&wire_payload);
    Ok(out)
}

/// Parses a packet from an in-memory buffer containing exactly one frame.
pub fn decode(buf: &[u8]) -> Result<Packet, FrameError> {
    if buf.len() < 2 {
        return Err(FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    let flags = u16::from_le_bytes([buf[0], buf[1]]);
    if flags & FLAG_LEGACY_BIT != 0 {
        return Err(FrameError::BadMagic);
    }
    let alg_raw = ((flags & FLAG_ALG_MASK) >> FLAG_ALG_SHIFT) as u8;
    let alg = SigAlg::try_from(alg_raw)?;

    let mut cursor = &buf[2..];
    let (uncompressed_size, n1) = read_uvarint(cursor)?;
    cursor = &cursor[n1..];
    let (payload_size, n2) = read_uvarint(cursor)?;
    cursor = &cursor[n2..];

    validate_sizes(uncompressed_size, payload_size)?;

    let sig_size = alg.expected_size();
    if cursor.len() < sig_size {
        return Err(FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    let signature = cursor[..sig_size].to_vec();
    cursor = &cursor[sig_size..];

    let payload_size = payload_size as usize;
    if cursor.len() < payload_size {
        return Err(FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    let wire_payload = &cursor[..payload_size];

    let payload = if uncompressed_size > 0 {
        decompress_capped(wire_payload, uncompressed_size)?
    } else {
        wire_payload.to_vec()
    };

    Ok(Packet {
        alg,
        signature,
        payload,
    })
}

/// Reads one frame from an async byte stream.
pub async fn read_packet_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet, FrameError> {
    let mut flag_bytes = [0u8; 2];
    reader.read_exact(&mut flag_bytes).await?;
    let flags = u16::from_le_bytes(flag_bytes);
    if flags & FLAG_LEGACY_BIT != 0 {
        return Err(FrameError::BadMagic);
    }
    let alg_raw = ((flags & FLAG_ALG_MASK) >> FLAG_ALG_SHIFT) as u8;
    let alg = SigAlg::try_from(alg_raw)?;

    let uncompressed_size = read_uvarint_async(reader).await?;
    let payload_size = read_uvarint_async(reader).await?;
    validate_sizes(uncompressed_size, payload_size)?;

    let sig_size = alg.expected_size();
    let mut signature = vec![0u8; sig_size];
    reader.read_exact(&mut signature).await?;

    let mut wire_payload = vec![0u8; payload_size as usize];
    reader.read_exact(&mut wire_payload).await?;

    let payload = if uncompressed_size > 0 {
        decompress_capped(&wire_payload, uncompressed_size)?
    } else {
        wire_payload
    };

    Ok(Packet {
        alg,
        signature,
        payload,
    })
}

/// Writes one frame to an async byte stream.
pub async fn write_packet_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), FrameError> {
    let bytes = encode(packet)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_uvarint_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, FrameError> {
    let mut buf = Vec::with_capacity(4);
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await?;
        buf.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            break;
        }
        if buf.len() > crate::varint::MAX_VARINT_BYTES {
            return Err(FrameError::Varint(VarintError::TooLong));
        }
    }
    let (value, _) = read_uvarint(&buf)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn round_trips_unsigned_packet() {
        let packet = Packet::unsigned(b"hello world".to_vec());
        let wire = encode(&packet).unwrap();
        let decoded = decode(&wire).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn round_trips_signed_packet_and_verifies() {
        let kp = Keypair::generate();
        let packet = Packet::signed(&kp, b"issue a command".to_vec());
        let wire = encode(&packet).unwrap();
        let decoded = decode(&wire).unwrap();
        assert_eq!(packet, decoded);

        let trust = crate::crypto::TrustRoot::new(vec![kp.public_key()]);
        assert!(decoded.verify(&trust).is_ok());
    }

    #[test]
    fn large_payload_compresses_and_shrinks_wire_size() {
        let payload = vec![0u8; 100_000];
        let packet = Packet::unsigned(payload.clone());
        let wire = encode(&packet).unwrap();
        assert!(wire.len() < payload.len());
        let decoded = decode(&wire).unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn rejects_oversized_payload() {
        let packet = Packet::unsigned(vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            encode(&packet),
            Err(FrameError::PayloadTooLarge(n)) if n == (MAX_PAYLOAD_SIZE + 1) as u64
        ));
    }

    #[test]
    fn rejects_mismatched_signature_size() {
        let result = Packet::presigned(SigAlg::Ed25519, vec![0u8; 3], b"x".to_vec());
        assert!(matches!(
            result,
            Err(FrameError::BadSignatureSize { expected: 64, got: 3 })
        ));
    }

    #[test]
    fn rejects_legacy_bit() {
        let mut wire = encode(&Packet::unsigned(b"x".to_vec())).unwrap();
        wire[1] |= 0x80; // bit 15
        assert!(matches!(decode(&wire), Err(FrameError::BadMagic)));
    }

    #[test]
    fn rejects_compression_declaration_that_does_not_shrink() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u16.to_le_bytes());
        write_uvarint(&mut buf, 5); // claims uncompressed=5
        write_uvarint(&mut buf, 5); // but wire payload is also 5 bytes: no shrink
        buf.extend_from_slice(&[1, 2, 3, 4, 5]);
        assert!(matches!(
            decode(&buf),
            Err(FrameError::BadCompressionDeclaration { uncompressed: 5, payload: 5 })
        ));
    }

    #[tokio::test]
    async fn async_round_trip_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let kp = Keypair::generate();
        let packet = Packet::signed(&kp, b"fetch proxy request".to_vec());
        write_packet_async(&mut client, &packet).await.unwrap();
        let decoded = read_packet_async(&mut server).await.unwrap();
        assert_eq!(packet, decoded);
    }
}
