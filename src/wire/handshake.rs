//! The fixed 68-byte handshake that precedes all peer-wire traffic
//! (BEP 3: <https://www.bittorrent.org/beps/bep_0003.html>).
//!
//! `encode_handshake`/`decode_handshake` are pure: no I/O, no buffering
//! state, just byte layout. [`HandshakeCodec`] is the thin `tokio_util`
//! adapter that waits for exactly [`HANDSHAKE_LEN`] bytes to arrive before
//! handing them to the caller, who then calls `decode_handshake` with the
//! infohash it expects to see.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::{PeerId, Sha1Hash};

/// The protocol string identifying this as a BitTorrent v1 handshake.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The length in bytes of a full handshake.
pub const HANDSHAKE_LEN: usize = 68;

/// Builds the 68-byte handshake we send to a peer.
///
/// Layout: `pstrlen (1) | pstr (19) | reserved (8, zero) | infohash (20) |
/// peer_id (20)`. The reserved bytes announce no extensions; this engine
/// speaks base BitTorrent v1 only.
pub fn encode_handshake(info_hash: &Sha1Hash, peer_id: &PeerId) -> [u8; HANDSHAKE_LEN] {
    let mut buf = [0u8; HANDSHAKE_LEN];
    buf[0] = PROTOCOL_STRING.len() as u8;
    buf[1..20].copy_from_slice(PROTOCOL_STRING.as_bytes());
    // buf[20..28] stays zeroed: no extensions are advertised.
    buf[28..48].copy_from_slice(info_hash);
    buf[48..68].copy_from_slice(peer_id);
    buf
}

/// Validates a peer's handshake and extracts its peer id.
///
/// The reserved extension-flag bytes are read by nobody: this engine has no
/// extensions to negotiate, so it ignores them regardless of what the peer
/// sets.
pub fn decode_handshake(buf: &[u8; HANDSHAKE_LEN], expected_info_hash: &Sha1Hash) -> Result<PeerId, Error> {
    let pstrlen = buf[0] as usize;
    if pstrlen != PROTOCOL_STRING.len() || &buf[1..1 + pstrlen] != PROTOCOL_STRING.as_bytes() {
        return Err(Error::MalformedHandshake);
    }
    if &buf[28..48] != expected_info_hash {
        return Err(Error::HandshakeMismatch);
    }
    let mut peer_id = [0u8; 20];
    peer_id.copy_from_slice(&buf[48..68]);
    Ok(peer_id)
}

/// Frames the fixed-size handshake exchange. Carries no semantic knowledge
/// of infohashes or peer ids; it just waits for 68 bytes to arrive and
/// hands them back raw, leaving interpretation to [`decode_handshake`].
#[derive(Debug, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = [u8; HANDSHAKE_LEN];
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Self::Item>> {
        if src.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf.copy_from_slice(&src[..HANDSHAKE_LEN]);
        src.advance(HANDSHAKE_LEN);
        Ok(Some(buf))
    }
}

impl Encoder<[u8; HANDSHAKE_LEN]> for HandshakeCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: [u8; HANDSHAKE_LEN], dst: &mut BytesMut) -> std::io::Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_well_formed_handshake() {
        let info_hash = [7u8; 20];
        let peer_id = [9u8; 20];
        let buf = encode_handshake(&info_hash, &peer_id);
        let decoded = decode_handshake(&buf, &info_hash).unwrap();
        assert_eq!(decoded, peer_id);
    }

    #[test]
    fn rejects_wrong_protocol_string() {
        let mut buf = encode_handshake(&[1u8; 20], &[2u8; 20]);
        buf[1] = b'X';
        let err = decode_handshake(&buf, &[1u8; 20]).unwrap_err();
        assert!(matches!(err, Error::MalformedHandshake));
    }

    #[test]
    fn rejects_mismatched_info_hash() {
        let buf = encode_handshake(&[1u8; 20], &[2u8; 20]);
        let err = decode_handshake(&buf, &[9u8; 20]).unwrap_err();
        assert!(matches!(err, Error::HandshakeMismatch));
    }

    #[test]
    fn codec_waits_for_the_full_68_bytes() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::from(&encode_handshake(&[1u8; 20], &[2u8; 20])[..67]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[0u8]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }
}
