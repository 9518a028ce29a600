//! The length-prefixed peer-wire message set (BEP 3) and its framing.
//!
//! [`try_parse_next`] is the pure framing parser: given a byte slice it
//! answers "is there a complete frame at the front, and if so, how many
//! bytes does it occupy and what is its raw id/payload" without looking at
//! socket state, without allocating, and without knowing what the payload
//! means. [`MessageCodec`] is the impure `tokio_util` adapter built on top
//! of it: it owns the declared-length sanity cap and the torrent's piece
//! count (needed to validate an incoming BITFIELD's padding), and turns raw
//! frames into typed [`Message`] values.
//!
//! Per the design, an unrecognized message id is not a protocol error: it
//! is logged and the frame is skipped, so a peer speaking a BEP extension
//! this engine doesn't implement doesn't tank the session.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::{Bitfield, BlockInfo, PieceIndex};

/// A message id as it appears on the wire, one byte following the 4-byte
/// length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            _ => return Err(()),
        })
    }
}

/// A single peer-wire protocol message, decoded from its wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece { piece_index: PieceIndex, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    /// Serializes this message to its length-prefixed wire form.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => 0u32.to_be_bytes().to_vec(),
            Self::Choke => frame(MessageId::Choke as u8, &[]),
            Self::Unchoke => frame(MessageId::Unchoke as u8, &[]),
            Self::Interested => frame(MessageId::Interested as u8, &[]),
            Self::NotInterested => frame(MessageId::NotInterested as u8, &[]),
            Self::Have { piece_index } => {
                frame(MessageId::Have as u8, &(*piece_index as u32).to_be_bytes())
            }
            Self::Bitfield(bits) => {
                let mut padded = bits.clone();
                let pad = (8 - (padded.len() % 8)) % 8;
                padded.extend(std::iter::repeat(false).take(pad));
                frame(MessageId::Bitfield as u8, padded.as_raw_slice())
            }
            Self::Request(block) => frame(MessageId::Request as u8, &encode_block(block)),
            Self::Cancel(block) => frame(MessageId::Cancel as u8, &encode_block(block)),
            Self::Piece { piece_index, offset, data } => {
                let mut payload = Vec::with_capacity(8 + data.len());
                payload.extend_from_slice(&(*piece_index as u32).to_be_bytes());
                payload.extend_from_slice(&offset.to_be_bytes());
                payload.extend_from_slice(data);
                frame(MessageId::Piece as u8, &payload)
            }
        }
    }

    /// Interprets a raw id and payload, as produced by [`try_parse_next`],
    /// in the context of a torrent with `piece_count` pieces.
    fn from_raw(id: MessageId, payload: &[u8], piece_count: usize) -> Result<Self, Error> {
        match id {
            MessageId::Choke => Ok(Self::Choke),
            MessageId::Unchoke => Ok(Self::Unchoke),
            MessageId::Interested => Ok(Self::Interested),
            MessageId::NotInterested => Ok(Self::NotInterested),
            MessageId::Have => {
                if payload.len() != 4 {
                    return Err(Error::Protocol("have payload is not 4 bytes".into()));
                }
                let piece_index = u32::from_be_bytes(payload.try_into().unwrap()) as PieceIndex;
                Ok(Self::Have { piece_index })
            }
            MessageId::Bitfield => {
                let expected_bytes = (piece_count + 7) / 8;
                if payload.len() != expected_bytes {
                    return Err(Error::MalformedBitfield);
                }
                let mut bits = Bitfield::from_vec(payload.to_vec());
                if bits.iter().skip(piece_count).any(|bit| *bit) {
                    return Err(Error::MalformedBitfield);
                }
                bits.truncate(piece_count);
                Ok(Self::Bitfield(bits))
            }
            MessageId::Request => Ok(Self::Request(decode_block(payload)?)),
            MessageId::Cancel => Ok(Self::Cancel(decode_block(payload)?)),
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(Error::Protocol("piece payload shorter than 8 bytes".into()));
                }
                let piece_index = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as PieceIndex;
                let offset = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                Ok(Self::Piece { piece_index, offset, data: payload[8..].to_vec() })
            }
        }
    }
}

fn encode_block(block: &BlockInfo) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&(block.piece_index as u32).to_be_bytes());
    buf[4..8].copy_from_slice(&block.offset.to_be_bytes());
    buf[8..12].copy_from_slice(&block.len.to_be_bytes());
    buf
}

fn decode_block(payload: &[u8]) -> Result<BlockInfo, Error> {
    if payload.len() != 12 {
        return Err(Error::Protocol("request/cancel payload is not 12 bytes".into()));
    }
    let piece_index = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as PieceIndex;
    let offset = u32::from_be_bytes(payload[4..8].try_into().unwrap());
    let len = u32::from_be_bytes(payload[8..12].try_into().unwrap());
    Ok(BlockInfo { piece_index, offset, len })
}

fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let len = 1 + payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.push(id);
    buf.extend_from_slice(payload);
    buf
}

/// A single parsed frame at the front of a buffer: the raw message id (or
/// `None` for a keep-alive), its payload, and the number of bytes the whole
/// frame (length prefix included) occupies.
#[derive(Debug)]
pub struct ParsedFrame<'a> {
    pub id: Option<u8>,
    pub payload: &'a [u8],
    pub consumed: usize,
}

/// The pure framing parser: no I/O, no allocation, no interpretation of
/// what a message id means. Returns `None` iff fewer than 4 bytes are
/// buffered, or the declared frame is not yet fully buffered.
pub fn try_parse_next(buf: &[u8]) -> Option<ParsedFrame<'_>> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 {
        return Some(ParsedFrame { id: None, payload: &buf[4..4], consumed: 4 });
    }
    if buf.len() < 4 + len {
        return None;
    }
    Some(ParsedFrame { id: Some(buf[4]), payload: &buf[5..4 + len], consumed: 4 + len })
}

/// The impure `tokio_util` adapter: reads length-prefixed frames off a
/// socket buffer, rejects frames whose declared length exceeds
/// `max_frame_len` outright (rather than waiting to buffer an attacker's
/// multi-gigabyte claim), and otherwise defers to [`try_parse_next`] and
/// [`Message::from_raw`].
pub struct MessageCodec {
    max_frame_len: u32,
    piece_count: usize,
}

impl MessageCodec {
    pub fn new(max_frame_len: u32, piece_count: usize) -> Self {
        Self { max_frame_len, piece_count }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            if len > self.max_frame_len {
                return Err(Error::Protocol(format!(
                    "declared frame length {len} exceeds cap {}",
                    self.max_frame_len
                )));
            }

            let (id, payload, consumed) = match try_parse_next(src) {
                None => {
                    src.reserve(4 + len as usize - src.len());
                    return Ok(None);
                }
                Some(frame) => (frame.id, frame.payload.to_vec(), frame.consumed),
            };
            src.advance(consumed);

            let raw_id = match id {
                None => return Ok(Some(Message::KeepAlive)),
                Some(raw_id) => raw_id,
            };
            match MessageId::try_from(raw_id) {
                Ok(id) => return Ok(Some(Message::from_raw(id, &payload, self.piece_count)?)),
                Err(()) => {
                    log::warn!("peer sent unrecognized message id {raw_id}, skipping");
                    continue;
                }
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.encode());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_keep_alive() {
        let buf = [0u8, 0, 0, 0];
        let frame = try_parse_next(&buf).unwrap();
        assert_eq!(frame.id, None);
        assert_eq!(frame.consumed, 4);
    }

    #[test]
    fn waits_for_a_partially_buffered_frame() {
        let full = Message::Have { piece_index: 3 }.encode();
        assert!(try_parse_next(&full[..full.len() - 1]).is_none());
        let frame = try_parse_next(&full).unwrap();
        assert_eq!(frame.consumed, full.len());
    }

    #[test]
    fn round_trips_have() {
        let encoded = Message::Have { piece_index: 9 }.encode();
        let frame = try_parse_next(&encoded).unwrap();
        let decoded = Message::from_raw(MessageId::try_from(frame.id.unwrap()).unwrap(), frame.payload, 20).unwrap();
        assert_eq!(decoded, Message::Have { piece_index: 9 });
    }

    #[test]
    fn round_trips_request_and_cancel() {
        let block = BlockInfo { piece_index: 2, offset: 0x4000, len: 0x4000 };
        for msg in [Message::Request(block), Message::Cancel(block)] {
            let encoded = msg.encode();
            let frame = try_parse_next(&encoded).unwrap();
            let decoded =
                Message::from_raw(MessageId::try_from(frame.id.unwrap()).unwrap(), frame.payload, 20).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn round_trips_piece() {
        let msg = Message::Piece { piece_index: 1, offset: 0, data: vec![1, 2, 3, 4] };
        let encoded = msg.encode();
        let frame = try_parse_next(&encoded).unwrap();
        let decoded = Message::from_raw(MessageId::try_from(frame.id.unwrap()).unwrap(), frame.payload, 20).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejects_piece_payload_shorter_than_8_bytes() {
        let err = Message::from_raw(MessageId::Piece, &[0u8; 4], 20).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn rejects_bitfield_with_nonzero_padding_bits() {
        // 5 pieces needs 1 byte; set bit 7 (beyond piece 4) to 1.
        let err = Message::from_raw(MessageId::Bitfield, &[0b0000_0001], 5).unwrap_err();
        assert!(matches!(err, Error::MalformedBitfield));
    }

    #[test]
    fn accepts_well_formed_bitfield_and_truncates_padding() {
        let msg = Message::from_raw(MessageId::Bitfield, &[0b1010_0000], 3).unwrap();
        match msg {
            Message::Bitfield(bits) => {
                assert_eq!(bits.len(), 3);
                assert_eq!(bits[0], true);
                assert_eq!(bits[1], false);
                assert_eq!(bits[2], true);
            }
            _ => panic!("expected bitfield"),
        }
    }

    #[test]
    fn codec_skips_unrecognized_message_ids_and_keeps_decoding() {
        let mut codec = MessageCodec::new(1 << 16, 4);
        let mut buf = BytesMut::new();
        // an unknown id 20 with an empty payload, followed by a real UNCHOKE.
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&[20]);
        buf.extend_from_slice(&Message::Unchoke.encode());
        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(Message::Unchoke));
    }

    #[test]
    fn codec_rejects_frames_exceeding_the_cap() {
        let mut codec = MessageCodec::new(16, 4);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&1_000_000u32.to_be_bytes());
        assert!(codec.decode(&mut buf).is_err());
    }
}
