//! The peer-wire protocol (BEP 3): the one-shot handshake and the
//! length-prefixed message stream that follows it.
//!
//! The split between [`handshake`] and [`message`] mirrors the two-phase
//! shape of a real connection: a `Framed<TcpStream, HandshakeCodec>` is used
//! once, then its parts are handed to [`tokio_util::codec::Framed::from_parts`]
//! to build a `Framed<TcpStream, MessageCodec>` without losing any bytes the
//! peer already sent ahead of our read.

pub mod handshake;
pub mod message;

pub use handshake::{decode_handshake, encode_handshake, HandshakeCodec, HANDSHAKE_LEN};
pub use message::{try_parse_next, Message, MessageCodec, MessageId, ParsedFrame};
