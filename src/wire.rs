//! Binary control protocol.
//!
//! Every message starts with a one-byte tag:
//!
//! ```text
//! 0 | 1   acknowledgement (false | true), no payload
//! 2       AddProxy    <src endpoint> <dest endpoint>
//! 3       DelProxy    <src endpoint>
//! 4       GetProxies  <count: u32> (<src endpoint> <dest endpoint>){count}
//! 5       Quit        no payload
//! ```
//!
//! An endpoint is `<host len: u32> <host: utf-8> <port: u32> <protocol: u32>`.
//! Integers are big-endian. A `GetProxies` request carries an empty list, so
//! both directions of the channel share a single decoder.
//!
//! Hosts are limited to [`MAX_HOST_LEN`] bytes in both directions, and
//! [`WireCodec`] refuses to buffer more than [`MAX_FRAME_LEN`] bytes for a
//! single message.

use std::io;
use std::str::Utf8Error;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::endpoint::{Endpoint, MAX_HOST_LEN, Mapping, Protocol};

const ACK_FALSE: u8 = 0;
const ACK_TRUE: u8 = 1;
const ADD_PROXY: u8 = 2;
const DEL_PROXY: u8 = 3;
const GET_PROXIES: u8 = 4;
const QUIT: u8 = 5;

/// Default upper bound on the encoded size of one message.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ack(bool),
    AddProxy { src: Endpoint, dest: Endpoint },
    DelProxy { src: Endpoint },
    GetProxies(Vec<Mapping>),
    Quit,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("unknown protocol identifier {0}")]
    UnknownProtocol(u32),

    #[error("port {0} is out of range")]
    PortOutOfRange(u32),

    #[error("host is {0} bytes long, the limit is {MAX}", MAX = MAX_HOST_LEN)]
    HostTooLong(usize),

    #[error("host is not valid utf-8: {0}")]
    InvalidHost(Utf8Error),

    #[error("stream ended in the middle of a message")]
    UnexpectedEof,

    #[error("{0} unexpected bytes after the message")]
    TrailingBytes(usize),

    #[error("message is larger than {limit} bytes")]
    TooLarge { limit: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Internal parse outcome that tells "need more bytes" apart from garbage.
#[derive(Debug)]
enum ParseError {
    Incomplete,
    Invalid(WireError),
}

impl From<WireError> for ParseError {
    fn from(e: WireError) -> Self {
        Self::Invalid(e)
    }
}

fn need(buf: &mut impl Buf, n: usize) -> Result<(), ParseError> {
    if buf.remaining() < n {
        Err(ParseError::Incomplete)
    } else {
        Ok(())
    }
}

fn parse_endpoint(buf: &mut impl Buf) -> Result<Endpoint, ParseError> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    if len > MAX_HOST_LEN {
        return Err(WireError::HostTooLong(len).into());
    }

    need(buf, len)?;
    let mut host = vec![0; len];
    buf.copy_to_slice(&mut host);
    let host = String::from_utf8(host).map_err(|e| WireError::InvalidHost(e.utf8_error()))?;

    need(buf, 8)?;
    let port = buf.get_u32();
    let port = u16::try_from(port).map_err(|_| WireError::PortOutOfRange(port))?;

    let protocol = buf.get_u32();
    let protocol = Protocol::from_id(protocol).ok_or(WireError::UnknownProtocol(protocol))?;

    Ok(Endpoint {
        host,
        port,
        protocol,
    })
}

fn parse(buf: &mut impl Buf) -> Result<Message, ParseError> {
    need(buf, 1)?;

    let msg = match buf.get_u8() {
        ACK_FALSE => Message::Ack(false),
        ACK_TRUE => Message::Ack(true),
        ADD_PROXY => {
            let src = parse_endpoint(buf)?;
            let dest = parse_endpoint(buf)?;
            Message::AddProxy { src, dest }
        }
        DEL_PROXY => Message::DelProxy {
            src: parse_endpoint(buf)?,
        },
        GET_PROXIES => {
            need(buf, 4)?;
            let count = buf.get_u32() as usize;

            // The count is untrusted, do not let it size the allocation.
            let mut mappings = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                let src = parse_endpoint(buf)?;
                let dest = parse_endpoint(buf)?;
                mappings.push(Mapping { src, dest });
            }

            Message::GetProxies(mappings)
        }
        QUIT => Message::Quit,
        tag => return Err(WireError::UnknownTag(tag).into()),
    };

    Ok(msg)
}

fn check_endpoint(endpoint: &Endpoint) -> Result<(), WireError> {
    let len = endpoint.host.len();
    if len > MAX_HOST_LEN {
        return Err(WireError::HostTooLong(len));
    }
    Ok(())
}

fn put_endpoint(dst: &mut BytesMut, endpoint: &Endpoint) {
    dst.put_u32(endpoint.host.len() as u32);
    dst.put_slice(endpoint.host.as_bytes());
    dst.put_u32(u32::from(endpoint.port));
    dst.put_u32(endpoint.protocol.id());
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Ack(false) => ACK_FALSE,
            Self::Ack(true) => ACK_TRUE,
            Self::AddProxy { .. } => ADD_PROXY,
            Self::DelProxy { .. } => DEL_PROXY,
            Self::GetProxies(_) => GET_PROXIES,
            Self::Quit => QUIT,
        }
    }

    /// Append the encoding of `self` to `dst`.
    ///
    /// Fails without touching `dst` if an endpoint could not be decoded back.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), WireError> {
        match self {
            Self::Ack(_) | Self::Quit => {}
            Self::AddProxy { src, dest } => {
                check_endpoint(src)?;
                check_endpoint(dest)?;
            }
            Self::DelProxy { src } => check_endpoint(src)?,
            Self::GetProxies(mappings) => {
                for Mapping { src, dest } in mappings {
                    check_endpoint(src)?;
                    check_endpoint(dest)?;
                }
            }
        }

        dst.put_u8(self.tag());

        match self {
            Self::Ack(_) | Self::Quit => {}
            Self::AddProxy { src, dest } => {
                put_endpoint(dst, src);
                put_endpoint(dst, dest);
            }
            Self::DelProxy { src } => put_endpoint(dst, src),
            Self::GetProxies(mappings) => {
                dst.put_u32(mappings.len() as u32);
                for Mapping { src, dest } in mappings {
                    put_endpoint(dst, src);
                    put_endpoint(dst, dest);
                }
            }
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<BytesMut, WireError> {
        let mut dst = BytesMut::new();
        self.encode(&mut dst)?;
        Ok(dst)
    }

    /// Decode the first message in `src`, consuming its bytes.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched if it does not hold a
    /// complete message yet.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, WireError> {
        let mut cursor = &src[..];

        match parse(&mut cursor) {
            Ok(msg) => {
                let used = src.len() - cursor.len();
                src.advance(used);
                Ok(Some(msg))
            }
            Err(ParseError::Incomplete) => Ok(None),
            Err(ParseError::Invalid(e)) => Err(e),
        }
    }

    /// Decode exactly one message from a complete buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cursor = bytes;

        match parse(&mut cursor) {
            Ok(_) if !cursor.is_empty() => Err(WireError::TrailingBytes(cursor.len())),
            Ok(msg) => Ok(msg),
            Err(ParseError::Incomplete) => Err(WireError::UnexpectedEof),
            Err(ParseError::Invalid(e)) => Err(e),
        }
    }
}

/// [`Message`] framing for `tokio_util::codec`.
#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    max_frame: usize,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_LEN)
    }

    /// A codec that gives up on messages longer than `max_frame` bytes.
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, WireError> {
        let before = src.len();

        match Message::decode(src)? {
            Some(_) if before - src.len() > self.max_frame => Err(WireError::TooLarge {
                limit: self.max_frame,
            }),
            Some(msg) => Ok(Some(msg)),
            None if src.len() > self.max_frame => Err(WireError::TooLarge {
                limit: self.max_frame,
            }),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, WireError> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => Err(WireError::UnexpectedEof),
        }
    }
}

impl Encoder<Message> for WireCodec {
    type Error = WireError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), WireError> {
        msg.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(src: Endpoint, dest: Endpoint) -> Mapping {
        Mapping { src, dest }
    }

    #[test]
    fn round_trip() {
        let messages = [
            Message::Ack(false),
            Message::Ack(true),
            Message::AddProxy {
                src: Endpoint::tcp("", 8000),
                dest: Endpoint::tcp("example.org", 80),
            },
            Message::DelProxy {
                src: Endpoint::udp("127.0.0.1", 5353),
            },
            Message::GetProxies(vec![]),
            Message::GetProxies(vec![
                mapping(Endpoint::tcp("", 8000), Endpoint::tcp("example.org", 80)),
                mapping(Endpoint::udp("::", 53), Endpoint::udp("ñandú.example", 53)),
            ]),
            Message::Quit,
        ];

        for msg in messages {
            let bytes = msg.to_bytes().unwrap();
            assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn endpoint_layout_is_big_endian() {
        let msg = Message::DelProxy {
            src: Endpoint::tcp("ab", 8000),
        };

        assert_eq!(
            &msg.to_bytes().unwrap()[..],
            &[
                3, // tag
                0, 0, 0, 2, b'a', b'b', // host
                0, 0, 0x1f, 0x40, // port
                0, 0, 0, 1, // protocol
            ]
        );
    }

    #[test]
    fn ack_is_a_single_byte() {
        assert_eq!(&Message::Ack(true).to_bytes().unwrap()[..], &[1]);
        assert_eq!(&Message::Ack(false).to_bytes().unwrap()[..], &[0]);
    }

    #[test]
    fn decode_waits_for_complete_message() {
        let full = Message::AddProxy {
            src: Endpoint::tcp("", 8000),
            dest: Endpoint::tcp("example.org", 80),
        }
        .to_bytes()
        .unwrap();

        let mut buf = BytesMut::new();
        for byte in &full[..full.len() - 1] {
            buf.put_u8(*byte);
            assert!(Message::decode(&mut buf).unwrap().is_none());
        }
        assert_eq!(buf.len(), full.len() - 1);

        buf.put_u8(full[full.len() - 1]);
        assert!(Message::decode(&mut buf).unwrap().is_some());
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_consumes_one_message_at_a_time() {
        let mut buf = BytesMut::new();
        Message::Quit.encode(&mut buf).unwrap();
        Message::Ack(true).encode(&mut buf).unwrap();

        assert_eq!(Message::decode(&mut buf).unwrap(), Some(Message::Quit));
        assert_eq!(Message::decode(&mut buf).unwrap(), Some(Message::Ack(true)));
        assert_eq!(Message::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn unknown_tag() {
        assert!(matches!(
            Message::from_bytes(&[9]),
            Err(WireError::UnknownTag(9))
        ));
    }

    #[test]
    fn truncated_message() {
        let bytes = Message::DelProxy {
            src: Endpoint::tcp("localhost", 22),
        }
        .to_bytes()
        .unwrap();

        assert!(matches!(
            Message::from_bytes(&bytes[..bytes.len() - 2]),
            Err(WireError::UnexpectedEof)
        ));
        assert!(matches!(
            Message::from_bytes(&[]),
            Err(WireError::UnexpectedEof)
        ));
    }

    #[test]
    fn trailing_bytes() {
        assert!(matches!(
            Message::from_bytes(&[5, 0]),
            Err(WireError::TrailingBytes(1))
        ));
    }

    #[test]
    fn invalid_fields() {
        let mut buf = BytesMut::new();
        buf.put_u8(DEL_PROXY);
        buf.put_u32(0);
        buf.put_u32(70000);
        buf.put_u32(1);
        assert!(matches!(
            Message::from_bytes(&buf),
            Err(WireError::PortOutOfRange(70000))
        ));

        let mut buf = BytesMut::new();
        buf.put_u8(DEL_PROXY);
        buf.put_u32(0);
        buf.put_u32(80);
        buf.put_u32(17);
        assert!(matches!(
            Message::from_bytes(&buf),
            Err(WireError::UnknownProtocol(17))
        ));

        let mut buf = BytesMut::new();
        buf.put_u8(DEL_PROXY);
        buf.put_u32(2);
        buf.put_slice(&[0xff, 0xfe]);
        buf.put_u32(80);
        buf.put_u32(1);
        assert!(matches!(
            Message::from_bytes(&buf),
            Err(WireError::InvalidHost(_))
        ));

        let mut buf = BytesMut::new();
        buf.put_u8(DEL_PROXY);
        buf.put_u32(u32::MAX);
        assert!(matches!(
            Message::decode(&mut buf),
            Err(WireError::HostTooLong(_))
        ));
    }

    #[test]
    fn codec_eof_in_the_middle_of_a_message() {
        let mut codec = WireCodec::new();

        let mut buf = BytesMut::from(&[ADD_PROXY, 0, 0][..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(WireError::UnexpectedEof)
        ));

        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn hosts_over_the_limit_are_not_encoded() {
        let longest = Message::DelProxy {
            src: Endpoint::tcp("a".repeat(MAX_HOST_LEN), 80),
        };
        let bytes = longest.to_bytes().unwrap();
        assert_eq!(Message::from_bytes(&bytes).unwrap(), longest);

        let too_long = Message::AddProxy {
            src: Endpoint::tcp("", 80),
            dest: Endpoint::tcp("a".repeat(MAX_HOST_LEN + 1), 80),
        };
        let mut buf = BytesMut::from(&[QUIT][..]);
        assert!(matches!(
            too_long.encode(&mut buf),
            Err(WireError::HostTooLong(256))
        ));
        assert_eq!(&buf[..], &[QUIT]);

        let mut codec = WireCodec::new();
        let list = Message::GetProxies(vec![mapping(
            Endpoint::udp("a".repeat(300), 53),
            Endpoint::udp("", 53),
        )]);
        assert!(matches!(
            codec.encode(list, &mut buf),
            Err(WireError::HostTooLong(300))
        ));
    }

    #[test]
    fn codec_refuses_oversized_frames() {
        let mut codec = WireCodec::with_max_frame(64);

        // A list that claims to go on forever.
        let mut buf = BytesMut::new();
        buf.put_u8(GET_PROXIES);
        buf.put_u32(u32::MAX);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let pair = mapping(Endpoint::tcp("", 1), Endpoint::tcp("", 2));
        let mut result = Ok(None);
        for _ in 0..4 {
            put_endpoint(&mut buf, &pair.src);
            put_endpoint(&mut buf, &pair.dest);
            result = codec.decode(&mut buf);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(WireError::TooLarge { limit: 64 })));

        // Complete messages within the limit still go through.
        let mut buf = Message::GetProxies(vec![pair]).to_bytes().unwrap();
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }
}
