//! Wire codec: compression-aware serialization and parsing of the DNS-format
//! messages exchanged over multicast.
//!
//! The shape follows the teacher's `types.rs`: a flat module re-exporting a
//! handful of small, mostly-`Copy` types plus two free functions,
//! [`encode_message`] and [`decode_message`].

mod name;
mod record;

pub use name::{Name, ParsedName};
pub use record::{Question, Record, RecordData, RecordType};

use smallvec_wrapper::{OneOrMore, TinyVec};
use smol_str::SmolStr;

/// Maximum mDNS message size. RFC 6762 recommends keeping packets at or
/// below the interface MTU; 1460 covers Ethernet with room for IP/UDP
/// headers.
pub const MAX_PAYLOAD_SIZE: usize = 1460;

pub(crate) const DNS_CLASS_IN: u16 = 1;
pub(crate) const CLASS_CACHE_FLUSH_BIT: u16 = 1 << 15;
pub(crate) const QU_BIT: u16 = 1 << 15;

const HEADER_SIZE: usize = 12;
const QDCOUNT_OFFSET: usize = 4;
const ANCOUNT_OFFSET: usize = 6;
const NSCOUNT_OFFSET: usize = 8;
const ARCOUNT_OFFSET: usize = 10;

/// Errors produced by the wire codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum WireError {
  /// The source buffer ended before a complete record could be read.
  #[error("buffer too small to decode a complete record")]
  BufferTooSmall,
  /// A compression pointer referenced a position at or after itself.
  #[error("compression pointer does not point backwards")]
  BadPointer,
  /// More compression pointers were followed than a well-formed message
  /// could possibly contain.
  #[error("too many compression pointers")]
  TooManyPointers,
  /// A decoded name exceeded the 255-octet wire limit.
  #[error("name exceeds the 255 byte wire limit")]
  NameTooLong,
  /// A single label exceeded 63 bytes.
  #[error("label exceeds 63 bytes")]
  LabelTooLong,
  /// TXT rdata exceeded 255 bytes for a single string.
  #[error("TXT character-string exceeds 255 bytes")]
  TxtStringTooLong,
  /// Writing the record would exceed [`MAX_PAYLOAD_SIZE`]; the caller must
  /// start a fresh packet.
  #[error("message would exceed the maximum payload size")]
  MessageTooLarge,
  /// rdata length did not agree with the bytes actually present.
  #[error("rdata length overflowed the message")]
  RdataOverflow,
}

/// The 12-byte DNS message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
  pub id: u16,
  pub query: bool,
  pub opcode: u8,
  pub authoritative: bool,
  pub truncated: bool,
  pub response_code: u8,
}

/// A single fully decoded message: the parsed packet of the spec.
#[derive(Debug, Clone, Default)]
pub struct Message {
  pub header: Header,
  pub questions: TinyVec<Question>,
  pub answers: TinyVec<Record>,
  pub authority: TinyVec<Record>,
  pub additional: TinyVec<Record>,
}

impl Message {
  /// Builds an empty message with the given id/flags, ready to have
  /// sections pushed onto it.
  pub fn new(id: u16, query: bool, authoritative: bool) -> Self {
    Self {
      header: Header {
        id,
        query,
        authoritative,
        ..Default::default()
      },
      ..Default::default()
    }
  }
}

/// Decodes a full mDNS message. Malformed individual records are skipped
/// (the decoder stays aligned with the record length) rather than aborting
/// the whole message, per the codec's edge policy; a malformed name nested
/// more than four components deep is flagged on the [`Name`] but decoding
/// continues.
pub fn decode_message(buf: &[u8]) -> Result<Message, WireError> {
  if buf.len() < HEADER_SIZE {
    return Err(WireError::BufferTooSmall);
  }
  let id = u16::from_be_bytes([buf[0], buf[1]]);
  let flags = u16::from_be_bytes([buf[2], buf[3]]);
  let qdcount = u16::from_be_bytes([buf[QDCOUNT_OFFSET], buf[QDCOUNT_OFFSET + 1]]) as usize;
  let ancount = u16::from_be_bytes([buf[ANCOUNT_OFFSET], buf[ANCOUNT_OFFSET + 1]]) as usize;
  let nscount = u16::from_be_bytes([buf[NSCOUNT_OFFSET], buf[NSCOUNT_OFFSET + 1]]) as usize;
  let arcount = u16::from_be_bytes([buf[ARCOUNT_OFFSET], buf[ARCOUNT_OFFSET + 1]]) as usize;

  let header = Header {
    id,
    query: (flags & 0x8000) == 0,
    opcode: ((flags >> 11) & 0x0F) as u8,
    authoritative: (flags & 0x0400) != 0,
    truncated: (flags & 0x0200) != 0,
    response_code: (flags & 0x000F) as u8,
  };

  let mut off = HEADER_SIZE;
  let mut questions = TinyVec::with_capacity(qdcount);
  for _ in 0..qdcount {
    let (q, next) = Question::decode(buf, off)?;
    questions.push(q);
    off = next;
  }

  let mut answers = TinyVec::with_capacity(ancount);
  for _ in 0..ancount {
    match Record::decode(buf, off) {
      Ok((r, next)) => {
        off = next;
        answers.push(r);
      }
      Err(_) => break,
    }
  }

  let mut authority = TinyVec::with_capacity(nscount);
  for _ in 0..nscount {
    match Record::decode(buf, off) {
      Ok((r, next)) => {
        off = next;
        authority.push(r);
      }
      Err(_) => break,
    }
  }

  let mut additional = TinyVec::with_capacity(arcount);
  for _ in 0..arcount {
    match Record::decode(buf, off) {
      Ok((r, next)) => {
        off = next;
        additional.push(r);
      }
      Err(_) => break,
    }
  }

  Ok(Message {
    header,
    questions,
    answers,
    authority,
    additional,
  })
}

/// Encodes a message. If the encoded size would exceed [`MAX_PAYLOAD_SIZE`]
/// the writer stops and returns [`WireError::MessageTooLarge`]; per the
/// codec's contract, the caller must begin a fresh packet rather than try
/// to resume this one.
pub fn encode_message(msg: &Message) -> Result<OneOrMore<u8>, WireError> {
  let mut buf: Vec<u8> = Vec::with_capacity(256);
  buf.extend_from_slice(&msg.header.id.to_be_bytes());

  let mut flags: u16 = 0;
  if !msg.header.query {
    flags |= 0x8000;
  }
  flags |= (msg.header.opcode as u16 & 0x0F) << 11;
  if msg.header.authoritative {
    flags |= 0x0400;
  }
  if msg.header.truncated {
    flags |= 0x0200;
  }
  flags |= msg.header.response_code as u16 & 0x000F;
  buf.extend_from_slice(&flags.to_be_bytes());

  buf.extend_from_slice(&(msg.questions.len() as u16).to_be_bytes());
  buf.extend_from_slice(&(msg.answers.len() as u16).to_be_bytes());
  buf.extend_from_slice(&(msg.authority.len() as u16).to_be_bytes());
  buf.extend_from_slice(&(msg.additional.len() as u16).to_be_bytes());

  let mut cmap: std::collections::HashMap<SmolStr, u16> = std::collections::HashMap::new();

  for q in msg.questions.iter() {
    q.encode(&mut buf, &mut cmap)?;
  }
  for r in msg.answers.iter() {
    r.encode(&mut buf, &mut cmap)?;
  }
  for r in msg.authority.iter() {
    r.encode(&mut buf, &mut cmap)?;
  }
  for r in msg.additional.iter() {
    r.encode(&mut buf, &mut cmap)?;
  }

  if buf.len() > MAX_PAYLOAD_SIZE {
    return Err(WireError::MessageTooLarge);
  }

  Ok(OneOrMore::from_iter(buf))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::Ipv4Addr;

  #[test]
  fn header_roundtrip() {
    let mut msg = Message::new(0x1234, true, false);
    msg.header.opcode = 0;
    let encoded = encode_message(&msg).unwrap();
    let decoded = decode_message(&encoded).unwrap();
    assert_eq!(decoded.header.id, 0x1234);
    assert!(decoded.header.query);
  }

  #[test]
  fn answer_roundtrip_with_compression() {
    let mut msg = Message::new(0, false, true);
    msg.answers.push(Record {
      name: Name::from_dotted("alpha._http._tcp.local"),
      ttl: 120,
      flush: true,
      data: RecordData::A(Ipv4Addr::new(192, 168, 0, 2)),
    });
    msg.answers.push(Record {
      name: Name::from_dotted("_http._tcp.local"),
      ttl: 4500,
      flush: false,
      data: RecordData::Ptr(Name::from_dotted("alpha._http._tcp.local")),
    });
    let encoded = encode_message(&msg).unwrap();
    // compression should make this much smaller than writing both names in full
    assert!(encoded.len() < 90);
    let decoded = decode_message(&encoded).unwrap();
    assert_eq!(decoded.answers.len(), 2);
    assert_eq!(decoded.answers[0].name.to_dotted(), "alpha._http._tcp.local");
    assert_eq!(decoded.answers[1].name.to_dotted(), "_http._tcp.local");
    match &decoded.answers[1].data {
      RecordData::Ptr(n) => assert_eq!(n.to_dotted(), "alpha._http._tcp.local"),
      _ => panic!("expected PTR"),
    }
  }

  #[test]
  fn max_label_length_roundtrips() {
    let label63 = "a".repeat(63);
    let dotted = format!("{label63}.local");
    let name = Name::from_dotted(&dotted);
    let mut buf = Vec::new();
    let mut cmap = std::collections::HashMap::new();
    name.encode(&mut buf, &mut cmap).unwrap();
    let (decoded, _) = Name::decode(&buf, 0).unwrap();
    assert_eq!(decoded.to_dotted(), dotted);
  }

  #[test]
  fn label_over_limit_rejected() {
    let label64 = "a".repeat(64);
    let dotted = format!("{label64}.local");
    let name = Name::from_dotted(&dotted);
    let mut buf = Vec::new();
    let mut cmap = std::collections::HashMap::new();
    assert_eq!(name.encode(&mut buf, &mut cmap), Err(WireError::LabelTooLong));
  }

  #[test]
  fn forward_pointer_rejected() {
    // A pointer at offset 12 pointing to offset 14 (itself + 2, forward).
    let mut buf = vec![0u8; 16];
    buf[12] = 0xC0;
    buf[13] = 14;
    assert_eq!(Name::decode(&buf, 12), Err(WireError::BadPointer));
  }
}
