use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use smallvec_wrapper::TinyVec;
use smol_str::SmolStr;

use super::{Name, WireError, CLASS_CACHE_FLUSH_BIT, DNS_CLASS_IN, QU_BIT};

/// The record types the engine speaks. `Unknown` preserves the numeric
/// value of anything else so a message can still be re-encoded without
/// loss even when the engine doesn't understand the rdata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
  A,
  AAAA,
  PTR,
  SRV,
  TXT,
  ANY,
  Unknown(u16),
}

impl RecordType {
  pub fn code(self) -> u16 {
    match self {
      RecordType::A => 1,
      RecordType::AAAA => 28,
      RecordType::PTR => 12,
      RecordType::SRV => 33,
      RecordType::TXT => 16,
      RecordType::ANY => 255,
      RecordType::Unknown(v) => v,
    }
  }
}

impl From<u16> for RecordType {
  fn from(v: u16) -> Self {
    match v {
      1 => RecordType::A,
      28 => RecordType::AAAA,
      12 => RecordType::PTR,
      33 => RecordType::SRV,
      16 => RecordType::TXT,
      255 => RecordType::ANY,
      other => RecordType::Unknown(other),
    }
  }
}

/// A question, as sent in the query section of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
  pub name: Name,
  pub ty: RecordType,
  /// The "QU" bit: the asker accepts a unicast reply to this question.
  pub unicast_response: bool,
}

impl Question {
  pub(crate) fn decode(buf: &[u8], off: usize) -> Result<(Self, usize), WireError> {
    let (name, off) = Name::decode(buf, off)?;
    let ty = u16::from_be_bytes([
      *buf.get(off).ok_or(WireError::BufferTooSmall)?,
      *buf.get(off + 1).ok_or(WireError::BufferTooSmall)?,
    ]);
    let class = u16::from_be_bytes([
      *buf.get(off + 2).ok_or(WireError::BufferTooSmall)?,
      *buf.get(off + 3).ok_or(WireError::BufferTooSmall)?,
    ]);
    Ok((
      Self {
        name,
        ty: RecordType::from(ty),
        unicast_response: class & QU_BIT != 0,
      },
      off + 4,
    ))
  }

  pub(crate) fn encode(
    &self,
    buf: &mut Vec<u8>,
    cmap: &mut HashMap<SmolStr, u16>,
  ) -> Result<(), WireError> {
    self.name.encode(buf, cmap)?;
    buf.extend_from_slice(&self.ty.code().to_be_bytes());
    let mut class = DNS_CLASS_IN;
    if self.unicast_response {
      class |= QU_BIT;
    }
    buf.extend_from_slice(&class.to_be_bytes());
    Ok(())
  }
}

/// Decoded rdata for the record types the engine understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
  A(Ipv4Addr),
  Aaaa(Ipv6Addr),
  Ptr(Name),
  Srv { priority: u16, weight: u16, port: u16, target: Name },
  Txt(TinyVec<SmolStr>),
  /// Rdata for a type the engine doesn't interpret; carried verbatim so
  /// unrelated records can still be round-tripped.
  Raw(RecordType, TinyVec<u8>),
}

impl RecordData {
  pub fn ty(&self) -> RecordType {
    match self {
      RecordData::A(_) => RecordType::A,
      RecordData::Aaaa(_) => RecordType::AAAA,
      RecordData::Ptr(_) => RecordType::PTR,
      RecordData::Srv { .. } => RecordType::SRV,
      RecordData::Txt(_) => RecordType::TXT,
      RecordData::Raw(ty, _) => *ty,
    }
  }

  /// Encodes just the rdata bytes, with no name compression, header or
  /// length prefix — the byte string §4.2's conflict comparison operates
  /// on directly.
  pub fn encode_rdata(&self) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut cmap = HashMap::new();
    match self {
      RecordData::A(addr) => buf.extend_from_slice(&addr.octets()),
      RecordData::Aaaa(addr) => buf.extend_from_slice(&addr.octets()),
      RecordData::Ptr(target) => {
        let _ = target.encode(&mut buf, &mut cmap);
      }
      RecordData::Srv { priority, weight, port, target } => {
        buf.extend_from_slice(&priority.to_be_bytes());
        buf.extend_from_slice(&weight.to_be_bytes());
        buf.extend_from_slice(&port.to_be_bytes());
        let _ = target.encode(&mut buf, &mut cmap);
      }
      RecordData::Txt(strings) => {
        let _ = encode_txt(strings, &mut buf);
      }
      RecordData::Raw(_, raw) => buf.extend_from_slice(raw),
    }
    buf
  }
}

/// A resource record: the unit answers, authority and additional sections
/// are made of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
  pub name: Name,
  pub ttl: u32,
  /// The cache-flush bit (RFC 6762 §10.2): tells receivers this RRset
  /// replaces, rather than adds to, any cached record of the same name
  /// and type.
  pub flush: bool,
  pub data: RecordData,
}

impl Record {
  pub(crate) fn decode(buf: &[u8], off: usize) -> Result<(Self, usize), WireError> {
    let (name, off) = Name::decode(buf, off)?;
    let ty_code = u16::from_be_bytes([
      *buf.get(off).ok_or(WireError::BufferTooSmall)?,
      *buf.get(off + 1).ok_or(WireError::BufferTooSmall)?,
    ]);
    let class = u16::from_be_bytes([
      *buf.get(off + 2).ok_or(WireError::BufferTooSmall)?,
      *buf.get(off + 3).ok_or(WireError::BufferTooSmall)?,
    ]);
    let ttl = u32::from_be_bytes([
      *buf.get(off + 4).ok_or(WireError::BufferTooSmall)?,
      *buf.get(off + 5).ok_or(WireError::BufferTooSmall)?,
      *buf.get(off + 6).ok_or(WireError::BufferTooSmall)?,
      *buf.get(off + 7).ok_or(WireError::BufferTooSmall)?,
    ]);
    let rdlen = u16::from_be_bytes([
      *buf.get(off + 8).ok_or(WireError::BufferTooSmall)?,
      *buf.get(off + 9).ok_or(WireError::BufferTooSmall)?,
    ]) as usize;
    let rdata_start = off + 10;
    let rdata_end = rdata_start.checked_add(rdlen).ok_or(WireError::RdataOverflow)?;
    let rdata = buf.get(rdata_start..rdata_end).ok_or(WireError::RdataOverflow)?;

    let ty = RecordType::from(ty_code);
    let data = match ty {
      RecordType::A => {
        if rdata.len() != 4 {
          return Err(WireError::RdataOverflow);
        }
        RecordData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
      }
      RecordType::AAAA => {
        if rdata.len() != 16 {
          return Err(WireError::RdataOverflow);
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(rdata);
        RecordData::Aaaa(Ipv6Addr::from(octets))
      }
      RecordType::PTR => {
        let (target, _) = Name::decode(buf, rdata_start)?;
        RecordData::Ptr(target)
      }
      RecordType::SRV => {
        if rdata.len() < 6 {
          return Err(WireError::RdataOverflow);
        }
        let priority = u16::from_be_bytes([rdata[0], rdata[1]]);
        let weight = u16::from_be_bytes([rdata[2], rdata[3]]);
        let port = u16::from_be_bytes([rdata[4], rdata[5]]);
        let (target, _) = Name::decode(buf, rdata_start + 6)?;
        RecordData::Srv { priority, weight, port, target }
      }
      RecordType::TXT => RecordData::Txt(decode_txt(rdata)?),
      _ => RecordData::Raw(ty, TinyVec::from_iter(rdata.iter().copied())),
    };

    Ok((
      Self {
        name,
        ttl,
        flush: class & CLASS_CACHE_FLUSH_BIT != 0,
        data,
      },
      rdata_end,
    ))
  }

  pub(crate) fn encode(
    &self,
    buf: &mut Vec<u8>,
    cmap: &mut HashMap<SmolStr, u16>,
  ) -> Result<(), WireError> {
    self.name.encode(buf, cmap)?;
    buf.extend_from_slice(&self.data.ty().code().to_be_bytes());
    let mut class = DNS_CLASS_IN;
    if self.flush {
      class |= CLASS_CACHE_FLUSH_BIT;
    }
    buf.extend_from_slice(&class.to_be_bytes());
    buf.extend_from_slice(&self.ttl.to_be_bytes());

    let rdlen_pos = buf.len();
    buf.extend_from_slice(&[0, 0]);
    let rdata_start = buf.len();

    match &self.data {
      RecordData::A(addr) => buf.extend_from_slice(&addr.octets()),
      RecordData::Aaaa(addr) => buf.extend_from_slice(&addr.octets()),
      RecordData::Ptr(target) => target.encode(buf, cmap)?,
      RecordData::Srv { priority, weight, port, target } => {
        buf.extend_from_slice(&priority.to_be_bytes());
        buf.extend_from_slice(&weight.to_be_bytes());
        buf.extend_from_slice(&port.to_be_bytes());
        target.encode(buf, cmap)?;
      }
      RecordData::Txt(strings) => encode_txt(strings, buf)?,
      RecordData::Raw(_, raw) => buf.extend_from_slice(raw),
    }

    let rdlen = buf.len() - rdata_start;
    if rdlen > u16::MAX as usize {
      return Err(WireError::RdataOverflow);
    }
    buf[rdlen_pos..rdlen_pos + 2].copy_from_slice(&(rdlen as u16).to_be_bytes());
    Ok(())
  }
}

fn decode_txt(rdata: &[u8]) -> Result<TinyVec<SmolStr>, WireError> {
  let mut out = TinyVec::new();
  let mut i = 0;
  while i < rdata.len() {
    let len = rdata[i] as usize;
    let start = i + 1;
    let end = start + len;
    let chunk = rdata.get(start..end).ok_or(WireError::RdataOverflow)?;
    out.push(SmolStr::new(String::from_utf8_lossy(chunk)));
    i = end;
  }
  Ok(out)
}

fn encode_txt(strings: &[SmolStr], buf: &mut Vec<u8>) -> Result<(), WireError> {
  if strings.is_empty() {
    buf.push(0);
    return Ok(());
  }
  for s in strings {
    if s.len() > 255 {
      return Err(WireError::TxtStringTooLong);
    }
    buf.push(s.len() as u8);
    buf.extend_from_slice(s.as_bytes());
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn srv_roundtrip() {
    let record = Record {
      name: Name::from_dotted("alpha._http._tcp.local"),
      ttl: 120,
      flush: true,
      data: RecordData::Srv {
        priority: 0,
        weight: 0,
        port: 8080,
        target: Name::from_dotted("alpha.local"),
      },
    };
    let mut buf = Vec::new();
    let mut cmap = HashMap::new();
    record.encode(&mut buf, &mut cmap).unwrap();
    let (decoded, next) = Record::decode(&buf, 0).unwrap();
    assert_eq!(next, buf.len());
    assert_eq!(decoded, record);
  }

  #[test]
  fn txt_roundtrip_multi_string() {
    let mut strings = TinyVec::new();
    strings.push(SmolStr::new("path=/"));
    strings.push(SmolStr::new("version=1"));
    let record = Record {
      name: Name::from_dotted("alpha._http._tcp.local"),
      ttl: 4500,
      flush: true,
      data: RecordData::Txt(strings),
    };
    let mut buf = Vec::new();
    let mut cmap = HashMap::new();
    record.encode(&mut buf, &mut cmap).unwrap();
    let (decoded, _) = Record::decode(&buf, 0).unwrap();
    assert_eq!(decoded, record);
  }

  #[test]
  fn empty_txt_encodes_single_zero_length_string() {
    let record = Record {
      name: Name::from_dotted("alpha._http._tcp.local"),
      ttl: 4500,
      flush: true,
      data: RecordData::Txt(TinyVec::new()),
    };
    let mut buf = Vec::new();
    let mut cmap = HashMap::new();
    record.encode(&mut buf, &mut cmap).unwrap();
    let (decoded, _) = Record::decode(&buf, 0).unwrap();
    match decoded.data {
      RecordData::Txt(strings) => assert!(strings.is_empty()),
      _ => panic!("expected TXT"),
    }
  }
}
