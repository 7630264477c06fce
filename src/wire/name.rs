use std::collections::HashMap;

use smol_str::SmolStr;

use super::WireError;

const MAX_WIRE_OCTETS: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const MAX_POINTERS: usize = 16;
const POINTER_MASK: u8 = 0xC0;

/// A domain name, stored in its canonical dotted-and-escaped text form.
///
/// Decoding follows the label-or-pointer walk described in the codec design:
/// a length byte in `1..=63` starts a label, `0xC0` starts a 14-bit
/// compression pointer that must point strictly backwards, and any other
/// top two bits are reserved and rejected. A backslash escapes a literal
/// dot or backslash inside a label, matching how the reference
/// implementation prints non-hostname-safe bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Name(SmolStr);

impl Name {
  /// Builds a `Name` from an already-dotted, already-escaped string.
  pub fn from_dotted(s: &str) -> Self {
    Self(SmolStr::new(s))
  }

  /// The root name, `.`.
  pub fn root() -> Self {
    Self(SmolStr::new("."))
  }

  /// The canonical dotted representation.
  pub fn to_dotted(&self) -> &str {
    &self.0
  }

  /// Labels, in order, with escapes resolved.
  pub fn labels(&self) -> Vec<SmolStr> {
    split_labels(&self.0)
  }

  /// True if this name has `suffix` as its trailing labels (case-insensitive).
  pub fn ends_with(&self, suffix: &str) -> bool {
    self.0.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase())
  }

  pub(crate) fn decode(buf: &[u8], start: usize) -> Result<(Self, usize), WireError> {
    let mut labels: Vec<String> = Vec::new();
    let mut off = start;
    let mut pointer_hops = 0usize;
    let mut end_of_first_pass: Option<usize> = None;
    let mut budget: isize = MAX_WIRE_OCTETS as isize;

    loop {
      let len_byte = *buf.get(off).ok_or(WireError::BufferTooSmall)?;
      if len_byte == 0 {
        off += 1;
        if end_of_first_pass.is_none() {
          end_of_first_pass = Some(off);
        }
        break;
      }
      if len_byte & POINTER_MASK == POINTER_MASK {
        let next = *buf.get(off + 1).ok_or(WireError::BufferTooSmall)?;
        let pointer = (((len_byte & !POINTER_MASK) as usize) << 8) | next as usize;
        if end_of_first_pass.is_none() {
          end_of_first_pass = Some(off + 2);
        }
        if pointer >= off {
          return Err(WireError::BadPointer);
        }
        pointer_hops += 1;
        if pointer_hops > MAX_POINTERS {
          return Err(WireError::TooManyPointers);
        }
        off = pointer;
        continue;
      }
      if len_byte & POINTER_MASK != 0 {
        // 0x40/0x80 top bits are reserved (EDNS0 extended label types, unused here).
        return Err(WireError::BadPointer);
      }
      let len = len_byte as usize;
      if len > MAX_LABEL_LEN {
        return Err(WireError::LabelTooLong);
      }
      let label_start = off + 1;
      let label_end = label_start + len;
      let raw = buf.get(label_start..label_end).ok_or(WireError::BufferTooSmall)?;
      budget -= len as isize + 1;
      if budget < 0 {
        return Err(WireError::NameTooLong);
      }
      labels.push(escape_label(raw));
      off = label_end;
    }

    let dotted = if labels.is_empty() {
      ".".to_string()
    } else {
      labels.join(".")
    };

    Ok((Self(SmolStr::new(dotted)), end_of_first_pass.unwrap_or(off)))
  }

  pub(crate) fn encode(
    &self,
    buf: &mut Vec<u8>,
    cmap: &mut HashMap<SmolStr, u16>,
  ) -> Result<(), WireError> {
    let labels = self.labels();
    encode_labels(&labels, buf, cmap)
  }
}

fn encode_labels(
  labels: &[SmolStr],
  buf: &mut Vec<u8>,
  cmap: &mut HashMap<SmolStr, u16>,
) -> Result<(), WireError> {
  if labels.is_empty() {
    buf.push(0);
    return Ok(());
  }

  let suffix = labels.join(".");
  if let Some(&pointer) = cmap.get(suffix.as_str()) {
    buf.push(0xC0 | ((pointer >> 8) as u8));
    buf.push((pointer & 0xFF) as u8);
    return Ok(());
  }

  if buf.len() < 0x3FFF {
    cmap.insert(SmolStr::new(&suffix), buf.len() as u16);
  }

  let raw = unescape_label(&labels[0]);
  if raw.len() > MAX_LABEL_LEN {
    return Err(WireError::LabelTooLong);
  }
  buf.push(raw.len() as u8);
  buf.extend_from_slice(&raw);

  encode_labels(&labels[1..], buf, cmap)
}

fn split_labels(dotted: &str) -> Vec<SmolStr> {
  if dotted == "." || dotted.is_empty() {
    return Vec::new();
  }
  let mut labels = Vec::new();
  let mut current = String::new();
  let mut escaped = false;
  for ch in dotted.chars() {
    if escaped {
      current.push(ch);
      escaped = false;
      continue;
    }
    match ch {
      '\\' => escaped = true,
      '.' => {
        labels.push(SmolStr::new(&current));
        current.clear();
      }
      _ => current.push(ch),
    }
  }
  labels.push(SmolStr::new(&current));
  labels
}

fn escape_label(raw: &[u8]) -> String {
  let mut out = String::with_capacity(raw.len());
  for &b in raw {
    match b {
      b'.' => out.push_str("\\."),
      b'\\' => out.push_str("\\\\"),
      0x20..=0x7E => out.push(b as char),
      _ => out.push_str(&format!("\\{:03}", b)),
    }
  }
  out
}

fn unescape_label(label: &str) -> Vec<u8> {
  let mut out = Vec::with_capacity(label.len());
  let chars: Vec<char> = label.chars().collect();
  let mut i = 0;
  while i < chars.len() {
    if chars[i] == '\\' && i + 1 < chars.len() {
      if chars[i + 1].is_ascii_digit() && i + 3 < chars.len() + 1 && chars.get(i + 2).is_some_and(|c| c.is_ascii_digit()) && chars.get(i + 3).is_some_and(|c| c.is_ascii_digit()) {
        let ddd: String = chars[i + 1..i + 4].iter().collect();
        if let Ok(v) = ddd.parse::<u16>() {
          out.push(v as u8);
          i += 4;
          continue;
        }
      }
      out.push(chars[i + 1] as u8);
      i += 2;
      continue;
    }
    let mut buf = [0u8; 4];
    out.extend_from_slice(chars[i].encode_utf8(&mut buf).as_bytes());
    i += 1;
  }
  out
}

/// The four-field parsed view of a name relative to `local.`, used by the
/// responder and query engine for question/answer matching: the reference
/// implementation's `_mdns_read_fqdn` unconditionally assigns the very
/// first label to `host`, then folds in subsequent labels while it is
/// still building that first component (so a literal multi-label hostname
/// stays intact), before the remaining labels fill `service`, `protocol`
/// and `domain` in order. A `_sub` label anywhere sets `sub` without
/// consuming a slot. More than four components marks the name `invalid`
/// but does not stop decoding, so the caller can still align past it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedName {
  pub host: SmolStr,
  pub service: SmolStr,
  pub protocol: SmolStr,
  pub domain: SmolStr,
  pub sub: bool,
  pub invalid: bool,
}

impl ParsedName {
  pub fn parse(name: &Name) -> Self {
    let mut labels: Vec<SmolStr> = Vec::new();
    let mut sub = false;
    for label in name.labels() {
      if label.eq_ignore_ascii_case("_sub") {
        sub = true;
        continue;
      }
      labels.push(label);
    }

    // Domain trails the name (`local`, or `arpa` reverse-lookup trees);
    // a trailing underscore-prefixed pair right before it is service+proto,
    // everything remaining folds into host.
    let mut rest = labels.as_slice();
    let mut domain = SmolStr::default();
    if let Some((last, head)) = rest.split_last() {
      let lower = last.to_ascii_lowercase();
      if lower == "local" || lower == "arpa" {
        domain = last.clone();
        rest = head;
      }
    }

    let mut protocol = SmolStr::default();
    let mut service = SmolStr::default();
    if let Some((last, head)) = rest.split_last() {
      if last.starts_with('_') {
        protocol = last.clone();
        rest = head;
        if let Some((last2, head2)) = rest.split_last() {
          if last2.starts_with('_') {
            service = last2.clone();
            rest = head2;
          }
        }
      }
    }

    let invalid = rest.len() > 1 && rest.iter().skip(1).any(|l| l.starts_with('_'));
    let host = SmolStr::new(rest.join("."));

    Self {
      host,
      service,
      protocol,
      domain,
      sub,
      invalid,
    }
  }
}
