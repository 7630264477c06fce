//! Shared data model: service instances, delegated hosts, TXT records and
//! subtypes. Mirrors the teacher's `zone.rs::Service`/`ServiceBuilder` shape,
//! generalized from "one zone file" to the mutable service/host tables the
//! responder owns.

use std::net::{Ipv4Addr, Ipv6Addr};

use smallvec_wrapper::TinyVec;
use smol_str::SmolStr;

/// One TXT key/value pair. The value may be absent for a key-only entry
/// (`flag` style, e.g. `_http._tcp` advertising `txtvers` with no value).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtPair {
  pub key: SmolStr,
  pub value: Option<TinyVec<u8>>,
}

impl TxtPair {
  pub fn new(key: impl Into<SmolStr>, value: Option<Vec<u8>>) -> Self {
    Self {
      key: key.into(),
      value: value.map(TinyVec::from_iter),
    }
  }
}

/// A TXT record set. Equality follows the merge rule in the query engine:
/// same count, and every key maps to a byte-equal value; key order does not
/// matter and keys are unique within a set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txt(pub TinyVec<TxtPair>);

impl Txt {
  pub fn get(&self, key: &str) -> Option<&TxtPair> {
    self.0.iter().find(|p| p.key == key)
  }

  /// Set-equality per the change-detection rule of §4.3: same number of
  /// pairs, and each key present in `self` maps to the same value in
  /// `other`.
  pub fn set_eq(&self, other: &Txt) -> bool {
    if self.0.len() != other.0.len() {
      return false;
    }
    self.0.iter().all(|pair| other.get(&pair.key) == Some(pair))
  }
}

/// A local service advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
  pub service_type: SmolStr,
  pub protocol: SmolStr,
  /// Defaults to the server's instance name at construction time; the
  /// responder's field, not the server-level default, is what mangling on
  /// conflict touches.
  pub instance_name: SmolStr,
  /// Defaults to the server hostname; set explicitly to advertise a
  /// service on someone else's behalf (reuses the delegated-host path).
  pub hostname: SmolStr,
  pub port: u16,
  pub priority: u16,
  pub weight: u16,
  pub txt: Txt,
  pub subtypes: TinyVec<SmolStr>,
}

impl ServiceInstance {
  /// The `{instance_name, service_type, protocol, hostname}` identity
  /// tuple; the data-model invariant requires this to be unique across all
  /// local services at any time.
  pub fn identity(&self) -> (SmolStr, SmolStr, SmolStr, SmolStr) {
    (
      self.instance_name.clone(),
      self.service_type.clone(),
      self.protocol.clone(),
      self.hostname.clone(),
    )
  }

  /// `<instance>._service._proto.local`.
  pub fn instance_fqdn(&self) -> SmolStr {
    SmolStr::new(format!(
      "{}.{}.{}.local",
      self.instance_name, self.service_type, self.protocol
    ))
  }

  /// `_service._proto.local`.
  pub fn service_fqdn(&self) -> SmolStr {
    SmolStr::new(format!("{}.{}.local", self.service_type, self.protocol))
  }
}

/// A name the responder answers for on behalf of another device, or the
/// responder's own self-host (whose addresses come from the network
/// interfaces rather than being set directly).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelegatedHost {
  pub hostname: SmolStr,
  pub ipv4: TinyVec<Ipv4Addr>,
  pub ipv6: TinyVec<Ipv6Addr>,
}

impl DelegatedHost {
  pub fn new(hostname: impl Into<SmolStr>) -> Self {
    Self {
      hostname: hostname.into(),
      ipv4: TinyVec::new(),
      ipv6: TinyVec::new(),
    }
  }

  pub fn has_addresses(&self) -> bool {
    !self.ipv4.is_empty() || !self.ipv6.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn txt_set_eq_ignores_order() {
    let mut a = Txt::default();
    a.0.push(TxtPair::new("path", Some(b"/".to_vec())));
    a.0.push(TxtPair::new("v", Some(b"1".to_vec())));
    let mut b = Txt::default();
    b.0.push(TxtPair::new("v", Some(b"1".to_vec())));
    b.0.push(TxtPair::new("path", Some(b"/".to_vec())));
    assert!(a.set_eq(&b));
  }

  #[test]
  fn txt_set_eq_detects_value_change() {
    let mut a = Txt::default();
    a.0.push(TxtPair::new("v", Some(b"1".to_vec())));
    let mut b = Txt::default();
    b.0.push(TxtPair::new("v", Some(b"2".to_vec())));
    assert!(!a.set_eq(&b));
  }

  #[test]
  fn identity_tuple_distinguishes_hostname() {
    let mut svc = ServiceInstance {
      service_type: "_http".into(),
      protocol: "_tcp".into(),
      instance_name: "alpha".into(),
      hostname: "alpha".into(),
      port: 80,
      priority: 0,
      weight: 0,
      txt: Txt::default(),
      subtypes: TinyVec::new(),
    };
    let id1 = svc.identity();
    svc.hostname = "beta".into();
    let id2 = svc.identity();
    assert_ne!(id1, id2);
  }
}
