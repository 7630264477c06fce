//! Responder: owns local services/hosts, drives per-interface probe,
//! announce, defend and goodbye behavior, and answers incoming questions
//! (§4.2).

use std::cmp::Ordering;
use std::net::IpAddr;

use smallvec_wrapper::TinyVec;
use smol_str::SmolStr;

use crate::model::{DelegatedHost, ServiceInstance};
use crate::wire::{Name, ParsedName, Question, Record, RecordData, RecordType};

/// The outcome of comparing an incoming record against the record we're
/// about to claim during probing, per §4.2's lexicographic rdata rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
  WeWin,
  Same,
  TheyWin,
}

/// Lexicographic comparison of raw rdata byte strings, length as tiebreak
/// when one is a byte-for-byte prefix of the other (Rust's slice `Ord`
/// already gives the shorter one `Less` in that case, matching §4.2's
/// rule directly): the side with the alphanumerically greater rdata wins
/// and keeps the name.
pub fn compare_rdata(ours: &[u8], theirs: &[u8]) -> ConflictOutcome {
  match ours.cmp(theirs) {
    Ordering::Equal => ConflictOutcome::Same,
    Ordering::Greater => ConflictOutcome::WeWin,
    Ordering::Less => ConflictOutcome::TheyWin,
  }
}

/// Mangles a name by appending or incrementing a `-N` suffix (initial
/// `N=2`, otherwise parse the existing suffix and increment), per §4.2.
pub fn mangle(name: &str) -> SmolStr {
  if let Some(pos) = name.rfind('-') {
    let (base, suffix) = name.split_at(pos);
    if let Ok(n) = suffix[1..].parse::<u32>() {
      return SmolStr::new(format!("{base}-{}", n + 1));
    }
  }
  SmolStr::new(format!("{name}-2"))
}

/// Precedence for what gets mangled on a lost conflict: per-service
/// `instance_name` first, else the server-wide `instance`, else the
/// hostname (which cascades to every service delegated to it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManglesScope {
  ServiceInstance,
  ServerInstance,
  Hostname,
}

/// Owns the local advertisement surface: services, delegated hosts, and
/// the server-wide hostname/instance.
#[derive(Debug, Default)]
pub struct Responder {
  pub hostname: SmolStr,
  pub instance: SmolStr,
  pub services: TinyVec<ServiceInstance>,
  pub hosts: TinyVec<DelegatedHost>,
  pub self_host: DelegatedHost,
}

impl Responder {
  pub fn new(hostname: SmolStr, instance: SmolStr) -> Self {
    Self {
      self_host: DelegatedHost::new(hostname.clone()),
      hostname,
      instance,
      services: TinyVec::new(),
      hosts: TinyVec::new(),
    }
  }

  /// Enforces the identity-tuple invariant from §3 before insertion.
  pub fn add_service(&mut self, service: ServiceInstance) -> Result<(), SmolStr> {
    let id = service.identity();
    if self.services.iter().any(|s| s.identity() == id) {
      tracing::warn!(instance = %service.instance_name, "rejected duplicate service identity");
      return Err(SmolStr::new("duplicate service identity"));
    }
    tracing::info!(instance = %service.instance_name, service_type = %service.service_type, "service registered");
    self.services.push(service);
    Ok(())
  }

  pub fn remove_service(&mut self, instance_name: &str, service_type: &str, protocol: &str) -> Option<ServiceInstance> {
    let pos = self
      .services
      .iter()
      .position(|s| s.instance_name == instance_name && s.service_type == service_type && s.protocol == protocol)?;
    tracing::info!(instance = %instance_name, "service removed");
    Some(self.services.remove(pos))
  }

  /// Mangles the named scope per §4.2's precedence and cascade rule,
  /// returning the new name.
  pub fn mangle_scope(&mut self, scope: ManglesScope, service_identity: Option<(SmolStr, SmolStr, SmolStr)>) -> SmolStr {
    let mangled = self.mangle_scope_inner(scope, service_identity);
    tracing::info!(?scope, name = %mangled, "mangled name after lost conflict");
    mangled
  }

  fn mangle_scope_inner(&mut self, scope: ManglesScope, service_identity: Option<(SmolStr, SmolStr, SmolStr)>) -> SmolStr {
    match scope {
      ManglesScope::ServiceInstance => {
        let (instance_name, service_type, protocol) = service_identity.expect("service identity required");
        if let Some(service) = self
          .services
          .iter_mut()
          .find(|s| s.instance_name == instance_name && s.service_type == service_type && s.protocol == protocol)
        {
          let mangled = mangle(&service.instance_name);
          service.instance_name = mangled.clone();
          mangled
        } else {
          mangle(&instance_name)
        }
      }
      ManglesScope::ServerInstance => {
        let mangled = mangle(&self.instance);
        self.instance = mangled.clone();
        mangled
      }
      ManglesScope::Hostname => self.remap_hostname(),
    }
  }

  /// `_mdns_remap_self_service_hostname` in the original: mangles the
  /// hostname and rewrites every service whose `hostname` field pointed at
  /// the old one, so they keep resolving.
  pub fn remap_hostname(&mut self) -> SmolStr {
    let old = self.hostname.clone();
    let mangled = mangle(&old);
    self.hostname = mangled.clone();
    self.self_host.hostname = mangled.clone();
    for service in self.services.iter_mut() {
      if service.hostname == old {
        service.hostname = mangled.clone();
      }
    }
    mangled
  }

  /// Builds the answer set for one parsed question on a fully-running PCB,
  /// per §4.2 "Answer generation". `addresses` are the self-host's current
  /// addresses on the answering interface.
  pub fn answer_question(&self, question_name: &Name, ty: RecordType, addresses: &[IpAddr]) -> AnswerSet {
    let parsed = ParsedName::parse(question_name);
    let mut set = AnswerSet::default();

    if parsed.host == "_services" && parsed.service == "_dns-sd" && parsed.protocol == "_udp" && parsed.domain == "local" {
      let mut seen: TinyVec<(SmolStr, SmolStr)> = TinyVec::new();
        for service in self.services.iter() {
          let key = (service.service_type.clone(), service.protocol.clone());
          if seen.contains(&key) {
            continue;
          }
          seen.push(key);
          set.answers.push(Record {
            name: question_name.clone(),
            ttl: 4500,
            flush: false,
            data: RecordData::Ptr(Name::from_dotted(&format!("{}.{}.local", service.service_type, service.protocol))),
          });
        }
      return set;
    }

    if ty == RecordType::PTR && !parsed.service.is_empty() && parsed.domain == "local" && (parsed.host.is_empty() || parsed.sub) {
      for service in self
        .services
        .iter()
        .filter(|s| s.service_type == parsed.service && s.protocol == parsed.protocol)
        .filter(|s| !parsed.sub || s.subtypes.iter().any(|st| *st == parsed.host))
      {
        set.answers.push(Record {
          name: question_name.clone(),
          ttl: 4500,
          flush: false,
          data: RecordData::Ptr(Name::from_dotted(&service.instance_fqdn())),
        });
        self.push_service_details(service, addresses, &mut set.additional);
      }
      return set;
    }

    if matches!(ty, RecordType::SRV | RecordType::TXT) && !parsed.service.is_empty() {
      if let Some(service) = self
        .services
        .iter()
        .find(|s| s.instance_name == parsed.host && s.service_type == parsed.service && s.protocol == parsed.protocol)
      {
        if ty == RecordType::SRV {
          set.answers.push(srv_record(service));
        } else {
          set.answers.push(txt_record(service));
        }
        for addr in addresses {
          set.additional.push(address_record(&service.hostname, *addr, true));
        }
      }
      return set;
    }

    if ty == RecordType::ANY && parsed.service.is_empty() && (parsed.host == self.hostname || question_name.ends_with(&format!("{}.local", self.hostname))) {
      for addr in addresses {
        set.answers.push(address_record(&self.hostname, *addr, true));
      }
      return set;
    }

    set
  }

  /// The rdata we would claim for `{parsed_name, ty}`, if any — used to
  /// compare against a peer's authority-section record during a probe
  /// conflict, or an answer-section record while `RUNNING` (§4.2 "Defend").
  pub fn owned_rdata(&self, parsed: &ParsedName, ty: RecordType, addresses: &[IpAddr]) -> Option<RecordData> {
    match ty {
      RecordType::SRV => self
        .services
        .iter()
        .find(|s| s.instance_name == parsed.host && s.service_type == parsed.service && s.protocol == parsed.protocol)
        .map(srv_record)
        .map(|r| r.data),
      RecordType::TXT => self
        .services
        .iter()
        .find(|s| s.instance_name == parsed.host && s.service_type == parsed.service && s.protocol == parsed.protocol)
        .map(txt_record)
        .map(|r| r.data),
      RecordType::A => addresses.iter().find_map(|a| match a {
        IpAddr::V4(v4) if parsed.host == self.hostname => Some(RecordData::A(*v4)),
        _ => None,
      }),
      RecordType::AAAA => addresses.iter().find_map(|a| match a {
        IpAddr::V6(v6) if parsed.host == self.hostname => Some(RecordData::Aaaa(*v6)),
        _ => None,
      }),
      _ => None,
    }
  }

  fn push_service_details(&self, service: &ServiceInstance, addresses: &[IpAddr], additional: &mut TinyVec<Record>) {
    additional.push(srv_record(service));
    additional.push(txt_record(service));
    for addr in addresses {
      additional.push(address_record(&service.hostname, *addr, true));
    }
  }

  /// Builds the probe question set for the given PCB's in-flight services
  /// plus, if `probing_host`, the hostname itself. §4.2 "Probe packet".
  pub fn probe_questions(&self, probing: &[SmolStr], probing_host: bool, unicast: bool) -> TinyVec<Question> {
    let mut questions = TinyVec::new();
    for fqdn in probing {
      questions.push(Question {
        name: Name::from_dotted(fqdn),
        ty: RecordType::ANY,
        unicast_response: unicast,
      });
    }
    if probing_host {
      questions.push(Question {
        name: Name::from_dotted(&format!("{}.local", self.hostname)),
        ty: RecordType::ANY,
        unicast_response: unicast,
      });
    }
    questions
  }

  /// Builds the announce records (PTR/SRV/TXT/A/AAAA, cache-flush set on
  /// everything but PTR) for every probed service. §4.2 "Announce".
  pub fn announce_records(&self, probing: &[SmolStr], addresses: &[IpAddr]) -> TinyVec<Record> {
    let mut records = TinyVec::new();
    for service in self.services.iter().filter(|s| probing.contains(&s.instance_fqdn())) {
      records.push(Record {
        name: Name::from_dotted(&service.service_fqdn()),
        ttl: 4500,
        flush: false,
        data: RecordData::Ptr(Name::from_dotted(&service.instance_fqdn())),
      });
      records.push(srv_record(service));
      records.push(txt_record(service));
      for addr in addresses {
        records.push(address_record(&service.hostname, *addr, true));
      }
    }
    records
  }

  /// Goodbye records for a removed service: every RRset it owned, TTL 0.
  pub fn goodbye_records(&self, service: &ServiceInstance, addresses: &[IpAddr]) -> TinyVec<Record> {
    let mut records = TinyVec::new();
    records.push(Record {
      name: Name::from_dotted(&service.service_fqdn()),
      ttl: 0,
      flush: false,
      data: RecordData::Ptr(Name::from_dotted(&service.instance_fqdn())),
    });
    let mut srv = srv_record(service);
    srv.ttl = 0;
    records.push(srv);
    let mut txt = txt_record(service);
    txt.ttl = 0;
    records.push(txt);
    for addr in addresses {
      records.push(address_record(&service.hostname, *addr, false));
    }
    records
  }
}

fn srv_record(service: &ServiceInstance) -> Record {
  Record {
    name: Name::from_dotted(&service.instance_fqdn()),
    ttl: 120,
    flush: true,
    data: RecordData::Srv {
      priority: service.priority,
      weight: service.weight,
      port: service.port,
      target: Name::from_dotted(&format!("{}.local", service.hostname)),
    },
  }
}

fn txt_record(service: &ServiceInstance) -> Record {
  let mut strings = TinyVec::new();
  for pair in service.txt.0.iter() {
    match &pair.value {
      Some(v) => strings.push(SmolStr::new(format!("{}={}", pair.key, String::from_utf8_lossy(v)))),
      None => strings.push(pair.key.clone()),
    }
  }
  Record {
    name: Name::from_dotted(&service.instance_fqdn()),
    ttl: 4500,
    flush: true,
    data: RecordData::Txt(strings),
  }
}

fn address_record(hostname: &str, addr: IpAddr, flush: bool) -> Record {
  let name = Name::from_dotted(&format!("{hostname}.local"));
  match addr {
    IpAddr::V4(v4) => Record { name, ttl: 120, flush, data: RecordData::A(v4) },
    IpAddr::V6(v6) => Record { name, ttl: 120, flush, data: RecordData::Aaaa(v6) },
  }
}

/// Known-answer suppression, scoped to PTR only (§9 open question,
/// implemented per SPEC_FULL's resolution): an incoming answer whose TTL
/// already exceeds half our record's full TTL means we should not re-answer.
pub fn suppressed_by_known_answer(our_ttl: u32, their_ttl: u32, ty: RecordType) -> bool {
  ty == RecordType::PTR && their_ttl > our_ttl / 2
}

/// Answers generated for one incoming question: direct answers plus
/// additional records (SRV/TXT/A/AAAA riding along with a shared PTR).
#[derive(Debug, Default, Clone)]
pub struct AnswerSet {
  pub answers: TinyVec<Record>,
  pub additional: TinyVec<Record>,
}

impl AnswerSet {
  pub fn is_empty(&self) -> bool {
    self.answers.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Txt;
  use std::net::Ipv4Addr;

  fn svc() -> ServiceInstance {
    ServiceInstance {
      service_type: "_http".into(),
      protocol: "_tcp".into(),
      instance_name: "alpha".into(),
      hostname: "alpha".into(),
      port: 80,
      priority: 0,
      weight: 0,
      txt: Txt::default(),
      subtypes: TinyVec::new(),
    }
  }

  #[test]
  fn mangle_appends_initial_suffix() {
    assert_eq!(mangle("alpha"), "alpha-2");
  }

  #[test]
  fn mangle_increments_existing_suffix() {
    assert_eq!(mangle("alpha-2"), "alpha-3");
    assert_eq!(mangle("alpha-9"), "alpha-10");
  }

  #[test]
  fn lexicographically_greater_side_wins() {
    assert_eq!(compare_rdata(b"bbb", b"aaa"), ConflictOutcome::WeWin);
    assert_eq!(compare_rdata(b"aaa", b"bbb"), ConflictOutcome::TheyWin);
    assert_eq!(compare_rdata(b"aaa", b"aaa"), ConflictOutcome::Same);
  }

  #[test]
  fn remap_hostname_cascades_to_delegated_services() {
    let mut r = Responder::new("alpha".into(), "alpha".into());
    r.add_service(svc()).unwrap();
    let mangled = r.remap_hostname();
    assert_eq!(mangled, "alpha-2");
    assert_eq!(r.services[0].hostname, "alpha-2");
  }

  #[test]
  fn duplicate_identity_rejected() {
    let mut r = Responder::new("alpha".into(), "alpha".into());
    r.add_service(svc()).unwrap();
    assert!(r.add_service(svc()).is_err());
  }

  #[test]
  fn answers_service_enumeration_ptr() {
    let mut r = Responder::new("alpha".into(), "alpha".into());
    r.add_service(svc()).unwrap();
    let question = Name::from_dotted("_services._dns-sd._udp.local");
    let set = r.answer_question(&question, RecordType::PTR, &[]);
    assert_eq!(set.answers.len(), 1);
    match &set.answers[0].data {
      RecordData::Ptr(n) => assert_eq!(n.to_dotted(), "_http._tcp.local"),
      _ => panic!("expected PTR"),
    }
  }

  #[test]
  fn answers_service_ptr_with_srv_txt_additional() {
    let mut r = Responder::new("alpha".into(), "alpha".into());
    r.add_service(svc()).unwrap();
    let question = Name::from_dotted("_http._tcp.local");
    let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    let set = r.answer_question(&question, RecordType::PTR, &[addr]);
    assert_eq!(set.answers.len(), 1);
    assert_eq!(set.additional.len(), 3);
    assert!(set.additional.iter().any(|r| r.data.ty() == RecordType::SRV && r.flush));
    assert!(set.additional.iter().any(|r| r.data.ty() == RecordType::A));
  }

  #[test]
  fn known_answer_suppression_only_applies_to_ptr() {
    assert!(suppressed_by_known_answer(4500, 4000, RecordType::PTR));
    assert!(!suppressed_by_known_answer(4500, 2000, RecordType::PTR));
    assert!(!suppressed_by_known_answer(120, 119, RecordType::SRV));
  }
}
