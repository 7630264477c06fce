//! Query engine: one-shot searches and continuous browses, and the record
//! merge rules that assemble answers arriving in separate packets into
//! coherent results (§4.3).
//!
//! The merge logic is grounded in the teacher's `client.rs::Client::query_in`:
//! a PTR creates a result skeleton keyed by instance name, SRV/TXT fill it in
//! exactly once, and A/AAAA accumulate by value. We trade the teacher's
//! `HashMap<Name, Arc<AtomicRefCell<ServiceEntryBuilder>>>` keying for a flat
//! `Vec<Result>` scoped per search/browse (these collections are small: a
//! handful of instances per service type), but the decision rules per
//! incoming record are the same.

use std::net::IpAddr;
use std::time::Instant;

use smallvec_wrapper::TinyVec;
use smol_str::SmolStr;

use crate::model::Txt;
use crate::pcb::IpProtocol;
use crate::wire::{RecordData, RecordType};

/// A merged answer to a search or browse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
  pub interface: u32,
  pub ip_protocol: IpProtocol,
  pub instance_name: Option<SmolStr>,
  pub service_type: Option<SmolStr>,
  pub protocol: Option<SmolStr>,
  pub hostname: Option<SmolStr>,
  pub port: u16,
  pub txt: Txt,
  pub addresses: TinyVec<IpAddr>,
  pub ttl: u32,
}

impl QueryResult {
  fn new(interface: u32, ip_protocol: IpProtocol) -> Self {
    Self {
      interface,
      ip_protocol,
      instance_name: None,
      service_type: None,
      protocol: None,
      hostname: None,
      port: 0,
      txt: Txt::default(),
      addresses: TinyVec::new(),
      ttl: u32::MAX,
    }
  }

  fn merge_ttl(&mut self, ttl: u32) {
    self.ttl = self.ttl.min(ttl);
  }
}

/// Parameters for a one-shot [`Search`].
#[derive(Debug, Clone)]
pub struct SearchParams {
  pub id: u64,
  pub instance: Option<SmolStr>,
  pub service: Option<SmolStr>,
  pub protocol: Option<SmolStr>,
  pub ty: RecordType,
  pub unicast: bool,
  pub timeout: std::time::Duration,
  pub max_results: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
  Init,
  Running,
  Off,
}

/// Outcome delivered to the caller when a search finalizes: timeouts are
/// not errors, just a (possibly empty) result list (§7 "User-visible
/// failure").
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
  pub results: TinyVec<QueryResult>,
}

/// A one-shot search in progress.
#[derive(Debug)]
pub struct Search {
  pub params: SearchParams,
  pub state: QueryState,
  pub started_at: Instant,
  pub sent_at: Option<Instant>,
  pub results: TinyVec<QueryResult>,
}

impl Search {
  pub fn new(params: SearchParams, now: Instant) -> Self {
    Self {
      params,
      state: QueryState::Init,
      started_at: now,
      sent_at: None,
      results: TinyVec::new(),
    }
  }

  fn find_result_mut(&mut self, interface: u32, ip_protocol: IpProtocol, instance_name: &str) -> Option<&mut QueryResult> {
    self
      .results
      .iter_mut()
      .find(|r| r.interface == interface && r.ip_protocol == ip_protocol && r.instance_name.as_deref() == Some(instance_name))
  }

  /// Applies the merge rules for one decoded record. Returns `true` if a
  /// new result was created or an existing one changed.
  pub fn merge(&mut self, interface: u32, ip_protocol: IpProtocol, instance_name: &str, record: &MergeableRecord) -> bool {
    match record {
      MergeableRecord::Ptr { service, protocol, ttl } => {
        if self.find_result_mut(interface, ip_protocol, instance_name).is_some() {
          return false;
        }
        if self.results.len() >= self.params.max_results.max(1) && self.params.max_results != 0 {
          return false;
        }
        let mut result = QueryResult::new(interface, ip_protocol);
        result.instance_name = Some(SmolStr::new(instance_name));
        result.service_type = Some(service.clone());
        result.protocol = Some(protocol.clone());
        result.merge_ttl(*ttl);
        self.results.push(result);
        true
      }
      MergeableRecord::Srv { hostname, port, ttl } => {
        let Some(result) = self.find_result_mut(interface, ip_protocol, instance_name) else {
          return false;
        };
        if result.hostname.is_some() {
          result.merge_ttl(*ttl);
          return false;
        }
        result.hostname = Some(hostname.clone());
        result.port = *port;
        result.merge_ttl(*ttl);
        true
      }
      MergeableRecord::Txt { txt, ttl } => {
        let Some(result) = self.find_result_mut(interface, ip_protocol, instance_name) else {
          return false;
        };
        result.merge_ttl(*ttl);
        if !result.txt.0.is_empty() {
          return false;
        }
        result.txt = txt.clone();
        true
      }
      MergeableRecord::Address { addr, ttl } => {
        let Some(result) = self.find_result_mut(interface, ip_protocol, instance_name) else {
          return false;
        };
        result.merge_ttl(*ttl);
        if result.addresses.contains(addr) {
          return false;
        }
        result.addresses.push(*addr);
        true
      }
    }
  }

  pub fn is_complete(&self) -> bool {
    self.params.max_results != 0 && self.results.len() >= self.params.max_results
  }
}

/// A record reduced to the fields the merge logic needs, decoupled from the
/// wire representation so `Search`/`Browse` don't need to know about name
/// parsing.
#[derive(Debug, Clone)]
pub enum MergeableRecord {
  Ptr { service: SmolStr, protocol: SmolStr, ttl: u32 },
  Srv { hostname: SmolStr, port: u16, ttl: u32 },
  Txt { txt: Txt, ttl: u32 },
  Address { addr: IpAddr, ttl: u32 },
}

impl MergeableRecord {
  /// Builds from raw rdata. Returns `None` for record types the query
  /// engine doesn't merge (e.g. an unrelated `Raw` record).
  pub fn from_record_data(data: &RecordData, ttl: u32, service: Option<SmolStr>, protocol: Option<SmolStr>) -> Option<Self> {
    match data {
      RecordData::Ptr(_) => Some(MergeableRecord::Ptr {
        service: service?,
        protocol: protocol?,
        ttl,
      }),
      RecordData::Srv { target, port, .. } => Some(MergeableRecord::Srv {
        hostname: SmolStr::new(target.to_dotted()),
        port: *port,
        ttl,
      }),
      RecordData::Txt(strings) => {
        let mut txt = Txt::default();
        for s in strings.iter() {
          let (key, value) = match s.split_once('=') {
            Some((k, v)) => (k, Some(v.as_bytes().to_vec())),
            None => (s.as_str(), None),
          };
          txt.0.push(crate::model::TxtPair::new(key, value));
        }
        Some(MergeableRecord::Txt { txt, ttl })
      }
      RecordData::A(v4) => Some(MergeableRecord::Address { addr: IpAddr::V4(*v4), ttl }),
      RecordData::Aaaa(v6) => Some(MergeableRecord::Address { addr: IpAddr::V6(*v6), ttl }),
      RecordData::Raw(_, _) => None,
    }
  }
}

/// A continuous browse for a `{service, protocol}` pair.
#[derive(Debug)]
pub struct Browse {
  pub service: SmolStr,
  pub protocol: SmolStr,
  pub state: QueryState,
  pub results: TinyVec<QueryResult>,
}

/// One change delivered to a browse notifier: either a result appeared or
/// changed, or a TTL-0 goodbye tore one down.
#[derive(Debug, Clone)]
pub enum BrowseEvent {
  Updated(QueryResult),
  Removed { interface: u32, ip_protocol: IpProtocol, instance_name: SmolStr },
}

/// The handle a caller registers a browse under; `notifier` receives
/// batched [`BrowseEvent`]s.
pub struct BrowseHandle {
  pub service: SmolStr,
  pub protocol: SmolStr,
  pub notifier: async_channel::Sender<TinyVec<BrowseEvent>>,
}

impl std::fmt::Debug for BrowseHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BrowseHandle")
      .field("service", &self.service)
      .field("protocol", &self.protocol)
      .finish_non_exhaustive()
  }
}

impl Browse {
  pub fn new(service: SmolStr, protocol: SmolStr) -> Self {
    Self {
      service,
      protocol,
      state: QueryState::Init,
      results: TinyVec::new(),
    }
  }

  fn find_mut(&mut self, interface: u32, ip_protocol: IpProtocol, instance_name: &str) -> Option<&mut QueryResult> {
    self
      .results
      .iter_mut()
      .find(|r| r.interface == interface && r.ip_protocol == ip_protocol && r.instance_name.as_deref() == Some(instance_name))
  }

  /// Applies an incoming record, returning a batch of zero or more events
  /// to forward to the notifier. A TTL of zero on a record for an existing
  /// result unlinks it after delivering a final `Removed` event.
  pub fn apply(&mut self, interface: u32, ip_protocol: IpProtocol, instance_name: &str, record: &MergeableRecord) -> TinyVec<BrowseEvent> {
    let mut events = TinyVec::new();

    if let MergeableRecord::Ptr { ttl: 0, .. } = record {
      if let Some(pos) = self
        .results
        .iter()
        .position(|r| r.interface == interface && r.ip_protocol == ip_protocol && r.instance_name.as_deref() == Some(instance_name))
      {
        let removed = self.results.remove(pos);
        events.push(BrowseEvent::Removed {
          interface: removed.interface,
          ip_protocol: removed.ip_protocol,
          instance_name: SmolStr::new(instance_name),
        });
      }
      return events;
    }

    if let MergeableRecord::Ptr { service, protocol, ttl } = record {
      if self.find_mut(interface, ip_protocol, instance_name).is_none() {
        let mut result = QueryResult::new(interface, ip_protocol);
        result.instance_name = Some(SmolStr::new(instance_name));
        result.service_type = Some(service.clone());
        result.protocol = Some(protocol.clone());
        result.merge_ttl(*ttl);
        self.results.push(result);
        events.push(BrowseEvent::Updated(self.results.last().unwrap().clone()));
      }
      return events;
    }

    let Some(result) = self.find_mut(interface, ip_protocol, instance_name) else {
      return events;
    };

    let changed = match record {
      MergeableRecord::Srv { hostname, port, ttl } => {
        let changed = result.hostname.as_deref() != Some(hostname.as_str()) || result.port != *port;
        result.hostname = Some(hostname.clone());
        result.port = *port;
        result.merge_ttl(*ttl);
        changed
      }
      MergeableRecord::Txt { txt, ttl } => {
        let changed = !result.txt.set_eq(txt);
        if changed {
          result.txt = txt.clone();
        }
        result.merge_ttl(*ttl);
        changed
      }
      MergeableRecord::Address { addr, ttl } => {
        let changed = !result.addresses.contains(addr);
        if changed {
          result.addresses.push(*addr);
        }
        result.merge_ttl(*ttl);
        changed
      }
      MergeableRecord::Ptr { .. } => false,
    };

    if changed {
      events.push(BrowseEvent::Updated(result.clone()));
    }
    events
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::Ipv4Addr;
  use std::time::Duration;

  fn params() -> SearchParams {
    SearchParams {
      id: 1,
      instance: None,
      service: Some("_http".into()),
      protocol: Some("_tcp".into()),
      ty: RecordType::PTR,
      unicast: false,
      timeout: Duration::from_millis(500),
      max_results: 0,
    }
  }

  #[test]
  fn ptr_then_srv_then_txt_then_address_merge_into_one_result() {
    let mut search = Search::new(params(), Instant::now());
    assert!(search.merge(0, IpProtocol::V4, "printer", &MergeableRecord::Ptr {
      service: "_http".into(),
      protocol: "_tcp".into(),
      ttl: 4500,
    }));
    assert!(search.merge(0, IpProtocol::V4, "printer", &MergeableRecord::Srv {
      hostname: "printer.local".into(),
      port: 631,
      ttl: 120,
    }));
    assert!(search.merge(0, IpProtocol::V4, "printer", &MergeableRecord::Txt {
      txt: Txt::default(),
      ttl: 4500,
    }));
    assert!(search.merge(0, IpProtocol::V4, "printer", &MergeableRecord::Address {
      addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
      ttl: 120,
    }));
    assert_eq!(search.results.len(), 1);
    let r = &search.results[0];
    assert_eq!(r.hostname.as_deref(), Some("printer.local"));
    assert_eq!(r.port, 631);
    assert_eq!(r.addresses.len(), 1);
    assert_eq!(r.ttl, 120);
  }

  #[test]
  fn second_srv_does_not_overwrite_first() {
    let mut search = Search::new(params(), Instant::now());
    search.merge(0, IpProtocol::V4, "printer", &MergeableRecord::Ptr {
      service: "_http".into(),
      protocol: "_tcp".into(),
      ttl: 4500,
    });
    search.merge(0, IpProtocol::V4, "printer", &MergeableRecord::Srv {
      hostname: "first.local".into(),
      port: 1,
      ttl: 120,
    });
    let changed = search.merge(0, IpProtocol::V4, "printer", &MergeableRecord::Srv {
      hostname: "second.local".into(),
      port: 2,
      ttl: 120,
    });
    assert!(!changed);
    assert_eq!(search.results[0].hostname.as_deref(), Some("first.local"));
  }

  #[test]
  fn max_results_caps_new_ptr_results() {
    let mut p = params();
    p.max_results = 1;
    let mut search = Search::new(p, Instant::now());
    search.merge(0, IpProtocol::V4, "a", &MergeableRecord::Ptr { service: "_http".into(), protocol: "_tcp".into(), ttl: 10 });
    assert!(search.is_complete());
    let created = search.merge(0, IpProtocol::V4, "b", &MergeableRecord::Ptr { service: "_http".into(), protocol: "_tcp".into(), ttl: 10 });
    assert!(!created);
    assert_eq!(search.results.len(), 1);
  }

  #[test]
  fn browse_ttl_zero_removes_result() {
    let mut browse = Browse::new("_http".into(), "_tcp".into());
    browse.apply(0, IpProtocol::V4, "printer", &MergeableRecord::Ptr { service: "_http".into(), protocol: "_tcp".into(), ttl: 4500 });
    assert_eq!(browse.results.len(), 1);
    let events = browse.apply(0, IpProtocol::V4, "printer", &MergeableRecord::Ptr { service: "_http".into(), protocol: "_tcp".into(), ttl: 0 });
    assert_eq!(browse.results.len(), 0);
    assert!(matches!(events[0], BrowseEvent::Removed { .. }));
  }

  #[test]
  fn browse_txt_change_triggers_update_event() {
    let mut browse = Browse::new("_http".into(), "_tcp".into());
    browse.apply(0, IpProtocol::V4, "printer", &MergeableRecord::Ptr { service: "_http".into(), protocol: "_tcp".into(), ttl: 4500 });
    let mut txt = Txt::default();
    txt.0.push(crate::model::TxtPair::new("v", Some(b"1".to_vec())));
    let events = browse.apply(0, IpProtocol::V4, "printer", &MergeableRecord::Txt { txt, ttl: 4500 });
    assert_eq!(events.len(), 1);
  }
}
