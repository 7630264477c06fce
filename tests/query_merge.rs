//! Black-box coverage of the query engine's merge rules (§4.3): a one-shot
//! search assembling PTR+SRV+TXT+A answers spread across separate records
//! into one result, and a continuous browse tearing a result down on a
//! TTL-0 goodbye. Synthetic answers are injected straight through
//! `Action::RxHandle`, bypassing the transport and the real probe/announce
//! timers so the test doesn't need to wait on them.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use mdns_engine::action::{Action, RxDatagram};
use mdns_engine::config::EngineConfig;
use mdns_engine::engine::{Engine, SearchParamsInput};
use mdns_engine::net::LoopbackTransport;
use mdns_engine::pcb::IpProtocol;
use mdns_engine::wire::{encode_message, Header, Message, Name, Record, RecordData, RecordType};
use smallvec_wrapper::TinyVec;
use triomphe::Arc;

fn answer_datagram(records: Vec<Record>) -> RxDatagram {
  let message = Message {
    header: Header { id: 0, query: false, authoritative: true, ..Default::default() },
    answers: records.into_iter().collect(),
    ..Default::default()
  };
  let bytes = encode_message(&message).unwrap();
  RxDatagram {
    interface: 0,
    protocol: IpProtocol::V4,
    src: "10.0.0.9:5353".parse().unwrap(),
    multicast: true,
    bytes: Arc::from(bytes.as_slice()),
  }
}

fn ptr_record(ttl: u32) -> Record {
  Record {
    name: Name::from_dotted("_http._tcp.local"),
    ttl,
    flush: false,
    data: RecordData::Ptr(Name::from_dotted("printer._http._tcp.local")),
  }
}

fn srv_record() -> Record {
  Record {
    name: Name::from_dotted("printer._http._tcp.local"),
    ttl: 120,
    flush: true,
    data: RecordData::Srv { priority: 0, weight: 0, port: 631, target: Name::from_dotted("printer.local") },
  }
}

fn txt_record() -> Record {
  Record {
    name: Name::from_dotted("printer._http._tcp.local"),
    ttl: 120,
    flush: true,
    data: RecordData::Txt(TinyVec::from_iter([smol_str::SmolStr::new("path=/print")])),
  }
}

fn a_record() -> Record {
  Record {
    name: Name::from_dotted("printer.local"),
    ttl: 120,
    flush: true,
    data: RecordData::A(Ipv4Addr::new(10, 0, 0, 50)),
  }
}

#[tokio::test]
async fn one_shot_query_merges_records_spread_across_packets_by_instance() {
  let (engine_side, _test_side) = LoopbackTransport::pair(0, IpProtocol::V4);
  let engine = Engine::new(EngineConfig::new("alpha"), Arc::new(engine_side));

  let params = SearchParamsInput {
    instance: None,
    service: Some("_http".into()),
    protocol: Some("_tcp".into()),
    ty: RecordType::PTR,
    unicast: false,
    timeout: Duration::from_millis(250),
    max_results: 0,
  };

  let query_fut = engine.query(params);
  let inject_fut = async {
    // The PTR's owner name carries no instance at all ("_http._tcp.local");
    // the instance lives in its rdata target. SRV/TXT/A are keyed by that
    // instance's own name, arriving as if from three separate packets.
    engine.action_queue().enqueue(Action::RxHandle(answer_datagram(vec![ptr_record(4500)]))).await.unwrap();
    engine.action_queue().enqueue(Action::RxHandle(answer_datagram(vec![srv_record()]))).await.unwrap();
    engine.action_queue().enqueue(Action::RxHandle(answer_datagram(vec![txt_record(), a_record()]))).await.unwrap();
  };

  let (outcome, _) = tokio::join!(query_fut, inject_fut);
  let outcome = outcome.unwrap();

  assert_eq!(outcome.results.len(), 1, "PTR/SRV/TXT/A for the same instance merge into one result");
  let result = &outcome.results[0];
  assert_eq!(result.instance_name.as_deref(), Some("printer"));
  assert_eq!(result.service_type.as_deref(), Some("_http"));
  assert_eq!(result.hostname.as_deref(), Some("printer.local"));
  assert_eq!(result.port, 631);
  assert_eq!(result.addresses, [IpAddr::V4(Ipv4Addr::new(10, 0, 0, 50))].into_iter().collect::<smallvec_wrapper::TinyVec<_>>());
  assert_eq!(result.ttl, 120, "TTL tracks the minimum across all merged records");

  engine.shutdown().await;
}

#[tokio::test]
async fn browse_notifies_on_appearance_and_on_ttl_zero_teardown() {
  let (engine_side, _test_side) = LoopbackTransport::pair(0, IpProtocol::V4);
  let engine = Engine::new(EngineConfig::new("alpha"), Arc::new(engine_side));

  let events = engine.browse("_http", "_tcp").await.unwrap();

  engine.action_queue().enqueue(Action::RxHandle(answer_datagram(vec![ptr_record(4500)]))).await.unwrap();
  let first = tokio::time::timeout(Duration::from_millis(500), events.recv()).await.unwrap().unwrap();
  assert_eq!(first.len(), 1);
  assert!(matches!(&first[0], mdns_engine::query::BrowseEvent::Updated(r) if r.instance_name.as_deref() == Some("printer")));

  engine.action_queue().enqueue(Action::RxHandle(answer_datagram(vec![srv_record()]))).await.unwrap();
  let second = tokio::time::timeout(Duration::from_millis(500), events.recv()).await.unwrap().unwrap();
  assert!(matches!(&second[0], mdns_engine::query::BrowseEvent::Updated(r) if r.hostname.as_deref() == Some("printer.local")));

  engine.action_queue().enqueue(Action::RxHandle(answer_datagram(vec![ptr_record(0)]))).await.unwrap();
  let third = tokio::time::timeout(Duration::from_millis(500), events.recv()).await.unwrap().unwrap();
  assert_eq!(third.len(), 1);
  assert!(matches!(&third[0], mdns_engine::query::BrowseEvent::Removed { instance_name, .. } if instance_name == "printer"));

  engine.shutdown().await;
}
