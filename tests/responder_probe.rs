//! Black-box coverage of the probe/announce/defend lifecycle, driving the
//! public `Engine` API over a `LoopbackTransport` pair instead of a real
//! socket.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use mdns_engine::action::Action;
use mdns_engine::config::EngineConfig;
use mdns_engine::engine::Engine;
use mdns_engine::model::{ServiceInstance, Txt};
use mdns_engine::net::{LoopbackTransport, Transport};
use mdns_engine::pcb::IpProtocol;
use mdns_engine::wire::{decode_message, encode_message, Header, Message, Name, Record, RecordData, RecordType};
use smallvec_wrapper::TinyVec;
use triomphe::Arc;

fn http_service(instance: &str) -> ServiceInstance {
  ServiceInstance {
    service_type: "_http".into(),
    protocol: "_tcp".into(),
    instance_name: instance.into(),
    hostname: "alpha".into(),
    port: 8080,
    priority: 0,
    weight: 0,
    txt: Txt::default(),
    subtypes: TinyVec::new(),
  }
}

async fn recv_answer(test_side: &LoopbackTransport, ty: RecordType, within_attempts: usize) -> Option<Record> {
  for _ in 0..within_attempts {
    let Ok(Ok(inbound)) = tokio::time::timeout(Duration::from_millis(500), test_side.recv()).await else { continue };
    let Ok(message) = decode_message(&inbound.bytes) else { continue };
    if let Some(record) = message.answers.into_iter().find(|r| r.data.ty() == ty) {
      return Some(record);
    }
  }
  None
}

#[tokio::test]
async fn probe_and_announce_reach_the_wire() {
  let (engine_side, test_side) = LoopbackTransport::pair(0, IpProtocol::V4);
  let engine = Engine::new(EngineConfig::new("alpha"), Arc::new(engine_side));

  engine
    .action_queue()
    .enqueue(Action::InterfaceUp { interface: 0, protocol: IpProtocol::V4, address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)) })
    .await
    .unwrap();
  engine.add_service(http_service("printer")).await.unwrap();

  let srv = recv_answer(&test_side, RecordType::SRV, 60).await;
  let srv = srv.expect("expected an announce packet carrying an SRV record");
  assert!(srv.flush, "announced SRV records carry the cache-flush bit");

  engine.shutdown().await;
}

#[tokio::test]
async fn losing_a_conflict_mangles_the_instance_name() {
  let (engine_side, test_side) = LoopbackTransport::pair(0, IpProtocol::V4);
  let engine = Engine::new(EngineConfig::new("alpha"), Arc::new(engine_side));

  engine
    .action_queue()
    .enqueue(Action::InterfaceUp { interface: 0, protocol: IpProtocol::V4, address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)) })
    .await
    .unwrap();
  engine.add_service(http_service("printer")).await.unwrap();

  // Wait for the engine's first probe question to go out, confirming it's
  // mid-probe, then inject an authority record for the same SRV name whose
  // target sorts alphanumerically higher than anything "printer.local"
  // could produce, so the peer always wins the conflict.
  let mut probing = false;
  for _ in 0..20 {
    let Ok(Ok(inbound)) = tokio::time::timeout(Duration::from_millis(500), test_side.recv()).await else { continue };
    if let Ok(message) = decode_message(&inbound.bytes) {
      if message.header.query && !message.questions.is_empty() {
        probing = true;
        break;
      }
    }
  }
  assert!(probing, "expected the engine to start probing for its service");

  let conflicting = Message {
    header: Header { id: 0, query: true, ..Default::default() },
    authority: std::iter::once(Record {
      name: Name::from_dotted("printer._http._tcp.local"),
      ttl: 120,
      flush: true,
      data: RecordData::Srv { priority: 0, weight: 0, port: 8080, target: Name::from_dotted("zzzzzzzz.local") },
    })
    .collect(),
    ..Default::default()
  };
  let bytes = encode_message(&conflicting).unwrap();
  test_side.send(0, IpProtocol::V4, "224.0.0.251:5353".parse().unwrap(), &bytes).await.unwrap();

  // The engine should restart probing and, once it reaches announce, should
  // be advertising the mangled "printer-2" instance rather than "printer".
  let mut saw_mangled = false;
  for _ in 0..80 {
    let Ok(Ok(inbound)) = tokio::time::timeout(Duration::from_millis(500), test_side.recv()).await else { continue };
    let Ok(message) = decode_message(&inbound.bytes) else { continue };
    if message.answers.iter().any(|r| r.name.to_dotted().starts_with("printer-2"))
      || message.questions.iter().any(|q| q.name.to_dotted().starts_with("printer-2"))
    {
      saw_mangled = true;
    }
    if saw_mangled {
      break;
    }
  }
  assert!(saw_mangled, "expected the instance name to be mangled to printer-2 after losing the conflict");

  engine.shutdown().await;
}
