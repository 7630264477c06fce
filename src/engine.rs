//! The engine: wires the wire codec, responder, query engine and scheduler
//! together behind the single service task that is the sole mutator of
//! state (§2, §5). `Engine::new` is the control interface's `init`;
//! `Engine::shutdown` is `free`.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use smallvec_wrapper::TinyVec;
use smol_str::SmolStr;
use triomphe::Arc;

use crate::action::{bounded, Action, ActionQueue, ActionReceiver};
use crate::config::EngineConfig;
use crate::error::{MdnsError, MdnsResult};
use crate::model::ServiceInstance;
use crate::net::Transport;
use crate::pcb::{IpProtocol, Pcb, PcbState};
use crate::query::{Browse, BrowseHandle, MergeableRecord, Search, SearchOutcome, SearchParams};
use crate::responder::{compare_rdata, ConflictOutcome, ManglesScope, Responder};
use crate::scheduler::{multicast_destination, search_due, SearchTick, TxPacket, TxQueue};
use crate::wire::{decode_message, encode_message, Message, ParsedName, Question, RecordType};

/// The scope to re-probe after a lost conflict, per §4.2's precedence.
fn scope_for_conflict(state: &EngineState, parsed: &ParsedName) -> Option<(ManglesScope, Option<(SmolStr, SmolStr, SmolStr)>)> {
  if let Some(service) = state
    .responder
    .services
    .iter()
    .find(|s| s.instance_name == parsed.host && s.service_type == parsed.service && s.protocol == parsed.protocol)
  {
    return Some((
      ManglesScope::ServiceInstance,
      Some((service.instance_name.clone(), service.service_type.clone(), service.protocol.clone())),
    ));
  }
  if parsed.host == state.responder.hostname {
    return Some((ManglesScope::Hostname, None));
  }
  None
}

/// A handle the host keeps; dropping it does not stop the engine; call
/// [`Engine::shutdown`] explicitly.
pub struct Engine {
  actions: ActionQueue,
  next_search_id: std::sync::atomic::AtomicU64,
  join: Option<tokio::task::JoinHandle<()>>,
}

impl Engine {
  /// Spawns the service task and returns a handle. This is the control
  /// interface's `init`.
  pub fn new<T: Transport>(config: EngineConfig, transport: Arc<T>) -> Self {
    let (actions, receiver) = bounded(config.action_queue_capacity);
    let actions_for_task = actions.clone();
    let join = tokio::spawn(service_task(config, transport, receiver, actions_for_task));
    Self {
      actions,
      next_search_id: std::sync::atomic::AtomicU64::new(1),
      join: Some(join),
    }
  }

  pub fn action_queue(&self) -> &ActionQueue {
    &self.actions
  }

  pub async fn set_hostname(&self, hostname: impl Into<SmolStr>) -> MdnsResult<()> {
    let (tx, rx) = async_channel::bounded(1);
    self
      .actions
      .enqueue(Action::SetHostname { hostname: hostname.into(), done: Some(tx) })
      .await?;
    rx.recv().await.map_err(|_| MdnsError::InvalidState(SmolStr::new("service task is gone")))?
  }

  pub async fn add_service(&self, service: ServiceInstance) -> MdnsResult<()> {
    self.actions.enqueue(Action::AddService { service }).await
  }

  pub async fn remove_service(&self, instance_name: impl Into<SmolStr>, service_type: impl Into<SmolStr>, protocol: impl Into<SmolStr>) -> MdnsResult<()> {
    self
      .actions
      .enqueue(Action::RemoveService {
        instance_name: instance_name.into(),
        service_type: service_type.into(),
        protocol: protocol.into(),
      })
      .await
  }

  /// Issues a one-shot query; resolves with whatever results were merged
  /// before timeout. A timeout is not an error (§7): an empty result list
  /// is a normal outcome.
  pub async fn query(&self, params: SearchParamsInput) -> MdnsResult<SearchOutcome> {
    let id = self.next_search_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let (result_tx, result_rx) = async_channel::bounded(1);
    self
      .actions
      .enqueue(Action::SearchAdd {
        params: SearchParams {
          id,
          instance: params.instance,
          service: params.service,
          protocol: params.protocol,
          ty: params.ty,
          unicast: params.unicast,
          timeout: params.timeout,
          max_results: params.max_results,
        },
        result_tx,
      })
      .await?;
    result_rx
      .recv()
      .await
      .map_err(|_| MdnsError::InvalidState(SmolStr::new("service task is gone")))
  }

  pub async fn browse(&self, service: impl Into<SmolStr>, protocol: impl Into<SmolStr>) -> MdnsResult<async_channel::Receiver<TinyVec<crate::query::BrowseEvent>>> {
    let (notifier, events) = async_channel::unbounded();
    self
      .actions
      .enqueue(Action::BrowseAdd {
        handle: BrowseHandle {
          service: service.into(),
          protocol: protocol.into(),
          notifier,
        },
      })
      .await?;
    Ok(events)
  }

  /// Drains and joins the service task. This is the control interface's `free`.
  pub async fn shutdown(mut self) {
    let _ = self.actions.enqueue(Action::TaskStop).await;
    if let Some(join) = self.join.take() {
      let _ = join.await;
    }
  }
}

/// Friendlier input for [`Engine::query`]; `SearchParams` additionally
/// carries the internally assigned id.
#[derive(Debug, Clone)]
pub struct SearchParamsInput {
  pub instance: Option<SmolStr>,
  pub service: Option<SmolStr>,
  pub protocol: Option<SmolStr>,
  pub ty: RecordType,
  pub unicast: bool,
  pub timeout: Duration,
  pub max_results: usize,
}

struct EngineState {
  responder: Responder,
  pcbs: Vec<Pcb>,
  tx_queue: TxQueue,
  searches: Vec<(Search, async_channel::Sender<SearchOutcome>)>,
  browses: Vec<(Browse, async_channel::Sender<TinyVec<crate::query::BrowseEvent>>)>,
  config: EngineConfig,
}

impl EngineState {
  fn interface_addresses(&self, protocol: IpProtocol) -> TinyVec<IpAddr> {
    let mut addrs = TinyVec::new();
    for pcb in self.pcbs.iter().filter(|p| p.protocol == protocol && matches!(p.state, PcbState::Running)) {
      addrs.push(pcb.address);
    }
    addrs
  }
}

async fn service_task<T: Transport>(config: EngineConfig, transport: Arc<T>, receiver: ActionReceiver, actions: ActionQueue) {
  let instance = config.instance_or_hostname();
  let mut state = EngineState {
    responder: Responder::new(config.hostname.clone(), instance),
    pcbs: Vec::new(),
    tx_queue: TxQueue::new(),
    searches: Vec::new(),
    browses: Vec::new(),
    config,
  };

  let mut tick = tokio::time::interval(state.config.tick_interval);

  loop {
    let recv_fut = transport.recv();
    let action_fut = receiver.recv();
    tokio::pin!(recv_fut);
    tokio::pin!(action_fut);

    tokio::select! {
      _ = tick.tick() => {
        run_tick(&mut state, &transport, &actions).await;
      }
      inbound = &mut recv_fut => {
        if let Ok(inbound) = inbound {
          handle_inbound(&mut state, &transport, inbound).await;
        }
      }
      action = &mut action_fut => {
        match action {
          Some(Action::TaskStop) | None => break,
          Some(action) => handle_action(&mut state, &transport, action).await,
        }
      }
    }
  }

  tracing::info!("service task stopping, sending goodbye for owned services");
  // Goodbye: withdraw every owned service on shutdown (§4.2 "Goodbye").
  let services: Vec<_> = state.responder.services.iter().cloned().collect();
  for service in services {
    let addrs = state.interface_addresses(default_ip_protocol());
    let records = state.responder.goodbye_records(&service, &addrs);
    let message = Message {
      header: crate::wire::Header { id: 0, query: false, authoritative: true, ..Default::default() },
      answers: records.into_iter().collect(),
      ..Default::default()
    };
    if let Ok(bytes) = encode_message(&message) {
      for pcb in state.pcbs.iter() {
        let _ = transport.send(pcb.interface, pcb.protocol, multicast_destination(pcb.protocol), &bytes).await;
      }
    }
  }
}

#[cfg(feature = "ipv4")]
fn default_ip_protocol() -> IpProtocol {
  IpProtocol::V4
}
#[cfg(all(not(feature = "ipv4"), feature = "ipv6"))]
fn default_ip_protocol() -> IpProtocol {
  IpProtocol::V6
}

/// Schedules the first probe packet for a PCB that just entered `Probe1`,
/// whether from `Init` on a routine tick or from a conflict-triggered
/// `restart_probe` (§4.2 "Defend" re-enters probing the same way a fresh
/// interface does).
fn schedule_first_probe(tx_queue: &mut TxQueue, responder: &Responder, pcb: &Pcb, now: Instant) {
  let delay = pcb.first_probe_delay(rand::random::<u32>());
  let questions = responder.probe_questions(&pcb.probing_services, pcb.probing_host, true);
  let message = Message {
    header: crate::wire::Header { id: 0, query: true, ..Default::default() },
    questions: questions.into_iter().collect(),
    ..Default::default()
  };
  tx_queue.insert(TxPacket::new(pcb.interface, pcb.protocol, multicast_destination(pcb.protocol), now + delay, message));
}

async fn run_tick<T: Transport>(state: &mut EngineState, transport: &Arc<T>, actions: &ActionQueue) {
  let now = Instant::now();

  for pcb in state.pcbs.iter_mut() {
    if pcb.state == PcbState::Init {
      pcb.state = PcbState::Probe1;
      schedule_first_probe(&mut state.tx_queue, &state.responder, pcb, now);
    }
  }

  let due = state.tx_queue.drain_due(now);
  for packet in due {
    if let Ok(bytes) = encode_message(&packet.message) {
      let _ = transport.send(packet.interface, packet.protocol, packet.destination, &bytes).await;
    }
    let pcb_update = state
      .pcbs
      .iter_mut()
      .find(|p| p.interface == packet.interface && p.protocol == packet.protocol)
      .map(|pcb| {
        let prev_state = pcb.state;
        pcb.advance_after_send();
        (prev_state, pcb.interface, pcb.protocol, pcb.probing_services.clone(), pcb.probing_host)
      });
    if let Some((prev_state, interface, protocol, probing_services, probing_host)) = pcb_update {
      match prev_state {
        PcbState::Probe1 | PcbState::Probe2 => {
          let delay = Duration::from_millis(250);
          let questions = state.responder.probe_questions(&probing_services, probing_host, false);
          let message = Message {
            header: crate::wire::Header { id: 0, query: true, ..Default::default() },
            questions: questions.into_iter().collect(),
            ..Default::default()
          };
          state.tx_queue.insert(TxPacket::new(interface, protocol, packet.destination, now + delay, message));
        }
        PcbState::Probe3 | PcbState::Announce1 | PcbState::Announce2 => {
          let delay = prev_state.next_delay();
          let addrs = state.interface_addresses(protocol);
          let records = state.responder.announce_records(&probing_services, &addrs);
          let message = Message {
            header: crate::wire::Header { id: 0, query: false, authoritative: true, ..Default::default() },
            answers: records.into_iter().collect(),
            ..Default::default()
          };
          state.tx_queue.insert(TxPacket::new(interface, protocol, packet.destination, now + delay, message));
        }
        _ => {}
      }
    }
  }

  let mut finished = Vec::new();
  for (idx, (search, _)) in state.searches.iter_mut().enumerate() {
    match search_due(search.started_at, search.sent_at, search.params.timeout, now) {
      SearchTick::Expired => finished.push(idx),
      SearchTick::Send => {
        search.sent_at = Some(now);
        let question = Question {
          name: search_question_name(&search.params),
          ty: search.params.ty,
          unicast_response: search.params.unicast,
        };
        let message = Message {
          header: crate::wire::Header { id: 0, query: true, ..Default::default() },
          questions: std::iter::once(question).collect(),
          ..Default::default()
        };
        if let Ok(bytes) = encode_message(&message) {
          for pcb in state.pcbs.iter() {
            let _ = transport.send(pcb.interface, pcb.protocol, multicast_destination(pcb.protocol), &bytes).await;
          }
        }
      }
      SearchTick::Wait => {}
    }
  }
  for idx in finished.into_iter().rev() {
    let (search, tx) = state.searches.remove(idx);
    let _ = tx.send(SearchOutcome { results: search.results }).await;
  }

  let _ = actions;
}

fn search_question_name(params: &SearchParams) -> crate::wire::Name {
  match (&params.instance, &params.service, &params.protocol) {
    (Some(instance), Some(service), Some(protocol)) => crate::wire::Name::from_dotted(&format!("{instance}.{service}.{protocol}.local")),
    (None, Some(service), Some(protocol)) => crate::wire::Name::from_dotted(&format!("{service}.{protocol}.local")),
    _ => crate::wire::Name::from_dotted("local"),
  }
}

async fn handle_action<T: Transport>(state: &mut EngineState, transport: &Arc<T>, action: Action) {
  let _ = transport;
  match action {
    Action::SetHostname { hostname, done } => {
      state.responder.hostname = hostname.clone();
      state.responder.self_host.hostname = hostname;
      if let Some(done) = done {
        let _ = done.send(Ok(())).await;
      }
    }
    Action::SetInstance { instance } => {
      state.responder.instance = instance;
    }
    Action::AddDelegatedHost { host, done } => {
      state.responder.hosts.push(host);
      if let Some(done) = done {
        let _ = done.send(Ok(())).await;
      }
    }
    Action::RemoveDelegatedHost { hostname } => {
      state.responder.hosts.retain(|h| h.hostname != hostname);
    }
    Action::AddService { service } => {
      let fqdn = service.instance_fqdn();
      if state.responder.add_service(service).is_ok() {
        for pcb in state.pcbs.iter_mut() {
          pcb.probing_services.push(fqdn.clone());
          if matches!(pcb.state, PcbState::Running) {
            pcb.state = PcbState::Init;
          } else if matches!(pcb.state, PcbState::Off) {
            pcb.enable();
          }
        }
      }
    }
    Action::RemoveService { instance_name, service_type, protocol } => {
      if let Some(service) = state.responder.remove_service(&instance_name, &service_type, &protocol) {
        let addrs = state.interface_addresses(default_ip_protocol());
        let records = state.responder.goodbye_records(&service, &addrs);
        let message = Message {
          header: crate::wire::Header { id: 0, query: false, authoritative: true, ..Default::default() },
          answers: records.into_iter().collect(),
          ..Default::default()
        };
        if let Ok(bytes) = encode_message(&message) {
          for pcb in state.pcbs.iter() {
            let _ = transport.send(pcb.interface, pcb.protocol, multicast_destination(pcb.protocol), &bytes).await;
          }
        }
      }
    }
    Action::SetServicePort { instance_name, service_type, protocol, port } => {
      if let Some(svc) = state
        .responder
        .services
        .iter_mut()
        .find(|s| s.instance_name == instance_name && s.service_type == service_type && s.protocol == protocol)
      {
        svc.port = port;
      }
    }
    Action::SetServiceTxt { instance_name, service_type, protocol, txt } => {
      if let Some(svc) = state
        .responder
        .services
        .iter_mut()
        .find(|s| s.instance_name == instance_name && s.service_type == service_type && s.protocol == protocol)
      {
        svc.txt = txt;
      }
    }
    Action::InterfaceUp { interface, protocol, address } => {
      if !state.pcbs.iter().any(|p| p.interface == interface && p.protocol == protocol) {
        tracing::info!(interface, protocol = ?protocol, %address, "interface up, starting probe");
        let mut pcb = Pcb::new(interface, protocol, address);
        pcb.probing_services = state.responder.services.iter().map(|s| s.instance_fqdn()).collect();
        pcb.probing_host = true;
        pcb.enable();
        state.pcbs.push(pcb);
      }
    }
    Action::InterfaceDown { interface, protocol } => {
      tracing::info!(interface, protocol = ?protocol, "interface down");
      state.pcbs.retain(|p| !(p.interface == interface && p.protocol == protocol));
    }
    Action::RxHandle(datagram) => {
      handle_rx(state, transport, datagram).await;
    }
    Action::TxHandle { .. } => {}
    Action::SearchAdd { params, result_tx } => {
      let search = Search::new(params, Instant::now());
      state.searches.push((search, result_tx));
    }
    Action::SearchEnd { id } => {
      if let Some(pos) = state.searches.iter().position(|(s, _)| s.params.id == id) {
        let (search, tx) = state.searches.remove(pos);
        let _ = tx.send(SearchOutcome { results: search.results }).await;
      }
    }
    Action::SearchSend { .. } => {}
    Action::BrowseAdd { handle } => {
      state.browses.push((Browse::new(handle.service, handle.protocol), handle.notifier));
    }
    Action::BrowseDelete { service, protocol } => {
      state.browses.retain(|(b, _)| !(b.service == service && b.protocol == protocol));
    }
    Action::Tick | Action::TaskStop => {}
  }
}

async fn handle_inbound<T: Transport>(state: &mut EngineState, transport: &Arc<T>, inbound: crate::net::Inbound) {
  let datagram = crate::action::RxDatagram {
    interface: inbound.interface,
    protocol: inbound.protocol,
    src: inbound.src,
    multicast: inbound.multicast,
    bytes: inbound.bytes,
  };
  handle_rx(state, transport, datagram).await;
}

async fn handle_rx<T: Transport>(state: &mut EngineState, transport: &Arc<T>, datagram: crate::action::RxDatagram) {
  let message = match decode_message(&datagram.bytes) {
    Ok(message) => message,
    Err(err) => {
      tracing::warn!(interface = datagram.interface, src = %datagram.src, error = %err, "dropped malformed mDNS packet");
      return;
    }
  };

  // Query-engine merge: feed every answer record into active searches/browses.
  for record in message.answers.iter().chain(message.authority.iter()).chain(message.additional.iter()) {
    let parsed = ParsedName::parse(&record.name);
    // A PTR's owner name is just `_service._proto.local`; the instance lives
    // in its rdata target (`instance._service._proto.local`), not the owner.
    // Every other type we merge (SRV/TXT/A/AAAA) is owned by the instance or
    // hostname directly, so `record.name` itself carries it.
    let instance_parsed = match &record.data {
      crate::wire::RecordData::Ptr(target) => ParsedName::parse(target),
      _ => parsed.clone(),
    };
    let instance_name = if instance_parsed.host.is_empty() { instance_parsed.service.as_str() } else { instance_parsed.host.as_str() };
    let merge_service = if parsed.service.is_empty() { None } else { Some(parsed.service.clone()) };
    let merge_protocol = if parsed.protocol.is_empty() { None } else { Some(parsed.protocol.clone()) };
    if let Some(merged) = MergeableRecord::from_record_data(&record.data, record.ttl, merge_service, merge_protocol) {
      for (search, _) in state.searches.iter_mut() {
        search.merge(datagram.interface, datagram.protocol, instance_name, &merged);
      }
      for (browse, notifier) in state.browses.iter_mut() {
        if browse.service == parsed.service || matches!(&merged, MergeableRecord::Srv { .. } | MergeableRecord::Txt { .. } | MergeableRecord::Address { .. }) {
          let events = browse.apply(datagram.interface, datagram.protocol, instance_name, &merged);
          if !events.is_empty() {
            let _ = notifier.send(events).await;
          }
        }
      }
    }
  }

  let pcb = state.pcbs.iter().find(|p| p.interface == datagram.interface && p.protocol == datagram.protocol).cloned();

  // The address(es) we'd claim if asked right now: while a PCB exists (even
  // mid-probe) that's its own bound address, so a conflicting probe or
  // answer can be caught and defended before we ever reach RUNNING.
  let own_addrs: TinyVec<IpAddr> = match &pcb {
    Some(pcb) => TinyVec::from_iter([pcb.address]),
    None => state.interface_addresses(datagram.protocol),
  };

  // Conflict check: an authority-section record alongside a peer's probe,
  // or a differing answer-section record, targeting a name we own.
  // Lexicographic rdata comparison decides who keeps the name (§4.2
  // "Defend"); this runs regardless of PCB state so a conflict surfacing
  // during our own probe is caught immediately rather than only once
  // we've reached RUNNING.
  for record in message.authority.iter().chain(message.answers.iter()) {
    let parsed = ParsedName::parse(&record.name);
    let Some(ours) = state.responder.owned_rdata(&parsed, record.data.ty(), &own_addrs) else { continue };
    if ours == record.data {
      continue;
    }
    let outcome = compare_rdata(&ours.encode_rdata(), &record.data.encode_rdata());
    if outcome == ConflictOutcome::TheyWin {
      if let Some((scope, identity)) = scope_for_conflict(state, &parsed) {
        state.responder.mangle_scope(scope, identity);
        if let Some(pos) = state.pcbs.iter().position(|p| p.interface == datagram.interface && p.protocol == datagram.protocol) {
          state.pcbs[pos].restart_probe();
          let pcb = state.pcbs[pos].clone();
          schedule_first_probe(&mut state.tx_queue, &state.responder, &pcb, Instant::now());
        }
      }
    }
  }

  // Answer generation only once this PCB is fully RUNNING; probing PCBs
  // don't yet own the name and must not answer for it.
  let Some(pcb) = pcb else { return };
  if !matches!(pcb.state, PcbState::Running) {
    return;
  }

  let addrs = state.interface_addresses(datagram.protocol);
  let mut answers = Vec::new();
  let mut additional = Vec::new();
  for question in message.questions.iter() {
    let set = state.responder.answer_question(&question.name, question.ty, &addrs);
    answers.extend(set.answers.into_iter());
    additional.extend(set.additional.into_iter());
  }

  if answers.is_empty() {
    return;
  }
  let unicast = message.header.query && datagram.src.port() != crate::net::MDNS_PORT;
  let dst = if unicast { datagram.src } else { multicast_destination(datagram.protocol) };
  let response = Message {
    header: crate::wire::Header { id: message.header.id, query: false, authoritative: true, ..Default::default() },
    answers: answers.into_iter().collect(),
    additional: additional.into_iter().collect(),
    ..Default::default()
  };
  if let Ok(bytes) = encode_message(&response) {
    let _ = transport.send(datagram.interface, datagram.protocol, dst, &bytes).await;
  }
}
