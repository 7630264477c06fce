//! The action queue: the single entry point through which every context
//! other than the service task mutates engine state (§4.4, §5).

use std::net::SocketAddr;

use async_channel::{Receiver, Sender, TrySendError};
use smol_str::SmolStr;
use triomphe::Arc;

use crate::error::MdnsError;
use crate::model::{DelegatedHost, ServiceInstance};
use crate::pcb::IpProtocol;
use crate::query::{BrowseHandle, SearchParams};

/// A raw inbound datagram, tagged with the interface/protocol it arrived on.
#[derive(Debug, Clone)]
pub struct RxDatagram {
  pub interface: u32,
  pub protocol: IpProtocol,
  pub src: SocketAddr,
  pub multicast: bool,
  pub bytes: Arc<[u8]>,
}

/// A completion signal for actions documented as synchronous: hostname set
/// and delegated-host add wait on this before returning to the caller.
pub type Completion = async_channel::Sender<Result<(), MdnsError>>;

/// The action discriminant. Payloads are intentionally small and owned;
/// anything large (packet bytes, service data) is behind an `Arc` so
/// enqueueing never deep-copies.
#[derive(Debug)]
pub enum Action {
  SetHostname { hostname: SmolStr, done: Option<Completion> },
  SetInstance { instance: SmolStr },
  AddDelegatedHost { host: DelegatedHost, done: Option<Completion> },
  RemoveDelegatedHost { hostname: SmolStr },
  AddService { service: ServiceInstance },
  RemoveService { instance_name: SmolStr, service_type: SmolStr, protocol: SmolStr },
  SetServicePort { instance_name: SmolStr, service_type: SmolStr, protocol: SmolStr, port: u16 },
  SetServiceTxt { instance_name: SmolStr, service_type: SmolStr, protocol: SmolStr, txt: crate::model::Txt },
  InterfaceUp { interface: u32, protocol: IpProtocol, address: std::net::IpAddr },
  InterfaceDown { interface: u32, protocol: IpProtocol },
  RxHandle(RxDatagram),
  TxHandle { index: usize },
  SearchAdd { params: SearchParams, result_tx: async_channel::Sender<crate::query::SearchOutcome> },
  SearchEnd { id: u64 },
  SearchSend { id: u64 },
  BrowseAdd { handle: BrowseHandle },
  BrowseDelete { service: SmolStr, protocol: SmolStr },
  Tick,
  TaskStop,
}

/// A bounded, multi-producer single-consumer action queue.
#[derive(Debug, Clone)]
pub struct ActionQueue {
  tx: Sender<Action>,
}

/// The consumer half, owned solely by the service task.
#[derive(Debug)]
pub struct ActionReceiver {
  rx: Receiver<Action>,
}

/// Creates a bounded action queue pair with the given capacity.
pub fn bounded(capacity: usize) -> (ActionQueue, ActionReceiver) {
  let (tx, rx) = async_channel::bounded(capacity);
  (ActionQueue { tx }, ActionReceiver { rx })
}

impl ActionQueue {
  /// Enqueues without waiting; returns [`MdnsError::Transient`] if the
  /// queue is full, so the caller may retry.
  pub fn try_enqueue(&self, action: Action) -> Result<(), MdnsError> {
    self.tx.try_send(action).map_err(|err| match err {
      TrySendError::Full(_) => MdnsError::Transient,
      TrySendError::Closed(_) => MdnsError::InvalidState(SmolStr::new("service task is gone")),
    })
  }

  /// Enqueues, waiting for room if the queue is full.
  pub async fn enqueue(&self, action: Action) -> Result<(), MdnsError> {
    self
      .tx
      .send(action)
      .await
      .map_err(|_| MdnsError::InvalidState(SmolStr::new("service task is gone")))
  }
}

impl ActionReceiver {
  pub async fn recv(&self) -> Option<Action> {
    self.rx.recv().await.ok()
  }
}
