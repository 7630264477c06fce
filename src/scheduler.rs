//! Delay-ordered transmit queue and the timer tick that drains it.
//!
//! The reference design keeps this as a singly linked list sorted by
//! `send_at_ms`, walked from the head on every tick. A `Vec` kept sorted by
//! insertion achieves the same ordering guarantee (strictly non-decreasing
//! `send_at_ms` dispatch, ties broken by enqueue order) without the
//! aliasing concerns a hand-rolled list would carry in safe Rust; the
//! service task is still the only owner so there's no locking either way.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use smallvec_wrapper::TinyVec;

use crate::pcb::IpProtocol;
use crate::wire::Message;

/// An outbound packet awaiting its deadline.
#[derive(Debug, Clone)]
pub struct TxPacket {
  pub interface: u32,
  pub protocol: IpProtocol,
  pub destination: SocketAddr,
  pub send_at: Instant,
  pub message: Message,
  /// Set while an action carrying this packet is in flight, so a tick that
  /// finds the packet still at the head does not double-enqueue it.
  pub queued: bool,
}

impl TxPacket {
  pub fn new(interface: u32, protocol: IpProtocol, destination: SocketAddr, send_at: Instant, message: Message) -> Self {
    Self {
      interface,
      protocol,
      destination,
      send_at,
      message,
      queued: false,
    }
  }
}

/// The TX queue: packets ordered by ascending `send_at`.
#[derive(Debug, Default)]
pub struct TxQueue {
  packets: TinyVec<TxPacket>,
}

impl TxQueue {
  pub fn new() -> Self {
    Self { packets: TinyVec::new() }
  }

  pub fn len(&self) -> usize {
    self.packets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.packets.is_empty()
  }

  /// Inserts keeping the list sorted by `send_at`; O(n), matching the
  /// reference implementation's linked-list insert.
  pub fn insert(&mut self, packet: TxPacket) {
    let pos = self.packets.iter().position(|p| p.send_at > packet.send_at).unwrap_or(self.packets.len());
    self.packets.insert(pos, packet);
  }

  /// Pops every packet at the head whose deadline has passed, marking each
  /// `queued` as it is removed. Returns them in dispatch order.
  pub fn drain_due(&mut self, now: Instant) -> TinyVec<TxPacket> {
    let mut due = TinyVec::new();
    while let Some(front) = self.packets.first() {
      if front.send_at > now {
        break;
      }
      let mut packet = self.packets.remove(0);
      packet.queued = true;
      due.push(packet);
    }
    due
  }

  #[cfg(test)]
  pub fn peek_front_send_at(&self) -> Option<Instant> {
    self.packets.first().map(|p| p.send_at)
  }
}

/// Multicast destinations, per §6.
pub fn multicast_destination(protocol: IpProtocol) -> SocketAddr {
  match protocol {
    #[cfg(feature = "ipv4")]
    IpProtocol::V4 => SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(224, 0, 0, 251)), 5353),
    #[cfg(feature = "ipv6")]
    IpProtocol::V6 => SocketAddr::new(
      IpAddr::V6("ff02::fb".parse().unwrap()),
      5353,
    ),
  }
}

/// Every `tick_interval`, drives the PCB state machine forward and the
/// per-search retransmit schedule. Kept as a free function so `engine.rs`
/// can call it both from a real interval timer and from a test harness
/// stepping a fake clock.
pub fn search_due(started_at: Instant, sent_at: Option<Instant>, timeout: Duration, now: Instant) -> SearchTick {
  if now.saturating_duration_since(started_at) >= timeout {
    return SearchTick::Expired;
  }
  match sent_at {
    None => SearchTick::Send,
    Some(sent) if now.saturating_duration_since(sent) >= Duration::from_millis(1000) => SearchTick::Send,
    Some(_) => SearchTick::Wait,
  }
}

/// Outcome of checking one active search against the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchTick {
  Send,
  Wait,
  Expired,
}
