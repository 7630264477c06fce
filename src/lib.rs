//! A multicast DNS (mDNS) responder and resolver engine.
//!
//! The engine announces and defends local service instances on one or more
//! network interfaces (probe, announce, defend, goodbye) and issues queries
//! and continuous browses for services advertised by peers, merging records
//! that arrive across several packets into coherent results.
//!
//! All state mutation is serialized onto a single service task; every other
//! context — the [`net::Transport`] receive loop, the scheduler tick,
//! control calls — communicates with it through the [`action::ActionQueue`].
//! See [`engine::Engine`] for the entry point.
#![forbid(unsafe_code)]

pub mod action;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod net;
pub mod pcb;
pub mod query;
pub mod responder;
pub mod scheduler;
pub mod wire;

pub use config::EngineConfig;
pub use engine::{Engine, SearchParamsInput};
pub use error::{MdnsError, MdnsResult};

/// The IPv4 mDNS multicast group, `224.0.0.251:5353`.
pub const IPV4_MDNS: std::net::SocketAddrV4 =
  std::net::SocketAddrV4::new(std::net::Ipv4Addr::new(224, 0, 0, 251), net::MDNS_PORT);

/// Reads the local hostname from the OS, the way a newly constructed
/// [`EngineConfig`] defaults its `hostname` field when the host doesn't
/// supply one explicitly.
#[cfg(unix)]
pub fn hostname() -> std::io::Result<smol_str::SmolStr> {
  rustix::system::uname()
    .nodename()
    .to_str()
    .map(smol_str::SmolStr::new)
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "hostname is not valid UTF-8"))
}

#[cfg(windows)]
pub fn hostname() -> std::io::Result<smol_str::SmolStr> {
  hostname::get().map(|os| smol_str::SmolStr::new(os.to_string_lossy()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hostname_reads_something_nonempty() {
    let name = hostname().expect("hostname should be readable on this platform");
    assert!(!name.as_str().is_empty());
  }
}
