//! Per-interface responder control block: the probe/announce/run state
//! machine of §4.2, plus the duplicate-interface tiebreak from the design
//! notes' open questions.

use std::net::IpAddr;
use std::time::Duration;

use smallvec_wrapper::TinyVec;
use smol_str::SmolStr;

/// Which IP family a [`Pcb`] answers on. Each interface gets one `Pcb` per
/// enabled family, mirroring the original's separate IPv4/IPv6 compile-time
/// paths made symmetric and runtime-selected here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProtocol {
  #[cfg(feature = "ipv4")]
  V4,
  #[cfg(feature = "ipv6")]
  V6,
}

/// The responder state machine for one PCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcbState {
  Off,
  Init,
  Probe1,
  Probe2,
  Probe3,
  Announce1,
  Announce2,
  Announce3,
  Running,
  /// This PCB's interface is recognized as the same link as another,
  /// already-running PCB; it defers to the peer and answers nothing.
  Dup,
}

impl PcbState {
  /// The delay before the next scheduled action leaves this state, per the
  /// timing table in §4.2.
  pub fn next_delay(self) -> Duration {
    match self {
      PcbState::Probe1 | PcbState::Probe2 | PcbState::Announce1 => Duration::from_millis(250),
      PcbState::Probe3 => Duration::from_millis(250),
      PcbState::Announce2 => Duration::from_millis(1000),
      _ => Duration::ZERO,
    }
  }

  pub fn is_probing(self) -> bool {
    matches!(self, PcbState::Probe1 | PcbState::Probe2 | PcbState::Probe3)
  }

  pub fn is_announcing(self) -> bool {
    matches!(self, PcbState::Announce1 | PcbState::Announce2 | PcbState::Announce3)
  }
}

/// The outcome of comparing two PCBs believed to be on the same link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateOutcome {
  /// `self`'s address sorts lower; it stays active, the other should move
  /// to `Dup`.
  KeepSelf,
  /// The other's address sorts lower; `self` should move to `Dup`.
  DeferToOther,
}

/// Per (interface, IP-protocol) responder control block.
#[derive(Debug, Clone)]
pub struct Pcb {
  pub interface: u32,
  pub protocol: IpProtocol,
  pub state: PcbState,
  pub address: IpAddr,
  /// Service identity tuples (as `instance_fqdn`) currently being probed or
  /// announced on this PCB.
  pub probing_services: TinyVec<SmolStr>,
  /// Set if the self-host's address is also being probed/announced here.
  pub probing_host: bool,
  pub failed_probes: u32,
}

impl Pcb {
  pub fn new(interface: u32, protocol: IpProtocol, address: IpAddr) -> Self {
    Self {
      interface,
      protocol,
      state: PcbState::Off,
      address,
      probing_services: TinyVec::new(),
      probing_host: false,
      failed_probes: 0,
    }
  }

  /// Jitter before the very first probe on this PCB: `120ms + rand(0..127)`,
  /// or `1000ms + rand(0..127)` once more than five probes have already
  /// failed (the PCB's own back-off, not a global one).
  pub fn first_probe_delay(&self, jitter_ms: u32) -> Duration {
    let jitter = Duration::from_millis(jitter_ms as u64 % 128);
    let base = if self.failed_probes > 5 {
      Duration::from_millis(1000)
    } else {
      Duration::from_millis(120)
    };
    base + jitter
  }

  pub fn enable(&mut self) {
    if matches!(self.state, PcbState::Off) {
      self.state = PcbState::Init;
    }
  }

  pub fn disable(&mut self) {
    self.state = PcbState::Off;
    self.probing_services.clear();
    self.probing_host = false;
  }

  /// Advances the state machine on a successful TX dispatch of the packet
  /// that was outstanding for this PCB's current state, per §4.4's
  /// "TX dispatch" post-send rule table.
  pub fn advance_after_send(&mut self) {
    let from = self.state;
    self.state = match self.state {
      PcbState::Probe1 => PcbState::Probe2,
      PcbState::Probe2 => PcbState::Probe3,
      PcbState::Probe3 => PcbState::Announce1,
      PcbState::Announce1 => PcbState::Announce2,
      PcbState::Announce2 => PcbState::Announce3,
      PcbState::Announce3 => PcbState::Running,
      other => other,
    };
    if from != self.state {
      tracing::debug!(
        interface = self.interface,
        protocol = ?self.protocol,
        from = ?from,
        to = ?self.state,
        "pcb state transition"
      );
    }
  }

  /// Restarts probing after a lost conflict: back to `Probe1`, failed-probe
  /// counter bumped so the next jitter uses the backed-off base delay.
  pub fn restart_probe(&mut self) {
    tracing::info!(
      interface = self.interface,
      protocol = ?self.protocol,
      failed_probes = self.failed_probes + 1,
      "restarting probe after lost conflict"
    );
    self.state = PcbState::Probe1;
    self.failed_probes += 1;
  }

  /// Compares two PCBs believed to be on the same link. Lower raw address
  /// bytes wins and stays active; this is the documented, if arbitrary,
  /// convention rather than an invented one.
  pub fn resolve_duplicate(&self, other: &Pcb) -> DuplicateOutcome {
    let ours = addr_bytes(self.address);
    let theirs = addr_bytes(other.address);
    if ours <= theirs {
      DuplicateOutcome::KeepSelf
    } else {
      DuplicateOutcome::DeferToOther
    }
  }
}

fn addr_bytes(addr: IpAddr) -> TinyVec<u8> {
  match addr {
    IpAddr::V4(v4) => TinyVec::from_iter(v4.octets()),
    IpAddr::V6(v6) => TinyVec::from_iter(v6.octets()),
  }
}
