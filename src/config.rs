//! Ambient configuration knobs the distilled design left implicit: queue
//! capacities and timing constants, overridable so tests can run the
//! probe/announce sequence without waiting on real wall-clock delays.

use std::time::Duration;

use smol_str::SmolStr;

/// Configuration passed to [`crate::engine::Engine::new`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
  pub hostname: SmolStr,
  pub instance: Option<SmolStr>,
  /// Capacity of the bounded action queue (§4.4 "Action queue").
  pub action_queue_capacity: usize,
  /// How often the scheduler tick fires to drain the TX queue and check
  /// search retransmit/timeout deadlines (§4.4).
  pub tick_interval: Duration,
  /// Wall-clock interval between search retransmits (§4.3).
  pub search_retransmit_interval: Duration,
  /// Probe count after which the first-probe jitter base switches from
  /// 120ms to 1000ms (§4.2).
  pub max_probe_failures_before_backoff: u32,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      hostname: SmolStr::new("localhost"),
      instance: None,
      action_queue_capacity: 256,
      tick_interval: Duration::from_millis(100),
      search_retransmit_interval: Duration::from_millis(1000),
      max_probe_failures_before_backoff: 5,
    }
  }
}

impl EngineConfig {
  pub fn new(hostname: impl Into<SmolStr>) -> Self {
    Self {
      hostname: hostname.into(),
      ..Default::default()
    }
  }

  /// The server-wide instance name, defaulting to the hostname as §3
  /// specifies.
  pub fn instance_or_hostname(&self) -> SmolStr {
    self.instance.clone().unwrap_or_else(|| self.hostname.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn instance_defaults_to_hostname() {
    let cfg = EngineConfig::new("alpha");
    assert_eq!(cfg.instance_or_hostname(), "alpha");
  }

  #[test]
  fn explicit_instance_overrides_hostname() {
    let mut cfg = EngineConfig::new("alpha");
    cfg.instance = Some("alpha-office".into());
    assert_eq!(cfg.instance_or_hostname(), "alpha-office");
  }
}
