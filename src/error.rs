use smol_str::SmolStr;

use crate::wire::WireError;

/// The error domain returned by the control interface.
///
/// Mirrors the kinds enumerated in the engine's error handling design: a
/// small, closed set of status codes rather than a free-form error tree.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MdnsError {
  /// Missing required string, length over limit, or contradictory arguments.
  #[error("invalid argument: {0}")]
  InvalidArgument(SmolStr),
  /// Engine not initialized, interface not found, service not found.
  #[error("invalid state: {0}")]
  InvalidState(SmolStr),
  /// Allocation failed; any partial allocation from the same call was rolled back.
  #[error("out of memory")]
  OutOfMemory,
  /// Lookup yielded no result.
  #[error("not found: {0}")]
  NotFound(SmolStr),
  /// The action queue is full; the caller may retry.
  #[error("action queue is full, retry")]
  Transient,
  /// A wire-format encode/decode failure.
  #[error(transparent)]
  Proto(#[from] WireError),
}

/// Convenience alias for engine operations.
pub type MdnsResult<T> = Result<T, MdnsError>;
