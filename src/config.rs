use std::sync::OnceLock;

use rand::{RngCore, rngs::OsRng};

/// What `deallocate` does with a pointer that fails validation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum InvalidFree {
  /// Terminate the process. A bad free means the program state is already corrupt.
  #[default]
  Abort,
  /// Return [`AllocError::InvalidPointer`](crate::AllocError::InvalidPointer) and leave the
  /// heap untouched. Diverges from the fail-fast contract; meant for tests and hosts that
  /// cannot abort.
  Report,
}

/// Runtime knobs of a [`Heap`](crate::Heap).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Config {
  /// Secret mixed into every header and footer. `None` uses the per-process random value.
  pub magic: Option<u64>,
  pub invalid_free: InvalidFree,
}

impl Config {
  pub const fn new() -> Self {
    Self {
      magic: None,
      invalid_free: InvalidFree::Abort,
    }
  }

  /// Pins the header secret, making block words reproducible across runs.
  pub const fn with_magic(mut self, magic: u64) -> Self {
    self.magic = Some(magic);
    self
  }

  pub const fn with_invalid_free(mut self, policy: InvalidFree) -> Self {
    self.invalid_free = policy;
    self
  }

  pub(crate) fn resolve_magic(&self) -> u64 {
    match self.magic {
      Some(magic) => magic,
      None => process_magic(),
    }
  }
}

static PROCESS_MAGIC: OnceLock<u64> = OnceLock::new();

/// Random secret drawn once per process. `OsRng` reads the entropy source directly and
/// never allocates, which matters when the heap backs the global allocator.
fn process_magic() -> u64 {
  *PROCESS_MAGIC.get_or_init(|| OsRng.next_u64())
}
