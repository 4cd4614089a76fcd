//! Error types surfaced by the heap.

use thiserror::Error;

/// Why a pointer handed to `deallocate` or `resize` was rejected.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum Corruption {
  /// Payload addresses are always 16-byte aligned.
  #[error("payload address is not 16-byte aligned")]
  Misaligned,
  /// The block does not lie entirely between the Prologue and the Epilogue.
  #[error("block lies outside the arena")]
  OutOfBounds,
  /// Decoded size is below the minimum or not a multiple of 16.
  #[error("implausible block size")]
  BadSize,
  /// Reserved header bits are set.
  #[error("reserved header bits are set")]
  BadHeader,
  /// The block is free (double free or foreign pointer).
  #[error("block is not allocated")]
  NotAllocated,
  /// The block already sits in a quick list (double free).
  #[error("block is already cached in a quick list")]
  InQuickList,
  /// Header and footer disagree.
  #[error("header and footer disagree")]
  FooterMismatch,
}

/// Errors returned by heap operations.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum AllocError {
  /// The page source refused to grow the arena.
  #[error("out of memory while serving a request of {requested} bytes")]
  OutOfMemory {
    /// Payload bytes the caller asked for.
    requested: usize,
  },

  /// `resize` was handed a pointer that does not name a live allocation.
  #[error("invalid argument")]
  InvalidArgument,

  /// `deallocate` was handed a pointer that does not name a live allocation.
  ///
  /// Only produced under [`InvalidFree::Report`](crate::InvalidFree::Report); the default
  /// policy aborts the process instead.
  #[error("invalid pointer {addr:#x}: {reason}")]
  InvalidPointer {
    /// The offending payload address.
    addr: usize,
    /// What validation tripped on.
    reason: Corruption,
  },
}

impl AllocError {
  /// C `errno` equivalent, as reported by the `c_api` entry points.
  pub const fn errno(&self) -> i32 {
    match self {
      Self::OutOfMemory { .. } => libc::ENOMEM,
      Self::InvalidArgument | Self::InvalidPointer { .. } => libc::EINVAL,
    }
  }
}
