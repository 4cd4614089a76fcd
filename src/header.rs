//! Block header/footer codec.
//!
//! ```text
//!   63                32 31                  4  3  2  1  0
//!  ┌────────────────────┬─────────────────────┬─────┬──┬──┐
//!  │    payload size    │     block size      │ 0 0 │ Q│ A│
//!  └────────────────────┴─────────────────────┴─────┴──┴──┘
//!                          stored word = logical word ^ magic
//! ```
//!
//! Decoding never fails. Plausibility checks live with the callers.

/// Block is allocated (or quick-listed, which also sets this bit).
pub const ALLOCATED: u64 = 0x1;
/// Block is parked in a quick list.
pub const IN_QUICK_LIST: u64 = 0x2;

const FLAGS_MASK: u64 = 0xF;
const RESERVED_MASK: u64 = FLAGS_MASK & !(ALLOCATED | IN_QUICK_LIST);
const SIZE_MASK: u64 = 0xFFFF_FFF0;

/// Logical contents of a header or footer word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Header {
  /// Bytes the caller asked for. Zero while the block is free.
  pub payload_size: usize,
  pub block_size: usize,
  pub allocated: bool,
  pub in_quick_list: bool,
}

impl Header {
  /// Header of a plain free block.
  pub const fn free(block_size: usize) -> Self {
    Self {
      payload_size: 0,
      block_size,
      allocated: false,
      in_quick_list: false,
    }
  }

  pub const fn allocated(block_size: usize, payload_size: usize) -> Self {
    Self {
      payload_size,
      block_size,
      allocated: true,
      in_quick_list: false,
    }
  }

  /// Header of a block parked in a quick list: still allocated, payload kept.
  pub const fn quick(block_size: usize, payload_size: usize) -> Self {
    Self {
      payload_size,
      block_size,
      allocated: true,
      in_quick_list: true,
    }
  }

  #[inline]
  pub const fn encode(&self, magic: u64) -> u64 {
    let mut word = ((self.payload_size as u64) << 32) | (self.block_size as u64 & SIZE_MASK);
    if self.allocated {
      word |= ALLOCATED;
    }
    if self.in_quick_list {
      word |= IN_QUICK_LIST;
    }
    word ^ magic
  }

  #[inline]
  pub const fn decode(word: u64, magic: u64) -> Self {
    let word = word ^ magic;
    Self {
      payload_size: (word >> 32) as usize,
      block_size: (word & SIZE_MASK) as usize,
      allocated: word & ALLOCATED != 0,
      in_quick_list: word & IN_QUICK_LIST != 0,
    }
  }

  /// True when bits 2..=3 of the decoded word are clear.
  #[inline]
  pub const fn reserved_clear(word: u64, magic: u64) -> bool {
    (word ^ magic) & RESERVED_MASK == 0
  }

  /// Size is at least the minimum block and 16-aligned.
  #[inline]
  pub const fn plausible(&self) -> bool {
    self.block_size >= crate::MIN_BLOCK_SIZE && self.block_size % crate::ALIGNMENT == 0
  }
}
