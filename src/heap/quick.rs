//! Quick lists: bounded LIFO bins of recently freed small blocks.
//!
//! Bin `i` holds blocks of exactly `32 + 16 * i` bytes. Parked blocks keep their
//! allocated bit (plus the quick bit), so neighbors never coalesce into them until the
//! bin is flushed.

use crate::{
  ALIGNMENT, MAX_QUICK_SIZE, MIN_BLOCK_SIZE, QUICK_LIST_MAX, block::Block, header::Header,
  log::log_trace, pages::PageSource,
};

use super::Heap;

#[derive(Clone, Copy, Debug)]
pub(crate) struct QuickBin {
  pub first: Option<Block>,
  pub length: usize,
}

impl QuickBin {
  pub const EMPTY: Self = Self {
    first: None,
    length: 0,
  };
}

/// Bin index for a block of `size` bytes.
#[inline]
pub(crate) const fn quick_index(size: usize) -> usize {
  (size - MIN_BLOCK_SIZE) / ALIGNMENT
}

impl<P: PageSource> Heap<P> {
  /// Parks `block` in its bin, flushing the bin first when it is full.
  pub(crate) unsafe fn quick_push(&mut self, block: Block, header: Header) {
    let index = quick_index(header.block_size);
    if self.quick_lists[index].length >= QUICK_LIST_MAX {
      unsafe { self.flush_quick_list(index) };
    }

    let bin = &mut self.quick_lists[index];
    let next = bin.first.map_or(0, Block::addr);
    unsafe { block.set_next_link(next) };
    bin.first = Some(block);
    bin.length += 1;

    unsafe { self.write_tags(block, Header::quick(header.block_size, header.payload_size)) };
  }

  /// Takes the most recently parked block of exactly `size` bytes, if any.
  ///
  /// The block still carries its quick-list tags; the caller rewrites them.
  pub(crate) unsafe fn quick_pop(&mut self, size: usize) -> Option<Block> {
    if size > MAX_QUICK_SIZE {
      return None;
    }
    let bin = &mut self.quick_lists[quick_index(size)];
    let block = bin.first?;
    let next = unsafe { block.next_link() };
    bin.first = if next == 0 {
      None
    } else {
      Some(unsafe { Block::at(next) })
    };
    bin.length -= 1;
    Some(block)
  }

  /// Empties bin `index`, returning every block to the free-list directory.
  pub(crate) unsafe fn flush_quick_list(&mut self, index: usize) {
    log_trace!(index, length = self.quick_lists[index].length, "flush quick list");

    while let Some(block) = self.quick_lists[index].first {
      let next = unsafe { block.next_link() };
      let bin = &mut self.quick_lists[index];
      bin.first = if next == 0 {
        None
      } else {
        Some(unsafe { Block::at(next) })
      };
      bin.length -= 1;

      let size = self.header_of(block).block_size;
      unsafe { self.release(block, size) };
    }
  }

  /// Flushes every bin. Afterwards no block is parked and all free space is coalesced.
  pub fn flush_quick_lists(&mut self) {
    if !self.is_initialized() {
      return;
    }
    for index in 0..self.quick_lists.len() {
      unsafe { self.flush_quick_list(index) };
    }
  }

  /// True when `block` is a member of the bin for `size`.
  pub(crate) fn quick_contains(&self, block: Block, size: usize) -> bool {
    if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 {
      return false;
    }
    let index = quick_index(size);
    if index >= self.quick_lists.len() {
      return false;
    }

    let mut cursor = self.quick_lists[index].first;
    while let Some(member) = cursor {
      if member == block {
        return true;
      }
      let next = unsafe { member.next_link() };
      cursor = if next == 0 {
        None
      } else {
        Some(unsafe { Block::at(next) })
      };
    }
    false
  }
}
