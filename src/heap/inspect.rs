//! Read-only views of the heap: block walks, list walks and a full invariant check.

use core::{iter::FusedIterator, ptr::NonNull};

use thiserror::Error;

use crate::{
  ALIGNMENT, MIN_BLOCK_SIZE, NUM_FREE_LISTS, NUM_QUICK_LISTS, PROLOGUE_OFFSET, PROLOGUE_SIZE,
  QUICK_LIST_MAX, WORD_SIZE, block::Block, header::Header, pages::PageSource,
};

use super::{
  Heap,
  free_list::{Node, size_class},
  quick::quick_index,
};

/// Decoded view of one block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockInfo {
  /// Address of the header word.
  pub addr: usize,
  pub block_size: usize,
  pub payload_size: usize,
  pub allocated: bool,
  pub in_quick_list: bool,
}

impl BlockInfo {
  fn decode(block: Block, magic: u64) -> Self {
    let header = Header::decode(unsafe { block.read_header() }, magic);
    Self {
      addr: block.addr(),
      block_size: header.block_size,
      payload_size: header.payload_size,
      allocated: header.allocated,
      in_quick_list: header.in_quick_list,
    }
  }

  /// Address handed to the caller for this block.
  pub const fn payload_addr(&self) -> usize {
    self.addr + WORD_SIZE
  }

  /// Free and available in the directory (not parked in a quick list).
  pub const fn is_free(&self) -> bool {
    !self.allocated
  }
}

/// An invariant the heap failed to uphold. See [`Heap::verify`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum HeapViolation {
  #[error("sentinel block at {addr:#x} is damaged")]
  Sentinel { addr: usize },
  #[error("block at {addr:#x} has implausible size {size}")]
  BadSize { addr: usize, size: usize },
  #[error("block walk ended at {addr:#x} instead of the epilogue")]
  Truncated { addr: usize },
  #[error("header and footer of block at {addr:#x} disagree")]
  FooterMismatch { addr: usize },
  #[error("free blocks at {first:#x} and {second:#x} are adjacent")]
  AdjacentFree { first: usize, second: usize },
  #[error("block at {addr:#x} sits in free list {class} but is not a free block of that class")]
  MisfiledFree { addr: usize, class: usize },
  #[error("free list {class} has broken back links at {addr:#x}")]
  BrokenLinks { addr: usize, class: usize },
  #[error("{walked} free blocks in the arena but {listed} in the directory")]
  FreeCountMismatch { walked: usize, listed: usize },
  #[error("block at {addr:#x} sits in quick list {index} but is not a parked block of that size")]
  MisfiledQuick { addr: usize, index: usize },
  #[error("quick list {index} records length {recorded} but holds {actual}")]
  QuickLength { index: usize, recorded: usize, actual: usize },
  #[error("{walked} parked blocks in the arena but {listed} in quick lists")]
  QuickCountMismatch { walked: usize, listed: usize },
  #[error("current payload {current} exceeds peak {peak}")]
  Counters { current: usize, peak: usize },
}

/// Iterator over every block between the Prologue and the Epilogue.
///
/// Stops early at the first implausible header.
pub struct Blocks<'a, P: PageSource> {
  heap: &'a Heap<P>,
  cursor: usize,
  end: usize,
}

impl<P: PageSource> Iterator for Blocks<'_, P> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    if self.cursor >= self.end {
      return None;
    }
    let info = BlockInfo::decode(unsafe { Block::at(self.cursor) }, self.heap.magic);
    if info.block_size < MIN_BLOCK_SIZE || info.block_size > self.end - self.cursor {
      self.cursor = self.end;
      return None;
    }
    self.cursor += info.block_size;
    Some(info)
  }
}

impl<P: PageSource> FusedIterator for Blocks<'_, P> {}

/// Iterator over one free-list class, most recently filed block first.
pub struct FreeList<'a, P: PageSource> {
  heap: &'a Heap<P>,
  node: Node,
}

impl<P: PageSource> Iterator for FreeList<'_, P> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let Node::Block(block) = self.node else {
      return None;
    };
    self.node = unsafe { self.heap.next_of(self.node) };
    Some(BlockInfo::decode(block, self.heap.magic))
  }
}

/// Iterator over one quick list, most recently parked block first.
pub struct QuickList<'a, P: PageSource> {
  heap: &'a Heap<P>,
  cursor: Option<Block>,
}

impl<P: PageSource> Iterator for QuickList<'_, P> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let block = self.cursor?;
    let next = unsafe { block.next_link() };
    self.cursor = if next == 0 {
      None
    } else {
      Some(unsafe { Block::at(next) })
    };
    Some(BlockInfo::decode(block, self.heap.magic))
  }
}

impl<P: PageSource> Heap<P> {
  /// Walks the arena block by block.
  pub fn blocks(&self) -> Blocks<'_, P> {
    let (cursor, end) = if self.is_initialized() {
      (self.first_block_addr(), self.epilogue_addr())
    } else {
      (0, 0)
    };
    Blocks {
      heap: self,
      cursor,
      end,
    }
  }

  /// Members of free-list class `class`.
  ///
  /// # Panics
  /// If `class >= NUM_FREE_LISTS`.
  pub fn free_list(&self, class: usize) -> FreeList<'_, P> {
    FreeList {
      heap: self,
      node: self.free_lists[class].next,
    }
  }

  /// Members of quick list `index` (blocks of `32 + 16 * index` bytes).
  ///
  /// # Panics
  /// If `index >= NUM_QUICK_LISTS`.
  pub fn quick_list(&self, index: usize) -> QuickList<'_, P> {
    QuickList {
      heap: self,
      cursor: self.quick_lists[index].first,
    }
  }

  /// Decodes the block owning `payload`, or `None` when the address cannot be a payload
  /// of this arena.
  pub fn block_info(&self, payload: NonNull<u8>) -> Option<BlockInfo> {
    if !self.is_initialized() {
      return None;
    }
    let addr = payload.as_ptr() as usize;
    if addr < self.first_block_addr() + WORD_SIZE
      || addr >= self.epilogue_addr()
      || (addr - self.start_addr()) % ALIGNMENT != 0
    {
      return None;
    }
    Some(BlockInfo::decode(unsafe { Block::from_payload(payload) }, self.magic))
  }

  /// Checks every structural invariant, reporting the first violation found.
  ///
  /// Linear in arena size plus list lengths.
  pub fn verify(&self) -> Result<(), HeapViolation> {
    if self.current_payload > self.peak_payload {
      return Err(HeapViolation::Counters {
        current: self.current_payload,
        peak: self.peak_payload,
      });
    }
    if !self.is_initialized() {
      return Ok(());
    }

    self.verify_sentinels()?;
    let (free, parked) = self.verify_walk()?;
    let listed = self.verify_free_lists()?;
    if free != listed {
      return Err(HeapViolation::FreeCountMismatch {
        walked: free,
        listed,
      });
    }
    let queued = self.verify_quick_lists()?;
    if parked != queued {
      return Err(HeapViolation::QuickCountMismatch {
        walked: parked,
        listed: queued,
      });
    }
    Ok(())
  }

  fn verify_sentinels(&self) -> Result<(), HeapViolation> {
    let prologue = unsafe { Block::at(self.start_addr() + PROLOGUE_OFFSET) };
    let word = unsafe { prologue.read_header() };
    let header = Header::decode(word, self.magic);
    if header != Header::allocated(PROLOGUE_SIZE, 0)
      || unsafe { prologue.read_footer(PROLOGUE_SIZE) } != word
    {
      return Err(HeapViolation::Sentinel {
        addr: prologue.addr(),
      });
    }

    let epilogue = unsafe { Block::at(self.epilogue_addr()) };
    if Header::decode(unsafe { epilogue.read_header() }, self.magic) != Header::allocated(0, 0) {
      return Err(HeapViolation::Sentinel {
        addr: epilogue.addr(),
      });
    }
    Ok(())
  }

  /// Returns the number of free and of parked blocks seen.
  fn verify_walk(&self) -> Result<(usize, usize), HeapViolation> {
    let end = self.epilogue_addr();
    let mut cursor = self.first_block_addr();
    let mut previous_free: Option<usize> = None;
    let (mut free, mut parked) = (0, 0);

    while cursor < end {
      let block = unsafe { Block::at(cursor) };
      let word = unsafe { block.read_header() };
      let header = Header::decode(word, self.magic);
      if !header.plausible() || header.block_size > end - cursor {
        return Err(HeapViolation::BadSize {
          addr: cursor,
          size: header.block_size,
        });
      }
      if unsafe { block.read_footer(header.block_size) } != word {
        return Err(HeapViolation::FooterMismatch { addr: cursor });
      }

      if header.allocated {
        previous_free = None;
        if header.in_quick_list {
          parked += 1;
        }
      } else {
        if let Some(first) = previous_free {
          return Err(HeapViolation::AdjacentFree {
            first,
            second: cursor,
          });
        }
        previous_free = Some(cursor);
        free += 1;
      }
      cursor += header.block_size;
    }

    if cursor != end {
      return Err(HeapViolation::Truncated { addr: cursor });
    }
    Ok((free, parked))
  }

  fn verify_free_lists(&self) -> Result<usize, HeapViolation> {
    let mut listed = 0;
    let capacity = self.arena_size() / MIN_BLOCK_SIZE;
    for class in 0..NUM_FREE_LISTS {
      let mut prev = Node::Sentinel(class);
      let mut node = self.free_lists[class].next;
      while let Node::Block(block) = node {
        let header = self.header_of(block);
        if header.allocated || !header.plausible() || size_class(header.block_size) != class {
          return Err(HeapViolation::MisfiledFree {
            addr: block.addr(),
            class,
          });
        }
        if unsafe { self.prev_of(node) } != prev {
          return Err(HeapViolation::BrokenLinks {
            addr: block.addr(),
            class,
          });
        }
        listed += 1;
        if listed > capacity {
          return Err(HeapViolation::BrokenLinks {
            addr: block.addr(),
            class,
          });
        }
        prev = node;
        node = unsafe { self.next_of(node) };
      }
      if self.free_lists[class].prev != prev {
        return Err(HeapViolation::BrokenLinks {
          addr: self.start_addr(),
          class,
        });
      }
    }
    Ok(listed)
  }

  fn verify_quick_lists(&self) -> Result<usize, HeapViolation> {
    let mut queued = 0;
    for index in 0..NUM_QUICK_LISTS {
      let mut actual = 0;
      for info in self.quick_list(index) {
        if !info.allocated
          || !info.in_quick_list
          || info.block_size < MIN_BLOCK_SIZE
          || quick_index(info.block_size) != index
        {
          return Err(HeapViolation::MisfiledQuick {
            addr: info.addr,
            index,
          });
        }
        actual += 1;
        if actual > QUICK_LIST_MAX {
          break;
        }
      }
      let recorded = self.quick_lists[index].length;
      if actual != recorded || recorded > QUICK_LIST_MAX {
        return Err(HeapViolation::QuickLength {
          index,
          recorded,
          actual,
        });
      }
      queued += actual;
    }
    Ok(queued)
  }
}
