//! Splitting and coalescing.

use crate::{MIN_BLOCK_SIZE, block::Block, header::Header, pages::PageSource};

use super::Heap;

impl<P: PageSource> Heap<P> {
  /// Carves a `required`-byte front out of the free `block` when the tail can stand alone.
  ///
  /// The tail is filed in the directory; the front stays linked in its old list and is
  /// unlinked by the caller. A tail under [`MIN_BLOCK_SIZE`] is left attached as a splinter.
  pub(crate) unsafe fn split(&mut self, block: Block, required: usize) {
    let size = self.header_of(block).block_size;
    let remainder = size - required;
    if remainder < MIN_BLOCK_SIZE {
      return;
    }

    unsafe {
      self.insert_free(block.offset(required), remainder);
      self.write_tags(block, Header::free(required));
    }
  }

  /// Merges the free `block` (in no list) with free physical neighbors.
  ///
  /// Neighbors are unlinked from their lists. Returns the merged block and its size; the
  /// caller files it.
  pub(crate) unsafe fn coalesce(&mut self, block: Block) -> (Block, usize) {
    let mut base = block;
    let mut size = self.header_of(block).block_size;

    // The Prologue's footer sits right before the first block and always reads allocated.
    if base.addr() > self.first_block_addr() {
      let footer = unsafe { base.read_prev_footer() };
      let before = Header::decode(footer, self.magic);
      if self.is_free_neighbor(before)
        && before.block_size <= base.addr() - self.first_block_addr()
      {
        let prev = unsafe { Block::at(base.addr() - before.block_size) };
        if unsafe { prev.read_header() } == footer {
          unsafe { self.unlink(prev) };
          base = prev;
          size += before.block_size;
        }
      }
    }

    let next = unsafe { base.offset(size) };
    let epilogue = self.epilogue_addr();
    if next.addr() < epilogue {
      let after = self.header_of(next);
      if self.is_free_neighbor(after) && after.block_size <= epilogue - next.addr() {
        unsafe { self.unlink(next) };
        size += after.block_size;
      }
    }

    unsafe { self.write_tags(base, Header::free(size)) };
    (base, size)
  }

  #[inline]
  fn is_free_neighbor(&self, header: Header) -> bool {
    !header.allocated && !header.in_quick_list && header.plausible()
  }
}
