//! Arena bounds, sentinel blocks and growth.
//!
//! ```text
//!  start                                                               end
//!   │ pad │   prologue (32)   │        free / allocated blocks ...   │ epi │
//!   └─8───┴───────────────────┴──────────────────────────────────────┴──8──┘
//!         ▲                   ▲                                      ▲
//!    start + 8           start + 40                              end - 8
//! ```

use crate::{
  AllocError, EPILOGUE_SIZE, MAX_ARENA_SIZE, PAGE_SIZE, PROLOGUE_OFFSET, PROLOGUE_SIZE,
  block::Block,
  header::Header,
  log::{log_debug, log_warn},
  pages::PageSource,
};

use super::Heap;

impl<P: PageSource> Heap<P> {
  #[inline]
  pub(crate) fn start_addr(&self) -> usize {
    self.pages.start() as usize
  }

  #[inline]
  pub(crate) fn end_addr(&self) -> usize {
    self.pages.end() as usize
  }

  /// Address of the first block after the Prologue.
  #[inline]
  pub(crate) fn first_block_addr(&self) -> usize {
    self.start_addr() + PROLOGUE_OFFSET + PROLOGUE_SIZE
  }

  #[inline]
  pub(crate) fn epilogue_addr(&self) -> usize {
    self.end_addr() - EPILOGUE_SIZE
  }

  /// Lays out the first page on first use: Prologue, one free block, Epilogue.
  pub(crate) fn ensure_initialized(&mut self, requested: usize) -> Result<(), AllocError> {
    if self.is_initialized() {
      return Ok(());
    }

    self.magic = self.config.resolve_magic();
    let Some(page) = self.pages.grow() else {
      log_warn!(requested, "page source refused the first page");
      return Err(AllocError::OutOfMemory { requested });
    };

    let base = page.as_ptr() as usize;
    unsafe {
      let prologue = Block::at(base + PROLOGUE_OFFSET);
      self.write_tags(prologue, Header::allocated(PROLOGUE_SIZE, 0));
      self.write_epilogue();

      let first = prologue.offset(PROLOGUE_SIZE);
      self.insert_free(first, PAGE_SIZE - PROLOGUE_OFFSET - PROLOGUE_SIZE - EPILOGUE_SIZE);
    }

    log_debug!(start = base, end = self.end_addr(), "arena initialized");
    Ok(())
  }

  /// Adds one page to the arena and files the resulting free block.
  ///
  /// The old Epilogue becomes the header of the new space, which absorbs the block before
  /// it when that block is free.
  pub(crate) fn grow_by_one_page(&mut self, requested: usize) -> Result<Block, AllocError> {
    if self.arena_size() + PAGE_SIZE > MAX_ARENA_SIZE {
      log_warn!(requested, arena = self.arena_size(), "arena at its encodable limit");
      return Err(AllocError::OutOfMemory { requested });
    }

    let old_epilogue = self.epilogue_addr();
    let Some(page) = self.pages.grow() else {
      log_warn!(requested, arena = self.arena_size(), "page source exhausted");
      return Err(AllocError::OutOfMemory { requested });
    };
    debug_assert_eq!(page.as_ptr() as usize, old_epilogue + EPILOGUE_SIZE);

    let mut block = unsafe { Block::at(old_epilogue) };
    let mut size = PAGE_SIZE;

    let before = Header::decode(unsafe { block.read_prev_footer() }, self.magic);
    if !before.allocated && before.plausible() {
      let prev = unsafe { Block::at(old_epilogue - before.block_size) };
      unsafe { self.unlink(prev) };
      block = prev;
      size += before.block_size;
    }

    unsafe {
      self.write_epilogue();
      self.insert_free(block, size);
    }

    log_debug!(arena = self.arena_size(), free_block = size, "arena grown by one page");
    Ok(block)
  }

  unsafe fn write_epilogue(&self) {
    // Eight bytes cannot be expressed in the 16-aligned size field; position identifies it.
    let epilogue = unsafe { Block::at(self.epilogue_addr()) };
    unsafe { epilogue.write_header(Header::allocated(0, 0).encode(self.magic)) };
  }
}
