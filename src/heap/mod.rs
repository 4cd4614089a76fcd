//! The allocator engine: one arena, its free-list directory, quick lists and counters.

mod arena;
mod free_list;
mod inspect;
mod metrics;
mod quick;
mod reshape;

use core::ptr::{self, NonNull};

pub use free_list::size_class;
pub use inspect::{BlockInfo, Blocks, FreeList, HeapViolation, QuickList};

use crate::{
  ALIGNMENT, AllocError, Config, Corruption, InvalidFree, MAX_PAYLOAD, MAX_QUICK_SIZE,
  MIN_BLOCK_SIZE, NUM_FREE_LISTS, NUM_QUICK_LISTS, WORD_SIZE,
  block::Block,
  header::Header,
  log::{log_error, log_trace, log_warn},
  pages::{MmapPages, PageSource},
  required_block_size,
};

use free_list::Links;
use quick::QuickBin;

/// A segregated-fit heap over the pages of `P`.
///
/// All state lives here rather than in globals, so independent heaps can coexist. The
/// heap assumes exclusive access; wrap it in [`LockedHeap`](crate::LockedHeap) (or any
/// other lock) to share it between threads.
pub struct Heap<P: PageSource = MmapPages> {
  pages: P,
  config: Config,
  /// Resolved header secret. Zero until the arena is initialized.
  magic: u64,
  free_lists: [Links; NUM_FREE_LISTS],
  quick_lists: [QuickBin; NUM_QUICK_LISTS],
  current_payload: usize,
  peak_payload: usize,
}

// Every pointer the heap holds points into pages owned by `P`.
unsafe impl<P: PageSource + Send> Send for Heap<P> {}

impl Heap<MmapPages> {
  pub const fn new() -> Self {
    Self::with_pages(MmapPages::new(), Config::new())
  }
}

impl Default for Heap<MmapPages> {
  fn default() -> Self {
    Self::new()
  }
}

impl<P: PageSource> Heap<P> {
  /// Heap drawing pages from `pages`. Nothing is touched until the first allocation.
  ///
  /// `pages` must hand out page-aligned memory that nothing else writes to.
  pub const fn with_pages(pages: P, config: Config) -> Self {
    Self {
      pages,
      config,
      magic: 0,
      free_lists: free_list::sentinels(),
      quick_lists: [QuickBin::EMPTY; NUM_QUICK_LISTS],
      current_payload: 0,
      peak_payload: 0,
    }
  }

  pub const fn config(&self) -> &Config {
    &self.config
  }

  pub fn pages(&self) -> &P {
    &self.pages
  }

  /// Allocates `size` payload bytes, 16-byte aligned.
  ///
  /// Returns `Ok(None)` for a zero-byte request. Grows the arena one page at a time until
  /// a fit appears; if the page source gives out, nothing already committed changes.
  pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
    if size == 0 {
      return Ok(None);
    }
    if size > MAX_PAYLOAD {
      log_warn!(requested = size, "request exceeds the largest encodable block");
      return Err(AllocError::OutOfMemory { requested: size });
    }

    self.ensure_initialized(size)?;
    let required = required_block_size(size);

    if let Some(block) = unsafe { self.quick_pop(required) } {
      unsafe { self.write_tags(block, Header::allocated(required, size)) };
      self.charge(size);
      log_trace!(addr = block.addr(), size, block_size = required, "allocate from quick list");
      return Ok(Some(block.payload()));
    }

    let block = loop {
      if let Some(block) = unsafe { self.find_first_fit(required) } {
        break block;
      }
      self.grow_by_one_page(size)?;
    };

    unsafe {
      self.split(block, required);
      self.unlink(block);
      self.mark_allocated(block, size);
    }

    log_trace!(
      addr = block.addr(),
      size,
      block_size = self.header_of(block).block_size,
      "allocate"
    );
    Ok(Some(block.payload()))
  }

  /// Returns the block owning `ptr` to the heap. Null is a no-op.
  ///
  /// Small blocks are parked in a quick list; larger ones are coalesced with free
  /// neighbors and filed in the free-list directory.
  ///
  /// A pointer that does not name a live allocation aborts the process, unless the heap
  /// was configured with [`InvalidFree::Report`].
  ///
  /// # Safety
  /// `ptr` must be null or an address previously returned by this heap. Stale or foreign
  /// pointers are detected on a best-effort basis only.
  pub unsafe fn deallocate(&mut self, ptr: *mut u8) -> Result<(), AllocError> {
    let Some(payload) = NonNull::new(ptr) else {
      return Ok(());
    };

    let (block, header) = match unsafe { self.validate(payload) } {
      Ok(found) => found,
      Err(reason) => return Err(self.invalid_free(payload, reason)),
    };

    log_trace!(
      addr = block.addr(),
      block_size = header.block_size,
      payload = header.payload_size,
      "deallocate"
    );
    self.current_payload = self.current_payload.saturating_sub(header.payload_size);

    unsafe {
      if header.block_size <= MAX_QUICK_SIZE {
        self.quick_push(block, header);
      } else {
        self.release(block, header.block_size);
      }
    }
    Ok(())
  }

  /// Resizes the allocation at `ptr` to `size` payload bytes.
  ///
  /// A null `ptr` allocates; a zero `size` frees and returns `Ok(None)`. Shrinking stays in
  /// place and gives back any tail of at least one minimum block. Growing moves the data to
  /// a fresh block; on failure the original allocation is left as it was.
  ///
  /// # Safety
  /// Same contract as [`deallocate`](Self::deallocate), except that a bad pointer is
  /// reported as [`AllocError::InvalidArgument`] rather than aborting.
  pub unsafe fn resize(
    &mut self,
    ptr: *mut u8,
    size: usize,
  ) -> Result<Option<NonNull<u8>>, AllocError> {
    let Some(payload) = NonNull::new(ptr) else {
      return self.allocate(size);
    };
    if size == 0 {
      unsafe { self.deallocate(ptr)? };
      return Ok(None);
    }

    let (block, header) = match unsafe { self.validate(payload) } {
      Ok(found) => found,
      Err(reason) => {
        log_warn!(addr = payload.as_ptr() as usize, %reason, "resize of invalid pointer");
        #[cfg(not(feature = "logging"))]
        let _ = reason;
        return Err(AllocError::InvalidArgument);
      }
    };
    if size > MAX_PAYLOAD {
      return Err(AllocError::OutOfMemory { requested: size });
    }

    let required = required_block_size(size);
    let current = header.block_size;
    log_trace!(addr = block.addr(), from = current, to = required, "resize");

    if required > current {
      let Some(fresh) = self.allocate(size)? else {
        return Err(AllocError::OutOfMemory { requested: size });
      };
      unsafe {
        ptr::copy_nonoverlapping(payload.as_ptr(), fresh.as_ptr(), header.payload_size);
        self.deallocate(ptr)?;
      }
      return Ok(Some(fresh));
    }

    self.recharge(header.payload_size, size);
    let leftover = current - required;
    unsafe {
      if leftover >= MIN_BLOCK_SIZE {
        self.write_tags(block, Header::allocated(required, size));
        let rest = block.offset(required);
        self.write_tags(rest, Header::free(leftover));
        let (merged, merged_size) = self.coalesce(rest);
        self.insert_free(merged, merged_size);
      } else {
        // Same size, or a tail too small to stand alone: keep the splinter.
        self.write_tags(block, Header::allocated(current, size));
      }
    }
    Ok(Some(payload))
  }

  /// Payload bytes currently held by callers.
  pub const fn current_payload(&self) -> usize {
    self.current_payload
  }

  /// Highest value [`current_payload`](Self::current_payload) has ever reached.
  pub const fn peak_payload(&self) -> usize {
    self.peak_payload
  }

  /// Bytes the arena spans, sentinels and padding included.
  pub fn arena_size(&self) -> usize {
    self.end_addr() - self.start_addr()
  }

  pub fn is_initialized(&self) -> bool {
    self.pages.start() != self.pages.end()
  }

  // ===========================================================================
  // Validation
  // ===========================================================================

  /// Checks that `payload` names a live, intact allocation.
  unsafe fn validate(&self, payload: NonNull<u8>) -> Result<(Block, Header), Corruption> {
    if !self.is_initialized() {
      return Err(Corruption::OutOfBounds);
    }

    let addr = payload.as_ptr() as usize;
    let epilogue = self.epilogue_addr();
    if addr < self.first_block_addr() + WORD_SIZE || addr >= epilogue {
      return Err(Corruption::OutOfBounds);
    }
    if (addr - self.start_addr()) % ALIGNMENT != 0 {
      return Err(Corruption::Misaligned);
    }

    let block = unsafe { Block::from_payload(payload) };
    let word = unsafe { block.read_header() };
    if !Header::reserved_clear(word, self.magic) {
      return Err(Corruption::BadHeader);
    }

    let header = Header::decode(word, self.magic);
    if !header.plausible() {
      return Err(Corruption::BadSize);
    }
    if !header.allocated {
      return Err(Corruption::NotAllocated);
    }
    if header.in_quick_list {
      return Err(Corruption::InQuickList);
    }
    if header.block_size > epilogue - block.addr() {
      return Err(Corruption::OutOfBounds);
    }
    if unsafe { block.read_footer(header.block_size) } != word {
      return Err(Corruption::FooterMismatch);
    }
    Ok((block, header))
  }

  fn invalid_free(&self, payload: NonNull<u8>, reason: Corruption) -> AllocError {
    let addr = payload.as_ptr() as usize;
    log_error!(addr, %reason, "invalid free");
    match self.config.invalid_free {
      InvalidFree::Abort => std::process::abort(),
      InvalidFree::Report => AllocError::InvalidPointer { addr, reason },
    }
  }

  // ===========================================================================
  // Block helpers
  // ===========================================================================

  #[inline]
  fn header_of(&self, block: Block) -> Header {
    Header::decode(unsafe { block.read_header() }, self.magic)
  }

  /// Writes matching header and footer words.
  #[inline]
  unsafe fn write_tags(&self, block: Block, header: Header) {
    let word = header.encode(self.magic);
    unsafe {
      block.write_header(word);
      block.write_footer(header.block_size, word);
    }
  }

  /// Turns a free block (already unlinked) into a live allocation of `payload` bytes.
  unsafe fn mark_allocated(&mut self, block: Block, payload: usize) {
    let size = self.header_of(block).block_size;
    unsafe { self.write_tags(block, Header::allocated(size, payload)) };

    // A stale quick bit on the neighbor would make it look cached; genuine members keep it.
    let next = unsafe { block.offset(size) };
    if next.addr() < self.epilogue_addr() {
      let mut neighbor = self.header_of(next);
      if neighbor.in_quick_list && !self.quick_contains(next, neighbor.block_size) {
        neighbor.in_quick_list = false;
        unsafe { self.write_tags(next, neighbor) };
      }
    }

    self.charge(payload);
  }

  /// Writes a free header over `block`, merges it with its neighbors and files it.
  unsafe fn release(&mut self, block: Block, size: usize) {
    unsafe {
      self.write_tags(block, Header::free(size));
      let (merged, merged_size) = self.coalesce(block);
      self.insert_free(merged, merged_size);
    }
  }

  fn charge(&mut self, payload: usize) {
    self.current_payload += payload;
    self.peak_payload = self.peak_payload.max(self.current_payload);
  }

  fn recharge(&mut self, old_payload: usize, new_payload: usize) {
    self.current_payload = self.current_payload.saturating_sub(old_payload);
    self.charge(new_payload);
  }
}
