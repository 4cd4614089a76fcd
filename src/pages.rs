//! Page sources: where the arena gets its memory from.

use core::ptr::{NonNull, null_mut};

use crate::PAGE_SIZE;

/// Supplies arena pages, one at a time, from a contiguous region.
///
/// `start() == end()` means no page has been handed out yet. Every page returned by
/// [`grow`](PageSource::grow) must begin exactly at the previous `end()`.
pub trait PageSource {
  /// Extends the arena by [`PAGE_SIZE`] bytes, returning the start of the new page, or
  /// `None` once the source is exhausted. Failure must leave `start`/`end` unchanged.
  fn grow(&mut self) -> Option<NonNull<u8>>;

  fn start(&self) -> *mut u8;

  fn end(&self) -> *mut u8;
}

/// Default ceiling for [`MmapPages`]: 1 GiB of address space.
pub const DEFAULT_MAX_PAGES: usize = 1 << 18;

/// Page source backed by one anonymous mapping.
///
/// The whole `max_pages` range is reserved on first growth with `MAP_NORESERVE`, so
/// untouched pages cost nothing. Pages are handed out from the bottom and the mapping is
/// released on drop.
#[derive(Debug)]
pub struct MmapPages {
  base: *mut u8,
  end: *mut u8,
  max_pages: usize,
}

unsafe impl Send for MmapPages {}

impl MmapPages {
  pub const fn new() -> Self {
    Self::with_max_pages(DEFAULT_MAX_PAGES)
  }

  /// Source that refuses to grow past `max_pages` pages.
  pub const fn with_max_pages(max_pages: usize) -> Self {
    Self {
      base: null_mut(),
      end: null_mut(),
      max_pages,
    }
  }

  pub const fn max_pages(&self) -> usize {
    self.max_pages
  }

  /// Pages handed out so far.
  pub fn pages(&self) -> usize {
    (self.end as usize - self.base as usize) / PAGE_SIZE
  }

  fn reserve(&mut self) -> bool {
    let Some(len) = self.max_pages.checked_mul(PAGE_SIZE) else {
      return false;
    };
    let base = unsafe { os_mmap(len) };
    if base.is_null() {
      return false;
    }
    self.base = base;
    self.end = base;
    true
  }
}

impl Default for MmapPages {
  fn default() -> Self {
    Self::new()
  }
}

impl PageSource for MmapPages {
  fn grow(&mut self) -> Option<NonNull<u8>> {
    if self.max_pages == 0 {
      return None;
    }
    if self.base.is_null() && !self.reserve() {
      return None;
    }
    if self.pages() >= self.max_pages {
      return None;
    }

    let page = self.end;
    self.end = unsafe { page.add(PAGE_SIZE) };
    NonNull::new(page)
  }

  fn start(&self) -> *mut u8 {
    self.base
  }

  fn end(&self) -> *mut u8 {
    self.end
  }
}

impl Drop for MmapPages {
  fn drop(&mut self) {
    if !self.base.is_null() {
      unsafe { os_munmap(self.base, self.max_pages * PAGE_SIZE) };
    }
  }
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}
