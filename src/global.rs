//! Spin-locked heap usable as `#[global_allocator]`.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  hint,
  ptr::{self, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

use crate::{ALIGNMENT, Heap, pages::MmapPages};

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

/// A [`Heap`] behind a spin lock.
///
/// The heap itself assumes exclusive access; this is the wrapper that provides it. Build
/// without the `logging` feature when installing it as the global allocator, since a
/// subscriber that allocates would re-enter the lock.
///
/// ```rust,ignore
/// #[global_allocator]
/// static GLOBAL: segfit::LockedHeap = segfit::LockedHeap::new();
/// ```
pub struct LockedHeap {
  lock: SpinLock,
  heap: UnsafeCell<Heap<MmapPages>>,
}

unsafe impl Sync for LockedHeap {}

impl LockedHeap {
  pub const fn new() -> Self {
    Self::with_heap(Heap::new())
  }

  pub const fn with_heap(heap: Heap<MmapPages>) -> Self {
    Self {
      lock: SpinLock::new(),
      heap: UnsafeCell::new(heap),
    }
  }

  /// Runs `f` with exclusive access to the heap.
  pub fn with<R>(&self, f: impl FnOnce(&mut Heap<MmapPages>) -> R) -> R {
    struct Unlock<'a>(&'a SpinLock);

    impl Drop for Unlock<'_> {
      fn drop(&mut self) {
        self.0.unlock();
      }
    }

    self.lock.lock();
    let _guard = Unlock(&self.lock);
    f(unsafe { &mut *self.heap.get() })
  }
}

impl Default for LockedHeap {
  fn default() -> Self {
    Self::new()
  }
}

unsafe impl GlobalAlloc for LockedHeap {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    // Payloads are 16-aligned; nothing stronger can be promised.
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    self
      .with(|heap| heap.allocate(layout.size().max(1)))
      .ok()
      .flatten()
      .map_or(null_mut(), |p| p.as_ptr())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    let _ = self.with(|heap| unsafe { heap.deallocate(ptr) });
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    self
      .with(|heap| unsafe { heap.resize(ptr, new_size.max(1)) })
      .ok()
      .flatten()
      .map_or(null_mut(), |p| p.as_ptr())
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}
