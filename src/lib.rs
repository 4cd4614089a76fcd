//! # segfit - a segregated-fit allocator over one growable arena
//!
//! ```text
//!   Arena (grows one page at a time, never shrinks)
//!
//!   ┌───┬──────────┬────────┬──────┬────────┬─────────────────────┬─────┐
//!   │pad│ prologue │ alloc  │ free │ quick  │        free         │ epi │
//!   └───┴──────────┴────────┴──┬───┴───┬────┴──────────┬──────────┴─────┘
//!                              │       │               │
//!   free-list directory ◄──────┘       │               │
//!     [0] 32  [1] ≤64  [2] ≤128 ...  ◄──────────────────┘
//!                                      │
//!   quick lists (exact size, LIFO) ◄───┘
//!     [0] 32  [1] 48  ...  [9] 176
//! ```
//!
//! Every block carries a header (and footer) packing payload size, block size and two
//! flags, XOR-ed with a per-process secret so that stray writes and stale pointers decode
//! to implausible values. Freed blocks of up to 176 bytes are parked in quick lists and
//! only coalesced when their bin overflows; larger ones are merged with free neighbors at
//! once and filed by size class.
//!
//! ```rust
//! use segfit::{Heap, MmapPages, Config};
//!
//! let mut heap = Heap::with_pages(MmapPages::with_max_pages(16), Config::new());
//! let ptr = heap.allocate(100).unwrap().unwrap();
//! assert_eq!(ptr.as_ptr() as usize % 16, 0);
//! unsafe { heap.deallocate(ptr.as_ptr()).unwrap() };
//! assert_eq!(heap.current_payload(), 0);
//! ```

mod block;
mod config;
mod error;
mod global;
mod header;
mod heap;
mod log;
mod pages;

pub use config::{Config, InvalidFree};
pub use error::{AllocError, Corruption};
pub use global::LockedHeap;
pub use heap::{BlockInfo, Blocks, FreeList, Heap, HeapViolation, QuickList, size_class};
pub use pages::{DEFAULT_MAX_PAGES, MmapPages, PageSource};

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SIZE: usize = 4096;
pub const WORD_SIZE: usize = 8;
/// Payload alignment and block size granularity.
pub const ALIGNMENT: usize = 16;
/// Header, two links and a footer.
pub const MIN_BLOCK_SIZE: usize = 32;

pub const NUM_FREE_LISTS: usize = 10;
pub const NUM_QUICK_LISTS: usize = 10;
/// Blocks a quick list holds before it is flushed.
pub const QUICK_LIST_MAX: usize = 5;
/// Largest block size served by a quick list.
pub const MAX_QUICK_SIZE: usize = MIN_BLOCK_SIZE + ALIGNMENT * (NUM_QUICK_LISTS - 1);

/// Padding in front of the Prologue, so that payloads land on 16-byte boundaries.
const PROLOGUE_OFFSET: usize = WORD_SIZE;
pub const PROLOGUE_SIZE: usize = 32;
pub const EPILOGUE_SIZE: usize = WORD_SIZE;

/// The header's size field is 32 bits wide.
const MAX_BLOCK_SIZE: usize = 0xFFFF_FFF0;
/// Largest request whose block still fits the size field.
pub const MAX_PAYLOAD: usize = MAX_BLOCK_SIZE - 2 * WORD_SIZE;
const MAX_ARENA_SIZE: usize = MAX_BLOCK_SIZE & !(PAGE_SIZE - 1);

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0);
const _: () = assert!(MIN_BLOCK_SIZE >= 4 * WORD_SIZE);
const _: () = assert!((PROLOGUE_OFFSET + PROLOGUE_SIZE + WORD_SIZE) % ALIGNMENT == 0);
const _: () =
  assert!((PAGE_SIZE - PROLOGUE_OFFSET - PROLOGUE_SIZE - EPILOGUE_SIZE) % ALIGNMENT == 0);
const _: () = assert!(MAX_QUICK_SIZE < PAGE_SIZE);
const _: () = assert!(NUM_FREE_LISTS >= 2);
const _: () = assert!(DEFAULT_MAX_PAGES * PAGE_SIZE <= MAX_ARENA_SIZE);

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Block size needed to serve `payload` bytes: header and footer added, rounded up to
/// [`ALIGNMENT`], never below [`MIN_BLOCK_SIZE`].
///
/// Meaningful for `payload <= MAX_PAYLOAD`; larger values saturate.
#[inline]
pub const fn required_block_size(payload: usize) -> usize {
  let payload = if payload > MAX_PAYLOAD { MAX_PAYLOAD } else { payload };
  let size = align_up(payload + 2 * WORD_SIZE, ALIGNMENT);
  if size < MIN_BLOCK_SIZE { MIN_BLOCK_SIZE } else { size }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
static C_HEAP: LockedHeap = LockedHeap::new();

#[cfg(feature = "c_api")]
fn set_errno(err: AllocError) {
  #[cfg(target_os = "linux")]
  unsafe {
    *libc::__errno_location() = err.errno();
  }
  #[cfg(not(target_os = "linux"))]
  let _ = err;
}

#[cfg(feature = "c_api")]
fn c_result(result: Result<Option<core::ptr::NonNull<u8>>, AllocError>) -> *mut u8 {
  match result {
    Ok(ptr) => ptr.map_or(core::ptr::null_mut(), |p| p.as_ptr()),
    Err(err) => {
      set_errno(err);
      core::ptr::null_mut()
    }
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  c_result(C_HEAP.with(|heap| heap.allocate(size)))
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  let _ = C_HEAP.with(|heap| unsafe { heap.deallocate(ptr) });
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    set_errno(AllocError::OutOfMemory {
      requested: usize::MAX,
    });
    return core::ptr::null_mut();
  };
  let ptr = c_result(C_HEAP.with(|heap| heap.allocate(total)));
  if !ptr.is_null() {
    unsafe { core::ptr::write_bytes(ptr, 0, total) };
  }
  ptr
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  c_result(C_HEAP.with(|heap| unsafe { heap.resize(ptr, size) }))
}
