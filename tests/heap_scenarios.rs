use std::{env, process::Command, ptr::NonNull};

use segfit::{
  AllocError, Config, Corruption, Heap, InvalidFree, MmapPages, NUM_FREE_LISTS, NUM_QUICK_LISTS,
  PAGE_SIZE,
};

const MAGIC: u64 = 0x0123_4567_89AB_CDEF;
/// Ceiling at which a 151505-byte request fails with 151504 bytes left free.
const TEST_PAGES: usize = 37;

fn heap() -> Heap<MmapPages> {
  Heap::with_pages(
    MmapPages::with_max_pages(TEST_PAGES),
    Config::new()
      .with_magic(MAGIC)
      .with_invalid_free(InvalidFree::Report),
  )
}

fn alloc(heap: &mut Heap<MmapPages>, size: usize) -> NonNull<u8> {
  heap.allocate(size).unwrap().unwrap()
}

fn free(heap: &mut Heap<MmapPages>, ptr: NonNull<u8>) {
  unsafe { heap.deallocate(ptr.as_ptr()).unwrap() };
}

/// Number of directory blocks of `size` bytes, or of any size when `size == 0`.
fn free_count(heap: &Heap<MmapPages>, size: usize) -> usize {
  (0..NUM_FREE_LISTS)
    .flat_map(|class| heap.free_list(class))
    .filter(|info| size == 0 || info.block_size == size)
    .count()
}

fn quick_count(heap: &Heap<MmapPages>, size: usize) -> usize {
  (0..NUM_QUICK_LISTS)
    .flat_map(|index| heap.quick_list(index))
    .filter(|info| size == 0 || info.block_size == size)
    .count()
}

fn assert_close(actual: f64, expected: f64) {
  assert!(
    (actual - expected).abs() < 1e-6,
    "expected {expected}, got {actual}"
  );
}

// =============================================================================
// Allocation
// =============================================================================

#[test]
fn test_malloc_an_int() {
  let mut heap = heap();
  let x = alloc(&mut heap, 4).cast::<i32>();
  unsafe {
    x.write(4);
    assert_eq!(x.read(), 4);
  }

  assert_eq!(quick_count(&heap, 0), 0);
  assert_eq!(free_count(&heap, 0), 1);
  assert_eq!(free_count(&heap, 4016), 1);
  assert_eq!(heap.arena_size(), PAGE_SIZE);
  heap.verify().unwrap();
}

#[test]
fn test_malloc_four_pages() {
  let mut heap = heap();
  alloc(&mut heap, 16316);

  assert_eq!(quick_count(&heap, 0), 0);
  assert_eq!(free_count(&heap, 0), 0);
  assert_eq!(heap.arena_size(), 4 * PAGE_SIZE);
  heap.verify().unwrap();
}

#[test]
fn test_malloc_too_large() {
  let mut heap = heap();
  assert_eq!(
    heap.allocate(151505),
    Err(AllocError::OutOfMemory { requested: 151505 })
  );

  assert_eq!(quick_count(&heap, 0), 0);
  assert_eq!(free_count(&heap, 0), 1);
  assert_eq!(free_count(&heap, 151504), 1);
  heap.verify().unwrap();

  // The heap stays usable after running dry.
  let small = alloc(&mut heap, 64);
  free(&mut heap, small);
  heap.verify().unwrap();
}

#[test]
fn test_zero_byte_request() {
  let mut heap = heap();
  assert_eq!(heap.allocate(0), Ok(None));
  assert!(!heap.is_initialized());
}

#[test]
fn test_unencodable_request() {
  let mut heap = heap();
  assert_eq!(
    heap.allocate(usize::MAX),
    Err(AllocError::OutOfMemory {
      requested: usize::MAX
    })
  );
  assert!(!heap.is_initialized());
}

#[test]
fn test_first_page_refused() {
  let mut heap = Heap::with_pages(MmapPages::with_max_pages(0), Config::new().with_magic(MAGIC));
  assert_eq!(heap.allocate(1), Err(AllocError::OutOfMemory { requested: 1 }));
  assert_eq!(heap.utilization(), 0.0);
}

#[test]
fn test_payloads_are_aligned_and_disjoint() {
  let mut heap = heap();
  let sizes = [1, 7, 16, 17, 100, 333, 4000, 9000];
  let ptrs: Vec<_> = sizes.iter().map(|&size| alloc(&mut heap, size)).collect();

  for (i, (&ptr, &size)) in ptrs.iter().zip(&sizes).enumerate() {
    assert_eq!(ptr.as_ptr() as usize % 16, 0);
    unsafe { ptr.as_ptr().write_bytes(i as u8, size) };
  }
  for (i, (&ptr, &size)) in ptrs.iter().zip(&sizes).enumerate() {
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
    assert!(bytes.iter().all(|&b| b == i as u8));
  }
  heap.verify().unwrap();
}

// =============================================================================
// Free
// =============================================================================

#[test]
fn test_free_quick() {
  let mut heap = heap();
  alloc(&mut heap, 8);
  let y = alloc(&mut heap, 32);
  alloc(&mut heap, 1);

  free(&mut heap, y);

  assert_eq!(quick_count(&heap, 0), 1);
  assert_eq!(quick_count(&heap, 48), 1);
  assert_eq!(free_count(&heap, 0), 1);
  assert_eq!(free_count(&heap, 3936), 1);
  heap.verify().unwrap();
}

#[test]
fn test_free_no_coalesce() {
  let mut heap = heap();
  alloc(&mut heap, 8);
  let y = alloc(&mut heap, 200);
  alloc(&mut heap, 1);

  free(&mut heap, y);

  assert_eq!(quick_count(&heap, 0), 0);
  assert_eq!(free_count(&heap, 0), 2);
  assert_eq!(free_count(&heap, 224), 1);
  assert_eq!(free_count(&heap, 3760), 1);
  heap.verify().unwrap();
}

#[test]
fn test_free_coalesce() {
  let mut heap = heap();
  alloc(&mut heap, 8);
  let x = alloc(&mut heap, 200);
  let y = alloc(&mut heap, 300);
  alloc(&mut heap, 4);

  free(&mut heap, y);
  free(&mut heap, x);

  assert_eq!(quick_count(&heap, 0), 0);
  assert_eq!(free_count(&heap, 0), 2);
  assert_eq!(free_count(&heap, 544), 1);
  assert_eq!(free_count(&heap, 3440), 1);
  heap.verify().unwrap();
}

#[test]
fn test_freelist_head_is_most_recent() {
  let mut heap = heap();
  let u = alloc(&mut heap, 200);
  alloc(&mut heap, 300);
  let w = alloc(&mut heap, 200);
  alloc(&mut heap, 500);
  let y = alloc(&mut heap, 200);
  alloc(&mut heap, 700);

  free(&mut heap, u);
  free(&mut heap, w);
  free(&mut heap, y);

  assert_eq!(quick_count(&heap, 0), 0);
  assert_eq!(free_count(&heap, 0), 4);
  assert_eq!(free_count(&heap, 224), 3);
  assert_eq!(free_count(&heap, 1808), 1);

  let head = heap.free_list(3).next().unwrap();
  assert_eq!(head.addr, y.as_ptr() as usize - 8);
  heap.verify().unwrap();
}

#[test]
fn test_free_null_is_noop() {
  let mut heap = heap();
  assert_eq!(unsafe { heap.deallocate(std::ptr::null_mut()) }, Ok(()));
  assert!(!heap.is_initialized());
}

#[test]
fn test_lifo_reuse() {
  let mut heap = heap();
  alloc(&mut heap, 50);

  let small = alloc(&mut heap, 40);
  alloc(&mut heap, 10);
  free(&mut heap, small);
  assert_eq!(alloc(&mut heap, 40), small);

  let large = alloc(&mut heap, 1000);
  alloc(&mut heap, 10);
  free(&mut heap, large);
  assert_eq!(alloc(&mut heap, 1000), large);
  heap.verify().unwrap();
}

#[test]
fn test_double_free_is_detected() {
  let mut heap = heap();
  let small = alloc(&mut heap, 16);
  let large = alloc(&mut heap, 400);
  alloc(&mut heap, 16);

  free(&mut heap, small);
  free(&mut heap, large);

  let err = unsafe { heap.deallocate(small.as_ptr()) }.unwrap_err();
  assert_eq!(
    err,
    AllocError::InvalidPointer {
      addr: small.as_ptr() as usize,
      reason: Corruption::InQuickList
    }
  );
  let err = unsafe { heap.deallocate(large.as_ptr()) }.unwrap_err();
  assert!(matches!(
    err,
    AllocError::InvalidPointer {
      reason: Corruption::NotAllocated,
      ..
    }
  ));
  heap.verify().unwrap();
}

#[test]
fn test_foreign_pointer_is_detected() {
  let mut heap = heap();
  alloc(&mut heap, 16);

  let mut local = [0u64; 4];
  let err = unsafe { heap.deallocate(local.as_mut_ptr().cast()) }.unwrap_err();
  assert!(matches!(
    err,
    AllocError::InvalidPointer {
      reason: Corruption::OutOfBounds,
      ..
    }
  ));
}

#[test]
fn test_any_flipped_header_bit_is_fatal() {
  let mut heap = heap();
  alloc(&mut heap, 100);
  let victim = alloc(&mut heap, 40);
  alloc(&mut heap, 300);

  let header = unsafe { victim.as_ptr().sub(8).cast::<u64>() };
  for bit in 0..64 {
    unsafe { *header ^= 1 << bit };
    let result = unsafe { heap.deallocate(victim.as_ptr()) };
    assert!(
      matches!(result, Err(AllocError::InvalidPointer { .. })),
      "flipping bit {bit} went unnoticed"
    );
    unsafe { *header ^= 1 << bit };
  }

  free(&mut heap, victim);
  heap.verify().unwrap();
}

/// Set in the re-executed test binary that is expected to die.
const ABORT_CHILD_ENV: &str = "SEGFIT_ABORT_CHILD";

#[test]
fn test_flipped_header_aborts_by_default() {
  if env::var_os(ABORT_CHILD_ENV).is_some() {
    let mut heap = Heap::with_pages(MmapPages::with_max_pages(4), Config::new().with_magic(MAGIC));
    alloc(&mut heap, 100);
    let victim = alloc(&mut heap, 40);
    unsafe {
      *victim.as_ptr().sub(8).cast::<u64>() ^= 1 << 40;
      let _ = heap.deallocate(victim.as_ptr());
    }
    // Reaching this point means the corrupted free was accepted.
    std::process::exit(0);
  }

  let status = Command::new(env::current_exe().unwrap())
    .args(["--exact", "test_flipped_header_aborts_by_default", "--test-threads=1"])
    .env(ABORT_CHILD_ENV, "1")
    .status()
    .unwrap();
  assert!(!status.success(), "child exited with {status}");

  #[cfg(unix)]
  {
    use std::os::unix::process::ExitStatusExt;
    assert_eq!(status.signal(), Some(libc::SIGABRT));
  }
}

// =============================================================================
// Resize
// =============================================================================

#[test]
fn test_realloc_larger_block() {
  let mut heap = heap();
  let x = alloc(&mut heap, 4);
  alloc(&mut heap, 10);
  unsafe { x.as_ptr().write_bytes(0x7E, 4) };

  let x = unsafe { heap.resize(x.as_ptr(), 80) }.unwrap().unwrap();
  let info = heap.block_info(x).unwrap();
  assert!(info.allocated);
  assert_eq!(info.block_size, 96);
  assert_eq!(info.payload_size, 80);
  assert!((0..4).all(|i| unsafe { *x.as_ptr().add(i) } == 0x7E));

  assert_eq!(quick_count(&heap, 0), 1);
  assert_eq!(quick_count(&heap, 32), 1);
  assert_eq!(free_count(&heap, 0), 1);
  assert_eq!(free_count(&heap, 3888), 1);
  heap.verify().unwrap();
}

#[test]
fn test_realloc_smaller_block_splinter() {
  let mut heap = heap();
  let x = alloc(&mut heap, 80);
  let y = unsafe { heap.resize(x.as_ptr(), 64) }.unwrap().unwrap();
  assert_eq!(x, y);

  let info = heap.block_info(y).unwrap();
  assert!(info.allocated);
  assert_eq!(info.block_size, 96);
  assert_eq!(info.payload_size, 64);

  assert_eq!(quick_count(&heap, 0), 0);
  assert_eq!(free_count(&heap, 0), 1);
  assert_eq!(free_count(&heap, 3952), 1);
  heap.verify().unwrap();
}

#[test]
fn test_realloc_smaller_block_free_block() {
  let mut heap = heap();
  let x = alloc(&mut heap, 64);
  let y = unsafe { heap.resize(x.as_ptr(), 4) }.unwrap().unwrap();
  assert_eq!(x, y);

  let info = heap.block_info(y).unwrap();
  assert!(info.allocated);
  assert_eq!(info.block_size, 32);

  // The split-off tail goes straight to the directory and merges with the wilderness.
  assert_eq!(quick_count(&heap, 0), 0);
  assert_eq!(free_count(&heap, 0), 1);
  assert_eq!(free_count(&heap, 4016), 1);
  heap.verify().unwrap();
}

#[test]
fn test_realloc_same_block_size() {
  let mut heap = heap();
  let x = alloc(&mut heap, 20);
  let y = unsafe { heap.resize(x.as_ptr(), 30) }.unwrap().unwrap();
  assert_eq!(x, y);
  assert_eq!(heap.block_info(y).unwrap().payload_size, 30);
  assert_eq!(heap.current_payload(), 30);
  assert_eq!(heap.peak_payload(), 30);
  heap.verify().unwrap();
}

#[test]
fn test_realloc_null_allocates() {
  let mut heap = heap();
  let x = unsafe { heap.resize(std::ptr::null_mut(), 24) }.unwrap().unwrap();
  assert_eq!(heap.block_info(x).unwrap().block_size, 48);
}

#[test]
fn test_realloc_zero_frees() {
  let mut heap = heap();
  let x = alloc(&mut heap, 24);
  assert_eq!(unsafe { heap.resize(x.as_ptr(), 0) }, Ok(None));
  assert_eq!(heap.current_payload(), 0);
  assert_eq!(quick_count(&heap, 48), 1);
}

#[test]
fn test_realloc_invalid_pointer() {
  let mut heap = heap();
  let x = alloc(&mut heap, 200);
  let before: Vec<_> = heap.blocks().collect();

  let inside = unsafe { x.as_ptr().add(16) };
  assert_eq!(
    unsafe { heap.resize(inside, 10) },
    Err(AllocError::InvalidArgument)
  );
  let mut local = 0u64;
  assert_eq!(
    unsafe { heap.resize((&mut local as *mut u64).cast(), 10) },
    Err(AllocError::InvalidArgument)
  );
  assert_eq!(heap.blocks().collect::<Vec<_>>(), before);
}

#[test]
fn test_realloc_growth_failure_keeps_original() {
  let mut heap = Heap::with_pages(MmapPages::with_max_pages(1), Config::new().with_magic(MAGIC));
  let x = alloc(&mut heap, 100);
  unsafe { x.as_ptr().write_bytes(0x11, 100) };

  assert_eq!(
    unsafe { heap.resize(x.as_ptr(), 8000) },
    Err(AllocError::OutOfMemory { requested: 8000 })
  );
  let info = heap.block_info(x).unwrap();
  assert!(info.allocated);
  assert_eq!(info.payload_size, 100);
  assert!((0..100).all(|i| unsafe { *x.as_ptr().add(i) } == 0x11));
  heap.verify().unwrap();
}

// =============================================================================
// Metrics
// =============================================================================

#[test]
fn test_fragmentation_no_allocations() {
  let heap = heap();
  assert_eq!(heap.fragmentation(), 0.0);
  assert_eq!(heap.utilization(), 0.0);
}

#[test]
fn test_fragmentation_single_allocation() {
  let mut heap = heap();
  alloc(&mut heap, 20);
  assert_close(heap.fragmentation(), 20.0 / 48.0);
}

#[test]
fn test_fragmentation_multiple_allocations() {
  let mut heap = heap();
  alloc(&mut heap, 24);
  alloc(&mut heap, 100);
  alloc(&mut heap, 40);
  assert_close(heap.fragmentation(), 164.0 / 240.0);
}

#[test]
fn test_fragmentation_ignores_freed_large_block() {
  let mut heap = heap();
  alloc(&mut heap, 24);
  let b = alloc(&mut heap, 2000);
  alloc(&mut heap, 64);
  free(&mut heap, b);
  assert_close(heap.fragmentation(), 88.0 / 128.0);
}

#[test]
fn test_fragmentation_counts_quick_blocks_once() {
  let mut heap = heap();
  alloc(&mut heap, 100);
  let b = alloc(&mut heap, 20);
  free(&mut heap, b);
  assert_close(heap.fragmentation(), 120.0 / 176.0);
}

#[test]
fn test_fragmentation_all_freed_twice() {
  let mut heap = heap();
  for _ in 0..2 {
    let x = alloc(&mut heap, 2000);
    free(&mut heap, x);
    assert_eq!(heap.fragmentation(), 0.0);
  }
}

#[test]
fn test_utilization_single_allocation() {
  let mut heap = heap();
  alloc(&mut heap, 20);
  assert_close(heap.utilization(), 20.0 / 4096.0);
}

#[test]
fn test_utilization_multiple_allocations() {
  let mut heap = heap();
  alloc(&mut heap, 100);
  alloc(&mut heap, 200);
  alloc(&mut heap, 300);
  assert_close(heap.utilization(), 600.0 / 4096.0);
}

#[test]
fn test_utilization_peak_does_not_shrink() {
  let mut heap = heap();
  let a = alloc(&mut heap, 2000);
  free(&mut heap, a);
  assert_eq!(heap.current_payload(), 0);
  assert_close(heap.utilization(), 2000.0 / 4096.0);
}

#[test]
fn test_utilization_grows_with_heap() {
  let mut heap = heap();
  alloc(&mut heap, 6000);
  assert_eq!(heap.arena_size(), 2 * PAGE_SIZE);
  assert_close(heap.utilization(), 6000.0 / 8192.0);
}

#[test]
fn test_flush_quick_lists_coalesces_everything() {
  let mut heap = heap();
  let ptrs: Vec<_> = (1..=8).map(|i| alloc(&mut heap, i * 16)).collect();
  for ptr in ptrs {
    free(&mut heap, ptr);
  }
  assert_eq!(quick_count(&heap, 0), 8);

  heap.flush_quick_lists();
  assert_eq!(quick_count(&heap, 0), 0);
  assert_eq!(free_count(&heap, 0), 1);
  assert_eq!(free_count(&heap, 4048), 1);
  assert_eq!(heap.fragmentation(), 0.0);
  heap.verify().unwrap();
}
