//! Raw views of a block inside the arena.
//!
//! A block is identified by the address of its header word. Depending on the flags its
//! interior is either caller payload, free-list links (`next` at +8, `prev` at +16) or a
//! quick-list link (`next` at +8). The views here do no validation.
//!
//! ```text
//!   allocated              free                   quick-listed
//!  ┌──────────────┐      ┌──────────────┐       ┌──────────────┐
//!  │ header       │      │ header       │       │ header       │
//!  ├──────────────┤      ├──────────────┤       ├──────────────┤
//!  │ payload ...  │      │ next         │       │ next         │
//!  │              │      │ prev         │       │ (stale)      │
//!  │              │      │ ...          │       │ ...          │
//!  ├──────────────┤      ├──────────────┤       ├──────────────┤
//!  │ footer       │      │ footer       │       │ footer       │
//!  └──────────────┘      └──────────────┘       └──────────────┘
//! ```

use core::ptr::NonNull;

use crate::WORD_SIZE;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Block(NonNull<u8>);

impl Block {
  /// # Safety
  /// `addr` must be a non-null, 8-aligned address inside the arena.
  #[inline(always)]
  pub unsafe fn at(addr: usize) -> Self {
    Self(unsafe { NonNull::new_unchecked(addr as *mut u8) })
  }

  /// # Safety
  /// `payload` must be a payload address previously checked against the arena bounds.
  #[inline(always)]
  pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
    Self(unsafe { payload.sub(WORD_SIZE) })
  }

  #[inline(always)]
  pub fn addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  #[inline(always)]
  pub fn payload(self) -> NonNull<u8> {
    unsafe { self.0.add(WORD_SIZE) }
  }

  /// Block starting `bytes` past this one.
  #[inline(always)]
  pub unsafe fn offset(self, bytes: usize) -> Self {
    Self(unsafe { self.0.add(bytes) })
  }

  #[inline(always)]
  pub unsafe fn read_header(self) -> u64 {
    unsafe { self.word(0).read() }
  }

  #[inline(always)]
  pub unsafe fn write_header(self, word: u64) {
    unsafe { self.word(0).write(word) }
  }

  /// Footer of a block spanning `size` bytes.
  #[inline(always)]
  pub unsafe fn read_footer(self, size: usize) -> u64 {
    unsafe { self.word(size - WORD_SIZE).read() }
  }

  #[inline(always)]
  pub unsafe fn write_footer(self, size: usize, word: u64) {
    unsafe { self.word(size - WORD_SIZE).write(word) }
  }

  /// Footer of the block physically preceding this one.
  #[inline(always)]
  pub unsafe fn read_prev_footer(self) -> u64 {
    unsafe { self.0.sub(WORD_SIZE).cast::<u64>().read() }
  }

  /// First link slot (free-list `next`, or quick-list `next`).
  #[inline(always)]
  pub unsafe fn next_link(self) -> usize {
    unsafe { self.word(WORD_SIZE).read() as usize }
  }

  #[inline(always)]
  pub unsafe fn set_next_link(self, link: usize) {
    unsafe { self.word(WORD_SIZE).write(link as u64) }
  }

  /// Second link slot (free-list `prev`).
  #[inline(always)]
  pub unsafe fn prev_link(self) -> usize {
    unsafe { self.word(2 * WORD_SIZE).read() as usize }
  }

  #[inline(always)]
  pub unsafe fn set_prev_link(self, link: usize) {
    unsafe { self.word(2 * WORD_SIZE).write(link as u64) }
  }

  #[inline(always)]
  unsafe fn word(self, at: usize) -> *mut u64 {
    unsafe { self.0.add(at).cast::<u64>().as_ptr() }
  }
}
