//! Segregated free-list directory.
//!
//! Each class is a circular doubly-linked list threaded through the free blocks
//! themselves. The sentinels live in the heap struct, so a link word either holds a block
//! address or, for values below [`NUM_FREE_LISTS`], the index of a sentinel. Block
//! addresses are never that small.

use crate::{MIN_BLOCK_SIZE, NUM_FREE_LISTS, block::Block, header::Header, pages::PageSource};

use super::Heap;

/// Free-list class for a block of `size` bytes.
///
/// Class 0 holds exactly-minimum blocks; class `i` covers `(32 << (i - 1), 32 << i]`; the
/// last class takes everything larger.
pub const fn size_class(size: usize) -> usize {
  if size <= MIN_BLOCK_SIZE {
    return 0;
  }
  let mut threshold = MIN_BLOCK_SIZE;
  let mut class = 0;
  while threshold < size && class < NUM_FREE_LISTS - 1 {
    threshold <<= 1;
    class += 1;
  }
  class
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Node {
  Sentinel(usize),
  Block(Block),
}

impl Node {
  #[inline]
  fn to_link(self) -> usize {
    match self {
      Self::Sentinel(class) => class,
      Self::Block(block) => block.addr(),
    }
  }

  #[inline]
  pub(crate) unsafe fn from_link(link: usize) -> Self {
    if link < NUM_FREE_LISTS {
      Self::Sentinel(link)
    } else {
      Self::Block(unsafe { Block::at(link) })
    }
  }
}

/// Links of a sentinel node.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Links {
  pub next: Node,
  pub prev: Node,
}

/// All classes empty: every sentinel points at itself.
pub(crate) const fn sentinels() -> [Links; NUM_FREE_LISTS] {
  let mut lists = [Links {
    next: Node::Sentinel(0),
    prev: Node::Sentinel(0),
  }; NUM_FREE_LISTS];
  let mut class = 0;
  while class < NUM_FREE_LISTS {
    lists[class] = Links {
      next: Node::Sentinel(class),
      prev: Node::Sentinel(class),
    };
    class += 1;
  }
  lists
}

impl<P: PageSource> Heap<P> {
  #[inline]
  pub(crate) unsafe fn next_of(&self, node: Node) -> Node {
    match node {
      Node::Sentinel(class) => self.free_lists[class].next,
      Node::Block(block) => unsafe { Node::from_link(block.next_link()) },
    }
  }

  #[inline]
  pub(crate) unsafe fn prev_of(&self, node: Node) -> Node {
    match node {
      Node::Sentinel(class) => self.free_lists[class].prev,
      Node::Block(block) => unsafe { Node::from_link(block.prev_link()) },
    }
  }

  #[inline]
  unsafe fn set_next(&mut self, node: Node, to: Node) {
    match node {
      Node::Sentinel(class) => self.free_lists[class].next = to,
      Node::Block(block) => unsafe { block.set_next_link(to.to_link()) },
    }
  }

  #[inline]
  unsafe fn set_prev(&mut self, node: Node, to: Node) {
    match node {
      Node::Sentinel(class) => self.free_lists[class].prev = to,
      Node::Block(block) => unsafe { block.set_prev_link(to.to_link()) },
    }
  }

  /// Writes free tags over `block` and pushes it at the head of its class.
  pub(crate) unsafe fn insert_free(&mut self, block: Block, size: usize) {
    unsafe { self.write_tags(block, Header::free(size)) };

    let sentinel = Node::Sentinel(size_class(size));
    let node = Node::Block(block);
    unsafe {
      let head = self.next_of(sentinel);
      self.set_next(node, head);
      self.set_prev(node, sentinel);
      self.set_prev(head, node);
      self.set_next(sentinel, node);
    }
  }

  /// Detaches `block` from whichever class list holds it.
  pub(crate) unsafe fn unlink(&mut self, block: Block) {
    let node = Node::Block(block);
    unsafe {
      let prev = self.prev_of(node);
      let next = self.next_of(node);
      self.set_next(prev, next);
      self.set_prev(next, prev);
    }
  }

  /// First block of at least `size` bytes, scanning classes upward from `size_class(size)`
  /// and each list from its most recently filed block.
  pub(crate) unsafe fn find_first_fit(&self, size: usize) -> Option<Block> {
    for class in size_class(size)..NUM_FREE_LISTS {
      let mut node = self.free_lists[class].next;
      while let Node::Block(block) = node {
        if self.header_of(block).block_size >= size {
          return Some(block);
        }
        node = unsafe { self.next_of(node) };
      }
    }
    None
  }
}
