use crate::pages::PageSource;

use super::Heap;

impl<P: PageSource> Heap<P> {
  /// Ratio of requested payload to block bytes over every allocated block, quick-listed
  /// ones included. `0.0` when nothing is allocated.
  ///
  /// Walks the arena once; each block is counted exactly once.
  pub fn fragmentation(&self) -> f64 {
    let (payload, blocks) = self
      .blocks()
      .filter(|info| info.allocated)
      .fold((0usize, 0usize), |(payload, blocks), info| {
        (payload + info.payload_size, blocks + info.block_size)
      });

    if blocks == 0 {
      0.0
    } else {
      payload as f64 / blocks as f64
    }
  }

  /// Peak payload over the current arena size. `0.0` before the arena exists.
  pub fn utilization(&self) -> f64 {
    let arena = self.arena_size();
    if arena == 0 {
      return 0.0;
    }
    self.peak_payload as f64 / arena as f64
  }
}
