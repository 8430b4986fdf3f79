use nonmoving::{Heap, HeapConfig};
use proptest::prelude::*;

const WORD: usize = std::mem::size_of::<usize>();

proptest! {
  /// Invariant: a bigger request never maps to a smaller class.
  #[test]
  fn size_class_is_monotonic(a in 0usize..100_000, b in 0usize..100_000) {
    let config = HeapConfig::default();
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    match (config.size_class(lo), config.size_class(hi)) {
      (Ok(x), Ok(y)) => prop_assert!(x <= y),
      (Err(_), Ok(_)) => prop_assert!(false, "{} rejected but {} accepted", lo, hi),
      _ => {}
    }
  }

  /// Invariant: the class block is the smallest power of two holding the request.
  #[test]
  fn size_class_is_tight(words in 1usize..=2048) {
    let config = HeapConfig::default();
    let class = config.size_class(words).unwrap();
    let block = 1usize << (config.min_block_bits + class as u32);
    prop_assert!(block >= words * WORD);
    prop_assert!(class == 0 || block / 2 < words * WORD);
  }

  /// Invariant: blocks handed to one worker never overlap, whatever the mix of sizes.
  #[test]
  fn allocations_never_overlap(sizes in prop::collection::vec(1usize..=64, 1..400)) {
    let heap = Heap::new(HeapConfig {
      segment_bits: 10,
      class_count: 7,
      ..HeapConfig::default()
    }).unwrap();
    let m = heap.mutator(0).unwrap();

    let mut spans = Vec::with_capacity(sizes.len());
    for words in sizes {
      let p = m.allocate(words).unwrap();
      let seg = heap.segment_of(p.as_ptr()).unwrap();
      prop_assert!(seg.block_size() >= words * WORD);
      prop_assert_eq!(seg.base().as_ptr() as usize % 1024, 0);
      spans.push((p.as_ptr() as usize, seg.block_size()));
    }

    spans.sort_unstable();
    for pair in spans.windows(2) {
      prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0, "{:#x} overlaps {:#x}", pair[0].0, pair[1].0);
    }
  }
}
