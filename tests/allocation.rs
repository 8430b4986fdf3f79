//! Single-threaded behaviour of the allocation protocol.

use std::{
  alloc::Layout,
  collections::HashSet,
  ptr::NonNull,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
};

use nonmoving::{
  AllocError, BLOCK_ALLOCATED, BlockSupplier, Heap, HeapConfig, HeapError, RawBlocks, SegmentLocation,
  SupplyError,
};

const WORD: usize = std::mem::size_of::<usize>();

fn init_logging() {
  let _ = env_logger::builder().is_test(true).try_init();
}

/// 64-byte segments: four one-word blocks each.
fn tiny_config(workers: usize) -> HeapConfig {
  HeapConfig {
    segment_bits: 6,
    class_count: 1,
    workers,
    ..HeapConfig::default()
  }
}

#[cfg(target_pointer_width = "64")]
#[test]
fn fifth_allocation_moves_to_a_fresh_segment() {
  init_logging();
  let mut heap = Heap::new(tiny_config(1)).unwrap();
  assert_eq!(heap.current_segment(0, 0).unwrap().block_count(), 4);

  let before = heap.stats();
  assert!(before.free_segments > 0, "first supplier request should leave spare segments");

  let ptrs: Vec<NonNull<u8>> = {
    let m = heap.mutator(0).unwrap();
    (0..5).map(|_| m.allocate(1).unwrap()).collect()
  };

  // Exactly one fallback, served by the pool rather than the OS.
  let after = heap.stats();
  assert_eq!(after.os_requests, before.os_requests);
  assert_eq!(after.free_segments, before.free_segments - 1);

  let first = heap.segment_of(ptrs[0].as_ptr()).unwrap();
  for (i, p) in ptrs[..4].iter().enumerate() {
    let seg = heap.segment_of(p.as_ptr()).unwrap();
    assert_eq!(seg, first);
    assert_eq!(seg.block_index(p.as_ptr()), Some(i));
    assert_eq!(seg.bitmap_byte(i), BLOCK_ALLOCATED);
  }

  let second = heap.segment_of(ptrs[4].as_ptr()).unwrap();
  assert_ne!(second, first);
  assert_eq!(second.block_index(ptrs[4].as_ptr()), Some(0));
  assert_eq!(heap.current_segment(0, 0), Some(second));

  let first_base = first.base();
  let second_base = second.base();
  let census = heap.census();
  let location_of = |base| {
    census
      .iter()
      .find(|(_, seg)| seg.base() == base)
      .map(|(loc, _)| *loc)
  };
  assert_eq!(location_of(first_base), Some(SegmentLocation::Filled { class: 0 }));
  assert_eq!(
    location_of(second_base),
    Some(SegmentLocation::Current { class: 0, worker: 0 })
  );
}

#[test]
fn fast_path_hands_out_consecutive_blocks() {
  let heap = Heap::new(HeapConfig::default()).unwrap();
  let m = heap.mutator(0).unwrap();
  let seg = heap.current_segment(2, 0).unwrap();

  for i in 0..16 {
    let p = m.allocate(4).unwrap();
    assert_eq!(p, seg.block(i));
    assert_eq!(seg.next_free(), i + 1);
  }
  assert_eq!(seg.block_size(), 4 * WORD);
}

#[test]
fn every_class_returns_aligned_segments() {
  let heap = Heap::new(HeapConfig::default()).unwrap();
  let m = heap.mutator(0).unwrap();
  let segment_size = heap.config().segment_size();

  let mut words = 1;
  while words <= heap.max_words() {
    for _ in 0..64 {
      let p = m.allocate(words).unwrap();
      let seg = heap.segment_of(p.as_ptr()).unwrap();
      assert_eq!(seg.base().as_ptr() as usize % segment_size, 0);
      assert_eq!(seg.class(), heap.size_class(words).unwrap());
      assert!(seg.block_size() >= words * WORD);
      assert_eq!(p.as_ptr() as usize % WORD, 0);
    }
    words *= 2;
  }
}

#[test]
fn oversized_request_leaves_the_heap_untouched() {
  let heap = Heap::new(HeapConfig::default()).unwrap();
  let before = heap.stats();
  let m = heap.mutator(0).unwrap();

  let words = heap.max_words() + 1;
  assert_eq!(
    m.allocate(words),
    Err(AllocError::SizeTooLarge {
      words,
      max_words: heap.max_words()
    })
  );
  assert_eq!(heap.stats(), before);
  assert!(m.allocate(heap.max_words()).is_ok());
}

#[test]
fn zero_words_uses_the_smallest_class() {
  let heap = Heap::new(HeapConfig::default()).unwrap();
  let m = heap.mutator(0).unwrap();
  let p = m.allocate(0).unwrap();
  assert_eq!(heap.segment_of(p.as_ptr()).unwrap().class(), 0);
}

#[test]
fn foreign_pointers_have_no_segment() {
  let heap = Heap::new(HeapConfig::default()).unwrap();
  let local = 0u64;
  assert!(heap.segment_of(&local as *const u64 as *const u8).is_none());
  assert!(heap.segment_of(std::ptr::null()).is_none());
  let boxed = Box::new([0u8; 64]);
  assert!(heap.segment_of(boxed.as_ptr()).is_none());
}

#[test]
fn mutator_claims_are_exclusive() {
  let heap = Heap::new(HeapConfig {
    workers: 2,
    ..HeapConfig::default()
  })
  .unwrap();

  let m0 = heap.mutator(0).unwrap();
  assert!(matches!(heap.mutator(0), Err(HeapError::WorkerBusy(0))));
  assert!(matches!(
    heap.mutator(2),
    Err(HeapError::WorkerOutOfRange { worker: 2, workers: 2 })
  ));
  let m1 = heap.mutator(1).unwrap();
  assert_eq!(m1.worker(), 1);

  drop(m0);
  let again = heap.mutator(0).unwrap();
  assert_ne!(again.allocate(1).unwrap(), m1.allocate(1).unwrap());
}

#[test]
fn invalid_config_is_rejected() {
  let err = Heap::new(HeapConfig {
    class_count: 0,
    ..HeapConfig::default()
  })
  .unwrap_err();
  assert!(matches!(err, HeapError::Config(_)));
}

// -----------------------------------------------------------------------------
// Custom suppliers
// -----------------------------------------------------------------------------

const SEGMENT: usize = 1024;
const GRANULE: usize = 256;

#[derive(Default)]
struct Counters {
  requests: AtomicUsize,
  released: AtomicUsize,
}

/// Hands out granule-aligned ranges that never start on a segment boundary.
struct OffsetSupplier {
  counters: Arc<Counters>,
}

impl OffsetSupplier {
  fn layout(len: usize) -> Layout {
    Layout::from_size_align(len + SEGMENT, SEGMENT).unwrap()
  }
}

impl BlockSupplier for OffsetSupplier {
  fn granule(&self) -> usize {
    GRANULE
  }

  fn request_blocks(&self, _node: u32, count: usize) -> Result<RawBlocks, SupplyError> {
    let len = count * GRANULE;
    let base = unsafe { std::alloc::alloc_zeroed(Self::layout(len)) };
    let start = NonNull::new(base).ok_or(SupplyError::OutOfMemory { node: 0, bytes: len })?;
    self.counters.requests.fetch_add(1, Ordering::Relaxed);
    Ok(RawBlocks {
      start: unsafe { start.add(GRANULE) },
      len,
    })
  }

  unsafe fn release_blocks(&self, blocks: RawBlocks) {
    self.counters.released.fetch_add(1, Ordering::Relaxed);
    unsafe { std::alloc::dealloc(blocks.start.as_ptr().sub(GRANULE), Self::layout(blocks.len)) };
  }
}

#[test]
fn unaligned_supplier_memory_is_carved_to_alignment() {
  let counters = Arc::new(Counters::default());
  let config = HeapConfig {
    segment_bits: 10,
    class_count: 2,
    workers: 2,
    ..HeapConfig::default()
  };
  let heap = Heap::with_supplier(
    config,
    OffsetSupplier {
      counters: counters.clone(),
    },
  )
  .unwrap();

  // One request per segment: 7 granules only ever hold one aligned segment.
  let stats = heap.stats();
  assert_eq!(stats.os_requests, 4);
  assert_eq!(stats.segments_carved, 4);
  assert_eq!(stats.free_segments, 0);

  let mut bases = HashSet::new();
  for class in 0..2 {
    for worker in 0..2 {
      let seg = heap.current_segment(class, worker).unwrap();
      assert_eq!(seg.base().as_ptr() as usize % SEGMENT, 0);
      assert_eq!(seg.class(), class);
      assert!(bases.insert(seg.base()));
    }
  }

  let m = heap.mutator(1).unwrap();
  let p = m.allocate(2).unwrap();
  assert_eq!(heap.segment_of(p.as_ptr()), heap.current_segment(1, 1));
  drop(m);

  drop(heap);
  assert_eq!(counters.requests.load(Ordering::Relaxed), 4);
  assert_eq!(counters.released.load(Ordering::Relaxed), 4);
}

/// Always fails.
struct EmptySupplier;

impl BlockSupplier for EmptySupplier {
  fn granule(&self) -> usize {
    4096
  }

  fn request_blocks(&self, node: u32, count: usize) -> Result<RawBlocks, SupplyError> {
    Err(SupplyError::OutOfMemory {
      node,
      bytes: count * 4096,
    })
  }

  unsafe fn release_blocks(&self, _blocks: RawBlocks) {}
}

#[test]
fn supplier_failure_during_startup_is_reported() {
  let err = Heap::with_supplier(HeapConfig::default(), EmptySupplier).unwrap_err();
  assert!(matches!(err, HeapError::Supply(SupplyError::OutOfMemory { node: 0, .. })));
}
