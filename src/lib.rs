//! Segmented, size-classed allocator for a concurrent non-moving heap generation.
//!
//! Mutators allocate fixed-size blocks out of per-worker "current" segments with
//! plain loads and stores. Exhausted segments are handed off lock-free: a worker
//! swaps its current segment for the head of the class's active list, or parks a
//! sentinel in its slot while it pulls a fresh segment from the global pool. An
//! external collector marks and sweeps the same segments through their bitmaps.

use core::{
  fmt, hint,
  marker::PhantomData,
  mem::{self, size_of},
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering},
};
use std::{alloc::Layout, cell::Cell};

use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

const WORD_SIZE: usize = size_of::<usize>();
const WORD_BITS: u32 = WORD_SIZE.trailing_zeros();

const SEGMENT_HEADER_SIZE: usize = size_of::<SegmentHeader>();

/// Smallest segment that still fits a header and a handful of blocks.
const MIN_SEGMENT_BITS: u32 = 6;
const MAX_SEGMENT_BITS: u32 = 30;
const DEFAULT_SEGMENT_BITS: u32 = 15; // 32KB

/// Class 0 holds one-word objects.
const DEFAULT_MIN_BLOCK_BITS: u32 = WORD_BITS;
const DEFAULT_CLASS_COUNT: usize = 12;
const MAX_CLASSES: usize = 32;

/// Bitmap value for a block nobody has claimed.
pub const BLOCK_FREE: u8 = 0;
/// Bitmap value the allocator writes when it hands a block out. The collector
/// may overwrite it with its own non-zero mark values.
pub const BLOCK_ALLOCATED: u8 = 1;

/// Page size assumed when the OS refuses to tell us.
const FALLBACK_PAGE_SIZE: usize = 4096;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(WORD_SIZE.is_power_of_two());
const _: () = assert!(SEGMENT_HEADER_SIZE % WORD_SIZE == 0);
const _: () = assert!(SEGMENT_HEADER_SIZE < (1 << MIN_SEGMENT_BITS) / 2);
const _: () = assert!(DEFAULT_SEGMENT_BITS >= MIN_SEGMENT_BITS);
const _: () = assert!(DEFAULT_SEGMENT_BITS <= MAX_SEGMENT_BITS);
const _: () = assert!(DEFAULT_MIN_BLOCK_BITS as usize + DEFAULT_CLASS_COUNT <= DEFAULT_SEGMENT_BITS as usize);
const _: () = assert!(DEFAULT_CLASS_COUNT <= MAX_CLASSES);
// The last block of a segment must stay addressable by a u32 bitmap index.
const _: () = assert!(MAX_SEGMENT_BITS < u32::BITS);

// =============================================================================
// Errors
// =============================================================================

/// The only condition `allocate` reports to its caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  #[error("{words} words exceeds the largest size class ({max_words} words); use the large-object path")]
  SizeTooLarge { words: usize, max_words: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("segment_bits must be within {min}..={max}, got {got}")]
  SegmentBits { got: u32, min: u32, max: u32 },
  #[error("min_block_bits must be at least {min} (one word), got {got}")]
  MinBlockBits { got: u32, min: u32 },
  #[error("class_count must be within 1..={max}, got {got}")]
  ClassCount { got: usize, max: usize },
  #[error("largest size class (2^{log_block} bytes) does not fit a 2^{segment_bits}-byte segment")]
  ClassTooLarge { log_block: usize, segment_bits: u32 },
  #[error("numa_nodes must be at least 1")]
  NumaNodes,
  #[error("workers must be at least 1")]
  Workers,
}

/// Failures of the raw block supplier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupplyError {
  #[error("OS refused to map {bytes} bytes on node {node}")]
  OutOfMemory { node: u32, bytes: usize },
  #[error("block request overflows: {count} blocks of {granule} bytes")]
  Overflow { count: usize, granule: usize },
  #[error("supplier returned {len} bytes at {start:#x}, too short for an aligned {segment_size}-byte segment")]
  ShortRange { start: usize, len: usize, segment_size: usize },
}

#[derive(Error, Debug)]
pub enum HeapError {
  #[error("invalid heap configuration: {0}")]
  Config(#[from] ConfigError),
  #[error("worker {worker} out of range (heap has {workers} workers)")]
  WorkerOutOfRange { worker: usize, workers: usize },
  #[error("worker {0} already has a live mutator")]
  WorkerBusy(usize),
  #[error(transparent)]
  Supply(#[from] SupplyError),
}

pub type HeapResult<T> = Result<T, HeapError>;

// =============================================================================
// Configuration
// =============================================================================

/// Opaque identifier of the generation this heap backs. Only stored and handed
/// back to the collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GenerationId(pub u32);

/// Shape of a non-moving heap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
  /// log2 of the segment size in bytes. Segments are aligned to their size.
  pub segment_bits: u32,
  /// log2 of the block size of class 0, in bytes.
  pub min_block_bits: u32,
  /// Number of power-of-two size classes.
  pub class_count: usize,
  /// Number of mutator workers to provision at startup.
  pub workers: usize,
  /// NUMA nodes the workers are spread over (worker `i` sits on `i % numa_nodes`).
  pub numa_nodes: u32,
  pub generation: GenerationId,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      segment_bits: DEFAULT_SEGMENT_BITS,
      min_block_bits: DEFAULT_MIN_BLOCK_BITS,
      class_count: DEFAULT_CLASS_COUNT,
      workers: 1,
      numa_nodes: 1,
      generation: GenerationId(1),
    }
  }
}

impl HeapConfig {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if !(MIN_SEGMENT_BITS..=MAX_SEGMENT_BITS).contains(&self.segment_bits) {
      return Err(ConfigError::SegmentBits {
        got: self.segment_bits,
        min: MIN_SEGMENT_BITS,
        max: MAX_SEGMENT_BITS,
      });
    }
    if self.min_block_bits < WORD_BITS {
      return Err(ConfigError::MinBlockBits {
        got: self.min_block_bits,
        min: WORD_BITS,
      });
    }
    if self.class_count == 0 || self.class_count > MAX_CLASSES {
      return Err(ConfigError::ClassCount {
        got: self.class_count,
        max: MAX_CLASSES,
      });
    }
    let largest = self.min_block_bits as usize + self.class_count - 1;
    if largest >= self.segment_bits as usize || Geometry::new(self).block_count(largest as u32) == 0 {
      return Err(ConfigError::ClassTooLarge {
        log_block: largest,
        segment_bits: self.segment_bits,
      });
    }
    if self.numa_nodes == 0 {
      return Err(ConfigError::NumaNodes);
    }
    if self.workers == 0 {
      return Err(ConfigError::Workers);
    }
    Ok(())
  }

  /// Size class serving an object of `words` words. Only meaningful for a
  /// configuration that passes [`HeapConfig::validate`].
  pub fn size_class(&self, words: usize) -> Result<usize, AllocError> {
    Geometry::new(self).size_class(words)
  }

  pub fn segment_size(&self) -> usize {
    1 << self.segment_bits
  }
}

/// Derived layout numbers shared by every segment of a heap.
#[derive(Clone, Copy, Debug)]
struct Geometry {
  segment_size: usize,
  min_block_bits: u32,
  class_count: usize,
}

impl Geometry {
  fn new(config: &HeapConfig) -> Self {
    Self {
      segment_size: 1 << config.segment_bits,
      min_block_bits: config.min_block_bits,
      class_count: config.class_count,
    }
  }

  #[inline]
  fn log_block(&self, class: usize) -> u32 {
    self.min_block_bits + class as u32
  }

  /// Blocks of `2^log_block` bytes that fit next to the header and their
  /// one-byte-per-block bitmap.
  #[inline]
  fn block_count(&self, log_block: u32) -> usize {
    let data = (self.segment_size - SEGMENT_HEADER_SIZE) & !(WORD_SIZE - 1);
    data / ((1usize << log_block) + 1)
  }

  fn max_words(&self) -> usize {
    (1usize << self.log_block(self.class_count - 1)) / WORD_SIZE
  }

  #[inline]
  fn size_class(&self, words: usize) -> Result<usize, AllocError> {
    let bits = log2_ceil(words.max(1)) + WORD_BITS;
    let class = bits.saturating_sub(self.min_block_bits) as usize;
    if class >= self.class_count {
      return Err(AllocError::SizeTooLarge {
        words,
        max_words: self.max_words(),
      });
    }
    Ok(class)
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

fn os_page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size > 0 {
    size as usize
  } else {
    FALLBACK_PAGE_SIZE
  }
}

/// Hand the physical pages behind a pooled segment back to the kernel.
#[cfg(feature = "release-mem")]
unsafe fn os_release_pages(ptr: *mut u8, size: usize) {
  unsafe { libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED) };
}

// =============================================================================
// Block Supplier
// =============================================================================

/// A contiguous range of raw memory handed out by a [`BlockSupplier`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawBlocks {
  pub start: NonNull<u8>,
  pub len: usize,
}

unsafe impl Send for RawBlocks {}

/// Source of raw memory for new segments.
///
/// The heap never returns individual segments; every range obtained through
/// `request_blocks` is handed back exactly once, when the heap is dropped.
pub trait BlockSupplier: Send + Sync {
  /// Allocation granularity in bytes. Must be a power of two, and every range
  /// returned by `request_blocks` must start on a multiple of it.
  fn granule(&self) -> usize;

  /// Obtain `count` contiguous granules, preferably on NUMA node `node`.
  fn request_blocks(&self, node: u32, count: usize) -> Result<RawBlocks, SupplyError>;

  /// # Safety
  ///
  /// `blocks` must have come from `request_blocks` on this supplier and must
  /// no longer be referenced.
  unsafe fn release_blocks(&self, blocks: RawBlocks);
}

/// Anonymous private mappings straight from the kernel.
#[derive(Debug, Clone, Copy)]
pub struct MmapSupplier {
  page_size: usize,
}

impl MmapSupplier {
  pub fn new() -> Self {
    Self {
      page_size: os_page_size(),
    }
  }
}

impl Default for MmapSupplier {
  fn default() -> Self {
    Self::new()
  }
}

impl BlockSupplier for MmapSupplier {
  fn granule(&self) -> usize {
    self.page_size
  }

  // Placement on `node` is left to the kernel's first-touch policy.
  fn request_blocks(&self, node: u32, count: usize) -> Result<RawBlocks, SupplyError> {
    let bytes = count.checked_mul(self.page_size).ok_or(SupplyError::Overflow {
      count,
      granule: self.page_size,
    })?;
    let ptr = unsafe { os_mmap(bytes) };
    let start = NonNull::new(ptr).ok_or(SupplyError::OutOfMemory { node, bytes })?;
    Ok(RawBlocks { start, len: bytes })
  }

  unsafe fn release_blocks(&self, blocks: RawBlocks) {
    unsafe { os_munmap(blocks.start.as_ptr(), blocks.len) };
  }
}

// =============================================================================
// Segment
// =============================================================================

/// Segment metadata. Sits at offset 0 of each segment, followed by one bitmap
/// byte per block and then the word-aligned block data.
#[repr(C)]
struct SegmentHeader {
  /// Intrusive link for the active, filled and free lists.
  link: AtomicPtr<SegmentHeader>,
  /// Lower bound on the index of the first free block.
  next_free: AtomicU32,
  /// `next_free` as of the last collection snapshot. Blocks at or above it
  /// were allocated during the cycle and count as live.
  next_free_snap: AtomicU32,
  block_count: AtomicU32,
  /// log2 of the block size in bytes.
  block_size: AtomicU8,
  class: AtomicU8,
}

#[inline]
const fn data_offset(block_count: usize) -> usize {
  align_up(SEGMENT_HEADER_SIZE + block_count, WORD_SIZE)
}

/// Bitmap byte of block `i`.
///
/// # Safety
///
/// `seg` must point to a live segment and `i` must be below its block count.
#[inline]
unsafe fn bitmap_entry<'a>(seg: *mut SegmentHeader, i: usize) -> &'a AtomicU8 {
  unsafe { AtomicU8::from_ptr(seg.cast::<u8>().add(SEGMENT_HEADER_SIZE + i)) }
}

#[inline]
unsafe fn block_ptr(seg: *mut SegmentHeader, i: usize) -> *mut u8 {
  let header = unsafe { &*seg };
  let count = header.block_count.load(Ordering::Relaxed) as usize;
  let log_block = header.block_size.load(Ordering::Relaxed);
  unsafe { seg.cast::<u8>().add(data_offset(count) + (i << log_block)) }
}

/// Put a segment into its initialized state for `class`.
///
/// Header fields are stored through their atomics: a stale `SegmentList::pop`
/// on another thread may still be loading `link` from a recycled segment.
///
/// # Safety
///
/// The caller must own `seg` exclusively; nothing else may observe it until
/// it is published.
unsafe fn init_segment(seg: *mut SegmentHeader, class: usize, geometry: &Geometry) {
  let log_block = geometry.log_block(class);
  let count = geometry.block_count(log_block);
  unsafe {
    AtomicPtr::<SegmentHeader>::from_ptr((&raw mut (*seg).link).cast())
      .store(null_mut(), Ordering::Relaxed);
    AtomicU32::from_ptr((&raw mut (*seg).next_free).cast()).store(0, Ordering::Relaxed);
    AtomicU32::from_ptr((&raw mut (*seg).next_free_snap).cast()).store(0, Ordering::Relaxed);
    AtomicU32::from_ptr((&raw mut (*seg).block_count).cast()).store(count as u32, Ordering::Relaxed);
    AtomicU8::from_ptr((&raw mut (*seg).block_size).cast()).store(log_block as u8, Ordering::Relaxed);
    AtomicU8::from_ptr((&raw mut (*seg).class).cast()).store(class as u8, Ordering::Relaxed);
    ptr::write_bytes(seg.cast::<u8>().add(SEGMENT_HEADER_SIZE), BLOCK_FREE, count);
  }
}

/// Claim the first free block at or above `next_free`.
///
/// Only the worker owning the segment's slot runs this, so plain relaxed
/// loads and stores are enough.
#[inline]
unsafe fn allocate_block_from_segment(seg: *mut SegmentHeader) -> Option<NonNull<u8>> {
  let header = unsafe { &*seg };
  let count = header.block_count.load(Ordering::Relaxed) as usize;
  for i in header.next_free.load(Ordering::Relaxed) as usize..count {
    let entry = unsafe { bitmap_entry(seg, i) };
    if entry.load(Ordering::Relaxed) == BLOCK_FREE {
      entry.store(BLOCK_ALLOCATED, Ordering::Relaxed);
      header.next_free.store(i as u32 + 1, Ordering::Relaxed);
      return NonNull::new(unsafe { block_ptr(seg, i) });
    }
  }
  None
}

/// A segment owned by a [`Heap`], as seen by the collector.
///
/// All accessors go through atomics, so a handle may be used from any thread
/// while the heap is alive.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment<'h> {
  ptr: NonNull<SegmentHeader>,
  _heap: PhantomData<&'h ()>,
}

unsafe impl Send for Segment<'_> {}
unsafe impl Sync for Segment<'_> {}

impl<'h> Segment<'h> {
  #[inline]
  fn from_raw(seg: *mut SegmentHeader) -> Option<Self> {
    NonNull::new(seg).map(|ptr| Self {
      ptr,
      _heap: PhantomData,
    })
  }

  #[inline]
  fn raw(&self) -> *mut SegmentHeader {
    self.ptr.as_ptr()
  }

  #[inline]
  fn header(&self) -> &SegmentHeader {
    unsafe { self.ptr.as_ref() }
  }

  /// Base address; a multiple of the segment size.
  pub fn base(&self) -> NonNull<u8> {
    self.ptr.cast()
  }

  pub fn class(&self) -> usize {
    self.header().class.load(Ordering::Relaxed) as usize
  }

  /// Block size in bytes.
  pub fn block_size(&self) -> usize {
    1 << self.header().block_size.load(Ordering::Relaxed)
  }

  pub fn block_count(&self) -> usize {
    self.header().block_count.load(Ordering::Relaxed) as usize
  }

  pub fn next_free(&self) -> usize {
    self.header().next_free.load(Ordering::Relaxed) as usize
  }

  pub fn next_free_snap(&self) -> usize {
    self.header().next_free_snap.load(Ordering::Relaxed) as usize
  }

  /// Address of block `i`.
  pub fn block(&self, i: usize) -> NonNull<u8> {
    assert!(i < self.block_count(), "block index {i} out of range");
    unsafe { NonNull::new_unchecked(block_ptr(self.raw(), i)) }
  }

  /// Index of the block containing `ptr`, or `None` if `ptr` lies outside the
  /// block data of this segment.
  pub fn block_index(&self, ptr: *const u8) -> Option<usize> {
    let data = self.base().as_ptr() as usize + data_offset(self.block_count());
    let addr = ptr as usize;
    if addr < data {
      return None;
    }
    let i = (addr - data) / self.block_size();
    (i < self.block_count()).then_some(i)
  }

  pub fn bitmap_byte(&self, i: usize) -> u8 {
    assert!(i < self.block_count(), "block index {i} out of range");
    unsafe { bitmap_entry(self.raw(), i) }.load(Ordering::Relaxed)
  }

  pub fn set_bitmap_byte(&self, i: usize, value: u8) {
    assert!(i < self.block_count(), "block index {i} out of range");
    unsafe { bitmap_entry(self.raw(), i) }.store(value, Ordering::Relaxed);
  }

  pub fn clear_bitmap(&self) {
    for i in 0..self.block_count() {
      unsafe { bitmap_entry(self.raw(), i) }.store(BLOCK_FREE, Ordering::Relaxed);
    }
  }

  /// Whether block `i` was handed out after the last collection snapshot,
  /// which makes it live without a bitmap check.
  pub fn is_allocated_since_snapshot(&self, i: usize) -> bool {
    i >= self.next_free_snap()
  }
}

impl fmt::Debug for Segment<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Segment")
      .field("base", &self.ptr)
      .field("class", &self.class())
      .field("next_free", &self.next_free())
      .field("next_free_snap", &self.next_free_snap())
      .finish()
  }
}

// =============================================================================
// Segment Lists (lock-free, tagged head)
// =============================================================================

/// Treiber stack of segments linked through `SegmentHeader::link`.
///
/// Segments are aligned to the segment size, so the low bits of the head carry
/// a modification tag that defeats ABA on pop.
struct SegmentList {
  head: AtomicUsize,
  tag_mask: usize,
}

impl SegmentList {
  const fn new(segment_size: usize) -> Self {
    Self {
      head: AtomicUsize::new(0),
      tag_mask: segment_size - 1,
    }
  }

  #[inline]
  fn unpack(&self, packed: usize) -> *mut SegmentHeader {
    ptr::with_exposed_provenance_mut(packed & !self.tag_mask)
  }

  #[inline]
  fn pack(&self, seg: *mut SegmentHeader, old_packed: usize) -> usize {
    seg.expose_provenance() | (old_packed.wrapping_add(1) & self.tag_mask)
  }

  fn is_empty(&self) -> bool {
    self.unpack(self.head.load(Ordering::Acquire)).is_null()
  }

  /// # Safety
  ///
  /// `seg` must be a live segment that is on no other list and in no slot.
  unsafe fn push(&self, seg: *mut SegmentHeader) {
    debug_assert!(seg.expose_provenance() & self.tag_mask == 0, "misaligned segment {seg:p}");
    loop {
      let packed_head = self.head.load(Ordering::Relaxed);
      unsafe { (*seg).link.store(self.unpack(packed_head), Ordering::Relaxed) };
      // The release CAS orders the link store before the new head.
      if self
        .head
        .compare_exchange_weak(
          packed_head,
          self.pack(seg, packed_head),
          Ordering::Release,
          Ordering::Relaxed,
        )
        .is_ok()
      {
        return;
      }
    }
  }

  fn pop(&self) -> *mut SegmentHeader {
    loop {
      let packed_head = self.head.load(Ordering::Acquire);
      let seg = self.unpack(packed_head);
      if seg.is_null() {
        return null_mut();
      }
      // Segments are never unmapped while the heap lives, so a stale read here
      // is harmless; the tag makes the CAS fail.
      let next = unsafe { (*seg).link.load(Ordering::Relaxed) };
      if self
        .head
        .compare_exchange_weak(
          packed_head,
          self.pack(next, packed_head),
          Ordering::AcqRel,
          Ordering::Relaxed,
        )
        .is_ok()
      {
        unsafe { (*seg).link.store(null_mut(), Ordering::Relaxed) };
        return seg;
      }
    }
  }

  /// Detach the whole list. Links are left in place for the caller to walk.
  fn take_all(&self) -> *mut SegmentHeader {
    let mut packed_head = self.head.load(Ordering::Relaxed);
    loop {
      match self.head.compare_exchange_weak(
        packed_head,
        self.pack(null_mut(), packed_head),
        Ordering::AcqRel,
        Ordering::Relaxed,
      ) {
        Ok(_) => return self.unpack(packed_head),
        Err(actual) => packed_head = actual,
      }
    }
  }

  /// Walk the list without detaching it. Only sound while nothing mutates it.
  fn for_each(&mut self, mut f: impl FnMut(*mut SegmentHeader)) {
    let head = *self.head.get_mut();
    let mut seg = self.unpack(head);
    while !seg.is_null() {
      f(seg);
      seg = unsafe { (*seg).link.load(Ordering::Relaxed) };
    }
  }
}

// =============================================================================
// Free Pool (mutex-guarded, shared by all classes)
// =============================================================================

struct FreePool {
  head: *mut SegmentHeader,
  len: usize,
}

unsafe impl Send for FreePool {}

impl FreePool {
  const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
    }
  }

  unsafe fn push(&mut self, seg: *mut SegmentHeader) {
    unsafe { (*seg).link.store(self.head, Ordering::Relaxed) };
    self.head = seg;
    self.len += 1;
  }

  fn pop(&mut self) -> Option<*mut SegmentHeader> {
    if self.head.is_null() {
      return None;
    }
    let seg = self.head;
    self.head = unsafe { (*seg).link.load(Ordering::Relaxed) };
    unsafe { (*seg).link.store(null_mut(), Ordering::Relaxed) };
    self.len -= 1;
    Some(seg)
  }
}

// =============================================================================
// Allocator (one per size class)
// =============================================================================

struct Allocator {
  class: usize,
  /// One slot per worker. Null is the sentinel meaning "being refilled".
  current: Box<[AtomicPtr<SegmentHeader>]>,
  /// Segments known to have free blocks.
  active: SegmentList,
  /// Segments believed full, waiting for the collector.
  filled: SegmentList,
}

impl Allocator {
  fn new(class: usize, segment_size: usize) -> Self {
    Self {
      class,
      current: Box::new([]),
      active: SegmentList::new(segment_size),
      filled: SegmentList::new(segment_size),
    }
  }

  /// Swap `worker`'s full segment `full` for the head of the active list.
  ///
  /// If the slot no longer holds `full` the popped segment goes back on the
  /// active list and `false` is returned.
  fn take_active(&self, worker: usize, full: *mut SegmentHeader) -> bool {
    let new_current = self.active.pop();
    if new_current.is_null() {
      return false;
    }
    match self.current[worker].compare_exchange(full, new_current, Ordering::AcqRel, Ordering::Acquire) {
      Ok(_) => {
        unsafe { self.filled.push(full) };
        trace!("class {}: worker {worker} retired {full:p}, took active {new_current:p}", self.class);
        true
      }
      Err(_) => {
        unsafe { self.active.push(new_current) };
        false
      }
    }
  }
}

// =============================================================================
// Heap
// =============================================================================

/// Where a segment sits at a quiescent point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegmentLocation {
  Current { class: usize, worker: usize },
  Active { class: usize },
  Filled { class: usize },
  Free,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub workers: usize,
  /// Segments waiting in the global free pool.
  pub free_segments: usize,
  /// Raw ranges requested from the block supplier.
  pub os_requests: usize,
  /// Segments carved out of those ranges.
  pub segments_carved: usize,
}

/// The non-moving heap: one allocator per size class plus the global pool of
/// free segments.
pub struct Heap<S: BlockSupplier = MmapSupplier> {
  config: HeapConfig,
  geometry: Geometry,
  allocators: Box<[Allocator]>,
  free: Mutex<FreePool>,
  workers: usize,
  /// Which workers currently have a live [`Mutator`].
  claimed: Box<[AtomicBool]>,
  /// Every raw range this heap owns, sorted by start address.
  chunks: Mutex<Vec<RawBlocks>>,
  supplier: S,
  os_requests: AtomicUsize,
  segments_carved: AtomicUsize,
}

unsafe impl<S: BlockSupplier> Send for Heap<S> {}
unsafe impl<S: BlockSupplier> Sync for Heap<S> {}

impl Heap<MmapSupplier> {
  pub fn new(config: HeapConfig) -> HeapResult<Self> {
    Self::with_supplier(config, MmapSupplier::new())
  }
}

impl<S: BlockSupplier> Heap<S> {
  /// Build a heap and give each of `config.workers` workers a fresh current
  /// segment in every size class.
  pub fn with_supplier(config: HeapConfig, supplier: S) -> HeapResult<Self> {
    config.validate()?;
    let geometry = Geometry::new(&config);
    let allocators = (0..config.class_count)
      .map(|class| Allocator::new(class, geometry.segment_size))
      .collect();

    let workers = config.workers;
    let mut heap = Self {
      config,
      geometry,
      allocators,
      free: Mutex::new(FreePool::new()),
      workers: 0,
      claimed: Box::new([]),
      chunks: Mutex::new(Vec::new()),
      supplier,
      os_requests: AtomicUsize::new(0),
      segments_carved: AtomicUsize::new(0),
    };
    heap.resize(workers)?;
    debug!(
      "non-moving heap up: generation {:?}, {} classes, {}-byte segments, {} workers",
      heap.config.generation, heap.config.class_count, heap.geometry.segment_size, heap.workers
    );
    Ok(heap)
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn generation(&self) -> GenerationId {
    self.config.generation
  }

  pub fn workers(&self) -> usize {
    self.workers
  }

  /// Largest request, in words, the size classes can serve.
  pub fn max_words(&self) -> usize {
    self.geometry.max_words()
  }

  pub fn size_class(&self, words: usize) -> Result<usize, AllocError> {
    self.geometry.size_class(words)
  }

  #[inline]
  fn node_of(&self, worker: usize) -> u32 {
    (worker % self.config.numa_nodes as usize) as u32
  }

  /// Take a segment from the free pool, or carve one out of fresh supplier
  /// memory. The returned segment is uninitialized.
  fn alloc_segment(&self, node: u32) -> Result<*mut SegmentHeader, SupplyError> {
    if let Some(seg) = self.free.lock().pop() {
      return Ok(seg);
    }

    let segment_size = self.geometry.segment_size;
    let granule = self.supplier.granule();
    // Worst case the range starts one granule past an aligned boundary.
    let count = (2 * segment_size).saturating_sub(granule).div_ceil(granule).max(1);
    let raw = self.supplier.request_blocks(node, count)?;
    self.os_requests.fetch_add(1, Ordering::Relaxed);

    let start = raw.start.as_ptr() as usize;
    let end = start + raw.len;
    let first = align_up(start, segment_size);
    if first + segment_size > end {
      unsafe { self.supplier.release_blocks(raw) };
      return Err(SupplyError::ShortRange {
        start,
        len: raw.len,
        segment_size,
      });
    }

    {
      let mut chunks = self.chunks.lock();
      let idx = chunks.partition_point(|c| (c.start.as_ptr() as usize) < start);
      chunks.insert(idx, raw);
    }

    // Whole aligned segments left over in the range go to the pool.
    let mut carved = 1;
    {
      let mut free = self.free.lock();
      let mut next = first + segment_size;
      while next + segment_size <= end {
        unsafe { free.push(raw.start.as_ptr().add(next - start).cast()) };
        next += segment_size;
        carved += 1;
      }
    }
    self.segments_carved.fetch_add(carved, Ordering::Relaxed);
    debug!("node {node}: {} bytes from supplier at {:#x}, {carved} segments", raw.len, start);

    let seg: *mut SegmentHeader = unsafe { raw.start.as_ptr().add(first - start).cast() };
    debug_assert!(seg as usize % segment_size == 0);
    Ok(seg)
  }

  /// Like `alloc_segment`, but initialized for `class`. Memory exhaustion on
  /// the allocation path is fatal.
  fn acquire_segment(&self, node: u32, class: usize) -> *mut SegmentHeader {
    match self.alloc_segment(node) {
      Ok(seg) => {
        unsafe { init_segment(seg, class, &self.geometry) };
        seg
      }
      Err(err) => {
        error!("non-moving heap exhausted while refilling class {class}: {err}");
        let size = self.geometry.segment_size;
        match Layout::from_size_align(size, size) {
          Ok(layout) => std::alloc::handle_alloc_error(layout),
          Err(_) => std::process::abort(),
        }
      }
    }
  }

  /// Allocate a block for an object of `words` words on behalf of `worker`.
  ///
  /// The returned block is not zeroed; the caller initializes it.
  ///
  /// # Safety
  ///
  /// `worker` must be below [`Heap::workers`], and no other thread may allocate
  /// for the same worker concurrently: the bump path on a worker's current
  /// segment is unsynchronized. [`Heap::mutator`] enforces both.
  pub unsafe fn allocate(&self, worker: usize, words: usize) -> Result<NonNull<u8>, AllocError> {
    let class = self.geometry.size_class(words)?;
    debug_assert!(worker < self.workers, "worker {worker} out of range");
    let alloca = &self.allocators[class];
    let slot = &alloca.current[worker];

    loop {
      // Fast path: bump through the current segment.
      let current = slot.load(Ordering::Acquire);
      if current.is_null() {
        // Another thread holds the sentinel while it installs a new segment;
        // its critical section is one pool pop or one supplier request.
        while slot.load(Ordering::Acquire).is_null() {
          hint::spin_loop();
        }
        continue;
      }
      if let Some(block) = unsafe { allocate_block_from_segment(current) } {
        return Ok(block);
      }

      // Current segment is full; look elsewhere.
      if !alloca.active.is_empty() {
        alloca.take_active(worker, current);
      } else {
        // No active segments: lock the slot and fetch a fresh one.
        if slot
          .compare_exchange(current, null_mut(), Ordering::AcqRel, Ordering::Acquire)
          .is_ok()
        {
          let seg = self.acquire_segment(self.node_of(worker), class);
          unsafe { alloca.filled.push(current) };
          slot.store(seg, Ordering::Release);
          trace!("class {class}: worker {worker} retired {current:p}, fresh segment {seg:p}");
        }
      }
    }
  }

  /// Claim `worker` for the calling thread.
  pub fn mutator(&self, worker: usize) -> HeapResult<Mutator<'_, S>> {
    if worker >= self.workers {
      return Err(HeapError::WorkerOutOfRange {
        worker,
        workers: self.workers,
      });
    }
    self.claimed[worker]
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .map_err(|_| HeapError::WorkerBusy(worker))?;
    Ok(Mutator {
      heap: self,
      worker,
      _not_sync: PhantomData,
    })
  }

  /// Grow the per-worker slot arrays to `new_workers`, giving every new worker
  /// a fresh segment in each class. Existing slots and lists carry over.
  /// Shrinking is not supported and is ignored.
  ///
  /// Taking `&mut self` keeps mutators and collector handles out while the
  /// allocators are swapped.
  pub fn resize(&mut self, new_workers: usize) -> HeapResult<()> {
    let old_workers = self.workers;
    if new_workers <= old_workers {
      if new_workers < old_workers {
        warn!("ignoring request to shrink non-moving heap from {old_workers} to {new_workers} workers");
      }
      return Ok(());
    }

    let added = new_workers - old_workers;
    let mut fresh = Vec::with_capacity(self.allocators.len() * added);
    for _ in 0..self.allocators.len() {
      for worker in old_workers..new_workers {
        match self.alloc_segment(self.node_of(worker)) {
          Ok(seg) => fresh.push(seg),
          Err(err) => {
            let mut free = self.free.lock();
            for seg in fresh {
              unsafe { free.push(seg) };
            }
            return Err(err.into());
          }
        }
      }
    }

    let geometry = self.geometry;
    let old = mem::take(&mut self.allocators);
    self.allocators = old
      .into_vec()
      .into_iter()
      .map(|alloca| {
        let Allocator {
          class,
          current,
          active,
          filled,
        } = alloca;
        let mut slots = Vec::with_capacity(new_workers);
        slots.extend(current.into_vec());
        for j in 0..added {
          let seg = fresh[class * added + j];
          unsafe { init_segment(seg, class, &geometry) };
          slots.push(AtomicPtr::new(seg));
        }
        Allocator {
          class,
          current: slots.into_boxed_slice(),
          active,
          filled,
        }
      })
      .collect();

    let mut claimed = mem::take(&mut self.claimed).into_vec();
    claimed.resize_with(new_workers, || AtomicBool::new(false));
    self.claimed = claimed.into_boxed_slice();
    self.workers = new_workers;
    debug!("non-moving heap grew from {old_workers} to {new_workers} workers");
    Ok(())
  }

  pub fn stats(&self) -> HeapStats {
    HeapStats {
      workers: self.workers,
      free_segments: self.free.lock().len,
      os_requests: self.os_requests.load(Ordering::Relaxed),
      segments_carved: self.segments_carved.load(Ordering::Relaxed),
    }
  }

  // ===========================================================================
  // Collector hooks
  // ===========================================================================

  /// Owning segment of `ptr`, if `ptr` lies inside memory this heap carved.
  pub fn segment_of(&self, ptr: *const u8) -> Option<Segment<'_>> {
    let addr = ptr as usize;
    let base = addr & !(self.geometry.segment_size - 1);
    let chunks = self.chunks.lock();
    let idx = chunks.partition_point(|c| c.start.as_ptr() as usize <= addr);
    let chunk = chunks.get(idx.checked_sub(1)?)?;
    let start = chunk.start.as_ptr() as usize;
    if base < start || base + self.geometry.segment_size > start + chunk.len {
      return None;
    }
    Segment::from_raw(unsafe { chunk.start.as_ptr().add(base - start).cast() })
  }

  /// Current segment of `worker` in `class`, or `None` while the slot holds
  /// the refill sentinel.
  pub fn current_segment(&self, class: usize, worker: usize) -> Option<Segment<'_>> {
    let slot = self.allocators.get(class)?.current.get(worker)?;
    Segment::from_raw(slot.load(Ordering::Acquire))
  }

  fn walk_segments(&mut self, mut f: impl FnMut(SegmentLocation, *mut SegmentHeader)) {
    for alloca in self.allocators.iter_mut() {
      let class = alloca.class;
      for (worker, slot) in alloca.current.iter_mut().enumerate() {
        let seg = *slot.get_mut();
        if !seg.is_null() {
          f(SegmentLocation::Current { class, worker }, seg);
        }
      }
      alloca.active.for_each(|seg| f(SegmentLocation::Active { class }, seg));
      alloca.filled.for_each(|seg| f(SegmentLocation::Filled { class }, seg));
    }
    let free = self.free.get_mut();
    let mut seg = free.head;
    while !seg.is_null() {
      f(SegmentLocation::Free, seg);
      seg = unsafe { (*seg).link.load(Ordering::Relaxed) };
    }
  }

  /// Every segment the heap knows about, with its location.
  pub fn census(&mut self) -> Vec<(SegmentLocation, Segment<'_>)> {
    let mut out = Vec::new();
    self.walk_segments(|loc, seg| out.extend(Segment::from_raw(seg).map(|s| (loc, s))));
    out
  }

  /// Start of a collection cycle: record `next_free` as the snapshot index of
  /// every segment in use. Returns how many segments were snapshotted.
  pub fn prepare_collection(&mut self) -> usize {
    let mut n = 0;
    self.walk_segments(|loc, seg| {
      if loc != SegmentLocation::Free {
        let header = unsafe { &*seg };
        let next_free = header.next_free.load(Ordering::Relaxed);
        header.next_free_snap.store(next_free, Ordering::Relaxed);
        n += 1;
      }
    });
    debug!("snapshot taken over {n} segments");
    n
  }

  /// Detach every segment on `class`'s filled list. Empty for an unknown class.
  pub fn take_filled(&self, class: usize) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let Some(alloca) = self.allocators.get(class) else {
      return out;
    };
    let mut seg = alloca.filled.take_all();
    while let Some(s) = Segment::from_raw(seg) {
      seg = s.header().link.swap(null_mut(), Ordering::Relaxed);
      out.push(s);
    }
    out
  }

  /// Return a swept segment with free blocks to its class's active list.
  ///
  /// # Safety
  ///
  /// `segment` must belong to this heap and be detached from every list and
  /// worker slot.
  pub unsafe fn push_active(&self, segment: Segment<'_>) {
    debug_assert!(self.segment_of(segment.base().as_ptr()) == Some(segment));
    let header = segment.header();
    header.next_free.store(0, Ordering::Relaxed);
    let class = header.class.load(Ordering::Relaxed) as usize;
    unsafe { self.allocators[class].active.push(segment.raw()) };
  }

  /// Return a fully free segment to the global pool, where any class may pick
  /// it up. Its allocation state and bitmap are cleared on the way in.
  ///
  /// # Safety
  ///
  /// Same as [`Heap::push_active`].
  pub unsafe fn release_segment(&self, segment: Segment<'_>) {
    debug_assert!(self.segment_of(segment.base().as_ptr()) == Some(segment));
    let header = segment.header();
    header.next_free.store(0, Ordering::Relaxed);
    header.next_free_snap.store(0, Ordering::Relaxed);
    segment.clear_bitmap();
    #[cfg(feature = "release-mem")]
    if self.geometry.segment_size >= os_page_size() {
      unsafe { os_release_pages(segment.base().as_ptr(), self.geometry.segment_size) };
    }
    unsafe { self.free.lock().push(segment.raw()) };
  }
}

impl<S: BlockSupplier> Drop for Heap<S> {
  fn drop(&mut self) {
    let chunks = mem::take(self.chunks.get_mut());
    debug!("tearing down non-moving heap: {} raw ranges", chunks.len());
    for raw in chunks {
      unsafe { self.supplier.release_blocks(raw) };
    }
  }
}

impl<S: BlockSupplier> fmt::Debug for Heap<S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Heap")
      .field("config", &self.config)
      .field("workers", &self.workers)
      .finish_non_exhaustive()
  }
}

// =============================================================================
// Mutator
// =============================================================================

/// Exclusive allocation handle for one worker. Can move between threads but
/// not be shared, which keeps the worker's bump path single-threaded.
pub struct Mutator<'h, S: BlockSupplier = MmapSupplier> {
  heap: &'h Heap<S>,
  worker: usize,
  _not_sync: PhantomData<Cell<()>>,
}

impl<S: BlockSupplier> Mutator<'_, S> {
  pub fn worker(&self) -> usize {
    self.worker
  }

  #[inline]
  pub fn allocate(&self, words: usize) -> Result<NonNull<u8>, AllocError> {
    unsafe { self.heap.allocate(self.worker, words) }
  }
}

impl<S: BlockSupplier> Drop for Mutator<'_, S> {
  fn drop(&mut self) {
    self.heap.claimed[self.worker].store(false, Ordering::Release);
  }
}

impl<S: BlockSupplier> fmt::Debug for Mutator<'_, S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Mutator").field("worker", &self.worker).finish()
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
fn log2_ceil(x: usize) -> u32 {
  if x <= 1 {
    0
  } else {
    usize::BITS - (x - 1).leading_zeros()
  }
}
