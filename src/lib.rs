#![allow(clippy::missing_safety_doc)]
//! Size-classed pool allocator backed by anonymous `mmap` regions.
//!
//! Every request is routed to a size class. Each class owns one or more pools,
//! and each pool is a single OS mapping carved into blocks:
//!
//! ```text
//!   ┌────────┬──────────────────────┬────────┐┌────────┬─────────┬────────┐
//!   │ header │       payload        │ footer ││ header │ payload │ footer │ ...
//!   └────────┴──────────────────────┴────────┘└────────┴─────────┴────────┘
//!            ▲
//!            └── pointer handed to the caller (8-byte aligned)
//! ```
//!
//! Free blocks are kept on a doubly linked free list per pool. The footer is a
//! boundary tag, so a released block finds and merges both physical neighbors
//! without walking the pool.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  hint,
  mem::size_of,
  ops::{AddAssign, Deref, DerefMut},
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Alignment of every block and of every pointer handed out.
pub const ALIGNMENT: usize = 8;

/// Upper bounds (inclusive) of the bounded size classes.
pub const SMALL_CLASS_MAX: usize = 64;
pub const MEDIUM_CLASS_MAX: usize = 256;
pub const LARGE_CLASS_MAX: usize = 1024;

/// Initial pool capacity per class.
pub const SMALL_POOL_SIZE: usize = 64 * 1024; // 64KB
pub const MEDIUM_POOL_SIZE: usize = 256 * 1024; // 256KB
pub const LARGE_POOL_SIZE: usize = 1024 * 1024; // 1MB
pub const OVERFLOW_POOL_SIZE: usize = 1024 * 1024; // 1MB

/// Small, medium, large, overflow.
pub const CLASS_COUNT: usize = 4;

/// Pools a growable class may map before it starts failing.
pub const MAX_POOLS_PER_CLASS: usize = 16;

/// Growth regions are rounded up to this.
const PAGE_SIZE: usize = 4096;

const HEADER_SIZE: usize = size_of::<BlockHeader>();
const FOOTER_SIZE: usize = size_of::<BlockFooter>();

/// Bookkeeping bytes per block: header in front of the payload, boundary tag behind it.
pub const BLOCK_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

/// Smallest block that still carries a payload. Remainders below this are never split off.
pub const MIN_BLOCK_SIZE: usize = BLOCK_OVERHEAD + ALIGNMENT;

const HEADER_MAGIC: u32 = 0x504F_4F4C; // "POOL"
const FREE_BIT: usize = 1;

/// Free-list terminator.
const NIL: usize = usize::MAX;

const DEFAULT_STRATEGY: FitStrategy = if cfg!(feature = "best-fit") {
  FitStrategy::BestFit
} else {
  FitStrategy::FirstFit
};

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(FOOTER_SIZE % ALIGNMENT == 0);
const _: () = assert!(PAGE_SIZE % ALIGNMENT == 0);
const _: () = assert!(CLASS_COUNT <= u8::MAX as usize);
const _: () = assert!(MAX_POOLS_PER_CLASS <= u8::MAX as usize);
const _: () = assert!(SMALL_CLASS_MAX < MEDIUM_CLASS_MAX && MEDIUM_CLASS_MAX < LARGE_CLASS_MAX);
const _: () = assert!(SMALL_POOL_SIZE % ALIGNMENT == 0 && SMALL_POOL_SIZE >= MIN_BLOCK_SIZE);
const _: () = assert!(MEDIUM_POOL_SIZE % ALIGNMENT == 0 && MEDIUM_POOL_SIZE >= MIN_BLOCK_SIZE);
const _: () = assert!(LARGE_POOL_SIZE % ALIGNMENT == 0 && LARGE_POOL_SIZE >= MIN_BLOCK_SIZE);
const _: () = assert!(OVERFLOW_POOL_SIZE % ALIGNMENT == 0 && OVERFLOW_POOL_SIZE >= MIN_BLOCK_SIZE);

// =============================================================================
// Types
// =============================================================================

/// In-place metadata in front of every block.
///
/// Free-list links are byte offsets from the pool start, so following one
/// never leaves the pool.
#[repr(C, align(8))]
struct BlockHeader {
  /// Total span: header, payload and footer.
  size: usize,
  /// Only meaningful while `is_free`.
  prev_free: usize,
  next_free: usize,
  /// Cleared when the header is absorbed by a merge.
  magic: u32,
  /// Owning class and pool slot.
  class: u8,
  pool: u8,
  is_free: bool,
  _pad: u8,
}

impl BlockHeader {
  const fn new(size: usize, class: u8, pool: u8) -> Self {
    Self {
      size,
      prev_free: NIL,
      next_free: NIL,
      magic: HEADER_MAGIC,
      class,
      pool,
      is_free: false,
      _pad: 0,
    }
  }
}

/// Boundary tag closing every block: `size | FREE_BIT`.
#[repr(C, align(8))]
struct BlockFooter {
  tag: usize,
}

/// Free block search policy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FitStrategy {
  /// First free block, in free-list order, that is large enough.
  FirstFit,
  /// Smallest free block that is large enough; ties go to the earlier one in free-list order.
  BestFit,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  #[error("zero-size request")]
  ZeroSize,

  #[error("out of memory: no block for {requested} bytes")]
  OutOfMemory { requested: usize },

  #[error("size overflow: {count} elements of {size} bytes")]
  Overflow { count: usize, size: usize },

  #[error("pointer 0x{0:x} is not owned by any pool")]
  InvalidPointer(usize),

  #[error("pointer 0x{0:x} is already free")]
  DoubleFree(usize),

  #[error("mmap of {size} bytes failed")]
  MapFailure { size: usize },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
  #[error("class {index}: limit {limit} does not exceed the previous class limit")]
  UnorderedLimits { index: usize, limit: usize },

  #[error("last class must be unbounded, found limit {0}")]
  BoundedLastClass(usize),

  #[error("class {index}: capacity {capacity} is not a multiple of the alignment")]
  MisalignedCapacity { index: usize, capacity: usize },

  #[error("class {index}: capacity {capacity} cannot hold a single block")]
  CapacityTooSmall { index: usize, capacity: usize },
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ClassConfig {
  /// Largest request routed here. `usize::MAX` marks the overflow class.
  pub limit: usize,
  /// Bytes mapped for the first pool of the class.
  pub capacity: usize,
  /// Map more pools once the existing ones cannot satisfy a request.
  pub growable: bool,
  /// Overrides the allocator-wide strategy.
  pub strategy: Option<FitStrategy>,
}

impl ClassConfig {
  pub const fn bounded(limit: usize, capacity: usize) -> Self {
    Self {
      limit,
      capacity,
      growable: false,
      strategy: None,
    }
  }

  pub const fn unbounded(capacity: usize) -> Self {
    Self {
      limit: usize::MAX,
      capacity,
      growable: true,
      strategy: None,
    }
  }

  pub const fn with_growth(mut self, growable: bool) -> Self {
    self.growable = growable;
    self
  }

  pub const fn with_strategy(mut self, strategy: FitStrategy) -> Self {
    self.strategy = Some(strategy);
    self
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AllocatorConfig {
  pub classes: [ClassConfig; CLASS_COUNT],
  pub strategy: FitStrategy,
}

impl AllocatorConfig {
  pub const DEFAULT: Self = Self {
    classes: [
      ClassConfig::bounded(SMALL_CLASS_MAX, SMALL_POOL_SIZE),
      ClassConfig::bounded(MEDIUM_CLASS_MAX, MEDIUM_POOL_SIZE),
      ClassConfig::bounded(LARGE_CLASS_MAX, LARGE_POOL_SIZE),
      ClassConfig::unbounded(OVERFLOW_POOL_SIZE),
    ],
    strategy: DEFAULT_STRATEGY,
  };

  pub const fn with_strategy(mut self, strategy: FitStrategy) -> Self {
    self.strategy = strategy;
    self
  }

  /// Replaces the class at `index`.
  ///
  /// # Panics
  ///
  /// Panics if `index >= CLASS_COUNT`.
  pub const fn with_class(mut self, index: usize, class: ClassConfig) -> Self {
    self.classes[index] = class;
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    for (index, class) in self.classes.iter().enumerate() {
      if index > 0 && class.limit <= self.classes[index - 1].limit {
        return Err(ConfigError::UnorderedLimits {
          index,
          limit: class.limit,
        });
      }
      if class.capacity % ALIGNMENT != 0 {
        return Err(ConfigError::MisalignedCapacity {
          index,
          capacity: class.capacity,
        });
      }
      if class.capacity < MIN_BLOCK_SIZE {
        return Err(ConfigError::CapacityTooSmall {
          index,
          capacity: class.capacity,
        });
      }
    }

    match self.classes[CLASS_COUNT - 1].limit {
      usize::MAX => Ok(()),
      limit => Err(ConfigError::BoundedLastClass(limit)),
    }
  }

  /// Class serving a request of `size` bytes. Total: the last class is unbounded.
  #[inline]
  pub fn select_class(&self, size: usize) -> usize {
    self
      .classes
      .iter()
      .position(|class| size <= class.limit)
      .unwrap_or(CLASS_COUNT - 1)
  }

  #[inline]
  fn strategy_for(&self, class: usize) -> FitStrategy {
    self.classes[class].strategy.unwrap_or(self.strategy)
  }
}

impl Default for AllocatorConfig {
  fn default() -> Self {
    Self::DEFAULT
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
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
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

/// One anonymous read/write mapping. Unmapped on drop.
struct Mapping {
  base: NonNull<u8>,
  len: usize,
}

// The mapping is plain memory owned by whoever holds the `Mapping`.
unsafe impl Send for Mapping {}

impl Mapping {
  fn new(len: usize) -> Result<Self, AllocError> {
    let raw = unsafe { os_mmap(len) };
    NonNull::new(raw)
      .map(|base| Self { base, len })
      .ok_or(AllocError::MapFailure { size: len })
  }
}

impl Drop for Mapping {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base.as_ptr(), self.len) };
  }
}

// =============================================================================
// Spin Lock
// =============================================================================

/// Registry lock. Critical sections are short and never block, so spinning is enough.
struct SpinLock<T> {
  locked: AtomicBool,
  value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
  const fn new(value: T) -> Self {
    Self {
      locked: AtomicBool::new(false),
      value: UnsafeCell::new(value),
    }
  }

  #[inline]
  fn lock(&self) -> SpinGuard<'_, T> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinGuard { lock: self }
  }
}

struct SpinGuard<'a, T> {
  lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.lock.value.get() }
  }
}

impl<T> DerefMut for SpinGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.lock.value.get() }
  }
}

impl<T> Drop for SpinGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}

// =============================================================================
// Pool
// =============================================================================

/// One OS-backed region carved into blocks.
///
/// Invariant: `allocated_bytes + free_bytes == size()`, and every header on the
/// physical chain is either on the free list exactly once or allocated.
struct Pool {
  region: Option<Mapping>,
  free_head: usize,
  allocated_bytes: usize,
  free_bytes: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct BlockInfo {
  offset: usize,
  size: usize,
  is_free: bool,
}

impl Pool {
  const EMPTY: Self = Self {
    region: None,
    free_head: NIL,
    allocated_bytes: 0,
    free_bytes: 0,
  };

  /// Takes over `region` and covers it with one free block.
  fn adopt(&mut self, region: Mapping, class: u8, pool: u8) {
    let size = region.len;
    self.region = Some(region);
    self.free_head = NIL;
    self.allocated_bytes = 0;
    self.free_bytes = size;

    unsafe { self.hdr(0).write(BlockHeader::new(size, class, pool)) };
    self.push_free(0);
  }

  /// Gives up the region. Dropping the result unmaps it.
  fn detach(&mut self) -> Option<Mapping> {
    self.free_head = NIL;
    self.allocated_bytes = 0;
    self.free_bytes = 0;
    self.region.take()
  }

  #[inline]
  fn base(&self) -> *mut u8 {
    self
      .region
      .as_ref()
      .map_or(null_mut(), |region| region.base.as_ptr())
  }

  #[inline]
  fn size(&self) -> usize {
    self.region.as_ref().map_or(0, |region| region.len)
  }

  #[inline]
  fn contains(&self, addr: usize) -> bool {
    let base = self.base() as usize;
    self.region.is_some() && addr >= base && addr - base < self.size()
  }

  /// Header at a trusted offset (free-list link or split point).
  #[inline]
  fn hdr(&self, offset: usize) -> *mut BlockHeader {
    debug_assert!(offset + HEADER_SIZE <= self.size());
    unsafe { self.base().add(offset).cast() }
  }

  /// Header at an untrusted offset, if one fits there.
  fn header(&self, offset: usize) -> Option<*mut BlockHeader> {
    if offset % ALIGNMENT != 0 || offset.checked_add(HEADER_SIZE)? > self.size() {
      return None;
    }
    Some(self.hdr(offset))
  }

  #[inline]
  fn user_ptr(&self, offset: usize) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(self.base().add(offset + HEADER_SIZE)) }
  }

  #[inline]
  fn write_footer(&self, offset: usize, size: usize, is_free: bool) {
    let footer = unsafe { self.base().add(offset + size - FOOTER_SIZE) }.cast::<BlockFooter>();
    unsafe {
      footer.write(BlockFooter {
        tag: size | is_free as usize,
      })
    };
  }

  /// Decodes the boundary tag of the block that ends at `end`.
  fn footer_before(&self, end: usize) -> Option<(usize, bool)> {
    if end < FOOTER_SIZE || end > self.size() || end % ALIGNMENT != 0 {
      return None;
    }
    let tag = unsafe { (*self.base().add(end - FOOTER_SIZE).cast::<BlockFooter>()).tag };
    Some((tag & !FREE_BIT, tag & FREE_BIT != 0))
  }

  // --- Free list --------------------------------------------------------------

  /// Inserts the block at the free-list head and marks it free. O(1).
  fn push_free(&mut self, offset: usize) {
    let header = self.hdr(offset);
    let old_head = self.free_head;
    let size = unsafe {
      (*header).is_free = true;
      (*header).prev_free = NIL;
      (*header).next_free = old_head;
      (*header).size
    };

    if old_head != NIL {
      unsafe { (*self.hdr(old_head)).prev_free = offset };
    }
    self.free_head = offset;
    self.write_footer(offset, size, true);
  }

  /// Unlinks the block from wherever it sits in the free list. O(1).
  fn unlink_free(&mut self, offset: usize) {
    let header = self.hdr(offset);
    let (prev, next) = unsafe { ((*header).prev_free, (*header).next_free) };

    if prev == NIL {
      self.free_head = next;
    } else {
      unsafe { (*self.hdr(prev)).next_free = next };
    }
    if next != NIL {
      unsafe { (*self.hdr(next)).prev_free = prev };
    }

    unsafe {
      (*header).prev_free = NIL;
      (*header).next_free = NIL;
    }
  }

  /// `(offset, size)` of each free block, head first.
  fn free_list(&self) -> FreeList<'_> {
    FreeList {
      pool: self,
      cursor: self.free_head,
    }
  }

  // --- Fit strategy -----------------------------------------------------------

  fn first_fit(&self, need: usize) -> Option<usize> {
    self
      .free_list()
      .find(|&(_, size)| size >= need)
      .map(|(offset, _)| offset)
  }

  fn best_fit(&self, need: usize) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (offset, size) in self.free_list() {
      if size >= need && best.is_none_or(|(_, best_size)| size < best_size) {
        best = Some((offset, size));
        if size == need {
          break;
        }
      }
    }
    best.map(|(offset, _)| offset)
  }

  #[inline]
  fn find_fit(&self, strategy: FitStrategy, need: usize) -> Option<usize> {
    match strategy {
      FitStrategy::FirstFit => self.first_fit(need),
      FitStrategy::BestFit => self.best_fit(need),
    }
  }

  // --- Split / coalesce -------------------------------------------------------

  /// Allocates the free block at `offset`, splitting off the tail when it can stand as a block.
  fn take(&mut self, offset: usize, need: usize) -> NonNull<u8> {
    self.unlink_free(offset);

    let header = self.hdr(offset);
    if unsafe { (*header).size } >= need + MIN_BLOCK_SIZE {
      self.split(offset, need);
    }

    let size = unsafe {
      (*header).is_free = false;
      (*header).size
    };
    self.write_footer(offset, size, false);
    self.allocated_bytes += size;
    self.free_bytes -= size;
    self.user_ptr(offset)
  }

  /// Shrinks the block at `offset` to `need` bytes and frees the tail as a new block.
  fn split(&mut self, offset: usize, need: usize) {
    let header = self.hdr(offset);
    let (size, class, pool) = unsafe { ((*header).size, (*header).class, (*header).pool) };
    unsafe { (*header).size = need };

    let rest = offset + need;
    unsafe { self.hdr(rest).write(BlockHeader::new(size - need, class, pool)) };
    self.push_free(rest);
  }

  /// Frees the block at `offset`. Returns `false`, touching nothing, if it is already free.
  fn give_back(&mut self, offset: usize) -> bool {
    let header = self.hdr(offset);
    let (size, is_free) = unsafe { ((*header).size, (*header).is_free) };
    if is_free {
      return false;
    }

    self.allocated_bytes -= size;
    self.free_bytes += size;
    let merged = self.coalesce(offset);
    self.push_free(merged);
    true
  }

  /// Merges the block at `offset` with free physical neighbors. The result is not on the free list.
  fn coalesce(&mut self, offset: usize) -> usize {
    let mut start = offset;
    let mut size = unsafe { (*self.hdr(offset)).size };

    let next = offset + size;
    if let Some(next_header) = self.header(next)
      && unsafe { (*next_header).is_free && (*next_header).magic == HEADER_MAGIC }
    {
      self.unlink_free(next);
      size += unsafe { (*next_header).size };
      unsafe { (*next_header).magic = 0 };
    }

    if let Some((prev_size, true)) = self.footer_before(offset)
      && prev_size >= MIN_BLOCK_SIZE
      && prev_size <= offset
      && let Some(prev_header) = self.header(offset - prev_size)
      && unsafe {
        (*prev_header).is_free
          && (*prev_header).magic == HEADER_MAGIC
          && (*prev_header).size == prev_size
      }
    {
      start = offset - prev_size;
      self.unlink_free(start);
      size += prev_size;
      unsafe { (*self.hdr(offset)).magic = 0 };
    }

    unsafe { (*self.hdr(start)).size = size };
    start
  }

  // --- Diagnostics ------------------------------------------------------------

  /// Physical walk from the pool start.
  fn blocks(&self) -> Blocks<'_> {
    Blocks {
      pool: self,
      offset: 0,
      malformed: false,
    }
  }

  fn leaks(&self) -> LeakReport {
    let mut report = LeakReport::default();
    for block in self.blocks().filter(|block| !block.is_free) {
      report.blocks += 1;
      report.bytes += block.size;
    }
    report
  }

  fn validate(&self, class: u8, pool: u8) -> bool {
    if self.allocated_bytes + self.free_bytes != self.size() {
      return false;
    }

    let mut free_blocks = 0;
    let mut free_bytes = 0;
    let mut prev_free = false;
    let mut blocks = self.blocks();
    for block in &mut blocks {
      let header = self.hdr(block.offset);
      let (magic, owner) = unsafe { ((*header).magic, ((*header).class, (*header).pool)) };
      if magic != HEADER_MAGIC || owner != (class, pool) || block.size % ALIGNMENT != 0 {
        return false;
      }
      if self.footer_before(block.offset + block.size) != Some((block.size, block.is_free)) {
        return false;
      }
      if block.is_free {
        // Coalescing never leaves two free blocks side by side.
        if prev_free {
          return false;
        }
        free_blocks += 1;
        free_bytes += block.size;
      }
      prev_free = block.is_free;
    }
    if !blocks.is_intact() || free_bytes != self.free_bytes {
      return false;
    }

    // Each free-list entry must be a free block of the chain, with a consistent
    // back link. Together with the count this rules out duplicates and cycles.
    let mut cursor = self.free_head;
    let mut prev = NIL;
    let mut listed = 0;
    while cursor != NIL {
      if listed == free_blocks {
        return false;
      }
      if !self
        .blocks()
        .any(|block| block.offset == cursor && block.is_free)
      {
        return false;
      }
      let header = self.hdr(cursor);
      if unsafe { (*header).prev_free } != prev {
        return false;
      }
      prev = cursor;
      cursor = unsafe { (*header).next_free };
      listed += 1;
    }

    listed == free_blocks
  }
}

struct FreeList<'a> {
  pool: &'a Pool,
  cursor: usize,
}

impl Iterator for FreeList<'_> {
  type Item = (usize, usize);

  fn next(&mut self) -> Option<Self::Item> {
    if self.cursor == NIL {
      return None;
    }
    let header = self.pool.hdr(self.cursor);
    let item = (self.cursor, unsafe { (*header).size });
    self.cursor = unsafe { (*header).next_free };
    Some(item)
  }
}

/// Walk of the physical header chain. Stops early on a header that would reach
/// past the pool end instead of reading out of bounds.
struct Blocks<'a> {
  pool: &'a Pool,
  offset: usize,
  malformed: bool,
}

impl Blocks<'_> {
  /// Whether the walk ended exactly at the pool end.
  fn is_intact(&self) -> bool {
    !self.malformed && self.offset == self.pool.size()
  }
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    if self.malformed || self.offset >= self.pool.size() {
      return None;
    }

    let Some(header) = self.pool.header(self.offset) else {
      self.malformed = true;
      return None;
    };
    let (size, is_free) = unsafe { ((*header).size, (*header).is_free) };
    if size < MIN_BLOCK_SIZE || size > self.pool.size() - self.offset {
      self.malformed = true;
      return None;
    }

    let block = BlockInfo {
      offset: self.offset,
      size,
      is_free,
    };
    self.offset += size;
    Some(block)
  }
}

// =============================================================================
// Pool Registry
// =============================================================================

/// Pools of one size class. `pools[..len]` are mapped.
struct SizeClass {
  pools: [Pool; MAX_POOLS_PER_CLASS],
  len: usize,
}

impl SizeClass {
  const EMPTY: Self = Self {
    pools: [const { Pool::EMPTY }; MAX_POOLS_PER_CLASS],
    len: 0,
  };

  #[inline]
  fn mapped(&self) -> &[Pool] {
    &self.pools[..self.len]
  }

  /// Adds a pool over `region`. Hands the region back when every slot is taken.
  fn adopt(&mut self, region: Mapping, class: usize) -> Result<usize, Mapping> {
    if self.len == MAX_POOLS_PER_CLASS {
      return Err(region);
    }
    let index = self.len;
    self.pools[index].adopt(region, class as u8, index as u8);
    self.len += 1;
    Ok(index)
  }

  fn allocate(&mut self, strategy: FitStrategy, need: usize) -> Option<NonNull<u8>> {
    self.pools[..self.len].iter_mut().find_map(|pool| {
      pool
        .find_fit(strategy, need)
        .map(|offset| pool.take(offset, need))
    })
  }

  fn stats(&self, limit: usize) -> ClassStats {
    let mut stats = ClassStats {
      limit,
      pools: self.len,
      ..ClassStats::default()
    };
    for pool in self.mapped() {
      stats.capacity += pool.size();
      stats.allocated_bytes += pool.allocated_bytes;
      stats.free_bytes += pool.free_bytes;
      for (_, size) in pool.free_list() {
        stats.free_blocks += 1;
        stats.largest_free_block = stats.largest_free_block.max(size);
      }
    }
    stats
  }
}

/// A live block located from a user pointer.
#[derive(Clone, Copy, Debug)]
struct BlockRef {
  class: usize,
  pool: usize,
  offset: usize,
}

type Regions = [Result<Mapping, AllocError>; CLASS_COUNT];
type InitOutcome = [Result<usize, AllocError>; CLASS_COUNT];
type Detached = [[Option<Mapping>; MAX_POOLS_PER_CLASS]; CLASS_COUNT];

struct Registry {
  classes: [SizeClass; CLASS_COUNT],
  initialized: bool,
}

impl Registry {
  const fn new() -> Self {
    Self {
      classes: [const { SizeClass::EMPTY }; CLASS_COUNT],
      initialized: false,
    }
  }

  /// Adopts one pre-mapped region per class as its first pool. Hands the
  /// regions back untouched if already initialized.
  ///
  /// A class whose mapping failed stays empty; requests against it fail (or
  /// trigger growth, for growable classes).
  fn init(&mut self, regions: Regions) -> Result<InitOutcome, Regions> {
    if self.initialized {
      return Err(regions);
    }
    self.initialized = true;

    let mut outcome: InitOutcome = [Ok(0); CLASS_COUNT];
    for (class, (region, slot)) in regions.into_iter().zip(&mut outcome).enumerate() {
      *slot = region.and_then(|region| {
        let len = region.len;
        self.classes[class]
          .adopt(region, class)
          .map(|_| len)
          .map_err(|_| AllocError::MapFailure { size: len })
      });
    }
    Ok(outcome)
  }

  /// Finds the pool owning `addr` by address containment, then checks the
  /// header's owner tag. Memory outside every pool is never read.
  fn resolve_owner(&self, addr: usize) -> Option<BlockRef> {
    for (class_index, class) in self.classes.iter().enumerate() {
      for (pool_index, pool) in class.mapped().iter().enumerate() {
        if !pool.contains(addr) {
          continue;
        }

        let offset = (addr - pool.base() as usize).checked_sub(HEADER_SIZE)?;
        let header = pool.header(offset)?;
        let (magic, owner, size) =
          unsafe { ((*header).magic, ((*header).class, (*header).pool), (*header).size) };
        let tagged = owner == (class_index as u8, pool_index as u8);
        if magic != HEADER_MAGIC || !tagged || size < MIN_BLOCK_SIZE || size > pool.size() - offset
        {
          return None;
        }

        return Some(BlockRef {
          class: class_index,
          pool: pool_index,
          offset,
        });
      }
    }
    None
  }

  #[inline]
  fn pool(&self, block: BlockRef) -> &Pool {
    &self.classes[block.class].pools[block.pool]
  }

  #[inline]
  fn pool_mut(&mut self, block: BlockRef) -> &mut Pool {
    &mut self.classes[block.class].pools[block.pool]
  }

  fn release(&mut self, addr: usize) -> Result<(), AllocError> {
    let block = self
      .resolve_owner(addr)
      .ok_or(AllocError::InvalidPointer(addr))?;
    if self.pool_mut(block).give_back(block.offset) {
      Ok(())
    } else {
      Err(AllocError::DoubleFree(addr))
    }
  }

  /// Payload bytes of the live block at `addr`.
  fn payload_size(&self, addr: usize) -> Result<usize, AllocError> {
    let block = self
      .resolve_owner(addr)
      .ok_or(AllocError::InvalidPointer(addr))?;
    let header = self.pool(block).hdr(block.offset);
    let (size, is_free) = unsafe { ((*header).size, (*header).is_free) };
    if is_free {
      return Err(AllocError::InvalidPointer(addr));
    }
    Ok(size - BLOCK_OVERHEAD)
  }

  fn validate(&self) -> bool {
    self.classes.iter().enumerate().all(|(class_index, class)| {
      class
        .mapped()
        .iter()
        .enumerate()
        .all(|(pool_index, pool)| pool.validate(class_index as u8, pool_index as u8))
    })
  }

  /// Tallies leaks and detaches every region. `None` if not initialized.
  fn teardown(&mut self) -> Option<(LeakReport, Detached)> {
    if !self.initialized {
      return None;
    }
    self.initialized = false;

    let mut report = LeakReport::default();
    let mut detached: Detached = [const { [const { None }; MAX_POOLS_PER_CLASS] }; CLASS_COUNT];
    for (class, slots) in self.classes.iter_mut().zip(detached.iter_mut()) {
      let len = class.len;
      for (pool, slot) in class.pools[..len].iter_mut().zip(slots.iter_mut()) {
        report += pool.leaks();
        *slot = pool.detach();
      }
      class.len = 0;
    }
    Some((report, detached))
  }
}

// =============================================================================
// Diagnostics
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassStats {
  pub limit: usize,
  pub pools: usize,
  pub capacity: usize,
  pub allocated_bytes: usize,
  pub free_bytes: usize,
  pub free_blocks: usize,
  pub largest_free_block: usize,
}

/// Totals across every pool. Byte counts include block headers and footers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
  pub pools: usize,
  pub capacity: usize,
  pub allocated_bytes: usize,
  pub free_bytes: usize,
  pub free_blocks: usize,
  pub largest_free_block: usize,
}

impl ClassStats {
  /// Fragmentation of this class alone. See [`AllocatorStats::fragmentation`].
  pub fn fragmentation(&self) -> f64 {
    fragmentation(self.largest_free_block, self.free_bytes)
  }
}

impl AllocatorStats {
  /// `1 - largest_free_block / free_bytes`: 0 when all free memory is one block,
  /// approaching 1 as it splinters.
  ///
  /// This is the cross-pool figure: one idle pool keeps it low however splintered
  /// the others are. Use [`ClassStats::fragmentation`] to look at a single class.
  pub fn fragmentation(&self) -> f64 {
    fragmentation(self.largest_free_block, self.free_bytes)
  }
}

fn fragmentation(largest_free_block: usize, free_bytes: usize) -> f64 {
  if free_bytes == 0 {
    return 0.0;
  }
  1.0 - largest_free_block as f64 / free_bytes as f64
}

/// Blocks still allocated at teardown. `bytes` counts whole block spans.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LeakReport {
  pub blocks: usize,
  pub bytes: usize,
}

impl AddAssign for LeakReport {
  fn add_assign(&mut self, other: Self) {
    self.blocks += other.blocks;
    self.bytes += other.bytes;
  }
}

// =============================================================================
// Allocator
// =============================================================================

/// Allocator context: configuration plus the lock-protected pool registry.
///
/// Pools are mapped lazily on first use (or by [`PoolAllocator::init`]) and
/// unmapped by [`PoolAllocator::teardown`] or on drop.
pub struct PoolAllocator {
  config: AllocatorConfig,
  registry: SpinLock<Registry>,
}

impl PoolAllocator {
  pub const fn new() -> Self {
    Self {
      config: AllocatorConfig::DEFAULT,
      registry: SpinLock::new(Registry::new()),
    }
  }

  pub fn with_config(config: AllocatorConfig) -> Result<Self, ConfigError> {
    config.validate()?;
    Ok(Self {
      config,
      registry: SpinLock::new(Registry::new()),
    })
  }

  pub fn config(&self) -> &AllocatorConfig {
    &self.config
  }

  /// Maps every class's first pool. Idempotent.
  ///
  /// The regions are mapped with the lock released. A caller that loses the race
  /// to initialize unmaps its regions again.
  pub fn init(&self) {
    if self.registry.lock().initialized {
      return;
    }
    let regions: Regions =
      core::array::from_fn(|class| Mapping::new(self.config.classes[class].capacity));

    let adopted = self.registry.lock().init(regions);
    match adopted {
      Ok(outcome) => log_init(&outcome),
      Err(unused) => drop(unused),
    }
  }

  /// Returns `size` bytes aligned to [`ALIGNMENT`], or null. `allocate(0)` is null.
  pub fn allocate(&self, size: usize) -> *mut u8 {
    match self.try_allocate(size) {
      Ok(ptr) => ptr.as_ptr(),
      Err(AllocError::ZeroSize) => null_mut(),
      Err(err) => {
        log::debug!("allocate({size}) failed: {err}");
        null_mut()
      }
    }
  }

  pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    if size == 0 {
      return Err(AllocError::ZeroSize);
    }
    let need = block_size_for(size).ok_or(AllocError::OutOfMemory { requested: size })?;
    let class = self.config.select_class(size);
    let strategy = self.config.strategy_for(class);

    let found = loop {
      let mut registry = self.registry.lock();
      if registry.initialized {
        break registry.classes[class].allocate(strategy, need);
      }
      drop(registry);
      self.init();
    };

    match found {
      Some(ptr) => Ok(ptr),
      None if self.config.classes[class].growable => self.grow(class, size, need),
      None => Err(AllocError::OutOfMemory { requested: size }),
    }
  }

  /// Maps a new pool for `class` that fits `need`, then serves the request from it.
  /// The mapping call happens with the lock released.
  #[inline(never)]
  fn grow(&self, class: usize, size: usize, need: usize) -> Result<NonNull<u8>, AllocError> {
    let len = need
      .checked_next_multiple_of(PAGE_SIZE)
      .ok_or(AllocError::OutOfMemory { requested: size })?
      .max(self.config.classes[class].capacity);

    let region = Mapping::new(len).inspect_err(|err| log::warn!("class {class}: {err}"))?;

    let (found, rejected) = {
      let mut registry = self.registry.lock();
      match registry.classes[class].adopt(region, class) {
        Ok(index) => (Some(registry.classes[class].pools[index].take(0, need)), None),
        Err(region) => (None, Some(region)),
      }
    };

    if rejected.is_some() {
      drop(rejected);
      log::warn!("class {class}: all {MAX_POOLS_PER_CLASS} pool slots in use");
      return Err(AllocError::OutOfMemory { requested: size });
    }
    log::debug!("class {class}: mapped pool of {len} bytes");
    found.ok_or(AllocError::OutOfMemory { requested: size })
  }

  /// `count * elem_size` zeroed bytes, or null on overflow or exhaustion.
  pub fn zero_allocate(&self, count: usize, elem_size: usize) -> *mut u8 {
    match self.try_zero_allocate(count, elem_size) {
      Ok(ptr) => ptr.as_ptr(),
      Err(AllocError::ZeroSize) => null_mut(),
      Err(err) => {
        log::debug!("zero_allocate({count}, {elem_size}) failed: {err}");
        null_mut()
      }
    }
  }

  pub fn try_zero_allocate(
    &self,
    count: usize,
    elem_size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let total = count.checked_mul(elem_size).ok_or(AllocError::Overflow {
      count,
      size: elem_size,
    })?;
    let ptr = self.try_allocate(total)?;
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
    Ok(ptr)
  }

  /// Frees `ptr`. Null is a no-op; foreign pointers and double frees are logged and ignored.
  ///
  /// # Safety
  ///
  /// `ptr` must not be used after this call if it came from this allocator.
  pub unsafe fn release(&self, ptr: *mut u8) {
    if let Err(err) = unsafe { self.try_release(ptr) } {
      log::warn!("release ignored: {err}");
    }
  }

  pub unsafe fn try_release(&self, ptr: *mut u8) -> Result<(), AllocError> {
    if ptr.is_null() {
      return Ok(());
    }
    self.registry.lock().release(ptr as usize)
  }

  /// `realloc` semantics: null allocates, zero frees and returns null.
  ///
  /// On failure the original block stays valid and untouched.
  pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
    let Some(ptr) = NonNull::new(ptr) else {
      return self.allocate(new_size);
    };
    if new_size == 0 {
      unsafe { self.release(ptr.as_ptr()) };
      return null_mut();
    }

    match unsafe { self.try_resize(ptr, new_size) } {
      Ok(ptr) => ptr.as_ptr(),
      Err(err @ (AllocError::InvalidPointer(_) | AllocError::DoubleFree(_))) => {
        log::warn!("resize ignored: {err}");
        null_mut()
      }
      Err(err) => {
        log::debug!("resize({:p}, {new_size}) failed: {err}", ptr);
        null_mut()
      }
    }
  }

  /// Grows `ptr` to hold `new_size` bytes. A block that already fits is kept
  /// as is, without shrinking or splitting.
  pub unsafe fn try_resize(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, AllocError> {
    if new_size == 0 {
      return Err(AllocError::ZeroSize);
    }
    let old_size = self.registry.lock().payload_size(ptr.as_ptr() as usize)?;
    let need = block_size_for(new_size).ok_or(AllocError::OutOfMemory {
      requested: new_size,
    })?;
    if need <= old_size + BLOCK_OVERHEAD {
      return Ok(ptr);
    }

    let new_ptr = self.try_allocate(new_size)?;
    unsafe {
      ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
      self.release(ptr.as_ptr());
    }
    Ok(new_ptr)
  }

  /// Payload bytes behind `ptr`; 0 for null, foreign or freed pointers.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    if ptr.is_null() {
      return 0;
    }
    self
      .registry
      .lock()
      .payload_size(ptr as usize)
      .unwrap_or(0)
  }

  pub fn class_stats(&self) -> [ClassStats; CLASS_COUNT] {
    let registry = self.registry.lock();
    core::array::from_fn(|class| registry.classes[class].stats(self.config.classes[class].limit))
  }

  pub fn stats(&self) -> AllocatorStats {
    self
      .class_stats()
      .iter()
      .fold(AllocatorStats::default(), |total, class| AllocatorStats {
        pools: total.pools + class.pools,
        capacity: total.capacity + class.capacity,
        allocated_bytes: total.allocated_bytes + class.allocated_bytes,
        free_bytes: total.free_bytes + class.free_bytes,
        free_blocks: total.free_blocks + class.free_blocks,
        largest_free_block: total.largest_free_block.max(class.largest_free_block),
      })
  }

  /// Logs one line per class.
  pub fn report_stats(&self) {
    let classes = self.class_stats();
    log::info!("allocator statistics:");
    for (index, class) in classes.iter().enumerate() {
      log::info!(
        "  class {index} (<= {} B): {} pools, {} B allocated, {} B free in {} blocks (largest {} B, fragmentation {:.3})",
        class.limit,
        class.pools,
        class.allocated_bytes,
        class.free_bytes,
        class.free_blocks,
        class.largest_free_block,
        class.fragmentation(),
      );
    }
    let total = self.stats();
    log::info!(
      "  total: {} B allocated, {} B free, fragmentation {:.3}",
      total.allocated_bytes,
      total.free_bytes,
      total.fragmentation(),
    );
  }

  /// Checks every pool's header chain, boundary tags, free list and counters.
  pub fn validate(&self) -> bool {
    self.registry.lock().validate()
  }

  /// Reports still-allocated blocks and unmaps every pool. Leaks do not block
  /// the teardown. The allocator re-initializes on its next allocation.
  pub fn teardown(&self) -> LeakReport {
    let Some((report, detached)) = self.registry.lock().teardown() else {
      return LeakReport::default();
    };
    drop(detached);

    if report.blocks > 0 {
      log::warn!(
        "memory leak detected: {} blocks, {} bytes",
        report.blocks,
        report.bytes
      );
    } else {
      log::info!("no memory leaks detected");
    }
    report
  }
}

impl Default for PoolAllocator {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for PoolAllocator {
  fn drop(&mut self) {
    self.teardown();
  }
}

fn log_init(outcome: &InitOutcome) {
  for (class, result) in outcome.iter().enumerate() {
    match result {
      Ok(len) => log::debug!("class {class}: pool initialized, {len} bytes"),
      Err(err) => log::warn!("class {class}: pool unavailable: {err}"),
    }
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

unsafe impl GlobalAlloc for PoolAllocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    self.allocate(layout.size())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { self.release(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    unsafe { self.resize(ptr, new_size) }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    self.zero_allocate(1, layout.size())
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
static GLOBAL: PoolAllocator = PoolAllocator::new();

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  GLOBAL.allocate(size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { GLOBAL.release(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  GLOBAL.zero_allocate(nmemb, size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { GLOBAL.resize(ptr, size) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { GLOBAL.usable_size(ptr) }
}

// =============================================================================
// Utils
// =============================================================================

/// Block span for a `size`-byte request: aligned payload plus header and footer.
/// `None` if the arithmetic overflows.
#[inline(always)]
fn block_size_for(size: usize) -> Option<usize> {
  size
    .checked_next_multiple_of(ALIGNMENT)?
    .checked_add(BLOCK_OVERHEAD)
}

#[cfg(test)]
mod tests {
  use super::*;

  const BLOCK_100: usize = 104 + BLOCK_OVERHEAD;

  fn header_of(ptr: *mut u8) -> *mut BlockHeader {
    unsafe { ptr.sub(HEADER_SIZE).cast() }
  }

  fn block_size(ptr: *mut u8) -> usize {
    unsafe { (*header_of(ptr)).size }
  }

  #[test]
  fn block_size_covers_header_and_footer() {
    assert_eq!(block_size_for(1), Some(8 + BLOCK_OVERHEAD));
    assert_eq!(block_size_for(8), Some(8 + BLOCK_OVERHEAD));
    assert_eq!(block_size_for(9), Some(16 + BLOCK_OVERHEAD));
    assert_eq!(block_size_for(usize::MAX), None);
    assert_eq!(block_size_for(usize::MAX - BLOCK_OVERHEAD), None);
  }

  #[test]
  fn select_class_boundaries() {
    let config = AllocatorConfig::DEFAULT;
    assert_eq!(config.select_class(1), 0);
    assert_eq!(config.select_class(SMALL_CLASS_MAX), 0);
    assert_eq!(config.select_class(SMALL_CLASS_MAX + 1), 1);
    assert_eq!(config.select_class(MEDIUM_CLASS_MAX), 1);
    assert_eq!(config.select_class(MEDIUM_CLASS_MAX + 1), 2);
    assert_eq!(config.select_class(LARGE_CLASS_MAX), 2);
    assert_eq!(config.select_class(LARGE_CLASS_MAX + 1), 3);
    assert_eq!(config.select_class(usize::MAX), 3);
  }

  #[test]
  fn config_validation() {
    assert_eq!(AllocatorConfig::DEFAULT.validate(), Ok(()));

    let unordered = AllocatorConfig::DEFAULT.with_class(1, ClassConfig::bounded(32, 4096));
    assert_eq!(
      unordered.validate(),
      Err(ConfigError::UnorderedLimits { index: 1, limit: 32 })
    );

    let bounded = AllocatorConfig::DEFAULT.with_class(3, ClassConfig::bounded(4096, 4096));
    assert_eq!(bounded.validate(), Err(ConfigError::BoundedLastClass(4096)));

    let misaligned = AllocatorConfig::DEFAULT.with_class(0, ClassConfig::bounded(64, 4100));
    assert!(matches!(
      misaligned.validate(),
      Err(ConfigError::MisalignedCapacity { index: 0, .. })
    ));

    let tiny = AllocatorConfig::DEFAULT.with_class(0, ClassConfig::bounded(64, 16));
    assert!(PoolAllocator::with_config(tiny).is_err());
  }

  #[test]
  fn split_leaves_free_remainder() {
    let allocator = PoolAllocator::new();
    let ptr = allocator.allocate(100);
    assert!(!ptr.is_null());
    assert_eq!(block_size(ptr), BLOCK_100);

    let registry = allocator.registry.lock();
    let pool = &registry.classes[1].pools[0];
    assert_eq!(pool.free_head, BLOCK_100);
    assert_eq!(
      pool.free_list().collect::<Vec<_>>(),
      vec![(BLOCK_100, MEDIUM_POOL_SIZE - BLOCK_100)]
    );
    assert_eq!(pool.allocated_bytes, BLOCK_100);
    assert_eq!(pool.free_bytes, MEDIUM_POOL_SIZE - BLOCK_100);
  }

  #[test]
  fn small_remainder_is_not_split() {
    // One alignment step below the split threshold.
    let capacity = BLOCK_100 + MIN_BLOCK_SIZE - ALIGNMENT;
    let config =
      AllocatorConfig::DEFAULT.with_class(1, ClassConfig::bounded(MEDIUM_CLASS_MAX, capacity));
    let allocator = PoolAllocator::with_config(config).unwrap();

    let ptr = allocator.allocate(100);
    assert!(!ptr.is_null());
    assert_eq!(block_size(ptr), capacity);
    assert_eq!(allocator.class_stats()[1].free_bytes, 0);
    assert!(allocator.allocate(100).is_null());
    assert!(allocator.validate());
  }

  #[test]
  fn coalesces_three_adjacent_blocks() {
    let allocator = PoolAllocator::new();
    let a = allocator.allocate(100);
    let b = allocator.allocate(100);
    let c = allocator.allocate(100);
    let guard = allocator.allocate(100);
    assert_eq!(b as usize - a as usize, BLOCK_100);
    assert_eq!(c as usize - b as usize, BLOCK_100);

    unsafe {
      allocator.release(a);
      allocator.release(c);
      assert_eq!(allocator.class_stats()[1].free_blocks, 3);
      // Merges forward into `c` and backward into `a`.
      allocator.release(b);
    }
    let stats = allocator.class_stats()[1];
    assert_eq!(stats.free_blocks, 2);
    assert_eq!(block_size(a), 3 * BLOCK_100);
    assert!(allocator.validate());

    let big = allocator.allocate(250);
    assert_eq!(big, a);
    assert_eq!(allocator.class_stats()[1].pools, 1);

    unsafe {
      allocator.release(big);
      allocator.release(guard);
    }
    assert_eq!(allocator.class_stats()[1].free_blocks, 1);
    assert!(allocator.validate());
  }

  #[test]
  fn backward_merge_uses_boundary_tag() {
    let allocator = PoolAllocator::new();
    let a = allocator.allocate(100);
    let b = allocator.allocate(100);
    let _guard = allocator.allocate(100);

    unsafe {
      allocator.release(a);
      allocator.release(b);
    }
    assert_eq!(block_size(a), 2 * BLOCK_100);
    assert_eq!(unsafe { (*header_of(b)).magic }, 0);
    assert_eq!(
      unsafe { allocator.try_release(b) },
      Err(AllocError::InvalidPointer(b as usize))
    );
    assert!(allocator.validate());
  }

  #[test]
  fn double_release_does_not_touch_counters() {
    let allocator = PoolAllocator::new();
    let a = allocator.allocate(100);
    let _guard = allocator.allocate(100);

    unsafe { allocator.release(a) };
    let before = allocator.stats();
    assert_eq!(
      unsafe { allocator.try_release(a) },
      Err(AllocError::DoubleFree(a as usize))
    );
    assert_eq!(allocator.stats(), before);
    assert!(allocator.validate());
  }

  #[test]
  fn foreign_and_interior_pointers_are_rejected() {
    let allocator = PoolAllocator::new();
    let a = allocator.allocate(100);
    let mut local = 0u64;
    let foreign = &mut local as *mut u64 as *mut u8;

    unsafe {
      assert_eq!(
        allocator.try_release(foreign),
        Err(AllocError::InvalidPointer(foreign as usize))
      );
      assert!(allocator.try_release(a.add(8)).is_err());
      assert!(allocator.try_release(a.add(3)).is_err());
    }
    assert_eq!(allocator.stats().allocated_bytes, BLOCK_100);
    assert!(allocator.validate());
  }

  #[test]
  fn first_fit_and_best_fit_pick_different_holes() {
    let pick = |strategy: FitStrategy| {
      let config = AllocatorConfig::DEFAULT.with_strategy(strategy);
      let allocator = PoolAllocator::with_config(config).unwrap();
      let x1 = allocator.allocate(200);
      let _g1 = allocator.allocate(65);
      let x2 = allocator.allocate(100);
      let _g2 = allocator.allocate(65);
      let x3 = allocator.allocate(100);
      let _g3 = allocator.allocate(65);

      // Free list becomes x1 -> x3 -> x2 -> tail.
      unsafe {
        allocator.release(x2);
        allocator.release(x3);
        allocator.release(x1);
      }
      let got = allocator.allocate(100);
      assert!(allocator.validate());
      (got as usize - x1 as usize, x3 as usize - x1 as usize)
    };

    let (first, _) = pick(FitStrategy::FirstFit);
    assert_eq!(first, 0);

    let (best, x3) = pick(FitStrategy::BestFit);
    assert_eq!(best, x3);
  }

  #[test]
  fn per_class_strategy_overrides_global() {
    let medium =
      ClassConfig::bounded(MEDIUM_CLASS_MAX, MEDIUM_POOL_SIZE).with_strategy(FitStrategy::BestFit);
    let config = AllocatorConfig::DEFAULT.with_class(1, medium);
    assert_eq!(config.strategy_for(1), FitStrategy::BestFit);
    assert_eq!(config.strategy_for(0), config.strategy);
  }

  #[test]
  fn corrupted_size_fails_validation() {
    let allocator = PoolAllocator::new();
    let a = allocator.allocate(100);
    let _b = allocator.allocate(100);
    assert!(allocator.validate());

    let header = header_of(a);
    let original = unsafe { (*header).size };
    unsafe { (*header).size = MEDIUM_POOL_SIZE * 4 };
    assert!(!allocator.validate());

    unsafe { (*header).size = original };
    assert!(allocator.validate());

    // Teardown walks stop at the bad header instead of running off the pool.
    unsafe { (*header).size = usize::MAX - 7 };
    let report = allocator.teardown();
    assert_eq!(report.blocks, 0);
  }

  #[test]
  fn stale_footer_fails_validation() {
    let allocator = PoolAllocator::new();
    let a = allocator.allocate(100);
    let footer = unsafe { a.add(104).cast::<BlockFooter>() };
    unsafe { (*footer).tag |= FREE_BIT };
    assert!(!allocator.validate());
  }

  #[test]
  fn growable_class_maps_more_pools() {
    let config = AllocatorConfig::DEFAULT.with_class(3, ClassConfig::unbounded(4096));
    let allocator = PoolAllocator::with_config(config).unwrap();

    let a = allocator.allocate(3000);
    let b = allocator.allocate(3000);
    let c = allocator.allocate(10_000);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());

    let overflow = allocator.class_stats()[3];
    assert_eq!(overflow.pools, 3);
    assert_eq!(overflow.capacity, 4096 + 4096 + 12_288);
    assert!(allocator.validate());

    unsafe {
      allocator.release(a);
      allocator.release(b);
      allocator.release(c);
    }
    assert_eq!(allocator.teardown(), LeakReport::default());
  }

  #[test]
  fn growth_stops_when_slots_run_out() {
    let config = AllocatorConfig::DEFAULT.with_class(3, ClassConfig::unbounded(4096));
    let allocator = PoolAllocator::with_config(config).unwrap();

    for _ in 0..MAX_POOLS_PER_CLASS {
      assert!(!allocator.allocate(4000).is_null());
    }
    assert_eq!(
      allocator.try_allocate(4000),
      Err(AllocError::OutOfMemory { requested: 4000 })
    );
    assert_eq!(allocator.class_stats()[3].pools, MAX_POOLS_PER_CLASS);
  }

  #[test]
  fn failed_mapping_leaves_class_unusable() {
    let unmappable = usize::MAX & !(ALIGNMENT - 1);
    let config =
      AllocatorConfig::DEFAULT.with_class(0, ClassConfig::bounded(SMALL_CLASS_MAX, unmappable));
    let allocator = PoolAllocator::with_config(config).unwrap();

    assert!(allocator.allocate(8).is_null());
    assert_eq!(allocator.class_stats()[0].pools, 0);
    assert!(!allocator.allocate(100).is_null());
    assert!(allocator.validate());
  }

  #[test]
  fn late_init_hands_regions_back() {
    let allocator = PoolAllocator::new();
    allocator.init();
    let ptr = allocator.allocate(100);

    let regions: Regions = core::array::from_fn(|_| Mapping::new(PAGE_SIZE));
    let Err(unused) = allocator.registry.lock().init(regions) else {
      panic!("registry adopted regions twice");
    };
    assert!(unused.iter().all(Result::is_ok));
    drop(unused);

    assert_eq!(allocator.stats().pools, CLASS_COUNT);
    assert_eq!(unsafe { allocator.usable_size(ptr) }, 104);
    assert!(allocator.validate());
  }
}
