use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    OS_PAGE_SIZE,
    settings::RegionLayout,
    system::{self, align_up},
};

/// Identifies the space a region belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpaceId(pub u8);

// ── Region ────────────────────────────────────────────────────────────

/// One region-aligned chunk of the tenured space.
///
/// Objects are bump allocated between `objects_start` and `end`; `top` is the
/// first free byte. The bytes in front of `objects_start` hold the card table
/// (outside of collections) or the brick table (during one), followed by the
/// slot of the first plug's relocation record.
#[derive(Debug)]
pub struct Region {
    chunk: NonNull<u8>,
    objects_start: usize,
    top: usize,
    end: usize,
    /// Decided by the planner, consumed by the relocator.
    should_sweep: bool,
    space: SpaceId,
}

impl Region {
    pub(crate) fn new(chunk: NonNull<u8>, layout: &RegionLayout, space: SpaceId) -> Self {
        let start = chunk.as_ptr() as usize;
        debug_assert!(start.is_multiple_of(layout.region_size));
        let objects_start = start + layout.objects_start_offset;
        Self {
            chunk,
            objects_start,
            top: objects_start,
            end: start + layout.region_size,
            should_sweep: false,
            space,
        }
    }

    #[inline(always)]
    pub fn chunk_start(&self) -> usize {
        self.chunk.as_ptr() as usize
    }

    #[inline(always)]
    pub fn objects_start(&self) -> usize {
        self.objects_start
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.top
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline(always)]
    pub fn set_top(&mut self, top: usize) {
        debug_assert!(
            (self.objects_start..=self.end).contains(&top),
            "top 0x{top:x} outside region 0x{:x}",
            self.chunk_start()
        );
        self.top = top;
    }

    #[inline(always)]
    pub fn space_id(&self) -> SpaceId {
        self.space
    }

    /// Whether `addr` lies anywhere inside this region's chunk.
    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        (self.chunk_start()..self.end).contains(&addr)
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.top == self.objects_start
    }

    #[inline(always)]
    pub fn used_bytes(&self) -> usize {
        self.top - self.objects_start
    }

    #[inline(always)]
    pub fn free_bytes(&self) -> usize {
        self.end - self.top
    }

    #[inline(always)]
    pub fn should_sweep(&self) -> bool {
        self.should_sweep
    }

    #[inline(always)]
    pub(crate) fn set_should_sweep(&mut self, sweep: bool) {
        self.should_sweep = sweep;
    }

    /// Bump allocates `size` bytes, or `None` if the region is full.
    #[inline(always)]
    pub fn bump(&mut self, size: usize) -> Option<NonNull<u8>> {
        let new_top = self.top.checked_add(size)?;
        if new_top > self.end {
            return None;
        }
        let ptr = self.top as *mut u8;
        self.top = new_top;
        NonNull::new(ptr)
    }

    /// Calls `f` with every object between `objects_start` and `top`,
    /// fillers included.
    ///
    /// # Safety
    ///
    /// Every header below `top` must be intact, which is not the case
    /// between planning and relocation.
    pub unsafe fn walk_objects<F: FnMut(usize)>(&self, mut f: F) {
        let mut cursor = self.objects_start;
        while cursor < self.top {
            // SAFETY: the region is parsable per contract
            let size = unsafe { object::object_size(cursor as *const u8) };
            debug_assert!(size >= object::MIN_OBJECT_SIZE, "bad size at 0x{cursor:x}");
            f(cursor);
            cursor += size;
        }
        debug_assert_eq!(cursor, self.top);
    }

    pub(crate) fn into_chunk(self) -> NonNull<u8> {
        self.chunk
    }
}

// ── Large objects ─────────────────────────────────────────────────────

/// An object too large for a region, mapped on its own.
///
/// Large objects never move; the mapping is returned when this is dropped.
#[derive(Debug)]
pub struct LargeObject {
    base: NonNull<u8>,
    mapped: usize,
}

impl LargeObject {
    /// Maps zeroed memory for an object of `size` bytes.
    pub fn allocate(size: usize) -> Option<Self> {
        let mapped = align_up(size, OS_PAGE_SIZE);
        let base = system::map_memory(mapped)?;
        Some(Self { base, mapped })
    }

    #[inline(always)]
    pub fn object(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline(always)]
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline(always)]
    pub fn mapped_size(&self) -> usize {
        self.mapped
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        (self.addr()..self.addr() + self.mapped).contains(&addr)
    }
}

impl Drop for LargeObject {
    fn drop(&mut self) {
        system::unmap_memory(self.base, self.mapped);
    }
}

// ── ChunkProvider ─────────────────────────────────────────────────────

/// Owns the reservation all regions are carved from.
///
/// Fresh chunks come from a bump cursor over the reservation; released
/// chunks are kept on a free list and preferred over fresh ones.
#[derive(Debug)]
pub struct ChunkProvider {
    base: NonNull<u8>,
    size: usize,
    region_size: usize,
    fresh_cursor: AtomicUsize,
    available: Mutex<Vec<usize>>,
}

// SAFETY: the reservation is only handed out in disjoint chunks and the
// free list is behind a mutex.
unsafe impl Send for ChunkProvider {}
// SAFETY: see above
unsafe impl Sync for ChunkProvider {}

impl ChunkProvider {
    /// Reserves `heap_size` bytes aligned to `region_size`.
    pub fn new(heap_size: usize, region_size: usize) -> Option<Self> {
        debug_assert!(heap_size.is_multiple_of(region_size));
        let base = system::map_aligned(heap_size, region_size)?;
        Some(Self {
            base,
            size: heap_size,
            region_size,
            fresh_cursor: AtomicUsize::new(0),
            available: Mutex::new(Vec::new()),
        })
    }

    #[inline(always)]
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Number of chunks in the reservation.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.size / self.region_size
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Acquires a chunk, or `None` if the reservation is used up.
    ///
    /// Prioritizes released chunks, falls back to the fresh cursor.
    pub fn produce(&self) -> Option<NonNull<u8>> {
        if let Some(slot) = self.available.lock().pop() {
            return NonNull::new(self.chunk_start(slot) as *mut u8);
        }

        let total = self.capacity();
        let mut fresh = self.fresh_cursor.load(Ordering::Relaxed);
        loop {
            if fresh >= total {
                return None;
            }
            match self.fresh_cursor.compare_exchange(
                fresh,
                fresh + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return NonNull::new(self.chunk_start(fresh) as *mut u8),
                Err(updated) => fresh = updated,
            }
        }
    }

    /// Takes a chunk back. Its contents are stale from here on.
    pub fn release(&self, chunk: NonNull<u8>) {
        let addr = chunk.as_ptr() as usize;
        let slot = self.slot_of(addr).expect("chunk from another provider");
        debug_assert_eq!(self.chunk_start(slot), addr, "not a chunk start");
        let mut available = self.available.lock();
        debug_assert!(!available.contains(&slot), "chunk released twice");
        available.push(slot);
    }

    /// Index of the chunk containing `addr`.
    #[inline(always)]
    pub fn slot_of(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.start())?;
        (offset < self.size).then(|| offset / self.region_size)
    }

    #[inline(always)]
    pub fn chunk_start(&self, slot: usize) -> usize {
        debug_assert!(slot < self.capacity());
        self.start() + slot * self.region_size
    }

    /// Chunks currently on the free list.
    pub fn available_count(&self) -> usize {
        self.available.lock().len()
    }
}

impl Drop for ChunkProvider {
    fn drop(&mut self) {
        system::unmap_memory(self.base, self.size);
    }
}

// ── ChunkReleaser ─────────────────────────────────────────────────────

/// Collects memory that a collection found empty so it can be returned in
/// one go once the collection is over.
#[derive(Debug, Default)]
pub struct ChunkReleaser {
    regions: Vec<NonNull<u8>>,
    large: Vec<LargeObject>,
}

impl ChunkReleaser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_region(&mut self, region: Region) {
        debug_assert!(region.is_empty(), "releasing a region that holds objects");
        self.regions.push(region.into_chunk());
    }

    pub fn add_large(&mut self, large: LargeObject) {
        self.large.push(large);
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn large_count(&self) -> usize {
        self.large.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty() && self.large.is_empty()
    }

    /// Hands regions back to `provider` and unmaps large objects.
    /// Returns how many of each were released.
    pub fn release(&mut self, provider: &ChunkProvider) -> (usize, usize) {
        let regions = self.regions.len();
        let large = self.large.len();
        for chunk in self.regions.drain(..) {
            provider.release(chunk);
        }
        self.large.clear();
        (regions, large)
    }
}
