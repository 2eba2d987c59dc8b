use std::{ptr::NonNull, sync::Arc};

use object::{ObjectType, header};

use crate::{
    error::GcError,
    region::{ChunkProvider, LargeObject, Region, SpaceId},
    settings::RegionLayout,
    tables::CardTable,
};

const NO_REGION: u32 = u32::MAX;

/// The tenured space: an ordered list of aligned regions plus the large
/// objects that did not fit into one.
///
/// Region order matters: the planner fills destinations front to back, so
/// a plug never moves to a region that comes after its own.
#[derive(Debug)]
pub struct Space {
    id: SpaceId,
    provider: Arc<ChunkProvider>,
    layout: RegionLayout,
    large_size: usize,
    regions: Vec<Region>,
    /// Provider slot to index in `regions`.
    slots: Box<[u32]>,
    large: Vec<LargeObject>,
}

impl Space {
    pub fn new(
        id: SpaceId,
        provider: Arc<ChunkProvider>,
        layout: RegionLayout,
        large_size: usize,
    ) -> Self {
        let slots = vec![NO_REGION; provider.capacity()].into_boxed_slice();
        Self {
            id,
            provider,
            layout,
            large_size,
            regions: Vec::new(),
            slots,
            large: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> SpaceId {
        self.id
    }

    #[inline(always)]
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    #[inline(always)]
    pub fn provider(&self) -> &Arc<ChunkProvider> {
        &self.provider
    }

    #[inline(always)]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    #[inline(always)]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    #[inline(always)]
    pub fn region(&self, index: usize) -> &Region {
        &self.regions[index]
    }

    #[inline(always)]
    pub fn region_mut(&mut self, index: usize) -> &mut Region {
        let region = &mut self.regions[index];
        debug_assert_eq!(region.space_id(), self.id);
        region
    }

    #[inline(always)]
    pub fn large_objects(&self) -> &[LargeObject] {
        &self.large
    }

    /// Appends a fresh region. `None` if the provider is exhausted.
    pub fn add_region(&mut self) -> Option<usize> {
        let chunk = self.provider.produce()?;
        let region = Region::new(chunk, &self.layout, self.id);
        CardTable::of(&region, &self.layout).clear();

        let index = self.regions.len();
        let slot = self.provider.slot_of(region.chunk_start())?;
        self.slots[slot] = index as u32;
        self.regions.push(region);
        log::trace!("space {:?}: added region {index} (slot {slot})", self.id);
        Some(index)
    }

    /// Reserves `size` bytes for an object moving into this space.
    ///
    /// Objects of at least `large_size` bytes get their own mapping; the rest
    /// are bump allocated at the end of the last region.
    pub fn promote(&mut self, size: usize) -> Result<NonNull<u8>, GcError> {
        debug_assert!(size.is_multiple_of(object::OBJECT_ALIGNMENT));
        debug_assert!(size >= object::MIN_OBJECT_SIZE);
        if size >= self.large_size {
            return self.allocate_large(size);
        }

        if let Some(ptr) = self.regions.last_mut().and_then(|r| r.bump(size)) {
            return Ok(ptr);
        }

        let index = self
            .add_region()
            .ok_or(GcError::PromotionFailure { size })?;
        self.regions[index]
            .bump(size)
            .ok_or(GcError::PromotionFailure { size })
    }

    pub fn allocate_large(&mut self, size: usize) -> Result<NonNull<u8>, GcError> {
        let large = LargeObject::allocate(size).ok_or(GcError::PromotionFailure { size })?;
        let ptr = NonNull::new(large.object()).ok_or(GcError::PromotionFailure { size })?;
        self.large.push(large);
        Ok(ptr)
    }

    /// Index of the region whose chunk contains `addr`.
    #[inline(always)]
    pub fn region_index_of(&self, addr: usize) -> Option<usize> {
        let slot = self.provider.slot_of(addr)?;
        match self.slots[slot] {
            NO_REGION => None,
            index => Some(index as usize),
        }
    }

    pub fn large_index_of(&self, addr: usize) -> Option<usize> {
        self.large.iter().position(|large| large.contains(addr))
    }

    /// Whether `addr` points into memory this space manages.
    pub fn contains(&self, addr: usize) -> bool {
        self.region_index_of(addr).is_some() || self.large_index_of(addr).is_some()
    }

    /// Calls `f` with every object in the space, fillers included.
    ///
    /// # Safety
    ///
    /// All regions must be parsable, i.e. no collection is in progress.
    pub unsafe fn walk_objects<F: FnMut(usize)>(&self, mut f: F) {
        for region in &self.regions {
            // SAFETY: contract forwarded
            unsafe { region.walk_objects(&mut f) };
        }
        for large in &self.large {
            f(large.addr());
        }
    }

    /// Bytes held by objects other than fillers.
    ///
    /// # Safety
    ///
    /// See [`Space::walk_objects`].
    pub unsafe fn live_bytes(&self) -> usize {
        let mut bytes = 0;
        // SAFETY: contract forwarded
        unsafe {
            self.walk_objects(|obj| {
                let header = header(obj as *const u8);
                if header.object_type() != ObjectType::Filler {
                    bytes += header.size();
                }
            })
        };
        bytes
    }

    /// Bytes below `top` in all regions plus all large objects.
    pub fn used_bytes(&self) -> usize {
        let regions: usize = self.regions.iter().map(Region::used_bytes).sum();
        let large: usize = self.large.iter().map(LargeObject::mapped_size).sum();
        regions + large
    }

    /// Detaches every region matching `pred`, keeping the others in order.
    pub fn extract_regions<P>(&mut self, mut pred: P) -> Vec<Region>
    where
        P: FnMut(&Region) -> bool,
    {
        let (taken, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.regions).into_iter().partition(|r| pred(r));
        self.regions = kept;
        self.reindex();
        taken
    }

    /// Detaches every large object matching `pred`.
    pub fn extract_large<P>(&mut self, mut pred: P) -> Vec<LargeObject>
    where
        P: FnMut(&LargeObject) -> bool,
    {
        let (taken, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.large).into_iter().partition(|l| pred(l));
        self.large = kept;
        taken
    }

    fn reindex(&mut self) {
        self.slots.fill(NO_REGION);
        for (index, region) in self.regions.iter().enumerate() {
            if let Some(slot) = self.provider.slot_of(region.chunk_start()) {
                self.slots[slot] = index as u32;
            }
        }
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        for region in self.regions.drain(..) {
            self.provider.release(region.into_chunk());
        }
    }
}
