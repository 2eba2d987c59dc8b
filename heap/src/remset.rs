use std::collections::HashSet;

use object::HeaderFlags;

use crate::{
    image::ImageHeap,
    region::{LargeObject, Region},
    settings::RegionLayout,
    space::Space,
    tables::CardTable,
};

/// Tracks which old objects may hold references that a younger collection
/// has to treat as roots.
///
/// The tenured collector only keeps it consistent: it clears and rebuilds
/// the per-region state after moving objects and re-dirties image holders
/// whose references it rewrote.
pub trait RememberedSet {
    /// Forgets everything recorded for `region`.
    fn clear_region(&mut self, region: &Region, layout: &RegionLayout);

    /// Starts tracking `region` from scratch: every card clean, every object
    /// below `top` flagged as remembered. The region must be parsable.
    fn enable_for_region(&mut self, region: &Region, layout: &RegionLayout);

    /// Forgets everything recorded for a large object.
    fn clear_large(&mut self, large: &LargeObject);

    /// Called after the collector rewrote a reference in image object
    /// `holder` to `referent`.
    fn dirty_card_if_necessary(&mut self, image: &mut ImageHeap, holder: usize, referent: usize);

    /// Records a mutator store into `holder`.
    fn write_barrier(&mut self, space: &Space, holder: usize);
}

/// Card marking for regions, a dirty set for large objects.
#[derive(Debug, Default)]
pub struct CardRememberedSet {
    dirty_large: HashSet<usize>,
}

impl CardRememberedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the card covering `addr` in `space` is dirty.
    pub fn is_dirty(&self, space: &Space, addr: usize) -> bool {
        if let Some(index) = space.region_index_of(addr) {
            return CardTable::of(space.region(index), space.layout()).is_dirty(addr);
        }
        space
            .large_index_of(addr)
            .is_some_and(|index| self.dirty_large.contains(&space.large_objects()[index].addr()))
    }
}

impl RememberedSet for CardRememberedSet {
    fn clear_region(&mut self, region: &Region, layout: &RegionLayout) {
        CardTable::of(region, layout).clear();
    }

    fn enable_for_region(&mut self, region: &Region, layout: &RegionLayout) {
        self.clear_region(region, layout);
        // SAFETY: callers only rebuild regions after relocation finished
        unsafe {
            region.walk_objects(|obj| {
                object::header(obj as *const u8).add_flag(HeaderFlags::REMEMBERED);
            })
        };
    }

    fn clear_large(&mut self, large: &LargeObject) {
        self.dirty_large.remove(&large.addr());
    }

    fn dirty_card_if_necessary(&mut self, image: &mut ImageHeap, holder: usize, referent: usize) {
        if referent != 0 && !image.contains(referent) {
            image.dirty_card(holder);
        }
    }

    fn write_barrier(&mut self, space: &Space, holder: usize) {
        // SAFETY: holder is a live object of this space
        let header = unsafe { object::header(holder as *const u8) };
        if !header.has_flag(HeaderFlags::REMEMBERED) {
            return;
        }
        if let Some(index) = space.region_index_of(holder) {
            CardTable::of(space.region(index), space.layout()).dirty(holder);
        } else if let Some(index) = space.large_index_of(holder) {
            self.dirty_large.insert(space.large_objects()[index].addr());
        }
    }
}
