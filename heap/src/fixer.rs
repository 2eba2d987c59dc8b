//! Reference fixing: after planning and before anything moves, every
//! reference into the planned regions is rewritten to the address its
//! referent will have once relocation is done.

use object::{Value, walk_references};

use crate::{
    RootProvider,
    error::{GcError, Holder},
    image::ImageHeap,
    relocation::RelocationInfo,
    remset::RememberedSet,
    space::Space,
};

/// Rewrites references in place using the planned relocation records.
pub struct Fixer<'a, R: RememberedSet> {
    space: &'a Space,
    info: RelocationInfo,
    remset: &'a mut R,
    fixed: usize,
}

impl<'a, R: RememberedSet> Fixer<'a, R> {
    pub fn new(space: &'a Space, info: RelocationInfo, remset: &'a mut R) -> Self {
        Self {
            space,
            info,
            remset,
            fixed: 0,
        }
    }

    /// References rewritten so far.
    pub fn fixed(&self) -> usize {
        self.fixed
    }

    /// Fixes one slot. Returns the (possibly new) referent if the slot holds
    /// a reference.
    ///
    /// Referents outside the regions (image heap, large objects, foreign
    /// memory) are left alone. A root whose referent was not planned as live
    /// is cleared to [`Value::ZERO`]; for any other holder that is an error.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for reads and writes; every region must be
    /// planned and not yet relocated.
    pub unsafe fn fix_slot(&mut self, slot: *mut Value, holder: Holder) -> Result<Option<usize>, GcError> {
        // SAFETY: contract
        let value = unsafe { slot.read() };
        if !value.is_ref() {
            return Ok(None);
        }
        let referent = value.addr();
        let Some(index) = self.space.region_index_of(referent) else {
            return Ok(Some(referent));
        };

        let region = self.space.region(index);
        // SAFETY: regions are planned per contract
        let relocated = unsafe {
            self.info
                .relocated_pointer(region, self.space.layout(), referent)
        };
        let Some(relocated) = relocated else {
            if holder == Holder::Root {
                log::trace!("root to dead object 0x{referent:x} cleared");
                // SAFETY: contract
                unsafe { slot.write(Value::ZERO) };
                return Ok(None);
            }
            let err = GcError::UnmarkedReferent { holder, referent };
            self.report(&err, index, referent);
            return Err(err);
        };

        if let Err(err) = self.check_bounds(relocated) {
            self.report(&err, index, referent);
            return Err(err);
        }
        if relocated != referent {
            // SAFETY: contract
            unsafe { slot.write(Value::from_addr(relocated)) };
            self.fixed += 1;
        }
        Ok(Some(relocated))
    }

    /// Logs the chain state the failed lookup of `referent` saw.
    fn report(&self, err: &GcError, index: usize, referent: usize) {
        // SAFETY: region `index` is planned
        let state = unsafe {
            self.info
                .chain_state(self.space.region(index), self.space.layout(), referent)
        };
        log::error!("{err} in region {index}: {state}");
    }

    fn check_bounds(&self, address: usize) -> Result<(), GcError> {
        let out_of_bounds = |region_start, region_end| GcError::RelocationOutOfBounds {
            address,
            region_start,
            region_end,
        };
        let index = self
            .space
            .region_index_of(address)
            .ok_or_else(|| out_of_bounds(0, 0))?;
        let region = self.space.region(index);
        if address < region.objects_start() || address >= region.end() {
            return Err(out_of_bounds(region.objects_start(), region.end()));
        }
        Ok(())
    }

    /// Fixes every reference field of the object at `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be a live object; see [`Fixer::fix_slot`].
    pub unsafe fn fix_object(&mut self, obj: usize, holder: Holder) -> Result<(), GcError> {
        let mut result = Ok(());
        // SAFETY: contract
        unsafe {
            walk_references(obj as *mut u8, |slot| {
                if result.is_ok() {
                    result = self.fix_slot(slot, holder).map(drop);
                }
            })
        };
        result
    }

    /// Fixes all live objects in every region, walking plugs only.
    pub fn fix_regions(&mut self) -> Result<(), GcError> {
        let space = self.space;
        let info = self.info;
        for region in space.regions() {
            let mut result = Ok(());
            // SAFETY: regions are planned and nothing has moved yet
            unsafe {
                info.walk_live_objects(region, |obj| {
                    if result.is_ok() {
                        result = self.fix_object(obj, Holder::Object(obj));
                    }
                })
            };
            result?;
        }
        Ok(())
    }

    /// Fixes the large objects still in the space. Their mark bits are
    /// cleared; unmarked ones must already have been detached.
    pub fn fix_large_objects(&mut self) -> Result<(), GcError> {
        let space = self.space;
        for large in space.large_objects() {
            let obj = large.addr();
            // SAFETY: large objects are never overwritten by records
            let header = unsafe { object::header(obj as *const u8) };
            debug_assert!(header.is_marked(), "unmarked large object left in space");
            header.clear_mark();
            self.remset.clear_large(large);
            // SAFETY: live large object
            unsafe { self.fix_object(obj, Holder::Large(obj))? };
        }
        Ok(())
    }

    /// Fixes every image heap object and dirties the card of each holder
    /// that references the space.
    pub fn fix_image_heap(&mut self, image: &mut ImageHeap) -> Result<(), GcError> {
        let mut cursor = image.start();
        while cursor < image.top() {
            let obj = cursor;
            let mut result = Ok(());
            // SAFETY: image objects are always parsable
            unsafe {
                walk_references(obj as *mut u8, |slot| {
                    if result.is_ok() {
                        match self.fix_slot(slot, Holder::Image(obj)) {
                            Ok(Some(referent)) => {
                                self.remset.dirty_card_if_necessary(image, obj, referent)
                            }
                            Ok(None) => {}
                            Err(err) => result = Err(err),
                        }
                    }
                })
            };
            result?;
            // SAFETY: see above
            cursor += unsafe { object::object_size(obj as *const u8) };
        }
        Ok(())
    }

    /// Fixes every root slot.
    pub fn fix_roots(&mut self, roots: &mut dyn RootProvider) -> Result<(), GcError> {
        let mut result = Ok(());
        roots.visit_roots(&mut |root| {
            if result.is_ok() {
                // SAFETY: root slots are exclusive references
                result = unsafe { self.fix_slot(root as *mut Value, Holder::Root) }.map(drop);
            }
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        planner::Planner,
        region::{ChunkProvider, SpaceId},
        remset::CardRememberedSet,
        settings::{RegionLayout, RelocationEncoding},
    };
    use object::{init_slots, slots_allocation_size};
    use std::sync::Arc;

    const REGION: usize = 8192;

    struct TestRoots {
        roots: Vec<Value>,
    }

    impl RootProvider for TestRoots {
        fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
            for root in &mut self.roots {
                visitor(root);
            }
        }
    }

    fn space() -> Space {
        let provider = Arc::new(ChunkProvider::new(2 * REGION, REGION).expect("reserve"));
        Space::new(SpaceId(1), provider, RegionLayout::new(REGION, 128, 2), 2048)
    }

    fn alloc(space: &mut Space, fields: usize, live: bool) -> usize {
        let ptr = space.promote(slots_allocation_size(fields)).expect("promote").as_ptr();
        let slots = unsafe { init_slots(ptr, fields) };
        if live {
            slots.header.try_mark();
        }
        ptr as usize
    }

    fn field(obj: usize, index: usize) -> Value {
        unsafe { (*(obj as *const object::Slots)).field(index) }
    }

    fn set_field(obj: usize, index: usize, value: Value) {
        unsafe { (*(obj as *const object::Slots)).set_field(index, value) }
    }

    fn plan(space: &mut Space) -> RelocationInfo {
        let info = RelocationInfo::new(RelocationEncoding::Wide);
        Planner::new(info, *space.layout(), 16).plan(space).expect("plan");
        info
    }

    #[test]
    fn fixes_objects_and_roots() {
        let mut space = space();
        let a = alloc(&mut space, 3, true);
        let dead = alloc(&mut space, 1, false);
        let b = alloc(&mut space, 3, true);
        set_field(a, 0, Value::from_addr(b));
        set_field(a, 1, Value::from_i64(5));
        set_field(b, 2, Value::from_addr(a));
        set_field(dead, 0, Value::from_addr(b));

        let mut roots = TestRoots {
            roots: vec![Value::from_addr(b), Value::from_i64(1), Value::from_addr(b + 8)],
        };

        let info = plan(&mut space);
        let mut remset = CardRememberedSet::new();
        let mut fixer = Fixer::new(&space, info, &mut remset);
        fixer.fix_regions().expect("fix regions");
        fixer.fix_roots(&mut roots).expect("fix roots");
        assert_eq!(fixer.fixed(), 3);

        assert_eq!(field(a, 0), Value::from_addr(b - 16));
        assert_eq!(field(a, 1), Value::from_i64(5));
        assert_eq!(field(b, 2), Value::from_addr(a));
        assert_eq!(roots.roots[0], Value::from_addr(b - 16));
        assert_eq!(roots.roots[1], Value::from_i64(1));
        assert_eq!(roots.roots[2], Value::from_addr(b - 8));
    }

    #[test]
    fn reference_to_dead_object_is_reported() {
        let mut space = space();
        let a = alloc(&mut space, 1, true);
        let dead = alloc(&mut space, 1, false);
        alloc(&mut space, 1, true);
        set_field(a, 0, Value::from_addr(dead));

        let info = plan(&mut space);
        let mut remset = CardRememberedSet::new();
        let mut fixer = Fixer::new(&space, info, &mut remset);
        assert_eq!(
            fixer.fix_regions(),
            Err(GcError::UnmarkedReferent {
                holder: Holder::Object(a),
                referent: dead,
            })
        );
    }

    #[test]
    fn dead_root_is_cleared() {
        let mut space = space();
        alloc(&mut space, 1, true);
        let dead = alloc(&mut space, 1, false);
        let live = alloc(&mut space, 1, true);
        let mut roots = TestRoots {
            roots: vec![Value::from_addr(dead), Value::from_addr(live)],
        };

        let info = plan(&mut space);
        let mut remset = CardRememberedSet::new();
        let mut fixer = Fixer::new(&space, info, &mut remset);
        fixer.fix_roots(&mut roots).expect("fix roots");
        assert_eq!(roots.roots[0], Value::ZERO);
        assert_eq!(roots.roots[1], Value::from_addr(live - 16));
        assert_eq!(fixer.fixed(), 1);
    }

    #[test]
    fn dead_referent_of_image_holder_is_reported() {
        let mut space = space();
        alloc(&mut space, 1, true);
        let dead = alloc(&mut space, 1, false);
        alloc(&mut space, 1, true);

        let mut image = ImageHeap::new(4096, 256).expect("image");
        let holder = image.allocate(slots_allocation_size(1)).expect("holder").as_ptr();
        unsafe { init_slots(holder, 1) };
        set_field(holder as usize, 0, Value::from_addr(dead));

        let info = plan(&mut space);
        let mut remset = CardRememberedSet::new();
        let mut fixer = Fixer::new(&space, info, &mut remset);
        assert_eq!(
            fixer.fix_image_heap(&mut image),
            Err(GcError::UnmarkedReferent {
                holder: Holder::Image(holder as usize),
                referent: dead,
            })
        );
    }

    #[test]
    fn references_outside_regions_are_untouched() {
        let mut space = space();
        let outside = Box::new([0u64; 2]);
        let outside_addr = outside.as_ptr() as usize;
        alloc(&mut space, 1, false);
        let a = alloc(&mut space, 1, true);
        set_field(a, 0, Value::from_addr(outside_addr));

        let info = plan(&mut space);
        let mut remset = CardRememberedSet::new();
        let mut fixer = Fixer::new(&space, info, &mut remset);
        fixer.fix_regions().expect("fix");
        assert_eq!(field(a, 0), Value::from_addr(outside_addr));
    }

    #[test]
    fn large_objects_are_fixed_and_unmarked() {
        let mut space = space();
        alloc(&mut space, 1, false);
        let small = alloc(&mut space, 1, true);
        let large = space.promote(4096).expect("large").as_ptr() as usize;
        let slots = unsafe { init_slots(large as *mut u8, 4096 / 8 - 1) };
        slots.header.try_mark();
        set_field(large, 10, Value::from_addr(small));

        let info = plan(&mut space);
        let mut remset = CardRememberedSet::new();
        let mut fixer = Fixer::new(&space, info, &mut remset);
        fixer.fix_large_objects().expect("fix large");
        assert_eq!(field(large, 10), Value::from_addr(small - 16));
        assert!(!slots.header.is_marked());
    }

    #[test]
    fn image_holders_are_fixed_and_dirtied() {
        let mut space = space();
        alloc(&mut space, 1, false);
        let a = alloc(&mut space, 1, true);

        let mut image = ImageHeap::new(4096, 256).expect("image");
        let holder = image.allocate(slots_allocation_size(2)).expect("holder").as_ptr();
        let other = image.allocate(slots_allocation_size(1)).expect("other").as_ptr();
        unsafe {
            init_slots(holder, 2);
            init_slots(other, 1);
        }
        set_field(holder as usize, 1, Value::from_addr(a));
        set_field(other as usize, 0, Value::from_addr(holder as usize));

        let info = plan(&mut space);
        let mut remset = CardRememberedSet::new();
        let mut fixer = Fixer::new(&space, info, &mut remset);
        fixer.fix_image_heap(&mut image).expect("fix image");

        assert_eq!(field(holder as usize, 1), Value::from_addr(a - 16));
        assert!(image.is_card_dirty(holder as usize));
        assert_eq!(image.dirty_count(), 1, "image-internal reference needs no card");
    }
}
