//! Relocation: compacted regions slide their plugs to the planned
//! destinations, swept regions stay put and get fillers over their gaps.

use std::ptr;

use object::init_filler;

use crate::{error::GcError, region::Region, relocation::RelocationInfo, space::Space};

/// Copies plugs of compacted regions to their relocation pointers.
#[derive(Debug)]
pub struct Compactor {
    info: RelocationInfo,
    copied_bytes: usize,
    plug_bytes: usize,
}

impl Compactor {
    pub fn new(info: RelocationInfo) -> Self {
        Self {
            info,
            copied_bytes: 0,
            plug_bytes: 0,
        }
    }

    /// Bytes of plugs that actually moved.
    pub fn copied_bytes(&self) -> usize {
        self.copied_bytes
    }

    /// Bytes of every plug placed, moved or not.
    pub fn plug_bytes(&self) -> usize {
        self.plug_bytes
    }

    /// Moves every plug of region `index`.
    ///
    /// Destinations lie in this region or an earlier one, and within a
    /// region never after their source, so neither plugs of later regions
    /// nor records still ahead in this region get overwritten. The next
    /// record is read before a plug is copied.
    ///
    /// # Safety
    ///
    /// The region must be planned for compaction, all regions before it
    /// already relocated and all references fixed.
    pub unsafe fn compact_region(&mut self, space: &mut Space, index: usize) -> Result<(), GcError> {
        let region = space.region(index);
        debug_assert!(!region.should_sweep());
        let objects_start = region.objects_start();
        let top = region.top();

        let mut record = Some(objects_start);
        while let Some(current) = record {
            // SAFETY: current is part of the chain and not yet overwritten
            let (next, end, target) = unsafe {
                (
                    self.info.next_plug(current),
                    self.info.plug_end(current, top),
                    self.info.read_relocation_pointer(current),
                )
            };
            let size = end - current;

            if size > 0 {
                let bounds = space
                    .region_index_of(target)
                    .map(|i| (i, space.region(i).objects_start(), space.region(i).end()));
                let Some((dest_index, _, _)) =
                    bounds.filter(|&(_, lo, hi)| target >= lo && target + size <= hi)
                else {
                    let (region_start, region_end) = bounds.map_or((0, 0), |(_, lo, hi)| (lo, hi));
                    let err = GcError::RelocationOutOfBounds {
                        address: target,
                        region_start,
                        region_end,
                    };
                    // Earlier records of this region may be overwritten.
                    // SAFETY: the record at current is still intact
                    let gap = unsafe { self.info.read_gap_size(current) };
                    log::error!(
                        "{err} compacting region {index}: record 0x{current:x} \
                         (gap {gap}, next {next:?}), plug end 0x{end:x}, top 0x{top:x}"
                    );
                    return Err(err);
                };
                let dest = space.region_mut(dest_index);
                debug_assert!(dest_index != index || target <= current);

                if target != current {
                    log::trace!("copy 0x{current:x}..0x{end:x} -> 0x{target:x}");
                    // SAFETY: both ranges lie inside mapped regions; they may
                    // overlap when sliding within one region
                    unsafe { ptr::copy(current as *const u8, target as *mut u8, size) };
                    self.copied_bytes += size;
                }
                dest.set_top(target + size);
                if dest_index != index {
                    space.region_mut(index).set_top(objects_start);
                }
                self.plug_bytes += size;
            }
            record = next;
        }
        Ok(())
    }
}

/// Formats the gaps of swept regions as filler objects.
#[derive(Debug)]
pub struct Sweeper {
    info: RelocationInfo,
    filler_bytes: usize,
    fillers: usize,
}

impl Sweeper {
    pub fn new(info: RelocationInfo) -> Self {
        Self {
            info,
            filler_bytes: 0,
            fillers: 0,
        }
    }

    pub fn filler_bytes(&self) -> usize {
        self.filler_bytes
    }

    pub fn fillers(&self) -> usize {
        self.fillers
    }

    /// Overwrites every gap of `region` with one filler object. Each record
    /// is read before the filler covering it is written.
    ///
    /// # Safety
    ///
    /// The region must be planned for sweeping and its references fixed.
    pub unsafe fn sweep_region(&mut self, region: &Region) {
        debug_assert!(region.should_sweep());
        // SAFETY: contract; the iterator reads each next link up front
        for record in unsafe { self.info.records(region) } {
            // SAFETY: record is intact until the filler below
            let gap = unsafe { self.info.read_gap_size(record) };
            if gap > 0 {
                // SAFETY: [record - gap, record) is dead memory of this region
                unsafe { init_filler((record - gap) as *mut u8, gap) };
                self.filler_bytes += gap;
                self.fillers += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        planner::{Plan, Planner},
        region::{ChunkProvider, SpaceId},
        settings::{RegionLayout, RelocationEncoding},
    };
    use object::{ObjectType, init_slots};
    use std::sync::Arc;

    const REGION: usize = 8192;

    fn space(regions: usize) -> Space {
        let provider = Arc::new(ChunkProvider::new(regions * REGION, REGION).expect("reserve"));
        Space::new(SpaceId(1), provider, RegionLayout::new(REGION, 128, 2), REGION)
    }

    /// Allocates 16-byte objects holding their index as a fixnum.
    fn populate(space: &mut Space, live: impl Fn(usize) -> bool, count: usize) -> Vec<usize> {
        (0..count)
            .map(|i| {
                let ptr = space.promote(16).expect("promote").as_ptr();
                let slots = unsafe { init_slots(ptr, 1) };
                unsafe { slots.set_field(0, object::Value::from_i64(i as i64)) };
                if live(i) {
                    slots.header.try_mark();
                }
                ptr as usize
            })
            .collect()
    }

    fn id_at(addr: usize) -> i64 {
        unsafe { (*(addr as *const object::Slots)).field(0).to_i64() }
    }

    #[test]
    fn compaction_slides_plugs_down() {
        for encoding in [RelocationEncoding::Wide, RelocationEncoding::Narrow] {
            let info = RelocationInfo::new(encoding);
            let mut space = space(1);
            populate(&mut space, |i| i % 3 == 0, 30);
            let plans = Planner::new(info, *space.layout(), 16)
                .plan(&mut space)
                .expect("plan");
            assert_eq!(plans[0].plan, Plan::Compact);

            let mut compactor = Compactor::new(info);
            unsafe { compactor.compact_region(&mut space, 0) }.expect("compact");
            assert_eq!(compactor.plug_bytes(), 10 * 16);
            assert_eq!(compactor.copied_bytes(), 9 * 16, "the first plug stays put");

            let region = space.region(0);
            assert_eq!(region.used_bytes(), 10 * 16);
            let mut ids = Vec::new();
            unsafe { region.walk_objects(|obj| ids.push(id_at(obj))) };
            assert_eq!(ids, (0..30).step_by(3).collect::<Vec<_>>());
        }
    }

    #[test]
    fn plugs_already_in_place_are_not_copied() {
        let info = RelocationInfo::new(RelocationEncoding::Narrow);
        let mut space = space(1);
        // Dense prefix, dead tail: the region is compacted but nothing moves.
        populate(&mut space, |i| i < 20, 200);
        let plans = Planner::new(info, *space.layout(), 16)
            .plan(&mut space)
            .expect("plan");
        assert_eq!(plans[0].plan, Plan::Compact);

        let mut compactor = Compactor::new(info);
        unsafe { compactor.compact_region(&mut space, 0) }.expect("compact");
        assert_eq!(compactor.copied_bytes(), 0);
        assert_eq!(compactor.plug_bytes(), 20 * 16);
        assert_eq!(space.region(0).used_bytes(), 20 * 16);

        let mut ids = Vec::new();
        unsafe { space.region(0).walk_objects(|obj| ids.push(id_at(obj))) };
        assert_eq!(ids, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn compaction_moves_into_earlier_region_and_empties_source() {
        let info = RelocationInfo::new(RelocationEncoding::Wide);
        let mut space = space(2);
        let per_region = space.layout().objects_size() / 16;
        populate(&mut space, |i| i == 0 || i >= per_region, per_region + 4);
        assert_eq!(space.region_count(), 2);

        Planner::new(info, *space.layout(), 16)
            .plan(&mut space)
            .expect("plan");
        let mut compactor = Compactor::new(info);
        for index in 0..2 {
            unsafe { compactor.compact_region(&mut space, index) }.expect("compact");
        }

        assert!(space.region(1).is_empty());
        assert_eq!(space.region(0).used_bytes(), 5 * 16);
        let mut ids = Vec::new();
        unsafe { space.region(0).walk_objects(|obj| ids.push(id_at(obj))) };
        let expected: Vec<i64> = std::iter::once(0)
            .chain(per_region as i64..per_region as i64 + 4)
            .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn sweeping_fills_gaps_in_place() {
        let info = RelocationInfo::new(RelocationEncoding::Wide);
        let mut space = space(1);
        let per_region = space.layout().objects_size() / 16;
        // Two dead runs: one object and three objects.
        let objs = populate(&mut space, |i| i != 4 && !(10..13).contains(&i), per_region);
        let plans = Planner::new(info, *space.layout(), 16)
            .plan(&mut space)
            .expect("plan");
        assert_eq!(plans[0].plan, Plan::Sweep);

        let mut sweeper = Sweeper::new(info);
        unsafe { sweeper.sweep_region(space.region(0)) };
        assert_eq!(sweeper.fillers(), 2);
        assert_eq!(sweeper.filler_bytes(), 64);

        let filler = unsafe { object::header(objs[10] as *const u8) };
        assert_eq!(filler.object_type(), ObjectType::Filler);
        assert_eq!(filler.size(), 48);
        assert_eq!(id_at(objs[13]), 13);
        assert_eq!(id_at(objs[3]), 3);

        let mut live = 0;
        unsafe {
            space.region(0).walk_objects(|obj| {
                if object::header(obj as *const u8).object_type() != ObjectType::Filler {
                    live += 1;
                }
            })
        };
        assert_eq!(live, per_region - 4);
    }
}
