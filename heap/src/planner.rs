//! Planning: one linear pass per region that clears mark bits, groups live
//! objects into plugs, writes a relocation record for every plug and decides
//! whether the region is compacted or swept.

use object::header;

use crate::{
    error::GcError,
    region::Region,
    relocation::RelocationInfo,
    settings::RegionLayout,
    space::Space,
    tables::BrickTable,
};

/// What the planner decided for one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Slide plugs to their relocation pointers.
    Compact,
    /// Leave objects in place and turn gaps into fillers.
    Sweep,
}

/// Planning results for one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionPlan {
    pub plan: Plan,
    /// Bytes in plugs.
    pub live_bytes: usize,
    /// Bytes in gaps, trailing gap included.
    pub gap_bytes: usize,
    /// Gaps plus the unused tail of the region.
    pub fragmentation: usize,
    /// Records in the chain, the one at `objects_start` included.
    pub records: usize,
    /// A live object must not move.
    pub immovable: bool,
}

/// Walks regions in order and assigns destinations with a bump cursor that
/// moves through the same regions.
#[derive(Debug)]
pub struct Planner {
    info: RelocationInfo,
    layout: RegionLayout,
    sweep_divisor: usize,
    /// Destination region index.
    cursor_region: usize,
    allocation_pointer: usize,
}

impl Planner {
    pub fn new(info: RelocationInfo, layout: RegionLayout, sweep_divisor: usize) -> Self {
        Self {
            info,
            layout,
            sweep_divisor,
            cursor_region: 0,
            allocation_pointer: 0,
        }
    }

    /// Plans every region of `space`.
    pub fn plan(&mut self, space: &mut Space) -> Result<Vec<RegionPlan>, GcError> {
        let Some(first) = space.regions().first() else {
            return Ok(Vec::new());
        };
        self.cursor_region = 0;
        self.allocation_pointer = first.objects_start();

        (0..space.region_count())
            .map(|index| self.plan_region(space, index))
            .collect()
    }

    /// Plans region `index`. All regions before it must be planned already.
    pub fn plan_region(&mut self, space: &mut Space, index: usize) -> Result<RegionPlan, GcError> {
        let info = self.info;
        let region = space.region(index);
        let bricks = BrickTable::of(region, &self.layout);
        let objects_start = region.objects_start();
        let top = region.top();

        let mut cursor = objects_start;
        let mut record = objects_start;
        let mut brick = 0;
        let mut plug_size = 0;
        let mut gap_size = 0;
        let mut plan = RegionPlan {
            plan: Plan::Compact,
            live_bytes: 0,
            gap_bytes: 0,
            fragmentation: 0,
            records: 1,
            immovable: false,
        };

        // SAFETY: the first record slot sits in front of objects_start
        unsafe { info.write(record, self.allocation_pointer, 0, 0)? };
        bricks.set_entry(0, record);

        while cursor < top {
            // SAFETY: cursor is on an object boundary below top; records are
            // only ever written behind it
            let header = unsafe { header(cursor as *const u8) };
            let size = header.size();
            debug_assert!(size >= object::MIN_OBJECT_SIZE, "bad size at 0x{cursor:x}");

            if header.is_marked() {
                header.clear_mark();
                plan.immovable |= header.is_immovable();
                if gap_size != 0 {
                    // SAFETY: the gap in front of cursor holds at least
                    // MIN_OBJECT_SIZE dead bytes for the new record
                    unsafe {
                        info.write_next_plug_offset(record, cursor - record)?;
                        info.write_gap_size(cursor, gap_size)?;
                        info.write_next_plug_offset(cursor, 0)?;
                    }
                    record = cursor;
                    plan.records += 1;
                    gap_size = 0;
                }
                plug_size += size;
            } else {
                if plug_size != 0 {
                    self.finish_plug(space, record, plug_size)?;
                    plan.live_bytes += plug_size;
                    plug_size = 0;

                    let current = bricks.index(cursor);
                    while brick < current {
                        brick += 1;
                        bricks.set_entry(brick, record);
                    }
                }
                gap_size += size;
                plan.gap_bytes += size;
            }
            cursor += size;
        }
        debug_assert_eq!(cursor, top);

        // Objects past the last plug are gone; the region ends there.
        let top = top - gap_size;
        space.region_mut(index).set_top(top);

        if plug_size != 0 {
            self.finish_plug(space, record, plug_size)?;
            plan.live_bytes += plug_size;
        }
        bricks.fill_from(brick + 1, record);

        // The trailing gap is already part of gap_bytes.
        let unused_tail = space.region(index).end() - (top + gap_size);
        plan.fragmentation = plan.gap_bytes + unused_tail;
        let threshold = self.layout.region_size / self.sweep_divisor;
        let sweep = plan.immovable || (plan.fragmentation > 0 && plan.fragmentation < threshold);

        if sweep {
            plan.plan = Plan::Sweep;
            self.reset_to_sweep(space, index)?;
        }
        space.region_mut(index).set_should_sweep(sweep);

        log::debug!(
            "plan region {index}: {:?}, live {} gaps {} fragmentation {} records {}",
            plan.plan,
            plan.live_bytes,
            plan.gap_bytes,
            plan.fragmentation,
            plan.records,
        );
        Ok(plan)
    }

    /// Assigns a destination to the plug at `record` and stores it.
    fn finish_plug(&mut self, space: &Space, record: usize, size: usize) -> Result<(), GcError> {
        let target = self.relocation_pointer(space, size)?;
        log::trace!("plug 0x{record:x} ({size} bytes) -> 0x{target:x}");
        // SAFETY: record carries a record written during this pass
        unsafe { self.info.write_relocation_pointer(record, target) }
    }

    /// Bump allocates `size` destination bytes, moving to the next region
    /// when the current one cannot take the whole plug.
    fn relocation_pointer(&mut self, space: &Space, size: usize) -> Result<usize, GcError> {
        let end = space.region(self.cursor_region).end();
        if self.allocation_pointer + size <= end {
            let target = self.allocation_pointer;
            self.allocation_pointer += size;
            return Ok(target);
        }

        self.cursor_region += 1;
        let region = space
            .regions()
            .get(self.cursor_region)
            .ok_or(GcError::DestinationExhausted { size })?;
        let target = region.objects_start();
        if target + size > region.end() {
            return Err(GcError::DestinationExhausted { size });
        }
        self.allocation_pointer = target + size;
        Ok(target)
    }

    /// Turns region `index` into one that stays where it is: every plug
    /// relocates onto itself, later plugs go after its top and every brick
    /// points at the head of the chain.
    fn reset_to_sweep(&mut self, space: &Space, index: usize) -> Result<(), GcError> {
        let region: &Region = space.region(index);
        // SAFETY: the chain was just written by plan_region
        for record in unsafe { self.info.records(region) } {
            // SAFETY: record is part of the chain
            unsafe { self.info.write_relocation_pointer(record, record)? };
        }
        self.cursor_region = index;
        self.allocation_pointer = region.top();
        BrickTable::of(region, &self.layout).fill_from(0, region.objects_start());
        Ok(())
    }
}
