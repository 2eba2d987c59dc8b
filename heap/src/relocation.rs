//! Relocation records.
//!
//! The planner splits each region into alternating gaps (dead objects) and
//! plugs (runs of live objects). Every plug carries one record that lives in
//! the bytes right before the plug's first object, which is either inside the
//! preceding gap or, for the first plug, in the reserved slot in front of
//! `objects_start`:
//!
//! ```text
//! wide   [p-16: relocation pointer u64][p-8: gap size u32][p-4: next offset u32]
//! narrow [p-8:  relocation offset i32 ][p-4: gap/8 u16   ][p-2: next/8 u16    ]
//! ```
//!
//! `gap size` is the gap right before the plug, `next offset` is the distance
//! to the next record (0 at the end of the chain) and the relocation pointer
//! is where the plug's first byte goes. The narrow relocation offset is
//! relative to `p`.

use std::fmt;

use object::{OBJECT_ALIGNMENT, object_size};

use crate::{
    error::GcError,
    region::Region,
    settings::{RegionLayout, RelocationEncoding},
    tables::BrickTable,
};

/// Bytes reserved in front of `objects_start` for the first plug's record.
pub const FIRST_RECORD_SLOT: usize = 16;

/// Reads and writes relocation records in the selected encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationInfo {
    encoding: RelocationEncoding,
}

impl RelocationInfo {
    pub const fn new(encoding: RelocationEncoding) -> Self {
        Self { encoding }
    }

    #[inline(always)]
    pub const fn encoding(&self) -> RelocationEncoding {
        self.encoding
    }

    /// Bytes a record occupies in front of its plug.
    #[inline(always)]
    pub const fn record_size(&self) -> usize {
        match self.encoding {
            RelocationEncoding::Wide => 16,
            RelocationEncoding::Narrow => 8,
        }
    }

    // ── relocation pointer ────────────────────────────────────────────

    /// # Safety
    ///
    /// `p` must be the 8-aligned address of a plug and the record bytes in
    /// front of it must be writable.
    pub unsafe fn write_relocation_pointer(&self, p: usize, target: usize) -> Result<(), GcError> {
        match self.encoding {
            RelocationEncoding::Wide => {
                // SAFETY: contract
                unsafe { ((p - 16) as *mut usize).write(target) }
            }
            RelocationEncoding::Narrow => {
                let offset = target as i64 - p as i64;
                let narrow = i32::try_from(offset).map_err(|_| GcError::RecordOverflow {
                    field: "relocation offset",
                    value: offset,
                })?;
                // SAFETY: contract
                unsafe { ((p - 8) as *mut i32).write(narrow) }
            }
        }
        // SAFETY: just written
        debug_assert_eq!(unsafe { self.read_relocation_pointer(p) }, target);
        Ok(())
    }

    /// # Safety
    ///
    /// `p` must carry a record.
    #[inline(always)]
    pub unsafe fn read_relocation_pointer(&self, p: usize) -> usize {
        match self.encoding {
            // SAFETY: contract
            RelocationEncoding::Wide => unsafe { ((p - 16) as *const usize).read() },
            RelocationEncoding::Narrow => {
                // SAFETY: contract
                let offset = unsafe { ((p - 8) as *const i32).read() };
                (p as isize + offset as isize) as usize
            }
        }
    }

    // ── gap size ──────────────────────────────────────────────────────

    /// # Safety
    ///
    /// See [`RelocationInfo::write_relocation_pointer`].
    pub unsafe fn write_gap_size(&self, p: usize, gap: usize) -> Result<(), GcError> {
        debug_assert!(gap.is_multiple_of(OBJECT_ALIGNMENT));
        // SAFETY: contract
        unsafe { self.write_small(p, 8, "gap size", gap)? };
        // SAFETY: just written
        debug_assert_eq!(unsafe { self.read_gap_size(p) }, gap);
        Ok(())
    }

    /// # Safety
    ///
    /// `p` must carry a record.
    #[inline(always)]
    pub unsafe fn read_gap_size(&self, p: usize) -> usize {
        // SAFETY: contract
        unsafe { self.read_small(p, 8) }
    }

    // ── next plug offset ──────────────────────────────────────────────

    /// # Safety
    ///
    /// See [`RelocationInfo::write_relocation_pointer`].
    pub unsafe fn write_next_plug_offset(&self, p: usize, offset: usize) -> Result<(), GcError> {
        debug_assert!(offset.is_multiple_of(OBJECT_ALIGNMENT));
        // SAFETY: contract
        unsafe { self.write_small(p, 4, "next plug offset", offset)? };
        // SAFETY: just written
        debug_assert_eq!(unsafe { self.read_next_plug_offset(p) }, offset);
        Ok(())
    }

    /// # Safety
    ///
    /// `p` must carry a record.
    #[inline(always)]
    pub unsafe fn read_next_plug_offset(&self, p: usize) -> usize {
        // SAFETY: contract
        unsafe { self.read_small(p, 4) }
    }

    /// Address of the next record in the chain.
    ///
    /// # Safety
    ///
    /// `p` must carry a record.
    #[inline(always)]
    pub unsafe fn next_plug(&self, p: usize) -> Option<usize> {
        // SAFETY: contract
        match unsafe { self.read_next_plug_offset(p) } {
            0 => None,
            offset => Some(p + offset),
        }
    }

    /// Writes a complete record.
    ///
    /// # Safety
    ///
    /// See [`RelocationInfo::write_relocation_pointer`].
    pub unsafe fn write(&self, p: usize, target: usize, gap: usize, next_offset: usize) -> Result<(), GcError> {
        // SAFETY: contract forwarded
        unsafe {
            self.write_relocation_pointer(p, target)?;
            self.write_gap_size(p, gap)?;
            self.write_next_plug_offset(p, next_offset)
        }
    }

    // The two size fields share a layout: a u32 each in wide records, a
    // u16 count of alignment units each in narrow ones. `wide_back` is the
    // distance of the wide field from `p`.
    #[inline(always)]
    unsafe fn write_small(&self, p: usize, wide_back: usize, field: &'static str, value: usize) -> Result<(), GcError> {
        let overflow = || GcError::RecordOverflow {
            field,
            value: value as i64,
        };
        match self.encoding {
            RelocationEncoding::Wide => {
                let raw = u32::try_from(value).map_err(|_| overflow())?;
                // SAFETY: caller guarantees the record bytes are writable
                unsafe { ((p - wide_back) as *mut u32).write(raw) }
            }
            RelocationEncoding::Narrow => {
                let raw = u16::try_from(value / OBJECT_ALIGNMENT).map_err(|_| overflow())?;
                // SAFETY: caller guarantees the record bytes are writable
                unsafe { ((p - wide_back / 2) as *mut u16).write(raw) }
            }
        }
        Ok(())
    }

    #[inline(always)]
    unsafe fn read_small(&self, p: usize, wide_back: usize) -> usize {
        match self.encoding {
            // SAFETY: caller guarantees a record at p
            RelocationEncoding::Wide => unsafe { ((p - wide_back) as *const u32).read() as usize },
            RelocationEncoding::Narrow => {
                // SAFETY: caller guarantees a record at p
                let raw = unsafe { ((p - wide_back / 2) as *const u16).read() };
                raw as usize * OBJECT_ALIGNMENT
            }
        }
    }

    // ── chain walks ───────────────────────────────────────────────────

    /// Iterates the record chain of a planned region, starting at
    /// `objects_start`. The next link is read before a record is yielded,
    /// so callers may overwrite the record they were handed.
    ///
    /// # Safety
    ///
    /// The region must have been planned and its records left intact up to
    /// the point the iterator reaches them.
    pub unsafe fn records(&self, region: &Region) -> Records {
        Records {
            info: *self,
            next: Some(region.objects_start()),
        }
    }

    /// End of the plug starting at record `p`: the start of the next gap, or
    /// `top` for the last plug.
    ///
    /// # Safety
    ///
    /// `p` must carry a record.
    #[inline(always)]
    pub unsafe fn plug_end(&self, p: usize, top: usize) -> usize {
        // SAFETY: contract
        unsafe {
            match self.next_plug(p) {
                Some(next) => next - self.read_gap_size(next),
                None => top,
            }
        }
    }

    /// Calls `f` with every live object of a planned region, jumping over
    /// gaps through the record chain. Dead objects are never parsed; their
    /// headers may already be covered by records.
    ///
    /// # Safety
    ///
    /// See [`RelocationInfo::records`]. Plug contents must be intact.
    pub unsafe fn walk_live_objects<F: FnMut(usize)>(&self, region: &Region, mut f: F) {
        let top = region.top();
        // SAFETY: contract forwarded
        for record in unsafe { self.records(region) } {
            // SAFETY: record is part of the chain
            let end = unsafe { self.plug_end(record, top) };
            let mut cursor = record;
            while cursor < end {
                f(cursor);
                // SAFETY: cursor is a live object inside the plug
                cursor += unsafe { object_size(cursor as *const u8) };
            }
            debug_assert_eq!(cursor, end, "plug does not end on an object boundary");
        }
    }

    /// The post-compaction address of `addr`, which may point into the
    /// middle of an object. `None` if `addr` lies in a gap or past `top`.
    ///
    /// # Safety
    ///
    /// The region must have been planned and not yet relocated.
    pub unsafe fn relocated_pointer(&self, region: &Region, layout: &RegionLayout, addr: usize) -> Option<usize> {
        if addr >= region.top() || addr < region.objects_start() {
            return None;
        }

        let bricks = BrickTable::of(region, layout);
        let mut record = bricks.entry(bricks.index(addr));
        if record > addr {
            return None;
        }

        // SAFETY: brick entries only ever point at records
        unsafe {
            let mut next = self.next_plug(record);
            while let Some(candidate) = next {
                if candidate > addr {
                    break;
                }
                record = candidate;
                next = self.next_plug(candidate);
            }

            if let Some(next) = next
                && next - self.read_gap_size(next) <= addr
            {
                return None;
            }

            Some(self.read_relocation_pointer(record) + (addr - record))
        }
    }

    /// The record and brick state a lookup of `addr` sees: the brick entry
    /// covering it, the last record at or before it and that record's
    /// fields.
    ///
    /// # Safety
    ///
    /// The region must have been planned and not yet relocated.
    pub unsafe fn chain_state(&self, region: &Region, layout: &RegionLayout, addr: usize) -> ChainState {
        let bricks = BrickTable::of(region, layout);
        let brick_entry = (addr >= region.objects_start() && addr < region.end())
            .then(|| bricks.entry(bricks.index(addr)));
        let mut record = brick_entry
            .filter(|&entry| entry <= addr)
            .unwrap_or(region.objects_start());

        // SAFETY: contract
        unsafe {
            while let Some(next) = self.next_plug(record)
                && next <= addr
            {
                record = next;
            }
            ChainState {
                top: region.top(),
                brick_entry,
                record,
                relocation_pointer: self.read_relocation_pointer(record),
                gap_size: self.read_gap_size(record),
                next_plug_offset: self.read_next_plug_offset(record),
            }
        }
    }
}

/// Snapshot taken by [`RelocationInfo::chain_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainState {
    pub top: usize,
    /// `None` when the address is outside the region's object area.
    pub brick_entry: Option<usize>,
    pub record: usize,
    pub relocation_pointer: usize,
    pub gap_size: usize,
    pub next_plug_offset: usize,
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record 0x{:x} (relocation 0x{:x}, gap {}, next {}), ",
            self.record, self.relocation_pointer, self.gap_size, self.next_plug_offset
        )?;
        match self.brick_entry {
            Some(entry) => write!(f, "brick entry 0x{entry:x}, ")?,
            None => write!(f, "no brick, ")?,
        }
        write!(f, "top 0x{:x}", self.top)
    }
}

/// See [`RelocationInfo::records`].
#[derive(Debug)]
pub struct Records {
    info: RelocationInfo,
    next: Option<usize>,
}

impl Iterator for Records {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let record = self.next?;
        // SAFETY: guaranteed by the caller of `RelocationInfo::records`
        self.next = unsafe { self.info.next_plug(record) };
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{TestResult, quickcheck};

    const ENCODINGS: [RelocationEncoding; 2] =
        [RelocationEncoding::Wide, RelocationEncoding::Narrow];

    /// A record address with 16 writable bytes in front of it.
    fn record_slot(buf: &mut [u64]) -> usize {
        buf.as_mut_ptr() as usize + 16
    }

    #[test]
    fn record_sizes() {
        assert_eq!(RelocationInfo::new(RelocationEncoding::Wide).record_size(), 16);
        assert_eq!(RelocationInfo::new(RelocationEncoding::Narrow).record_size(), 8);
        assert!(FIRST_RECORD_SLOT >= 16);
    }

    #[test]
    fn fields_do_not_clobber_each_other() {
        for encoding in ENCODINGS {
            let info = RelocationInfo::new(encoding);
            let mut buf = [0u64; 4];
            let p = record_slot(&mut buf);
            unsafe {
                info.write(p, p - 4096, 640, 1024).expect("fits");
                assert_eq!(info.read_relocation_pointer(p), p - 4096);
                assert_eq!(info.read_gap_size(p), 640);
                assert_eq!(info.read_next_plug_offset(p), 1024);
                assert_eq!(info.next_plug(p), Some(p + 1024));

                info.write_next_plug_offset(p, 0).expect("fits");
                assert_eq!(info.next_plug(p), None);
                assert_eq!(info.read_gap_size(p), 640);
                assert_eq!(info.read_relocation_pointer(p), p - 4096);
            }
            // Nothing at or after p is touched.
            assert_eq!(buf[2], 0);
        }
    }

    #[test]
    fn narrow_records_stay_within_eight_bytes() {
        let info = RelocationInfo::new(RelocationEncoding::Narrow);
        let mut buf = [0u64; 4];
        let p = record_slot(&mut buf);
        unsafe { info.write(p, p + 8, 8, 8).expect("fits") };
        assert_eq!(buf[0], 0, "narrow record must not reach p-16");
    }

    #[test]
    fn narrow_overflow_is_reported() {
        let info = RelocationInfo::new(RelocationEncoding::Narrow);
        let mut buf = [0u64; 4];
        let p = record_slot(&mut buf);
        let err = unsafe { info.write_gap_size(p, (u16::MAX as usize + 1) * 8) };
        assert!(matches!(err, Err(GcError::RecordOverflow { field: "gap size", .. })));

        let far = p.wrapping_add(1 << 40);
        let err = unsafe { info.write_relocation_pointer(p, far) };
        assert!(matches!(err, Err(GcError::RecordOverflow { .. })));
    }

    #[test]
    fn wide_fields_round_trip() {
        fn prop(target: u64, gap: u32, next: u32) -> TestResult {
            let gap = (gap as usize) & !7;
            let next = (next as usize) & !7;
            let info = RelocationInfo::new(RelocationEncoding::Wide);
            let mut buf = [0u64; 4];
            let p = record_slot(&mut buf);
            let target = target as usize;
            unsafe {
                if info.write(p, target, gap, next).is_err() {
                    return TestResult::failed();
                }
                TestResult::from_bool(
                    info.read_relocation_pointer(p) == target
                        && info.read_gap_size(p) == gap
                        && info.read_next_plug_offset(p) == next,
                )
            }
        }
        quickcheck(prop as fn(u64, u32, u32) -> TestResult);
    }

    #[test]
    fn narrow_fields_round_trip() {
        fn prop(offset: i32, gap: u16, next: u16) -> TestResult {
            let offset = (offset as isize) & !7;
            let gap = gap as usize * 8;
            let next = next as usize * 8;
            let info = RelocationInfo::new(RelocationEncoding::Narrow);
            let mut buf = [0u64; 4];
            let p = record_slot(&mut buf);
            let target = (p as isize).wrapping_add(offset) as usize;
            unsafe {
                if info.write(p, target, gap, next).is_err() {
                    return TestResult::failed();
                }
                TestResult::from_bool(
                    info.read_relocation_pointer(p) == target
                        && info.read_gap_size(p) == gap
                        && info.read_next_plug_offset(p) == next,
                )
            }
        }
        quickcheck(prop as fn(i32, u16, u16) -> TestResult);
    }
}
