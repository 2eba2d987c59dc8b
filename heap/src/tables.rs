//! Typed views over the table bytes at the start of every region.
//!
//! Outside of a collection the bytes are a card table; from planning until the
//! remembered set is rebuilt they are a brick table. Both views are plain
//! address arithmetic over memory owned by the region.

use object::OBJECT_ALIGNMENT;

use crate::{region::Region, settings::RegionLayout};

pub const CARD_CLEAN: u8 = 0;
pub const CARD_DIRTY: u8 = 1;

const BRICK_SHIFT: u32 = OBJECT_ALIGNMENT.trailing_zeros();

// ── Card table ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct CardTable {
    table: usize,
    objects_start: usize,
    card_size: usize,
    len: usize,
}

impl CardTable {
    pub fn of(region: &Region, layout: &RegionLayout) -> Self {
        Self {
            table: region.chunk_start(),
            objects_start: region.objects_start(),
            card_size: layout.card_size,
            len: layout.card_count,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn index(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.objects_start);
        let index = (addr - self.objects_start) / self.card_size;
        debug_assert!(index < self.len, "card index {index} out of range");
        index
    }

    #[inline(always)]
    fn byte(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.len);
        (self.table + index) as *mut u8
    }

    #[inline(always)]
    pub fn is_dirty(&self, addr: usize) -> bool {
        // SAFETY: index is within the table prefix of a mapped region
        unsafe { self.byte(self.index(addr)).read() == CARD_DIRTY }
    }

    #[inline(always)]
    pub fn dirty(&self, addr: usize) {
        // SAFETY: index is within the table prefix of a mapped region
        unsafe { self.byte(self.index(addr)).write(CARD_DIRTY) }
    }

    /// Marks every card clean.
    pub fn clear(&self) {
        // SAFETY: the whole table lies in the region prefix
        unsafe { (self.table as *mut u8).write_bytes(CARD_CLEAN, self.len) }
    }

    pub fn dirty_count(&self) -> usize {
        (0..self.len)
            // SAFETY: i < len
            .filter(|&i| unsafe { self.byte(i).read() } == CARD_DIRTY)
            .count()
    }
}

// ── Brick table ───────────────────────────────────────────────────────

/// Maps each brick of a region to the last relocation record starting at or
/// before the brick's end, so lookups can start their chain walk close to
/// the address asked about.
///
/// Entries are 16 bits: `(record - chunk_start) >> 3`.
#[derive(Debug, Clone, Copy)]
pub struct BrickTable {
    chunk_start: usize,
    objects_start: usize,
    bytes_per_brick: usize,
    len: usize,
}

impl BrickTable {
    pub fn of(region: &Region, layout: &RegionLayout) -> Self {
        Self {
            chunk_start: region.chunk_start(),
            objects_start: region.objects_start(),
            bytes_per_brick: layout.bytes_per_brick,
            len: layout.brick_count,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Brick covering `addr`.
    #[inline(always)]
    pub fn index(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.objects_start);
        let index = (addr - self.objects_start) / self.bytes_per_brick;
        debug_assert!(index < self.len, "brick index {index} out of range");
        index
    }

    #[inline(always)]
    fn slot(&self, index: usize) -> *mut u16 {
        debug_assert!(index < self.len);
        (self.chunk_start + index * size_of::<u16>()) as *mut u16
    }

    /// Record address stored for brick `index`.
    #[inline(always)]
    pub fn entry(&self, index: usize) -> usize {
        // SAFETY: index < len, the table lies in the region prefix
        let raw = unsafe { self.slot(index).read() };
        self.chunk_start + ((raw as usize) << BRICK_SHIFT)
    }

    #[inline(always)]
    pub fn set_entry(&self, index: usize, record: usize) {
        debug_assert!(record >= self.chunk_start);
        debug_assert!(record.is_multiple_of(OBJECT_ALIGNMENT));
        let offset = (record - self.chunk_start) >> BRICK_SHIFT;
        debug_assert!(offset <= u16::MAX as usize, "brick entry overflow");
        // SAFETY: index < len, the table lies in the region prefix
        unsafe { self.slot(index).write(offset as u16) };
        debug_assert_eq!(self.entry(index), record);
    }

    /// Points every brick from `from` on at `record`.
    pub fn fill_from(&self, from: usize, record: usize) {
        for index in from..self.len {
            self.set_entry(index, record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{ChunkProvider, SpaceId};

    const REGION: usize = 8192;

    fn with_region(f: impl FnOnce(&Region, &RegionLayout)) {
        let provider = ChunkProvider::new(REGION, REGION).expect("reserve");
        let layout = RegionLayout::new(REGION, 128, 2);
        let region = Region::new(provider.produce().expect("chunk"), &layout, SpaceId(0));
        f(&region, &layout);
    }

    #[test]
    fn cards_dirty_and_clear() {
        with_region(|region, layout| {
            let cards = CardTable::of(region, layout);
            let a = region.objects_start();
            let b = a + 3 * layout.card_size + 8;
            assert!(!cards.is_dirty(a));

            cards.dirty(a);
            cards.dirty(b);
            cards.dirty(b + 8);
            assert!(cards.is_dirty(a));
            assert!(cards.is_dirty(b));
            assert!(!cards.is_dirty(a + layout.card_size));
            assert_eq!(cards.dirty_count(), 2);

            cards.clear();
            assert_eq!(cards.dirty_count(), 0);
        });
    }

    #[test]
    fn brick_entries_round_trip_any_record_address() {
        with_region(|region, layout| {
            let bricks = BrickTable::of(region, layout);
            let first = region.objects_start();
            let last = region.end() - OBJECT_ALIGNMENT;
            bricks.set_entry(0, first);
            bricks.set_entry(bricks.len() - 1, last);
            assert_eq!(bricks.entry(0), first);
            assert_eq!(bricks.entry(bricks.len() - 1), last);
        });
    }

    #[test]
    fn brick_index_covers_objects_area() {
        with_region(|region, layout| {
            let bricks = BrickTable::of(region, layout);
            assert_eq!(bricks.index(region.objects_start()), 0);
            assert_eq!(
                bricks.index(region.objects_start() + layout.bytes_per_brick),
                1
            );
            assert_eq!(bricks.index(region.end() - 8), bricks.len() - 1);
        });
    }

    #[test]
    fn fill_from_rewrites_tail_only() {
        with_region(|region, layout| {
            let bricks = BrickTable::of(region, layout);
            let a = region.objects_start();
            let b = a + 512;
            bricks.fill_from(0, a);
            bricks.fill_from(3, b);
            assert_eq!(bricks.entry(2), a);
            assert_eq!(bricks.entry(3), b);
            assert_eq!(bricks.entry(bricks.len() - 1), b);
        });
    }
}
