use object::{MIN_OBJECT_SIZE, OBJECT_ALIGNMENT};

use crate::{OS_PAGE_SIZE, relocation::FIRST_RECORD_SLOT, system::align_up};

/// Largest region whose brick entries still fit in 16 bits
/// (`offset >> 3 <= u16::MAX`).
pub const MAX_REGION_SIZE: usize = 512 * 1024;

/// How RelocationInfo records are laid out in front of each plug.
///
/// Chosen once per heap; every record in every region uses the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelocationEncoding {
    /// 16 bytes: absolute relocation pointer, 32-bit gap size and
    /// next-plug offset.
    #[default]
    Wide,
    /// 8 bytes: 32-bit self-relative relocation offset, gap size and
    /// next-plug offset as 16-bit multiples of the object alignment.
    Narrow,
}

/// Configuration for the tenured space.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Bytes reserved for aligned regions. Must be a multiple of `region_size`.
    pub heap_size: usize,
    /// Size and alignment of a region. Power of two, at most [`MAX_REGION_SIZE`].
    pub region_size: usize,
    /// Bytes covered by one card table byte. Power of two.
    pub card_size: usize,
    /// Cards per brick. At least 2 so the brick view fits in the card bytes.
    pub brick_cards: usize,
    /// A region is swept instead of compacted when
    /// `0 < fragmentation < region_size / sweep_divisor`.
    pub sweep_divisor: usize,
    /// Objects at or above this size are allocated outside of regions.
    pub large_size: usize,
    pub encoding: RelocationEncoding,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: 67_108_864, // 64 MB
            region_size: 131_072,  // 128 KB = 2^17
            card_size: 512,
            brick_cards: 2,
            sweep_divisor: 16,
            large_size: 32_768, // 32 KB
            encoding: RelocationEncoding::Wide,
        }
    }
}

impl HeapSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size == 0
            || self.region_size == 0
            || self.card_size == 0
            || self.large_size == 0
        {
            return Err("Sizes must be > 0");
        }
        if !self.region_size.is_power_of_two() {
            return Err("region_size must be a power of two");
        }
        if !self.region_size.is_multiple_of(OS_PAGE_SIZE) {
            return Err("region_size must match OS page alignment");
        }
        if self.region_size > MAX_REGION_SIZE {
            return Err("region_size too large for brick entries");
        }
        if !self.heap_size.is_multiple_of(self.region_size) {
            return Err("heap_size must be a multiple of region_size");
        }
        if !self.card_size.is_power_of_two() || self.card_size < OBJECT_ALIGNMENT {
            return Err("card_size must be a power of two >= object alignment");
        }
        if self.card_size >= self.region_size {
            return Err("card_size must be smaller than region_size");
        }
        if self.brick_cards < 2 || !self.brick_cards.is_power_of_two() {
            return Err("brick_cards must be a power of two >= 2");
        }
        if self.sweep_divisor == 0 {
            return Err("sweep_divisor must be > 0");
        }
        if self.large_size < MIN_OBJECT_SIZE {
            return Err("large_size must be at least the minimum object size");
        }
        if self.large_size > self.layout().objects_size() {
            return Err("large_size must fit into a region");
        }
        if self.encoding == RelocationEncoding::Narrow
            && self.heap_size > i32::MAX as usize
        {
            return Err("narrow relocation offsets cannot span the heap");
        }
        Ok(())
    }

    /// The per-region layout these settings produce.
    pub fn layout(&self) -> RegionLayout {
        RegionLayout::new(self.region_size, self.card_size, self.brick_cards)
    }
}

/// Where things live inside every region.
///
/// ```text
/// chunk_start                                  objects_start          end
/// [ card / brick bytes | pad | first record ] [ objects ... top ... ]
/// ```
///
/// The card view needs one byte per card of the whole region; the brick view
/// needs two bytes per brick, and a brick spans at least two cards, so both
/// fit in the same prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub region_size: usize,
    pub objects_start_offset: usize,
    pub card_size: usize,
    pub card_count: usize,
    pub bytes_per_brick: usize,
    pub brick_count: usize,
}

impl RegionLayout {
    pub fn new(region_size: usize, card_size: usize, brick_cards: usize) -> Self {
        let card_count = region_size / card_size;
        let objects_start_offset =
            align_up(card_count, OBJECT_ALIGNMENT) + FIRST_RECORD_SLOT;
        let bytes_per_brick = card_size * brick_cards;
        let objects_size = region_size.saturating_sub(objects_start_offset);
        let brick_count = objects_size.div_ceil(bytes_per_brick);
        debug_assert!(brick_count * size_of::<u16>() <= card_count);

        Self {
            region_size,
            objects_start_offset,
            card_size,
            card_count,
            bytes_per_brick,
            brick_count,
        }
    }

    /// Bytes available for objects in one region.
    #[inline(always)]
    pub fn objects_size(&self) -> usize {
        self.region_size.saturating_sub(self.objects_start_offset)
    }
}
