use std::ptr::NonNull;

use object::object_size;

use crate::{
    OS_PAGE_SIZE,
    system::{self, align_up},
    tables::{CARD_CLEAN, CARD_DIRTY},
};

/// A non-moving area holding objects that exist before the program starts.
///
/// Image objects are never collected or moved but may reference the
/// tenured space, so the collector fixes their references like any root and
/// dirties the card of every holder it touches.
#[derive(Debug)]
pub struct ImageHeap {
    base: NonNull<u8>,
    size: usize,
    top: usize,
    card_size: usize,
    cards: Box<[u8]>,
}

impl ImageHeap {
    pub fn new(size: usize, card_size: usize) -> Option<Self> {
        debug_assert!(card_size.is_power_of_two());
        let size = align_up(size.max(OS_PAGE_SIZE), OS_PAGE_SIZE);
        let base = system::map_memory(size)?;
        Some(Self {
            base,
            size,
            top: base.as_ptr() as usize,
            card_size,
            cards: vec![CARD_CLEAN; size.div_ceil(card_size)].into_boxed_slice(),
        })
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.top
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        (self.start()..self.top).contains(&addr)
    }

    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let new_top = self.top.checked_add(size)?;
        if new_top > self.end() {
            return None;
        }
        let ptr = self.top as *mut u8;
        self.top = new_top;
        NonNull::new(ptr)
    }

    /// Calls `f` with every image object.
    ///
    /// # Safety
    ///
    /// Every allocation must have been initialized as an object.
    pub unsafe fn walk_objects<F: FnMut(usize)>(&self, mut f: F) {
        let mut cursor = self.start();
        while cursor < self.top {
            f(cursor);
            // SAFETY: contract
            cursor += unsafe { object_size(cursor as *const u8) };
        }
    }

    #[inline(always)]
    fn card_index(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr), "0x{addr:x} is not an image object");
        (addr - self.start()) / self.card_size
    }

    pub fn dirty_card(&mut self, addr: usize) {
        let index = self.card_index(addr);
        self.cards[index] = CARD_DIRTY;
    }

    pub fn is_card_dirty(&self, addr: usize) -> bool {
        self.cards[self.card_index(addr)] == CARD_DIRTY
    }

    pub fn clear_cards(&mut self) {
        self.cards.fill(CARD_CLEAN);
    }

    pub fn dirty_count(&self) -> usize {
        self.cards.iter().filter(|&&card| card == CARD_DIRTY).count()
    }
}

impl Drop for ImageHeap {
    fn drop(&mut self) {
        system::unmap_memory(self.base, self.size);
    }
}
