//! A work-list marker that sets [`HeaderFlags::MARKED`] on everything in a
//! space reachable from roots and image heap objects.
//!
//! [`HeaderFlags::MARKED`]: object::HeaderFlags::MARKED

use object::{Value, header, walk_references};

use crate::{RootProvider, image::ImageHeap, space::Space};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MarkStats {
    pub objects: usize,
    pub bytes: usize,
}

pub struct Marker<'a> {
    space: &'a Space,
    stack: Vec<usize>,
    stats: MarkStats,
}

impl<'a> Marker<'a> {
    pub fn new(space: &'a Space) -> Self {
        Self {
            space,
            stack: Vec::new(),
            stats: MarkStats::default(),
        }
    }

    pub fn stats(&self) -> MarkStats {
        self.stats
    }

    /// Marks the referent of `value` and queues it if it was not marked yet.
    /// References must point at object starts.
    pub fn mark_value(&mut self, value: Value) {
        if !value.is_ref() || !self.space.contains(value.addr()) {
            return;
        }
        let obj = value.addr();
        // SAFETY: references into the space point at object headers
        let header = unsafe { header(obj as *const u8) };
        debug_assert!(header.is_valid(), "reference 0x{obj:x} is not an object");
        if header.try_mark() {
            self.stats.objects += 1;
            self.stats.bytes += header.size();
            self.stack.push(obj);
        }
    }

    pub fn mark_roots(&mut self, roots: &mut dyn RootProvider) {
        roots.visit_roots(&mut |root| self.mark_value(*root));
    }

    /// Treats every reference held by an image object as a root.
    pub fn mark_image_heap(&mut self, image: &ImageHeap) {
        // SAFETY: image objects are always parsable
        unsafe {
            image.walk_objects(|obj| {
                walk_references(obj as *mut u8, |slot| self.mark_value(slot.read()));
            })
        };
    }

    /// Traces until the work list is empty.
    pub fn drain(&mut self) {
        while let Some(obj) = self.stack.pop() {
            // SAFETY: only marked objects of the space are queued
            unsafe {
                walk_references(obj as *mut u8, |slot| self.mark_value(slot.read()));
            }
        }
    }
}

/// Marks everything reachable from `roots` and `image`.
pub fn mark_from_roots(
    space: &Space,
    roots: &mut dyn RootProvider,
    image: Option<&ImageHeap>,
) -> MarkStats {
    let mut marker = Marker::new(space);
    marker.mark_roots(roots);
    if let Some(image) = image {
        marker.mark_image_heap(image);
    }
    marker.drain();
    log::debug!(
        "marked {} objects ({} bytes)",
        marker.stats().objects,
        marker.stats().bytes
    );
    marker.stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        region::{ChunkProvider, SpaceId},
        settings::RegionLayout,
    };
    use object::{init_slots, slots_allocation_size};
    use std::sync::Arc;

    const REGION: usize = 8192;

    fn space() -> Space {
        let provider = Arc::new(ChunkProvider::new(2 * REGION, REGION).expect("reserve"));
        Space::new(SpaceId(1), provider, RegionLayout::new(REGION, 128, 2), 2048)
    }

    fn alloc(space: &mut Space, fields: usize) -> usize {
        let ptr = space.promote(slots_allocation_size(fields)).expect("promote").as_ptr();
        unsafe { init_slots(ptr, fields) };
        ptr as usize
    }

    fn link(from: usize, index: usize, to: usize) {
        unsafe { (*(from as *const object::Slots)).set_field(index, Value::from_addr(to)) }
    }

    fn marked(obj: usize) -> bool {
        unsafe { header(obj as *const u8) }.is_marked()
    }

    #[test]
    fn marks_transitively_and_handles_cycles() {
        let mut space = space();
        let a = alloc(&mut space, 2);
        let b = alloc(&mut space, 1);
        let garbage = alloc(&mut space, 1);
        let c = alloc(&mut space, 1);
        link(a, 0, b);
        link(b, 0, c);
        link(c, 0, a);
        link(garbage, 0, a);

        let mut roots = vec![Value::from_addr(a), Value::from_i64(3)];
        let stats = mark_from_roots(&space, &mut roots, None);
        assert_eq!(stats.objects, 3);
        assert_eq!(stats.bytes, 24 + 16 + 16);
        assert!(marked(a) && marked(b) && marked(c));
        assert!(!marked(garbage));
    }

    #[test]
    fn image_objects_are_roots() {
        let mut space = space();
        let a = alloc(&mut space, 1);
        let b = alloc(&mut space, 1);
        let mut image = ImageHeap::new(4096, 256).expect("image");
        let holder = image.allocate(16).expect("holder").as_ptr();
        unsafe { init_slots(holder, 1) };
        link(holder as usize, 0, b);

        let mut roots: Vec<Value> = Vec::new();
        mark_from_roots(&space, &mut roots, Some(&image));
        assert!(marked(b));
        assert!(!marked(a));
        assert!(!marked(holder as usize), "image objects are never marked");
    }
}
