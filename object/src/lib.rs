mod header;
mod objects;
mod value;

pub use header::{Header, HeaderFlags, ObjectType};
pub use objects::{
    Bytes, HEADER_SIZE, MIN_OBJECT_SIZE, OBJECT_ALIGNMENT, Slots, align_object,
    bytes_allocation_size, header, init_bytes, init_filler, init_slots,
    object_size, slots_allocation_size, walk_references,
};
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;

    /// 8-byte aligned scratch memory for laying out objects.
    fn scratch(words: usize) -> Vec<u64> {
        vec![0u64; words]
    }

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn fixnum_round_trip() {
        for &n in &[0i64, 1, -1, 42, -42, i64::MAX >> 2, i64::MIN >> 2] {
            let v = Value::from_i64(n);
            assert!(v.is_fixnum());
            assert!(!v.is_ref());
            assert!(!v.is_header());
            assert_eq!(unsafe { v.to_i64() }, n);
        }
    }

    #[test]
    fn ref_tagging() {
        let dummy: u64 = 0;
        let ptr = &dummy as *const u64;
        let v = Value::from_ptr(ptr);
        assert!(v.is_ref());
        assert!(!v.is_fixnum());
        assert!(!v.is_header());
        assert_eq!(v.addr(), ptr as usize);
    }

    #[test]
    fn header_tag_detected() {
        let hdr = Header::new(ObjectType::Slots, 16);
        let raw = unsafe { *((&hdr) as *const Header as *const u64) };
        let v = Value::from_raw(raw);
        assert!(v.is_header());
        assert!(!v.is_fixnum());
        assert!(!v.is_ref());
    }

    // ── Header ─────────────────────────────────────────────────────

    #[test]
    fn header_type_and_size() {
        for (i, &ty) in [ObjectType::Filler, ObjectType::Slots, ObjectType::Bytes]
            .iter()
            .enumerate()
        {
            let h = Header::new(ty, 48);
            assert!(h.is_valid());
            assert_eq!(h.object_type(), ty, "type mismatch at index {i}");
            assert_eq!(h.size(), 48);
        }
    }

    #[test]
    fn header_flags() {
        let h = Header::new(ObjectType::Slots, 16);
        assert!(!h.has_flag(HeaderFlags::PINNED));

        h.add_flag(HeaderFlags::PINNED);
        assert!(h.has_flag(HeaderFlags::PINNED));
        assert!(h.is_immovable());

        h.add_flag(HeaderFlags::REMEMBERED);
        assert!(h.has_flag(HeaderFlags::PINNED));
        assert!(h.has_flag(HeaderFlags::REMEMBERED));

        h.remove_flag(HeaderFlags::PINNED);
        assert!(!h.has_flag(HeaderFlags::PINNED));
        assert!(!h.is_immovable());
        assert!(h.has_flag(HeaderFlags::REMEMBERED));
    }

    #[test]
    fn mark_bit() {
        let h = Header::new(ObjectType::Bytes, 16);
        assert!(!h.is_marked());
        assert!(h.try_mark());
        assert!(!h.try_mark(), "second mark must report already marked");
        assert!(h.is_marked());
        h.clear_mark();
        assert!(!h.is_marked());
    }

    // ── Layouts ────────────────────────────────────────────────────

    #[test]
    fn allocation_sizes() {
        assert_eq!(slots_allocation_size(0), MIN_OBJECT_SIZE);
        assert_eq!(slots_allocation_size(1), 16);
        assert_eq!(slots_allocation_size(3), 32);
        assert_eq!(bytes_allocation_size(0), 16);
        assert_eq!(bytes_allocation_size(1), 24);
        assert_eq!(bytes_allocation_size(8), 24);
        assert_eq!(bytes_allocation_size(9), 32);
    }

    #[test]
    fn slots_fields_start_as_fixnums() {
        let mut mem = scratch(4);
        let obj = mem.as_mut_ptr() as *mut u8;
        let slots = unsafe { init_slots(obj, 3) };
        assert_eq!(slots.field_count(), 3);
        assert_eq!(unsafe { object_size(obj) }, 32);
        for i in 0..3 {
            assert_eq!(unsafe { slots.field(i) }, Value::from_i64(0));
        }
    }

    #[test]
    fn bytes_payload_is_zeroed_and_sized() {
        let mut mem = scratch(4);
        let obj = mem.as_mut_ptr() as *mut u8;
        let bytes = unsafe { init_bytes(obj, 11) };
        unsafe {
            assert_eq!(bytes.payload(), &[0u8; 11]);
            bytes.payload_mut()[3] = 7;
            assert_eq!(bytes.payload()[3], 7);
            assert_eq!(object_size(obj), 32);
        }
    }

    #[test]
    fn filler_spans_requested_size() {
        let mut mem = scratch(8);
        let obj = mem.as_mut_ptr() as *mut u8;
        unsafe { init_filler(obj, 64) };
        let h = unsafe { header(obj) };
        assert_eq!(h.object_type(), ObjectType::Filler);
        assert_eq!(h.size(), 64);
    }

    #[test]
    fn walk_references_skips_fixnums_and_allows_rewrite() {
        let mut target = scratch(2);
        let target_ptr = target.as_mut_ptr() as *mut u8;
        unsafe { init_slots(target_ptr, 1) };

        let mut mem = scratch(4);
        let obj = mem.as_mut_ptr() as *mut u8;
        let slots = unsafe { init_slots(obj, 3) };
        unsafe {
            slots.set_field(0, Value::from_ptr(target_ptr));
            slots.set_field(1, Value::from_i64(9));
            slots.set_field(2, Value::from_ptr(target_ptr));
        }

        let mut seen = 0;
        unsafe {
            walk_references(obj, |slot| {
                seen += 1;
                *slot = Value::from_addr((*slot).addr() + 8);
            })
        };
        assert_eq!(seen, 2);
        assert_eq!(unsafe { slots.field(0) }.addr(), target_ptr as usize + 8);
        assert_eq!(unsafe { slots.field(1) }, Value::from_i64(9));
    }

    #[test]
    fn walk_references_ignores_bytes_and_fillers() {
        let mut mem = scratch(4);
        let obj = mem.as_mut_ptr() as *mut u8;
        unsafe { init_bytes(obj, 16) };
        let mut seen = 0;
        unsafe { walk_references(obj, |_| seen += 1) };
        assert_eq!(seen, 0);
    }
}
