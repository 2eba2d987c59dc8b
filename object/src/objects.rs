use crate::Value;
use crate::header::{Header, ObjectType};

/// Every object starts and ends on this boundary.
pub const OBJECT_ALIGNMENT: usize = 8;
pub const HEADER_SIZE: usize = size_of::<Header>();
/// Smallest object the heap ever holds. Any run of dead objects is at least
/// this large, which leaves room for relocation metadata inside it.
pub const MIN_OBJECT_SIZE: usize = 16;

#[inline(always)]
pub const fn align_object(size: usize) -> usize {
    (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

// ── Slots ──────────────────────────────────────────────────────────

/// An object whose body is a vector of tagged fields.
///
/// ```text
/// [Header 8B] [field_0 8B] [field_1 8B] ...
/// ```
///
/// A slots object always has at least one field so that it reaches
/// [`MIN_OBJECT_SIZE`].
#[repr(C)]
pub struct Slots {
    pub header: Header,
}

impl Slots {
    pub const FIELDS_OFFSET: usize = HEADER_SIZE;

    #[inline(always)]
    pub fn field_count(&self) -> usize {
        (self.header.size() - Self::FIELDS_OFFSET) / size_of::<Value>()
    }

    /// # Safety
    ///
    /// `self` must be followed by `field_count()` initialized fields.
    #[inline(always)]
    pub unsafe fn field_ptr(&self, index: usize) -> *mut Value {
        debug_assert!(index < self.field_count());
        let base = self as *const Self as *mut u8;
        // SAFETY: index is within the object per contract
        let field = unsafe { base.add(Self::FIELDS_OFFSET + index * size_of::<Value>()) };
        field as *mut Value
    }

    /// # Safety
    ///
    /// See [`Slots::field_ptr`].
    #[inline(always)]
    pub unsafe fn field(&self, index: usize) -> Value {
        // SAFETY: contract forwarded
        unsafe { self.field_ptr(index).read() }
    }

    /// # Safety
    ///
    /// See [`Slots::field_ptr`].
    #[inline(always)]
    pub unsafe fn set_field(&self, index: usize, value: Value) {
        // SAFETY: contract forwarded
        unsafe { self.field_ptr(index).write(value) }
    }
}

/// Allocation size of a slots object with `field_count` fields.
pub const fn slots_allocation_size(field_count: usize) -> usize {
    let fields = if field_count == 0 { 1 } else { field_count };
    Slots::FIELDS_OFFSET + fields * size_of::<Value>()
}

// ── Bytes ──────────────────────────────────────────────────────────

/// Opaque payload object. Never contains references.
///
/// ```text
/// [Header 8B] [len 8B] [payload len bytes, padded to 8]
/// ```
#[repr(C)]
pub struct Bytes {
    pub header: Header,
    pub len: u64,
}

const _: () = assert!(size_of::<Bytes>() == MIN_OBJECT_SIZE);

impl Bytes {
    pub const PAYLOAD_OFFSET: usize = size_of::<Bytes>();

    /// # Safety
    ///
    /// `self` must be followed by `len` payload bytes.
    #[inline(always)]
    pub unsafe fn payload(&self) -> &[u8] {
        let base = self as *const Self as *const u8;
        // SAFETY: the payload follows the fixed part per contract
        unsafe {
            std::slice::from_raw_parts(
                base.add(Self::PAYLOAD_OFFSET),
                self.len as usize,
            )
        }
    }

    /// # Safety
    ///
    /// See [`Bytes::payload`]; no other reference to the payload may exist.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut(&self) -> &mut [u8] {
        let base = self as *const Self as *mut u8;
        // SAFETY: the payload follows the fixed part per contract
        unsafe {
            std::slice::from_raw_parts_mut(
                base.add(Self::PAYLOAD_OFFSET),
                self.len as usize,
            )
        }
    }
}

pub const fn bytes_allocation_size(len: usize) -> usize {
    align_object(Bytes::PAYLOAD_OFFSET + len)
}

// ── Raw object access ──────────────────────────────────────────────

/// # Safety
///
/// `obj` must point at an initialized object header.
#[inline(always)]
pub unsafe fn header<'a>(obj: *const u8) -> &'a Header {
    // SAFETY: contract
    unsafe { &*(obj as *const Header) }
}

/// # Safety
///
/// `obj` must point at an initialized object header.
#[inline(always)]
pub unsafe fn object_size(obj: *const u8) -> usize {
    // SAFETY: contract
    unsafe { header(obj) }.size()
}

/// Formats `field_count` fields at `obj`, all set to fixnum zero.
///
/// # Safety
///
/// `obj` must be writable for [`slots_allocation_size`] bytes.
pub unsafe fn init_slots<'a>(obj: *mut u8, field_count: usize) -> &'a Slots {
    let size = slots_allocation_size(field_count);
    // SAFETY: writable per contract
    unsafe {
        (obj as *mut Header).write(Header::new(ObjectType::Slots, size as u32));
        let slots = &*(obj as *const Slots);
        for i in 0..slots.field_count() {
            slots.set_field(i, Value::from_i64(0));
        }
        slots
    }
}

/// # Safety
///
/// `obj` must be writable for [`bytes_allocation_size`] bytes.
pub unsafe fn init_bytes<'a>(obj: *mut u8, len: usize) -> &'a Bytes {
    let size = bytes_allocation_size(len);
    // SAFETY: writable per contract
    unsafe {
        (obj as *mut Header).write(Header::new(ObjectType::Bytes, size as u32));
        (obj.add(HEADER_SIZE) as *mut u64).write(len as u64);
        obj.add(Bytes::PAYLOAD_OFFSET).write_bytes(0, size - Bytes::PAYLOAD_OFFSET);
        &*(obj as *const Bytes)
    }
}

/// Turns `size` bytes of dead memory into a single filler object so that
/// linear heap walks can step over it.
///
/// # Safety
///
/// `obj` must be writable for at least a header.
pub unsafe fn init_filler(obj: *mut u8, size: usize) {
    debug_assert!(size >= MIN_OBJECT_SIZE, "filler too small: {size}");
    debug_assert!(size.is_multiple_of(OBJECT_ALIGNMENT));
    debug_assert!(size <= u32::MAX as usize);
    // SAFETY: writable per contract
    unsafe {
        (obj as *mut Header).write(Header::new(ObjectType::Filler, size as u32));
    }
}

/// Calls `visitor` with the address of every reference field of `obj`.
///
/// Fixnum fields are skipped; the visitor may rewrite the slot in place.
///
/// # Safety
///
/// `obj` must point at a valid, initialized object.
#[inline(always)]
pub unsafe fn walk_references<F>(obj: *mut u8, mut visitor: F)
where
    F: FnMut(*mut Value),
{
    // SAFETY: contract
    let header = unsafe { header(obj) };
    if header.object_type() != ObjectType::Slots {
        return;
    }
    // SAFETY: object type checked above
    let slots = unsafe { &*(obj as *const Slots) };
    for i in 0..slots.field_count() {
        // SAFETY: i < field_count
        let slot = unsafe { slots.field_ptr(i) };
        // SAFETY: slot is initialized
        if unsafe { slot.read() }.is_ref() {
            visitor(slot);
        }
    }
}
