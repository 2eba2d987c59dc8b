use std::sync::atomic::{AtomicU8, Ordering};

/// Object type tag stored in bits 2..7 of the header's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    /// Dead space formatted as an object so heap walks can step over it.
    Filler = 0,
    /// Every word after the header is a [`Value`](crate::Value) field.
    Slots,
    /// Opaque payload, never scanned.
    Bytes,
}

impl ObjectType {
    pub const COUNT: usize = Self::Bytes as usize + 1;
}

/// GC / bookkeeping flags stored atomically in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HeaderFlags(pub u8);

impl HeaderFlags {
    pub const NONE: Self = Self(0);
    /// Set by the mark phase, cleared by planning.
    pub const MARKED: Self = Self(1 << 0);
    /// The object lives in a region whose card table tracks its stores.
    pub const REMEMBERED: Self = Self(1 << 1);
    /// The identity hash was derived from the current address.
    pub const IDENTITY_HASH: Self = Self(1 << 2);
    /// The object must not move.
    pub const PINNED: Self = Self(1 << 3);

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline(always)]
    pub const fn intersects(self, flag: Self) -> bool {
        self.0 & flag.0 != 0
    }

    #[inline(always)]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    #[inline(always)]
    pub const fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }
}

const HEADER_TAG: u8 = 0b11;

/// The 8-byte header at the start of every heap object.
///
/// ```text
/// byte 0:    [tag:2 = 0b11] [object_type:6]
/// byte 1:    flags (atomic): Marked, Remembered, IdentityHash, Pinned
/// bytes 2‥3: reserved (zero)
/// bytes 4‥7: total object size in bytes, header included
/// ```
///
/// On little-endian systems, reading these 8 bytes as a `u64` yields a
/// value whose low 2 bits are `0b11`, which [`Value::is_header`] detects.
///
/// [`Value::is_header`]: crate::Value::is_header
#[repr(C)]
pub struct Header {
    tag_and_type: u8,
    flags: AtomicU8,
    _reserved: [u8; 2],
    size: u32,
}

const _: () = assert!(size_of::<Header>() == 8);

impl Header {
    pub fn new(object_type: ObjectType, size: u32) -> Self {
        Self {
            tag_and_type: ((object_type as u8) << 2) | HEADER_TAG,
            flags: AtomicU8::new(0),
            _reserved: [0; 2],
            size,
        }
    }

    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.tag_and_type & 0b11 == HEADER_TAG
            && ((self.tag_and_type >> 2) as usize) < ObjectType::COUNT
    }

    #[inline(always)]
    pub fn object_type(&self) -> ObjectType {
        let raw = self.tag_and_type >> 2;
        debug_assert!((raw as usize) < ObjectType::COUNT);
        // SAFETY: headers are only created through `Header::new`
        unsafe { core::mem::transmute::<u8, ObjectType>(raw) }
    }

    /// Total size of the object in bytes, header included.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    // ── flags ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags(self.flags.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn set_flags(&self, flags: HeaderFlags) {
        self.flags.store(flags.0, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: HeaderFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline(always)]
    pub fn add_flag(&self, flag: HeaderFlags) {
        self.flags.fetch_or(flag.0, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn remove_flag(&self, flag: HeaderFlags) {
        self.flags.fetch_and(!flag.0, Ordering::Relaxed);
    }

    /// Atomically OR flags and return the *previous* flags value.
    #[inline(always)]
    pub fn fetch_or_flags(&self, flag: HeaderFlags) -> HeaderFlags {
        HeaderFlags(self.flags.fetch_or(flag.0, Ordering::Relaxed))
    }

    // ── mark bit ───────────────────────────────────────────────────

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.has_flag(HeaderFlags::MARKED)
    }

    /// Sets the mark bit. Returns `true` if the object was not marked before.
    #[inline(always)]
    pub fn try_mark(&self) -> bool {
        !self.fetch_or_flags(HeaderFlags::MARKED).contains(HeaderFlags::MARKED)
    }

    #[inline(always)]
    pub fn clear_mark(&self) {
        self.remove_flag(HeaderFlags::MARKED);
    }

    /// Whether the object has to stay at its current address.
    #[inline(always)]
    pub fn is_immovable(&self) -> bool {
        self.flags()
            .intersects(HeaderFlags::PINNED.with(HeaderFlags::IDENTITY_HASH))
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("type", &self.object_type())
            .field("flags", &self.flags())
            .field("size", &self.size())
            .finish()
    }
}
