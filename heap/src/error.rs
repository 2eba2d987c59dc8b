use std::fmt;

/// What held a reference the collector was asked to fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    /// A slot handed out by a [`RootProvider`](crate::RootProvider).
    Root,
    /// An object inside a region.
    Object(usize),
    /// An unaligned large object.
    Large(usize),
    /// An object in the image heap.
    Image(usize),
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Holder::Root => write!(f, "root"),
            Holder::Object(addr) => write!(f, "object 0x{addr:x}"),
            Holder::Large(addr) => write!(f, "large object 0x{addr:x}"),
            Holder::Image(addr) => write!(f, "image object 0x{addr:x}"),
        }
    }
}

/// Everything that can go wrong while collecting the tenured space.
///
/// None of these are recoverable: the heap is left half-rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    /// A live holder references memory the planner recorded as dead.
    UnmarkedReferent { holder: Holder, referent: usize },
    /// A relocated address does not land inside a region's object area.
    RelocationOutOfBounds {
        address: usize,
        region_start: usize,
        region_end: usize,
    },
    /// The planner ran out of destination regions.
    DestinationExhausted { size: usize },
    /// No region could be obtained to promote an object into.
    PromotionFailure { size: usize },
    /// A RelocationInfo field does not fit the selected encoding.
    RecordOverflow { field: &'static str, value: i64 },
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcError::UnmarkedReferent { holder, referent } => write!(
                f,
                "{holder} references unmarked object 0x{referent:x}"
            ),
            GcError::RelocationOutOfBounds {
                address,
                region_start,
                region_end,
            } => write!(
                f,
                "relocated address 0x{address:x} outside region \
                 [0x{region_start:x}, 0x{region_end:x})"
            ),
            GcError::DestinationExhausted { size } => {
                write!(f, "no destination region left for a {size} byte plug")
            }
            GcError::PromotionFailure { size } => {
                write!(f, "could not promote a {size} byte object")
            }
            GcError::RecordOverflow { field, value } => {
                write!(f, "relocation record {field} {value} does not fit")
            }
        }
    }
}

impl std::error::Error for GcError {}

/// Reports `err` and terminates the process.
///
/// Used once a collection has started rewriting the heap; there is no state
/// to return to.
#[cold]
pub fn fatal(err: &GcError) -> ! {
    log::error!("fatal error in tenured collection: {err}");
    std::process::abort()
}
