//! Tenured-generation mark-compact collector.
//!
//! The old generation is a list of region-aligned chunks. After an external
//! mark phase, a collection plans every region (plugs, gaps, relocation
//! records and brick tables), fixes every reference to its future address,
//! then slides plugs down or, for barely fragmented regions, leaves objects
//! in place and fills the gaps. Regions left empty go back to the chunk
//! provider.
//!
//! Consumers provide:
//! - A [`RootProvider`] to supply live roots at GC time.
//! - Optionally an [`ImageHeap`] whose objects reference the space.
//! - Optionally their own [`RememberedSet`].

mod error;
mod fixer;
mod image;
mod marking;
mod old_gen;
mod planner;
mod region;
mod relocation;
mod relocator;
mod remset;
mod roots;
mod settings;
mod space;
mod system;
mod tables;

pub use error::{GcError, Holder, fatal};
pub use fixer::Fixer;
pub use image::ImageHeap;
pub use marking::{MarkStats, Marker, mark_from_roots};
pub use old_gen::{CollectionStats, OLD_SPACE, OldGeneration};
pub use planner::{Plan, Planner, RegionPlan};
pub use region::{
    ChunkProvider, ChunkReleaser, LargeObject, Region, SpaceId,
};
pub use relocation::{ChainState, FIRST_RECORD_SLOT, Records, RelocationInfo};
pub use relocator::{Compactor, Sweeper};
pub use remset::{CardRememberedSet, RememberedSet};
pub use roots::RootProvider;
pub use settings::{
    HeapSettings, MAX_REGION_SIZE, RegionLayout, RelocationEncoding,
};
pub use space::Space;
pub use system::{OS_PAGE_SIZE, map_aligned, map_memory, unmap_memory};
pub use tables::{BrickTable, CARD_CLEAN, CARD_DIRTY, CardTable};
