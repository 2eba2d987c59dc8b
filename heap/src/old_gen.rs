use std::{ptr::NonNull, sync::Arc};

use crate::{
    RootProvider,
    error::{GcError, fatal},
    fixer::Fixer,
    image::ImageHeap,
    planner::{Plan, Planner},
    region::{ChunkProvider, ChunkReleaser, SpaceId},
    relocation::RelocationInfo,
    relocator::{Compactor, Sweeper},
    remset::{CardRememberedSet, RememberedSet},
    settings::HeapSettings,
    space::Space,
};

pub const OLD_SPACE: SpaceId = SpaceId(1);

/// What one tenured collection did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectionStats {
    pub regions_compacted: usize,
    pub regions_swept: usize,
    pub regions_released: usize,
    pub large_released: usize,
    /// Bytes in plugs across all regions.
    pub live_bytes: usize,
    /// Bytes in gaps across all regions.
    pub gap_bytes: usize,
    pub bytes_copied: usize,
    pub filler_bytes: usize,
    pub references_fixed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Planned,
    Fixed,
    Relocated,
}

/// The tenured generation and its mark-compact collector.
///
/// A collection runs [`plan`](Self::plan), [`fix`](Self::fix),
/// [`relocate`](Self::relocate) and
/// [`release_empty_regions`](Self::release_empty_regions) in that order,
/// after an external mark phase has set the mark bit on every live object.
/// [`try_collect`](Self::try_collect) does all of it.
#[derive(Debug)]
pub struct OldGeneration<R: RememberedSet = CardRememberedSet> {
    settings: HeapSettings,
    info: RelocationInfo,
    space: Space,
    remset: R,
    phase: Phase,
    stats: CollectionStats,
}

impl OldGeneration<CardRememberedSet> {
    pub fn new(settings: HeapSettings) -> Result<Self, &'static str> {
        Self::with_remembered_set(settings, CardRememberedSet::new())
    }
}

impl<R: RememberedSet> OldGeneration<R> {
    pub fn with_remembered_set(settings: HeapSettings, remset: R) -> Result<Self, &'static str> {
        settings.validate()?;
        let provider = ChunkProvider::new(settings.heap_size, settings.region_size)
            .ok_or("could not reserve the heap")?;
        let space = Space::new(
            OLD_SPACE,
            Arc::new(provider),
            settings.layout(),
            settings.large_size,
        );
        Ok(Self {
            info: RelocationInfo::new(settings.encoding),
            settings,
            space,
            remset,
            phase: Phase::Idle,
            stats: CollectionStats::default(),
        })
    }

    #[inline(always)]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline(always)]
    pub fn space(&self) -> &Space {
        &self.space
    }

    #[inline(always)]
    pub fn space_mut(&mut self) -> &mut Space {
        &mut self.space
    }

    #[inline(always)]
    pub fn remembered_set(&self) -> &R {
        &self.remset
    }

    #[inline(always)]
    pub fn relocation_info(&self) -> RelocationInfo {
        self.info
    }

    /// Reserves room for an object moving into the tenured space. New
    /// regions start out tracked by the remembered set.
    pub fn promote(&mut self, size: usize) -> Result<NonNull<u8>, GcError> {
        let regions = self.space.region_count();
        let ptr = self.space.promote(size)?;
        for index in regions..self.space.region_count() {
            self.remset
                .clear_region(self.space.region(index), self.space.layout());
        }
        Ok(ptr)
    }

    /// Records a store into `holder`.
    pub fn write_barrier(&mut self, holder: usize) {
        self.remset.write_barrier(&self.space, holder);
    }

    /// Plans every region: clears mark bits, writes relocation records and
    /// brick tables, decides compact or sweep per region.
    pub fn plan(&mut self) -> Result<(), GcError> {
        debug_assert_eq!(self.phase, Phase::Idle, "collection already running");
        self.stats = CollectionStats::default();

        let mut planner = Planner::new(self.info, *self.space.layout(), self.settings.sweep_divisor);
        for plan in planner.plan(&mut self.space)? {
            match plan.plan {
                Plan::Compact => self.stats.regions_compacted += 1,
                Plan::Sweep => self.stats.regions_swept += 1,
            }
            self.stats.live_bytes += plan.live_bytes;
            self.stats.gap_bytes += plan.gap_bytes;
        }
        self.phase = Phase::Planned;
        Ok(())
    }

    /// Rewrites every reference into the space to its post-relocation
    /// address: large objects, live region objects, image heap objects and
    /// roots. Unmarked large objects are handed to `releaser`.
    pub fn fix(
        &mut self,
        roots: &mut dyn RootProvider,
        image: Option<&mut ImageHeap>,
        releaser: &mut ChunkReleaser,
    ) -> Result<(), GcError> {
        debug_assert_eq!(self.phase, Phase::Planned, "fix before plan");

        // SAFETY: large objects are never touched by planning
        let dead = self
            .space
            .extract_large(|large| !unsafe { object::header(large.object()) }.is_marked());
        self.stats.large_released += dead.len();
        for large in dead {
            log::trace!("large object 0x{:x} is dead", large.addr());
            releaser.add_large(large);
        }

        let mut fixer = Fixer::new(&self.space, self.info, &mut self.remset);
        fixer.fix_large_objects()?;
        fixer.fix_regions()?;
        if let Some(image) = image {
            fixer.fix_image_heap(image)?;
        }
        fixer.fix_roots(roots)?;
        self.stats.references_fixed = fixer.fixed();

        self.phase = Phase::Fixed;
        Ok(())
    }

    /// Compacts or sweeps every region, then rebuilds the remembered set of
    /// all regions. Ends the brick table's validity.
    pub fn relocate(&mut self) -> Result<(), GcError> {
        debug_assert_eq!(self.phase, Phase::Fixed, "relocate before fix");

        let mut compactor = Compactor::new(self.info);
        let mut sweeper = Sweeper::new(self.info);
        for index in 0..self.space.region_count() {
            if self.space.region(index).should_sweep() {
                // SAFETY: planned for sweeping, references fixed
                unsafe { sweeper.sweep_region(self.space.region(index)) };
            } else {
                // SAFETY: planned for compaction, earlier regions relocated
                unsafe { compactor.compact_region(&mut self.space, index)? };
            }
        }
        self.stats.bytes_copied = compactor.copied_bytes();
        self.stats.filler_bytes = sweeper.filler_bytes();

        for index in 0..self.space.region_count() {
            self.space.region_mut(index).set_should_sweep(false);
            self.remset
                .enable_for_region(self.space.region(index), self.space.layout());
        }

        self.phase = Phase::Relocated;
        Ok(())
    }

    /// Detaches every region left without objects and hands it to
    /// `releaser`.
    pub fn release_empty_regions(&mut self, releaser: &mut ChunkReleaser) {
        debug_assert_eq!(self.phase, Phase::Relocated, "release before relocate");
        let empty = self.space.extract_regions(|region| region.is_empty());
        self.stats.regions_released += empty.len();
        for region in empty {
            releaser.add_region(region);
        }
        self.phase = Phase::Idle;
    }

    /// Runs one complete collection. Mark bits must already be set.
    pub fn try_collect(
        &mut self,
        roots: &mut dyn RootProvider,
        image: Option<&mut ImageHeap>,
    ) -> Result<CollectionStats, GcError> {
        let mut releaser = ChunkReleaser::new();
        self.plan()?;
        self.fix(roots, image, &mut releaser)?;
        self.relocate()?;
        self.release_empty_regions(&mut releaser);
        releaser.release(self.space.provider());

        let stats = self.stats;
        log::info!(
            "tenured collection: {} compacted, {} swept, {} released, {} large released, \
             {} bytes copied, {} filler bytes, {} live bytes in {} regions",
            stats.regions_compacted,
            stats.regions_swept,
            stats.regions_released,
            stats.large_released,
            stats.bytes_copied,
            stats.filler_bytes,
            stats.live_bytes,
            self.space.region_count(),
        );
        Ok(stats)
    }

    /// Like [`try_collect`](Self::try_collect), but a failure aborts the
    /// process.
    pub fn collect(
        &mut self,
        roots: &mut dyn RootProvider,
        image: Option<&mut ImageHeap>,
    ) -> CollectionStats {
        match self.try_collect(roots, image) {
            Ok(stats) => stats,
            Err(err) => fatal(&err),
        }
    }

    /// The chunk provider backing this generation.
    pub fn provider(&self) -> &Arc<ChunkProvider> {
        self.space.provider()
    }
}
