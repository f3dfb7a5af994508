//! One buffer-pool tier: fixed-size slabs carved into segment lists
//!
//! A slab is a contiguous allocation divided into pages; its segment list
//! tracks `(start_page, num_pages, FREE|USED, last_touched, pin_count)` runs.
//! Finding space walks the slabs for a free run, then tries to grow a new
//! slab (halving the attempted size on failure down to the minimum), and
//! finally evicts the contiguous run of unpinned segments with the lowest
//! eviction score.

use crate::buffer::ChunkKey;
use crate::error::{Error, Result};
use tracing::{debug, info};

/// Segment status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegStatus {
    /// Unoccupied pages
    Free,
    /// Pages backing a chunk
    Used,
}

/// One segment of a slab
#[derive(Debug, Clone)]
pub struct Segment {
    /// First page of the run
    pub start_page: usize,
    /// Pages in the run
    pub num_pages: usize,
    /// FREE or USED
    pub status: SegStatus,
    /// Eviction clock value of the last touch
    pub last_touched: u64,
    /// Holders preventing eviction
    pub pin_count: u32,
    /// Chunk identity, for USED segments
    pub chunk_key: Option<ChunkKey>,
    /// Bytes actually written (may be less than the page run)
    pub size_bytes: usize,
}

impl Segment {
    fn free(start_page: usize, num_pages: usize) -> Self {
        Self {
            start_page,
            num_pages,
            status: SegStatus::Free,
            last_touched: 0,
            pin_count: 0,
            chunk_key: None,
            size_bytes: 0,
        }
    }
}

/// One slab: backing bytes plus its segment list, kept sorted by start page.
#[derive(Debug)]
pub struct Slab {
    /// Backing allocation
    pub mem: Vec<u8>,
    /// Segment runs covering the whole slab
    pub segments: Vec<Segment>,
}

/// Location of a segment: (slab index, position in its segment list)
pub type SegLoc = (usize, usize);

/// Segment-list manager for one tier.
#[derive(Debug)]
pub struct TierMgr {
    name: &'static str,
    page_size: usize,
    min_pages_per_slab: usize,
    max_pages_per_slab: usize,
    max_pool_pages: usize,
    current_max_slab_pages: usize,
    pages_allocated: usize,
    allocations_capped: bool,
    epoch: u64,
    slabs: Vec<Slab>,
}

impl TierMgr {
    /// New empty tier. Sizes are in bytes and must be page multiples.
    #[must_use]
    pub fn new(
        name: &'static str,
        page_size: usize,
        min_slab_size: usize,
        max_slab_size: usize,
        max_pool_size: usize,
    ) -> Self {
        let max_pages_per_slab = max_slab_size / page_size;
        Self {
            name,
            page_size,
            min_pages_per_slab: min_slab_size / page_size,
            max_pages_per_slab,
            max_pool_pages: max_pool_size / page_size,
            current_max_slab_pages: max_pages_per_slab,
            pages_allocated: 0,
            allocations_capped: false,
            epoch: 0,
            slabs: Vec::new(),
        }
    }

    /// Tier name for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Bytes currently backed by slabs.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.pages_allocated * self.page_size
    }

    /// Advance and return the eviction clock.
    fn tick(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Find the segment for a chunk key.
    #[must_use]
    pub fn find_chunk(&self, key: &ChunkKey) -> Option<SegLoc> {
        for (si, slab) in self.slabs.iter().enumerate() {
            for (gi, seg) in slab.segments.iter().enumerate() {
                if seg.status == SegStatus::Used && seg.chunk_key.as_ref() == Some(key) {
                    return Some((si, gi));
                }
            }
        }
        None
    }

    /// Immutable segment access.
    #[must_use]
    pub fn segment(&self, loc: SegLoc) -> &Segment {
        &self.slabs[loc.0].segments[loc.1]
    }

    /// Mutable segment access.
    pub fn segment_mut(&mut self, loc: SegLoc) -> &mut Segment {
        &mut self.slabs[loc.0].segments[loc.1]
    }

    /// Read a used segment's bytes.
    #[must_use]
    pub fn read(&self, loc: SegLoc) -> &[u8] {
        let seg = &self.slabs[loc.0].segments[loc.1];
        let start = seg.start_page * self.page_size;
        &self.slabs[loc.0].mem[start..start + seg.size_bytes]
    }

    /// Write bytes into a used segment; the page run must cover them.
    pub fn write(&mut self, loc: SegLoc, bytes: &[u8]) -> Result<()> {
        let page_size = self.page_size;
        let seg = &mut self.slabs[loc.0].segments[loc.1];
        if bytes.len() > seg.num_pages * page_size {
            return Err(Error::BufferPool(format!(
                "write of {} bytes exceeds reserved {} pages",
                bytes.len(),
                seg.num_pages
            )));
        }
        seg.size_bytes = bytes.len();
        let start = seg.start_page * page_size;
        self.slabs[loc.0].mem[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Reserve a used, pinned segment for `key` of at least `num_bytes`.
    pub fn reserve(&mut self, key: &ChunkKey, num_bytes: usize) -> Result<SegLoc> {
        let num_pages = num_bytes.div_ceil(self.page_size).max(1);
        let loc = self.find_free_segment(num_pages)?;
        let touch = self.tick();
        let seg = self.segment_mut(loc);
        seg.status = SegStatus::Used;
        seg.chunk_key = Some(key.clone());
        seg.pin_count = 1;
        seg.last_touched = touch;
        seg.size_bytes = num_bytes;
        Ok(loc)
    }

    /// Pin a resident segment and refresh its touch time.
    pub fn pin(&mut self, loc: SegLoc) {
        let touch = self.tick();
        let seg = self.segment_mut(loc);
        seg.pin_count += 1;
        seg.last_touched = touch;
    }

    /// Unpin; eviction becomes possible again at zero.
    pub fn unpin(&mut self, loc: SegLoc) {
        let seg = self.segment_mut(loc);
        debug_assert!(seg.pin_count > 0, "unpin without pin");
        seg.pin_count = seg.pin_count.saturating_sub(1);
    }

    /// Drop a chunk, freeing its segment. Errors when pinned.
    pub fn delete_chunk(&mut self, key: &ChunkKey) -> Result<()> {
        if let Some(loc) = self.find_chunk(key) {
            let seg = self.segment(loc);
            if seg.pin_count > 0 {
                return Err(Error::BufferPool(format!(
                    "delete of pinned chunk {key:?} (pin count {})",
                    seg.pin_count
                )));
            }
            self.release_segment(loc);
        }
        Ok(())
    }

    /// Drop every chunk whose key starts with `prefix`.
    pub fn delete_chunks_with_prefix(&mut self, prefix: &ChunkKey) {
        loop {
            let mut found = None;
            'outer: for (si, slab) in self.slabs.iter().enumerate() {
                for (gi, seg) in slab.segments.iter().enumerate() {
                    if seg.status == SegStatus::Used
                        && seg.pin_count == 0
                        && seg.chunk_key.as_ref().is_some_and(|k| k.starts_with(prefix))
                    {
                        found = Some((si, gi));
                        break 'outer;
                    }
                }
            }
            match found {
                Some(loc) => self.release_segment(loc),
                None => break,
            }
        }
    }

    fn release_segment(&mut self, loc: SegLoc) {
        {
            let seg = self.segment_mut(loc);
            seg.status = SegStatus::Free;
            seg.chunk_key = None;
            seg.pin_count = 0;
            seg.size_bytes = 0;
        }
        self.coalesce_free(loc.0);
    }

    /// Merge adjacent free segments of one slab.
    fn coalesce_free(&mut self, slab_idx: usize) {
        let segs = &mut self.slabs[slab_idx].segments;
        let mut i = 0;
        while i + 1 < segs.len() {
            if segs[i].status == SegStatus::Free && segs[i + 1].status == SegStatus::Free {
                segs[i].num_pages += segs[i + 1].num_pages;
                segs.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Find or make a free run of `num_pages`: existing free segment → new
    /// slab (halving on failure) → eviction.
    fn find_free_segment(&mut self, num_pages: usize) -> Result<SegLoc> {
        if num_pages > self.max_pages_per_slab {
            return Err(Error::OutOfMemory {
                tier: self.name,
                requested: num_pages * self.page_size,
            });
        }

        for si in 0..self.slabs.len() {
            if let Some(loc) = self.find_free_in_slab(si, num_pages) {
                return Ok(loc);
            }
        }

        // grow a new slab, halving the attempt on "allocation failure"
        // (pool-budget exhaustion) until the minimum slab size
        while !self.allocations_capped && self.pages_allocated < self.max_pool_pages {
            let pages_left = self.max_pool_pages - self.pages_allocated;
            if pages_left < self.current_max_slab_pages {
                self.current_max_slab_pages = pages_left;
            }
            if num_pages > self.current_max_slab_pages {
                break;
            }
            if self.try_add_slab(self.current_max_slab_pages) {
                info!(
                    tier = self.name,
                    pages = self.current_max_slab_pages,
                    "allocated slab"
                );
                self.pages_allocated += self.current_max_slab_pages;
                let si = self.slabs.len() - 1;
                let loc = self
                    .find_free_in_slab(si, num_pages)
                    .expect("fresh slab was sized to fit the request");
                return Ok(loc);
            }
            if num_pages > self.current_max_slab_pages / 2
                && self.current_max_slab_pages != num_pages
            {
                self.current_max_slab_pages = num_pages;
            } else {
                self.current_max_slab_pages /= 2;
                if self.current_max_slab_pages < self.min_pages_per_slab {
                    self.allocations_capped = true;
                    info!(tier = self.name, "slab allocations capped");
                }
            }
        }

        if self.slabs.is_empty() {
            return Err(Error::OutOfMemory {
                tier: self.name,
                requested: num_pages * self.page_size,
            });
        }

        self.evict(num_pages)
    }

    fn find_free_in_slab(&mut self, slab_idx: usize, num_pages: usize) -> Option<SegLoc> {
        let segs = &mut self.slabs[slab_idx].segments;
        for gi in 0..segs.len() {
            if segs[gi].status == SegStatus::Free && segs[gi].num_pages >= num_pages {
                let excess = segs[gi].num_pages - num_pages;
                segs[gi].num_pages = num_pages;
                if excess > 0 {
                    let free = Segment::free(segs[gi].start_page + num_pages, excess);
                    segs.insert(gi + 1, free);
                }
                return Some((slab_idx, gi));
            }
        }
        None
    }

    fn try_add_slab(&mut self, pages: usize) -> bool {
        let bytes = pages * self.page_size;
        let mut mem = Vec::new();
        if mem.try_reserve_exact(bytes).is_err() {
            return false;
        }
        mem.resize(bytes, 0);
        self.slabs.push(Slab {
            mem,
            segments: vec![Segment::free(0, pages)],
        });
        true
    }

    /// Evict the contiguous run of unpinned segments with the lowest score.
    /// The score of a run is the maximum `last_touched` among its USED
    /// segments, so older runs lose (the max, not the sum, keeps large
    /// chunks from outranking many stale small ones).
    fn evict(&mut self, num_pages: usize) -> Result<SegLoc> {
        let mut best: Option<(u64, usize, usize, usize)> = None; // score, slab, start idx, end idx

        for (si, slab) in self.slabs.iter().enumerate() {
            for start in 0..slab.segments.len() {
                let mut page_count = 0;
                let mut score = 0u64;
                for (end, seg) in slab.segments.iter().enumerate().skip(start) {
                    if seg.status == SegStatus::Used && seg.pin_count > 0 {
                        break;
                    }
                    page_count += seg.num_pages;
                    if seg.status == SegStatus::Used {
                        score = score.max(seg.last_touched);
                    }
                    if page_count >= num_pages {
                        match best {
                            Some((best_score, ..)) if best_score <= score => {}
                            _ => best = Some((score, si, start, end)),
                        }
                        break;
                    }
                }
            }
        }

        let Some((score, si, start, end)) = best else {
            return Err(Error::OutOfMemory {
                tier: self.name,
                requested: num_pages * self.page_size,
            });
        };
        debug!(tier = self.name, score, "evicting segment run");

        let start_page = self.slabs[si].segments[start].start_page;
        let total_pages: usize = self.slabs[si].segments[start..=end]
            .iter()
            .map(|s| s.num_pages)
            .sum();
        let merged = Segment::free(start_page, total_pages);
        self.slabs[si].segments.splice(start..=end, [merged]);

        // carve the request out of the merged run
        Ok(self
            .find_free_in_slab(si, num_pages)
            .expect("merged eviction run covers the request"))
    }

    /// Evicted chunk keys are gone from the tier; callers keep their own
    /// chunk index and must prune entries whose segment vanished.
    #[must_use]
    pub fn resident_keys(&self) -> Vec<ChunkKey> {
        let mut keys = Vec::new();
        for slab in &self.slabs {
            for seg in &slab.segments {
                if seg.status == SegStatus::Used {
                    if let Some(k) = &seg.chunk_key {
                        keys.push(k.clone());
                    }
                }
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ChunkKey;

    fn key(parts: &[u32]) -> ChunkKey {
        ChunkKey::from(parts.to_vec())
    }

    fn small_tier() -> TierMgr {
        // page 64B, slabs 256B..512B, pool 1KiB
        TierMgr::new("test", 64, 256, 512, 1024)
    }

    #[test]
    fn test_reserve_write_read_round_trip() {
        let mut tier = small_tier();
        let k = key(&[1, 0, 0]);
        let loc = tier.reserve(&k, 100).unwrap();
        tier.write(loc, &[7u8; 100]).unwrap();
        assert_eq!(tier.read(loc), &[7u8; 100]);
        assert_eq!(tier.find_chunk(&k), Some(loc));
    }

    #[test]
    fn test_pinned_segments_survive_pressure() {
        let mut tier = small_tier();
        let pinned_key = key(&[1, 0, 0]);
        let loc = tier.reserve(&pinned_key, 512).unwrap();
        tier.write(loc, &[1u8; 512]).unwrap();

        // second 512B chunk fills the pool
        let second = key(&[2, 0, 0]);
        let loc2 = tier.reserve(&second, 512).unwrap();
        tier.unpin(loc2);

        // a third allocation must evict the unpinned chunk, not the pinned one
        let third = key(&[3, 0, 0]);
        let _loc3 = tier.reserve(&third, 512).unwrap();
        assert!(tier.find_chunk(&pinned_key).is_some());
        assert!(tier.find_chunk(&second).is_none(), "unpinned chunk evicted");
    }

    #[test]
    fn test_eviction_prefers_older_chunks() {
        let mut tier = small_tier();
        let old = key(&[1, 0, 0]);
        let newer = key(&[2, 0, 0]);
        let l1 = tier.reserve(&old, 512).unwrap();
        tier.unpin(l1);
        let l2 = tier.reserve(&newer, 512).unwrap();
        tier.unpin(l2);

        let incoming = key(&[3, 0, 0]);
        tier.reserve(&incoming, 256).unwrap();
        assert!(tier.find_chunk(&old).is_none(), "oldest run evicted first");
        assert!(tier.find_chunk(&newer).is_some());
    }

    #[test]
    fn test_everything_pinned_is_oom() {
        let mut tier = small_tier();
        tier.reserve(&key(&[1, 0, 0]), 512).unwrap();
        tier.reserve(&key(&[2, 0, 0]), 512).unwrap();
        let err = tier.reserve(&key(&[3, 0, 0]), 512).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
    }

    #[test]
    fn test_request_larger_than_max_slab_rejected() {
        let mut tier = small_tier();
        let err = tier.reserve(&key(&[1, 0, 0]), 4096).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
    }

    #[test]
    fn test_delete_with_prefix() {
        let mut tier = small_tier();
        for frag in 0..3u32 {
            let loc = tier.reserve(&key(&[9, 1, frag]), 64).unwrap();
            tier.unpin(loc);
        }
        let loc = tier.reserve(&key(&[8, 1, 0]), 64).unwrap();
        tier.unpin(loc);

        tier.delete_chunks_with_prefix(&key(&[9]));
        assert!(tier.find_chunk(&key(&[9, 1, 0])).is_none());
        assert!(tier.find_chunk(&key(&[9, 1, 2])).is_none());
        assert!(tier.find_chunk(&key(&[8, 1, 0])).is_some());
    }

    #[test]
    fn test_delete_pinned_chunk_fails() {
        let mut tier = small_tier();
        let k = key(&[1, 0, 0]);
        tier.reserve(&k, 64).unwrap();
        assert!(tier.delete_chunk(&k).is_err());
    }

    #[test]
    fn test_free_segments_coalesce() {
        let mut tier = small_tier();
        let a = key(&[1, 0, 0]);
        let b = key(&[2, 0, 0]);
        let la = tier.reserve(&a, 64).unwrap();
        let lb = tier.reserve(&b, 64).unwrap();
        tier.unpin(la);
        tier.unpin(lb);
        tier.delete_chunk(&a).unwrap();
        tier.delete_chunk(&b).unwrap();

        // the merged free run must now host a request bigger than either
        assert!(tier.reserve(&key(&[3, 0, 0]), 128).is_ok());
    }
}
