//! Region ledger.
//!
//! Every live reservation made through the reservation engine is one
//! [`Region`], keyed in a [`NoditMap`] by the address interval it covers.
//! The map keeps regions sorted by base address and refuses overlapping
//! inserts, which is exactly the pair of guarantees the ledger has to give:
//!
//! ```text
//!   base_a            end_a   base_b                end_b
//!   |------ Region A ------|  |------- Region B -------|
//!   [pp pp pp pp pp pp pp ]   [pp pp pp pp pp pp pp pp ]
//!     ^ one PageState per page
//! ```
//!
//! Inside a region, commit state and protection are tracked per page, so a
//! region that was partly committed or re-protected stays one node while
//! `Query` can still report the run of pages sharing the queried state.
//!
//! The ledger is not synchronized; [`crate::memory::VirtualMemory`] owns it
//! behind its lock.
use nodit::interval::ie;
use nodit::{Interval, NoditMap};

use sysdefs::constants::AllocationType;
use sysdefs::data::PageProtection;
use sysdefs::{PalError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageState {
    pub committed: bool,
    pub protection: PageProtection,
}

#[derive(Clone, Debug)]
pub struct Region {
    pub base: usize,
    pub size: usize,
    /// Flags the region was reserved with.
    pub allocation_type: AllocationType,
    /// Protection the region was reserved with; never changes.
    pub allocation_protect: PageProtection,
    page_size: usize,
    pages: Vec<PageState>,
}

impl Region {
    /// A fully reserved, uncommitted region. `base` and `size` must be page
    /// aligned.
    pub fn new(
        base: usize,
        size: usize,
        page_size: usize,
        allocation_type: AllocationType,
        allocation_protect: PageProtection,
    ) -> Self {
        let pages = vec![
            PageState {
                committed: false,
                protection: allocation_protect,
            };
            size / page_size
        ];
        Region {
            base,
            size,
            allocation_type,
            allocation_protect,
            page_size,
            pages,
        }
    }

    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// True if `[start, start + len)` lies inside the region.
    pub fn contains_range(&self, start: usize, len: usize) -> bool {
        match start.checked_add(len) {
            Some(end) => start >= self.base && end <= self.end(),
            None => false,
        }
    }

    fn page_index(&self, addr: usize) -> usize {
        (addr - self.base) / self.page_size
    }

    fn page_span(&self, start: usize, len: usize) -> std::ops::Range<usize> {
        let first = self.page_index(start);
        first..first + len / self.page_size
    }

    pub fn page(&self, addr: usize) -> PageState {
        self.pages[self.page_index(addr)]
    }

    pub fn set_pages(&mut self, start: usize, len: usize, state: PageState) {
        let span = self.page_span(start, len);
        self.pages[span].fill(state);
    }

    /// Marks the range decommitted. The last protection is kept so a later
    /// re-commit with the same protection is a no-op at the page level.
    pub fn decommit_pages(&mut self, start: usize, len: usize) {
        let span = self.page_span(start, len);
        for page in &mut self.pages[span] {
            page.committed = false;
        }
    }

    pub fn all_committed(&self, start: usize, len: usize) -> bool {
        self.pages[self.page_span(start, len)]
            .iter()
            .all(|page| page.committed)
    }

    pub fn any_committed(&self) -> bool {
        self.pages.iter().any(|page| page.committed)
    }

    /// The maximal run of identical pages starting at the page containing
    /// `addr`, as `(run_start, run_len, state)`.
    pub fn run_at(&self, addr: usize) -> (usize, usize, PageState) {
        let first = self.page_index(addr);
        let state = self.pages[first];
        let count = self.pages[first..]
            .iter()
            .take_while(|page| **page == state)
            .count();
        (
            self.base + first * self.page_size,
            count * self.page_size,
            state,
        )
    }

    /// Runs of identical pages covering `[start, start + len)`, clipped to
    /// the range.
    pub fn runs(&self, start: usize, len: usize) -> Vec<(usize, usize, PageState)> {
        let mut runs = Vec::new();
        let end = start + len;
        let mut cursor = start;
        while cursor < end {
            let (run_start, run_len, state) = self.run_at(cursor);
            let run_end = (run_start + run_len).min(end);
            runs.push((cursor, run_end - cursor, state));
            cursor = run_end;
        }
        runs
    }
}

pub struct RegionLedger {
    regions: NoditMap<usize, Interval<usize>, Region>,
}

impl RegionLedger {
    pub fn new() -> Self {
        RegionLedger {
            regions: NoditMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Adds a region. Fails without touching the ledger if it would overlap
    /// an existing one.
    pub fn insert(&mut self, region: Region) -> Result<()> {
        if region.size == 0 {
            return Err(PalError::InvalidParameter);
        }
        self.regions
            .insert_strict(ie(region.base, region.end()), region)
            .map_err(|_| PalError::Internal("reservation overlaps a tracked region"))
    }

    /// Region containing `addr`.
    pub fn find(&self, addr: usize) -> Option<&Region> {
        self.regions.get_at_point(addr)
    }

    pub fn find_mut(&mut self, addr: usize) -> Option<&mut Region> {
        self.regions.get_at_point_mut(addr)
    }

    /// Regions intersecting `[start, start + len)`, in address order.
    pub fn overlapping_mut(
        &mut self,
        start: usize,
        len: usize,
    ) -> impl Iterator<Item = &mut Region> {
        let end = start.saturating_add(len.max(1));
        self.regions
            .overlapping_mut(ie(start, end))
            .map(|(_, region)| region)
    }

    /// Removes the region whose base is exactly `base`.
    pub fn remove(&mut self, base: usize) -> Option<Region> {
        match self.regions.get_at_point(base) {
            Some(region) if region.base == base => {}
            _ => return None,
        }
        self.regions
            .remove_overlapping(ie(base, base + 1))
            .map(|(_, region)| region)
            .next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter().map(|(_, region)| region)
    }

    /// Empties the ledger and hands back what it held.
    pub fn drain(&mut self) -> Vec<Region> {
        let bases: Vec<usize> = self.iter().map(|region| region.base).collect();
        bases
            .into_iter()
            .filter_map(|base| self.remove(base))
            .collect()
    }

    /// Sorted by base, pairwise disjoint, and each region's page vector
    /// matches its size.
    pub fn check_invariants(&self) -> bool {
        let mut prev_end = 0;
        for region in self.iter() {
            if region.base < prev_end || region.size == 0 {
                return false;
            }
            if region.pages.len() * region.page_size != region.size {
                return false;
            }
            prev_end = region.end();
        }
        true
    }
}

impl Default for RegionLedger {
    fn default() -> Self {
        Self::new()
    }
}
