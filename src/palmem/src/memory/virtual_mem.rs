//! Reservation engine: Reserve / Commit / Decommit / Release / Protect /
//! Query over the region ledger.
//!
//! One mutex guards the ledger together with the executable sub-allocator.
//! Each public operation takes it once, so an `Alloc` that reserves and
//! commits is observed by other threads as a single step.
//!
//! Native protocol, per page:
//!
//! ```text
//!   reserve   mmap(PROT_NONE, MAP_PRIVATE|MAP_ANON)     free      -> reserved
//!   commit    mprotect(prot)                            reserved  -> committed
//!   decommit  mmap(PROT_NONE, MAP_FIXED|MAP_ANON)       committed -> reserved
//!   release   munmap                                    any       -> free
//! ```
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use sysdefs::constants::{AllocationType, FreeType, VIRTUAL_64KB};
use sysdefs::data::{MemState, MemType, PageProtection, RegionInfo};
use sysdefs::{PalError, Result};

use crate::config::PalConfig;
use crate::memory::exec_alloc::ExecutableMemoryAllocator;
use crate::memory::ledger::{PageState, Region, RegionLedger};
use crate::memory::native::NativeMemory;
use crate::memory::oplog::{LogRecord, OpLog, VirtualOperation};
use crate::memory::protection::to_native;
use crate::memory::{align_down, align_up};

struct VirtualState {
    ledger: RegionLedger,
    exec: ExecutableMemoryAllocator,
}

pub struct VirtualMemory {
    native: Arc<dyn NativeMemory>,
    page_size: usize,
    state: Mutex<VirtualState>,
    oplog: OpLog,
}

impl VirtualMemory {
    pub fn new(native: Arc<dyn NativeMemory>, config: &PalConfig) -> Self {
        let exec = ExecutableMemoryAllocator::initialize(native.as_ref(), config);
        Self::with_executable_allocator(native, exec)
    }

    pub fn with_executable_allocator(
        native: Arc<dyn NativeMemory>,
        exec: ExecutableMemoryAllocator,
    ) -> Self {
        let page_size = native.page_size();
        VirtualMemory {
            native,
            page_size,
            state: Mutex::new(VirtualState {
                ledger: RegionLedger::new(),
                exec,
            }),
            oplog: OpLog::new(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn native(&self) -> &Arc<dyn NativeMemory> {
        &self.native
    }

    /// `[align_down(address), align_up(address + size))` at page granularity.
    fn page_range(&self, address: usize, size: usize) -> Result<(usize, usize)> {
        let start = align_down(address, self.page_size);
        let end = address
            .checked_add(size)
            .and_then(|end| align_up(end, self.page_size))
            .ok_or(PalError::InvalidParameter)?;
        Ok((start, end - start))
    }

    /// Reserve and/or commit, or reset, depending on `allocation_type`.
    pub fn alloc(
        &self,
        address: usize,
        size: usize,
        allocation_type: AllocationType,
        protection: PageProtection,
    ) -> Result<usize> {
        trace!(
            target: "virtual",
            "alloc(address={:#x}, size={:#x}, type={:?}, protect={:?})",
            address,
            size,
            allocation_type,
            protection
        );
        let result = self.alloc_inner(address, size, allocation_type, protection);
        self.oplog.record(
            VirtualOperation::Allocate,
            address,
            size,
            allocation_type,
            Some(protection),
            result.as_ref().map_or(0, |address| *address),
            result.is_ok(),
        );
        result
    }

    fn alloc_inner(
        &self,
        address: usize,
        size: usize,
        allocation_type: AllocationType,
        protection: PageProtection,
    ) -> Result<usize> {
        if allocation_type.contains(AllocationType::WRITE_WATCH) {
            return Err(PalError::InvalidParameter);
        }
        if !AllocationType::all().contains(allocation_type) {
            return Err(PalError::InvalidParameter);
        }
        if allocation_type.contains(AllocationType::TOP_DOWN) {
            warn!(target: "virtual", "ignoring MEM_TOP_DOWN");
        }

        if allocation_type.contains(AllocationType::RESET) {
            if allocation_type != AllocationType::RESET {
                return Err(PalError::InvalidParameter);
            }
            return self.reset(address, size);
        }

        let reserve = allocation_type.contains(AllocationType::RESERVE);
        let commit = allocation_type.contains(AllocationType::COMMIT);
        if !reserve && !commit {
            return Err(PalError::InvalidParameter);
        }

        let mut state = self.state.lock();
        let mut base = address;
        if reserve {
            base = self.reserve_locked(&mut state, address, size, allocation_type, protection)?;
        }
        if commit {
            let commit_address = if address != 0 { address } else { base };
            let committed =
                self.commit_locked(&mut state, commit_address, size, allocation_type, protection)?;
            if !reserve {
                base = committed;
            }
        }
        Ok(base)
    }

    /// Reserves `size` bytes at `address` (aligned down to 64KB), or wherever
    /// the OS or the executable sub-allocator chooses if `address` is 0.
    pub fn reserve(
        &self,
        address: usize,
        size: usize,
        allocation_type: AllocationType,
        protection: PageProtection,
    ) -> Result<usize> {
        let mut state = self.state.lock();
        self.reserve_locked(
            &mut state,
            address,
            size,
            allocation_type | AllocationType::RESERVE,
            protection,
        )
    }

    fn reserve_locked(
        &self,
        state: &mut VirtualState,
        address: usize,
        size: usize,
        allocation_type: AllocationType,
        protection: PageProtection,
    ) -> Result<usize> {
        let result = self.reserve_region(state, address, size, allocation_type, protection);
        self.oplog.record(
            VirtualOperation::Reserve,
            address,
            size,
            allocation_type,
            Some(protection),
            result.as_ref().map_or(0, |address| *address),
            result.is_ok(),
        );
        result
    }

    fn reserve_region(
        &self,
        state: &mut VirtualState,
        address: usize,
        size: usize,
        mut allocation_type: AllocationType,
        protection: PageProtection,
    ) -> Result<usize> {
        if size == 0 {
            return Err(PalError::InvalidParameter);
        }
        let start = align_down(address, VIRTUAL_64KB);
        let end = address
            .checked_add(size)
            .and_then(|end| align_up(end, self.page_size))
            .ok_or(PalError::InvalidParameter)?;
        let mut len = end - start;

        let mut granted = None;
        if allocation_type.contains(AllocationType::RESERVE_EXECUTABLE) && address == 0 {
            let exec_len = align_up(len, VIRTUAL_64KB).ok_or(PalError::InvalidParameter)?;
            if let Some(base) = state.exec.allocate(exec_len) {
                len = exec_len;
                granted = Some(base);
            }
        }

        let base = match granted {
            Some(base) => base,
            None => {
                if protection == PageProtection::ExecuteReadWrite {
                    allocation_type |= AllocationType::RESERVE_EXECUTABLE;
                }
                reserve_native_range(
                    self.native.as_ref(),
                    start,
                    len,
                    allocation_type.contains(AllocationType::RESERVE_EXECUTABLE),
                    allocation_type.contains(AllocationType::LARGE_PAGES),
                )?
            }
        };

        let region = Region::new(base, len, self.page_size, allocation_type, protection);
        if let Err(err) = state.ledger.insert(region) {
            error!(target: "virtual", "unable to record reservation at {:#x}", base);
            let _ = self.native.unmap(base, len);
            return Err(err);
        }
        Ok(base)
    }

    /// Commits `[address, address + size)`. Memory that was never reserved
    /// is reserved first; a failed commit undoes that reservation.
    pub fn commit(
        &self,
        address: usize,
        size: usize,
        allocation_type: AllocationType,
        protection: PageProtection,
    ) -> Result<usize> {
        let mut state = self.state.lock();
        self.commit_locked(
            &mut state,
            address,
            size,
            allocation_type | AllocationType::COMMIT,
            protection,
        )
    }

    fn commit_locked(
        &self,
        state: &mut VirtualState,
        address: usize,
        size: usize,
        allocation_type: AllocationType,
        protection: PageProtection,
    ) -> Result<usize> {
        let result = self.commit_region(state, address, size, allocation_type, protection);
        self.oplog.record(
            VirtualOperation::Commit,
            address,
            size,
            allocation_type,
            Some(protection),
            result.as_ref().map_or(0, |address| *address),
            result.is_ok(),
        );
        result
    }

    fn commit_region(
        &self,
        state: &mut VirtualState,
        address: usize,
        size: usize,
        allocation_type: AllocationType,
        protection: PageProtection,
    ) -> Result<usize> {
        let (mut start, mut len) = self.page_range(address, size)?;
        let mut locally_reserved = false;

        if address == 0 || state.ledger.find(start).is_none() {
            let reserved =
                self.reserve_locked(state, address, size, allocation_type, protection)?;
            let range = self.page_range(if address != 0 { address } else { reserved }, size)?;
            start = range.0;
            len = range.1;
            locally_reserved = true;
        }

        match self.commit_pages(state, start, len, protection) {
            Ok(()) => Ok(start),
            Err(err) => {
                if locally_reserved || allocation_type.contains(AllocationType::RESERVE) {
                    let base = state.ledger.find(start).map(|region| region.base);
                    if let Some(base) = base {
                        if let Err(release_err) = self.release_region(state, base) {
                            error!(
                                target: "virtual",
                                "unable to undo reservation at {:#x}: {}",
                                base,
                                release_err
                            );
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Makes every page of the range committed with `protection`. On failure
    /// the runs already changed are put back the way they were.
    fn commit_pages(
        &self,
        state: &mut VirtualState,
        start: usize,
        len: usize,
        protection: PageProtection,
    ) -> Result<()> {
        let region = state
            .ledger
            .find_mut(start)
            .ok_or(PalError::Internal("committed range has no region"))?;
        if !region.contains_range(start, len) {
            error!(target: "virtual", "trying to commit beyond the end of the region");
            return Err(PalError::InvalidAddress);
        }

        let runs = region.runs(start, len);
        let prot = to_native(protection);
        for (index, &(run_start, run_len, run_state)) in runs.iter().enumerate() {
            if run_state.committed && run_state.protection == protection {
                continue;
            }
            if let Err(err) = self.native.protect(run_start, run_len, prot) {
                error!(target: "virtual", "mprotect({:#x}, {:#x}) failed: {}", run_start, run_len, err);
                for &(undo_start, undo_len, previous) in &runs[..index] {
                    let undo_prot = if previous.committed {
                        to_native(previous.protection)
                    } else {
                        libc::PROT_NONE
                    };
                    let _ = self.native.protect(undo_start, undo_len, undo_prot);
                }
                return Err(PalError::from_io(&err));
            }
            if !run_state.committed {
                dump_advise(self.native.as_ref(), run_start, run_len, true);
            }
        }

        region.set_pages(
            start,
            len,
            PageState {
                committed: true,
                protection,
            },
        );
        Ok(())
    }

    /// `MEM_RESET`: the contents of the range are no longer needed.
    pub fn reset(&self, address: usize, size: usize) -> Result<usize> {
        let _state = self.state.lock();
        let result = self.reset_pages(address, size);
        self.oplog.record(
            VirtualOperation::Reset,
            address,
            size,
            AllocationType::RESET,
            None,
            result.as_ref().map_or(0, |address| *address),
            result.is_ok(),
        );
        result
    }

    fn reset_pages(&self, address: usize, size: usize) -> Result<usize> {
        let (start, len) = self.page_range(address, size)?;
        #[cfg(target_os = "linux")]
        let advised = self.native.advise(start, len, libc::MADV_FREE).is_ok();
        #[cfg(not(target_os = "linux"))]
        let advised = false;
        if !advised {
            self.native
                .posix_advise(start, len, libc::POSIX_MADV_DONTNEED)
                .map_err(|err| PalError::from_io(&err))?;
        }
        dump_advise(self.native.as_ref(), start, len, false);
        Ok(start)
    }

    /// `Free(address, size, freeType)` with exactly one of decommit and
    /// release.
    pub fn free(&self, address: usize, size: usize, free_type: FreeType) -> Result<()> {
        if address == 0 {
            return Err(PalError::InvalidAddress);
        }
        let decommit = free_type.contains(FreeType::DECOMMIT);
        let release = free_type.contains(FreeType::RELEASE);
        if decommit == release {
            return Err(PalError::InvalidParameter);
        }
        if decommit {
            self.decommit(address, size)
        } else {
            let result = {
                let mut state = self.state.lock();
                match state.ledger.find(address) {
                    Some(region) if region.base == address => {
                        if size != 0 {
                            Err(PalError::InvalidParameter)
                        } else {
                            self.release_region(&mut state, address)
                        }
                    }
                    _ => Err(PalError::InvalidAddress),
                }
            };
            self.oplog.record(
                VirtualOperation::Release,
                address,
                size,
                AllocationType::empty(),
                None,
                0,
                result.is_ok(),
            );
            result
        }
    }

    /// Returns the pages of `[address, address + size)` to the reserved
    /// state; the address range stays reserved.
    pub fn decommit(&self, address: usize, size: usize) -> Result<()> {
        let result = self.decommit_pages(address, size);
        self.oplog.record(
            VirtualOperation::Decommit,
            address,
            size,
            AllocationType::empty(),
            None,
            0,
            result.is_ok(),
        );
        result
    }

    fn decommit_pages(&self, address: usize, size: usize) -> Result<()> {
        if address == 0 {
            return Err(PalError::InvalidAddress);
        }
        if size == 0 {
            return Err(PalError::InvalidParameter);
        }
        let (start, len) = self.page_range(address, size)?;

        let mut state = self.state.lock();
        let region = state
            .ledger
            .find_mut(start)
            .ok_or_else(|| {
                error!(target: "virtual", "no region holds {:#x} on decommit", start);
                PalError::Internal("unable to locate the region information")
            })?;
        if !region.contains_range(start, len) {
            return Err(PalError::InvalidAddress);
        }

        self.native
            .map(
                start,
                len,
                libc::PROT_NONE,
                libc::MAP_FIXED | libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
            .map_err(|err| {
                error!(target: "virtual", "decommit remap of {:#x} failed: {}", start, err);
                PalError::Internal("decommit remap failed")
            })?;
        dump_advise(self.native.as_ref(), start, len, false);
        region.decommit_pages(start, len);
        Ok(())
    }

    /// Releases the whole region whose base is exactly `address`.
    pub fn release(&self, address: usize) -> Result<()> {
        self.free(address, 0, FreeType::RELEASE)
    }

    fn release_region(&self, state: &mut VirtualState, base: usize) -> Result<()> {
        let size = state
            .ledger
            .find(base)
            .map(|region| region.size)
            .ok_or(PalError::InvalidAddress)?;
        self.native.unmap(base, size).map_err(|err| {
            error!(target: "virtual", "munmap({:#x}, {:#x}) failed: {}", base, size, err);
            PalError::Internal("unable to unmap the memory")
        })?;
        state
            .ledger
            .remove(base)
            .map(|_| ())
            .ok_or(PalError::Internal("unable to remove the region from the ledger"))
    }

    /// Changes the protection of committed pages and returns the protection
    /// the first page had before.
    pub fn protect(
        &self,
        address: usize,
        size: usize,
        protection: PageProtection,
    ) -> Result<PageProtection> {
        let (start, len) = self.page_range(address, size)?;
        let end = start + len;

        let mut state = self.state.lock();
        for region in state.ledger.overlapping_mut(start, len) {
            let clip_start = start.max(region.base);
            let clip_end = end.min(region.end());
            if clip_end > clip_start && !region.all_committed(clip_start, clip_end - clip_start) {
                error!(target: "virtual", "protection can only change on committed memory");
                return Err(PalError::InvalidAddress);
            }
        }

        self.native
            .protect(start, len, to_native(protection))
            .map_err(|err| PalError::from_io(&err))?;

        let old = state
            .ledger
            .find(start)
            .map(|region| region.page(start).protection)
            .unwrap_or(PageProtection::ExecuteReadWrite);
        for region in state.ledger.overlapping_mut(start, len) {
            let clip_start = start.max(region.base);
            let clip_end = end.min(region.end());
            if clip_end > clip_start {
                region.set_pages(
                    clip_start,
                    clip_end - clip_start,
                    PageState {
                        committed: true,
                        protection,
                    },
                );
            }
        }
        dump_advise(
            self.native.as_ref(),
            start,
            len,
            protection != PageProtection::NoAccess,
        );
        Ok(old)
    }

    /// Ledger view of `address`: the run of pages starting at the page that
    /// contains it and sharing its state and protection. `None` if no region
    /// covers it.
    pub fn query(&self, address: usize) -> Option<RegionInfo> {
        let start = align_down(address, self.page_size);
        let state = self.state.lock();
        let region = state.ledger.find(start)?;
        let (run_start, run_len, page) = region.run_at(start);
        Some(RegionInfo {
            base_address: run_start,
            allocation_base: region.base,
            allocation_protect: Some(region.allocation_protect),
            region_size: run_len,
            state: if page.committed {
                MemState::Committed
            } else {
                MemState::Reserved
            },
            protect: page.committed.then_some(page.protection),
            kind: Some(MemType::Private),
        })
    }

    /// Carves `size` bytes (rounded up to 64KB) out of the executable
    /// reservation without recording a region.
    pub fn reserve_executable_near(&self, size: usize) -> Option<usize> {
        let len = align_up(size, VIRTUAL_64KB)?;
        self.state.lock().exec.allocate(len)
    }

    /// Like [`reserve_executable_near`](Self::reserve_executable_near), but
    /// only inside `[begin, end]`; with `store_allocation_info` the grant
    /// becomes a reserved, no-access region in the ledger.
    pub fn reserve_executable_within_range(
        &self,
        begin: usize,
        end: usize,
        size: usize,
        store_allocation_info: bool,
    ) -> Option<usize> {
        let len = align_up(size, VIRTUAL_64KB)?;
        let allocation_type = AllocationType::RESERVE | AllocationType::RESERVE_EXECUTABLE;

        let mut state = self.state.lock();
        let mut address = state.exec.allocate_within_range(begin, end, len);
        if let (Some(base), true) = (address, store_allocation_info) {
            let region = Region::new(
                base,
                len,
                self.page_size,
                allocation_type,
                PageProtection::NoAccess,
            );
            if state.ledger.insert(region).is_err() {
                error!(target: "virtual", "unable to record executable reservation at {:#x}", base);
                let _ = self.native.unmap(base, len);
                address = None;
            }
        }
        self.oplog.record(
            VirtualOperation::ReserveFromExecutableAllocatorWithinRange,
            0,
            size,
            allocation_type,
            Some(PageProtection::NoAccess),
            address.unwrap_or(0),
            true,
        );
        address
    }

    pub fn executable_preferred_range(&self) -> (usize, usize) {
        self.state.lock().exec.preferred_range()
    }

    pub fn recent_operations(&self) -> Vec<LogRecord> {
        self.oplog.snapshot()
    }

    /// `(base, size)` of every tracked region, in address order.
    pub fn regions(&self) -> Vec<(usize, usize)> {
        self.state
            .lock()
            .ledger
            .iter()
            .map(|region| (region.base, region.size))
            .collect()
    }

    pub fn check_invariants(&self) -> bool {
        self.state.lock().ledger.check_invariants()
    }

    /// Forgets every region, warning about each one that was never
    /// released. The memory itself is left to process teardown.
    pub fn cleanup(&self) -> usize {
        let leaked = self.state.lock().ledger.drain();
        for region in &leaked {
            warn!(
                target: "virtual",
                "region {:#x} ({:#x} bytes) was never released",
                region.base,
                region.size
            );
        }
        leaked.len()
    }
}

/// Reserves `[hint, hint + size)` (anywhere if `hint` is 0) as
/// inaccessible, uncommitted memory. A hint the OS did not honour is
/// `InvalidAddress`.
pub(crate) fn reserve_native_range(
    native: &dyn NativeMemory,
    hint: usize,
    size: usize,
    executable: bool,
    large_pages: bool,
) -> Result<usize> {
    #[allow(unused_mut)]
    let mut flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
    if large_pages {
        #[cfg(target_os = "linux")]
        {
            flags |= libc::MAP_HUGETLB;
        }
        #[cfg(not(target_os = "linux"))]
        trace!(target: "virtual", "large pages requested but not supported");
    }
    #[cfg(target_os = "macos")]
    if executable {
        flags |= libc::MAP_JIT;
    }
    #[cfg(not(target_os = "macos"))]
    let _ = executable;

    let base = native
        .map(hint, size, libc::PROT_NONE, flags, -1, 0)
        .map_err(|err| {
            error!(target: "virtual", "reserve of {:#x} bytes failed: {}", size, err);
            PalError::NotEnoughMemory
        })?;
    if hint != 0 && base != hint {
        trace!(target: "virtual", "wanted {:#x}, mmap gave {:#x}", hint, base);
        let _ = native.unmap(base, size);
        return Err(PalError::InvalidAddress);
    }
    dump_advise(native, base, size, false);
    Ok(base)
}

/// Includes or excludes the range from core dumps. Best effort.
pub(crate) fn dump_advise(native: &dyn NativeMemory, start: usize, len: usize, include: bool) {
    #[cfg(target_os = "linux")]
    {
        let advice = if include {
            libc::MADV_DODUMP
        } else {
            libc::MADV_DONTDUMP
        };
        let _ = native.advise(start, len, advice);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = (native, start, len, include);
}
