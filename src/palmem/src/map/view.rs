//! Mapped views.
//!
//! Every `MapView` result, and every piece of a mapped PE image, is one
//! [`MappedView`] in the [`ViewList`]. Removing a view from the list and
//! dropping its reference on the mapping object are two separate steps: the
//! reference is only dropped after the list lock is released, because the
//! last reference tears the object down.
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

use sysdefs::constants::FileMapAccess;
use sysdefs::data::{MappingProtection, MemState, MemType, RegionInfo};
use sysdefs::{PalError, Result};

use crate::config::SharedMappingPolicy;
use crate::map::mapping::MappingObject;
use crate::memory::native::NativeMemory;
use crate::memory::protection::{access_to_native, access_to_view_protection};
use crate::memory::{align_down, align_up};

/// A native shared mapping that several views may sit on, under
/// [`SharedMappingPolicy::OnePerFileRegion`]. Unmapped when the last view
/// referring to it goes away.
pub struct NativeMapHolder {
    native: Arc<dyn NativeMemory>,
    address: usize,
    size: usize,
    offset: u64,
    prot: AtomicI32,
}

impl NativeMapHolder {
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn prot(&self) -> i32 {
        self.prot.load(Ordering::Acquire)
    }

    /// Widens the protection of the whole native mapping to include `prot`.
    /// Every view sharing it sees the change.
    fn raise_protection(&self, prot: i32) -> Result<()> {
        let current = self.prot();
        if current & prot == prot {
            return Ok(());
        }
        let wanted = current | prot;
        trace!(target: "mapping", "raising protection of {:#x} to {:#x}", self.address, wanted);
        self.native
            .protect(self.address, self.size, wanted)
            .map_err(|err| PalError::from_io(&err))?;
        self.prot.store(wanted, Ordering::Release);
        Ok(())
    }
}

impl Drop for NativeMapHolder {
    fn drop(&mut self) {
        if let Err(err) = self.native.unmap(self.address, self.size) {
            error!(target: "mapping", "unable to unmap {:#x}: {}", self.address, err);
        }
    }
}

enum ViewBacking {
    /// The view owns its native mapping and unmaps it explicitly.
    Owned,
    Shared(Arc<NativeMapHolder>),
}

pub struct MappedView {
    pub address: usize,
    pub length: usize,
    pub access: FileMapAccess,
    /// Address returned by `MapImage` for views that belong to an image.
    pub pe_base: Option<usize>,
    mapping: Option<Arc<MappingObject>>,
    device: u64,
    inode: u64,
    backing: ViewBacking,
}

impl MappedView {
    /// A view over a native mapping the caller already established.
    pub(crate) fn owned(
        address: usize,
        length: usize,
        access: FileMapAccess,
        pe_base: Option<usize>,
        mapping: Option<Arc<MappingObject>>,
    ) -> Self {
        let (device, inode) = mapping
            .as_ref()
            .map_or((0, 0), |mapping| (mapping.device(), mapping.inode()));
        MappedView {
            address,
            length,
            access,
            pe_base,
            mapping,
            device,
            inode,
            backing: ViewBacking::Owned,
        }
    }

    pub fn mapping(&self) -> Option<&Arc<MappingObject>> {
        self.mapping.as_ref()
    }

    /// The native mapping this view sits on, when it may be shared.
    pub fn shared_holder(&self) -> Option<&Arc<NativeMapHolder>> {
        match &self.backing {
            ViewBacking::Shared(holder) => Some(holder),
            ViewBacking::Owned => None,
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.address && addr - self.address < self.length.max(1)
    }

    /// Tears down the native side of the view. The mapping reference goes
    /// with the returned value.
    fn release(self, native: &dyn NativeMemory) -> (Result<()>, Option<Arc<MappingObject>>) {
        let result = match self.backing {
            ViewBacking::Owned if self.length > 0 => native
                .unmap(self.address, self.length)
                .map_err(|err| {
                    error!(target: "mapping", "unable to unmap view {:#x}: {}", self.address, err);
                    PalError::Internal("unable to unmap the view")
                }),
            ViewBacking::Owned => Ok(()),
            ViewBacking::Shared(holder) => {
                drop(holder);
                Ok(())
            }
        };
        (result, self.mapping)
    }
}

/// `(address, length, access, pe_base)` of a view, for inspection.
pub type ViewSummary = (usize, usize, FileMapAccess, Option<usize>);

pub struct ViewList {
    native: Arc<dyn NativeMemory>,
    policy: SharedMappingPolicy,
    page_size: usize,
    views: Mutex<Vec<MappedView>>,
}

impl ViewList {
    pub fn new(native: Arc<dyn NativeMemory>, policy: SharedMappingPolicy) -> Self {
        let page_size = native.page_size();
        ViewList {
            native,
            policy,
            page_size,
            views: Mutex::new(Vec::new()),
        }
    }

    pub fn native(&self) -> &Arc<dyn NativeMemory> {
        &self.native
    }

    /// Maps `length` bytes (0 = the whole object) of `mapping` starting at
    /// file `offset`. `opened_access` is what the caller's handle allows.
    pub fn map_view(
        &self,
        mapping: Arc<MappingObject>,
        opened_access: FileMapAccess,
        access: FileMapAccess,
        offset: u64,
        length: usize,
    ) -> Result<usize> {
        if !access.is_supported_view_access() {
            return Err(PalError::InvalidParameter);
        }
        let file_offset = i64::try_from(offset).map_err(|_| PalError::InvalidParameter)?;
        if offset as usize & (self.page_size - 1) != 0 {
            return Err(PalError::InvalidParameter);
        }
        let length = if length == 0 {
            usize::try_from(mapping.max_size()).map_err(|_| PalError::InvalidParameter)?
        } else {
            length
        };
        if length == 0 {
            return Err(PalError::InvalidParameter);
        }
        desired_access_allowed(mapping.protection(), access, opened_access)?;

        let fd = mapping.raw_fd();
        let anonymous = if fd == -1 { libc::MAP_ANONYMOUS } else { 0 };
        let (prot, flags) = if access == FileMapAccess::COPY {
            (libc::PROT_READ | libc::PROT_WRITE, libc::MAP_PRIVATE | anonymous)
        } else {
            (access_to_native(access), libc::MAP_SHARED | anonymous)
        };

        // Reference left over when a sibling's object is shared instead.
        let mut spare: Option<Arc<MappingObject>> = None;
        let mut views = self.views.lock();
        let mapped = self.native.map(0, length, prot, flags, fd, file_offset);
        let view = match mapped {
            Ok(address) => {
                let backing = if self.policy == SharedMappingPolicy::OnePerFileRegion {
                    ViewBacking::Shared(Arc::new(NativeMapHolder {
                        native: self.native.clone(),
                        address,
                        size: length,
                        offset,
                        prot: AtomicI32::new(prot),
                    }))
                } else {
                    ViewBacking::Owned
                };
                MappedView {
                    address,
                    length,
                    access,
                    pe_base: None,
                    device: mapping.device(),
                    inode: mapping.inode(),
                    mapping: Some(mapping),
                    backing,
                }
            }
            Err(err)
                if err.raw_os_error() == Some(libc::ENOMEM)
                    && self.policy == SharedMappingPolicy::OnePerFileRegion
                    && fd != -1 =>
            {
                trace!(target: "mapping", "mmap hit ENOMEM, looking for a mapping to share");
                let reused = find_shared_replacement(
                    &views,
                    mapping.device(),
                    mapping.inode(),
                    length,
                    offset,
                )
                .ok_or(PalError::NotEnoughMemory)?;
                reused.raise_protection(prot)?;
                let address = reused.address() + (offset - reused.offset()) as usize;
                let sibling = views
                    .iter()
                    .find(|view| match &view.backing {
                        ViewBacking::Shared(holder) => Arc::ptr_eq(holder, &reused),
                        ViewBacking::Owned => false,
                    })
                    .and_then(|view| view.mapping.clone());
                let device = mapping.device();
                let inode = mapping.inode();
                let mapping = match sibling {
                    Some(sibling) => {
                        spare = Some(mapping);
                        sibling
                    }
                    None => mapping,
                };
                MappedView {
                    address,
                    length,
                    access,
                    pe_base: None,
                    device,
                    inode,
                    mapping: Some(mapping),
                    backing: ViewBacking::Shared(reused),
                }
            }
            Err(err) => {
                error!(target: "mapping", "mmap of view failed: {}", err);
                return Err(PalError::NotEnoughMemory);
            }
        };
        let address = view.address;
        views.push(view);
        drop(views);
        drop(spare);
        trace!(target: "mapping", "mapped view at {:#x} ({:#x} bytes)", address, length);
        Ok(address)
    }

    /// Removes the view that starts exactly at `address`.
    pub fn unmap_view(&self, address: usize) -> Result<()> {
        let (result, mapping) = {
            let mut views = self.views.lock();
            let index = views
                .iter()
                .position(|view| view.address == address && view.pe_base.is_none())
                .ok_or(PalError::InvalidHandle)?;
            views.remove(index).release(self.native.as_ref())
        };
        // The object reference is released with the list unlocked.
        drop(mapping);
        result
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Vec<MappedView>> {
        self.views.lock()
    }

    /// Removes and unmaps every view of the image mapped at `pe_base`.
    pub fn unmap_image_views(&self, pe_base: usize) -> Result<usize> {
        let removed: Vec<MappedView> = {
            let mut views = self.views.lock();
            let mut removed = Vec::new();
            let mut index = 0;
            while index < views.len() {
                if views[index].pe_base == Some(pe_base) {
                    removed.push(views.remove(index));
                } else {
                    index += 1;
                }
            }
            removed
        };
        if removed.is_empty() {
            error!(target: "loader", "no image is mapped at {:#x}", pe_base);
            return Err(PalError::InvalidParameter);
        }

        let count = removed.len();
        let mut result = Ok(count);
        for view in removed {
            let (unmapped, mapping) = view.release(self.native.as_ref());
            if unmapped.is_err() {
                error!(target: "loader", "unable to unmap an image view, expect trouble");
                result = Err(PalError::Internal("unable to unmap an image view"));
            }
            drop(mapping);
        }
        result
    }

    /// Advises that the view starting at `address` will not be touched
    /// again and drops its recorded access. Unknown addresses are ignored.
    pub fn mark_not_needed(&self, address: usize) -> Result<()> {
        if address == 0 {
            return Err(PalError::InvalidParameter);
        }
        let mut views = self.views.lock();
        if let Some(view) = views.iter_mut().find(|view| view.address == address) {
            self.native
                .posix_advise(view.address, view.length, libc::POSIX_MADV_DONTNEED)
                .map_err(|err| {
                    error!(target: "loader", "unable to mark {:#x} as not needed: {}", address, err);
                    PalError::from_io(&err)
                })?;
            view.access = FileMapAccess::empty();
        } else {
            trace!(target: "loader", "no view starts at {:#x}", address);
        }
        Ok(())
    }

    /// `Query` answer for an address inside a view.
    pub fn region_info(&self, address: usize) -> Option<RegionInfo> {
        let start = align_down(address, self.page_size);
        let views = self.views.lock();
        let view = views.iter().find(|view| view.contains(start) || view.contains(address))?;
        let mapped_size = align_up(view.length, self.page_size)?;
        let protect = access_to_view_protection(view.access);
        let base = start.max(view.address);
        Some(RegionInfo {
            base_address: base,
            allocation_base: view.address,
            allocation_protect: Some(protect),
            region_size: mapped_size + view.address - base,
            state: MemState::Committed,
            protect: Some(protect),
            kind: Some(MemType::Mapped),
        })
    }

    pub fn len(&self) -> usize {
        self.views.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.lock().is_empty()
    }

    /// Views belonging to the image mapped at `pe_base`, in address order.
    pub fn image_views(&self, pe_base: usize) -> Vec<ViewSummary> {
        let mut views: Vec<ViewSummary> = self
            .views
            .lock()
            .iter()
            .filter(|view| view.pe_base == Some(pe_base))
            .map(|view| (view.address, view.length, view.access, view.pe_base))
            .collect();
        views.sort_by_key(|view| view.0);
        views
    }
}

/// A shared, non-copy view of the same file whose native mapping fully
/// contains `[offset, offset + size)`. The search stops at the first
/// mapping that touches the range, reusable or not.
fn find_shared_replacement(
    views: &[MappedView],
    device: u64,
    inode: u64,
    size: usize,
    offset: u64,
) -> Option<Arc<NativeMapHolder>> {
    if size == 0 {
        return None;
    }
    for view in views {
        if view.device != device || view.inode != inode || view.access == FileMapAccess::COPY {
            continue;
        }
        let holder = match &view.backing {
            ViewBacking::Shared(holder) => holder,
            ViewBacking::Owned => continue,
        };
        let holder_end = holder.offset() + holder.size() as u64;
        if holder.offset() <= offset && holder_end >= offset {
            if holder_end >= offset + size as u64 {
                return Some(holder.clone());
            }
            return None;
        }
    }
    None
}

/// Checks a view's requested access against the mapping's protection
/// (`InvalidParameter`) and against the handle's opened access
/// (`AccessDenied`).
pub fn desired_access_allowed(
    protection: MappingProtection,
    access: FileMapAccess,
    opened_access: FileMapAccess,
) -> Result<()> {
    if protection == MappingProtection::ReadOnly && access != FileMapAccess::READ {
        return Err(PalError::InvalidParameter);
    }
    if access == FileMapAccess::WRITE && protection != MappingProtection::ReadWrite {
        return Err(PalError::InvalidParameter);
    }
    if access == FileMapAccess::COPY && protection != MappingProtection::WriteCopy {
        return Err(PalError::InvalidParameter);
    }

    let opened_read =
        opened_access == FileMapAccess::READ || opened_access == FileMapAccess::ALL_ACCESS;
    let opened_write =
        opened_access == FileMapAccess::WRITE || opened_access == FileMapAccess::ALL_ACCESS;
    if access == FileMapAccess::READ && !opened_read {
        return Err(PalError::AccessDenied);
    }
    if access.contains(FileMapAccess::WRITE) && !opened_write {
        return Err(PalError::AccessDenied);
    }
    if access == FileMapAccess::COPY && opened_access != FileMapAccess::COPY {
        return Err(PalError::AccessDenied);
    }
    Ok(())
}
