//! The `Pal` context: one reservation engine, one mapping table, one view
//! list and the image mapper, wired to the same native substrate.
//!
//! The runtime talks to the process-wide instance from [`Pal::global`];
//! tests build private instances with [`Pal::with_native`].
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::{trace, warn};

use sysdefs::constants::{AllocationType, FileMapAccess, FreeType};
use sysdefs::data::{MappingProtection, PageProtection, RegionInfo};
use sysdefs::Result;

use crate::config::PalConfig;
use crate::map::{MappingHandle, MappingSource, MappingTable, PeImageMapper, ViewList};
use crate::memory::{align_down, LibcMemory, LogRecord, NativeMemory, VirtualMemory};

static GLOBAL_PAL: Lazy<Pal> = Lazy::new(|| Pal::new(PalConfig::from_env()));

pub struct Pal {
    config: PalConfig,
    native: Arc<dyn NativeMemory>,
    virtual_memory: Arc<VirtualMemory>,
    mappings: MappingTable,
    views: Arc<ViewList>,
    images: PeImageMapper,
    shutting_down: Arc<AtomicBool>,
}

impl Pal {
    /// The process-wide instance, configured from the environment on first
    /// use.
    pub fn global() -> &'static Pal {
        &GLOBAL_PAL
    }

    pub fn new(config: PalConfig) -> Self {
        Self::with_native(config, Arc::new(LibcMemory::new()))
    }

    pub fn with_native(config: PalConfig, native: Arc<dyn NativeMemory>) -> Self {
        let shutting_down = Arc::new(AtomicBool::new(false));
        let virtual_memory = Arc::new(VirtualMemory::new(native.clone(), &config));
        let views = Arc::new(ViewList::new(native.clone(), config.shared_mapping_policy));
        let images = PeImageMapper::new(
            views.clone(),
            virtual_memory.clone(),
            config.clone(),
            shutting_down.clone(),
        );
        Pal {
            mappings: MappingTable::new(shutting_down.clone()),
            config,
            native,
            virtual_memory,
            views,
            images,
            shutting_down,
        }
    }

    pub fn config(&self) -> &PalConfig {
        &self.config
    }

    pub fn virtual_memory(&self) -> &VirtualMemory {
        &self.virtual_memory
    }

    pub fn views(&self) -> &ViewList {
        &self.views
    }

    pub fn mappings(&self) -> &MappingTable {
        &self.mappings
    }

    pub fn alloc(
        &self,
        address: usize,
        size: usize,
        allocation_type: AllocationType,
        protection: PageProtection,
    ) -> Result<usize> {
        self.virtual_memory
            .alloc(address, size, allocation_type, protection)
    }

    pub fn free(&self, address: usize, size: usize, free_type: FreeType) -> Result<()> {
        trace!(
            target: "virtual",
            "free(address={:#x}, size={:#x}, type={:?})",
            address,
            size,
            free_type
        );
        self.virtual_memory.free(address, size, free_type)
    }

    pub fn protect(
        &self,
        address: usize,
        size: usize,
        protection: PageProtection,
    ) -> Result<PageProtection> {
        trace!(
            target: "virtual",
            "protect(address={:#x}, size={:#x}, protect={:?})",
            address,
            size,
            protection
        );
        self.virtual_memory.protect(address, size, protection)
    }

    /// Ledger first, then mapped views, then whatever the OS reports.
    /// Addresses nobody knows about come back free, with no size.
    pub fn query(&self, address: usize) -> RegionInfo {
        if let Some(info) = self.virtual_memory.query(address) {
            return info;
        }
        if let Some(info) = self.views.region_info(address) {
            return info;
        }
        if let Some(info) = self.native.region_at(address) {
            return info;
        }
        RegionInfo {
            base_address: align_down(address, self.native.page_size()),
            ..RegionInfo::free()
        }
    }

    pub fn reserve_executable_near(&self, size: usize) -> Option<usize> {
        self.virtual_memory.reserve_executable_near(size)
    }

    pub fn reserve_executable_within_range(
        &self,
        begin: usize,
        end: usize,
        size: usize,
        store_allocation_info: bool,
    ) -> Option<usize> {
        self.virtual_memory
            .reserve_executable_within_range(begin, end, size, store_allocation_info)
    }

    pub fn executable_preferred_range(&self) -> (usize, usize) {
        self.virtual_memory.executable_preferred_range()
    }

    pub fn create_file_mapping(
        &self,
        source: MappingSource<'_>,
        protection: MappingProtection,
        max_size: u64,
        name: Option<&str>,
    ) -> Result<MappingHandle> {
        self.mappings.create(source, protection, max_size, name)
    }

    pub fn duplicate_mapping_handle(
        &self,
        handle: MappingHandle,
        access: FileMapAccess,
    ) -> Result<MappingHandle> {
        self.mappings.duplicate(handle, access)
    }

    pub fn close_handle(&self, handle: MappingHandle) -> Result<()> {
        self.mappings.close(handle)
    }

    pub fn map_view(
        &self,
        handle: MappingHandle,
        access: FileMapAccess,
        offset: u64,
        length: usize,
    ) -> Result<usize> {
        trace!(
            target: "mapping",
            "map_view(handle={}, access={:?}, offset={:#x}, length={:#x})",
            handle.as_raw(),
            access,
            offset,
            length
        );
        let (mapping, opened_access) = self.mappings.lookup(handle)?;
        self.views
            .map_view(mapping, opened_access, access, offset, length)
    }

    pub fn unmap_view(&self, address: usize) -> Result<()> {
        trace!(target: "mapping", "unmap_view({:#x})", address);
        self.views.unmap_view(address)
    }

    pub fn map_image(&self, file: &File, offset: u64) -> Result<usize> {
        self.images.map_image(file, offset)
    }

    pub fn unmap_image(&self, loaded_base: usize) -> Result<()> {
        self.images.unmap_image(loaded_base).map(|_| ())
    }

    pub fn mark_region_not_needed(&self, address: usize) -> Result<()> {
        self.images.mark_section_not_needed(address)
    }

    pub fn recent_operations(&self) -> Vec<LogRecord> {
        self.virtual_memory.recent_operations()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Switches mapping teardown to process-exit mode and reports regions
    /// that were never released. Returns how many there were.
    pub fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        let leaked = self.virtual_memory.cleanup();
        if leaked > 0 {
            warn!(target: "virtual", "{} regions still reserved at shutdown", leaked);
        }
        leaked
    }
}
