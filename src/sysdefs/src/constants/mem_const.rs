//! Memory-management constants shared by the reservation engine, the
//! mapping manager and the image mapper.
use bitflags::bitflags;

/// ===== Page protection values =====
///
/// The six protections the runtime may request. They are exclusive values,
/// not combinable bits.
pub const PAGE_NOACCESS: u32 = 0x01;
pub const PAGE_READONLY: u32 = 0x02;
pub const PAGE_READWRITE: u32 = 0x04;
pub const PAGE_WRITECOPY: u32 = 0x08;
pub const PAGE_EXECUTE: u32 = 0x10;
pub const PAGE_EXECUTE_READ: u32 = 0x20;
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;

/// ===== Allocation / free types =====
pub const MEM_COMMIT: u32 = 0x1000;
pub const MEM_RESERVE: u32 = 0x2000;
pub const MEM_DECOMMIT: u32 = 0x4000;
pub const MEM_RELEASE: u32 = 0x8000;
pub const MEM_FREE: u32 = 0x10000;
pub const MEM_PRIVATE: u32 = 0x20000;
pub const MEM_MAPPED: u32 = 0x40000;
pub const MEM_RESET: u32 = 0x80000;
pub const MEM_TOP_DOWN: u32 = 0x100000;
pub const MEM_WRITE_WATCH: u32 = 0x200000;
pub const MEM_LARGE_PAGES: u32 = 0x20000000;
/// Ask for the reservation to come out of the executable sub-allocator.
pub const MEM_RESERVE_EXECUTABLE: u32 = 0x40000000;

/// ===== File-mapping view access =====
pub const FILE_MAP_COPY: u32 = 0x0001;
pub const FILE_MAP_WRITE: u32 = 0x0002;
pub const FILE_MAP_READ: u32 = 0x0004;
pub const FILE_MAP_ALL_ACCESS: u32 = FILE_MAP_READ | FILE_MAP_WRITE;

/// Granularity of every reservation start address.
pub const VIRTUAL_64KB: usize = 0x10000;

/// ===== Executable sub-allocator sizing =====
///
/// Largest span reachable with a signed 32-bit displacement.
pub const MAX_EXECUTABLE_MEMORY_SIZE: usize = 0x7FFF_0000;
/// Rough size of the runtime library image; the near reservation leaves
/// room for it so code inside the library can still reach the far end.
pub const CORECLR_LIBRARY_SIZE: usize = 100 * 1024 * 1024;
pub const MAX_EXECUTABLE_MEMORY_SIZE_NEAR_CORECLR: usize =
    MAX_EXECUTABLE_MEMORY_SIZE - CORECLR_LIBRARY_SIZE;
/// Step between two placement probes, and the amount the requested size
/// shrinks after each failed probe.
pub const MEMORY_PROBING_INCREMENT: usize = 128 * 1024 * 1024;
/// Upper bound (in pages) of the random offset applied to the start of the
/// executable reservation.
pub const MAX_EXECUTABLE_START_OFFSET_PAGES: usize = 64;

/// ===== PE section characteristics =====
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;
pub const IMAGE_SIZEOF_SECTION_HEADER: usize = 40;

bitflags! {
    /// `allocationType` argument of `Alloc`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocationType: u32 {
        const COMMIT = MEM_COMMIT;
        const RESERVE = MEM_RESERVE;
        const RESET = MEM_RESET;
        const TOP_DOWN = MEM_TOP_DOWN;
        const WRITE_WATCH = MEM_WRITE_WATCH;
        const LARGE_PAGES = MEM_LARGE_PAGES;
        const RESERVE_EXECUTABLE = MEM_RESERVE_EXECUTABLE;
    }
}

bitflags! {
    /// `freeType` argument of `Free`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FreeType: u32 {
        const DECOMMIT = MEM_DECOMMIT;
        const RELEASE = MEM_RELEASE;
    }
}

bitflags! {
    /// Access requested for a view, or granted when a mapping handle was
    /// opened. `ALL_ACCESS` is `READ | WRITE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileMapAccess: u32 {
        const COPY = FILE_MAP_COPY;
        const WRITE = FILE_MAP_WRITE;
        const READ = FILE_MAP_READ;
        const ALL_ACCESS = FILE_MAP_ALL_ACCESS;
    }
}

impl FileMapAccess {
    /// True for the four values a view may be requested with.
    pub fn is_supported_view_access(self) -> bool {
        self == FileMapAccess::COPY
            || self == FileMapAccess::WRITE
            || self == FileMapAccess::READ
            || self == FileMapAccess::ALL_ACCESS
    }
}
