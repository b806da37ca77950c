use crate::constants::*;

/// One of the six protection values accepted by the reservation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageProtection {
    NoAccess,
    ReadOnly,
    ReadWrite,
    WriteCopy,
    Execute,
    ExecuteRead,
    ExecuteReadWrite,
}

impl PageProtection {
    pub const ALL: [PageProtection; 7] = [
        PageProtection::NoAccess,
        PageProtection::ReadOnly,
        PageProtection::ReadWrite,
        PageProtection::WriteCopy,
        PageProtection::Execute,
        PageProtection::ExecuteRead,
        PageProtection::ExecuteReadWrite,
    ];

    pub fn win32(self) -> u32 {
        match self {
            PageProtection::NoAccess => PAGE_NOACCESS,
            PageProtection::ReadOnly => PAGE_READONLY,
            PageProtection::ReadWrite => PAGE_READWRITE,
            PageProtection::WriteCopy => PAGE_WRITECOPY,
            PageProtection::Execute => PAGE_EXECUTE,
            PageProtection::ExecuteRead => PAGE_EXECUTE_READ,
            PageProtection::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
        }
    }
}

/// Protection of a file-mapping object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingProtection {
    ReadOnly,
    ReadWrite,
    WriteCopy,
}

impl MappingProtection {
    pub fn page_protection(self) -> PageProtection {
        match self {
            MappingProtection::ReadOnly => PageProtection::ReadOnly,
            MappingProtection::ReadWrite => PageProtection::ReadWrite,
            MappingProtection::WriteCopy => PageProtection::WriteCopy,
        }
    }

    /// Access right a freshly created mapping handle is opened with.
    pub fn opened_access(self) -> FileMapAccess {
        match self {
            MappingProtection::ReadOnly => FileMapAccess::READ,
            MappingProtection::ReadWrite => FileMapAccess::ALL_ACCESS,
            MappingProtection::WriteCopy => FileMapAccess::COPY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemState {
    Free,
    Reserved,
    Committed,
}

impl MemState {
    pub fn win32(self) -> u32 {
        match self {
            MemState::Free => MEM_FREE,
            MemState::Reserved => MEM_RESERVE,
            MemState::Committed => MEM_COMMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    Private,
    Mapped,
}

impl MemType {
    pub fn win32(self) -> u32 {
        match self {
            MemType::Private => MEM_PRIVATE,
            MemType::Mapped => MEM_MAPPED,
        }
    }
}

/// Result of `Query`. For a free address every field except `state` is
/// zero / `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub base_address: usize,
    pub allocation_base: usize,
    pub allocation_protect: Option<PageProtection>,
    pub region_size: usize,
    pub state: MemState,
    /// `None` unless `state` is `Committed`.
    pub protect: Option<PageProtection>,
    pub kind: Option<MemType>,
}

impl RegionInfo {
    pub fn free() -> Self {
        RegionInfo {
            base_address: 0,
            allocation_base: 0,
            allocation_protect: None,
            region_size: 0,
            state: MemState::Free,
            protect: None,
            kind: None,
        }
    }
}
