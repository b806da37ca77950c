//! Translation between the runtime's protection vocabulary and POSIX
//! `PROT_*` bits.
//!
//! Only the six page protections and the three mapping protections are
//! representable. Anything else is rejected at the boundary with
//! `InvalidParameter`, so the rest of the crate works on the typed values.
use sysdefs::constants::*;
use sysdefs::data::{MappingProtection, PageProtection};
use sysdefs::{PalError, Result};

pub fn page_protection_from_win32(raw: u32) -> Result<PageProtection> {
    let protection = match raw {
        PAGE_NOACCESS => PageProtection::NoAccess,
        PAGE_READONLY => PageProtection::ReadOnly,
        PAGE_READWRITE => PageProtection::ReadWrite,
        PAGE_WRITECOPY => PageProtection::WriteCopy,
        PAGE_EXECUTE => PageProtection::Execute,
        PAGE_EXECUTE_READ => PageProtection::ExecuteRead,
        PAGE_EXECUTE_READWRITE => PageProtection::ExecuteReadWrite,
        _ => return Err(PalError::InvalidParameter),
    };
    Ok(protection)
}

pub fn mapping_protection_from_win32(raw: u32) -> Result<MappingProtection> {
    match raw {
        PAGE_READONLY => Ok(MappingProtection::ReadOnly),
        PAGE_READWRITE => Ok(MappingProtection::ReadWrite),
        PAGE_WRITECOPY => Ok(MappingProtection::WriteCopy),
        _ => Err(PalError::InvalidParameter),
    }
}

/// `PROT_*` bits for a page protection. Write-copy is plain read/write at
/// this level; copy-on-write comes from `MAP_PRIVATE` on the view.
pub fn to_native(protection: PageProtection) -> i32 {
    match protection {
        PageProtection::NoAccess => libc::PROT_NONE,
        PageProtection::ReadOnly => libc::PROT_READ,
        PageProtection::ReadWrite | PageProtection::WriteCopy => libc::PROT_READ | libc::PROT_WRITE,
        PageProtection::Execute => libc::PROT_EXEC,
        PageProtection::ExecuteRead => libc::PROT_READ | libc::PROT_EXEC,
        PageProtection::ExecuteReadWrite => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    }
}

/// Inverse of [`to_native`]. Write without read has no page protection of
/// its own and widens to the readable variant.
pub fn from_native(prot: i32) -> PageProtection {
    let read = prot & libc::PROT_READ != 0;
    let write = prot & libc::PROT_WRITE != 0;
    let exec = prot & libc::PROT_EXEC != 0;
    match (read, write, exec) {
        (false, false, false) => PageProtection::NoAccess,
        (true, false, false) => PageProtection::ReadOnly,
        (_, true, false) => PageProtection::ReadWrite,
        (false, false, true) => PageProtection::Execute,
        (true, false, true) => PageProtection::ExecuteRead,
        (_, true, true) => PageProtection::ExecuteReadWrite,
    }
}

/// `PROT_*` bits a shared view is mapped with for the requested access.
pub fn access_to_native(access: FileMapAccess) -> i32 {
    if access.contains(FileMapAccess::WRITE) || access.contains(FileMapAccess::COPY) {
        libc::PROT_READ | libc::PROT_WRITE
    } else if access.contains(FileMapAccess::READ) {
        libc::PROT_READ
    } else {
        libc::PROT_NONE
    }
}

/// Protection reported by `Query` for a mapped view.
pub fn access_to_view_protection(access: FileMapAccess) -> PageProtection {
    if access == FileMapAccess::ALL_ACCESS {
        PageProtection::ReadWrite
    } else if access.intersects(FileMapAccess::COPY | FileMapAccess::WRITE) {
        PageProtection::WriteCopy
    } else if access.contains(FileMapAccess::READ) {
        PageProtection::ReadOnly
    } else {
        PageProtection::NoAccess
    }
}
