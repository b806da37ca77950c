//! Native memory substrate.
//!
//! Every OS call the memory manager makes goes through [`NativeMemory`], so
//! the engine above can be driven against a wrapper that injects failures.
//! [`LibcMemory`] is the real thing.
use std::ffi::c_void;
use std::io;
use std::os::unix::io::RawFd;

use sysdefs::data::{MemState, MemType, RegionInfo};

use crate::memory::{align_down, protection};

pub trait NativeMemory: Send + Sync {
    fn page_size(&self) -> usize;

    /// `mmap`. Returns the address the kernel picked.
    fn map(
        &self,
        addr: usize,
        len: usize,
        prot: i32,
        flags: i32,
        fd: RawFd,
        offset: i64,
    ) -> io::Result<usize>;

    fn protect(&self, addr: usize, len: usize, prot: i32) -> io::Result<()>;

    fn unmap(&self, addr: usize, len: usize) -> io::Result<()>;

    fn advise(&self, addr: usize, len: usize, advice: i32) -> io::Result<()>;

    /// `posix_madvise`; a hint the OS is free to ignore.
    fn posix_advise(&self, addr: usize, len: usize, advice: i32) -> io::Result<()>;

    /// OS view of whatever is mapped at `addr`, for addresses the memory
    /// manager itself does not track.
    fn region_at(&self, _addr: usize) -> Option<RegionInfo> {
        None
    }
}

#[derive(Debug)]
pub struct LibcMemory {
    page_size: usize,
}

impl LibcMemory {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        LibcMemory {
            page_size: if page_size > 0 { page_size as usize } else { 4096 },
        }
    }
}

impl Default for LibcMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeMemory for LibcMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map(
        &self,
        addr: usize,
        len: usize,
        prot: i32,
        flags: i32,
        fd: RawFd,
        offset: i64,
    ) -> io::Result<usize> {
        let ret = unsafe {
            libc::mmap(
                addr as *mut c_void,
                len,
                prot,
                flags,
                fd,
                offset as libc::off_t,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn protect(&self, addr: usize, len: usize, prot: i32) -> io::Result<()> {
        if unsafe { libc::mprotect(addr as *mut c_void, len, prot) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn unmap(&self, addr: usize, len: usize) -> io::Result<()> {
        if unsafe { libc::munmap(addr as *mut c_void, len) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn advise(&self, addr: usize, len: usize, advice: i32) -> io::Result<()> {
        if unsafe { libc::madvise(addr as *mut c_void, len, advice) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn posix_advise(&self, addr: usize, len: usize, advice: i32) -> io::Result<()> {
        let ret = unsafe { libc::posix_madvise(addr as *mut c_void, len, advice) };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn region_at(&self, addr: usize) -> Option<RegionInfo> {
        let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
        maps.lines()
            .find_map(|line| parse_maps_line(line, addr, self.page_size))
    }
}

/// One `/proc/self/maps` line, if it covers `addr`:
/// `start-end perms offset dev inode [path]`.
pub(crate) fn parse_maps_line(line: &str, addr: usize, page_size: usize) -> Option<RegionInfo> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    if addr < start || addr >= end {
        return None;
    }

    let perms = fields.next()?.as_bytes();
    let mut prot = libc::PROT_NONE;
    if perms.first() == Some(&b'r') {
        prot |= libc::PROT_READ;
    }
    if perms.get(1) == Some(&b'w') {
        prot |= libc::PROT_WRITE;
    }
    if perms.get(2) == Some(&b'x') {
        prot |= libc::PROT_EXEC;
    }
    let path = fields.nth(3);
    let kind = match path {
        Some(p) if !p.starts_with('[') => MemType::Mapped,
        _ => MemType::Private,
    };

    let base = align_down(addr, page_size);
    let protect = protection::from_native(prot);
    Some(RegionInfo {
        base_address: base,
        allocation_base: start,
        allocation_protect: Some(protect),
        region_size: end - base,
        state: MemState::Committed,
        protect: Some(protect),
        kind: Some(kind),
    })
}
