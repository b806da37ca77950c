// palmem unit tests
//
// These run against the real address space through LibcMemory, or through
// FaultyMemory when a test needs a particular syscall to fail.

mod mapping_tests; // mapping objects, handles and views

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::PalConfig;
use crate::memory::{LibcMemory, NativeMemory, VirtualMemory};
use crate::Pal;

// Tests assert on process-wide address-space state, so they run one at a time
static TEST_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serializes the test and installs a log subscriber once.
pub fn test_setup() -> parking_lot::MutexGuard<'static, ()> {
    let guard = TEST_MUTEX.lock();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    guard
}

pub fn page_size() -> usize {
    LibcMemory::new().page_size()
}

/// A `Pal` without the executable reservation, so tests don't pin down a
/// large chunk of address space.
pub fn test_pal() -> Pal {
    Pal::new(PalConfig::without_executable_allocator())
}

pub fn test_vm(native: Arc<dyn NativeMemory>) -> VirtualMemory {
    VirtualMemory::new(native, &PalConfig::without_executable_allocator())
}

/// Wraps the real substrate and fails selected calls with `ENOMEM`.
#[derive(Default)]
pub struct FaultyMemory {
    inner: LibcMemory,
    /// Fail every `mprotect` that grants access.
    pub fail_protect: AtomicBool,
    /// Fail every `mmap` with `MAP_FIXED`.
    pub fail_fixed_map: AtomicBool,
    /// Fail every `mmap`.
    pub fail_map: AtomicBool,
    /// Let this many `mprotect` calls through before `fail_protect` applies.
    pub protect_budget: AtomicUsize,
    pub unmaps: AtomicUsize,
}

impl FaultyMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

fn enomem() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOMEM)
}

impl NativeMemory for FaultyMemory {
    fn page_size(&self) -> usize {
        self.inner.page_size()
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
        if self.fail_map.load(Ordering::SeqCst)
            || (flags & libc::MAP_FIXED != 0 && self.fail_fixed_map.load(Ordering::SeqCst))
        {
            return Err(enomem());
        }
        self.inner.map(addr, len, prot, flags, fd, offset)
    }

    fn protect(&self, addr: usize, len: usize, prot: i32) -> io::Result<()> {
        if prot != libc::PROT_NONE && self.fail_protect.load(Ordering::SeqCst) {
            let budget = self.protect_budget.load(Ordering::SeqCst);
            if budget == 0 {
                return Err(enomem());
            }
            self.protect_budget.store(budget - 1, Ordering::SeqCst);
        }
        self.inner.protect(addr, len, prot)
    }

    fn unmap(&self, addr: usize, len: usize) -> io::Result<()> {
        self.unmaps.fetch_add(1, Ordering::SeqCst);
        self.inner.unmap(addr, len)
    }

    fn advise(&self, addr: usize, len: usize, advice: i32) -> io::Result<()> {
        self.inner.advise(addr, len, advice)
    }

    fn posix_advise(&self, addr: usize, len: usize, advice: i32) -> io::Result<()> {
        self.inner.posix_advise(addr, len, advice)
    }

    fn region_at(&self, addr: usize) -> Option<sysdefs::data::RegionInfo> {
        self.inner.region_at(addr)
    }
}
