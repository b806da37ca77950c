//! Executable-memory sub-allocator.
//!
//! At start-up one large range is reserved as close as possible to the
//! runtime's own image, so that generated code and jump stubs can reach the
//! runtime with 32-bit displacements. Later executable reservations are
//! carved from it with a bump pointer:
//!
//! ```text
//!   start      next_free                                  start + total
//!   |--offset--|=== handed out ===|------ remaining -------|
//!              ^ 64KB aligned      ^ 64KB aligned
//! ```
//!
//! Nothing is ever returned to the allocator; released grants go back to
//! the OS through `munmap`. All methods must be called with the reservation
//! engine's lock held.
use std::ffi::c_void;

use rand::Rng;
use tracing::{debug, warn};

use sysdefs::constants::{
    CORECLR_LIBRARY_SIZE, MAX_EXECUTABLE_MEMORY_SIZE, MAX_EXECUTABLE_START_OFFSET_PAGES,
    MEMORY_PROBING_INCREMENT, VIRTUAL_64KB,
};

use crate::config::PalConfig;
use crate::memory::native::NativeMemory;
use crate::memory::virtual_mem::reserve_native_range;
use crate::memory::{align_down, align_up};

const LOW_4GB: usize = 0xFFFF_FFFF;

#[derive(Debug, Default)]
pub struct ExecutableMemoryAllocator {
    start: usize,
    total_size: usize,
    next_free: usize,
    remaining: usize,
    preferred_start: usize,
    preferred_end: usize,
}

impl ExecutableMemoryAllocator {
    /// An allocator that refuses every request.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Reserves the executable range near the runtime image. Falls back to
    /// an unconstrained reservation, and to a disabled allocator if even
    /// that fails.
    pub fn initialize(native: &dyn NativeMemory, config: &PalConfig) -> Self {
        if !cfg!(target_pointer_width = "64") || !config.initialize_executable_allocator {
            return Self::disabled();
        }

        let page_size = native.page_size();
        let near_size = align_down(executable_reserve_size(config), VIRTUAL_64KB);
        let load_address = runtime_load_address();

        let near = if load_address != 0 && near_size >= MEMORY_PROBING_INCREMENT {
            probe_near(native, load_address, near_size)
        } else {
            None
        };

        let (start, size, preferred) = match near {
            Some((start, size)) => {
                let preferred = if start < load_address {
                    (start, load_address + CORECLR_LIBRARY_SIZE)
                } else {
                    (load_address, start + size)
                };
                (start, size, preferred)
            }
            None => {
                let size = MAX_EXECUTABLE_MEMORY_SIZE.min(near_size.max(MEMORY_PROBING_INCREMENT));
                match reserve_native_range(native, 0, size, true, false) {
                    Ok(start) => (start, size, (start, start + size)),
                    Err(err) => {
                        warn!(target: "virtual", "no executable reservation available: {}", err);
                        return Self::disabled();
                    }
                }
            }
        };

        let offset_pages = if config.randomize_executable_start {
            rand::thread_rng().gen_range(0..=MAX_EXECUTABLE_START_OFFSET_PAGES)
        } else {
            0
        };
        let mut allocator = Self::from_reservation(start, size, offset_pages * page_size);
        allocator.preferred_start = preferred.0;
        allocator.preferred_end = preferred.1;
        debug!(
            target: "virtual",
            "executable reservation {:#x}..{:#x}, preferred {:#x}..{:#x}",
            start,
            start + size,
            preferred.0,
            preferred.1
        );
        allocator
    }

    /// Bookkeeping over an already reserved `[start, start + size)`, with the
    /// bump pointer starting `offset` bytes in (rounded up to 64KB).
    pub fn from_reservation(start: usize, size: usize, offset: usize) -> Self {
        let next_free = align_up(start + offset, VIRTUAL_64KB).unwrap_or(start + size);
        let used = (next_free - start).min(size);
        ExecutableMemoryAllocator {
            start,
            total_size: size,
            next_free,
            remaining: align_down(size - used, VIRTUAL_64KB),
            preferred_start: start,
            preferred_end: start + size,
        }
    }

    /// Hands out `size` bytes rounded up to 64KB, or `None` if the
    /// reservation cannot satisfy it.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        let size = align_up(size, VIRTUAL_64KB)?;
        if size == 0 || size > self.remaining {
            return None;
        }
        let address = self.next_free;
        self.next_free += size;
        self.remaining -= size;
        Some(address)
    }

    /// Like [`allocate`](Self::allocate), but only if the grant lies within
    /// `[begin, end]`.
    pub fn allocate_within_range(&mut self, begin: usize, end: usize, size: usize) -> Option<usize> {
        let size = align_up(size, VIRTUAL_64KB)?;
        if size == 0 || begin > end || size > self.remaining {
            return None;
        }
        let address = self.next_free;
        if address < begin {
            return None;
        }
        let next_free = address.checked_add(size)?;
        if next_free > end {
            return None;
        }
        self.next_free = next_free;
        self.remaining -= size;
        Some(address)
    }

    /// Range in which code can reach both the runtime image and the
    /// executable reservation with 32-bit displacements.
    pub fn preferred_range(&self) -> (usize, usize) {
        (self.preferred_start, self.preferred_end)
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_enabled(&self) -> bool {
        self.total_size != 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.start + self.total_size
    }
}

/// Tries successively smaller reservations next to the runtime image: above
/// it when it sits low in the address space, below it otherwise, then the
/// other direction.
fn probe_near(native: &dyn NativeMemory, load_address: usize, max_size: usize) -> Option<(usize, usize)> {
    let prefer_above = load_address < LOW_4GB
        || load_address.saturating_sub(max_size) < LOW_4GB;

    let above = |native: &dyn NativeMemory| {
        let mut hint = load_address.checked_add(CORECLR_LIBRARY_SIZE)?;
        let mut size = max_size;
        while size >= MEMORY_PROBING_INCREMENT {
            if let Ok(start) = reserve_native_range(native, hint, size, true, false) {
                return Some((start, size));
            }
            size -= MEMORY_PROBING_INCREMENT;
            hint = hint.checked_add(MEMORY_PROBING_INCREMENT)?;
        }
        None
    };
    let below = |native: &dyn NativeMemory| {
        let hint = load_address.checked_sub(max_size)?;
        let mut size = max_size;
        while size >= MEMORY_PROBING_INCREMENT {
            if let Ok(start) = reserve_native_range(native, hint, size, true, false) {
                return Some((start, size));
            }
            size -= MEMORY_PROBING_INCREMENT;
        }
        None
    };

    if prefer_above {
        above(native).or_else(|| below(native))
    } else {
        below(native).or_else(|| above(native))
    }
}

/// Configured cap, further limited by a share of `RLIMIT_AS` when the
/// address space is limited.
fn executable_reserve_size(config: &PalConfig) -> usize {
    let mut size = config.executable_reserve_limit;
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut limit) } == 0
        && limit.rlim_cur != libc::RLIM_INFINITY
    {
        let share = (limit.rlim_cur as u128 * config.executable_reserve_percent as u128 / 100) as usize;
        size = size.min(share);
    }
    size
}

extern "C" fn load_address_anchor() {}

/// Base address of the module this code is linked into.
fn runtime_load_address() -> usize {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let found = unsafe { libc::dladdr(load_address_anchor as *const c_void, &mut info) };
    if found == 0 {
        return 0;
    }
    info.dli_fbase as usize
}
