pub mod exec_alloc;
pub mod ledger;
pub mod native;
pub mod oplog;
pub mod protection;
pub mod virtual_mem;

pub use exec_alloc::ExecutableMemoryAllocator;
pub use ledger::{PageState, Region, RegionLedger};
pub use native::{LibcMemory, NativeMemory};
pub use oplog::{LogRecord, OpLog, VirtualOperation};
pub use virtual_mem::VirtualMemory;

/// Rounds `value` down to a multiple of `align` (a power of two).
#[inline]
pub fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `align` (a power of two). `None` on
/// overflow.
#[inline]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}
