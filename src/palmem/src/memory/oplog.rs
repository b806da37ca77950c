//! Bounded log of the most recent virtual-memory operations.
//!
//! The reservation engine appends one [`LogRecord`] per operation, failed
//! ones included. Only the last [`OPLOG_CAPACITY`] records are kept; they
//! are meant to be read from a debugger or a crash report, and are mirrored
//! to `tracing` at trace level.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::trace;

use sysdefs::constants::AllocationType;
use sysdefs::data::PageProtection;

pub const OPLOG_CAPACITY: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtualOperation {
    Allocate,
    Reserve,
    Commit,
    Decommit,
    Release,
    Reset,
    ReserveFromExecutableAllocatorWithinRange,
}

#[derive(Clone, Debug)]
pub struct LogRecord {
    pub record_id: u64,
    pub operation: VirtualOperation,
    pub thread: ThreadId,
    pub requested_address: usize,
    pub returned_address: usize,
    pub size: usize,
    pub allocation_type: AllocationType,
    pub protection: Option<PageProtection>,
    pub succeeded: bool,
}

pub struct OpLog {
    next_id: AtomicU64,
    records: Mutex<VecDeque<LogRecord>>,
}

impl OpLog {
    pub fn new() -> Self {
        OpLog {
            next_id: AtomicU64::new(0),
            records: Mutex::new(VecDeque::with_capacity(OPLOG_CAPACITY)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        operation: VirtualOperation,
        requested_address: usize,
        size: usize,
        allocation_type: AllocationType,
        protection: Option<PageProtection>,
        returned_address: usize,
        succeeded: bool,
    ) {
        let record = LogRecord {
            record_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            operation,
            thread: thread::current().id(),
            requested_address,
            returned_address,
            size,
            allocation_type,
            protection,
            succeeded,
        };
        trace!(
            target: "virtual",
            id = record.record_id,
            op = ?operation,
            requested = format_args!("{:#x}", requested_address),
            returned = format_args!("{:#x}", returned_address),
            size,
            succeeded,
            "vm op"
        );

        let mut records = self.records.lock();
        if records.len() == OPLOG_CAPACITY {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.records.lock().iter().cloned().collect()
    }
}

impl Default for OpLog {
    fn default() -> Self {
        Self::new()
    }
}
