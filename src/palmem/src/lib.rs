//! Virtual-memory layer of the platform adaptation layer.
//!
//! The runtime asks for memory in Win32 terms (reserve, commit, decommit,
//! release, protect, query, file mappings, mapped PE images) and this crate
//! carries those requests out with POSIX `mmap`/`mprotect`/`munmap`/`madvise`.
//!
//! - [`memory`] holds the reservation engine: the protection translator, the
//!   region ledger, the executable sub-allocator and the operation log.
//! - [`map`] holds file-mapping objects, mapped views and the PE image mapper.
//! - [`pal`] ties both together behind the [`Pal`] context object that the
//!   runtime talks to.
pub mod config;
pub mod map;
pub mod memory;
pub mod pal;

pub use config::{PalConfig, SharedMappingPolicy};
pub use pal::Pal;
pub use sysdefs::{PalError, Result};

#[cfg(test)]
mod tests;
