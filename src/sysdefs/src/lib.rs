//! Shared definitions for the PAL memory manager.
//!
//! `constants` carries the Win32-style flag values the runtime speaks in,
//! together with the error taxonomy. `data` carries the plain records that
//! cross the crate boundary (protection values, query results).
pub mod constants;
pub mod data;

pub use constants::{PalError, Result};
