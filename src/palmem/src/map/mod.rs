//! File mappings, mapped views and mapped PE images.
//!
//! A [`MappingObject`] is what `CreateMapping` produces: a description of a
//! backing source (anonymous memory, an open file, or a temporary file the
//! layer creates itself), shared through `Arc` by every handle and every
//! view that refers to it. Views live in one list guarded by its own mutex;
//! that lock is never held while the reservation engine's lock is taken.
pub mod mapping;
pub mod pe;
pub mod view;

pub use mapping::{MappingHandle, MappingObject, MappingSource, MappingTable};
pub use pe::PeImageMapper;
pub use view::{MappedView, NativeMapHolder, ViewList};
