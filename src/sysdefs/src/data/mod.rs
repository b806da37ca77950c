pub mod mem_struct;

pub use mem_struct::*;
