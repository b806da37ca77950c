pub mod err_const;
pub mod mem_const;

pub use err_const::*;
pub use mem_const::*;
