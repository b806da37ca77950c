//! Error taxonomy of the memory manager.
//!
//! Every public operation reports failure through [`PalError`]. Callers that
//! still speak the Win32 "last error" dialect can recover the numeric code
//! with [`PalError::code`].

/// ===== Win32 error codes =====
pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;
pub const ERROR_INVALID_ACCESS: u32 = 12;
pub const ERROR_NOT_SUPPORTED: u32 = 50;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_INVALID_ADDRESS: u32 = 487;
pub const ERROR_NOACCESS: u32 = 998;
pub const ERROR_FILE_INVALID: u32 = 1006;
pub const ERROR_INTERNAL_ERROR: u32 = 1359;

pub type Result<T> = std::result::Result<T, PalError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PalError {
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("access denied")]
    AccessDenied,
    #[error("not enough memory")]
    NotEnoughMemory,
    #[error("attempt to access invalid address")]
    InvalidAddress,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("request not supported")]
    NotSupported,
    #[error("the mapped file is invalid")]
    FileInvalid,
    #[error("invalid access to memory location")]
    NoAccess,
    #[error("invalid access code")]
    InvalidAccess,
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl PalError {
    /// Win32 error code for this class.
    pub fn code(&self) -> u32 {
        match self {
            PalError::InvalidParameter => ERROR_INVALID_PARAMETER,
            PalError::AccessDenied => ERROR_ACCESS_DENIED,
            PalError::NotEnoughMemory => ERROR_NOT_ENOUGH_MEMORY,
            PalError::InvalidAddress => ERROR_INVALID_ADDRESS,
            PalError::InvalidHandle => ERROR_INVALID_HANDLE,
            PalError::NotSupported => ERROR_NOT_SUPPORTED,
            PalError::FileInvalid => ERROR_FILE_INVALID,
            PalError::NoAccess => ERROR_NOACCESS,
            PalError::InvalidAccess => ERROR_INVALID_ACCESS,
            PalError::Internal(_) => ERROR_INTERNAL_ERROR,
        }
    }

    /// Closest class for an errno coming back from `mmap`/`mprotect`.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EINVAL => PalError::InvalidAddress,
            libc::EACCES => PalError::InvalidAccess,
            libc::ENOMEM => PalError::NotEnoughMemory,
            _ => PalError::Internal("unexpected error from the OS"),
        }
    }

    pub fn from_io(err: &std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => PalError::from_errno(errno),
            None => PalError::Internal("unexpected error from the OS"),
        }
    }
}
