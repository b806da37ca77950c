use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tempfile::TempPath;
use tracing::{error, trace};

use sysdefs::constants::FileMapAccess;
use sysdefs::data::MappingProtection;
use sysdefs::{PalError, Result};

/// Name recorded for anonymous mappings.
pub const ANONYMOUS_MAPPING_NAME: &str = "/dev/zero";

/// Backing of a new mapping object.
pub enum MappingSource<'a> {
    /// Zero-filled memory not backed by any file.
    Anonymous,
    /// An open file; its descriptor is duplicated, the caller keeps theirs.
    File(&'a File),
    /// A temporary file created (and later removed) by the mapping layer.
    TempFile,
}

/// Opaque handle returned by `CreateMapping`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MappingHandle(u64);

impl MappingHandle {
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

pub struct MappingObject {
    file: Option<File>,
    file_name: PathBuf,
    temp_path: Option<TempPath>,
    protection: MappingProtection,
    max_size: u64,
    device: u64,
    inode: u64,
    shutting_down: Arc<AtomicBool>,
}

impl MappingObject {
    fn create(
        source: MappingSource<'_>,
        protection: MappingProtection,
        max_size: u64,
        shutting_down: Arc<AtomicBool>,
    ) -> Result<Self> {
        let (file, file_name, temp_path) = match source {
            MappingSource::Anonymous => {
                if max_size == 0 {
                    return Err(PalError::InvalidParameter);
                }
                (None, PathBuf::from(ANONYMOUS_MAPPING_NAME), None)
            }
            MappingSource::TempFile => {
                if max_size == 0 {
                    return Err(PalError::InvalidParameter);
                }
                let (file, path) = tempfile::NamedTempFile::new()
                    .map_err(|err| io_error("create temporary file", &err))?
                    .into_parts();
                (Some(file), path.to_path_buf(), Some(path))
            }
            MappingSource::File(file) => {
                check_file_permission(file, protection)?;
                let duplicate = file
                    .try_clone()
                    .map_err(|err| io_error("duplicate descriptor", &err))?;
                let name = descriptor_path(duplicate.as_raw_fd()).unwrap_or_default();
                (Some(duplicate), name, None)
            }
        };

        let mut object = MappingObject {
            file,
            file_name,
            temp_path,
            protection,
            max_size,
            device: 0,
            inode: 0,
            shutting_down,
        };
        object.size_backing_file()?;
        Ok(object)
    }

    /// Settles `max_size` against the backing file, growing the file when
    /// the protection allows it.
    fn size_backing_file(&mut self) -> Result<()> {
        let file = match &self.file {
            Some(file) => file,
            None => return Ok(()),
        };
        let metadata = file
            .metadata()
            .map_err(|err| io_error("stat backing file", &err))?;
        self.device = metadata.dev();
        self.inode = metadata.ino();

        let file_size = metadata.len();
        if file_size == 0 && self.max_size == 0 {
            return Err(PalError::FileInvalid);
        }
        if self.max_size > file_size {
            if self.protection != MappingProtection::ReadWrite && self.temp_path.is_none() {
                trace!(target: "mapping", "cannot grow a file mapped read-only or write-copy");
                return Err(PalError::NotEnoughMemory);
            }
            file.set_len(self.max_size).map_err(|err| {
                error!(target: "mapping", "unable to grow backing file: {}", err);
                PalError::NotEnoughMemory
            })?;
        } else if self.max_size == 0 {
            self.max_size = file_size;
        }
        Ok(())
    }

    /// Descriptor views are mapped from; -1 for anonymous mappings.
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_ref().map_or(-1, |file| file.as_raw_fd())
    }

    pub fn file_name(&self) -> &Path {
        &self.file_name
    }

    pub fn was_temp_file(&self) -> bool {
        self.temp_path.is_some()
    }

    pub fn protection(&self) -> MappingProtection {
        self.protection
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn device(&self) -> u64 {
        self.device
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn is_anonymous(&self) -> bool {
        self.file.is_none()
    }

    /// Object holding a duplicate of an image file's descriptor, for the
    /// views of a mapped PE image.
    pub(crate) fn for_image(file: &File, shutting_down: Arc<AtomicBool>) -> Result<Self> {
        let duplicate = file
            .try_clone()
            .map_err(|err| io_error("duplicate descriptor", &err))?;
        let metadata = duplicate
            .metadata()
            .map_err(|err| io_error("stat image file", &err))?;
        Ok(MappingObject {
            file_name: descriptor_path(duplicate.as_raw_fd()).unwrap_or_default(),
            file: Some(duplicate),
            temp_path: None,
            protection: MappingProtection::WriteCopy,
            max_size: metadata.len(),
            device: metadata.dev(),
            inode: metadata.ino(),
            shutting_down,
        })
    }
}

impl Drop for MappingObject {
    fn drop(&mut self) {
        // Temporary files are unlinked by `temp_path` in every case; the
        // descriptor is left to the OS once the process is exiting.
        if self.shutting_down.load(Ordering::Acquire) {
            if let Some(file) = self.file.take() {
                let _ = file.into_raw_fd();
            }
        }
        trace!(target: "mapping", "mapping object for {:?} destroyed", self.file_name);
    }
}

impl std::fmt::Debug for MappingObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingObject")
            .field("file_name", &self.file_name)
            .field("protection", &self.protection)
            .field("max_size", &self.max_size)
            .field("was_temp_file", &self.was_temp_file())
            .finish()
    }
}

/// The open mode of `file` has to allow what `protection` will do to it.
fn check_file_permission(file: &File, protection: MappingProtection) -> Result<()> {
    let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) };
    if flags == -1 {
        return Err(PalError::InvalidHandle);
    }
    let mode = flags & libc::O_ACCMODE;
    let allowed = match protection {
        MappingProtection::ReadOnly | MappingProtection::WriteCopy => mode != libc::O_WRONLY,
        MappingProtection::ReadWrite => mode == libc::O_RDWR,
    };
    if !allowed {
        error!(target: "mapping", "file open mode does not permit {:?}", protection);
        return Err(PalError::AccessDenied);
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn descriptor_path(fd: RawFd) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/self/fd/{}", fd)).ok()
}

#[cfg(not(target_os = "linux"))]
fn descriptor_path(_fd: RawFd) -> Option<PathBuf> {
    None
}

fn io_error(what: &str, err: &io::Error) -> PalError {
    error!(target: "mapping", "{} failed: {}", what, err);
    match err.raw_os_error() {
        Some(libc::ENOSPC) | Some(libc::ENOMEM) => PalError::NotEnoughMemory,
        Some(libc::EACCES) | Some(libc::EPERM) => PalError::AccessDenied,
        Some(libc::EBADF) => PalError::InvalidHandle,
        _ => PalError::Internal("file operation failed"),
    }
}

struct HandleEntry {
    mapping: Arc<MappingObject>,
    access: FileMapAccess,
}

/// Handle table for mapping objects.
pub struct MappingTable {
    handles: DashMap<MappingHandle, HandleEntry>,
    next_handle: AtomicU64,
    shutting_down: Arc<AtomicBool>,
}

impl MappingTable {
    pub fn new(shutting_down: Arc<AtomicBool>) -> Self {
        MappingTable {
            handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
            shutting_down,
        }
    }

    /// `CreateMapping`. Named mappings are not supported; an empty name
    /// counts as none.
    pub fn create(
        &self,
        source: MappingSource<'_>,
        protection: MappingProtection,
        max_size: u64,
        name: Option<&str>,
    ) -> Result<MappingHandle> {
        if name.map_or(false, |name| !name.is_empty()) {
            return Err(PalError::NotSupported);
        }
        let mapping =
            MappingObject::create(source, protection, max_size, self.shutting_down.clone())?;
        trace!(target: "mapping", "created {:?}", mapping);
        Ok(self.insert(Arc::new(mapping), protection.opened_access()))
    }

    fn insert(&self, mapping: Arc<MappingObject>, access: FileMapAccess) -> MappingHandle {
        let handle = MappingHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.handles.insert(handle, HandleEntry { mapping, access });
        handle
    }

    /// Opens another handle on the same object with `access`, which may not
    /// exceed what `handle` was opened with.
    pub fn duplicate(&self, handle: MappingHandle, access: FileMapAccess) -> Result<MappingHandle> {
        let (mapping, opened) = self.lookup(handle)?;
        if !access.is_supported_view_access() || !opened.contains(access) {
            return Err(PalError::AccessDenied);
        }
        Ok(self.insert(mapping, access))
    }

    /// The mapping object and the access `handle` was opened with.
    pub fn lookup(&self, handle: MappingHandle) -> Result<(Arc<MappingObject>, FileMapAccess)> {
        self.handles
            .get(&handle)
            .map(|entry| (entry.mapping.clone(), entry.access))
            .ok_or(PalError::InvalidHandle)
    }

    /// Drops the handle's reference; the object lives on while views use it.
    pub fn close(&self, handle: MappingHandle) -> Result<()> {
        self.handles
            .remove(&handle)
            .map(|_| ())
            .ok_or(PalError::InvalidHandle)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
