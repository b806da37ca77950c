//! PE image mapper.
//!
//! Maps a PE file the way the Windows loader lays it out in memory, without
//! applying relocations. One PROT_NONE reservation covers the whole image;
//! the header and every section are then mapped over it with `MAP_FIXED`,
//! and the holes in between are recorded as inaccessible views:
//!
//! ```text
//!   loaded_base                                               image_end
//!   |-header-|--.text--|--gap--|--.data--|--.rdata--|---gap---|
//!    PROT_READ  R|X      NONE    R|W(priv) PROT_READ   NONE
//! ```
//!
//! Every view is tagged with the address `map_image` returns, which is what
//! `unmap_image` expects back.
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use goblin::pe::header::Header;
use goblin::pe::section_table::SectionTable;
use tracing::{debug, error, trace};

use sysdefs::constants::{
    FileMapAccess, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE,
    IMAGE_SIZEOF_SECTION_HEADER, VIRTUAL_64KB,
};
use sysdefs::{PalError, Result};

use crate::config::PalConfig;
use crate::map::mapping::MappingObject;
use crate::map::view::{MappedView, ViewList};
use crate::memory::native::NativeMemory;
use crate::memory::{align_down, align_up, VirtualMemory};

/// `PE\0\0` signature plus the COFF file header.
const NT_SIGNATURE_AND_FILE_HEADER: usize = 4 + 20;

#[cfg(target_pointer_width = "64")]
const NATIVE_OPTIONAL_HEADER_MAGIC: u16 = goblin::pe::optional_header::MAGIC_64;
#[cfg(not(target_pointer_width = "64"))]
const NATIVE_OPTIONAL_HEADER_MAGIC: u16 = goblin::pe::optional_header::MAGIC_32;

/// What the mapper needs out of the PE headers.
#[derive(Debug)]
struct ImageHeaders {
    preferred_base: usize,
    virtual_size: usize,
    section_alignment: usize,
    /// Offset of the section table from the start of the image.
    section_table_offset: usize,
    sections: Vec<SectionTable>,
}

impl ImageHeaders {
    fn read(file: &File, offset: u64, page_size: usize) -> Result<Self> {
        let file_len = file.metadata().map_err(|err| read_error(&err))?.len();
        let available = file_len.saturating_sub(offset);
        let probe_len = (page_size as u64).min(available) as usize;
        let mut bytes = read_at(file, offset, probe_len)?;

        let (pe_pointer, coff_header, optional) = {
            let header = Header::parse(&bytes).map_err(|err| {
                error!(target: "loader", "magic number mismatch: {}", err);
                PalError::InvalidParameter
            })?;
            (header.dos_header.pe_pointer, header.coff_header, header.optional_header)
        };
        let optional = optional.ok_or(PalError::InvalidParameter)?;
        if optional.standard_fields.magic != NATIVE_OPTIONAL_HEADER_MAGIC {
            error!(target: "loader", "optional header magic {:#x} is not native", optional.standard_fields.magic);
            return Err(PalError::InvalidParameter);
        }

        let preferred_base =
            usize::try_from(optional.windows_fields.image_base).map_err(|_| PalError::InvalidParameter)?;
        let virtual_size = optional.windows_fields.size_of_image as usize;
        if preferred_base == 0
            || virtual_size == 0
            || preferred_base.checked_add(virtual_size).is_none()
        {
            error!(target: "loader", "image is corrupt");
            return Err(PalError::InvalidParameter);
        }

        let section_table_offset = pe_pointer as usize
            + NT_SIGNATURE_AND_FILE_HEADER
            + coff_header.size_of_optional_header as usize;
        let section_count = coff_header.number_of_sections as usize;
        let section_table_end = section_table_offset + section_count * IMAGE_SIZEOF_SECTION_HEADER;
        if section_table_end > virtual_size {
            error!(target: "loader", "section table lies outside the image");
            return Err(PalError::InvalidParameter);
        }
        if section_table_end > bytes.len() {
            if section_table_end as u64 > available {
                return Err(PalError::InvalidParameter);
            }
            bytes = read_at(file, offset, section_table_end)?;
        }

        let mut cursor = section_table_offset;
        let sections = coff_header
            .sections(&bytes, &mut cursor)
            .map_err(|err| {
                error!(target: "loader", "unreadable section table: {}", err);
                PalError::InvalidParameter
            })?;

        Ok(ImageHeaders {
            preferred_base,
            virtual_size,
            section_alignment: optional.windows_fields.section_alignment as usize,
            section_table_offset,
            sections,
        })
    }
}

fn read_at(file: &File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    file.read_exact_at(&mut bytes, offset)
        .map_err(|err| read_error(&err))?;
    Ok(bytes)
}

fn read_error(err: &io::Error) -> PalError {
    error!(target: "loader", "reading image headers failed: {}", err);
    if err.kind() == io::ErrorKind::UnexpectedEof {
        PalError::InvalidParameter
    } else {
        PalError::from_io(err)
    }
}

/// Native protection for a section's characteristics.
fn section_protection(characteristics: u32) -> i32 {
    let mut prot = libc::PROT_NONE;
    if characteristics & IMAGE_SCN_MEM_EXECUTE != 0 {
        prot |= libc::PROT_EXEC;
    }
    if characteristics & IMAGE_SCN_MEM_READ != 0 {
        prot |= libc::PROT_READ;
    }
    if characteristics & IMAGE_SCN_MEM_WRITE != 0 {
        prot |= libc::PROT_WRITE;
    }
    prot
}

fn access_from_prot(prot: i32) -> FileMapAccess {
    let mut access = FileMapAccess::empty();
    if prot & libc::PROT_READ != 0 {
        access |= FileMapAccess::READ;
    }
    if prot & libc::PROT_WRITE != 0 {
        access |= FileMapAccess::WRITE;
    }
    access
}

/// Placement of one image inside its reservation.
struct ImagePlacement {
    loaded_base: usize,
    loaded_header: usize,
    header_size: usize,
    image_end: usize,
    read_only_flags: i32,
}

pub struct PeImageMapper {
    views: Arc<ViewList>,
    virtual_memory: Arc<VirtualMemory>,
    config: PalConfig,
    shutting_down: Arc<AtomicBool>,
}

impl PeImageMapper {
    pub fn new(
        views: Arc<ViewList>,
        virtual_memory: Arc<VirtualMemory>,
        config: PalConfig,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        PeImageMapper {
            views,
            virtual_memory,
            config,
            shutting_down,
        }
    }

    /// Maps the image found at `offset` in `file` and returns the address
    /// of its DOS header.
    pub fn map_image(&self, file: &File, offset: u64) -> Result<usize> {
        trace!(target: "loader", "map_image(offset={:#x})", offset);
        let native = self.views.native().clone();
        let page_size = native.page_size();

        let headers = ImageHeaders::read(file, offset, page_size)?;
        let mapping = Arc::new(MappingObject::for_image(file, self.shutting_down.clone())?);

        let offset_in_page = offset as usize & (page_size - 1);
        let mut reserve_size = headers
            .virtual_size
            .checked_add(offset_in_page)
            .ok_or(PalError::InvalidParameter)?;
        let overalign = headers.section_alignment > page_size;
        if overalign {
            reserve_size = reserve_size
                .checked_add(headers.section_alignment)
                .ok_or(PalError::InvalidParameter)?;
        }

        let (reserved, reserved_len) = self.reserve(native.as_ref(), &headers, reserve_size)?;

        let mut placement = ImagePlacement {
            loaded_base: reserved,
            loaded_header: 0,
            header_size: page_size,
            image_end: 0,
            read_only_flags: libc::MAP_PRIVATE | libc::MAP_FIXED,
        };
        if overalign {
            placement.loaded_base =
                align_up(reserved, headers.section_alignment).ok_or(PalError::InvalidParameter)?;
            placement.header_size = headers.section_alignment;
            if self.config.map_readonly_pe_huge_page_as_shared {
                placement.read_only_flags = libc::MAP_SHARED | libc::MAP_FIXED;
            }
        }
        placement.loaded_header = placement.loaded_base + offset_in_page;
        placement.image_end = align_up(placement.loaded_header + headers.virtual_size, page_size)
            .ok_or(PalError::InvalidParameter)?;

        // Slack on either side of the image goes back to the OS right away.
        if placement.loaded_base > reserved {
            let _ = native.unmap(reserved, placement.loaded_base - reserved);
        }
        if reserved + reserved_len > placement.image_end {
            let _ = native.unmap(placement.image_end, reserved + reserved_len - placement.image_end);
        }

        if placement.loaded_base != headers.preferred_base {
            debug!(
                target: "loader",
                "image rebased from {:#x} to {:#x}",
                headers.preferred_base,
                placement.loaded_base
            );
        }

        let mapped = self.map_parts(native.as_ref(), &headers, &mapping, &placement, offset);
        if let Err(err) = mapped {
            let _ = self.views.unmap_image_views(placement.loaded_header);
            let _ = native.unmap(
                placement.loaded_base,
                placement.image_end - placement.loaded_base,
            );
            return Err(err);
        }
        trace!(target: "loader", "map_image returns {:#x}", placement.loaded_header);
        Ok(placement.loaded_header)
    }

    /// Address space for the whole image: from the executable reservation
    /// when possible, otherwise a fresh PROT_NONE mapping.
    fn reserve(
        &self,
        native: &dyn NativeMemory,
        headers: &ImageHeaders,
        reserve_size: usize,
    ) -> Result<(usize, usize)> {
        let page_size = native.page_size();

        // Occupy the preferred base so the image has to be relocated.
        let mut reloc_blocker = None;
        if cfg!(debug_assertions) && self.config.force_relocs {
            if let Ok(blocker) = native.map(
                headers.preferred_base,
                page_size,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            ) {
                if blocker == headers.preferred_base {
                    reloc_blocker = Some(blocker);
                } else {
                    let _ = native.unmap(blocker, page_size);
                }
            }
        }

        let mut reservation = None;
        if cfg!(target_pointer_width = "64") && !self.config.use_default_base_addr {
            if let Some(len) = align_up(reserve_size, VIRTUAL_64KB) {
                reservation = self
                    .virtual_memory
                    .reserve_executable_near(len)
                    .map(|base| (base, len));
            }
        }

        let result = match reservation {
            Some(reservation) => Ok(reservation),
            None => {
                let hint = if self.config.use_default_base_addr {
                    headers.preferred_base
                } else {
                    0
                };
                let len = align_up(reserve_size, page_size).ok_or(PalError::InvalidParameter)?;
                native
                    .map(
                        hint,
                        len,
                        libc::PROT_NONE,
                        libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                        -1,
                        0,
                    )
                    .map(|base| (base, len))
                    .map_err(|err| {
                        error!(target: "loader", "image reservation failed: {}", err);
                        PalError::from_io(&err)
                    })
            }
        };

        if let Some(blocker) = reloc_blocker {
            let _ = native.unmap(blocker, page_size);
        }
        result
    }

    fn map_parts(
        &self,
        native: &dyn NativeMemory,
        headers: &ImageHeaders,
        mapping: &Arc<MappingObject>,
        placement: &ImagePlacement,
        offset: u64,
    ) -> Result<()> {
        let page_size = native.page_size();
        let fd = mapping.raw_fd();
        let tag = placement.loaded_header;
        let image_limit = placement.loaded_header + headers.virtual_size;
        let read_write_flags = libc::MAP_PRIVATE | libc::MAP_FIXED;

        let mut guard = self.views.lock();
        let views: &mut Vec<MappedView> = &mut guard;
        let mmap_and_record = |views: &mut Vec<MappedView>,
                                   address: usize,
                                   len: usize,
                                   prot: i32,
                                   flags: i32,
                                   file_offset: u64|
         -> Result<()> {
            let adjust = file_offset as usize & (page_size - 1);
            let base = address - adjust;
            let mapped = native
                .map(base, len + adjust, prot, flags, fd, (file_offset - adjust as u64) as i64)
                .map_err(|err| {
                    error!(target: "loader", "mmap of image part at {:#x} failed: {}", base, err);
                    PalError::from_io(&err)
                })?;
            debug_assert_eq!(mapped, base);
            views.push(MappedView::owned(
                base,
                len + adjust,
                access_from_prot(prot),
                Some(tag),
                Some(mapping.clone()),
            ));
            Ok(())
        };
        let record_gap = |views: &mut Vec<MappedView>, start: usize, end: usize| {
            views.push(MappedView::owned(
                start,
                end - start,
                FileMapAccess::empty(),
                Some(tag),
                Some(mapping.clone()),
            ));
        };

        mmap_and_record(
            &mut *views,
            placement.loaded_header,
            placement.header_size,
            libc::PROT_READ,
            placement.read_only_flags,
            offset,
        )?;
        debug_assert!(headers.section_table_offset < headers.virtual_size);

        let mut prev_end_aligned = align_up(placement.loaded_header + placement.header_size, page_size)
            .ok_or(PalError::InvalidParameter)?;
        for (index, section) in headers.sections.iter().enumerate() {
            let raw_size = section.size_of_raw_data as usize;
            let section_base = placement
                .loaded_header
                .checked_add(section.virtual_address as usize)
                .ok_or(PalError::InvalidParameter)?;
            let section_end = section_base.checked_add(raw_size);
            let corrupt = match section_end {
                None => true,
                Some(end) => end > image_limit || prev_end_aligned > section_base,
            };
            if corrupt {
                error!(target: "loader", "section {} is corrupt", index);
                return Err(PalError::InvalidParameter);
            }
            if section.virtual_size as usize > raw_size {
                error!(target: "loader", "no support for zero-padded sections, section {}", index);
                return Err(PalError::InvalidParameter);
            }
            let file_offset = offset + section.pointer_to_raw_data as u64;
            if section_base & (page_size - 1) != file_offset as usize & (page_size - 1) {
                error!(
                    target: "loader",
                    "section {} data and virtual address have different page alignment",
                    index
                );
                return Err(PalError::InvalidParameter);
            }
            if raw_size == 0 {
                continue;
            }

            let section_base_aligned = align_down(section_base, page_size);
            if prev_end_aligned < section_base_aligned {
                record_gap(&mut *views, prev_end_aligned, section_base_aligned);
            }

            let prot = section_protection(section.characteristics);
            let flags = if prot & libc::PROT_WRITE != 0 {
                read_write_flags
            } else {
                placement.read_only_flags
            };
            mmap_and_record(&mut *views, section_base, raw_size, prot, flags, file_offset)?;
            trace!(
                target: "loader",
                "section {} {:?} mapped at {:#x} ({:#x} bytes)",
                index,
                section.name().unwrap_or("?"),
                section_base,
                raw_size
            );
            prev_end_aligned =
                align_up(section_base + raw_size, page_size).ok_or(PalError::InvalidParameter)?;
        }

        if prev_end_aligned < placement.image_end {
            record_gap(&mut *views, prev_end_aligned, placement.image_end);
        }
        Ok(())
    }

    /// Unmaps every view of the image `map_image` returned `loaded_header`
    /// for. Returns how many views were removed.
    pub fn unmap_image(&self, loaded_header: usize) -> Result<usize> {
        trace!(target: "loader", "unmap_image({:#x})", loaded_header);
        if loaded_header == 0 {
            return Err(PalError::InvalidParameter);
        }
        self.views.unmap_image_views(loaded_header)
    }

    pub fn mark_section_not_needed(&self, address: usize) -> Result<()> {
        trace!(target: "loader", "mark_section_not_needed({:#x})", address);
        self.views.mark_not_needed(address)
    }
}
