// File-mapping and view tests

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::Ordering;

use super::*;
use crate::config::SharedMappingPolicy;
use crate::map::view::desired_access_allowed;
use crate::map::mapping::ANONYMOUS_MAPPING_NAME;
use crate::map::MappingSource;
use crate::memory::native::parse_maps_line;
use sysdefs::constants::FileMapAccess;
use sysdefs::data::{MappingProtection, MemState, MemType, PageProtection};
use sysdefs::PalError;

fn file_with(contents: &[u8]) -> File {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(contents).unwrap();
    file
}

unsafe fn read_bytes(address: usize, len: usize) -> Vec<u8> {
    std::slice::from_raw_parts(address as *const u8, len).to_vec()
}

#[test]
fn test_anonymous_mapping_view_round_trip() {
    let _guard = test_setup();
    let pal = test_pal();
    let page = page_size();

    let handle = pal
        .create_file_mapping(MappingSource::Anonymous, MappingProtection::ReadWrite, 2 * page as u64, None)
        .unwrap();
    let (mapping, opened) = pal.mappings().lookup(handle).unwrap();
    assert!(mapping.is_anonymous());
    assert_eq!(mapping.raw_fd(), -1);
    assert_eq!(mapping.file_name(), std::path::Path::new(ANONYMOUS_MAPPING_NAME));
    assert_eq!(opened, FileMapAccess::ALL_ACCESS);
    drop(mapping);

    let address = pal.map_view(handle, FileMapAccess::ALL_ACCESS, 0, 0).unwrap();
    unsafe {
        std::ptr::write_volatile((address + page) as *mut u32, 0xabcd);
        assert_eq!(std::ptr::read_volatile((address + page) as *const u32), 0xabcd);
    }

    let info = pal.query(address + page + 3);
    assert_eq!(info.state, MemState::Committed);
    assert_eq!(info.kind, Some(MemType::Mapped));
    assert_eq!(info.protect, Some(PageProtection::ReadWrite));
    assert_eq!(info.base_address, address + page);
    assert_eq!(info.allocation_base, address);
    assert_eq!(info.region_size, page);

    pal.unmap_view(address).unwrap();
    assert_eq!(pal.unmap_view(address), Err(PalError::InvalidHandle));
    pal.close_handle(handle).unwrap();
    assert_eq!(pal.close_handle(handle), Err(PalError::InvalidHandle));
    assert!(pal.mappings().is_empty());
}

#[test]
fn test_create_mapping_rejections() {
    let _guard = test_setup();
    let pal = test_pal();

    assert_eq!(
        pal.create_file_mapping(MappingSource::Anonymous, MappingProtection::ReadWrite, 0, None),
        Err(PalError::InvalidParameter)
    );
    assert_eq!(
        pal.create_file_mapping(MappingSource::Anonymous, MappingProtection::ReadWrite, 4096, Some("shared")),
        Err(PalError::NotSupported)
    );

    let empty = tempfile::tempfile().unwrap();
    assert_eq!(
        pal.create_file_mapping(MappingSource::File(&empty), MappingProtection::ReadOnly, 0, None),
        Err(PalError::FileInvalid)
    );

    let small = file_with(b"abc");
    assert_eq!(
        pal.create_file_mapping(MappingSource::File(&small), MappingProtection::ReadOnly, 1 << 20, None),
        Err(PalError::NotEnoughMemory)
    );
    assert_eq!(small.metadata().unwrap().len(), 3);
    assert!(pal.mappings().is_empty());
}

#[test]
fn test_empty_name_is_unnamed() {
    let _guard = test_setup();
    let pal = test_pal();

    let handle = pal
        .create_file_mapping(MappingSource::Anonymous, MappingProtection::ReadWrite, 4096, Some(""))
        .unwrap();
    assert_eq!(pal.mappings().len(), 1);
    pal.close_handle(handle).unwrap();
}

#[test]
fn test_read_write_on_read_only_file_is_denied() {
    let _guard = test_setup();
    let pal = test_pal();
    let mut named = tempfile::NamedTempFile::new().unwrap();
    named.write_all(b"data").unwrap();
    let read_only = File::open(named.path()).unwrap();

    assert_eq!(
        pal.create_file_mapping(MappingSource::File(&read_only), MappingProtection::ReadWrite, 0, None),
        Err(PalError::AccessDenied)
    );
    let handle = pal
        .create_file_mapping(MappingSource::File(&read_only), MappingProtection::ReadOnly, 0, None)
        .unwrap();
    let address = pal.map_view(handle, FileMapAccess::READ, 0, 0).unwrap();
    assert_eq!(unsafe { read_bytes(address, 4) }, b"data");
    pal.unmap_view(address).unwrap();
    pal.close_handle(handle).unwrap();
}

/// Growing a read/write mapping extends the file; the caller keeps their
/// descriptor.
#[test]
fn test_file_mapping_grows_backing_file() {
    let _guard = test_setup();
    let pal = test_pal();
    let page = page_size();
    let mut file = file_with(b"header");

    let handle = pal
        .create_file_mapping(MappingSource::File(&file), MappingProtection::ReadWrite, 2 * page as u64, None)
        .unwrap();
    assert_eq!(file.metadata().unwrap().len(), 2 * page as u64);

    let address = pal.map_view(handle, FileMapAccess::WRITE, 0, 2 * page).unwrap();
    assert_eq!(unsafe { read_bytes(address, 6) }, b"header");
    unsafe { std::ptr::copy_nonoverlapping(b"HEADER".as_ptr(), address as *mut u8, 6) };
    pal.unmap_view(address).unwrap();
    pal.close_handle(handle).unwrap();

    let mut contents = [0u8; 6];
    file.seek(SeekFrom::Start(0)).unwrap();
    file.read_exact(&mut contents).unwrap();
    assert_eq!(&contents, b"HEADER");
}

#[test]
fn test_copy_view_writes_stay_private() {
    let _guard = test_setup();
    let pal = test_pal();
    let mut file = file_with(b"original");

    let handle = pal
        .create_file_mapping(MappingSource::File(&file), MappingProtection::WriteCopy, 0, None)
        .unwrap();
    let address = pal.map_view(handle, FileMapAccess::COPY, 0, 0).unwrap();
    unsafe { std::ptr::write_volatile(address as *mut u8, b'O') };
    assert_eq!(unsafe { read_bytes(address, 8) }, b"Original");
    assert_eq!(pal.query(address).protect, Some(PageProtection::WriteCopy));
    pal.unmap_view(address).unwrap();
    pal.close_handle(handle).unwrap();

    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.read_to_end(&mut contents).unwrap();
    assert_eq!(contents, b"original");
}

#[test]
fn test_view_access_must_fit_mapping_protection() {
    let _guard = test_setup();
    let pal = test_pal();
    let page = page_size() as u64;

    let read_only = pal
        .create_file_mapping(MappingSource::Anonymous, MappingProtection::ReadOnly, page, None)
        .unwrap();
    assert_eq!(
        pal.map_view(read_only, FileMapAccess::WRITE, 0, 0),
        Err(PalError::InvalidParameter)
    );
    assert_eq!(
        pal.map_view(read_only, FileMapAccess::ALL_ACCESS, 0, 0),
        Err(PalError::InvalidParameter)
    );

    let read_write = pal
        .create_file_mapping(MappingSource::Anonymous, MappingProtection::ReadWrite, page, None)
        .unwrap();
    assert_eq!(
        pal.map_view(read_write, FileMapAccess::COPY, 0, 0),
        Err(PalError::InvalidParameter)
    );
    assert_eq!(
        pal.map_view(read_write, FileMapAccess::COPY | FileMapAccess::READ, 0, 0),
        Err(PalError::InvalidParameter)
    );
    assert_eq!(
        pal.map_view(read_write, FileMapAccess::READ, 1, 0),
        Err(PalError::InvalidParameter)
    );
    assert!(pal.views().is_empty());
}

/// A handle opened with less access than the object allows limits its
/// views.
#[test]
fn test_duplicated_handle_limits_access() {
    let _guard = test_setup();
    let pal = test_pal();
    let page = page_size() as u64;

    let handle = pal
        .create_file_mapping(MappingSource::Anonymous, MappingProtection::ReadWrite, page, None)
        .unwrap();
    let reader = pal.duplicate_mapping_handle(handle, FileMapAccess::READ).unwrap();
    assert_ne!(reader, handle);

    assert_eq!(
        pal.map_view(reader, FileMapAccess::ALL_ACCESS, 0, 0),
        Err(PalError::AccessDenied)
    );
    assert_eq!(
        pal.map_view(reader, FileMapAccess::WRITE, 0, 0),
        Err(PalError::AccessDenied)
    );
    assert_eq!(
        pal.duplicate_mapping_handle(reader, FileMapAccess::ALL_ACCESS),
        Err(PalError::AccessDenied)
    );

    // The object outlives the handle it was created through.
    pal.close_handle(handle).unwrap();
    let address = pal.map_view(reader, FileMapAccess::READ, 0, 0).unwrap();
    pal.unmap_view(address).unwrap();
    pal.close_handle(reader).unwrap();
    assert_eq!(
        pal.duplicate_mapping_handle(reader, FileMapAccess::READ),
        Err(PalError::InvalidHandle)
    );
}

#[test]
fn test_desired_access_rules() {
    use FileMapAccess as A;
    use MappingProtection as P;

    assert_eq!(desired_access_allowed(P::ReadOnly, A::READ, A::READ), Ok(()));
    assert_eq!(desired_access_allowed(P::ReadOnly, A::COPY, A::READ), Err(PalError::InvalidParameter));
    assert_eq!(desired_access_allowed(P::WriteCopy, A::WRITE, A::COPY), Err(PalError::InvalidParameter));
    assert_eq!(desired_access_allowed(P::ReadWrite, A::COPY, A::ALL_ACCESS), Err(PalError::InvalidParameter));

    assert_eq!(desired_access_allowed(P::ReadWrite, A::READ, A::ALL_ACCESS), Ok(()));
    assert_eq!(desired_access_allowed(P::ReadWrite, A::READ, A::WRITE), Err(PalError::AccessDenied));
    assert_eq!(desired_access_allowed(P::ReadWrite, A::ALL_ACCESS, A::READ), Err(PalError::AccessDenied));
    assert_eq!(desired_access_allowed(P::ReadWrite, A::WRITE, A::WRITE), Ok(()));
    assert_eq!(desired_access_allowed(P::WriteCopy, A::COPY, A::COPY), Ok(()));
    assert_eq!(desired_access_allowed(P::WriteCopy, A::COPY, A::READ), Err(PalError::AccessDenied));
}

/// Temporary backing files disappear with the last reference, which may be
/// a view rather than the handle.
#[test]
fn test_temp_file_removed_with_last_reference() {
    let _guard = test_setup();
    let pal = test_pal();
    let page = page_size();

    let handle = pal
        .create_file_mapping(MappingSource::TempFile, MappingProtection::ReadWrite, page as u64, None)
        .unwrap();
    let path = {
        let (mapping, _) = pal.mappings().lookup(handle).unwrap();
        assert!(mapping.was_temp_file());
        assert_eq!(mapping.max_size(), page as u64);
        mapping.file_name().to_path_buf()
    };
    assert!(path.exists());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), page as u64);

    let address = pal.map_view(handle, FileMapAccess::ALL_ACCESS, 0, 0).unwrap();
    pal.close_handle(handle).unwrap();
    assert!(path.exists());

    pal.unmap_view(address).unwrap();
    assert!(!path.exists());
}

#[test]
fn test_mark_region_not_needed_drops_access() {
    let _guard = test_setup();
    let pal = test_pal();
    let page = page_size() as u64;
    let handle = pal
        .create_file_mapping(MappingSource::Anonymous, MappingProtection::ReadWrite, page, None)
        .unwrap();
    let address = pal.map_view(handle, FileMapAccess::ALL_ACCESS, 0, 0).unwrap();

    assert_eq!(pal.mark_region_not_needed(0), Err(PalError::InvalidParameter));
    pal.mark_region_not_needed(address + 16).unwrap();
    assert_eq!(pal.query(address).protect, Some(PageProtection::ReadWrite));

    pal.mark_region_not_needed(address).unwrap();
    assert_eq!(pal.query(address).protect, Some(PageProtection::NoAccess));

    pal.unmap_view(address).unwrap();
    pal.close_handle(handle).unwrap();
}

/// Under one-native-mapping-per-region, a view the OS refuses is served
/// from an existing shared mapping of the same file range.
#[test]
fn test_shared_region_reused_when_mmap_is_refused() {
    let _guard = test_setup();
    let native = FaultyMemory::new();
    let config = PalConfig {
        shared_mapping_policy: SharedMappingPolicy::OnePerFileRegion,
        ..PalConfig::without_executable_allocator()
    };
    let pal = Pal::with_native(config, native.clone());
    let page = page_size();

    let path = tempfile::NamedTempFile::new().unwrap();
    let file = OpenOptions::new().read(true).write(true).open(path.path()).unwrap();
    let handle = pal
        .create_file_mapping(MappingSource::File(&file), MappingProtection::ReadWrite, 2 * page as u64, None)
        .unwrap();

    let first = pal.map_view(handle, FileMapAccess::ALL_ACCESS, 0, 0).unwrap();
    native.fail_map.store(true, Ordering::SeqCst);
    let second = pal
        .map_view(handle, FileMapAccess::READ, page as u64, page)
        .unwrap();
    native.fail_map.store(false, Ordering::SeqCst);
    assert_eq!(second, first + page);
    assert_eq!(pal.views().len(), 2);

    let unmaps = native.unmaps.load(Ordering::SeqCst);
    pal.unmap_view(first).unwrap();
    assert_eq!(native.unmaps.load(Ordering::SeqCst), unmaps);
    unsafe { std::ptr::read_volatile(second as *const u8) };

    pal.unmap_view(second).unwrap();
    assert_eq!(native.unmaps.load(Ordering::SeqCst), unmaps + 1);
    pal.close_handle(handle).unwrap();
}

/// A writable view served from a read-only shared mapping widens the whole
/// native mapping, so the read-only sibling becomes writable as well.
#[test]
fn test_shared_region_protection_is_raised_for_writers() {
    let _guard = test_setup();
    let native = FaultyMemory::new();
    let config = PalConfig {
        shared_mapping_policy: SharedMappingPolicy::OnePerFileRegion,
        ..PalConfig::without_executable_allocator()
    };
    let pal = Pal::with_native(config, native.clone());
    let page = page_size();

    let path = tempfile::NamedTempFile::new().unwrap();
    let file = OpenOptions::new().read(true).write(true).open(path.path()).unwrap();
    let handle = pal
        .create_file_mapping(MappingSource::File(&file), MappingProtection::ReadWrite, page as u64, None)
        .unwrap();

    let reader = pal.map_view(handle, FileMapAccess::READ, 0, page).unwrap();
    {
        let views = pal.views().lock();
        let holder = views[0].shared_holder().unwrap();
        assert_eq!(holder.prot(), libc::PROT_READ);
    }

    native.fail_map.store(true, Ordering::SeqCst);
    let writer = pal.map_view(handle, FileMapAccess::WRITE, 0, page).unwrap();
    native.fail_map.store(false, Ordering::SeqCst);
    assert_eq!(writer, reader);

    {
        let views = pal.views().lock();
        assert_eq!(views.len(), 2);
        let first = views[0].shared_holder().unwrap();
        let second = views[1].shared_holder().unwrap();
        assert!(Arc::ptr_eq(first, second));
        assert_eq!(first.prot() & libc::PROT_WRITE, libc::PROT_WRITE);
    }

    unsafe {
        std::ptr::write_volatile(writer as *mut u8, 7);
        assert_eq!(std::ptr::read_volatile(reader as *const u8), 7);
    }

    pal.unmap_view(writer).unwrap();
    pal.unmap_view(reader).unwrap();
    pal.close_handle(handle).unwrap();
}

/// A view that borrows a sibling's mapping object releases the caller's own
/// reference once the call returns, even when it was the last one.
#[test]
fn test_shared_view_releases_callers_mapping_reference() {
    let _guard = test_setup();
    let native = FaultyMemory::new();
    let config = PalConfig {
        shared_mapping_policy: SharedMappingPolicy::OnePerFileRegion,
        ..PalConfig::without_executable_allocator()
    };
    let pal = Pal::with_native(config, native.clone());
    let page = page_size();

    let path = tempfile::NamedTempFile::new().unwrap();
    let file = OpenOptions::new().read(true).write(true).open(path.path()).unwrap();
    let first_handle = pal
        .create_file_mapping(MappingSource::File(&file), MappingProtection::ReadWrite, page as u64, None)
        .unwrap();
    let second_handle = pal
        .create_file_mapping(MappingSource::File(&file), MappingProtection::ReadWrite, page as u64, None)
        .unwrap();

    let first = pal.map_view(first_handle, FileMapAccess::READ, 0, page).unwrap();

    let (mapping, opened) = pal.mappings().lookup(second_handle).unwrap();
    pal.close_handle(second_handle).unwrap();
    let weak = Arc::downgrade(&mapping);

    native.fail_map.store(true, Ordering::SeqCst);
    let second = pal
        .views()
        .map_view(mapping, opened, FileMapAccess::READ, 0, page)
        .unwrap();
    native.fail_map.store(false, Ordering::SeqCst);
    assert_eq!(second, first);
    assert!(weak.upgrade().is_none());

    {
        let views = pal.views().lock();
        assert!(Arc::ptr_eq(
            views[0].mapping().unwrap(),
            views[1].mapping().unwrap()
        ));
    }

    pal.unmap_view(second).unwrap();
    pal.unmap_view(first).unwrap();
    pal.close_handle(first_handle).unwrap();
}

#[test]
fn test_independent_policy_fails_when_mmap_is_refused() {
    let _guard = test_setup();
    let native = FaultyMemory::new();
    let pal = Pal::with_native(PalConfig::without_executable_allocator(), native.clone());
    let file = file_with(&vec![1u8; page_size()]);
    let handle = pal
        .create_file_mapping(MappingSource::File(&file), MappingProtection::ReadOnly, 0, None)
        .unwrap();
    let first = pal.map_view(handle, FileMapAccess::READ, 0, 0).unwrap();

    native.fail_map.store(true, Ordering::SeqCst);
    assert_eq!(
        pal.map_view(handle, FileMapAccess::READ, 0, 0),
        Err(PalError::NotEnoughMemory)
    );
    native.fail_map.store(false, Ordering::SeqCst);

    pal.unmap_view(first).unwrap();
    pal.close_handle(handle).unwrap();
}

#[test]
fn test_parse_maps_line() {
    let line = "7f0000000000-7f0000004000 r-xp 00000000 08:01 1234    /usr/lib/libfoo.so";
    let info = parse_maps_line(line, 0x7f00_0000_1010, 0x1000).unwrap();
    assert_eq!(info.base_address, 0x7f00_0000_1000);
    assert_eq!(info.allocation_base, 0x7f00_0000_0000);
    assert_eq!(info.region_size, 0x3000);
    assert_eq!(info.protect, Some(PageProtection::ExecuteRead));
    assert_eq!(info.kind, Some(MemType::Mapped));

    let anon = "7f0000000000-7f0000004000 rw-p 00000000 00:00 0";
    assert_eq!(parse_maps_line(anon, 0x7f00_0000_0000, 0x1000).unwrap().kind, Some(MemType::Private));
    assert!(parse_maps_line(anon, 0x7f00_0000_4000, 0x1000).is_none());
}
