// Shared helpers for palmem integration tests.
#![allow(dead_code)]

use std::fs::File;
use std::io::Write;

use palmem::memory::{LibcMemory, NativeMemory};
use palmem::{Pal, PalConfig};

pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;

const PE_POINTER: usize = 0x80;
const OPTIONAL_HEADER_SIZE: usize = 240;
const SECTION_TABLE: usize = PE_POINTER + 4 + 20 + OPTIONAL_HEADER_SIZE;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn page_size() -> usize {
    LibcMemory::new().page_size()
}

pub fn test_pal() -> Pal {
    Pal::new(PalConfig::without_executable_allocator())
}

#[derive(Clone, Debug)]
pub struct TestSection {
    pub name: &'static str,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_size: u32,
    pub raw_pointer: u32,
    pub characteristics: u32,
    pub fill: u8,
}

/// A minimal PE32+ image: DOS header, NT headers, section table and raw
/// section data, each section's bytes set to its `fill`.
#[derive(Clone, Debug)]
pub struct TestImage {
    pub magic: u16,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub sections: Vec<TestSection>,
}

impl TestImage {
    /// Header page, `.text` (R X), a one-page hole, `.data` (R W) and
    /// `.rdata` (R), all page aligned.
    pub fn standard(page: usize) -> Self {
        let page = page as u32;
        TestImage {
            magic: 0x20b,
            image_base: 0x1_4000_0000,
            section_alignment: page,
            file_alignment: page,
            size_of_image: 5 * page,
            size_of_headers: page,
            sections: vec![
                TestSection {
                    name: ".text",
                    virtual_address: page,
                    virtual_size: page,
                    raw_size: page,
                    raw_pointer: page,
                    characteristics: IMAGE_SCN_CNT_CODE
                        | sysdefs::constants::IMAGE_SCN_MEM_EXECUTE
                        | sysdefs::constants::IMAGE_SCN_MEM_READ,
                    fill: 0xc3,
                },
                TestSection {
                    name: ".data",
                    virtual_address: 3 * page,
                    virtual_size: page,
                    raw_size: page,
                    raw_pointer: 2 * page,
                    characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA
                        | sysdefs::constants::IMAGE_SCN_MEM_READ
                        | sysdefs::constants::IMAGE_SCN_MEM_WRITE,
                    fill: 0xda,
                },
                TestSection {
                    name: ".rdata",
                    virtual_address: 4 * page,
                    virtual_size: page,
                    raw_size: page,
                    raw_pointer: 3 * page,
                    characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA
                        | sysdefs::constants::IMAGE_SCN_MEM_READ,
                    fill: 0x5e,
                },
            ],
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let file_len = self
            .sections
            .iter()
            .map(|s| (s.raw_pointer + s.raw_size) as usize)
            .max()
            .unwrap_or(0)
            .max(self.size_of_headers as usize);
        let mut bytes = vec![0u8; file_len];

        bytes[0..2].copy_from_slice(b"MZ");
        put_u32(&mut bytes, 0x3c, PE_POINTER as u32);

        let nt = PE_POINTER;
        bytes[nt..nt + 4].copy_from_slice(b"PE\0\0");
        let coff = nt + 4;
        put_u16(&mut bytes, coff, 0x8664);
        put_u16(&mut bytes, coff + 2, self.sections.len() as u16);
        put_u16(&mut bytes, coff + 16, OPTIONAL_HEADER_SIZE as u16);
        put_u16(&mut bytes, coff + 18, 0x2022);

        let opt = coff + 20;
        put_u16(&mut bytes, opt, self.magic);
        put_u64(&mut bytes, opt + 24, self.image_base);
        put_u32(&mut bytes, opt + 32, self.section_alignment);
        put_u32(&mut bytes, opt + 36, self.file_alignment);
        put_u16(&mut bytes, opt + 48, 6);
        put_u32(&mut bytes, opt + 56, self.size_of_image);
        put_u32(&mut bytes, opt + 60, self.size_of_headers);
        put_u16(&mut bytes, opt + 68, 3);
        put_u32(&mut bytes, opt + 108, 16);

        for (index, section) in self.sections.iter().enumerate() {
            let entry = SECTION_TABLE + index * 40;
            let name = section.name.as_bytes();
            bytes[entry..entry + name.len()].copy_from_slice(name);
            put_u32(&mut bytes, entry + 8, section.virtual_size);
            put_u32(&mut bytes, entry + 12, section.virtual_address);
            put_u32(&mut bytes, entry + 16, section.raw_size);
            put_u32(&mut bytes, entry + 20, section.raw_pointer);
            put_u32(&mut bytes, entry + 36, section.characteristics);

            let start = section.raw_pointer as usize;
            let end = start + section.raw_size as usize;
            bytes[start..end].fill(section.fill);
        }
        bytes
    }

    /// Writes the image, after `prefix` bytes of padding, to a file under
    /// the target directory, where executable mappings are allowed.
    pub fn write_file(&self, prefix: usize) -> File {
        let mut file = tempfile::tempfile_in(env!("CARGO_TARGET_TMPDIR")).unwrap();
        file.write_all(&vec![0xeeu8; prefix]).unwrap();
        file.write_all(&self.to_bytes()).unwrap();
        file
    }
}

fn put_u16(bytes: &mut [u8], at: usize, value: u16) {
    bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
