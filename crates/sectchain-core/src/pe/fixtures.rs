//! Synthetic PE32+ images for unit tests.
//!
//! Layout:
//!   0x0000  DOS header  (e_lfanew at 0x3C)
//!   0x0080  PE signature
//!   0x0084  COFF header (20 bytes)
//!   0x0098  Optional header PE32+ (112 bytes + 16 data directories = 240)
//!   0x0188  Section table
//!   ...     section raw data at the offsets each `SectionSpec` names
//!   ...     optional trailing bytes (overlay / certificate stand-in)

use super::parser::{DOS_MAGIC, MACHINE_AMD64, PE32PLUS_MAGIC, PE_SIGNATURE};

pub const PE_OFFSET: usize = 0x80;
pub const OPT_OFFSET: usize = PE_OFFSET + 4 + 20;
const OPT_HEADER_SIZE: u16 = 240;

pub fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub fn read_u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

#[derive(Debug, Clone)]
pub struct SectionSpec {
    pub name: &'static str,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_offset: u32,
    pub raw_size: u32,
}

impl SectionSpec {
    pub fn new(
        name: &'static str,
        virtual_address: u32,
        virtual_size: u32,
        raw_offset: u32,
        raw_size: u32,
    ) -> Self {
        SectionSpec {
            name,
            virtual_address,
            virtual_size,
            raw_offset,
            raw_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub entry_point: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_headers: u32,
    pub size_of_image: u32,
    pub sections: Vec<SectionSpec>,
    pub trailing: usize,
}

impl Default for ImageSpec {
    fn default() -> Self {
        ImageSpec {
            entry_point: 0x1010,
            image_base: 0x0000_0001_4000_0000,
            section_alignment: 0x1000,
            file_alignment: 0x200,
            size_of_headers: 0x400,
            size_of_image: 0x3000,
            sections: vec![SectionSpec::new(".text", 0x1000, 0x1E0, 0x400, 0x200)],
            trailing: 0,
        }
    }
}

pub fn build_image(spec: &ImageSpec) -> Vec<u8> {
    let raw_end = spec
        .sections
        .iter()
        .map(|s| (s.raw_offset + s.raw_size) as usize)
        .max()
        .unwrap_or(0)
        .max(spec.size_of_headers as usize);
    let mut buf = vec![0u8; raw_end + spec.trailing];

    put_u16(&mut buf, 0, DOS_MAGIC);
    put_u32(&mut buf, 0x3C, PE_OFFSET as u32);
    put_u32(&mut buf, PE_OFFSET, PE_SIGNATURE);

    let coff = PE_OFFSET + 4;
    put_u16(&mut buf, coff, MACHINE_AMD64);
    put_u16(&mut buf, coff + 2, spec.sections.len() as u16);
    put_u16(&mut buf, coff + 16, OPT_HEADER_SIZE);
    put_u16(&mut buf, coff + 18, 0x0022);

    put_u16(&mut buf, OPT_OFFSET, PE32PLUS_MAGIC);
    put_u32(&mut buf, OPT_OFFSET + 16, spec.entry_point);
    put_u64(&mut buf, OPT_OFFSET + 24, spec.image_base);
    put_u32(&mut buf, OPT_OFFSET + 32, spec.section_alignment);
    put_u32(&mut buf, OPT_OFFSET + 36, spec.file_alignment);
    put_u32(&mut buf, OPT_OFFSET + 56, spec.size_of_image);
    put_u32(&mut buf, OPT_OFFSET + 60, spec.size_of_headers);
    put_u16(&mut buf, OPT_OFFSET + 68, 10); // Subsystem: EFI application
    put_u32(&mut buf, OPT_OFFSET + 108, 16);

    let table = OPT_OFFSET + OPT_HEADER_SIZE as usize;
    for (i, s) in spec.sections.iter().enumerate() {
        let base = table + i * 40;
        buf[base..base + s.name.len()].copy_from_slice(s.name.as_bytes());
        put_u32(&mut buf, base + 8, s.virtual_size);
        put_u32(&mut buf, base + 12, s.virtual_address);
        put_u32(&mut buf, base + 16, s.raw_size);
        put_u32(&mut buf, base + 20, s.raw_offset);
        put_u32(&mut buf, base + 36, 0x6000_0020);
        if s.raw_size >= 2 {
            buf[s.raw_offset as usize] = 0xCC;
            buf[s.raw_offset as usize + 1] = 0xC3;
        }
    }

    for b in &mut buf[raw_end..] {
        *b = 0xEE;
    }
    buf
}
